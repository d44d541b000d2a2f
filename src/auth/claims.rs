// JWT claim decoding
// Claims are read only to decide local expiry; the server remains authoritative

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;

use crate::error::SessionError;

/// Decoded payload of an access or refresh token
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Claims {
    /// Expiry, seconds since epoch
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Decode the payload segment of a JWT without verifying the signature
pub fn decode_claims(token: &str) -> Result<Claims, SessionError> {
    let mut parts = token.splitn(3, '.');
    let payload = match (parts.next(), parts.next(), parts.next()) {
        (Some(_header), Some(payload), Some(_signature)) => payload,
        _ => {
            return Err(SessionError::Decode(
                "expected header.payload.signature".to_string(),
            ))
        }
    };

    // Some issuers keep base64 padding on the segments
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| SessionError::Decode(format!("payload is not base64url: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| SessionError::Decode(format!("payload is not valid JSON claims: {}", e)))
}

/// Check expiry against an explicit clock (seconds since epoch).
/// Undecodable tokens and tokens without `exp` count as expired.
pub fn is_expired_at(token: &str, now: i64) -> bool {
    match decode_claims(token) {
        Ok(Claims { exp: Some(exp), .. }) => exp <= now,
        Ok(_) => true,
        Err(e) => {
            tracing::debug!("Treating undecodable token as expired: {}", e);
            true
        }
    }
}

/// Check whether a token is expired right now
pub fn is_expired(token: &str) -> bool {
    is_expired_at(token, Utc::now().timestamp())
}
