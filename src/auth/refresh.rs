// Login and token refresh requests

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

use super::types::{CredentialPair, LoginData, LoginRequest, RefreshData, RefreshRequest};
use crate::error::{Result, SessionError};
use crate::models::envelope::server_message;
use crate::models::ApiEnvelope;

pub const LOGIN_PATH: &str = "/api/v1/auth/login";
pub const REFRESH_PATH: &str = "/api/v1/auth/refresh";

/// Join the configured base URL and an API path
pub fn endpoint_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// Read an auth response, mapping non-success status or `error: true` to `SessionError::Auth`
async fn read_auth_response<T: DeserializeOwned>(response: Response, fallback: &str) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;

    let envelope: ApiEnvelope<serde_json::Value> = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(status = %status, "Unparseable auth response: {}", e);
            return Err(SessionError::Auth(format!("{} ({})", fallback, status)));
        }
    };

    if !status.is_success() || envelope.error {
        let message = server_message(envelope.message, fallback);
        tracing::warn!(status = %status, "Auth request rejected: {}", message);
        return Err(SessionError::Auth(message));
    }

    let data = envelope
        .data
        .ok_or_else(|| SessionError::Auth(format!("{}: response contains no data", fallback)))?;

    serde_json::from_value(data)
        .map_err(|e| SessionError::Auth(format!("{}: malformed response data: {}", fallback, e)))
}

/// Exchange username and password for a credential pair and user record
pub async fn post_login(
    client: &Client,
    base_url: &str,
    username: &str,
    password: &str,
) -> Result<LoginData> {
    tracing::info!("Logging in as {}...", username);

    let response = client
        .post(endpoint_url(base_url, LOGIN_PATH))
        .json(&LoginRequest { username, password })
        .send()
        .await?;

    let data: LoginData = read_auth_response(response, "Login failed").await?;

    if data.access_token.is_empty() || data.refresh_token.is_empty() {
        return Err(SessionError::Auth(
            "Login response does not contain both tokens".to_string(),
        ));
    }

    Ok(data)
}

/// Exchange a refresh token for a new credential pair
pub async fn post_refresh(client: &Client, base_url: &str, refresh_token: &str) -> Result<CredentialPair> {
    tracing::debug!("Refreshing access token...");

    let response = client
        .post(endpoint_url(base_url, REFRESH_PATH))
        .json(&RefreshRequest { refresh_token })
        .send()
        .await?;

    let data: RefreshData = read_auth_response(response, "Token refresh failed").await?;

    if data.access_token.is_empty() || data.refresh_token.is_empty() {
        return Err(SessionError::Auth(
            "Refresh response does not contain both tokens".to_string(),
        ));
    }

    Ok(data.into())
}
