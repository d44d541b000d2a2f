// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::SessionUser;

/// Access/refresh token pair. Either both are held or the session is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Session state as observed by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated,
    /// Access token expired, refresh in flight; callers treat this as authenticated
    Refreshing,
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// `data` of a successful login response
#[derive(Deserialize)]
pub struct LoginData {
    pub access_token: String,
    pub refresh_token: String,
    pub user: SessionUser,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Refresh request body
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// `data` of a successful refresh response.
/// The backend also sends an empty user record here, which is ignored.
#[derive(Deserialize)]
pub struct RefreshData {
    pub access_token: String,
    pub refresh_token: String,
}

impl From<RefreshData> for CredentialPair {
    fn from(data: RefreshData) -> Self {
        Self {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
        }
    }
}
