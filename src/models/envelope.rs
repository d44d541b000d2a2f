use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Standard SAMS response body: `{error, message?, data?, pagination?}`
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u32,
}

impl<T: DeserializeOwned> ApiEnvelope<T> {
    /// Read a response body as an envelope.
    /// Non-success statuses and `error: true` bodies become `SessionError::Api`.
    pub async fn from_response(response: reqwest::Response) -> Result<Self> {
        let status = response.status();
        let body = response.text().await?;

        let envelope: Option<ApiEnvelope<T>> = serde_json::from_str(&body).ok();

        match envelope {
            Some(envelope) if status.is_success() && !envelope.error => Ok(envelope),
            Some(envelope) => Err(SessionError::Api {
                status: status.as_u16(),
                message: envelope
                    .message
                    .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string()),
            }),
            None if status.is_success() => Err(SessionError::Api {
                status: status.as_u16(),
                message: "Response is not a valid SAMS envelope".to_string(),
            }),
            None => Err(SessionError::Api {
                status: status.as_u16(),
                message: body,
            }),
        }
    }

    /// Take the payload, failing when the server sent none
    pub fn into_data(self) -> Result<T> {
        self.data.ok_or_else(|| SessionError::Api {
            status: 200,
            message: self
                .message
                .unwrap_or_else(|| "Response contains no data".to_string()),
        })
    }
}

/// Server message or a fallback, used for login/refresh failures
pub fn server_message(message: Option<String>, fallback: &str) -> String {
    message
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}
