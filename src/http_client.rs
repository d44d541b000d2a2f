use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::auth::{endpoint_url, is_expired, SessionManager};
use crate::config::AuthFailurePolicy;
use crate::error::{error_kind, Result, SessionError};
use crate::models::envelope::server_message;

pub const AI_QUERY_PATH: &str = "/api/v1/ai/query";

/// Caller-supplied parts of a request
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Merged over the default headers; these win on conflict
    pub headers: HeaderMap,
    pub body: Option<String>,
}

impl RequestOptions {
    /// Options carrying `body` serialized as JSON
    pub fn json<T: Serialize + ?Sized>(body: &T) -> Result<Self> {
        let body = serde_json::to_string(body).context("Failed to serialize request body")?;
        Ok(Self {
            headers: HeaderMap::new(),
            body: Some(body),
        })
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

#[derive(Serialize)]
struct AiQueryRequest<'a> {
    message: &'a str,
}

#[derive(Deserialize)]
struct AiQueryResponse {
    response: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// HTTP client for the SAMS API
/// Attaches the session's access token and recovers once from an expired token:
/// - expired token before sending: refresh first
/// - 401: refresh and re-issue the request exactly once
pub struct SamsHttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Session manager owning the credentials
    session: SessionManager,

    /// What to do when the session cannot be recovered
    policy: AuthFailurePolicy,
}

impl SamsHttpClient {
    /// Create a new HTTP client
    pub fn new(
        session: SessionManager,
        policy: AuthFailurePolicy,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            session,
            policy,
        })
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn policy(&self) -> AuthFailurePolicy {
        self.policy
    }

    /// Send an authenticated request.
    /// The response is returned as received; only a 401 is acted upon.
    pub async fn send(&self, method: Method, url: &str, options: RequestOptions) -> Result<Response> {
        let epoch = self.session.epoch();
        let mut token = self.session.access_token();

        if token.as_deref().is_some_and(is_expired) {
            tracing::info!("Access token expired, refreshing before request");
            if !self.recover(epoch).await {
                return Err(self.auth_failure(epoch, "token refresh failed"));
            }
            token = self.session.access_token();
        }

        let response = self.execute(&method, url, &options, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let current = self.session.access_token();
        if current.is_some() && current != token {
            tracing::debug!(url = %url, "Received 401, token already replaced, retrying...");
        } else {
            tracing::warn!(url = %url, "Received 401, refreshing token and retrying...");
            if !self.recover(epoch).await {
                return Err(self.auth_failure(epoch, "token refresh failed after 401"));
            }
        }

        let token = self.session.access_token();
        self.execute(&method, url, &options, token.as_deref()).await
    }

    /// Refresh the session this request started in.
    /// A login that lands while the refresh is in flight supersedes it; its tokens are used instead.
    async fn recover(&self, epoch: u64) -> bool {
        if self.session.refresh().await {
            return true;
        }

        if self.session.epoch() != epoch && self.session.access_token().is_some() {
            tracing::info!("Session replaced while refreshing, using the new credentials");
            return true;
        }
        false
    }

    /// Evict the session according to the configured policy.
    /// A session that replaced the one the request started in is kept.
    fn auth_failure(&self, epoch: u64, reason: &str) -> SessionError {
        tracing::error!("Session could not be recovered: {}", reason);
        match self.policy {
            AuthFailurePolicy::Throw => self.session.clear_session_at(epoch),
            AuthFailurePolicy::Redirect => self.session.logout_at(epoch),
        };
        SessionError::Authentication(reason.to_string())
    }

    async fn execute(
        &self,
        method: &Method,
        url: &str,
        options: &RequestOptions,
        token: Option<&str>,
    ) -> Result<Response> {
        let headers = build_headers(token, &options.headers)?;

        tracing::debug!(method = %method, url = %url, "Sending HTTP request");

        let mut builder = self.client.request(method.clone(), url).headers(headers);
        if let Some(body) = &options.body {
            builder = builder.body(body.clone());
        }

        match builder.send().await {
            Ok(response) => {
                tracing::debug!(status = %response.status(), "Received HTTP response");
                Ok(response)
            }
            Err(e) => {
                tracing::warn!(
                    error_kind = error_kind(&e),
                    error = %e,
                    url = %url,
                    "HTTP request error"
                );
                Err(e.into())
            }
        }
    }

    fn url(&self, endpoint: &str) -> String {
        endpoint_url(self.session.base_url(), endpoint)
    }

    pub async fn get(&self, endpoint: &str) -> Result<Response> {
        self.send(Method::GET, &self.url(endpoint), RequestOptions::default())
            .await
    }

    pub async fn post<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<Response> {
        self.send(Method::POST, &self.url(endpoint), RequestOptions::json(body)?)
            .await
    }

    pub async fn put<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<Response> {
        self.send(Method::PUT, &self.url(endpoint), RequestOptions::json(body)?)
            .await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<Response> {
        self.send(Method::DELETE, &self.url(endpoint), RequestOptions::default())
            .await
    }

    /// Ask the AI assistant a free-text question
    pub async fn ai_query(&self, message: &str) -> Result<String> {
        let response = self.post(AI_QUERY_PATH, &AiQueryRequest { message }).await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(|b| b.message);
            return Err(SessionError::Api {
                status: status.as_u16(),
                message: server_message(message, "AI query failed"),
            });
        }

        let parsed: AiQueryResponse = serde_json::from_str(&body).map_err(|e| SessionError::Api {
            status: status.as_u16(),
            message: format!("Unexpected AI response: {}", e),
        })?;
        Ok(parsed.response)
    }
}

/// Default JSON content type and bearer token, overridden by caller headers
fn build_headers(token: Option<&str>, caller: &HeaderMap) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
            SessionError::Decode("access token is not a valid header value".to_string())
        })?;
        headers.insert(AUTHORIZATION, value);
    }

    for name in caller.keys() {
        headers.remove(name);
    }
    for (name, value) in caller {
        headers.append(name.clone(), value.clone());
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, SESSION_KEYS};
    use crate::auth::{MemoryStore, SessionStore, REFRESH_PATH};
    use crate::auth::claims::test_tokens::token_expiring_in;
    use crate::navigation::{Navigator, View};
    use mockito::Matcher;
    use serde_json::json;
    use std::sync::Arc;

    struct Harness {
        server: mockito::ServerGuard,
        store: Arc<MemoryStore>,
        client: SamsHttpClient,
    }

    async fn harness(access: Option<&str>, refresh: Option<&str>, policy: AuthFailurePolicy) -> Harness {
        let server = mockito::Server::new_async().await;
        let store = Arc::new(MemoryStore::new());
        if let Some(access) = access {
            store.set_all(&[(ACCESS_TOKEN_KEY, access)]).unwrap();
        }
        if let Some(refresh) = refresh {
            store.set_all(&[(REFRESH_TOKEN_KEY, refresh)]).unwrap();
        }

        let session = SessionManager::new(
            server.url(),
            store.clone(),
            Navigator::new(View::from_path("/assets")),
            Duration::from_secs(5),
        )
        .unwrap();
        let client = SamsHttpClient::new(
            session,
            policy,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap();

        Harness {
            server,
            store,
            client,
        }
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {}", token)
    }

    fn refresh_body(access: &str, refresh: &str) -> String {
        json!({"error": false, "data": {"access_token": access, "refresh_token": refresh}})
            .to_string()
    }

    #[test]
    fn test_build_headers_defaults() {
        let headers = build_headers(Some("abc"), &HeaderMap::new()).unwrap();
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(headers[AUTHORIZATION], "Bearer abc");

        let headers = build_headers(None, &HeaderMap::new()).unwrap();
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_build_headers_caller_wins() {
        let mut caller = HeaderMap::new();
        caller.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        caller.insert("x-request-id", HeaderValue::from_static("42"));

        let headers = build_headers(Some("abc"), &caller).unwrap();
        assert_eq!(headers[CONTENT_TYPE], "text/plain");
        assert_eq!(headers.get_all(CONTENT_TYPE).iter().count(), 1);
        assert_eq!(headers["x-request-id"], "42");
        assert_eq!(headers[AUTHORIZATION], "Bearer abc");
    }

    #[test]
    fn test_build_headers_rejects_bad_token() {
        assert!(build_headers(Some("bad\ntoken"), &HeaderMap::new()).is_err());
    }

    #[tokio::test]
    async fn test_valid_token_single_request() {
        let access = token_expiring_in(3600);
        let mut h = harness(Some(&access), Some(&token_expiring_in(86400)), AuthFailurePolicy::Throw).await;

        let refresh = h.server.mock("POST", REFRESH_PATH).expect(0).create_async().await;
        let assets = h
            .server
            .mock("GET", "/api/v1/assets")
            .match_header("authorization", bearer(&access).as_str())
            .match_header("content-type", "application/json")
            .with_status(200)
            .with_body(json!({"error": false, "data": []}).to_string())
            .expect(1)
            .create_async()
            .await;

        let response = h.client.get("/api/v1/assets").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assets.assert_async().await;
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_first() {
        let fresh = token_expiring_in(3600);
        let mut h = harness(
            Some(&token_expiring_in(-30)),
            Some(&token_expiring_in(86400)),
            AuthFailurePolicy::Throw,
        )
        .await;

        let refresh = h
            .server
            .mock("POST", REFRESH_PATH)
            .with_status(200)
            .with_body(refresh_body(&fresh, "R2"))
            .expect(1)
            .create_async()
            .await;
        let categories = h
            .server
            .mock("GET", "/api/v1/categories")
            .match_header("authorization", bearer(&fresh).as_str())
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let response = h.client.get("/api/v1/categories").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        refresh.assert_async().await;
        categories.assert_async().await;
        assert_eq!(h.client.session().access_token(), Some(fresh));
    }

    #[tokio::test]
    async fn test_401_retries_exactly_once() {
        let old = token_expiring_in(3600);
        let new = token_expiring_in(7200);
        let mut h = harness(Some(&old), Some(&token_expiring_in(86400)), AuthFailurePolicy::Throw).await;

        let first = h
            .server
            .mock("GET", "/api/v1/users")
            .match_header("authorization", bearer(&old).as_str())
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let refresh = h
            .server
            .mock("POST", REFRESH_PATH)
            .with_status(200)
            .with_body(refresh_body(&new, "R2"))
            .expect(1)
            .create_async()
            .await;
        let retry = h
            .server
            .mock("GET", "/api/v1/users")
            .match_header("authorization", bearer(&new).as_str())
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        // The retry's 401 is handed back as-is
        let response = h.client.get("/api/v1/users").await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        first.assert_async().await;
        refresh.assert_async().await;
        retry.assert_async().await;
        assert_eq!(h.client.session().access_token(), Some(new));
    }

    #[tokio::test]
    async fn test_401_retry_resends_body() {
        let old = token_expiring_in(3600);
        let new = token_expiring_in(7200);
        let mut h = harness(Some(&old), Some(&token_expiring_in(86400)), AuthFailurePolicy::Throw).await;

        let body = json!({"name": "Laptops", "description": "Portable computers"});
        let _first = h
            .server
            .mock("POST", "/api/v1/categories")
            .match_header("authorization", bearer(&old).as_str())
            .with_status(401)
            .create_async()
            .await;
        let _refresh = h
            .server
            .mock("POST", REFRESH_PATH)
            .with_status(200)
            .with_body(refresh_body(&new, "R2"))
            .create_async()
            .await;
        let retry = h
            .server
            .mock("POST", "/api/v1/categories")
            .match_header("authorization", bearer(&new).as_str())
            .match_body(Matcher::Json(body.clone()))
            .with_status(201)
            .expect(1)
            .create_async()
            .await;

        let response = h.client.post("/api/v1/categories", &body).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        retry.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_failure_throw_policy_clears_without_redirect() {
        let mut h = harness(
            Some(&token_expiring_in(-30)),
            Some(&token_expiring_in(86400)),
            AuthFailurePolicy::Throw,
        )
        .await;

        let _refresh = h
            .server
            .mock("POST", REFRESH_PATH)
            .with_status(401)
            .with_body(json!({"error": true, "message": "Invalid refresh token"}).to_string())
            .create_async()
            .await;
        let request = h.server.mock("GET", "/api/v1/assets").expect(0).create_async().await;

        let err = h.client.get("/api/v1/assets").await.unwrap_err();
        assert!(err.is_session_lost());
        request.assert_async().await;

        for key in SESSION_KEYS {
            assert!(h.store.get(key).unwrap().is_none());
        }
        assert!(!h.client.session().navigator().is_on_login());
    }

    #[tokio::test]
    async fn test_401_refresh_failure_redirect_policy() {
        let access = token_expiring_in(3600);
        let mut h = harness(Some(&access), Some(&token_expiring_in(86400)), AuthFailurePolicy::Redirect).await;

        let _first = h
            .server
            .mock("GET", "/api/v1/departments")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let _refresh = h
            .server
            .mock("POST", REFRESH_PATH)
            .with_status(500)
            .with_body(json!({"error": true, "message": "Failed to generate token"}).to_string())
            .create_async()
            .await;

        let err = h.client.get("/api/v1/departments").await.unwrap_err();
        assert!(matches!(err, SessionError::Authentication(_)));
        assert!(h.store.snapshot().is_empty());
        assert!(h.client.session().navigator().is_on_login());
    }

    #[tokio::test]
    async fn test_no_token_sends_without_authorization() {
        let mut h = harness(None, None, AuthFailurePolicy::Throw).await;

        let health = h
            .server
            .mock("GET", "/health")
            .match_header("authorization", Matcher::Missing)
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let response = h.client.get("/health").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        health.assert_async().await;
    }

    #[tokio::test]
    async fn test_caller_headers_take_precedence() {
        let access = token_expiring_in(3600);
        let mut h = harness(Some(&access), Some(&token_expiring_in(86400)), AuthFailurePolicy::Throw).await;

        let mock = h
            .server
            .mock("PUT", "/api/v1/assets/7")
            .match_header("content-type", "text/plain")
            .match_header("authorization", bearer(&access).as_str())
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let url = format!("{}/api/v1/assets/7", h.server.url());
        let options = RequestOptions {
            body: Some("raw".to_string()),
            ..Default::default()
        }
        .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let response = h.client.send(Method::PUT, &url, options).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_auth_errors_pass_through() {
        let access = token_expiring_in(3600);
        let mut h = harness(Some(&access), Some(&token_expiring_in(86400)), AuthFailurePolicy::Throw).await;

        let refresh = h.server.mock("POST", REFRESH_PATH).expect(0).create_async().await;
        let _mock = h
            .server
            .mock("DELETE", "/api/v1/categories/3")
            .with_status(403)
            .with_body(json!({"error": true, "message": "Forbidden"}).to_string())
            .create_async()
            .await;

        let response = h.client.delete("/api/v1/categories/3").await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        refresh.assert_async().await;
        assert_eq!(h.client.session().access_token(), Some(access));
    }

    #[tokio::test]
    async fn test_network_error_keeps_session() {
        let access = token_expiring_in(3600);
        let h = harness(Some(&access), Some(&token_expiring_in(86400)), AuthFailurePolicy::Redirect).await;

        let err = h
            .client
            .send(Method::GET, "http://127.0.0.1:1/api/v1/assets", RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Network { .. }));
        assert_eq!(h.client.session().access_token(), Some(access));
        assert!(!h.client.session().navigator().is_on_login());
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let old = token_expiring_in(3600);
        let new = token_expiring_in(7200);
        let mut h = harness(Some(&old), Some(&token_expiring_in(86400)), AuthFailurePolicy::Throw).await;

        // Server revoked the old token before it expired
        let stale = h
            .server
            .mock("GET", Matcher::Regex(r"^/api/v1/(assets|categories)$".to_string()))
            .match_header("authorization", bearer(&old).as_str())
            .with_status(401)
            .expect(2)
            .create_async()
            .await;
        let refresh = h
            .server
            .mock("POST", REFRESH_PATH)
            .with_status(200)
            .with_body(refresh_body(&new, "R2"))
            .expect(1)
            .create_async()
            .await;
        let fresh = h
            .server
            .mock("GET", Matcher::Regex(r"^/api/v1/(assets|categories)$".to_string()))
            .match_header("authorization", bearer(&new).as_str())
            .with_status(200)
            .with_body(json!({"error": false, "data": []}).to_string())
            .expect(2)
            .create_async()
            .await;

        let (a, b) = tokio::join!(h.client.get("/api/v1/assets"), h.client.get("/api/v1/categories"));
        assert_eq!(a.unwrap().status(), StatusCode::OK);
        assert_eq!(b.unwrap().status(), StatusCode::OK);

        stale.assert_async().await;
        refresh.assert_async().await;
        fresh.assert_async().await;
        assert_eq!(h.store.snapshot()[ACCESS_TOKEN_KEY], new);
    }

    #[tokio::test]
    async fn test_401_after_token_replaced_retries_without_refresh() {
        let old = token_expiring_in(3600);
        let new = token_expiring_in(7200);
        let mut h = harness(Some(&old), Some(&token_expiring_in(86400)), AuthFailurePolicy::Throw).await;

        let refresh = h
            .server
            .mock("POST", REFRESH_PATH)
            .expect(0)
            .create_async()
            .await;
        let fresh = h
            .server
            .mock("GET", "/api/v1/assets")
            .match_header("authorization", bearer(&new).as_str())
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        // Another request refreshed while this one was on the wire
        let url = format!("{}/api/v1/assets", h.server.url());
        let store = h.store.clone();
        let new_token = new.clone();
        let replaced = h
            .server
            .mock("GET", "/api/v1/assets")
            .match_header("authorization", bearer(&old).as_str())
            .with_status(401)
            .with_body_from_request(move |_| {
                store
                    .set_all(&[(ACCESS_TOKEN_KEY, new_token.as_str())])
                    .unwrap();
                Vec::new()
            })
            .expect(1)
            .create_async()
            .await;

        let response = h.client.send(Method::GET, &url, RequestOptions::default()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        replaced.assert_async().await;
        fresh.assert_async().await;
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_ai_query() {
        let access = token_expiring_in(3600);
        let mut h = harness(Some(&access), Some(&token_expiring_in(86400)), AuthFailurePolicy::Throw).await;

        let mock = h
            .server
            .mock("POST", AI_QUERY_PATH)
            .match_body(Matcher::Json(json!({"message": "How many laptops are in use?"})))
            .with_status(200)
            .with_body(json!({"response": "There are 12 laptops in use."}).to_string())
            .expect(1)
            .create_async()
            .await;

        let answer = h.client.ai_query("How many laptops are in use?").await.unwrap();
        assert_eq!(answer, "There are 12 laptops in use.");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_ai_query_error_message() {
        let access = token_expiring_in(3600);
        let mut h = harness(Some(&access), Some(&token_expiring_in(86400)), AuthFailurePolicy::Throw).await;

        let _mock = h
            .server
            .mock("POST", AI_QUERY_PATH)
            .with_status(500)
            .with_body(json!({"error": true, "message": "AI service unavailable"}).to_string())
            .create_async()
            .await;

        let err = h.client.ai_query("hello").await.unwrap_err();
        assert!(matches!(err, SessionError::Api { status: 500, ref message } if message == "AI service unavailable"));
    }
}
