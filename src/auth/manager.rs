use anyhow::Context;
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::claims::is_expired;
use super::refresh;
use super::store::{lock, SessionStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, SESSION_KEYS, USER_KEY};
use super::types::{CredentialPair, SessionState};
use crate::error::Result;
use crate::models::SessionUser;
use crate::navigation::{Navigator, View};

type RefreshAttempt = Shared<BoxFuture<'static, bool>>;

/// Session manager
/// Owns the credential pair and session user, refreshes silently and evicts the
/// session on unrecoverable failure. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    /// Persistent key-value storage for tokens and user
    store: Arc<dyn SessionStore>,

    /// Current view, switched to login on forced logout
    navigator: Navigator,

    /// HTTP client for login and refresh requests
    client: Client,

    /// Backend origin, e.g. http://localhost:8080
    base_url: String,

    /// Epoch and cached user. Every store write happens under this lock.
    session: Mutex<SessionSlot>,

    /// Outstanding refresh, shared by every concurrent caller
    inflight: tokio::sync::Mutex<Option<RefreshAttempt>>,

    refreshing: AtomicBool,
}

struct SessionSlot {
    /// Bumped by every login and logout; refresh results from an older epoch are discarded
    epoch: u64,
    user: Option<SessionUser>,
}

impl SessionManager {
    /// Create a session manager and restore any session found in `store`
    pub fn new(
        base_url: impl Into<String>,
        store: Arc<dyn SessionStore>,
        navigator: Navigator,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let manager = Self {
            inner: Arc::new(Inner {
                store,
                navigator,
                client,
                base_url: base_url.into(),
                session: Mutex::new(SessionSlot {
                    epoch: 0,
                    user: None,
                }),
                inflight: tokio::sync::Mutex::new(None),
                refreshing: AtomicBool::new(false),
            }),
        };

        manager.restore();
        Ok(manager)
    }

    /// Create a SessionManager backed by an in-memory store, positioned on a non-login view
    #[cfg(any(test, feature = "test-utils"))]
    pub fn new_for_testing(base_url: &str) -> Result<Self> {
        use super::store::MemoryStore;

        Self::new(
            base_url,
            Arc::new(MemoryStore::new()),
            Navigator::new(View::from_path("/assets")),
            Duration::from_secs(5),
        )
    }

    /// Load the cached user for a stored session.
    /// Corrupted user data ends the session.
    fn restore(&self) {
        if self.credentials().is_none() {
            if SESSION_KEYS.iter().any(|key| self.stored(key).is_some()) {
                tracing::debug!("Discarding incomplete stored session");
                self.clear_session();
            }
            return;
        }

        let Some(user_json) = self.stored(USER_KEY) else {
            tracing::debug!("Restored session without cached user");
            return;
        };

        match serde_json::from_str::<SessionUser>(&user_json) {
            Ok(user) => {
                tracing::info!("Restored session for {}", user.username);
                lock(&self.inner.session).user = Some(user);
            }
            Err(e) => {
                tracing::error!("Failed to parse stored user data: {}", e);
                self.logout();
            }
        }
    }

    /// Read one key, treating storage errors as absence
    fn stored(&self, key: &str) -> Option<String> {
        match self.inner.store.get(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                tracing::error!("Failed to read {} from session storage: {}", key, e);
                None
            }
        }
    }

    /// Stored credential pair, if both tokens are present
    pub fn credentials(&self) -> Option<CredentialPair> {
        Some(CredentialPair {
            access_token: self.stored(ACCESS_TOKEN_KEY)?,
            refresh_token: self.stored(REFRESH_TOKEN_KEY)?,
        })
    }

    pub fn access_token(&self) -> Option<String> {
        self.stored(ACCESS_TOKEN_KEY)
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn navigator(&self) -> &Navigator {
        &self.inner.navigator
    }

    pub fn current_user(&self) -> Option<SessionUser> {
        lock(&self.inner.session).user.clone()
    }

    /// True if the current user holds one of `roles`
    pub fn has_role(&self, roles: &[&str]) -> bool {
        match lock(&self.inner.session).user.as_ref() {
            Some(user) => roles.contains(&user.role.as_str()),
            None => false,
        }
    }

    pub fn state(&self) -> SessionState {
        let Some(pair) = self.credentials() else {
            return SessionState::Anonymous;
        };

        if self.inner.refreshing.load(Ordering::SeqCst) {
            return SessionState::Refreshing;
        }

        match pair {
            pair if !is_expired(&pair.access_token) => SessionState::Authenticated,
            pair if !is_expired(&pair.refresh_token) => SessionState::Refreshing,
            _ => SessionState::Anonymous,
        }
    }

    /// Optimistic: a session whose refresh is pending still counts as authenticated
    pub fn is_authenticated(&self) -> bool {
        self.state() != SessionState::Anonymous
    }

    /// Log in and store the new session. Nothing is stored on failure.
    pub async fn login(&self, username: &str, password: &str) -> Result<SessionUser> {
        let data =
            refresh::post_login(&self.inner.client, &self.inner.base_url, username, password).await?;

        let user_json =
            serde_json::to_string(&data.user).context("Failed to serialize session user")?;

        {
            let mut slot = lock(&self.inner.session);
            self.inner.store.set_all(&[
                (ACCESS_TOKEN_KEY, data.access_token.as_str()),
                (REFRESH_TOKEN_KEY, data.refresh_token.as_str()),
                (USER_KEY, user_json.as_str()),
            ])?;
            slot.epoch += 1;
            slot.user = Some(data.user.clone());
        }

        match data.expires_at {
            Some(expires_at) => tracing::info!(
                "✅ Logged in as {} ({}), session expires: {}",
                data.user.username,
                data.user.role,
                expires_at.to_rfc3339()
            ),
            None => tracing::info!("✅ Logged in as {} ({})", data.user.username, data.user.role),
        }

        Ok(data.user)
    }

    /// Refresh the credential pair.
    /// At most one refresh request is outstanding; concurrent callers share its outcome.
    /// Never clears the session, the caller decides what a failure means.
    pub async fn refresh(&self) -> bool {
        let attempt = {
            let mut inflight = self.inner.inflight.lock().await;
            match inflight.as_ref() {
                Some(attempt) => {
                    tracing::debug!("Joining in-flight token refresh");
                    attempt.clone()
                }
                None => {
                    let this = self.clone();
                    let attempt = async move { this.run_refresh().await }.boxed().shared();
                    *inflight = Some(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    async fn run_refresh(&self) -> bool {
        self.inner.refreshing.store(true, Ordering::SeqCst);
        let refreshed = self.refresh_once().await;
        self.inner.refreshing.store(false, Ordering::SeqCst);

        *self.inner.inflight.lock().await = None;
        refreshed
    }

    async fn refresh_once(&self) -> bool {
        let epoch = lock(&self.inner.session).epoch;

        let Some(refresh_token) = self.stored(REFRESH_TOKEN_KEY) else {
            tracing::debug!("No refresh token available, skipping refresh");
            return false;
        };

        let pair = match refresh::post_refresh(
            &self.inner.client,
            &self.inner.base_url,
            &refresh_token,
        )
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("Token refresh failed: {}", e);
                return false;
            }
        };

        match self.commit_refresh(epoch, &pair) {
            Ok(true) => {
                tracing::info!("Token refreshed");
                true
            }
            Ok(false) => {
                tracing::warn!("Session ended while refreshing, discarding new tokens");
                false
            }
            Err(e) => {
                tracing::error!("Failed to store refreshed tokens: {}", e);
                false
            }
        }
    }

    /// Store a refreshed pair unless the session it belongs to has ended
    fn commit_refresh(&self, epoch: u64, pair: &CredentialPair) -> Result<bool> {
        let slot = lock(&self.inner.session);
        if slot.epoch != epoch {
            return Ok(false);
        }

        self.inner.store.set_all(&[
            (ACCESS_TOKEN_KEY, pair.access_token.as_str()),
            (REFRESH_TOKEN_KEY, pair.refresh_token.as_str()),
        ])?;
        Ok(true)
    }

    /// Synchronous session check for guards.
    ///
    /// An expired access token with a live refresh token starts a background refresh and
    /// reports the session as valid in the meantime. When both tokens are expired, or only
    /// one of them is stored, the session is logged out.
    pub fn validate(&self) -> bool {
        let access = self.stored(ACCESS_TOKEN_KEY);
        let refresh = self.stored(REFRESH_TOKEN_KEY);

        let (access, refresh) = match (access, refresh) {
            (Some(access), Some(refresh)) => (access, refresh),
            (None, None) => return false,
            _ => {
                tracing::warn!("Incomplete credential pair, logging out");
                self.logout();
                return false;
            }
        };

        if !is_expired(&access) {
            return true;
        }

        if !is_expired(&refresh) {
            tracing::debug!("Access token expired, refreshing in background");
            self.spawn_silent_refresh(self.epoch());
            return true;
        }

        tracing::info!("Access and refresh tokens expired, logging out");
        self.logout();
        false
    }

    /// Refresh in the background, logging out if it fails.
    /// A session started while the refresh was in flight is left alone.
    fn spawn_silent_refresh(&self, epoch: u64) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let this = self.clone();
                handle.spawn(async move {
                    if !this.refresh().await && this.logout_at(epoch) {
                        tracing::warn!("Silent token refresh failed, logged out");
                    }
                });
            }
            Err(_) => tracing::warn!("No async runtime available for silent token refresh"),
        }
    }

    /// Switch to `view` after re-validating the session.
    /// A session that fails validation ends on the login view instead.
    pub fn navigate(&self, view: View) -> bool {
        if view == View::Login {
            self.inner.navigator.navigate(view);
            return true;
        }

        if !self.validate() {
            self.inner.navigator.redirect_to_login();
            return false;
        }

        self.inner.navigator.navigate(view);
        true
    }

    /// Clear tokens and user, then redirect to login unless already there
    pub fn logout(&self) {
        self.clear_session();
        self.inner.navigator.redirect_to_login();
    }

    /// Current session epoch, bumped by every login, logout and clear
    pub fn epoch(&self) -> u64 {
        lock(&self.inner.session).epoch
    }

    /// Log out only if no login or logout happened since `epoch`.
    /// Returns true when the session was ended.
    pub fn logout_at(&self, epoch: u64) -> bool {
        if !self.clear_session_at(epoch) {
            return false;
        }
        self.inner.navigator.redirect_to_login();
        true
    }

    /// Clear the session only if it is still the one observed at `epoch`
    pub fn clear_session_at(&self, epoch: u64) -> bool {
        let mut slot = lock(&self.inner.session);
        if slot.epoch != epoch {
            tracing::debug!("Session changed since epoch {}, not clearing", epoch);
            return false;
        }
        self.clear_locked(&mut slot);
        true
    }

    /// Clear tokens and user without navigating
    pub fn clear_session(&self) {
        let mut slot = lock(&self.inner.session);
        self.clear_locked(&mut slot);
    }

    fn clear_locked(&self, slot: &mut SessionSlot) {
        slot.epoch += 1;
        let had_user = slot.user.take().is_some();

        if let Err(e) = self.inner.store.remove_all(&SESSION_KEYS) {
            tracing::error!("Failed to clear session storage: {}", e);
        }

        if had_user {
            tracing::info!("👋 Session cleared");
        } else {
            tracing::debug!("Session cleared");
        }
    }

    /// Re-validate the session every `period` while one exists.
    /// A failed validation logs out and redirects. The task stops when the handle is dropped.
    pub fn spawn_validation_task(&self, period: Duration) -> ValidationTask {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                if this.current_user().is_none() && this.credentials().is_none() {
                    continue;
                }

                if !this.validate() {
                    tracing::warn!("Session validation failed");
                    this.logout();
                }
            }
        });

        ValidationTask { handle }
    }
}

/// Handle to the periodic validation task
pub struct ValidationTask {
    handle: JoinHandle<()>,
}

impl ValidationTask {
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for ValidationTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
