// View navigation
// Tracks the current view and performs redirect-to-login on session loss

use std::sync::Arc;
use tokio::sync::watch;

pub const LOGIN_PATH: &str = "/login";

/// A view of the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    Login,
    Page(String),
}

impl View {
    /// Map a route path to a view
    pub fn from_path(path: &str) -> Self {
        if path == LOGIN_PATH {
            View::Login
        } else {
            View::Page(path.to_string())
        }
    }

    pub fn path(&self) -> &str {
        match self {
            View::Login => LOGIN_PATH,
            View::Page(path) => path,
        }
    }
}

/// Observable current view
///
/// Cloning shares the same underlying view; subscribers are notified on every change.
#[derive(Clone)]
pub struct Navigator {
    current: Arc<watch::Sender<View>>,
}

impl Navigator {
    pub fn new(initial: View) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            current: Arc::new(tx),
        }
    }

    pub fn current(&self) -> View {
        self.current.borrow().clone()
    }

    pub fn is_on_login(&self) -> bool {
        *self.current.borrow() == View::Login
    }

    pub fn navigate(&self, view: View) {
        tracing::debug!(path = view.path(), "Navigating");
        self.current.send_replace(view);
    }

    /// Switch to the login view unless already there.
    /// Returns true when a navigation happened.
    pub fn redirect_to_login(&self) -> bool {
        if self.is_on_login() {
            return false;
        }
        tracing::info!("Redirecting to login");
        self.navigate(View::Login);
        true
    }

    pub fn subscribe(&self) -> watch::Receiver<View> {
        self.current.subscribe()
    }
}

impl Default for Navigator {
    fn default() -> Self {
        Self::new(View::Login)
    }
}
