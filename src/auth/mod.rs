// Authentication module
// Manages the session lifecycle: login, silent refresh, expiry checks and logout

pub(crate) mod claims;
mod manager;
mod refresh;
pub mod store;
mod types;

pub use claims::{decode_claims, is_expired, is_expired_at, Claims};
pub use manager::{SessionManager, ValidationTask};
pub use refresh::{endpoint_url, LOGIN_PATH, REFRESH_PATH};
pub use store::{MemoryStore, SessionStore, SqliteStore};
pub use types::{CredentialPair, SessionState};
