// Data models for the SAMS API

pub mod envelope;
pub mod user;

pub use envelope::{ApiEnvelope, Pagination};
pub use user::{DepartmentRef, SessionUser};
