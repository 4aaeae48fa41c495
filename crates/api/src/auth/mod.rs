//! Caller identity
//!
//! Authentication happens upstream; the gateway forwards the verified caller
//! as `X-User-Id` and `X-User-Role` headers.

pub mod middleware;

pub use middleware::{require_identity, AuthError, AuthUser, Role, USER_ID_HEADER, USER_ROLE_HEADER};
