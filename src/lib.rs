//! kunci: credential verification and token lifecycle.
//!
//! The crate verifies interactive login credentials and manages the full
//! lifetime of the resulting token pairs: short-lived RS256 access tokens
//! and opaque, single-use refresh tokens linked into rotation chains. It
//! is storage-backed (PostgreSQL via `sqlx`, plus in-memory stores for
//! tests), keeps an in-process revocation cache so request authentication
//! never touches the store, and records an audit event on every rejecting
//! branch.
//!
//! [`service::AuthService`] is the intended entry point; the individual
//! layers underneath it are public for callers that need finer control.

pub mod audit;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod limiter;
pub mod models;
pub mod revocation;
pub mod service;
pub mod signer;
pub mod store;
pub mod verifier;

pub use config::AuthConfig;
pub use error::AuthError;
pub use service::AuthService;
