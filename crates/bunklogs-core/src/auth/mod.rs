//! Authentication module for the BunkLogs session.
//!
//! This module provides:
//! - `SessionGuard`: owner of the access/refresh token pair and the session state machine
//! - `decode_claims`: advisory decoding of access token claims (no signature check)
//! - `TokenStore`: durable pair storage in memory, a file, or the OS keychain
//!
//! Access tokens are short-lived; the guard renews them through the refresh
//! endpoint and falls back to anonymous whenever that is not possible.

pub mod claims;
mod crypto;
pub mod guard;
pub mod store;

pub use claims::{decode_claims, Claims, DecodeResult, Identity, Role, TokenError};
pub use guard::{
    Clock, LoginTokens, SessionError, SessionFailure, SessionGuard, SessionOptions, SessionStatus,
    SystemClock, DEFAULT_REFRESH_TIMEOUT,
};
pub use store::{FileTokenStore, KeyringTokenStore, MemoryTokenStore, TokenPair, TokenStore};
