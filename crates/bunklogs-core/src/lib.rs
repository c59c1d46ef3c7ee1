//! Session core for the BunkLogs camp dashboard.
//!
//! The dashboard's views only ever ask two questions of this crate: is someone
//! signed in, and who. `SessionGuard` answers both and is the only thing that
//! touches the access/refresh token pair. The rest of the crate is what the
//! guard needs (HTTP refresh, storage, configuration) plus the submission
//! window rule shared by every log form.

pub mod api;
pub mod auth;
pub mod config;
pub mod window;

pub use api::{ApiClient, ApiError};
pub use auth::{Identity, LoginTokens, Role, SessionGuard, SessionStatus};
pub use config::Config;

use std::sync::Arc;

use anyhow::Result;
use auth::SessionOptions;

/// Build a session guard wired to the configured store and backend.
pub fn session_from_config(config: &Config) -> Result<(SessionGuard, ApiClient)> {
    let store = config::open_store(config)?;
    let api = ApiClient::from_config(config)?;
    let options = SessionOptions {
        refresh_timeout: config.refresh_timeout(),
        ..SessionOptions::default()
    };
    let session = SessionGuard::with_options(store, Arc::new(api.clone()), options);
    Ok((session, api))
}
