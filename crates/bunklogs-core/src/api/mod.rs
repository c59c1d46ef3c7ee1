//! REST client for the BunkLogs backend.
//!
//! This module provides the `ApiClient` used to exchange a refresh token for a
//! new access token and to issue authorized requests on behalf of a session.
//!
//! The backend uses JWT bearer authentication; access tokens are short-lived
//! and renewed through the token refresh endpoint.

pub mod client;
pub mod error;

pub use client::{ApiClient, RefreshTransport, RefreshedTokens};
pub use error::ApiError;
