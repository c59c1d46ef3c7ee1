//! API client for the BunkLogs REST backend.
//!
//! This module provides the `ApiClient` struct, which performs the token
//! refresh exchange for a `SessionGuard` and issues authorized GET requests
//! for the views that consume a session.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::{SessionGuard, SessionStatus};
use crate::config::Config;

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Token refresh endpoint, relative to the API base URL
pub const DEFAULT_REFRESH_PATH: &str = "/api/auth/token/refresh/";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

/// Tokens returned by the refresh endpoint. `refresh` is only present when the
/// backend rotates refresh tokens.
#[derive(Clone, Deserialize)]
pub struct RefreshedTokens {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

impl fmt::Debug for RefreshedTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshedTokens")
            .field("access", &"<redacted>")
            .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// The network half of a session refresh.
#[async_trait]
pub trait RefreshTransport: Send + Sync {
    /// Exchange a refresh token for a new access token. One call, no retries.
    async fn exchange(&self, refresh_token: &str) -> Result<RefreshedTokens, ApiError>;
}

/// API client for the BunkLogs backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    refresh_path: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeouts(base_url, DEFAULT_REFRESH_PATH, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_timeouts(config.api_base_url(), config.refresh_path(), config.request_timeout())
    }

    fn with_timeouts(
        base_url: impl Into<String>,
        refresh_path: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            refresh_path: refresh_path.into(),
            token: None,
        })
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(), // Cheap clone, shares connection pool
            base_url: self.base_url.clone(),
            refresh_path: self.refresh_path.clone(),
            token: Some(token),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref token) = self.token {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Exchange a refresh token for a new access token.
    pub async fn refresh_access(&self, refresh_token: &str) -> Result<RefreshedTokens, ApiError> {
        let url = self.url(&self.refresh_path);
        debug!(url = %url, "Requesting token refresh");

        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(&RefreshRequest { refresh: refresh_token })
            .send()
            .await?;

        let response = Self::check_response(response).await?;

        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse refresh response: {}", e)))
    }

    /// Authorized GET that backs off and retries when rate limited.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self
                .client
                .get(&url)
                .headers(self.auth_headers()?)
                .send()
                .await
                .with_context(|| format!("Failed to send GET request to {}", url))?;

            if response.status().as_u16() == 429 {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(ApiError::RateLimited.into());
                }
                warn!(url = %url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2; // Exponential backoff
                continue;
            }

            let response = Self::check_response(response).await?;
            return response
                .json()
                .await
                .with_context(|| format!("Failed to parse JSON response from {}", url));
        }
    }

    /// GET on behalf of a session. A 401 costs one refresh and one retry;
    /// if that does not help the session ends up signed out.
    pub async fn get_with_session<T: DeserializeOwned>(
        &self,
        session: &SessionGuard,
        path: &str,
    ) -> Result<T> {
        if session.check().await != SessionStatus::Authenticated {
            return Err(ApiError::Unauthorized.into());
        }
        let token = session.access_token().ok_or(ApiError::Unauthorized)?;

        match self.with_token(token).get_json(path).await {
            Err(e) if is_unauthorized(&e) => {
                warn!(path = path, "Request unauthorized, refreshing session");
                if session.refresh().await != SessionStatus::Authenticated {
                    return Err(ApiError::Unauthorized.into());
                }
                let token = session.access_token().ok_or(ApiError::Unauthorized)?;
                self.with_token(token).get_json(path).await
            }
            other => other,
        }
    }
}

fn is_unauthorized(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<ApiError>(), Some(ApiError::Unauthorized))
}

#[async_trait]
impl RefreshTransport for ApiClient {
    async fn exchange(&self, refresh_token: &str) -> Result<RefreshedTokens, ApiError> {
        self.refresh_access(refresh_token).await
    }
}
