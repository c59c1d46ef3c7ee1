//! The session guard: owner of the token pair and the single answer to
//! "is the current user authenticated, and as whom".
//!
//! ```text
//! Unknown --initialize--> Anonymous | Authenticated | Refreshing
//! Authenticated --expired on check--> Refreshing --ok--> Authenticated
//!                                                 \--fail--> Anonymous
//! any --logout--> Anonymous --login--> Authenticated
//! ```
//!
//! Only `refresh` touches the network. Concurrent refreshes share one in-flight
//! exchange, which runs in its own task and holds the guard weakly, so a guard
//! dropped mid-refresh simply never sees the result.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{ApiError, RefreshTransport, RefreshedTokens};

use super::claims::{decode_claims, Claims, DecodeResult, Identity, TokenError};
use super::store::{TokenPair, TokenStore};

/// Default upper bound on one refresh exchange
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionStatus {
    /// Not checked yet
    #[default]
    Unknown,
    Anonymous,
    Authenticated,
    /// Access token expired, refresh in flight
    Refreshing,
}

/// Why the session last fell back to `Anonymous`. Recorded, never raised.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionFailure {
    #[error("stored access token could not be decoded")]
    MalformedToken,

    #[error("backend rejected the refresh token")]
    RefreshRejected,

    #[error("backend could not be reached")]
    NetworkFailure,

    #[error("no refresh token available")]
    MissingRefreshToken,

    #[error("refresh timed out")]
    Timeout,
}

/// Errors surfaced to the login flow.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("malformed access token: {0}")]
    MalformedToken(#[from] TokenError),

    #[error("access token is already expired")]
    ExpiredToken,

    #[error("failed to persist tokens: {0:#}")]
    Storage(anyhow::Error),
}

/// Tokens handed over by a completed login (OAuth callback, password flow).
#[derive(Clone, Deserialize)]
pub struct LoginTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl LoginTokens {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct SessionOptions {
    pub refresh_timeout: Duration,
    pub clock: Arc<dyn Clock>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Default)]
struct SessionState {
    status: SessionStatus,
    tokens: Option<TokenPair>,
    claims: Option<Claims>,
    last_failure: Option<SessionFailure>,
    /// Bumped by login and logout; refresh results from an older epoch are dropped
    epoch: u64,
}

impl SessionState {
    fn status(&self) -> SessionStatus {
        self.status
    }
}

type InFlight = Shared<BoxFuture<'static, SessionStatus>>;

/// The running refresh, tagged with the epoch it was started in.
type InFlightSlot = Option<(u64, InFlight)>;

struct Inner {
    store: Arc<dyn TokenStore>,
    transport: Arc<dyn RefreshTransport>,
    clock: Arc<dyn Clock>,
    refresh_timeout: Duration,
    state: Mutex<SessionState>,
    in_flight: Mutex<InFlightSlot>,
    status_tx: watch::Sender<SessionStatus>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn set_status(&self, state: &mut SessionState, status: SessionStatus) {
        if state.status() != status {
            debug!(from = ?state.status(), to = ?status, "Session status changed");
        }
        state.status = status;
        if state.status() != SessionStatus::Authenticated {
            state.claims = None;
        }
        self.status_tx.send_replace(status);
    }

    fn authenticate(&self, state: &mut SessionState, tokens: TokenPair, claims: Claims) {
        state.tokens = Some(tokens);
        state.claims = Some(claims);
        state.last_failure = None;
        self.set_status(state, SessionStatus::Authenticated);
    }

    /// Drop both tokens, in memory and on disk.
    fn discard(&self, state: &mut SessionState, failure: Option<SessionFailure>) {
        state.tokens = None;
        state.last_failure = failure;
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear stored tokens");
        }
        self.set_status(state, SessionStatus::Anonymous);
    }

    /// Empty the in-flight slot unless a newer session already replaced it.
    fn finish_in_flight(&self, epoch: u64) {
        let mut slot = lock(&self.in_flight);
        if matches!(slot.as_ref(), Some((started, _)) if *started == epoch) {
            *slot = None;
        }
    }

    /// Apply the outcome of a refresh exchange started in `epoch`.
    fn complete_refresh(
        &self,
        epoch: u64,
        result: Result<RefreshedTokens, SessionFailure>,
    ) -> SessionStatus {
        let mut state = lock(&self.state);
        if state.epoch != epoch {
            debug!("Session replaced during refresh, discarding result");
            return state.status();
        }

        let refreshed = match result {
            Ok(refreshed) => refreshed,
            Err(failure) => {
                warn!(%failure, "Token refresh failed, signing out");
                self.discard(&mut state, Some(failure));
                return state.status();
            }
        };

        let claims = match decode_claims(&refreshed.access) {
            DecodeResult::Valid(claims) if !claims.is_expired_at(self.clock.now()) => claims,
            DecodeResult::Valid(_) => {
                warn!("Refresh returned an access token that is already expired");
                self.discard(&mut state, Some(SessionFailure::RefreshRejected));
                return state.status();
            }
            DecodeResult::Invalid(reason) => {
                warn!(%reason, "Refresh returned a malformed access token");
                self.discard(&mut state, Some(SessionFailure::MalformedToken));
                return state.status();
            }
        };

        let refresh_token = refreshed
            .refresh
            .or_else(|| state.tokens.as_ref().and_then(|t| t.refresh_token.clone()));
        let tokens = TokenPair::new(refreshed.access, refresh_token);

        if let Err(e) = self.store.save(&tokens) {
            // The session still works for this process
            warn!(error = %e, "Failed to persist refreshed tokens");
        }
        info!(user_id = claims.user_id, "Session refreshed");
        self.authenticate(&mut state, tokens, claims);
        state.status()
    }
}

async fn run_exchange(
    transport: Arc<dyn RefreshTransport>,
    refresh_token: String,
    timeout: Duration,
) -> Result<RefreshedTokens, SessionFailure> {
    match tokio::time::timeout(timeout, transport.exchange(&refresh_token)).await {
        Ok(Ok(refreshed)) => Ok(refreshed),
        Ok(Err(e)) => {
            debug!(error = %e, "Refresh exchange failed");
            Err(classify(&e))
        }
        Err(_) => Err(SessionFailure::Timeout),
    }
}

fn classify(error: &ApiError) -> SessionFailure {
    if error.is_network() {
        SessionFailure::NetworkFailure
    } else {
        SessionFailure::RefreshRejected
    }
}

/// Owns the session's token pair. Clones share the same session.
#[derive(Clone)]
pub struct SessionGuard {
    inner: Arc<Inner>,
}

impl SessionGuard {
    pub fn new(store: Arc<dyn TokenStore>, transport: Arc<dyn RefreshTransport>) -> Self {
        Self::with_options(store, transport, SessionOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn TokenStore>,
        transport: Arc<dyn RefreshTransport>,
        options: SessionOptions,
    ) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Unknown);
        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                clock: options.clock,
                refresh_timeout: options.refresh_timeout,
                state: Mutex::new(SessionState::default()),
                in_flight: Mutex::new(None),
                status_tx,
            }),
        }
    }

    /// Load persisted tokens and settle on a status. Never fails; a broken or
    /// unreadable token pair leaves the session anonymous.
    pub async fn initialize(&self) -> SessionStatus {
        let loaded = match self.inner.store.load() {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "Failed to load stored tokens");
                None
            }
        };

        let expired = {
            let mut state = lock(&self.inner.state);
            let tokens = match loaded {
                Some(tokens) => tokens,
                None => {
                    debug!("No stored tokens");
                    state.tokens = None;
                    self.inner.set_status(&mut state, SessionStatus::Anonymous);
                    return SessionStatus::Anonymous;
                }
            };

            match decode_claims(&tokens.access_token) {
                DecodeResult::Invalid(reason) => {
                    warn!(%reason, "Stored access token is malformed");
                    self.inner.discard(&mut state, Some(SessionFailure::MalformedToken));
                    return SessionStatus::Anonymous;
                }
                DecodeResult::Valid(claims) if claims.is_expired_at(self.inner.clock.now()) => {
                    debug!(user_id = claims.user_id, "Stored access token expired");
                    // Without a refresh token `refresh` goes straight to Anonymous
                    if tokens.refresh_token.is_some() {
                        self.inner.set_status(&mut state, SessionStatus::Refreshing);
                    }
                    state.tokens = Some(tokens);
                    true
                }
                DecodeResult::Valid(claims) => {
                    info!(user_id = claims.user_id, role = %claims.role, "Session restored");
                    self.inner.authenticate(&mut state, tokens, claims);
                    false
                }
            }
        };

        if expired {
            self.refresh().await
        } else {
            SessionStatus::Authenticated
        }
    }

    /// Exchange the refresh token for a new access token. Concurrent callers
    /// share a single network request and all observe its outcome.
    ///
    /// A refresh started before the last login or logout is never joined; it
    /// belongs to a session that no longer exists.
    pub async fn refresh(&self) -> SessionStatus {
        let in_flight = {
            let mut slot = lock(&self.inner.in_flight);
            let epoch = lock(&self.inner.state).epoch;
            match slot.as_ref() {
                Some((started, existing)) if *started == epoch => {
                    debug!("Joining in-flight refresh");
                    existing.clone()
                }
                _ => match self.start_refresh() {
                    Some((started, in_flight)) => {
                        *slot = Some((started, in_flight.clone()));
                        in_flight
                    }
                    None => return SessionStatus::Anonymous,
                },
            }
        };
        in_flight.await
    }

    /// Called with the in-flight slot locked.
    fn start_refresh(&self) -> Option<(u64, InFlight)> {
        let (refresh_token, epoch) = {
            let mut state = lock(&self.inner.state);
            let refresh_token = state.tokens.as_ref().and_then(|t| t.refresh_token.clone());
            match refresh_token {
                Some(token) => {
                    self.inner.set_status(&mut state, SessionStatus::Refreshing);
                    (token, state.epoch)
                }
                None => {
                    debug!("No refresh token, signing out");
                    self.inner
                        .discard(&mut state, Some(SessionFailure::MissingRefreshToken));
                    return None;
                }
            }
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let transport = Arc::clone(&self.inner.transport);
        let timeout = self.inner.refresh_timeout;

        let task = tokio::spawn(async move {
            let result = run_exchange(transport, refresh_token, timeout).await;
            match weak.upgrade() {
                Some(inner) => {
                    let status = inner.complete_refresh(epoch, result);
                    inner.finish_in_flight(epoch);
                    status
                }
                None => {
                    debug!("Session dropped during refresh, discarding result");
                    SessionStatus::Anonymous
                }
            }
        });

        let weak = Arc::downgrade(&self.inner);
        let joined = async move {
            match task.await {
                Ok(status) => status,
                Err(e) => {
                    warn!(error = %e, "Refresh task failed");
                    match weak.upgrade() {
                        Some(inner) => {
                            let status = inner.complete_refresh(epoch, Err(SessionFailure::NetworkFailure));
                            inner.finish_in_flight(epoch);
                            status
                        }
                        None => SessionStatus::Anonymous,
                    }
                }
            }
        };

        Some((epoch, joined.boxed().shared()))
    }

    /// Re-validate the current access token against the clock, refreshing
    /// when it has expired since the last check.
    pub async fn check(&self) -> SessionStatus {
        let status = {
            let state = lock(&self.inner.state);
            match (state.status(), state.claims.as_ref()) {
                (SessionStatus::Authenticated, Some(claims))
                    if claims.is_expired_at(self.inner.clock.now()) =>
                {
                    debug!(user_id = claims.user_id, "Access token expired since last check");
                    SessionStatus::Refreshing
                }
                (status, _) => status,
            }
        };

        match status {
            SessionStatus::Unknown => self.initialize().await,
            SessionStatus::Refreshing => self.refresh().await,
            status => status,
        }
    }

    /// Adopt tokens from a completed login flow.
    pub fn login(&self, tokens: LoginTokens) -> Result<Identity, SessionError> {
        let claims = decode_claims(&tokens.access_token).into_result()?;
        if claims.is_expired_at(self.inner.clock.now()) {
            return Err(SessionError::ExpiredToken);
        }

        let pair = TokenPair::new(tokens.access_token, tokens.refresh_token);

        // Store and memory change under one lock
        let mut state = lock(&self.inner.state);
        self.inner.store.save(&pair).map_err(SessionError::Storage)?;
        state.epoch += 1;
        let identity = claims.identity();
        info!(user_id = identity.id, role = %identity.role, "Logged in");
        self.inner.authenticate(&mut state, pair, claims);
        Ok(identity)
    }

    /// Forget both tokens. Always ends `Anonymous`.
    pub fn logout(&self) {
        let mut state = lock(&self.inner.state);
        state.epoch += 1;
        if state.tokens.is_some() {
            info!("Logged out");
        }
        self.inner.discard(&mut state, None);
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.inner.state).status()
    }

    pub fn is_authenticated(&self) -> bool {
        self.status() == SessionStatus::Authenticated
    }

    /// The signed-in identity, or `None` unless `Authenticated`.
    pub fn get_identity(&self) -> Option<Identity> {
        let state = lock(&self.inner.state);
        match state.status() {
            SessionStatus::Authenticated => state.claims.as_ref().map(Claims::identity),
            _ => None,
        }
    }

    /// Expiry of the current access token while `Authenticated`.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let state = lock(&self.inner.state);
        match state.status() {
            SessionStatus::Authenticated => state.claims.as_ref().and_then(Claims::expires_at),
            _ => None,
        }
    }

    /// Bearer token for outgoing requests, only while `Authenticated`.
    pub fn access_token(&self) -> Option<String> {
        let state = lock(&self.inner.state);
        match state.status() {
            SessionStatus::Authenticated => state.tokens.as_ref().map(|t| t.access_token.clone()),
            _ => None,
        }
    }

    pub fn last_failure(&self) -> Option<SessionFailure> {
        lock(&self.inner.state).last_failure.clone()
    }

    /// Follow status transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiClient;
    use crate::auth::claims::tests::token_for;
    use crate::auth::claims::Role;
    use crate::auth::store::MemoryTokenStore;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    enum Reply {
        Tokens(RefreshedTokens),
        Status(u16),
        Hang,
    }

    /// Refresh endpoint stand-in that records calls and can hold replies back.
    struct FakeTransport {
        reply: Reply,
        calls: AtomicUsize,
        sent: Mutex<Vec<String>>,
        gate: Option<Arc<Notify>>,
    }

    impl FakeTransport {
        fn new(reply: Reply) -> Arc<Self> {
            Self::build(reply, None)
        }

        fn gated(reply: Reply, gate: Arc<Notify>) -> Arc<Self> {
            Self::build(reply, Some(gate))
        }

        fn build(reply: Reply, gate: Option<Arc<Notify>>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                gate,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Refresh tokens exchanged so far, in call order.
        fn sent(&self) -> Vec<String> {
            lock(&self.sent).clone()
        }
    }

    #[async_trait]
    impl RefreshTransport for FakeTransport {
        async fn exchange(&self, refresh_token: &str) -> Result<RefreshedTokens, ApiError> {
            lock(&self.sent).push(refresh_token.to_string());
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(ref gate) = self.gate {
                gate.notified().await;
            }
            match self.reply {
                Reply::Tokens(ref tokens) => Ok(tokens.clone()),
                Reply::Status(code) => Err(ApiError::from_status(
                    reqwest::StatusCode::from_u16(code).unwrap(),
                    "{\"detail\":\"Token is invalid or expired\"}",
                )),
                Reply::Hang => futures::future::pending().await,
            }
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_751_400_000, 0).unwrap()
    }

    fn valid_token(id: i64, role: &str) -> String {
        token_for(id, role, now() + ChronoDuration::minutes(10))
    }

    fn expired_token(id: i64) -> String {
        token_for(id, "Counselor", now() - ChronoDuration::minutes(1))
    }

    fn issued(access: String) -> Reply {
        Reply::Tokens(RefreshedTokens { access, refresh: None })
    }

    fn guard(store: &Arc<MemoryTokenStore>, transport: &Arc<FakeTransport>) -> SessionGuard {
        guard_with_timeout(store, transport, DEFAULT_REFRESH_TIMEOUT)
    }

    fn guard_with_timeout(
        store: &Arc<MemoryTokenStore>,
        transport: &Arc<FakeTransport>,
        refresh_timeout: Duration,
    ) -> SessionGuard {
        SessionGuard::with_options(
            store.clone(),
            transport.clone(),
            SessionOptions { refresh_timeout, clock: Arc::new(FixedClock(now())) },
        )
    }

    fn stored(access: String, refresh: Option<&str>) -> Arc<MemoryTokenStore> {
        Arc::new(MemoryTokenStore::with_pair(TokenPair::new(access, refresh.map(String::from))))
    }

    #[tokio::test]
    async fn test_starts_unknown() {
        let session = guard(&Arc::new(MemoryTokenStore::new()), &FakeTransport::new(Reply::Hang));
        assert_eq!(session.status(), SessionStatus::Unknown);
        assert_eq!(session.get_identity(), None);
    }

    #[tokio::test]
    async fn test_valid_token_without_refresh_authenticates() {
        let transport = FakeTransport::new(Reply::Status(500));
        let session = guard(&stored(valid_token(5, "Counselor"), None), &transport);

        assert_eq!(session.initialize().await, SessionStatus::Authenticated);
        assert_eq!(
            session.get_identity(),
            Some(Identity { id: 5, role: Role::Counselor, email: "user5@camp.example".into() })
        );
        assert_eq!(session.expires_at(), Some(now() + ChronoDuration::minutes(10)));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_once() {
        let transport = FakeTransport::new(issued(valid_token(9, "Unit Head")));
        let store = stored(expired_token(9), Some("refresh-1"));
        let session = guard(&store, &transport);

        assert_eq!(session.initialize().await, SessionStatus::Authenticated);
        assert_eq!(transport.calls(), 1);
        assert_eq!(session.get_identity().map(|i| i.role), Some(Role::UnitHead));

        let persisted = store.load().unwrap().unwrap();
        assert_eq!(persisted.access_token, valid_token(9, "Unit Head"));
        assert_eq!(persisted.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_is_persisted() {
        let transport = FakeTransport::new(Reply::Tokens(RefreshedTokens {
            access: valid_token(9, "Admin"),
            refresh: Some("refresh-2".into()),
        }));
        let store = stored(expired_token(9), Some("refresh-1"));

        guard(&store, &transport).initialize().await;
        assert_eq!(store.load().unwrap().unwrap().refresh_token.as_deref(), Some("refresh-2"));
    }

    #[tokio::test]
    async fn test_rejected_refresh_clears_storage() {
        let transport = FakeTransport::new(Reply::Status(401));
        let store = stored(expired_token(3), Some("refresh-1"));
        let session = guard(&store, &transport);

        assert_eq!(session.initialize().await, SessionStatus::Anonymous);
        assert_eq!(transport.calls(), 1);
        assert_eq!(store.load().unwrap(), None);
        assert_eq!(session.last_failure(), Some(SessionFailure::RefreshRejected));
        assert_eq!(session.access_token(), None);
    }

    #[tokio::test]
    async fn test_no_tokens_is_anonymous_without_network() {
        let transport = FakeTransport::new(Reply::Hang);
        let session = guard(&Arc::new(MemoryTokenStore::new()), &transport);

        assert_eq!(session.initialize().await, SessionStatus::Anonymous);
        assert_eq!(transport.calls(), 0);
        assert_eq!(session.last_failure(), None);
    }

    #[tokio::test]
    async fn test_malformed_token_is_anonymous() {
        let transport = FakeTransport::new(Reply::Hang);
        let store = stored("definitely-not-a-jwt".into(), Some("refresh-1"));
        let session = guard(&store, &transport);

        assert_eq!(session.initialize().await, SessionStatus::Anonymous);
        assert_eq!(session.last_failure(), Some(SessionFailure::MalformedToken));
        assert_eq!(transport.calls(), 0);
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_expiry_boundary_is_expired() {
        let transport = FakeTransport::new(Reply::Status(401));
        let store = stored(token_for(1, "Counselor", now()), Some("refresh-1"));

        assert_eq!(guard(&store, &transport).initialize().await, SessionStatus::Anonymous);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token() {
        let transport = FakeTransport::new(Reply::Hang);
        let store = stored(expired_token(1), None);
        let session = guard(&store, &transport);

        assert_eq!(session.initialize().await, SessionStatus::Anonymous);
        assert_eq!(session.last_failure(), Some(SessionFailure::MissingRefreshToken));
        assert_eq!(transport.calls(), 0);
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_request() {
        let gate = Arc::new(Notify::new());
        let transport = FakeTransport::gated(issued(valid_token(2, "Camper Care")), gate.clone());
        let session = guard(&stored(expired_token(2), Some("refresh-1")), &transport);

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.refresh().await }
        });
        let second = tokio::spawn({
            let session = session.clone();
            async move { session.refresh().await }
        });

        while transport.calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(session.status(), SessionStatus::Refreshing);
        assert_eq!(session.get_identity(), None);
        tokio::task::yield_now().await;
        gate.notify_one();

        assert_eq!(first.await.unwrap(), SessionStatus::Authenticated);
        assert_eq!(second.await.unwrap(), SessionStatus::Authenticated);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_after_completion_starts_new_request() {
        let transport = FakeTransport::new(issued(valid_token(2, "Counselor")));
        let session = guard(&stored(valid_token(2, "Counselor"), Some("refresh-1")), &transport);
        session.initialize().await;

        assert_eq!(session.refresh().await, SessionStatus::Authenticated);
        assert_eq!(session.refresh().await, SessionStatus::Authenticated);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_hung_refresh_times_out() {
        let transport = FakeTransport::new(Reply::Hang);
        let store = stored(expired_token(4), Some("refresh-1"));
        let session = guard_with_timeout(&store, &transport, Duration::from_millis(50));

        assert_eq!(session.initialize().await, SessionStatus::Anonymous);
        assert_eq!(session.last_failure(), Some(SessionFailure::Timeout));
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_refresh_response_signs_out() {
        let transport = FakeTransport::new(issued("garbage".into()));
        let session = guard(&stored(expired_token(4), Some("refresh-1")), &transport);

        assert_eq!(session.initialize().await, SessionStatus::Anonymous);
        assert_eq!(session.last_failure(), Some(SessionFailure::MalformedToken));
    }

    #[tokio::test]
    async fn test_logout_during_refresh_wins() {
        let gate = Arc::new(Notify::new());
        let transport = FakeTransport::gated(issued(valid_token(6, "Counselor")), gate.clone());
        let store = stored(expired_token(6), Some("refresh-1"));
        let session = guard(&store, &transport);

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.initialize().await }
        });
        while transport.calls() == 0 {
            tokio::task::yield_now().await;
        }

        session.logout();
        gate.notify_one();

        assert_eq!(pending.await.unwrap(), SessionStatus::Anonymous);
        assert_eq!(session.status(), SessionStatus::Anonymous);
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropped_guard_discards_refresh_result() {
        let gate = Arc::new(Notify::new());
        let transport = FakeTransport::gated(issued(valid_token(6, "Counselor")), gate.clone());
        let store = stored(expired_token(6), Some("refresh-1"));
        let session = guard(&store, &transport);

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.refresh().await }
        });
        while transport.calls() == 0 {
            tokio::task::yield_now().await;
        }
        pending.abort();
        let _ = pending.await;
        drop(session);

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Nothing wrote the new token back
        assert_eq!(store.load().unwrap().unwrap().access_token, expired_token(6));
    }

    #[tokio::test]
    async fn test_logout_is_idempotent_and_clears_storage() {
        let transport = FakeTransport::new(Reply::Hang);
        let store = stored(valid_token(8, "Admin"), Some("refresh-1"));
        let session = guard(&store, &transport);
        session.initialize().await;

        session.logout();
        session.logout();
        assert_eq!(session.status(), SessionStatus::Anonymous);
        assert_eq!(store.load().unwrap(), None);

        let fresh = guard(&store, &transport);
        assert_eq!(fresh.initialize().await, SessionStatus::Anonymous);
        assert_eq!(fresh.last_failure(), None);
    }

    #[tokio::test]
    async fn test_login_then_identity() {
        let store = Arc::new(MemoryTokenStore::new());
        let session = guard(&store, &FakeTransport::new(Reply::Hang));
        let access = valid_token(11, "Camper Care");

        let identity = session
            .login(LoginTokens::new(access.clone(), Some("refresh-1".into())))
            .unwrap();

        assert_eq!(session.get_identity(), Some(identity));
        assert_eq!(session.access_token(), Some(access.clone()));
        assert_eq!(store.load().unwrap(), Some(TokenPair::new(access, Some("refresh-1".into()))));
    }

    #[tokio::test]
    async fn test_login_rejects_bad_tokens() {
        let store = Arc::new(MemoryTokenStore::new());
        let session = guard(&store, &FakeTransport::new(Reply::Hang));

        let malformed = session.login(LoginTokens::new("nope", None));
        assert!(matches!(malformed, Err(SessionError::MalformedToken(_))));

        let expired = session.login(LoginTokens::new(expired_token(1), None));
        assert!(matches!(expired, Err(SessionError::ExpiredToken)));

        assert_eq!(store.load().unwrap(), None);
        assert_eq!(session.status(), SessionStatus::Unknown);
    }

    #[tokio::test]
    async fn test_login_replaces_previous_refresh_token() {
        let store = stored(valid_token(1, "Admin"), Some("old-refresh"));
        let session = guard(&store, &FakeTransport::new(Reply::Hang));

        session.login(LoginTokens::new(valid_token(2, "Admin"), None)).unwrap();
        assert_eq!(store.load().unwrap().unwrap().refresh_token, None);
    }

    /// Clock the test can move forward.
    struct ManualClock(Mutex<DateTime<Utc>>);

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *lock(&self.0)
        }
    }

    #[tokio::test]
    async fn test_check_refreshes_after_expiry() {
        let transport = FakeTransport::new(issued(token_for(3, "Counselor", now() + ChronoDuration::hours(1))));
        let clock = Arc::new(ManualClock(Mutex::new(now() - ChronoDuration::minutes(5))));
        let session = SessionGuard::with_options(
            Arc::new(MemoryTokenStore::new()),
            transport.clone(),
            SessionOptions { refresh_timeout: DEFAULT_REFRESH_TIMEOUT, clock: clock.clone() },
        );

        session.login(LoginTokens::new(token_for(3, "Counselor", now()), Some("r".into()))).unwrap();
        assert_eq!(session.check().await, SessionStatus::Authenticated);
        assert_eq!(transport.calls(), 0);

        *lock(&clock.0) = now();
        assert_eq!(session.check().await, SessionStatus::Authenticated);
        assert_eq!(transport.calls(), 1);
        assert_eq!(session.expires_at(), Some(now() + ChronoDuration::hours(1)));
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let transport = FakeTransport::new(issued(valid_token(2, "Counselor")));
        let session = guard(&stored(expired_token(2), Some("refresh-1")), &transport);
        let mut updates = session.subscribe();
        assert_eq!(*updates.borrow(), SessionStatus::Unknown);

        session.initialize().await;
        assert!(updates.has_changed().unwrap());
        assert_eq!(*updates.borrow_and_update(), SessionStatus::Authenticated);

        session.logout();
        assert_eq!(*updates.borrow_and_update(), SessionStatus::Anonymous);
    }

    #[tokio::test]
    async fn test_get_with_session_retries_once_after_refresh() {
        use crate::api::client::tests::serve;

        let (base, server) = serve(vec![
            (401, r#"{"detail":"expired"}"#.to_string()),
            (200, r#"{"bunks":[]}"#.to_string()),
        ])
        .await;
        let transport = FakeTransport::new(issued(valid_token(7, "Unit Head")));
        let session = guard(&stored(valid_token(7, "Unit Head"), Some("refresh-1")), &transport);
        session.initialize().await;

        let client = ApiClient::new(base).unwrap();
        let value: serde_json::Value = client.get_with_session(&session, "/api/v1/bunks/").await.unwrap();

        assert_eq!(value["bunks"], serde_json::json!([]));
        assert_eq!(transport.calls(), 1);
        assert_eq!(server.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_get_with_session_requires_authentication() {
        let session = guard(&Arc::new(MemoryTokenStore::new()), &FakeTransport::new(Reply::Hang));
        let client = ApiClient::new("http://127.0.0.1:9").unwrap();

        let err = client
            .get_with_session::<serde_json::Value>(&session, "/api/v1/bunks/")
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<ApiError>(), Some(ApiError::Unauthorized)));
        assert_eq!(session.status(), SessionStatus::Anonymous);
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_never_reports_refreshing() {
        let store = Arc::new(StatusOnClearStore::new(TokenPair::new(expired_token(1), None)));
        let session = SessionGuard::with_options(
            store.clone(),
            FakeTransport::new(Reply::Hang),
            SessionOptions { refresh_timeout: DEFAULT_REFRESH_TIMEOUT, clock: Arc::new(FixedClock(now())) },
        );
        store.watch(session.subscribe());

        assert_eq!(session.initialize().await, SessionStatus::Anonymous);
        assert_eq!(session.last_failure(), Some(SessionFailure::MissingRefreshToken));
        assert_eq!(store.seen_on_clear(), vec![SessionStatus::Unknown]);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_network_failure() {
        let store = stored(expired_token(4), Some("refresh-1"));
        let session = SessionGuard::with_options(
            store.clone(),
            Arc::new(ApiClient::new("http://127.0.0.1:9").unwrap()),
            SessionOptions { refresh_timeout: DEFAULT_REFRESH_TIMEOUT, clock: Arc::new(FixedClock(now())) },
        );

        assert_eq!(session.initialize().await, SessionStatus::Anonymous);
        assert_eq!(session.last_failure(), Some(SessionFailure::NetworkFailure));
        assert_eq!(store.load().unwrap(), None);
        assert_eq!(session.access_token(), None);
    }

    #[tokio::test]
    async fn test_refresh_after_relogin_uses_new_refresh_token() {
        let gate = Arc::new(Notify::new());
        let transport = FakeTransport::gated(issued(valid_token(5, "Counselor")), gate.clone());
        let store = stored(valid_token(5, "Counselor"), Some("r1"));
        let session = guard(&store, &transport);
        session.initialize().await;

        let stale = tokio::spawn({
            let session = session.clone();
            async move { session.refresh().await }
        });
        while transport.calls() == 0 {
            tokio::task::yield_now().await;
        }

        session.logout();
        session.login(LoginTokens::new(valid_token(5, "Counselor"), Some("r2".into()))).unwrap();

        let current = tokio::spawn({
            let session = session.clone();
            async move { session.refresh().await }
        });
        while transport.calls() < 2 {
            tokio::task::yield_now().await;
        }
        gate.notify_waiters();

        assert_eq!(current.await.unwrap(), SessionStatus::Authenticated);
        stale.await.unwrap();
        assert_eq!(transport.sent(), vec!["r1".to_string(), "r2".to_string()]);
        assert_eq!(session.status(), SessionStatus::Authenticated);
        assert_eq!(store.load().unwrap().unwrap().refresh_token.as_deref(), Some("r2"));
        assert!(lock(&session.inner.in_flight).is_none());
    }

    /// Memory store whose first `save` writes, then parks until released.
    struct ParkingStore {
        inner: MemoryTokenStore,
        parked: AtomicUsize,
        barrier: std::sync::Barrier,
    }

    impl TokenStore for ParkingStore {
        fn load(&self) -> anyhow::Result<Option<TokenPair>> {
            self.inner.load()
        }

        fn save(&self, pair: &TokenPair) -> anyhow::Result<()> {
            self.inner.save(pair)?;
            if self.parked.fetch_add(1, Ordering::SeqCst) == 0 {
                // Once to say the pair is written, once to resume
                self.barrier.wait();
                self.barrier.wait();
            }
            Ok(())
        }

        fn clear(&self) -> anyhow::Result<()> {
            self.inner.clear()
        }
    }

    #[test]
    fn test_logout_cannot_interleave_with_login_write() {
        let store = Arc::new(ParkingStore {
            inner: MemoryTokenStore::new(),
            parked: AtomicUsize::new(0),
            barrier: std::sync::Barrier::new(2),
        });
        let session = SessionGuard::with_options(
            store.clone(),
            FakeTransport::new(Reply::Hang),
            SessionOptions { refresh_timeout: DEFAULT_REFRESH_TIMEOUT, clock: Arc::new(FixedClock(now())) },
        );

        let login = std::thread::spawn({
            let session = session.clone();
            move || session.login(LoginTokens::new(valid_token(12, "Admin"), Some("r".into())))
        });
        store.barrier.wait();

        let logout = std::thread::spawn({
            let session = session.clone();
            move || session.logout()
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!logout.is_finished());
        store.barrier.wait();

        assert!(login.join().unwrap().is_ok());
        logout.join().unwrap();

        assert_eq!(session.status(), SessionStatus::Anonymous);
        assert_eq!(session.get_identity(), None);
        assert_eq!(store.load().unwrap(), None);
    }

    /// Memory store that notes the published status whenever it is cleared.
    struct StatusOnClearStore {
        inner: MemoryTokenStore,
        watcher: Mutex<Option<watch::Receiver<SessionStatus>>>,
        seen: Mutex<Vec<SessionStatus>>,
    }

    impl StatusOnClearStore {
        fn new(pair: TokenPair) -> Self {
            Self {
                inner: MemoryTokenStore::with_pair(pair),
                watcher: Mutex::new(None),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn watch(&self, updates: watch::Receiver<SessionStatus>) {
            *lock(&self.watcher) = Some(updates);
        }

        fn seen_on_clear(&self) -> Vec<SessionStatus> {
            lock(&self.seen).clone()
        }
    }

    impl TokenStore for StatusOnClearStore {
        fn load(&self) -> anyhow::Result<Option<TokenPair>> {
            self.inner.load()
        }

        fn save(&self, pair: &TokenPair) -> anyhow::Result<()> {
            self.inner.save(pair)
        }

        fn clear(&self) -> anyhow::Result<()> {
            if let Some(updates) = lock(&self.watcher).as_ref() {
                lock(&self.seen).push(*updates.borrow());
            }
            self.inner.clear()
        }
    }
}
