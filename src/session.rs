// Search session state machine.
//
// Every session has exactly one owning task which drives it from `Pending`
// through polling to a terminal state, writing snapshots to the cache and
// publishing events as it goes. Readers only ever see snapshots.

use crate::cache::{Cache, CacheKey};
use crate::notify::{NotificationHub, SessionEvent, Subscription};
use crate::provider::{backoff_for, with_retry, ProviderError, RetryConfig, TourProvider};
use crate::tour::{retain_valid, stamp_departure, Fingerprint, SearchParams, TourResult};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// Upper bound on result pages pulled in one go
const MAX_PAGES_PER_FETCH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Searching,
    Partial,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureCause {
    #[error("search timed out")]
    Timeout,

    #[error("provider error: {0}")]
    Provider(String),

    #[error("malformed provider data: {0}")]
    MalformedData(String),
}

impl From<ProviderError> for FailureCause {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::MalformedResponse(detail) => FailureCause::MalformedData(detail),
            other => FailureCause::Provider(other.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    // Unknown or expired
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Provider failure: {0}")]
    Provider(#[from] ProviderError),

    #[error("Session {id} is {status:?} and cannot be continued")]
    InvalidState { id: String, status: SessionStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueOutcome {
    Resumed,
    NoMoreResults,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Arrival,
    PriceAscending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSession {
    pub id: String,
    pub fingerprint: Fingerprint,
    pub parameters: SearchParams,
    pub provider_request_id: Option<String>,
    pub status: SessionStatus,
    pub progress_percent: u8,
    pub result_cursor: usize,
    pub has_more: bool,
    pub accumulated_results: Vec<TourResult>,
    pub failure: Option<FailureCause>,
    pub created_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub poll_count: u32,
}

impl SearchSession {
    fn new(id: String, parameters: SearchParams) -> Self {
        Self {
            id,
            fingerprint: parameters.fingerprint(),
            parameters,
            provider_request_id: None,
            status: SessionStatus::Pending,
            progress_percent: 0,
            result_cursor: 0,
            has_more: false,
            accumulated_results: Vec::new(),
            failure: None,
            created_at: Utc::now(),
            last_polled_at: None,
            poll_count: 0,
        }
    }

    fn status_event(&self) -> SessionEvent {
        SessionEvent::Status {
            status: self.status,
            progress_percent: self.progress_percent,
        }
    }

    fn results_event(&self) -> SessionEvent {
        SessionEvent::Results {
            tours: self.accumulated_results.clone(),
            has_more: self.has_more,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    // Retryable poll failures in a row before the session is failed
    pub max_consecutive_errors: u32,
    // How long an identical in-flight search is reused
    pub dedup_window: Duration,
    pub retry: RetryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_poll_attempts: 60,
            max_consecutive_errors: 5,
            dedup_window: crate::cache::POPULAR_SEARCH_TTL,
            retry: RetryConfig::default(),
        }
    }
}

struct Claim {
    session_id: String,
    claimed_at: Instant,
}

struct Inner {
    provider: Arc<dyn TourProvider>,
    cache: Cache,
    hub: NotificationHub,
    config: SessionConfig,
    active: DashMap<String, SearchSession>,
    claims: DashMap<Fingerprint, Claim>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn TourProvider>,
        cache: Cache,
        hub: NotificationHub,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                cache,
                hub,
                config,
                active: DashMap::new(),
                claims: DashMap::new(),
            }),
        }
    }

    /// Starts a search, or returns the id of an identical one still running.
    pub fn start_search(&self, params: SearchParams) -> String {
        let params = params.resolved(Utc::now().date_naive());
        let fingerprint = params.fingerprint();
        let inner = &self.inner;

        let session = match inner.claims.entry(fingerprint.clone()) {
            Entry::Occupied(mut occupied) => {
                let claim = occupied.get();
                if claim.claimed_at.elapsed() < inner.config.dedup_window
                    && inner.is_running(&claim.session_id)
                {
                    debug!(
                        session_id = %claim.session_id,
                        fingerprint = %fingerprint,
                        "reusing in-flight search"
                    );
                    return claim.session_id.clone();
                }
                let session = inner.register(params);
                occupied.insert(Claim {
                    session_id: session.id.clone(),
                    claimed_at: Instant::now(),
                });
                session
            }
            Entry::Vacant(vacant) => {
                let session = inner.register(params);
                vacant.insert(Claim {
                    session_id: session.id.clone(),
                    claimed_at: Instant::now(),
                });
                session
            }
        };

        let id = session.id.clone();
        info!(session_id = %id, fingerprint = %fingerprint, "search session created");
        tokio::spawn(drive(Arc::clone(&self.inner), session));
        id
    }

    /// Current snapshot. Expired sessions are indistinguishable from unknown ones.
    pub fn get_session(&self, id: &str) -> Result<SearchSession, SessionError> {
        self.inner.snapshot(id)
    }

    pub fn results(&self, id: &str, order: SortOrder) -> Result<Vec<TourResult>, SessionError> {
        let mut tours = self.inner.snapshot(id)?.accumulated_results;
        if order == SortOrder::PriceAscending {
            // Stable, so equal prices keep arrival order
            tours.sort_by(|a, b| a.price.total_cmp(&b.price));
        }
        Ok(tours)
    }

    pub fn results_page(
        &self,
        id: &str,
        order: SortOrder,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TourResult>, SessionError> {
        Ok(self
            .results(id, order)?
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    /// Results a finished identical search left in the popular-search cache.
    pub fn popular_results(&self, params: &SearchParams) -> Option<Vec<TourResult>> {
        let params = params.resolved(Utc::now().date_naive());
        self.inner
            .cache
            .get(&CacheKey::PopularSearch(params.fingerprint()))
    }

    pub async fn continue_search(&self, id: &str) -> Result<ContinueOutcome, SessionError> {
        let inner = &self.inner;
        let mut session = inner.snapshot(id)?;

        match session.status {
            SessionStatus::Completed if !session.has_more => {
                debug!(session_id = id, "continue requested on exhausted session");
                return Ok(ContinueOutcome::NoMoreResults);
            }
            SessionStatus::Completed => {}
            status => {
                return Err(SessionError::InvalidState {
                    id: id.to_string(),
                    status,
                })
            }
        }

        let request_id = session
            .provider_request_id
            .clone()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        // Claim ownership before touching the provider
        session.status = SessionStatus::Searching;
        session.progress_percent = 0;
        match inner.active.entry(id.to_string()) {
            Entry::Occupied(occupied) if !occupied.get().status.is_terminal() => {
                return Err(SessionError::InvalidState {
                    id: id.to_string(),
                    status: occupied.get().status,
                })
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(session.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(session.clone());
            }
        }
        inner.reclaim(&session);

        let provider = Arc::clone(&inner.provider);
        let resumed = with_retry(&inner.config.retry, || provider.continue_search(&request_id)).await;
        if let Err(err) = resumed {
            inner.active.remove(id);
            inner
                .claims
                .remove_if(&session.fingerprint, |_, claim| claim.session_id == id);
            warn!(session_id = id, error = %err, "continue search failed");
            return Err(SessionError::Provider(err));
        }

        info!(session_id = id, "search session resumed");
        inner.store(&session);
        inner.hub.publish(id, session.status_event());
        tokio::spawn(poll_until_done(Arc::clone(&self.inner), session));
        Ok(ContinueOutcome::Resumed)
    }

    /// Attaches to a session's events. Sessions that already finished replay
    /// their final event; running ones replay their current status.
    pub fn subscribe(&self, id: &str) -> Result<Subscription, SessionError> {
        // Subscribe before reading the snapshot so nothing published in between is missed
        let mut subscription = self.inner.hub.subscribe(id);
        let session = self.inner.snapshot(id)?;

        match session.status {
            SessionStatus::Completed => subscription.finish_with(vec![session.results_event()]),
            SessionStatus::Failed => {
                let cause = session.failure.clone().unwrap_or(FailureCause::Timeout);
                subscription.finish_with(vec![SessionEvent::Error { cause }])
            }
            _ => subscription.push_replay(session.status_event()),
        }
        Ok(subscription)
    }

    pub fn active_sessions(&self) -> usize {
        self.inner
            .active
            .iter()
            .filter(|entry| !entry.value().status.is_terminal())
            .count()
    }
}

impl Inner {
    fn register(&self, params: SearchParams) -> SearchSession {
        let session = SearchSession::new(uuid::Uuid::new_v4().to_string(), params);
        self.active.insert(session.id.clone(), session.clone());
        self.cache
            .set(&CacheKey::SearchSession(session.id.clone()), &session);
        session
    }

    fn snapshot(&self, id: &str) -> Result<SearchSession, SessionError> {
        if let Some(active) = self.active.get(id) {
            return Ok(active.value().clone());
        }
        self.cache
            .get(&CacheKey::SearchSession(id.to_string()))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    fn is_running(&self, id: &str) -> bool {
        self.active
            .get(id)
            .map_or(false, |entry| !entry.value().status.is_terminal())
    }

    // A resumed session owns its fingerprint again unless another live search does
    fn reclaim(&self, session: &SearchSession) {
        let claim = Claim {
            session_id: session.id.clone(),
            claimed_at: Instant::now(),
        };
        match self.claims.entry(session.fingerprint.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let held = current.session_id != session.id
                    && current.claimed_at.elapsed() < self.config.dedup_window
                    && self.is_running(&current.session_id);
                if !held {
                    occupied.insert(claim);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(claim);
            }
        }
    }

    // Once a terminal snapshot is cached, `active` no longer holds the session,
    // so readers never see an older state than the cache has.
    fn store(&self, session: &SearchSession) {
        let key = CacheKey::SearchSession(session.id.clone());
        if !session.status.is_terminal() {
            self.active.insert(session.id.clone(), session.clone());
            self.cache.set(&key, session);
        } else if self.cache.set(&key, session) {
            self.active.remove(&session.id);
        } else {
            warn!(session_id = %session.id, "terminal snapshot not cached, keeping it in memory");
            self.active.insert(session.id.clone(), session.clone());
        }
    }

    fn transition(&self, session: &mut SearchSession, status: SessionStatus) {
        debug!(
            session_id = %session.id,
            from = ?session.status,
            to = ?status,
            progress = session.progress_percent,
            "session transition"
        );
        session.status = status;
        self.store(session);
        self.hub.publish(&session.id, session.status_event());
    }

    fn complete(&self, mut session: SearchSession) {
        session.status = SessionStatus::Completed;
        session.progress_percent = 100;

        self.store(&session);
        self.cache.set(
            &CacheKey::SearchResults(session.id.clone()),
            &session.accumulated_results,
        );
        self.cache.set(
            &CacheKey::PopularSearch(session.fingerprint.clone()),
            &session.accumulated_results,
        );

        info!(
            session_id = %session.id,
            tours = session.accumulated_results.len(),
            has_more = session.has_more,
            polls = session.poll_count,
            "search session completed"
        );
        self.hub.publish(&session.id, session.status_event());
        self.hub.publish(&session.id, session.results_event());
        self.release(&session);
    }

    fn fail(&self, mut session: SearchSession, cause: FailureCause) {
        error!(session_id = %session.id, cause = %cause, "search session failed");
        session.status = SessionStatus::Failed;
        session.failure = Some(cause.clone());

        self.store(&session);
        self.hub.publish(&session.id, session.status_event());
        self.hub.publish(&session.id, SessionEvent::Error { cause });
        self.release(&session);
    }

    fn release(&self, session: &SearchSession) {
        self.hub.close(&session.id);
        self.claims
            .remove_if(&session.fingerprint, |_, claim| claim.session_id == session.id);
    }

    // Pulls pages from the cursor until the provider has nothing new
    async fn fetch_new_results(
        &self,
        session: &mut SearchSession,
        request_id: &str,
        drain: bool,
    ) -> Result<usize, ProviderError> {
        let city = session.parameters.departure;
        let departure_name = self.cache.departure_name(city);
        let mut appended = 0;
        for _ in 0..MAX_PAGES_PER_FETCH {
            let page = self
                .provider
                .fetch_results(request_id, session.result_cursor)
                .await?;
            let advanced = page.next_cursor > session.result_cursor;
            let received = page.tours.len();

            let (mut valid, dropped) = retain_valid(page.tours);
            if dropped > 0 {
                debug!(session_id = %session.id, dropped, "excluded invalid tours");
            }
            stamp_departure(&mut valid, city, departure_name.as_deref());
            appended += valid.len();
            session.accumulated_results.extend(valid);
            session.result_cursor = page.next_cursor.max(session.result_cursor);
            session.has_more = page.has_more;

            if !drain || !advanced || received == 0 {
                break;
            }
        }
        Ok(appended)
    }
}

async fn drive(inner: Arc<Inner>, mut session: SearchSession) {
    let provider = Arc::clone(&inner.provider);
    let params = session.parameters.clone();
    let started = with_retry(&inner.config.retry, || provider.start_search(&params)).await;

    match started {
        Ok(request_id) => {
            debug!(session_id = %session.id, request_id = %request_id, "provider search started");
            session.provider_request_id = Some(request_id);
            inner.transition(&mut session, SessionStatus::Searching);
            poll_until_done(inner, session).await;
        }
        Err(err) => inner.fail(session, err.into()),
    }
}

async fn poll_until_done(inner: Arc<Inner>, mut session: SearchSession) {
    let request_id = match session.provider_request_id.clone() {
        Some(request_id) => request_id,
        None => {
            let cause = FailureCause::MalformedData("missing provider request id".to_string());
            inner.fail(session, cause);
            return;
        }
    };

    let mut attempts = 0;
    let mut consecutive_errors = 0;

    while attempts < inner.config.max_poll_attempts {
        tokio::time::sleep(inner.config.poll_interval).await;
        attempts += 1;
        session.poll_count += 1;
        session.last_polled_at = Some(Utc::now());

        let progress = match inner.provider.poll_status(&request_id).await {
            Ok(progress) => {
                consecutive_errors = 0;
                progress
            }
            Err(err) if err.is_retryable() => {
                consecutive_errors += 1;
                if consecutive_errors > inner.config.max_consecutive_errors {
                    inner.fail(session, err.into());
                    return;
                }
                let delay = backoff_for(&err, consecutive_errors - 1, &inner.config.retry);
                warn!(
                    session_id = %session.id,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "poll failed, backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(err) => {
                warn!(session_id = %session.id, error = %err, "ignoring malformed status response");
                continue;
            }
        };

        if progress.is_complete {
            let mut retries = 0;
            loop {
                match inner.fetch_new_results(&mut session, &request_id, true).await {
                    Ok(_) => break,
                    Err(err) if err.is_retryable() && retries < inner.config.retry.max_retries => {
                        let delay = backoff_for(&err, retries, &inner.config.retry);
                        warn!(
                            session_id = %session.id,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "final fetch failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        retries += 1;
                    }
                    Err(err) if err.is_retryable() => {
                        inner.fail(session, err.into());
                        return;
                    }
                    Err(err) => {
                        warn!(session_id = %session.id, error = %err, "dropping malformed final page");
                        break;
                    }
                }
            }
            inner.complete(session);
            return;
        }

        if progress.progress_percent > session.progress_percent {
            session.progress_percent = progress.progress_percent;
            match inner.fetch_new_results(&mut session, &request_id, false).await {
                Ok(appended) => {
                    debug!(session_id = %session.id, appended, "incremental results");
                    inner.transition(&mut session, SessionStatus::Partial);
                }
                Err(err) => {
                    warn!(session_id = %session.id, error = %err, "incremental fetch failed");
                    inner.store(&session);
                }
            }
        } else {
            inner.store(&session);
        }
    }

    warn!(session_id = %session.id, attempts, "poll ceiling reached");
    inner.fail(session, FailureCause::Timeout);
}
