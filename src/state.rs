//! # Application State Management
//!
//! Shared state for the ops HTTP handlers and the streaming sessions.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: every HTTP worker and every session task holds a handle to the same state
//! - **RwLock**: many readers (handlers rendering metrics) or one writer (a session
//!   opening or closing)
//!
//! Sessions never share recognition state through here: the registry only holds what the
//! ops API reports (id, lifecycle state, connect time, delivery counters).

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::session::delivery::DeliveryStats;
use crate::session::{SessionEnd, SessionState, SessionSummary};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state shared across handlers and sessions.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration, fixed after startup
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP and bridge metrics
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Live sessions keyed by session id
    pub sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected since server start.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed
    pub request_count: u64,

    /// Total number of HTTP errors
    pub error_count: u64,

    /// Per-endpoint statistics, keyed like "GET /api/v1/health"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,

    pub bridge: BridgeMetrics,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Counters for the streaming side.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BridgeMetrics {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    /// Sessions that ended on an engine construction or inference failure
    pub sessions_failed: u64,
    /// Connections refused by the session limit
    pub sessions_rejected: u64,
    pub partial_segments: u64,
    pub final_segments: u64,
    /// Worker threads detached after the join timeout
    pub join_timeouts: u64,
}

/// Registry record for one live session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub state: SessionState,
    pub connected_at: DateTime<Utc>,
    pub stats: Arc<DeliveryStats>,
}

/// Serializable view of a session for `/api/v1/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub connected_at: String,
    pub partial_segments: u64,
    pub final_segments: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so sessions never hold it.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions_ref(&self) -> RwLockReadGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: The API endpoint (e.g., "GET /api/v1/metrics")
    /// - **duration_ms**: How long the request took to process
    /// - **is_error**: Whether this request resulted in an error
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Register a new session, enforcing the concurrent session limit.
    ///
    /// ## Errors:
    /// `AppError::SessionLimit` when `limit` sessions are already live; the refusal is
    /// counted here.
    pub fn open_session(&self, id: &str, stats: Arc<DeliveryStats>, limit: usize) -> AppResult<()> {
        {
            let mut sessions = self.sessions_mut();
            if sessions.len() >= limit {
                drop(sessions);
                self.metrics_mut().bridge.sessions_rejected += 1;
                return Err(AppError::SessionLimit(limit));
            }
            sessions.insert(
                id.to_string(),
                SessionEntry {
                    state: SessionState::Active,
                    connected_at: Utc::now(),
                    stats,
                },
            );
        }
        self.metrics_mut().bridge.sessions_opened += 1;
        Ok(())
    }

    pub fn set_session_state(&self, id: &str, state: SessionState) {
        if let Some(entry) = self.sessions_mut().get_mut(id) {
            entry.state = state;
        }
    }

    /// Remove a finished session and fold its summary into the bridge metrics.
    pub fn close_session(&self, summary: &SessionSummary) {
        self.sessions_mut().remove(&summary.id);

        let mut metrics = self.metrics_mut();
        let bridge = &mut metrics.bridge;
        bridge.sessions_closed += 1;
        bridge.partial_segments += summary.partials;
        bridge.final_segments += summary.finals;
        if summary.end == SessionEnd::EngineFailure {
            bridge.sessions_failed += 1;
        }
        if !summary.worker_joined {
            bridge.join_timeouts += 1;
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions_ref().len()
    }

    /// Snapshot of live sessions, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions_ref()
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: id.clone(),
                state: entry.state,
                connected_at: entry.connected_at.to_rfc3339(),
                partial_segments: entry.stats.partials(),
                final_segments: entry.stats.finals(),
            })
            .collect();
        sessions.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Cloned so the lock is not held while the response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time in milliseconds; 0.0 before the first request.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, end: SessionEnd, worker_joined: bool) -> SessionSummary {
        SessionSummary {
            id: id.to_string(),
            end,
            partials: 3,
            finals: 1,
            worker_joined,
            duration_secs: 1.0,
            failure: None,
        }
    }

    #[test]
    fn test_session_limit() {
        let state = AppState::new(AppConfig::default());
        state.open_session("a", Default::default(), 2).unwrap();
        state.open_session("b", Default::default(), 2).unwrap();

        let err = state.open_session("c", Default::default(), 2).unwrap_err();
        assert!(matches!(err, AppError::SessionLimit(2)));
        assert_eq!(state.active_sessions(), 2);

        state.close_session(&summary("a", SessionEnd::ClientClosed, true));
        assert!(state.open_session("c", Default::default(), 2).is_ok());

        let bridge = state.get_metrics_snapshot().bridge;
        assert_eq!(bridge.sessions_opened, 3);
        assert_eq!(bridge.sessions_rejected, 1);
        assert_eq!(bridge.sessions_closed, 1);
    }

    #[test]
    fn test_close_session_folds_summary() {
        let state = AppState::new(AppConfig::default());
        state.open_session("a", Default::default(), 4).unwrap();
        state.set_session_state("a", SessionState::Stopping);
        assert_eq!(state.list_sessions()[0].state, SessionState::Stopping);

        state.close_session(&summary("a", SessionEnd::EngineFailure, false));
        assert!(state.list_sessions().is_empty());

        let bridge = state.get_metrics_snapshot().bridge;
        assert_eq!(bridge.partial_segments, 3);
        assert_eq!(bridge.final_segments, 1);
        assert_eq!(bridge.sessions_failed, 1);
        assert_eq!(bridge.join_timeouts, 1);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let endpoint = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(endpoint.average_duration_ms(), 20.0);
        assert_eq!(endpoint.error_rate(), 0.5);
    }
}
