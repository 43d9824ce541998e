//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket session:
//! the validated configuration, relay metrics, the server start time,
//! and a shared `reqwest::Client` so credential minting reuses one
//! connection pool across sessions.
//!
//! All mutable pieces use the `Arc<RwLock<T>>` pattern so many
//! concurrent sessions can read while updates stay exclusive.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// State shared across all requests and sessions.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<RelayMetrics>>,
    /// When the server started. `Instant` never changes, so no lock.
    pub start_time: Instant,
    /// Shared HTTP client for credential minting.
    http: reqwest::Client,
}

/// Counters describing relay activity since startup.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total HTTP requests processed (including WebSocket upgrades).
    pub request_count: u64,

    /// Total errors: failed HTTP requests plus client-visible session errors.
    pub error_count: u64,

    /// Currently open transcription sessions.
    pub active_sessions: u32,

    /// Sessions accepted since startup.
    pub sessions_started: u64,

    /// Sessions that ended with a non-normal close.
    pub sessions_failed: u64,

    /// Partial transcript messages relayed to clients.
    pub partial_transcripts: u64,

    /// Final transcript messages relayed to clients.
    pub final_transcripts: u64,

    /// Per-endpoint request statistics, keyed by "METHOD /path".
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Request statistics for a single endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(RelayMetrics::default())),
            start_time: Instant::now(),
            http: reqwest::Client::new(),
        }
    }

    /// Get a copy of the current configuration. Cloning releases the
    /// read lock immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// The shared HTTP client used for credential minting.
    pub fn http_client(&self) -> reqwest::Client {
        self.http.clone()
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Called when a WebSocket session is accepted.
    pub fn session_started(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_sessions += 1;
        metrics.sessions_started += 1;
    }

    /// Called when a WebSocket session ends, however it ended.
    pub fn session_finished(&self) {
        let mut metrics = self.metrics.write().unwrap();
        // Guard against underflow if finish is ever observed twice.
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    /// Called when a session closes with a non-normal code.
    pub fn session_failed(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.sessions_failed += 1;
    }

    /// Count one transcript message relayed to a client.
    pub fn record_transcript(&self, is_final: bool) {
        let mut metrics = self.metrics.write().unwrap();
        if is_final {
            metrics.final_transcripts += 1;
        } else {
            metrics.partial_transcripts += 1;
        }
    }

    /// Snapshot of the metrics for serialization, so no lock is held
    /// while the HTTP response is generated.
    pub fn get_metrics_snapshot(&self) -> RelayMetrics {
        let metrics = self.metrics.read().unwrap();
        RelayMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_sessions: metrics.active_sessions,
            sessions_started: metrics.sessions_started,
            sessions_failed: metrics.sessions_failed,
            partial_transcripts: metrics.partial_transcripts,
            final_transcripts: metrics.final_transcripts,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
