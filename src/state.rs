//! # Application State Management
//!
//! Shared state accessed concurrently by HTTP handlers, the telephony event
//! loop and the per-call session tasks.
//!
//! ## Thread Safety:
//! Everything mutable lives behind `Arc<RwLock<T>>`: many readers or one
//! writer, copies handed out as snapshots so locks are never held across an
//! await or an HTTP response.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// State shared across all HTTP request handlers and background tasks.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime).
    pub config: Arc<RwLock<AppConfig>>,

    /// Call and HTTP metrics, updated by middleware and session tasks.
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started.
    pub start_time: Instant,
}

/// Counters collected since server start.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed.
    pub request_count: u64,

    /// Total number of HTTP errors returned.
    pub error_count: u64,

    /// Calls currently bridged to a live AI session.
    pub active_calls: u32,

    /// Calls handled since startup (including failed setups).
    pub total_calls: u64,

    /// Caller audio frames forwarded to the speech service.
    pub frames_forwarded: u64,

    /// Caller audio frames dropped by the bounded pending queue.
    pub frames_dropped: u64,

    /// Speech-service reconnection attempts across all calls.
    pub reconnect_attempts: u64,

    /// Per-endpoint HTTP statistics, keyed by "METHOD /path".
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Request statistics for one API endpoint.
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
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Snapshot of the current configuration. Cloning releases the lock
    /// immediately so other threads are not blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record one HTTP request against its endpoint's statistics.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// A call entered the bridge; counted for both gauges.
    pub fn call_started(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_calls += 1;
        metrics.total_calls += 1;
    }

    /// A call left the bridge (hangup, idle teardown or abandonment).
    pub fn call_ended(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_calls > 0 {
            metrics.active_calls -= 1;
        }
    }

    pub fn record_frames_forwarded(&self, count: u64) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.frames_forwarded += count;
    }

    pub fn record_frames_dropped(&self, count: u64) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.frames_dropped += count;
    }

    pub fn record_reconnect_attempt(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.reconnect_attempts += 1;
    }

    /// Consistent copy of the metrics for the /metrics endpoint.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_calls: metrics.active_calls,
            total_calls: metrics.total_calls,
            frames_forwarded: metrics.frames_forwarded,
            frames_dropped: metrics.frames_dropped,
            reconnect_attempts: metrics.reconnect_attempts,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_gauges() {
        let state = AppState::new(AppConfig::default());
        state.call_started();
        state.call_started();
        state.call_ended();

        let snap = state.get_metrics_snapshot();
        assert_eq!(snap.active_calls, 1);
        assert_eq!(snap.total_calls, 2);

        // Decrement below zero is a no-op rather than an underflow.
        state.call_ended();
        state.call_ended();
        assert_eq!(state.get_metrics_snapshot().active_calls, 0);
    }

    #[test]
    fn test_frame_counters() {
        let state = AppState::new(AppConfig::default());
        state.record_frames_forwarded(100);
        state.record_frames_dropped(3);
        state.record_reconnect_attempt();

        let snap = state.get_metrics_snapshot();
        assert_eq!(snap.frames_forwarded, 100);
        assert_eq!(snap.frames_dropped, 3);
        assert_eq!(snap.reconnect_attempts, 1);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 5, false);
        state.record_endpoint_request("GET /health", 15, true);

        let snap = state.get_metrics_snapshot();
        let m = snap.endpoint_metrics.get("GET /health").unwrap();
        assert_eq!(m.request_count, 2);
        assert_eq!(m.error_count, 1);
        assert!((m.average_duration_ms() - 10.0).abs() < f64::EPSILON);
        assert!((m.error_rate() - 0.5).abs() < f64::EPSILON);
    }
}
