//! # Application State Management
//!
//! Shared state accessed by every HTTP request handler and WebSocket session
//! simultaneously.
//!
//! ## The Arc<RwLock<T>> Pattern:
//! - **Arc**: multiple owners (every handler holds a reference)
//! - **RwLock**: many readers OR one writer at a time
//! - **T**: the data being protected
//!
//! The model lifecycle manager and the session registry are deliberately NOT
//! wrapped again here: they carry their own internal locking and are shared
//! as plain `Arc` handles. There is exactly one of each for the whole
//! process, constructed here at startup, so no ambient globals exist
//! anywhere.

use crate::config::AppConfig;
use crate::model::lifecycle::ModelLifecycle;
use crate::model::whisper::WhisperLoader;
use crate::session::registry::SessionRegistry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// The state every request handler can reach.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (updatable at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics, updated by middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started (immutable, safe to share directly)
    pub start_time: Instant,

    /// The registry of live WebSocket sessions
    pub registry: Arc<SessionRegistry>,

    /// The one model lifecycle manager for the whole process
    pub lifecycle: Arc<ModelLifecycle>,
}

/// Counters collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total HTTP requests processed since startup
    pub request_count: u64,

    /// Total errored requests since startup
    pub error_count: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Statistics for a single endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build the process-wide state from validated configuration.
    ///
    /// Wires the dependency chain once: the Whisper loader reads the shared
    /// config at each load, the lifecycle manager broadcasts through the
    /// session registry, and everything downstream receives these same
    /// handles.
    pub fn new(config: AppConfig) -> Self {
        let idle_timeout = Duration::from_secs(config.lifecycle.idle_timeout_secs);
        let config = Arc::new(RwLock::new(config));
        let registry = Arc::new(SessionRegistry::new());
        let loader = Arc::new(WhisperLoader::new(Arc::clone(&config)));
        let lifecycle = Arc::new(ModelLifecycle::new(
            loader,
            Arc::clone(&registry),
            idle_timeout,
        ));

        Self {
            config,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            registry,
            lifecycle,
        }
    }

    /// Copy of the current configuration. Cloning releases the lock
    /// immediately so other threads are never blocked on a caller.
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
            Err(err) => Err(err.to_string()),
        }
    }

    /// Called by middleware for every incoming request.
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    /// Called by middleware when a request ends in an error response.
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record timing for one request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Consistent copy of the metrics for the reporting endpoints. Cloned so
    /// no lock is held while the HTTP response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate as a fraction (0.0 to 1.0).
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
    fn test_state_construction() {
        let state = AppState::new(AppConfig::default());
        assert_eq!(state.get_config().server.port, 8765);
        assert!(state.registry.is_empty());
        assert_eq!(state.get_metrics_snapshot().request_count, 0);
    }

    #[test]
    fn test_update_config_rejects_invalid() {
        let state = AppState::new(AppConfig::default());
        let mut bad = AppConfig::default();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());
        // Original config untouched
        assert_eq!(state.get_config().server.port, 8765);
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = snapshot.endpoint_metrics.get("GET /health").unwrap();
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }
}
