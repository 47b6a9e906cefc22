//! # Application State Management
//!
//! Shared state that every HTTP request handler and middleware can reach.
//!
//! ## What lives here:
//! - **config**: The loaded configuration (read-only after startup)
//! - **metrics**: Per-endpoint request counters, updated by the metrics middleware
//! - **start_time**: For uptime reporting
//!
//! The broker bridge is NOT part of this struct. It is registered separately as
//! `web::Data<RpcBridge>` so handlers that talk to the worker declare it in their
//! signature.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: Multiple ownership (every worker thread's App holds a clone)
//! - **RwLock**: Many readers OR one writer
//! - Locks are held only long enough to copy or bump a counter

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
}

/// Request metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of 4xx/5xx responses since server start
    pub error_count: u64,

    /// Key: endpoint name (e.g., "POST /transcribe/process")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// How a finished request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Ok,
    /// 4xx: the caller sent something unusable
    Rejected,
    /// 502/503/504: the worker or the broker failed the call
    Upstream,
    /// Any other 5xx
    Failed,
}

impl RequestOutcome {
    pub fn is_error(self) -> bool {
        self != RequestOutcome::Ok
    }
}

/// ## Performance calculations:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
    /// Subset of `error_count` caused by the worker or broker
    pub upstream_error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    /// Record one finished request against its endpoint and the overall totals.
    ///
    /// ## Parameters:
    /// - **endpoint**: Method and route pattern (e.g., "GET /transcribe/health")
    /// - **duration_ms**: How long the request took to process (in milliseconds)
    /// - **outcome**: How the request ended, as classified by the metrics middleware
    pub fn record_request(&self, endpoint: &str, duration_ms: u64, outcome: RequestOutcome) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
        if outcome.is_error() {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        match outcome {
            RequestOutcome::Ok => {}
            RequestOutcome::Rejected | RequestOutcome::Failed => endpoint_metric.error_count += 1,
            RequestOutcome::Upstream => {
                endpoint_metric.error_count += 1;
                endpoint_metric.upstream_error_count += 1;
            }
        }
    }

    /// Copy of the current metrics, so no lock is held while serializing a response.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
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

    /// Error rate as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
