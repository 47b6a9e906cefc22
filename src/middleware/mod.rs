pub mod metrics;

pub use metrics::request_metrics;
