//! tiercache Observability
//!
//! Prometheus metrics for the tiered-storage cache layer.
//!
//! # Usage
//!
//! ```no_run
//! use tiercache_observability::{exporter, metrics};
//!
//! // Register every metric with the process registry
//! metrics::init();
//!
//! // Render the registry in the text exposition format
//! let body = exporter::gather_text().unwrap();
//! println!("{}", body);
//! ```

pub mod exporter;
pub mod metrics;

pub use exporter::gather_text;
pub use metrics::{init as init_metrics, REGISTRY};

/// Initialize all observability components
pub fn init() {
    metrics::init();
}
