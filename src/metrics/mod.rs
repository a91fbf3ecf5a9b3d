//! Prometheus metrics for job processing.
//!
//! Metrics are rendered as text by [`export_metrics`]; serving them over
//! HTTP is left to the embedding application.
//!
//! ```ignore
//! use fold_forge::metrics::{init_metrics, export_metrics};
//!
//! init_metrics()?;
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOBS_TOTAL, QUEUE_DEPTH, REGISTRY, RETRIES_TOTAL,
    STAGE_DURATION,
};
