//! Logging setup and the Prometheus registry.

mod metrics;
mod tracing;

pub use self::tracing::{init_tracing, DEFAULT_LOG_FILTER};
pub use metrics::{MetricsContext, MetricsServerConfig};
