//! Tower middleware around the generic handler.
//!
//! - [`timeout`]: Optional per-call handler timeout
//! - [`metrics`]: Call timing and outcome via `tracing` spans
//! - [`pipeline`]: Composes the layers over a `HandlerService`

pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use metrics::MetricsLayer;
pub use pipeline::{build_call_pipeline, CallPipeline, HandlerService};
pub use timeout::TimeoutLayer;
