//! HTTP surface: decision endpoint, health check and metrics.

mod metrics;
mod server;
mod service;

pub use metrics::{Metrics, DECISION_ALLOW, DECISION_DENY};
pub use server::HttpServer;
pub use service::{router, AppState, DecisionBody, REMAINING_HEADER, RESET_HEADER};
