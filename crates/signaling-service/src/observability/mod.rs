//! Observability for the signaling service.
//!
//! - [`health`]: liveness and readiness probes
//! - [`metrics`]: Prometheus metrics (`sig_` prefix)

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
