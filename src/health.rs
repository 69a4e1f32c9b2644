//! Periodic liveness inspection of a session handle.

pub mod monitor;

use serde::Serialize;
use std::time::{Duration, SystemTime};

/// The outcome of one liveness probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub latency: Duration,
    pub error: Option<String>,
    pub timestamp: SystemTime,
}

impl HealthCheckResult {
    pub fn latency_ms(&self) -> u64 {
        self.latency.as_millis() as u64
    }
}

/// Probe timestamps differ between otherwise identical results, so equality
/// ignores them.
impl PartialEq for HealthCheckResult {
    fn eq(&self, other: &Self) -> bool {
        let Self {
            healthy,
            latency: _,
            error,
            timestamp: _,
        } = self;
        *healthy == other.healthy && *error == other.error
    }
}
