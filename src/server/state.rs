use super::status::ServerStatus;
use crate::command::runner::ProcessRunner;
use crate::health::HealthCheckResult;
use crate::http::endpoint::HttpEndpoint;
use crate::session::SessionHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// Restart accounting. `attempts` counts consecutive failed attempts in the
/// current restart loop and drops back to zero after a successful
/// (re)connect.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RestartStats {
    pub attempts: u32,
    pub last_attempt: Option<SystemTime>,
    pub last_success: Option<bool>,
}

/// The mutable record of one server, guarded by the lifecycle's lock so all
/// mutations are serialised.
pub(crate) struct ServerState {
    pub status: ServerStatus,
    pub status_changed_at: SystemTime,
    pub status_changed_instant: Instant,
    pub stop_requested: bool,
    pub pid: Option<u32>,
    pub runner: Option<ProcessRunner>,
    pub endpoint: Option<Arc<HttpEndpoint>>,
    pub session: Option<Arc<dyn SessionHandle>>,
    pub last_health_check: Option<HealthCheckResult>,
    pub consecutive_health_check_failures: u32,
    pub restart_stats: RestartStats,
    pub last_error: Option<String>,
    // Clamp source for per-server event timestamps.
    pub last_event_at: SystemTime,
    // Bumped on every transport materialisation; callbacks registered
    // against an older generation are stale and ignored.
    pub generation: u64,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            status: ServerStatus::Disconnected,
            status_changed_at: SystemTime::now(),
            status_changed_instant: Instant::now(),
            stop_requested: false,
            pid: None,
            runner: None,
            endpoint: None,
            session: None,
            last_health_check: None,
            consecutive_health_check_failures: 0,
            restart_stats: RestartStats::default(),
            last_error: None,
            last_event_at: SystemTime::UNIX_EPOCH,
            generation: 0,
        }
    }

    pub fn snapshot(&self) -> ServerStateSnapshot {
        ServerStateSnapshot {
            status: self.status,
            status_changed_at: self.status_changed_at,
            pid: self.pid,
            last_health_check: self.last_health_check.clone(),
            consecutive_health_check_failures: self.consecutive_health_check_failures,
            restart_stats: self.restart_stats.clone(),
            error: self.last_error.clone(),
        }
    }
}

/// A point-in-time copy of a server's observable state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStateSnapshot {
    pub status: ServerStatus,
    pub status_changed_at: SystemTime,
    pub pid: Option<u32>,
    pub last_health_check: Option<HealthCheckResult>,
    pub consecutive_health_check_failures: u32,
    pub restart_stats: RestartStats,
    pub error: Option<String>,
}
