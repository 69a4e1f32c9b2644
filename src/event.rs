//! Typed events emitted by server lifecycles and the fleet supervisor.
//!
//! Each channel is a closed variant set delivered through the bounded
//! broadcast bus; subscribers register for the whole channel or for a subset
//! of event kinds.

pub mod broadcaster;
pub mod cancellation;
pub mod channel;

use crate::event::broadcaster::bounded::BroadcastEvent;
use crate::fleet::supervisor::ServerSummary;
use crate::fleet::ServerId;
use crate::health::HealthCheckResult;
use crate::server::status::ServerStatus;
use std::fmt::Display;
use std::time::SystemTime;

/// Why a restart loop was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    Crashed,
    Unhealthy,
    Manual,
}

impl Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            RestartReason::Crashed => "crashed",
            RestartReason::Unhealthy => "unhealthy",
            RestartReason::Manual => "manual",
        };
        write!(f, "{reason}")
    }
}

/// An event on the lifecycle channel of a single server.
///
/// Timestamps are clamped per server so they never decrease, even across a
/// backwards wall-clock step.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    pub server: ServerId,
    pub timestamp: SystemTime,
    pub detail: ServerEventDetail,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEventDetail {
    Connecting,
    Connected {
        pid: Option<u32>,
    },
    ConnectionFailed {
        error: String,
    },
    Healthy {
        check: HealthCheckResult,
    },
    Unhealthy {
        consecutive_failures: u32,
        last_check: Option<HealthCheckResult>,
    },
    Crashed {
        exit_code: Option<i32>,
        signal: Option<String>,
        will_restart: bool,
    },
    Restarting {
        attempt: u32,
        max_attempts: u32,
        reason: RestartReason,
    },
    RestartSucceeded {
        attempts: u32,
        pid: Option<u32>,
    },
    RestartFailed {
        attempts: u32,
        error: String,
    },
    StatusChanged {
        previous: ServerStatus,
        new: ServerStatus,
    },
    Stopped {
        graceful: bool,
    },
}

/// Fieldless discriminants of [`ServerEventDetail`], used for subscription
/// filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    Connecting,
    Connected,
    ConnectionFailed,
    Healthy,
    Unhealthy,
    Crashed,
    Restarting,
    RestartSucceeded,
    RestartFailed,
    StatusChanged,
    Stopped,
}

impl ServerEventDetail {
    pub fn kind(&self) -> ServerEventKind {
        match self {
            ServerEventDetail::Connecting => ServerEventKind::Connecting,
            ServerEventDetail::Connected { .. } => ServerEventKind::Connected,
            ServerEventDetail::ConnectionFailed { .. } => ServerEventKind::ConnectionFailed,
            ServerEventDetail::Healthy { .. } => ServerEventKind::Healthy,
            ServerEventDetail::Unhealthy { .. } => ServerEventKind::Unhealthy,
            ServerEventDetail::Crashed { .. } => ServerEventKind::Crashed,
            ServerEventDetail::Restarting { .. } => ServerEventKind::Restarting,
            ServerEventDetail::RestartSucceeded { .. } => ServerEventKind::RestartSucceeded,
            ServerEventDetail::RestartFailed { .. } => ServerEventKind::RestartFailed,
            ServerEventDetail::StatusChanged { .. } => ServerEventKind::StatusChanged,
            ServerEventDetail::Stopped { .. } => ServerEventKind::Stopped,
        }
    }
}

impl BroadcastEvent for ServerEvent {
    type Kind = ServerEventKind;

    fn kind(&self) -> Self::Kind {
        self.detail.kind()
    }
}

/// An event on the fleet channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    Ready {
        server_count: usize,
        timestamp: SystemTime,
    },
    Shutdown {
        graceful: bool,
        timestamp: SystemTime,
    },
    StateSnapshot {
        servers: Vec<ServerSummary>,
        timestamp: SystemTime,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FleetEventKind {
    Ready,
    Shutdown,
    StateSnapshot,
}

impl BroadcastEvent for FleetEvent {
    type Kind = FleetEventKind;

    fn kind(&self) -> Self::Kind {
        match self {
            FleetEvent::Ready { .. } => FleetEventKind::Ready,
            FleetEvent::Shutdown { .. } => FleetEventKind::Shutdown,
            FleetEvent::StateSnapshot { .. } => FleetEventKind::StateSnapshot,
        }
    }
}
