use serde::Serialize;
use std::fmt::Display;

/// Observable state of a managed server. The lifecycle is the only writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Disconnected,
    Connecting,
    Connected,
    Unhealthy,
    Restarting,
    Failed,
    Stopped,
}

impl Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            ServerStatus::Disconnected => "disconnected",
            ServerStatus::Connecting => "connecting",
            ServerStatus::Connected => "connected",
            ServerStatus::Unhealthy => "unhealthy",
            ServerStatus::Restarting => "restarting",
            ServerStatus::Failed => "failed",
            ServerStatus::Stopped => "stopped",
        };
        write!(f, "{status}")
    }
}

impl ServerStatus {
    /// The closed transition table. Anything not listed here is rejected by
    /// the lifecycle with a warning and leaves the state untouched.
    ///
    /// `stop` may be requested in any state, so every status can reach
    /// `Stopped`. `Restarting` is enterable from every status except
    /// `Stopped`: from `Connected` on a crash, from `Unhealthy` after the
    /// threshold crossing, from `Connecting` when a retry attempt fails with
    /// retries remaining, and from the quiescent states on a manual restart.
    /// `Failed` is reachable from an engaged state when a crash will not be
    /// retried.
    pub fn can_transition_to(self, to: ServerStatus) -> bool {
        use ServerStatus::*;
        if self == to {
            return false;
        }
        match to {
            Stopped => true,
            Restarting => self != Stopped,
            Connecting => matches!(self, Disconnected | Restarting | Failed | Stopped),
            Connected => matches!(self, Connecting | Unhealthy),
            Unhealthy => matches!(self, Connected),
            Failed => matches!(self, Connecting | Restarting | Connected | Unhealthy),
            Disconnected => matches!(self, Connected),
        }
    }

    /// Whether the server is answering traffic or at least holding a
    /// degraded session.
    pub fn is_engaged(self) -> bool {
        matches!(self, ServerStatus::Connected | ServerStatus::Unhealthy)
    }
}
