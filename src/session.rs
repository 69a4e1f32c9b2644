//! The session-handle contract consumed by the core.
//!
//! The tool protocol itself lives outside this crate: the core holds an
//! opaque [`SessionHandle`] and only ever performs the handshake, liveness
//! pings and the final close. Handles are minted by an external
//! [`SessionFactory`] bound to a concrete [`Transport`].

use crate::command::runner::StdioPipes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("ping failed: {0}")]
    Ping(String),

    #[error("ping timed out after {0:?}")]
    PingTimeout(Duration),

    #[error("no active session")]
    NotConnected,

    #[error("close failed: {0}")]
    Close(String),
}

/// The transport a session is established over: the stdio pair of a live
/// child process, or an HTTP target.
pub enum Transport {
    Stdio {
        pid: u32,
        pipes: StdioPipes,
    },
    Http {
        url: url::Url,
        headers: HashMap<String, String>,
    },
}

/// An established-or-establishable protocol session.
///
/// On a failed [`handshake`](SessionHandle::handshake) the handle is safe to
/// discard without further cleanup. [`close`](SessionHandle::close) is
/// idempotent; the core logs and swallows its errors.
pub trait SessionHandle: Send + Sync {
    /// Performs the tool-protocol handshake; the session is usable only
    /// after this succeeds.
    fn handshake(&self) -> Result<(), SessionError>;

    /// Low-cost liveness probe. Must honour `timeout` and be safe to call
    /// concurrently with the session's ordinary traffic.
    fn ping(&self, timeout: Duration) -> Result<(), SessionError>;

    /// Releases all session resources.
    fn close(&self) -> Result<(), SessionError>;
}

/// External factory minting a [`SessionHandle`] for a transport.
pub trait SessionFactory: Send + Sync {
    fn create(&self, transport: Transport) -> Result<Arc<dyn SessionHandle>, SessionError>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        pub Session {}

        impl SessionHandle for Session {
            fn handshake(&self) -> Result<(), SessionError>;
            fn ping(&self, timeout: Duration) -> Result<(), SessionError>;
            fn close(&self) -> Result<(), SessionError>;
        }
    }
}
