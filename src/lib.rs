//! # server-control
//!
//! Lifecycle supervision for fleets of tool-protocol servers.
//!
//! A [`fleet::supervisor::FleetSupervisor`] owns a set of
//! [`server::lifecycle::ServerLifecycle`]s, one per subordinate server. Each
//! lifecycle brings its server up (spawning a child process or validating an
//! HTTP endpoint, then performing the protocol handshake through an external
//! [`session::SessionFactory`]), monitors liveness with periodic pings,
//! restarts crashed or unresponsive servers under exponential backoff, and
//! tears everything down under a bounded deadline. Every state transition is
//! published as a typed event on the supervisor's broadcast channels.

pub mod command;
pub mod context;
pub mod event;
pub mod fleet;
pub mod health;
pub mod http;
pub mod logging;
pub mod server;
pub mod session;
pub mod utils;
