use super::config::ConfigError;
use thiserror::Error;

/// Structural errors surfaced to the caller. Operational failures travel as
/// events, never as these.
#[derive(Error, Debug, PartialEq)]
pub enum FleetError {
    #[error("unknown server `{0}`")]
    UnknownServer(String),

    #[error("server `{0}` already exists")]
    DuplicateServer(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
