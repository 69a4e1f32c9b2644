use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("`{0}` not piped")]
    StreamPipe(&'static str),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("signal error: {0}")]
    Signal(String),
}
