use thiserror::Error;

/// Failure kinds surfaced by the core. Nothing here crosses the public API
/// as a panic; every error ends up on the event surface as a log entry plus
/// a status or call-state transition.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("media error: {0}")]
    Media(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
