use crate::capture::CaptureError;
use crate::codec::DecodeError;
use crate::config::ConfigError;
use crate::playback::PlaybackError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Session-level failures, by how they are handled:
///
/// - `Acquisition` and `Handshake` are fatal to a connect attempt; the
///   session returns to idle and the message is surfaced to the user.
/// - `Transport` is fatal mid-session; full teardown, no automatic reconnect.
/// - `Decode` is recoverable; the offending chunk is dropped and the session
///   continues. A playback underrun is not an error at all; the scheduler
///   self-corrects.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Device acquisition failed: {0}")]
    Acquisition(String),

    #[error("Channel handshake failed: {0}")]
    Handshake(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Audio decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        SessionError::Acquisition(err.to_string())
    }
}

impl From<PlaybackError> for SessionError {
    fn from(err: PlaybackError) -> Self {
        SessionError::Acquisition(err.to_string())
    }
}
