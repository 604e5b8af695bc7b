//! Live voice session core for a conversational assistant UI.
//!
//! Opens a full-duplex audio stream to a hosted model: microphone frames go
//! out as 16 kHz PCM16, model audio comes back at 24 kHz and is scheduled for
//! gapless playback, with server-initiated interruption (barge-in) and
//! deterministic teardown on every exit path.

pub mod capture;
pub mod channel;
pub mod chat;
pub mod codec;
pub mod config;
pub mod error;
pub mod playback;
pub mod session;

pub use config::LiveConfig;
pub use error::{Result, SessionError};
pub use session::{LiveSession, SessionController, SessionState};
