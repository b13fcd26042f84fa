//! Voice session runtime for Gemini Live.
//!
//! [`SessionTransport`] drives the session lifecycle over a [`LiveConnection`]
//! and the platform audio traits in [`devices`], and reports everything that
//! happens as [`SessionEvent`]s.

pub mod devices;
pub mod error;
pub mod live;
pub mod transport;
pub mod vad;

pub use devices::{
    AudioCapture, AudioDevice, AudioPlayback, CaptureStreams, DeviceKind, DeviceManager,
};
pub use error::TransportError;
pub use live::{ConnectionEvent, LiveConnection};
pub use transport::{
    AudioDevices, BOT_NAME, BotReadyData, Participant, SessionEvent, SessionState,
    SessionTransport, TransportConfig,
};
pub use vad::{VoiceActivityConfig, VoiceActivityGate, level_dbfs};
