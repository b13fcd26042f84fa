//! Client for the Gemini Live bidirectional streaming API.
//!
//! [`GeminiLiveConnection`] manages one websocket session: it sends the setup
//! handshake, streams PCM16 microphone audio, and reports server events
//! (setup complete, model audio, interruptions, transcripts) through async
//! callbacks. The JSON wire format lives in [`protocol`].

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;

pub use config::{
    API_VERSION, ConnectionConfig, DEFAULT_MODEL, GEMINI_LIVE_URL, INPUT_SAMPLE_RATE,
    OUTPUT_SAMPLE_RATE,
};
pub use connection::{
    Callback, ConnectionState, GeminiLiveConnection, RECEIVE_RETRY_DELAY, Transcript,
    TranscriptRole,
};
pub use error::{RealtimeError, RealtimeResult};
pub use protocol::{ClientContent, Content, GenerationConfig, ResponseModality, ServerEvent};
