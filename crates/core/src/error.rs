use gemini_realtime::RealtimeError;
use thiserror::Error;

use crate::transport::SessionState;

/// Errors returned by [`SessionTransport`](crate::SessionTransport) operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Realtime(#[from] RealtimeError),

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),

    #[error("Cannot {op} while {state}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },
}

impl TransportError {
    pub(crate) fn device(err: anyhow::Error) -> Self {
        TransportError::Device(format!("{:#}", err))
    }
}
