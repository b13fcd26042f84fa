use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use gemini_realtime::{ConnectionConfig, GeminiLiveConnection, RealtimeResult, Transcript};
use tokio::sync::mpsc;
use tracing::debug;

/// Everything a live connection reports back, in receive order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    SetupComplete,
    ModelAudio(Bytes),
    Interrupted,
    TurnComplete,
    Transcript(Transcript),
    GoAway(Option<String>),
    Closed,
}

/// A realtime model connection as seen by the session transport.
#[async_trait]
pub trait LiveConnection: Send + Sync {
    fn configure(&self, config: ConnectionConfig);
    async fn connect(&self) -> RealtimeResult<()>;
    async fn disconnect(&self) -> RealtimeResult<()>;
    async fn send_user_audio(&self, audio: Bytes) -> RealtimeResult<()>;
    async fn send_end_of_turn(&self) -> RealtimeResult<()>;
    /// True while a socket is open; false again once it has been torn down.
    fn is_open(&self) -> bool;
    /// Routes every connection event into `events`.
    fn subscribe(&self, events: mpsc::UnboundedSender<ConnectionEvent>);
}

fn forward(
    events: mpsc::UnboundedSender<ConnectionEvent>,
    event: ConnectionEvent,
) -> impl Future<Output = ()> + Send + 'static {
    let delivered = events.send(event).is_ok();
    async move {
        if !delivered {
            debug!("Connection event dropped, no subscriber");
        }
    }
}

#[async_trait]
impl LiveConnection for GeminiLiveConnection {
    fn configure(&self, config: ConnectionConfig) {
        GeminiLiveConnection::configure(self, config)
    }

    async fn connect(&self) -> RealtimeResult<()> {
        GeminiLiveConnection::connect(self).await
    }

    async fn disconnect(&self) -> RealtimeResult<()> {
        GeminiLiveConnection::disconnect(self).await
    }

    async fn send_user_audio(&self, audio: Bytes) -> RealtimeResult<()> {
        GeminiLiveConnection::send_user_audio(self, audio).await
    }

    async fn send_end_of_turn(&self) -> RealtimeResult<()> {
        GeminiLiveConnection::send_end_of_turn(self).await
    }

    fn is_open(&self) -> bool {
        GeminiLiveConnection::is_open(self)
    }

    fn subscribe(&self, events: mpsc::UnboundedSender<ConnectionEvent>) {
        let tx = events.clone();
        self.on_setup_complete(move || forward(tx.clone(), ConnectionEvent::SetupComplete));
        let tx = events.clone();
        self.on_model_audio(move |audio| {
            forward(tx.clone(), ConnectionEvent::ModelAudio(audio))
        });
        let tx = events.clone();
        self.on_interrupted(move || forward(tx.clone(), ConnectionEvent::Interrupted));
        let tx = events.clone();
        self.on_turn_complete(move || forward(tx.clone(), ConnectionEvent::TurnComplete));
        let tx = events.clone();
        self.on_transcript(move |transcript| {
            forward(tx.clone(), ConnectionEvent::Transcript(transcript))
        });
        let tx = events.clone();
        self.on_go_away(move |time_left| {
            forward(tx.clone(), ConnectionEvent::GoAway(time_left))
        });
        let tx = events;
        self.on_closed(move || forward(tx.clone(), ConnectionEvent::Closed));
    }
}
