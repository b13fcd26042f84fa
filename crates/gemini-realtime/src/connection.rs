//! The Gemini Live socket client.
//!
//! A [`GeminiLiveConnection`] owns at most one websocket at a time. `connect`
//! opens the socket and writes the handshake (setup plus initial context) in
//! order; only after that does a receive loop start and audio begin to flow.
//! Inbound frames are decoded one at a time and handed to the registered
//! callbacks, each awaited before the next frame is read.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{RealtimeError, RealtimeResult};
use crate::protocol::{self, ClientContent, ClientMessage, ServerEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Pause before reading again after a recoverable receive error.
pub const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Upper bound on the close handshake of a socket that stopped draining.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// An async listener for one kind of connection event.
pub type Callback<T> = Arc<dyn Fn(T) -> BoxFuture + Send + Sync>;

fn boxed<T, F, Fut>(callback: F) -> Callback<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |arg| Box::pin(callback(arg)) as BoxFuture)
}

/// Lifecycle of the underlying socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Unconfigured,
    Configured,
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unconfigured => write!(f, "Unconfigured"),
            ConnectionState::Configured => write!(f, "Configured"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRole {
    User,
    Model,
}

/// Text of what the user or the model said, as transcribed by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub role: TranscriptRole,
    pub text: String,
}

#[derive(Default, Clone)]
struct Callbacks {
    setup_complete: Option<Callback<()>>,
    model_audio: Option<Callback<Bytes>>,
    interrupted: Option<Callback<()>>,
    turn_complete: Option<Callback<()>>,
    transcript: Option<Callback<Transcript>>,
    go_away: Option<Callback<Option<String>>>,
    closed: Option<Callback<()>>,
}

async fn invoke<T>(callback: &Option<Callback<T>>, arg: T) {
    if let Some(callback) = callback {
        callback(arg).await;
    }
}

struct Shared {
    config: Mutex<Option<ConnectionConfig>>,
    state: RwLock<ConnectionState>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    handshake_complete: AtomicBool,
    cancel: Mutex<CancellationToken>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    callbacks: RwLock<Callbacks>,
}

/// Client for one Gemini Live session at a time.
pub struct GeminiLiveConnection {
    shared: Arc<Shared>,
}

impl Default for GeminiLiveConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiLiveConnection {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                config: Mutex::new(None),
                state: RwLock::new(ConnectionState::Unconfigured),
                sink: tokio::sync::Mutex::new(None),
                handshake_complete: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                receive_task: Mutex::new(None),
                callbacks: RwLock::new(Callbacks::default()),
            }),
        }
    }

    /// Stores the configuration used by the next `connect`. Last call wins.
    pub fn configure(&self, config: ConnectionConfig) {
        let mut state = self.shared.state.write();
        *self.shared.config.lock() = Some(config);
        if matches!(
            *state,
            ConnectionState::Unconfigured | ConnectionState::Closed
        ) {
            *state = ConnectionState::Configured;
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// True once the handshake has been written and until the socket closes.
    pub fn handshake_complete(&self) -> bool {
        self.shared.handshake_complete.load(Ordering::Acquire)
    }

    /// Opens the socket and sends the handshake.
    ///
    /// Returning `Ok` means the setup and initial messages were written, not
    /// that the server accepted them; `on_setup_complete` reports that.
    pub async fn connect(&self) -> RealtimeResult<()> {
        let (config, cancel) = self.begin_connect()?;
        match self.handshake(&config, &cancel).await {
            Ok(source) => {
                // Held until the task handle is stored so `disconnect` sees both.
                let mut state = self.shared.state.write();
                self.shared.handshake_complete.store(true, Ordering::Release);
                *state = ConnectionState::Open;
                let task = tokio::spawn(receive_loop(self.shared.clone(), source, cancel));
                *self.shared.receive_task.lock() = Some(task);
                drop(state);
                info!(model = %config.model, "Gemini Live handshake sent");
                Ok(())
            }
            Err(e) => {
                let err = if cancel.is_cancelled() {
                    RealtimeError::Cancelled
                } else {
                    e
                };
                warn!(error = %err, "Gemini Live connect failed");
                self.shared.abort_handshake().await;
                Err(err)
            }
        }
    }

    fn begin_connect(&self) -> RealtimeResult<(ConnectionConfig, CancellationToken)> {
        let mut state = self.shared.state.write();
        match *state {
            ConnectionState::Unconfigured => return Err(RealtimeError::NotConfigured),
            ConnectionState::Connecting | ConnectionState::Open => {
                return Err(RealtimeError::AlreadyConnecting);
            }
            ConnectionState::Configured | ConnectionState::Closed => {}
        }
        let config = self
            .shared
            .config
            .lock()
            .clone()
            .ok_or(RealtimeError::NotConfigured)?;
        let cancel = CancellationToken::new();
        *self.shared.cancel.lock() = cancel.clone();
        *state = ConnectionState::Connecting;
        Ok((config, cancel))
    }

    async fn handshake(
        &self,
        config: &ConnectionConfig,
        cancel: &CancellationToken,
    ) -> RealtimeResult<WsSource> {
        let url = config.endpoint_url()?;
        info!(model = %config.model, "Connecting to Gemini Live");

        let (ws_stream, _response) = tokio::select! {
            _ = cancel.cancelled() => return Err(RealtimeError::Cancelled),
            result = tokio_tungstenite::connect_async(url.as_str()) => {
                result.map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?
            }
        };
        let (sink, source) = ws_stream.split();
        *self.shared.sink.lock().await = Some(sink);

        self.send_handshake_frame(&ClientMessage::Setup(config.setup()), cancel)
            .await?;
        debug!("Sent setup message");

        for (index, content) in config.initial_messages.iter().enumerate() {
            self.send_handshake_frame(&ClientMessage::ClientContent(content.clone()), cancel)
                .await?;
            debug!(index, "Sent initial context message");
        }

        if cancel.is_cancelled() {
            return Err(RealtimeError::Cancelled);
        }
        Ok(source)
    }

    /// A write blocked on a peer that stopped reading still yields to `disconnect`.
    async fn send_handshake_frame(
        &self,
        message: &ClientMessage,
        cancel: &CancellationToken,
    ) -> RealtimeResult<()> {
        if cancel.is_cancelled() {
            return Err(RealtimeError::Cancelled);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(RealtimeError::Cancelled),
            result = self.shared.send(message) => result,
        }
    }

    /// Sends one chunk of PCM16 microphone audio.
    ///
    /// Audio offered before the handshake has been written is dropped.
    pub async fn send_user_audio(&self, audio: Bytes) -> RealtimeResult<()> {
        if !self.accepting_input()? {
            return Ok(());
        }
        self.shared.send(&ClientMessage::audio(&audio)).await
    }

    /// Tells the service the user finished speaking.
    pub async fn send_end_of_turn(&self) -> RealtimeResult<()> {
        if !self.accepting_input()? {
            return Ok(());
        }
        debug!("Sending end of turn");
        self.shared.send(&ClientMessage::audio_stream_end()).await
    }

    /// Sends a text turn on an open session.
    pub async fn send_client_content(&self, content: ClientContent) -> RealtimeResult<()> {
        if !self.accepting_input()? {
            return Err(RealtimeError::NotConnected);
        }
        self.shared
            .send(&ClientMessage::ClientContent(content))
            .await
    }

    fn accepting_input(&self) -> RealtimeResult<bool> {
        if self.state() == ConnectionState::Unconfigured {
            return Err(RealtimeError::NotConfigured);
        }
        Ok(self.handshake_complete())
    }

    /// Closes the socket, or cancels a connect in flight. No-op without one.
    ///
    /// A cancelled connect releases its own socket and returns `Cancelled`.
    /// Teardown of an open socket runs on the receive loop, which fires
    /// `on_closed`; this waits for it, so it must not be called from a callback.
    pub async fn disconnect(&self) -> RealtimeResult<()> {
        match self.state() {
            ConnectionState::Open => {}
            ConnectionState::Connecting => {
                info!("Cancelling Gemini Live connect");
                self.shared.cancel.lock().cancel();
                return Ok(());
            }
            _ => {
                debug!("Disconnect requested with no active socket");
                return Ok(());
            }
        }
        info!("Disconnecting from Gemini Live");
        self.shared.cancel.lock().cancel();
        if let Some(sink) = self.shared.sink.lock().await.as_mut() {
            if let Err(e) = sink.send(Message::Close(None)).await {
                debug!(error = %e, "Close frame not sent");
            }
        }
        let receive_task = self.shared.receive_task.lock().take();
        if let Some(task) = receive_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Receive loop ended abnormally");
            }
        }
        Ok(())
    }

    pub fn on_setup_complete<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared.callbacks.write().setup_complete = Some(boxed(move |()| callback()));
    }

    pub fn on_model_audio<F, Fut>(&self, callback: F)
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared.callbacks.write().model_audio = Some(boxed(callback));
    }

    pub fn on_interrupted<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared.callbacks.write().interrupted = Some(boxed(move |()| callback()));
    }

    pub fn on_turn_complete<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared.callbacks.write().turn_complete = Some(boxed(move |()| callback()));
    }

    pub fn on_transcript<F, Fut>(&self, callback: F)
    where
        F: Fn(Transcript) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared.callbacks.write().transcript = Some(boxed(callback));
    }

    /// Called with the server's remaining-time hint before it drops the session.
    pub fn on_go_away<F, Fut>(&self, callback: F)
    where
        F: Fn(Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared.callbacks.write().go_away = Some(boxed(callback));
    }

    pub fn on_closed<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared.callbacks.write().closed = Some(boxed(move |()| callback()));
    }
}

impl Drop for GeminiLiveConnection {
    fn drop(&mut self) {
        self.shared.cancel.lock().cancel();
    }
}

impl Shared {
    async fn send(&self, message: &ClientMessage) -> RealtimeResult<()> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(RealtimeError::NotConnected)?;
        sink.send(Message::Text(message.encode())).await?;
        Ok(())
    }

    async fn abort_handshake(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(sink) = sink {
            close_sink(sink).await;
        }
        self.handshake_complete.store(false, Ordering::Release);
        *self.state.write() = ConnectionState::Closed;
    }

    /// The only place a live socket is released.
    async fn teardown(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(sink) = sink {
            close_sink(sink).await;
        }
        self.handshake_complete.store(false, Ordering::Release);
        *self.state.write() = ConnectionState::Closed;
        info!("Gemini Live connection closed");

        let closed = self.callbacks.read().closed.clone();
        invoke(&closed, ()).await;
    }

    async fn handle_frame(&self, text: &str) {
        match protocol::decode(text) {
            Some(event) => self.dispatch(event).await,
            None => debug!(len = text.len(), "Ignoring unrecognised server frame"),
        }
    }

    async fn dispatch(&self, event: ServerEvent) {
        let callbacks = self.callbacks.read().clone();
        match event {
            ServerEvent::SetupComplete => {
                info!("Gemini Live setup complete");
                invoke(&callbacks.setup_complete, ()).await;
            }
            ServerEvent::Interrupted => {
                debug!("Model turn interrupted");
                invoke(&callbacks.interrupted, ()).await;
            }
            ServerEvent::AudioOutput(audio) => invoke(&callbacks.model_audio, audio).await,
            ServerEvent::TurnComplete => invoke(&callbacks.turn_complete, ()).await,
            ServerEvent::InputTranscription(text) => {
                let transcript = Transcript {
                    role: TranscriptRole::User,
                    text,
                };
                invoke(&callbacks.transcript, transcript).await;
            }
            ServerEvent::OutputTranscription(text) => {
                let transcript = Transcript {
                    role: TranscriptRole::Model,
                    text,
                };
                invoke(&callbacks.transcript, transcript).await;
            }
            ServerEvent::GoAway { time_left } => {
                warn!(?time_left, "Gemini Live announced it will disconnect");
                invoke(&callbacks.go_away, time_left).await;
            }
        }
    }
}

async fn close_sink(mut sink: WsSink) {
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Socket already closed"),
        Err(_) => debug!("Close handshake timed out, dropping socket"),
    }
}

/// Errors after which the stream cannot yield another frame.
fn is_terminal(error: &tungstenite::Error) -> bool {
    matches!(
        error,
        tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Io(_)
    )
}

async fn receive_loop(shared: Arc<Shared>, mut source: WsSource, cancel: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Receive loop cancelled");
                break;
            }
            frame = source.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => shared.handle_frame(&text).await,
            // The service sends its JSON in binary frames as often as text ones.
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => shared.handle_frame(text).await,
                Err(_) => debug!(len = data.len(), "Ignoring non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Ping(payload))) => {
                if let Some(sink) = shared.sink.lock().await.as_mut() {
                    if let Err(e) = sink.send(Message::Pong(payload)).await {
                        warn!(error = %e, "Failed to answer ping");
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => {
                info!(?frame, "Gemini Live closed the connection");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                if shared.sink.lock().await.is_none() {
                    debug!(error = %e, "Read error after socket release");
                    break;
                }
                if is_terminal(&e) {
                    warn!(error = %e, "Gemini Live connection lost");
                    break;
                }
                warn!(error = %e, "Error reading from Gemini Live, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => {}
                }
            }
            None => {
                info!("Gemini Live stream ended");
                break;
            }
        }
    }
    shared.teardown().await;
}
