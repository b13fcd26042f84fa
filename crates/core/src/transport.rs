//! Session transport: the lifecycle that ties a live model connection to the
//! local microphone and speaker.
//!
//! All state changes go through [`Inner::transition`], which validates the edge
//! and emits the matching [`SessionEvent`]s while holding the session lock, so
//! observers always see events in the order the transitions happened.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use gemini_realtime::{API_VERSION, ConnectionConfig, RealtimeError, TranscriptRole};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::devices::{
    AudioCapture, AudioDevice, AudioPlayback, DeviceKind, DeviceManager, devices_of_kind,
    select_device,
};
use crate::error::TransportError;
use crate::live::{ConnectionEvent, LiveConnection};
use crate::vad::{VoiceActivityConfig, VoiceActivityGate};

pub type Result<T> = std::result::Result<T, TransportError>;

/// Display name of the remote participant.
pub const BOT_NAME: &str = "Gemini";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Initializing,
    Initialized,
    Connecting,
    Connected,
    Ready,
    Disconnecting,
}

impl SessionState {
    fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Connected | SessionState::Ready
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Initializing => "initializing",
            SessionState::Initialized => "initialized",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Ready => "ready",
            SessionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// The model, as a remote participant of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: Uuid,
    pub name: String,
    pub local: bool,
}

impl Participant {
    fn bot() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: BOT_NAME.to_string(),
            local: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotReadyData {
    pub version: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Connected,
    Disconnected,
    ParticipantJoined(Participant),
    ParticipantLeft(Participant),
    BotConnected(Participant),
    BotReady(BotReadyData),
    BotDisconnected(Participant),
    UserStartedSpeaking,
    UserStoppedSpeaking,
    BotStartedSpeaking,
    BotStoppedSpeaking,
    AvailableMicsUpdated(Vec<AudioDevice>),
    AvailableSpeakersUpdated(Vec<AudioDevice>),
    MicUpdated(Option<AudioDevice>),
    SpeakerUpdated(Option<AudioDevice>),
    UserTranscript(String),
    BotTranscript(String),
    /// The server will close the connection soon; carries its `timeLeft`.
    ServerGoAway(Option<String>),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connection: ConnectionConfig,
    pub voice_activity: VoiceActivityConfig,
    pub enable_mic: bool,
    pub preferred_mic: Option<String>,
    pub preferred_speaker: Option<String>,
}

impl TransportConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            voice_activity: VoiceActivityConfig::default(),
            enable_mic: true,
            preferred_mic: None,
            preferred_speaker: None,
        }
    }
}

/// Platform audio collaborators.
#[derive(Clone)]
pub struct AudioDevices {
    pub capture: Arc<dyn AudioCapture>,
    pub playback: Arc<dyn AudioPlayback>,
    pub manager: Arc<dyn DeviceManager>,
}

struct Session {
    state: SessionState,
    participant: Option<Participant>,
    bot_speaking: bool,
    devices_initialized: bool,
    mic_enabled: bool,
    model: String,
    preferred_mic: Option<String>,
    preferred_speaker: Option<String>,
    mics: Vec<AudioDevice>,
    speakers: Vec<AudioDevice>,
    selected_mic: Option<AudioDevice>,
    selected_speaker: Option<AudioDevice>,
    /// Owned by the connect attempt or live session; cancelled on `Disconnecting`.
    connect_token: Option<CancellationToken>,
}

struct Inner {
    connection: Arc<dyn LiveConnection>,
    devices: AudioDevices,
    voice_activity: VoiceActivityConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    session: Mutex<Session>,
    connection_config: Mutex<ConnectionConfig>,
    connection_events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    capture_tasks: Mutex<JoinSet<()>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Client-side session over a [`LiveConnection`].
///
/// Cheap to clone; clones share one session. Events are delivered on the
/// receiver returned by [`SessionTransport::new`].
#[derive(Clone)]
pub struct SessionTransport {
    inner: Arc<Inner>,
}

fn transition_allowed(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    matches!(
        (from, to),
        (Disconnected, Initializing)
            | (Initializing, Initialized)
            | (Disconnected | Initialized, Connecting)
            | (Connecting, Connected)
            | (Connecting | Connected, Ready)
            | (Connecting | Connected | Ready, Disconnecting)
            | (Disconnecting, Disconnected)
    )
}

impl SessionTransport {
    pub fn new(
        connection: Arc<dyn LiveConnection>,
        devices: AudioDevices,
        config: TransportConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        connection.subscribe(connection_tx);

        let session = Session {
            state: SessionState::Disconnected,
            participant: None,
            bot_speaking: false,
            devices_initialized: false,
            mic_enabled: config.enable_mic,
            model: config.connection.model.clone(),
            preferred_mic: config.preferred_mic,
            preferred_speaker: config.preferred_speaker,
            mics: Vec::new(),
            speakers: Vec::new(),
            selected_mic: None,
            selected_speaker: None,
            connect_token: None,
        };
        let inner = Inner {
            connection,
            devices,
            voice_activity: config.voice_activity,
            events,
            session: Mutex::new(session),
            connection_config: Mutex::new(config.connection),
            connection_events: Mutex::new(Some(connection_rx)),
            capture_tasks: Mutex::new(JoinSet::new()),
            background: Mutex::new(Vec::new()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.lock().state
    }

    /// The bot participant, present from `Connected`/`Ready` until disconnect.
    pub fn participant(&self) -> Option<Participant> {
        self.inner.session.lock().participant.clone()
    }

    pub fn is_mic_enabled(&self) -> bool {
        self.inner.session.lock().mic_enabled
    }

    pub fn available_mics(&self) -> Vec<AudioDevice> {
        self.inner.session.lock().mics.clone()
    }

    pub fn available_speakers(&self) -> Vec<AudioDevice> {
        self.inner.session.lock().speakers.clone()
    }

    pub fn selected_mic(&self) -> Option<AudioDevice> {
        self.inner.session.lock().selected_mic.clone()
    }

    pub fn selected_speaker(&self) -> Option<AudioDevice> {
        self.inner.session.lock().selected_speaker.clone()
    }

    /// Replaces the connection settings used by the next [`connect`](Self::connect).
    pub fn configure(&self, config: ConnectionConfig) {
        *self.inner.connection_config.lock() = config;
    }

    /// Enumerates devices, reports them and starts following device changes.
    ///
    /// Does nothing once devices have been initialized.
    pub async fn init_devices(&self) -> Result<()> {
        {
            let session = self.inner.session.lock();
            if session.devices_initialized {
                return Ok(());
            }
            if session.state != SessionState::Disconnected {
                return Err(TransportError::InvalidState {
                    op: "initialize devices",
                    state: session.state,
                });
            }
        }
        if !self.inner.transition(SessionState::Initializing) {
            return Err(TransportError::InvalidState {
                op: "initialize devices",
                state: self.state(),
            });
        }

        let mut devices = self.inner.devices.manager.devices();
        let snapshot = devices.borrow_and_update().clone();
        self.inner.apply_device_list(&snapshot, true);
        self.inner.session.lock().devices_initialized = true;
        self.inner.transition(SessionState::Initialized);

        let watcher = tokio::spawn(watch_devices(Arc::downgrade(&self.inner), devices));
        self.inner.background.lock().push(watcher);
        Ok(())
    }

    /// Opens the session: starts local audio, then the live connection.
    ///
    /// Devices are initialized first when needed. Returns once the connection
    /// handshake is done; `Ready` follows when the server confirms setup.
    pub async fn connect(&self) -> Result<()> {
        let needs_devices = {
            let session = self.inner.session.lock();
            match session.state {
                SessionState::Disconnected | SessionState::Initialized => {
                    !session.devices_initialized
                }
                state => return Err(TransportError::InvalidState { op: "connect", state }),
            }
        };
        if needs_devices {
            self.init_devices().await?;
        }
        self.inner.ensure_dispatcher();

        let config = self.inner.connection_config.lock().clone();
        let (mic, speaker, mic_enabled) = {
            let mut session = self.inner.session.lock();
            session.model = config.model.clone();
            (
                session.selected_mic.as_ref().map(|d| d.id.clone()),
                session.selected_speaker.as_ref().map(|d| d.id.clone()),
                session.mic_enabled,
            )
        };
        self.inner.connection.configure(config);
        let Some(token) = self.inner.begin_connect() else {
            return Err(TransportError::InvalidState {
                op: "connect",
                state: self.state(),
            });
        };

        let opened = self
            .inner
            .open_session(&token, mic, speaker, mic_enabled)
            .await;
        if token.is_cancelled() {
            info!("Connect overtaken by disconnect");
            self.inner.release_cancelled_start().await;
            return Err(opened
                .err()
                .unwrap_or_else(|| RealtimeError::Cancelled.into()));
        }
        if let Err(e) = opened {
            self.inner.fail_connect(&e).await;
            return Err(e);
        }

        self.inner.transition(SessionState::Connected);
        match self.state() {
            // A close that landed while still connecting was not acted on.
            SessionState::Connected | SessionState::Ready
                if !self.inner.connection.is_open() =>
            {
                let e = TransportError::from(RealtimeError::ConnectionFailed(
                    "connection closed during setup".to_string(),
                ));
                self.inner.fail_connect(&e).await;
                Err(e)
            }
            SessionState::Connected | SessionState::Ready => Ok(()),
            _ => Err(RealtimeError::Cancelled.into()),
        }
    }

    /// Closes the session. Does nothing unless connecting or connected.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.inner.transition(SessionState::Disconnecting) {
            debug!(state = %self.state(), "Disconnect ignored");
            return Ok(());
        }
        self.inner.close_session().await;
        Ok(())
    }

    /// Turns microphone capture on or off, now if live, otherwise for the next connect.
    pub async fn enable_mic(&self, enable: bool) -> Result<()> {
        let (changed, live, mic) = {
            let mut session = self.inner.session.lock();
            let changed = session.mic_enabled != enable;
            session.mic_enabled = enable;
            (
                changed,
                session.state.is_live(),
                session.selected_mic.as_ref().map(|d| d.id.clone()),
            )
        };
        if !changed || !live {
            return Ok(());
        }
        if enable {
            self.inner.start_capture(mic).await
        } else {
            self.inner.stop_capture().await;
            Ok(())
        }
    }

    /// Selects a microphone by id, restarting capture if it is running.
    pub async fn update_mic(&self, device_id: &str) -> Result<()> {
        let (selected, restart) = {
            let mut session = self.inner.session.lock();
            session.preferred_mic = Some(device_id.to_string());
            let selected = select_device(&session.mics, Some(device_id));
            session.selected_mic = selected.clone();
            self.inner.send(SessionEvent::MicUpdated(selected.clone()));
            (selected, session.state.is_live() && session.mic_enabled)
        };
        if restart {
            self.inner.stop_capture().await;
            self.inner.start_capture(selected.map(|d| d.id)).await?;
        }
        Ok(())
    }

    /// Selects a speaker by id, restarting playback if the session is live.
    pub async fn update_speaker(&self, device_id: &str) -> Result<()> {
        let (selected, restart) = {
            let mut session = self.inner.session.lock();
            session.preferred_speaker = Some(device_id.to_string());
            let selected = select_device(&session.speakers, Some(device_id));
            session.selected_speaker = selected.clone();
            self.inner.send(SessionEvent::SpeakerUpdated(selected.clone()));
            (selected, session.state.is_live())
        };
        if restart {
            let playback = &self.inner.devices.playback;
            playback.stop().await;
            playback
                .start(selected.map(|d| d.id))
                .await
                .map_err(TransportError::device)?;
        }
        Ok(())
    }

    pub fn enable_cam(&self, _enable: bool) -> Result<()> {
        Err(TransportError::Unsupported("camera"))
    }

    pub fn update_cam(&self, _device_id: &str) -> Result<()> {
        Err(TransportError::Unsupported("camera"))
    }

    pub fn send_app_message(&self, _message: serde_json::Value) -> Result<()> {
        Err(TransportError::Unsupported("app messages"))
    }
}

impl Inner {
    fn send(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session event dropped, receiver gone");
        }
    }

    /// Moves to `to` if the edge is allowed and emits its events.
    fn transition(&self, to: SessionState) -> bool {
        let mut session = self.session.lock();
        self.transition_locked(&mut session, to)
    }

    fn transition_locked(&self, session: &mut Session, to: SessionState) -> bool {
        let from = session.state;
        if !transition_allowed(from, to) {
            debug!(%from, %to, "Ignoring session transition");
            return false;
        }
        session.state = to;
        info!(%from, %to, "Session state changed");
        self.send(SessionEvent::StateChanged(to));

        match (from, to) {
            (SessionState::Connecting, SessionState::Connected) => {
                let bot = Participant::bot();
                session.participant = Some(bot.clone());
                self.send(SessionEvent::Connected);
                self.send(SessionEvent::ParticipantJoined(bot.clone()));
                self.send(SessionEvent::BotConnected(bot));
            }
            // Setup finished before the local connect returned.
            (SessionState::Connecting, SessionState::Ready) => {
                let bot = Participant::bot();
                session.participant = Some(bot.clone());
                self.send(SessionEvent::ParticipantJoined(bot.clone()));
                self.send(SessionEvent::BotConnected(bot));
                self.send(SessionEvent::BotReady(ready_data(session)));
            }
            (SessionState::Connected, SessionState::Ready) => {
                self.send(SessionEvent::BotReady(ready_data(session)));
            }
            (_, SessionState::Disconnecting) => {
                if let Some(token) = session.connect_token.take() {
                    token.cancel();
                }
            }
            (SessionState::Disconnecting, SessionState::Disconnected) => {
                if std::mem::take(&mut session.bot_speaking) {
                    self.send(SessionEvent::BotStoppedSpeaking);
                }
                if let Some(bot) = session.participant.take() {
                    self.send(SessionEvent::ParticipantLeft(bot.clone()));
                    self.send(SessionEvent::BotDisconnected(bot));
                }
                self.send(SessionEvent::Disconnected);
            }
            _ => {}
        }
        true
    }

    fn ensure_dispatcher(self: &Arc<Self>) {
        let Some(receiver) = self.connection_events.lock().take() else {
            return;
        };
        let dispatcher = tokio::spawn(dispatch_connection_events(Arc::downgrade(self), receiver));
        self.background.lock().push(dispatcher);
    }

    /// Enters `Connecting` and hands out the token a disconnect cancels.
    fn begin_connect(&self) -> Option<CancellationToken> {
        let mut session = self.session.lock();
        if !self.transition_locked(&mut session, SessionState::Connecting) {
            return None;
        }
        let token = CancellationToken::new();
        session.connect_token = Some(token.clone());
        Some(token)
    }

    async fn open_session(
        &self,
        token: &CancellationToken,
        mic: Option<String>,
        speaker: Option<String>,
        mic_enabled: bool,
    ) -> Result<()> {
        self.devices
            .playback
            .start(speaker)
            .await
            .map_err(TransportError::device)?;
        if mic_enabled && !token.is_cancelled() {
            self.start_capture(mic).await?;
        }
        if token.is_cancelled() {
            return Err(RealtimeError::Cancelled.into());
        }
        self.connection.connect().await?;
        Ok(())
    }

    /// Reports a failed connect and runs the disconnect path.
    async fn fail_connect(&self, error: &TransportError) {
        let closing = {
            let mut session = self.session.lock();
            if !session.state.is_live() {
                false
            } else {
                self.send(SessionEvent::Error(error.to_string()));
                self.transition_locked(&mut session, SessionState::Disconnecting)
            }
        };
        if closing {
            warn!(error = %error, "Failed to connect session");
            self.close_session().await;
        }
    }

    /// Releases what a connect started after `disconnect` already tore the
    /// session down. Skipped once a newer connect owns the devices.
    async fn release_cancelled_start(&self) {
        if self.session.lock().connect_token.is_some() {
            return;
        }
        if let Err(e) = self.connection.disconnect().await {
            warn!(error = %e, "Error closing live connection");
        }
        self.stop_capture().await;
        self.devices.playback.stop().await;
    }

    /// Releases the connection and local audio, ending in `Disconnected`.
    async fn close_session(&self) {
        if let Err(e) = self.connection.disconnect().await {
            warn!(error = %e, "Error closing live connection");
        }
        self.stop_capture().await;
        self.devices.playback.stop().await;
        self.transition(SessionState::Disconnected);
    }

    async fn start_capture(&self, device_id: Option<String>) -> Result<()> {
        let streams = self
            .devices
            .capture
            .start(device_id)
            .await
            .map_err(TransportError::device)?;
        let gate = VoiceActivityGate::new(self.voice_activity.clone());
        let mut tasks = self.capture_tasks.lock();
        tasks.spawn(pump_audio(self.connection.clone(), streams.frames));
        tasks.spawn(watch_voice_activity(
            self.connection.clone(),
            streams.levels,
            gate,
            self.events.clone(),
        ));
        Ok(())
    }

    async fn stop_capture(&self) {
        let mut tasks = std::mem::take(&mut *self.capture_tasks.lock());
        tasks.shutdown().await;
        self.devices.capture.stop().await;
    }

    /// Stores a new device list and reports it; selections are only reported
    /// when they changed, unless `announce_all` is set.
    fn apply_device_list(&self, devices: &[AudioDevice], announce_all: bool) {
        let mics = devices_of_kind(devices, DeviceKind::Microphone);
        let speakers = devices_of_kind(devices, DeviceKind::Speaker);

        let mut session = self.session.lock();
        let selected_mic = select_device(&mics, session.preferred_mic.as_deref());
        let selected_speaker = select_device(&speakers, session.preferred_speaker.as_deref());
        let mic_changed = announce_all || selected_mic != session.selected_mic;
        let speaker_changed = announce_all || selected_speaker != session.selected_speaker;

        session.mics = mics.clone();
        session.speakers = speakers.clone();
        self.send(SessionEvent::AvailableMicsUpdated(mics));
        self.send(SessionEvent::AvailableSpeakersUpdated(speakers));
        if mic_changed {
            session.selected_mic = selected_mic.clone();
            self.send(SessionEvent::MicUpdated(selected_mic));
        }
        if speaker_changed {
            session.selected_speaker = selected_speaker.clone();
            self.send(SessionEvent::SpeakerUpdated(selected_speaker));
        }
    }

    async fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::SetupComplete => {
                self.transition(SessionState::Ready);
            }
            ConnectionEvent::ModelAudio(audio) => self.play_model_audio(audio),
            ConnectionEvent::Interrupted => self.handle_interruption(),
            ConnectionEvent::TurnComplete => {
                let mut session = self.session.lock();
                if std::mem::take(&mut session.bot_speaking) {
                    self.send(SessionEvent::BotStoppedSpeaking);
                }
            }
            ConnectionEvent::Transcript(transcript) => {
                let event = match transcript.role {
                    TranscriptRole::User => SessionEvent::UserTranscript(transcript.text),
                    TranscriptRole::Model => SessionEvent::BotTranscript(transcript.text),
                };
                self.send(event);
            }
            ConnectionEvent::GoAway(time_left) => {
                info!(?time_left, "Server is going away");
                self.send(SessionEvent::ServerGoAway(time_left));
            }
            ConnectionEvent::Closed => {
                // Closes that follow our own disconnect arrive when no longer
                // live; one from an earlier socket finds the new one open.
                let live = matches!(
                    self.session.lock().state,
                    SessionState::Connected | SessionState::Ready
                );
                if live
                    && !self.connection.is_open()
                    && self.transition(SessionState::Disconnecting)
                {
                    info!("Live connection closed by the server");
                    self.close_session().await;
                }
            }
        }
    }

    fn play_model_audio(&self, audio: Bytes) {
        if audio.is_empty() {
            return;
        }
        {
            let mut session = self.session.lock();
            if !session.state.is_live() {
                debug!(state = %session.state, "Dropping model audio");
                return;
            }
            if !session.bot_speaking {
                session.bot_speaking = true;
                self.send(SessionEvent::BotStartedSpeaking);
            }
        }
        self.devices.playback.enqueue(audio);
    }

    fn handle_interruption(&self) {
        self.devices.playback.clear();
        let mut session = self.session.lock();
        self.send(SessionEvent::UserStartedSpeaking);
        if std::mem::take(&mut session.bot_speaking) {
            self.send(SessionEvent::BotStoppedSpeaking);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.background.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn ready_data(session: &Session) -> BotReadyData {
    BotReadyData {
        version: API_VERSION.to_string(),
        model: session.model.clone(),
    }
}

async fn dispatch_connection_events(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_connection_event(event).await;
    }
    debug!("Connection event dispatcher stopped");
}

async fn watch_devices(inner: Weak<Inner>, mut devices: watch::Receiver<Vec<AudioDevice>>) {
    while devices.changed().await.is_ok() {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let snapshot = devices.borrow_and_update().clone();
        debug!(count = snapshot.len(), "Audio devices changed");
        inner.apply_device_list(&snapshot, false);
    }
}

async fn pump_audio(connection: Arc<dyn LiveConnection>, mut frames: mpsc::Receiver<Bytes>) {
    while let Some(frame) = frames.recv().await {
        if frame.is_empty() {
            continue;
        }
        if let Err(e) = connection.send_user_audio(frame).await {
            warn!(error = %e, "Failed to send microphone audio");
        }
    }
    debug!("Microphone stream ended");
}

async fn watch_voice_activity(
    connection: Arc<dyn LiveConnection>,
    mut levels: mpsc::Receiver<f32>,
    mut gate: VoiceActivityGate,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(level) = levels.recv().await {
        if !gate.observe(level) {
            continue;
        }
        debug!(level, "Silence detected, ending user turn");
        if let Err(e) = connection.send_end_of_turn().await {
            warn!(error = %e, "Failed to send end of turn");
        }
        if events.send(SessionEvent::UserStoppedSpeaking).is_err() {
            debug!("Session event dropped, receiver gone");
        }
    }
}
