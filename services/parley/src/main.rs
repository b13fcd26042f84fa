//! Main entrypoint for the Parley voice client.
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Initializing logging and the TLS crypto provider.
//! 3. Wiring the selected audio backend into a session transport.
//! 4. Running the session until Ctrl+C or the server ends it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, ValueEnum};
use gemini_realtime::GeminiLiveConnection;
use parley_core::{AudioDevices, SessionEvent, SessionTransport, TransportConfig};
use parley_service::config::Config;
use parley_service::file_devices::{FileCapture, FilePlayback, StaticDeviceManager};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Raw PCM files in place of a microphone and speaker
    File,
    /// Sound card through cpal (requires the `native-audio` feature)
    Native,
}

/// Parley - talk to Gemini Live from the terminal
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Audio backend
    #[arg(long, value_enum, default_value_t = Backend::File)]
    backend: Backend,

    /// 16 kHz mono PCM16 file replayed as microphone input (file backend)
    #[arg(short = 'i', long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// File that receives the model's 24 kHz mono PCM16 audio (file backend)
    #[arg(short = 'o', long, value_name = "FILE", default_value = "parley-output.pcm")]
    output: PathBuf,

    /// Preferred microphone id
    #[arg(long, env = "PARLEY_MIC")]
    mic: Option<String>,

    /// Preferred speaker id
    #[arg(long, env = "PARLEY_SPEAKER")]
    speaker: Option<String>,

    /// Connect with the microphone off
    #[arg(long)]
    muted: bool,
}

struct Backends {
    devices: AudioDevices,
    preferred_mic: Option<String>,
    preferred_speaker: Option<String>,
}

fn file_backend(cli: &Cli) -> anyhow::Result<Backends> {
    let input = cli
        .input
        .clone()
        .context("--input is required with the file backend")?;
    let capture = FileCapture::new(input);
    let playback = FilePlayback::new(&cli.output);
    let mic = capture.device();
    let speaker = playback.device();

    Ok(Backends {
        preferred_mic: cli.mic.clone().or_else(|| Some(mic.id.clone())),
        preferred_speaker: cli.speaker.clone().or_else(|| Some(speaker.id.clone())),
        devices: AudioDevices {
            capture: Arc::new(capture),
            playback: Arc::new(playback),
            manager: Arc::new(StaticDeviceManager::new(vec![mic, speaker])),
        },
    })
}

#[cfg(feature = "native-audio")]
fn native_backend(cli: &Cli) -> anyhow::Result<Backends> {
    use parley_service::native::{CpalCapture, CpalDeviceManager, CpalPlayback};

    let manager = Arc::new(CpalDeviceManager::new()?);
    manager.spawn_refresh(std::time::Duration::from_secs(5));
    Ok(Backends {
        devices: AudioDevices {
            capture: Arc::new(CpalCapture::default()),
            playback: Arc::new(CpalPlayback::default()),
            manager,
        },
        preferred_mic: cli.mic.clone(),
        preferred_speaker: cli.speaker.clone(),
    })
}

#[cfg(not(feature = "native-audio"))]
fn native_backend(_cli: &Cli) -> anyhow::Result<Backends> {
    anyhow::bail!("parley was built without the native-audio feature")
}

/// Logs a session event; returns false once the session has ended.
fn report(event: &SessionEvent) -> bool {
    match event {
        SessionEvent::StateChanged(state) => info!(%state, "Session state changed"),
        SessionEvent::BotReady(data) => {
            info!(model = %data.model, version = %data.version, "Gemini is ready")
        }
        SessionEvent::UserTranscript(text) => println!("you: {}", text),
        SessionEvent::BotTranscript(text) => println!("gemini: {}", text),
        SessionEvent::ServerGoAway(time_left) => {
            warn!(?time_left, "Server will close the session soon")
        }
        SessionEvent::Error(message) => error!(%message, "Session error"),
        SessionEvent::Disconnected => return false,
        other => debug!(event = ?other, "Session event"),
    }
    true
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging and TLS ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    // --- 3. Build the Session ---
    let backends = match cli.backend {
        Backend::File => file_backend(&cli)?,
        Backend::Native => native_backend(&cli)?,
    };
    let mut transport_config = TransportConfig::new(config.connection_config());
    transport_config.voice_activity = config.voice_activity.clone();
    transport_config.enable_mic = !cli.muted;
    transport_config.preferred_mic = backends.preferred_mic;
    transport_config.preferred_speaker = backends.preferred_speaker;

    let connection = Arc::new(GeminiLiveConnection::new());
    let (transport, mut events) =
        SessionTransport::new(connection, backends.devices, transport_config);

    // --- 4. Run ---
    info!(model = %config.model, backend = ?cli.backend, "Connecting to Gemini Live");
    transport
        .connect()
        .await
        .context("Failed to start the session")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal. Disconnecting...");
                break;
            }
            event = events.recv() => {
                match event {
                    Some(event) if report(&event) => {}
                    _ => break,
                }
            }
        }
    }

    transport.disconnect().await?;
    Ok(())
}
