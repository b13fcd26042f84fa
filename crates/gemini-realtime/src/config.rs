use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::{RealtimeError, RealtimeResult};
use crate::protocol::{ClientContent, Content, GenerationConfig, Setup};

/// Gemini Live bidirectional streaming endpoint.
pub const GEMINI_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// API revision served by [`GEMINI_LIVE_URL`].
pub const API_VERSION: &str = "v1beta";

/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";

/// Sample rate of the PCM16 audio the service expects from the microphone.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of the PCM16 audio the service streams back.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

/// Everything a [`GeminiLiveConnection`](crate::GeminiLiveConnection) needs
/// to open a session. A new value only takes effect on the next `connect`.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub api_key: SecretString,
    /// Base websocket URL; the API key is appended as the `key` query parameter.
    pub endpoint: String,
    pub model: String,
    pub generation_config: Option<GenerationConfig>,
    pub system_instruction: Option<Content>,
    /// Sent in order right after the setup message.
    pub initial_messages: Vec<ClientContent>,
}

impl ConnectionConfig {
    pub fn new(api_key: impl Into<SecretString>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: GEMINI_LIVE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            generation_config: Some(GenerationConfig::default()),
            system_instruction: None,
            initial_messages: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_generation_config(mut self, generation_config: GenerationConfig) -> Self {
        self.generation_config = Some(generation_config);
        self
    }

    pub fn with_system_instruction(mut self, text: impl Into<String>) -> Self {
        self.system_instruction = Some(Content::instruction(text));
        self
    }

    pub fn with_initial_message(mut self, message: ClientContent) -> Self {
        self.initial_messages.push(message);
        self
    }

    /// Builds the socket URL, credential included.
    pub fn endpoint_url(&self) -> RealtimeResult<Url> {
        if self.api_key.expose_secret().is_empty() {
            return Err(RealtimeError::InvalidConfiguration(
                "API key is empty".to_string(),
            ));
        }
        let mut url = Url::parse(&self.endpoint).map_err(|e| {
            RealtimeError::InvalidConfiguration(format!("endpoint '{}': {}", self.endpoint, e))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(RealtimeError::InvalidConfiguration(format!(
                "endpoint scheme must be ws or wss, got '{}'",
                url.scheme()
            )));
        }
        url.query_pairs_mut()
            .append_pair("key", self.api_key.expose_secret());
        Ok(url)
    }

    pub(crate) fn setup(&self) -> Setup {
        Setup {
            model: self.model.clone(),
            generation_config: self.generation_config.clone(),
            system_instruction: self.system_instruction.clone(),
        }
    }
}
