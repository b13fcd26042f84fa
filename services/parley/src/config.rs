use std::str::FromStr;
use std::time::Duration;

use gemini_realtime::{ConnectionConfig, DEFAULT_MODEL, GenerationConfig};
use parley_core::VoiceActivityConfig;
use secrecy::SecretString;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub api_key: SecretString,
    pub model: String,
    pub voice: Option<String>,
    pub system_prompt: Option<String>,
    pub log_level: Level,
    pub voice_activity: VoiceActivityConfig,
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;

        let model = std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let voice = std::env::var("GEMINI_VOICE").ok();
        let system_prompt = std::env::var("SYSTEM_PROMPT").ok();

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let defaults = VoiceActivityConfig::default();
        let voice_activity = VoiceActivityConfig {
            silence_db_threshold: parse_var("VAD_SILENCE_DB")?
                .unwrap_or(defaults.silence_db_threshold),
            required_silent_frames: parse_var("VAD_SILENT_FRAMES")?
                .unwrap_or(defaults.required_silent_frames),
            cooldown: parse_var::<u64>("VAD_COOLDOWN_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.cooldown),
        };
        if voice_activity.required_silent_frames == 0 {
            return Err(ConfigError::InvalidValue(
                "VAD_SILENT_FRAMES".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            api_key: SecretString::from(api_key),
            model,
            voice,
            system_prompt,
            log_level,
            voice_activity,
        })
    }

    /// Connection settings for the live session.
    pub fn connection_config(&self) -> ConnectionConfig {
        let mut generation = GenerationConfig::default();
        if let Some(voice) = &self.voice {
            generation = generation.with_voice(voice);
        }
        let mut config = ConnectionConfig::new(self.api_key.clone())
            .with_model(&self.model)
            .with_generation_config(generation);
        if let Some(prompt) = &self.system_prompt {
            config = config.with_system_instruction(prompt);
        }
        config
    }
}
