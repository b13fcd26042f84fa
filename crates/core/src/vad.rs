//! Local end-of-turn detection from microphone levels.
//!
//! The capture path reports one level sample (dBFS) per audio frame. After
//! enough consecutive quiet samples the gate fires once, then stays quiet for
//! a cooldown so a single pause cannot produce a burst of end-of-turn signals.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct VoiceActivityConfig {
    /// Samples strictly below this level count as silence.
    pub silence_db_threshold: f32,
    /// Consecutive silent samples needed to fire.
    pub required_silent_frames: u32,
    /// How long the gate stays closed after firing.
    pub cooldown: Duration,
}

impl Default for VoiceActivityConfig {
    fn default() -> Self {
        Self {
            silence_db_threshold: -40.0,
            required_silent_frames: 6,
            cooldown: Duration::from_millis(1500),
        }
    }
}

/// Per-session silence counter. Not shared between sessions.
#[derive(Debug)]
pub struct VoiceActivityGate {
    config: VoiceActivityConfig,
    silent_frames: u32,
    cooldown_until: Option<Instant>,
}

impl VoiceActivityGate {
    pub fn new(config: VoiceActivityConfig) -> Self {
        Self {
            config,
            silent_frames: 0,
            cooldown_until: None,
        }
    }

    /// Feeds one level sample; returns `true` when an end-of-turn should be sent.
    ///
    /// Silent samples seen during the cooldown are not counted.
    pub fn observe(&mut self, level_db: f32) -> bool {
        if level_db >= self.config.silence_db_threshold {
            self.silent_frames = 0;
            return false;
        }
        if self.is_cooling_down() {
            return false;
        }
        self.cooldown_until = None;

        self.silent_frames += 1;
        if self.silent_frames < self.config.required_silent_frames {
            return false;
        }
        self.silent_frames = 0;
        self.cooldown_until = Some(Instant::now() + self.config.cooldown);
        true
    }

    /// True while an end-of-turn was sent recently.
    pub fn is_cooling_down(&self) -> bool {
        self.cooldown_until
            .is_some_and(|until| Instant::now() < until)
    }

    pub fn silent_frames(&self) -> u32 {
        self.silent_frames
    }

    pub fn reset(&mut self) {
        self.silent_frames = 0;
        self.cooldown_until = None;
    }
}

/// RMS level of a PCM16 frame in dBFS. Digital silence is `-inf`.
pub fn level_dbfs(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return f32::NEG_INFINITY;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    let rms = (sum_squares / samples.len() as f64).sqrt();
    (20.0 * rms.log10()) as f32
}
