//! Audio device collaborators used by the session transport.
//!
//! Capture, playback and enumeration are platform concerns; the transport only
//! talks to these traits.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Microphone,
    Speaker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDevice {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
}

impl AudioDevice {
    pub fn microphone(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind: DeviceKind::Microphone,
        }
    }

    pub fn speaker(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind: DeviceKind::Speaker,
        }
    }
}

/// Output of a running capture: PCM16 frames plus one level sample per frame.
#[derive(Debug)]
pub struct CaptureStreams {
    pub frames: mpsc::Receiver<Bytes>,
    /// dBFS levels, see [`crate::vad::level_dbfs`].
    pub levels: mpsc::Receiver<f32>,
}

/// Microphone input, 16 kHz mono PCM16.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Starts capturing from `device_id`, or the system default. Restartable.
    async fn start(&self, device_id: Option<String>) -> Result<CaptureStreams>;
    async fn stop(&self);
}

/// Speaker output for 24 kHz mono PCM16 model audio.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioPlayback: Send + Sync {
    async fn start(&self, device_id: Option<String>) -> Result<()>;
    async fn stop(&self);
    /// Queues audio behind whatever is already buffered.
    fn enqueue(&self, pcm: Bytes);
    /// Drops everything buffered but not yet played.
    fn clear(&self);
}

/// Source of the current device set and its changes.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceManager: Send + Sync {
    fn devices(&self) -> watch::Receiver<Vec<AudioDevice>>;
}

/// Devices of one kind from a full device list.
pub fn devices_of_kind(devices: &[AudioDevice], kind: DeviceKind) -> Vec<AudioDevice> {
    devices
        .iter()
        .filter(|device| device.kind == kind)
        .cloned()
        .collect()
}

/// The available device matching `preferred`, if any.
pub fn select_device(available: &[AudioDevice], preferred: Option<&str>) -> Option<AudioDevice> {
    let preferred = preferred?;
    available
        .iter()
        .find(|device| device.id == preferred)
        .cloned()
}
