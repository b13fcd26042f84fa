//! File-backed audio devices for headless sessions.
//!
//! Capture replays a raw 16 kHz mono PCM16 file in real time, followed by a
//! stretch of silence so the end-of-turn detector fires. Playback appends the
//! model's 24 kHz mono PCM16 audio to a file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use parley_core::{
    AudioCapture, AudioDevice, AudioPlayback, CaptureStreams, DeviceManager, level_dbfs,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio_utils::{INPUT_FRAME_SAMPLES, pcm16_samples};

pub const FRAME_DURATION: Duration = Duration::from_millis(20);

const FRAME_BYTES: usize = INPUT_FRAME_SAMPLES * 2;
const CHANNEL_CAPACITY: usize = 64;

pub fn file_device_id(path: &Path) -> String {
    format!("file:{}", path.display())
}

pub struct FileCapture {
    path: PathBuf,
    trailing_silence: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            trailing_silence: Duration::from_secs(1),
            task: Mutex::new(None),
        }
    }

    pub fn with_trailing_silence(mut self, trailing_silence: Duration) -> Self {
        self.trailing_silence = trailing_silence;
        self
    }

    pub fn device(&self) -> AudioDevice {
        AudioDevice::microphone(file_device_id(&self.path), self.path.display().to_string())
    }
}

#[async_trait]
impl AudioCapture for FileCapture {
    async fn start(&self, device_id: Option<String>) -> Result<CaptureStreams> {
        let pcm = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read capture file {}", self.path.display()))?;
        let silence_frames =
            (self.trailing_silence.as_millis() / FRAME_DURATION.as_millis()) as usize;
        info!(
            path = %self.path.display(),
            bytes = pcm.len(),
            ?device_id,
            "Starting file capture"
        );

        let (frame_tx, frames) = mpsc::channel(CHANNEL_CAPACITY);
        let (level_tx, levels) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(replay(Bytes::from(pcm), silence_frames, frame_tx, level_tx));
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        Ok(CaptureStreams { frames, levels })
    }

    async fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!(path = %self.path.display(), "File capture stopped");
        }
    }
}

async fn replay(
    pcm: Bytes,
    silence_frames: usize,
    frames: mpsc::Sender<Bytes>,
    levels: mpsc::Sender<f32>,
) {
    let silence = Bytes::from(vec![0u8; FRAME_BYTES]);
    let recorded = (0..pcm.len())
        .step_by(FRAME_BYTES)
        .map(|start| pcm.slice(start..(start + FRAME_BYTES).min(pcm.len())));

    let mut ticker = tokio::time::interval(FRAME_DURATION);
    for frame in recorded.chain(std::iter::repeat_n(silence, silence_frames)) {
        ticker.tick().await;
        let level = level_dbfs(&pcm16_samples(&frame));
        if frames.send(frame).await.is_err() || levels.send(level).await.is_err() {
            break;
        }
    }
    debug!("File capture reached the end of input");
}

/// Appends model audio to a raw PCM16 file.
pub struct FilePlayback {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl FilePlayback {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
        }
    }

    pub fn device(&self) -> AudioDevice {
        AudioDevice::speaker(file_device_id(&self.path), self.path.display().to_string())
    }
}

#[async_trait]
impl AudioPlayback for FilePlayback {
    async fn start(&self, device_id: Option<String>) -> Result<()> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open playback file {}", self.path.display()))?
            .into_std()
            .await;
        info!(path = %self.path.display(), ?device_id, "Starting file playback");
        *self.writer.lock() = Some(BufWriter::new(file));
        Ok(())
    }

    async fn stop(&self) {
        let Some(mut writer) = self.writer.lock().take() else {
            return;
        };
        if let Err(e) = writer.flush() {
            warn!(error = %e, path = %self.path.display(), "Failed to flush playback file");
        }
    }

    fn enqueue(&self, pcm: Bytes) {
        let mut writer = self.writer.lock();
        let Some(writer) = writer.as_mut() else {
            debug!(bytes = pcm.len(), "Playback not started, dropping audio");
            return;
        };
        if let Err(e) = writer.write_all(&pcm) {
            warn!(error = %e, path = %self.path.display(), "Failed to write model audio");
        }
    }

    fn clear(&self) {
        // Written audio counts as played; there is no backlog to drop.
        debug!(path = %self.path.display(), "Playback cleared");
    }
}

/// A fixed device list that can be replaced at runtime.
pub struct StaticDeviceManager {
    devices: watch::Sender<Vec<AudioDevice>>,
}

impl StaticDeviceManager {
    pub fn new(devices: Vec<AudioDevice>) -> Self {
        let (devices, _) = watch::channel(devices);
        Self { devices }
    }

    pub fn replace(&self, devices: Vec<AudioDevice>) {
        self.devices.send_replace(devices);
    }
}

impl DeviceManager for StaticDeviceManager {
    fn devices(&self) -> watch::Receiver<Vec<AudioDevice>> {
        self.devices.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tokio::time::timeout;

    fn loud_pcm(samples: usize) -> Vec<u8> {
        std::iter::repeat_n(16384i16.to_le_bytes(), samples)
            .flatten()
            .collect()
    }

    #[tokio::test]
    async fn test_capture_replays_frames_then_silence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.pcm");
        std::fs::write(&path, loud_pcm(500)).unwrap();

        let capture = FileCapture::new(&path).with_trailing_silence(Duration::from_millis(40));
        let mut streams = capture.start(None).await.unwrap();

        let mut sizes = Vec::new();
        let mut levels = Vec::new();
        while let Some(frame) = timeout(Duration::from_secs(2), streams.frames.recv())
            .await
            .unwrap()
        {
            sizes.push(frame.len());
            levels.push(streams.levels.recv().await.unwrap());
        }

        assert_eq!(sizes, vec![640, 360, 640, 640]);
        assert_abs_diff_eq!(levels[0], -6.0206, epsilon = 0.001);
        assert_abs_diff_eq!(levels[1], -6.0206, epsilon = 0.001);
        assert_eq!(levels[2], f32::NEG_INFINITY);
        assert_eq!(levels[3], f32::NEG_INFINITY);
    }

    #[tokio::test]
    async fn test_capture_stop_ends_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.pcm");
        std::fs::write(&path, loud_pcm(16000)).unwrap();

        let capture = FileCapture::new(&path);
        let mut streams = capture.start(None).await.unwrap();
        assert!(streams.frames.recv().await.is_some());

        capture.stop().await;
        let drained = timeout(Duration::from_secs(2), async {
            while streams.frames.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }

    #[tokio::test]
    async fn test_capture_missing_file() {
        let capture = FileCapture::new("/definitely/not/here.pcm");
        let err = capture.start(None).await.unwrap_err();
        assert!(format!("{:#}", err).contains("/definitely/not/here.pcm"));
    }

    #[tokio::test]
    async fn test_playback_appends_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.pcm");
        let playback = FilePlayback::new(&path);

        // Not started yet: dropped.
        playback.enqueue(Bytes::from_static(&[9, 9]));

        playback.start(None).await.unwrap();
        playback.enqueue(Bytes::from_static(&[1, 2, 3, 4]));
        playback.clear();
        playback.enqueue(Bytes::from_static(&[5, 6]));
        playback.stop().await;
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3, 4, 5, 6]);

        playback.start(None).await.unwrap();
        playback.enqueue(Bytes::from_static(&[7, 8]));
        playback.stop().await;
        playback.stop().await;
        assert_eq!(
            std::fs::read(&path).unwrap(),
            vec![1, 2, 3, 4, 5, 6, 7, 8]
        );
    }

    #[tokio::test]
    async fn test_static_device_manager() {
        let mic = FileCapture::new("in.pcm").device();
        let speaker = FilePlayback::new("out.pcm").device();
        assert_eq!(mic.id, "file:in.pcm");
        assert_eq!(speaker.id, "file:out.pcm");

        let manager = StaticDeviceManager::new(vec![mic.clone(), speaker.clone()]);
        let mut devices = manager.devices();
        assert_eq!(*devices.borrow_and_update(), vec![mic.clone(), speaker]);

        manager.replace(vec![mic.clone()]);
        devices.changed().await.unwrap();
        assert_eq!(*devices.borrow(), vec![mic]);
    }
}
