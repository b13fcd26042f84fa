//! Sound card devices through cpal.
//!
//! cpal streams are not `Send`, so every running stream is owned by its own
//! thread and dropped when that thread's stop channel closes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleFormat};
use gemini_realtime::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use parking_lot::Mutex;
use parley_core::{
    AudioCapture, AudioDevice, AudioPlayback, CaptureStreams, DeviceManager, level_dbfs,
};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio_utils::{
    INPUT_FRAME_SAMPLES, StreamResampler, convert_i16_to_f32, downmix, f32_to_pcm16_bytes,
    pcm16_samples,
};

const CHANNEL_CAPACITY: usize = 64;
const RESAMPLER_CHUNK: usize = 1024;
const PLAYBACK_BUFFER_SECS: usize = 30;

/// Keeps a stream thread alive; dropping it stops the stream.
struct StreamThread {
    _stop: std::sync::mpsc::Sender<()>,
}

impl StreamThread {
    async fn spawn<T, F>(name: &str, build: F) -> Result<(Self, T)>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<(cpal::Stream, T)> + Send + 'static,
    {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let started = build().and_then(|(stream, value)| {
                    stream.play()?;
                    Ok((stream, value))
                });
                let stream = match started {
                    Ok((stream, value)) => {
                        if ready_tx.send(Ok(value)).is_err() {
                            return;
                        }
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Returns once the sender side is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .context("Failed to spawn audio thread")?;

        let value = ready_rx
            .await
            .context("Audio thread exited during startup")??;
        Ok((Self { _stop: stop_tx }, value))
    }
}

fn find_device(host: &Host, id: Option<&str>, input: bool) -> Result<Device> {
    if let Some(id) = id {
        let mut devices = if input {
            host.input_devices()?
        } else {
            host.output_devices()?
        };
        if let Some(device) = devices.find(|d| d.name().is_ok_and(|name| name == id)) {
            return Ok(device);
        }
        warn!(device = id, "Audio device not found, using the default");
    }
    let default = if input {
        host.default_input_device()
    } else {
        host.default_output_device()
    };
    default.ok_or_else(|| anyhow!("No default {} device", if input { "input" } else { "output" }))
}

fn enumerate(host: &Host) -> Result<Vec<AudioDevice>> {
    let mut devices = Vec::new();
    for device in host.input_devices()? {
        if let Ok(name) = device.name() {
            devices.push(AudioDevice::microphone(name.clone(), name));
        }
    }
    for device in host.output_devices()? {
        if let Ok(name) = device.name() {
            devices.push(AudioDevice::speaker(name.clone(), name));
        }
    }
    Ok(devices)
}

/// Devices of the default cpal host, identified by name.
pub struct CpalDeviceManager {
    devices: watch::Sender<Vec<AudioDevice>>,
}

impl CpalDeviceManager {
    pub fn new() -> Result<Self> {
        let devices = enumerate(&cpal::default_host()).context("Failed to list audio devices")?;
        info!(count = devices.len(), "Audio devices found");
        let (devices, _) = watch::channel(devices);
        Ok(Self { devices })
    }

    /// Re-enumerates and publishes the device list.
    pub fn refresh(&self) -> Result<()> {
        let devices = enumerate(&cpal::default_host())?;
        self.devices.send_if_modified(|current| {
            if *current == devices {
                return false;
            }
            *current = devices;
            true
        });
        Ok(())
    }

    /// Polls for added or removed devices every `every`.
    pub fn spawn_refresh(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match tokio::task::spawn_blocking(move || manager.refresh()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Failed to refresh audio devices"),
                    Err(e) => warn!(error = %e, "Device refresh task failed"),
                }
            }
        })
    }
}

impl DeviceManager for CpalDeviceManager {
    fn devices(&self) -> watch::Receiver<Vec<AudioDevice>> {
        self.devices.subscribe()
    }
}

#[derive(Default)]
pub struct CpalCapture {
    stream: Mutex<Option<StreamThread>>,
}

#[async_trait]
impl AudioCapture for CpalCapture {
    async fn start(&self, device_id: Option<String>) -> Result<CaptureStreams> {
        let (frame_tx, frames) = mpsc::channel(CHANNEL_CAPACITY);
        let (level_tx, levels) = mpsc::channel(CHANNEL_CAPACITY);
        let (stream, ()) = StreamThread::spawn("parley-capture", move || {
            let stream = build_capture(device_id.as_deref(), frame_tx, level_tx)?;
            Ok((stream, ()))
        })
        .await?;
        *self.stream.lock() = Some(stream);
        Ok(CaptureStreams { frames, levels })
    }

    async fn stop(&self) {
        if self.stream.lock().take().is_some() {
            debug!("Microphone stream stopped");
        }
    }
}

fn build_capture(
    device_id: Option<&str>,
    frames: mpsc::Sender<Bytes>,
    levels: mpsc::Sender<f32>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = find_device(&host, device_id, true)?;
    let supported = device.default_input_config()?;
    if supported.sample_format() != SampleFormat::F32 {
        bail!("Unsupported input sample format {:?}", supported.sample_format());
    }
    let config = supported.config();
    let channels = config.channels as usize;
    info!(
        device = %device.name().unwrap_or_default(),
        rate = config.sample_rate.0,
        channels,
        "Opening microphone"
    );

    let mut resampler = StreamResampler::new(config.sample_rate.0, INPUT_SAMPLE_RATE, RESAMPLER_CHUNK)?;
    let mut pending: Vec<f32> = Vec::new();
    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let mono = downmix(data, channels);
            match resampler.push(&mono) {
                Ok(resampled) => pending.extend(resampled),
                Err(e) => {
                    warn!(error = %e, "Failed to resample microphone audio");
                    return;
                }
            }
            while pending.len() >= INPUT_FRAME_SAMPLES {
                let frame: Vec<f32> = pending.drain(..INPUT_FRAME_SAMPLES).collect();
                let pcm = f32_to_pcm16_bytes(&frame);
                let level = level_dbfs(&pcm16_samples(&pcm));
                if frames.try_send(Bytes::from(pcm)).is_err() {
                    debug!("Microphone frame dropped");
                    continue;
                }
                let _ = levels.try_send(level);
            }
        },
        |err| warn!(error = %err, "Microphone stream error"),
        None,
    )?;
    Ok(stream)
}

struct PlaybackState {
    _stream: StreamThread,
    producer: HeapProd<f32>,
    resampler: StreamResampler,
    clear: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct CpalPlayback {
    state: Mutex<Option<PlaybackState>>,
}

#[async_trait]
impl AudioPlayback for CpalPlayback {
    async fn start(&self, device_id: Option<String>) -> Result<()> {
        let clear = Arc::new(AtomicBool::new(false));
        let flag = clear.clone();
        let (stream, (producer, rate)) = StreamThread::spawn("parley-playback", move || {
            build_playback(device_id.as_deref(), flag)
        })
        .await?;
        let resampler = StreamResampler::new(OUTPUT_SAMPLE_RATE, rate, RESAMPLER_CHUNK)?;
        *self.state.lock() = Some(PlaybackState {
            _stream: stream,
            producer,
            resampler,
            clear,
        });
        Ok(())
    }

    async fn stop(&self) {
        if self.state.lock().take().is_some() {
            debug!("Speaker stream stopped");
        }
    }

    fn enqueue(&self, pcm: Bytes) {
        let mut state = self.state.lock();
        let Some(state) = state.as_mut() else {
            return;
        };
        let samples = convert_i16_to_f32(&pcm16_samples(&pcm));
        let resampled = match state.resampler.push(&samples) {
            Ok(resampled) => resampled,
            Err(e) => {
                warn!(error = %e, "Failed to resample model audio");
                return;
            }
        };
        let pushed = state.producer.push_slice(&resampled);
        if pushed < resampled.len() {
            warn!(dropped = resampled.len() - pushed, "Playback buffer full");
        }
    }

    fn clear(&self) {
        if let Some(state) = self.state.lock().as_mut() {
            state.resampler.reset();
            state.clear.store(true, Ordering::Release);
        }
    }
}

fn build_playback(
    device_id: Option<&str>,
    clear: Arc<AtomicBool>,
) -> Result<(cpal::Stream, (HeapProd<f32>, u32))> {
    let host = cpal::default_host();
    let device = find_device(&host, device_id, false)?;
    let supported = device.default_output_config()?;
    if supported.sample_format() != SampleFormat::F32 {
        bail!("Unsupported output sample format {:?}", supported.sample_format());
    }
    let config = supported.config();
    let channels = config.channels as usize;
    let rate = config.sample_rate.0;
    info!(
        device = %device.name().unwrap_or_default(),
        rate,
        channels,
        "Opening speaker"
    );

    let (producer, mut consumer) = HeapRb::<f32>::new(rate as usize * PLAYBACK_BUFFER_SECS).split();
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            if clear.swap(false, Ordering::AcqRel) {
                consumer.clear();
            }
            for frame in data.chunks_mut(channels) {
                let sample = consumer.try_pop().unwrap_or(0.0);
                frame.fill(sample);
            }
        },
        |err| warn!(error = %err, "Speaker stream error"),
        None,
    )?;
    Ok((stream, (producer, rate)))
}
