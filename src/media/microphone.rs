//! Mikrofon-Capture über cpal
//!
//! Der cpal-Stream ist nicht Send und lebt deshalb in einem eigenen Thread,
//! bis der Track gestoppt wird.

use super::capture::{CaptureRequest, MediaCapture, MediaError};
use super::track::{LocalStream, LocalTrack, MediaKind};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;

/// Sample Rate (48kHz ist der Standard für WebRTC Audio)
pub const SAMPLE_RATE: u32 = 48000;

/// Capture für das Standard-Eingabegerät
#[derive(Debug, Clone, Default)]
pub struct MicrophoneCapture {
    input_level: Arc<Mutex<f32>>,
}

impl MicrophoneCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aktueller Eingangspegel (RMS, 0.0 - 1.0)
    pub fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }

    /// Wählt die beste Konfiguration: 48kHz F32 bevorzugt
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, MediaError> {
        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        for config in &configs {
            if config.min_sample_rate() <= target_rate
                && config.max_sample_rate() >= target_rate
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target_rate).into());
            }
        }

        configs
            .iter()
            .find(|c| c.sample_format() == SampleFormat::F32)
            .map(|c| c.with_max_sample_rate().into())
            .ok_or_else(|| {
                MediaError::DeviceUnavailable("no f32 input configuration".to_string())
            })
    }

    /// Öffnet das Gerät und hält den Stream bis `stop_rx` ausgelöst wird
    fn run_capture(
        device: Device,
        input_level: Arc<Mutex<f32>>,
        ready_tx: mpsc::Sender<Result<(), MediaError>>,
        stop_rx: mpsc::Receiver<()>,
    ) {
        let stream = device
            .supported_input_configs()
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))
            .and_then(|configs| Self::select_best_config(configs.collect()))
            .and_then(|config| {
                tracing::info!(
                    "Starting microphone capture: {} Hz, {} channels",
                    config.sample_rate.0,
                    config.channels
                );
                device
                    .build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            if data.is_empty() {
                                return;
                            }
                            let rms: f32 = (data.iter().map(|s| s * s).sum::<f32>()
                                / data.len() as f32)
                                .sqrt();
                            *input_level.lock() = rms.min(1.0);
                        },
                        |err| {
                            tracing::error!("Microphone capture error: {}", err);
                        },
                        None,
                    )
                    .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))
            })
            .and_then(|stream| {
                stream
                    .play()
                    .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;
                Ok(stream)
            });

        match stream {
            Ok(stream) => {
                let _ = ready_tx.send(Ok(()));
                // Blockiert bis der Track gestoppt oder verworfen wird
                let _ = stop_rx.recv();
                drop(stream);
                tracing::info!("Microphone capture stopped");
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        }
    }
}

impl MediaCapture for MicrophoneCapture {
    /// Nimmt nur Audio auf; angeforderte Video-Tracks werden übersprungen
    fn acquire(&self, request: &CaptureRequest) -> Result<LocalStream, MediaError> {
        if request.video {
            tracing::debug!("No camera backend, skipping video track");
        }
        if !request.audio {
            return Err(MediaError::NothingRequested);
        }

        let stream_id = uuid::Uuid::new_v4().to_string();
        let mut stream = LocalStream::new(stream_id.clone());
        stream.add_track(self.acquire_track(MediaKind::Audio, &stream_id)?);
        Ok(stream)
    }

    fn acquire_track(&self, kind: MediaKind, stream_id: &str) -> Result<LocalTrack, MediaError> {
        if kind != MediaKind::Audio {
            return Err(MediaError::DeviceUnavailable(format!(
                "no {} capture backend",
                kind
            )));
        }

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| MediaError::DeviceUnavailable("no audio input device".to_string()))?;
        let label = device.name().unwrap_or_else(|_| "microphone".to_string());

        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let input_level = Arc::clone(&self.input_level);

        std::thread::Builder::new()
            .name("roomcall-microphone".to_string())
            .spawn(move || Self::run_capture(device, input_level, ready_tx, stop_rx))
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| MediaError::DeviceUnavailable("capture thread exited".to_string()))??;

        Ok(LocalTrack::new(kind, stream_id, &label, move || {
            let _ = stop_tx.send(());
        }))
    }
}
