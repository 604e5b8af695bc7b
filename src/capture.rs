use crate::config::{FRAME_SAMPLES, INPUT_SAMPLE_RATE};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat};
use std::sync::mpsc as std_mpsc;
use std::thread;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No input device available")]
    NoDevice,

    #[error("Input device error: {0}")]
    Device(String),

    #[error("Unsupported sample format: {0:?}")]
    UnsupportedFormat(SampleFormat),

    #[error("Capture already started")]
    AlreadyStarted,
}

/// One microphone frame handed to the session loop, in capture order.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    /// Mono samples at 16 kHz, exactly [`FRAME_SAMPLES`] of them.
    pub samples: Vec<f32>,
    /// Instantaneous loudness estimate in 0..1.
    pub volume: f32,
}

/// Root-mean-square amplitude of a frame.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Visualization amplification applied to the RMS estimate, not physically
/// calibrated.
const VOLUME_GAIN: f32 = 5.0;

fn frame_volume(samples: &[f32]) -> f32 {
    (rms(samples) * VOLUME_GAIN).min(1.0)
}

/// Turns interleaved device input into fixed-size mono frames at 16 kHz.
///
/// Channel 0 is extracted from interleaved multi-channel input, then linearly
/// resampled from the device rate when it is not already 16 kHz. Pure, so the
/// frame contract is testable without audio hardware.
pub struct FrameChunker {
    channels: usize,
    /// Device samples consumed per emitted sample.
    ratio: f64,
    frame_len: usize,
    backlog: Vec<f32>,
    read_pos: f64,
    frame: Vec<f32>,
}

impl FrameChunker {
    pub fn new(device_rate: u32, channels: usize) -> Self {
        Self::with_frame_len(device_rate, channels, FRAME_SAMPLES)
    }

    pub fn with_frame_len(device_rate: u32, channels: usize, frame_len: usize) -> Self {
        Self {
            channels: channels.max(1),
            ratio: device_rate as f64 / INPUT_SAMPLE_RATE as f64,
            frame_len,
            backlog: Vec::new(),
            read_pos: 0.0,
            frame: Vec::with_capacity(frame_len),
        }
    }

    /// Push interleaved device samples; returns completed frames in capture
    /// order.
    pub fn push(&mut self, interleaved: &[f32]) -> Vec<CaptureFrame> {
        if self.channels == 1 {
            self.backlog.extend_from_slice(interleaved);
        } else {
            self.backlog
                .extend(interleaved.iter().step_by(self.channels).copied());
        }

        let mut frames = Vec::new();
        while (self.read_pos.floor() as usize) + 1 < self.backlog.len() {
            let index = self.read_pos.floor() as usize;
            let fract = (self.read_pos - index as f64) as f32;
            let sample = self.backlog[index] * (1.0 - fract) + self.backlog[index + 1] * fract;
            self.frame.push(sample);
            self.read_pos += self.ratio;

            if self.frame.len() == self.frame_len {
                let samples =
                    std::mem::replace(&mut self.frame, Vec::with_capacity(self.frame_len));
                let volume = frame_volume(&samples);
                frames.push(CaptureFrame { samples, volume });
            }
        }

        let consumed = self.read_pos.floor() as usize;
        if consumed > 0 {
            self.backlog.drain(0..consumed);
            self.read_pos -= consumed as f64;
        }

        frames
    }
}

/// Continuous microphone frame delivery. Implementations must be idempotent on
/// `stop` and must deliver frames in capture order.
pub trait Capture: Send {
    fn start(&mut self, frames: mpsc::Sender<CaptureFrame>) -> Result<(), CaptureError>;
    fn stop(&mut self);
}

enum WorkerSignal {
    Stop,
}

struct CaptureWorker {
    stop_tx: std_mpsc::Sender<WorkerSignal>,
    handle: thread::JoinHandle<()>,
}

/// Microphone capture backed by cpal. The input stream is owned by a dedicated
/// thread; frames cross into the async world over a bounded channel via
/// `try_send`, so the audio callback never blocks. Frames that cannot be
/// queued are dropped.
pub struct CpalCapture {
    device_name: Option<String>,
    worker: Option<CaptureWorker>,
}

impl CpalCapture {
    /// Acquire the microphone: resolve the input device and verify it has a
    /// usable configuration. Fails with an acquisition error when no device or
    /// configuration is available.
    pub fn acquire(device_name: Option<String>) -> Result<Self, CaptureError> {
        let device = Self::resolve_device(device_name.as_deref())?;
        let config = device
            .default_input_config()
            .map_err(|e| CaptureError::Device(format!("No usable input config: {}", e)))?;

        log::info!(
            "Acquired input device: {} ({} ch @ {} Hz, {:?})",
            device.name().unwrap_or_else(|_| "<unknown>".to_string()),
            config.channels(),
            config.sample_rate().0,
            config.sample_format()
        );

        Ok(Self {
            device_name,
            worker: None,
        })
    }

    fn resolve_device(device_name: Option<&str>) -> Result<Device, CaptureError> {
        let host = cpal::default_host();

        if let Some(name) = device_name {
            let devices = host
                .input_devices()
                .map_err(|e| CaptureError::Device(format!("Failed to enumerate devices: {}", e)))?;
            for device in devices {
                let found = device
                    .name()
                    .map_err(|e| CaptureError::Device(format!("Failed to get device name: {}", e)))?;
                if found.contains(name) {
                    log::info!("Found matching input device: {}", found);
                    return Ok(device);
                }
            }
            return Err(CaptureError::Device(format!("Device '{}' not found", name)));
        }

        host.default_input_device().ok_or(CaptureError::NoDevice)
    }

    fn build_stream(
        device: &Device,
        frames: mpsc::Sender<CaptureFrame>,
    ) -> Result<cpal::Stream, CaptureError> {
        let config = device
            .default_input_config()
            .map_err(|e| CaptureError::Device(format!("No usable input config: {}", e)))?;
        let channels = config.channels() as usize;
        let device_rate = config.sample_rate().0;
        let stream_config = config.config();

        let mut chunker = FrameChunker::new(device_rate, channels);
        let mut deliver = move |data: &[f32]| {
            for frame in chunker.push(data) {
                if frames.try_send(frame).is_err() {
                    log::warn!("Capture frame dropped: session not keeping up");
                }
            }
        };

        let on_error = |err| log::error!("Input stream error: {}", err);

        let stream = match config.sample_format() {
            SampleFormat::F32 => device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| deliver(data),
                    on_error,
                    None,
                )
                .map_err(|e| CaptureError::Device(format!("Failed to build input stream: {}", e)))?,
            SampleFormat::I16 => device
                .build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let float_data: Vec<f32> = data
                            .iter()
                            .map(|&sample| sample as f32 / i16::MAX as f32)
                            .collect();
                        deliver(&float_data);
                    },
                    on_error,
                    None,
                )
                .map_err(|e| CaptureError::Device(format!("Failed to build input stream: {}", e)))?,
            SampleFormat::U16 => device
                .build_input_stream(
                    &stream_config,
                    move |data: &[u16], _: &cpal::InputCallbackInfo| {
                        let float_data: Vec<f32> = data
                            .iter()
                            .map(|&sample| {
                                (sample as f32 - u16::MAX as f32 / 2.0) / (u16::MAX as f32 / 2.0)
                            })
                            .collect();
                        deliver(&float_data);
                    },
                    on_error,
                    None,
                )
                .map_err(|e| CaptureError::Device(format!("Failed to build input stream: {}", e)))?,
            other => return Err(CaptureError::UnsupportedFormat(other)),
        };

        Ok(stream)
    }
}

impl Capture for CpalCapture {
    fn start(&mut self, frames: mpsc::Sender<CaptureFrame>) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }

        let device_name = self.device_name.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();

        // The stream lives on its own thread: cpal streams are not Send, and
        // the callback must keep running while the session loop awaits.
        let handle = thread::spawn(move || {
            let stream = match Self::resolve_device(device_name.as_deref())
                .and_then(|device| Self::build_stream(&device, frames))
            {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(CaptureError::Device(format!(
                    "Failed to start input stream: {}",
                    e
                ))));
                return;
            }

            let _ = ready_tx.send(Ok(()));

            // Park until told to stop; dropping the stream releases the device.
            let _ = stop_rx.recv();
            drop(stream);
            log::debug!("Capture thread exiting");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::info!("Capture started");
                self.worker = Some(CaptureWorker { stop_tx, handle });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CaptureError::Device("Capture thread died".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(WorkerSignal::Stop);
            if let Err(e) = worker.handle.join() {
                log::error!("Failed to join capture thread: {:?}", e);
            }
            log::info!("Capture stopped");
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
