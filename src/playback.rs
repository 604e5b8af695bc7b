use crate::codec::AudioClip;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::HashSet;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("No output device available")]
    NoDevice,

    #[error("Output device error: {0}")]
    Device(String),
}

pub type SourceId = u64;

/// The output device abstraction the scheduler runs against.
///
/// `now` is a monotonic device clock in seconds. Implementations report
/// natural source completion out-of-band (the session loop feeds those back
/// through [`PlaybackScheduler::source_ended`]); `stop_source` is forcible and
/// silent. Tests drive the scheduler with a fake clock.
pub trait OutputContext: Send {
    fn now(&self) -> f64;

    /// Begin playback of `clip` at absolute device time `at`.
    fn start_source(&mut self, clip: AudioClip, at: f64) -> SourceId;

    /// Forcibly stop a source. Unknown ids are ignored.
    fn stop_source(&mut self, id: SourceId);

    /// Release device resources. Idempotent.
    fn close(&mut self);
}

/// Serializes jittery network-delivered clips into back-to-back, gap-free
/// playback on one output device.
///
/// The cursor is the device time at which the next clip starts. It only moves
/// forward during normal playback, snaps up to `now` after an underrun, and
/// resets to zero on flush. Every in-flight source leaves the set exactly
/// once: naturally via [`source_ended`](Self::source_ended) or forcibly via
/// [`flush`](Self::flush).
pub struct PlaybackScheduler<C: OutputContext> {
    ctx: C,
    cursor: f64,
    in_flight: HashSet<SourceId>,
    closed: bool,
}

impl<C: OutputContext> PlaybackScheduler<C> {
    pub fn new(ctx: C) -> Self {
        Self {
            ctx,
            cursor: 0.0,
            in_flight: HashSet::new(),
            closed: false,
        }
    }

    /// Schedule `clip` to play immediately after everything already queued.
    pub fn schedule(&mut self, clip: AudioClip) -> SourceId {
        let now = self.ctx.now();
        if self.cursor < now {
            // Underrun: the queue ran dry, start fresh from the clock.
            log::debug!("Playback underrun: cursor {:.3} behind clock {:.3}", self.cursor, now);
            self.cursor = now;
        }

        let duration = clip.duration();
        let id = self.ctx.start_source(clip, self.cursor);
        self.cursor += duration;
        self.in_flight.insert(id);

        log::debug!(
            "Scheduled source {} for {:.3}s, cursor now {:.3}",
            id,
            duration,
            self.cursor
        );
        id
    }

    /// A source finished playing on its own.
    pub fn source_ended(&mut self, id: SourceId) {
        self.in_flight.remove(&id);
    }

    /// Stop everything in flight and reset the cursor. Safe with nothing
    /// queued; used on interruption and teardown.
    pub fn flush(&mut self) {
        let stopped = self.in_flight.len();
        for id in self.in_flight.drain() {
            self.ctx.stop_source(id);
        }
        self.cursor = 0.0;
        if stopped > 0 {
            log::info!("Flushed {} in-flight playback sources", stopped);
        }
    }

    /// Flush and release the output device. Idempotent.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.flush();
        self.ctx.close();
        self.closed = true;
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

struct ActiveSource {
    id: SourceId,
    /// Absolute device time at which the first sample plays.
    start: f64,
    samples: Vec<f32>,
    sample_rate: u32,
    /// Fractional read position into `samples`.
    pos: f64,
    done: bool,
}

struct OutputState {
    sources: Vec<ActiveSource>,
    /// Device frames rendered since the stream opened.
    frames_rendered: u64,
    device_rate: u32,
}

enum WorkerSignal {
    Stop,
}

struct OutputWorker {
    stop_tx: std_mpsc::Sender<WorkerSignal>,
    handle: thread::JoinHandle<()>,
}

/// cpal-backed [`OutputContext`]. The output stream lives on its own thread;
/// the callback mixes every active source into the device buffer, converting
/// from the clip rate to the device rate by linear interpolation, and reports
/// natural completions over the provided channel.
pub struct CpalOutput {
    shared: Arc<Mutex<OutputState>>,
    worker: Option<OutputWorker>,
    next_id: SourceId,
}

impl CpalOutput {
    pub fn open(ended_tx: mpsc::UnboundedSender<SourceId>) -> Result<Self, PlaybackError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(PlaybackError::NoDevice)?;
        log::debug!(
            "Using output device: {}",
            device.name().unwrap_or_else(|_| "<unknown>".to_string())
        );

        let supported_config = device
            .default_output_config()
            .map_err(|e| PlaybackError::Device(e.to_string()))?;
        let device_rate = supported_config.sample_rate().0;
        let output_channels = supported_config.channels() as usize;

        let shared = Arc::new(Mutex::new(OutputState {
            sources: Vec::new(),
            frames_rendered: 0,
            device_rate,
        }));
        let shared_cb = Arc::clone(&shared);

        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();

        let handle = thread::spawn(move || {
            let stream = match device.build_output_stream(
                &supported_config.config(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    Self::render(&shared_cb, &ended_tx, data, output_channels);
                },
                |err| log::error!("Output stream error: {}", err),
                None,
            ) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(PlaybackError::Device(format!(
                        "Failed to build output stream: {}",
                        e
                    ))));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(PlaybackError::Device(format!(
                    "Failed to start output stream: {}",
                    e
                ))));
                return;
            }

            let _ = ready_tx.send(Ok(()));
            let _ = stop_rx.recv();
            drop(stream);
            log::debug!("Output thread exiting");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::info!("Output context open ({} Hz)", device_rate);
                Ok(Self {
                    shared,
                    worker: Some(OutputWorker { stop_tx, handle }),
                    next_id: 0,
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(PlaybackError::Device("Output thread died".to_string()))
            }
        }
    }

    fn render(
        shared: &Arc<Mutex<OutputState>>,
        ended_tx: &mpsc::UnboundedSender<SourceId>,
        data: &mut [f32],
        output_channels: usize,
    ) {
        let mut state = match shared.lock() {
            Ok(state) => state,
            Err(_) => return, // poisoned by a panicking writer; render silence
        };
        let device_rate = state.device_rate as f64;
        let mut clock = state.frames_rendered as f64 / device_rate;

        for frame in data.chunks_mut(output_channels) {
            let mut mixed = 0.0f32;

            for source in state.sources.iter_mut() {
                if source.done || clock < source.start {
                    continue;
                }

                let index = source.pos.floor() as usize;
                if index + 1 >= source.samples.len() {
                    source.done = true;
                    continue;
                }
                let fract = (source.pos - index as f64) as f32;
                mixed += source.samples[index] * (1.0 - fract) + source.samples[index + 1] * fract;
                source.pos += source.sample_rate as f64 / device_rate;
            }

            let sample = mixed.clamp(-1.0, 1.0);
            for channel in frame.iter_mut() {
                *channel = sample;
            }
            clock += 1.0 / device_rate;
        }

        state.frames_rendered += (data.len() / output_channels) as u64;

        state.sources.retain(|source| {
            if source.done {
                let _ = ended_tx.send(source.id);
                false
            } else {
                true
            }
        });
    }
}

impl OutputContext for CpalOutput {
    fn now(&self) -> f64 {
        let state = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        state.frames_rendered as f64 / state.device_rate as f64
    }

    fn start_source(&mut self, clip: AudioClip, at: f64) -> SourceId {
        let id = self.next_id;
        self.next_id += 1;

        let mut state = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        state.sources.push(ActiveSource {
            id,
            start: at,
            samples: clip.samples,
            sample_rate: clip.sample_rate,
            pos: 0.0,
            done: false,
        });
        id
    }

    fn stop_source(&mut self, id: SourceId) {
        let mut state = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        state.sources.retain(|source| source.id != id);
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(WorkerSignal::Stop);
            if let Err(e) = worker.handle.join() {
                log::error!("Failed to join output thread: {:?}", e);
            }
            self.shared
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .sources
                .clear();
            log::info!("Output context closed");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}
