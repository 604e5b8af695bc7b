use crate::capture::{Capture, CaptureError, CaptureFrame, CpalCapture};
use crate::channel::{ChannelEvent, ChannelHandle, Connector, GeminiConnector};
use crate::codec;
use crate::config::{self, LiveConfig, OUTPUT_SAMPLE_RATE};
use crate::error::SessionError;
use crate::playback::{CpalOutput, OutputContext, PlaybackError, PlaybackScheduler, SourceId};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capture frames buffered ahead of the session loop. Small: stale microphone
/// audio is dropped rather than queued.
const FRAME_QUEUE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
}

/// UI-visible session status, shared between the controller and the event
/// loop task. All mutation happens on the loop; readers only observe.
#[derive(Debug)]
struct SharedStatus {
    state: AtomicU8,
    /// f32 bits of the instantaneous volume in 0..1.
    volume: AtomicU32,
    error: Mutex<Option<String>>,
}

impl SharedStatus {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Idle as u8),
            volume: AtomicU32::new(0.0f32.to_bits()),
            error: Mutex::new(None),
        }
    }

    fn state(&self) -> SessionState {
        SessionState::from_repr(self.state.load(Ordering::Acquire)).unwrap_or(SessionState::Idle)
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Acquire))
    }

    fn set_volume(&self, volume: f32) {
        self.volume.store(volume.to_bits(), Ordering::Release);
    }

    fn error(&self) -> Option<String> {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_error(&self, error: Option<String>) {
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }
}

/// Factory for the per-connect device contexts. A fresh connect always builds
/// fresh contexts; none are reused across sessions.
pub trait SessionDevices: Send {
    type Mic: Capture + 'static;
    type Output: OutputContext + 'static;

    fn acquire_mic(&mut self) -> Result<Self::Mic, CaptureError>;

    fn open_output(
        &mut self,
        ended_tx: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Self::Output, PlaybackError>;
}

/// Real microphone and speaker contexts.
#[derive(Default)]
pub struct CpalDevices {
    pub input_device: Option<String>,
}

impl SessionDevices for CpalDevices {
    type Mic = CpalCapture;
    type Output = CpalOutput;

    fn acquire_mic(&mut self) -> Result<Self::Mic, CaptureError> {
        CpalCapture::acquire(self.input_device.clone())
    }

    fn open_output(
        &mut self,
        ended_tx: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Self::Output, PlaybackError> {
        CpalOutput::open(ended_tx)
    }
}

enum Command {
    Disconnect,
}

struct ActiveSession {
    cmd_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
    /// Set by `disconnect()`; the loop may not have processed the command yet.
    disconnecting: bool,
}

/// Orchestrates one live voice session at a time.
///
/// A single tokio task is the sole arbiter of session state: it selects over
/// disconnect commands, channel events, capture frames and playback
/// completions, so no state transition ever races another. Dropping the
/// controller ends the session.
///
/// Microphone frames observed before the server handshake resolves are
/// dropped, not queued; buffering stale audio would only replay it late.
pub struct SessionController<D: SessionDevices, C: Connector> {
    config: Arc<LiveConfig>,
    devices: D,
    connector: Arc<C>,
    shared: Arc<SharedStatus>,
    active: Option<ActiveSession>,
}

/// The production controller: cpal devices talking to the hosted live API.
pub type LiveSession = SessionController<CpalDevices, GeminiConnector>;

impl LiveSession {
    /// Build a session from environment configuration and default devices.
    pub fn from_env() -> Result<Self, SessionError> {
        let config = config::load_config()?;
        Ok(Self::new(config, CpalDevices::default(), GeminiConnector))
    }
}

impl<D, C> SessionController<D, C>
where
    D: SessionDevices,
    C: Connector + 'static,
{
    pub fn new(config: LiveConfig, devices: D, connector: C) -> Self {
        Self {
            config: Arc::new(config),
            devices,
            connector: Arc::new(connector),
            shared: Arc::new(SharedStatus::new()),
            active: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state() == SessionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.shared.state() == SessionState::Connecting
    }

    /// Instantaneous microphone volume in 0..1, for visualization.
    pub fn volume(&self) -> f32 {
        self.shared.volume()
    }

    /// Last session error, human-readable; cleared on the next connect.
    pub fn error(&self) -> Option<String> {
        self.shared.error()
    }

    /// Open a session: acquire the microphone and output contexts, then start
    /// the event loop that opens the channel and streams in both directions.
    ///
    /// No-op when already connecting or connected. When a previous session is
    /// still tearing down, or a disconnect has been requested but not yet
    /// processed, waits for that loop to finish first: the new session must
    /// never coexist with one that can still write the shared status. Device
    /// acquisition failures are returned directly; everything after
    /// (handshake, mid-session transport errors) surfaces through
    /// [`error`](Self::error) and returns the session to idle.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        let disconnecting = self.active.as_ref().is_some_and(|a| a.disconnecting);
        match self.shared.state() {
            SessionState::Connecting | SessionState::Connected if !disconnecting => {
                log::debug!("connect() ignored: session already active");
                return Ok(());
            }
            _ => {}
        }

        // A previous loop may still be inside teardown (state Closing, or a
        // queued disconnect). Wait it out before touching the shared status.
        self.wait_idle().await;
        self.shared.set_error(None);
        self.shared.set_state(SessionState::Connecting);

        let mic = match self.devices.acquire_mic() {
            Ok(mic) => mic,
            Err(e) => return Err(self.fail_connect(SessionError::from(e))),
        };

        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let output = match self.devices.open_output(ended_tx) {
            Ok(output) => output,
            Err(e) => return Err(self.fail_connect(SessionError::from(e))),
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let task = tokio::spawn(run_session(
            Arc::clone(&self.config),
            Arc::clone(&self.connector),
            mic,
            output,
            ended_rx,
            cmd_rx,
            Arc::clone(&self.shared),
        ));
        self.active = Some(ActiveSession {
            cmd_tx,
            task,
            disconnecting: false,
        });
        Ok(())
    }

    fn fail_connect(&self, error: SessionError) -> SessionError {
        log::error!("Connect failed: {}", error);
        self.shared.set_error(Some(error.to_string()));
        self.shared.set_volume(0.0);
        self.shared.set_state(SessionState::Idle);
        error
    }

    /// Request full teardown. Always safe, in any state; a second call, or a
    /// call while idle, is a no-op. A `connect()` issued before the loop has
    /// processed the command waits for the teardown instead of no-opping.
    pub fn disconnect(&mut self) {
        match &mut self.active {
            Some(active) => {
                active.disconnecting = true;
                if active.cmd_tx.try_send(Command::Disconnect).is_err() {
                    log::debug!("disconnect(): session loop already gone");
                }
            }
            None => log::debug!("disconnect(): no active session"),
        }
    }

    /// Wait for the session task to finish after a disconnect or failure.
    pub async fn wait_idle(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.task.await;
        }
    }
}

/// The single-arbiter event loop. Owns every session resource; exits only
/// through `teardown`, so every exit path releases everything exactly once.
async fn run_session<C, M, O>(
    config: Arc<LiveConfig>,
    connector: Arc<C>,
    mut mic: M,
    output: O,
    mut ended_rx: mpsc::UnboundedReceiver<SourceId>,
    mut cmd_rx: mpsc::Receiver<Command>,
    shared: Arc<SharedStatus>,
) where
    C: Connector,
    M: Capture,
    O: OutputContext,
{
    let mut scheduler = PlaybackScheduler::new(output);

    let opened = tokio::select! {
        result = connector.open(&config) => result,
        _ = cmd_rx.recv() => {
            // Disconnected while the handshake was pending. The eventual open
            // must not act: tearing down here drops the event receiver, so a
            // late Open has nowhere to land.
            log::info!("Disconnected during connect");
            teardown(&mut mic, &mut scheduler, None, &shared);
            return;
        }
    };

    let (handle, mut events) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let error = SessionError::Handshake(e.to_string());
            log::error!("{}", error);
            shared.set_error(Some(error.to_string()));
            teardown(&mut mic, &mut scheduler, None, &shared);
            return;
        }
    };

    let (frame_tx, mut frame_rx) = mpsc::channel::<CaptureFrame>(FRAME_QUEUE);

    loop {
        tokio::select! {
            // Disconnect command, or the controller itself was dropped.
            _ = cmd_rx.recv() => {
                log::info!("Disconnect requested");
                break;
            }

            event = events.recv() => match event {
                Some(ChannelEvent::Open) => {
                    if shared.state() == SessionState::Connected {
                        log::warn!("Duplicate open event ignored");
                        continue;
                    }
                    if let Err(e) = mic.start(frame_tx.clone()) {
                        let error = SessionError::from(e);
                        log::error!("{}", error);
                        shared.set_error(Some(error.to_string()));
                        break;
                    }
                    shared.set_state(SessionState::Connected);
                    log::info!("Session connected");
                }
                Some(ChannelEvent::Audio { data }) => {
                    let decoded = codec::decode_base64(&data)
                        .and_then(|bytes| codec::decode_pcm16(&bytes, OUTPUT_SAMPLE_RATE));
                    match decoded {
                        Ok(clip) => {
                            scheduler.schedule(clip);
                        }
                        // Recoverable: drop the chunk, keep the session.
                        Err(e) => log::warn!("Dropping undecodable audio chunk: {}", e),
                    }
                }
                Some(ChannelEvent::Interrupted) => {
                    log::info!("Server interruption, flushing queued playback");
                    scheduler.flush();
                }
                Some(ChannelEvent::Closed) | None => {
                    log::info!("Channel closed by server");
                    break;
                }
                Some(ChannelEvent::Error(message)) => {
                    let error = SessionError::Transport(message);
                    log::error!("{}", error);
                    shared.set_error(Some(error.to_string()));
                    break;
                }
            },

            Some(frame) = frame_rx.recv() => {
                shared.set_volume(frame.volume);
                if shared.state() == SessionState::Connected {
                    handle.send_frame(&codec::encode_pcm16(&frame.samples));
                } else {
                    // Drop policy: frames from before the handshake resolved
                    // are stale by the time the channel could carry them.
                    log::debug!("Dropping capture frame: handshake not resolved");
                }
            }

            Some(id) = ended_rx.recv() => scheduler.source_ended(id),
        }
    }

    teardown(&mut mic, &mut scheduler, Some(&*handle), &shared);
}

/// Total cleanup, reachable from every exit path. Each step is idempotent, so
/// reentry cannot double-release a device context.
fn teardown<M, O>(
    mic: &mut M,
    scheduler: &mut PlaybackScheduler<O>,
    handle: Option<&dyn ChannelHandle>,
    shared: &SharedStatus,
) where
    M: Capture,
    O: OutputContext,
{
    shared.set_state(SessionState::Closing);
    mic.stop();
    scheduler.shutdown();
    if let Some(handle) = handle {
        handle.close();
    }
    shared.set_volume(0.0);
    shared.set_state(SessionState::Idle);
    log::info!("Session torn down");
}
