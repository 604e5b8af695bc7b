//! Session state machine tests against fake devices and a fake transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use voice_live_rs::capture::{Capture, CaptureError, CaptureFrame};
use voice_live_rs::channel::{ChannelError, ChannelEvent, ChannelHandle, Connector};
use voice_live_rs::codec::{self, AudioClip};
use voice_live_rs::config::{LiveConfig, OUTPUT_SAMPLE_RATE};
use voice_live_rs::playback::{OutputContext, PlaybackError, SourceId};
use voice_live_rs::session::{SessionController, SessionDevices, SessionState};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Fake microphone.

#[derive(Default)]
struct MicState {
    started: u32,
    stopped: u32,
    fail_start: bool,
    /// Makes `stop()` block, to widen the teardown window.
    stop_delay: Option<Duration>,
    frame_tx: Option<mpsc::Sender<CaptureFrame>>,
}

#[derive(Clone, Default)]
struct FakeMic(Arc<Mutex<MicState>>);

impl Capture for FakeMic {
    fn start(&mut self, frames: mpsc::Sender<CaptureFrame>) -> Result<(), CaptureError> {
        let mut state = self.0.lock().unwrap();
        if state.fail_start {
            return Err(CaptureError::NoDevice);
        }
        state.started += 1;
        state.frame_tx = Some(frames);
        Ok(())
    }

    fn stop(&mut self) {
        let delay = self.0.lock().unwrap().stop_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut state = self.0.lock().unwrap();
        state.stopped += 1;
        state.frame_tx = None;
    }
}

// Fake output context.

#[derive(Default)]
struct OutState {
    now: f64,
    next_id: SourceId,
    /// (id, start time, duration)
    started: Vec<(SourceId, f64, f64)>,
    stopped: Vec<SourceId>,
    closed: u32,
}

#[derive(Clone, Default)]
struct FakeOutput(Arc<Mutex<OutState>>);

impl OutputContext for FakeOutput {
    fn now(&self) -> f64 {
        self.0.lock().unwrap().now
    }

    fn start_source(&mut self, clip: AudioClip, at: f64) -> SourceId {
        let mut state = self.0.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.started.push((id, at, clip.duration()));
        id
    }

    fn stop_source(&mut self, id: SourceId) {
        self.0.lock().unwrap().stopped.push(id);
    }

    fn close(&mut self) {
        self.0.lock().unwrap().closed += 1;
    }
}

// Fake devices.

#[derive(Default)]
struct FakeDevices {
    mic: Arc<Mutex<MicState>>,
    out: Arc<Mutex<OutState>>,
    fail_mic_acquire: bool,
}

impl SessionDevices for FakeDevices {
    type Mic = FakeMic;
    type Output = FakeOutput;

    fn acquire_mic(&mut self) -> Result<Self::Mic, CaptureError> {
        if self.fail_mic_acquire {
            return Err(CaptureError::NoDevice);
        }
        Ok(FakeMic(Arc::clone(&self.mic)))
    }

    fn open_output(
        &mut self,
        _ended_tx: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Self::Output, PlaybackError> {
        Ok(FakeOutput(Arc::clone(&self.out)))
    }
}

// Fake connector.

#[derive(Clone, Copy, Default)]
enum OpenMode {
    #[default]
    Ready,
    Fail,
    /// The handshake never resolves.
    Pending,
}

#[derive(Default)]
struct ConnState {
    mode: OpenMode,
    opens: u32,
    events_tx: Option<mpsc::Sender<ChannelEvent>>,
    sent: Vec<Vec<u8>>,
    closed: u32,
}

#[derive(Clone, Default)]
struct FakeConnector(Arc<Mutex<ConnState>>);

struct FakeHandle(Arc<Mutex<ConnState>>);

impl ChannelHandle for FakeHandle {
    fn send_frame(&self, pcm: &[u8]) {
        self.0.lock().unwrap().sent.push(pcm.to_vec());
    }

    fn close(&self) {
        self.0.lock().unwrap().closed += 1;
    }
}

#[async_trait::async_trait]
impl Connector for FakeConnector {
    async fn open(
        &self,
        _config: &LiveConfig,
    ) -> Result<(Box<dyn ChannelHandle>, mpsc::Receiver<ChannelEvent>), ChannelError> {
        let mode = self.0.lock().unwrap().mode;
        match mode {
            OpenMode::Fail => {
                self.0.lock().unwrap().opens += 1;
                Err(ChannelError::WebSocket(
                    tokio_tungstenite::tungstenite::Error::ConnectionClosed,
                ))
            }
            OpenMode::Pending => {
                self.0.lock().unwrap().opens += 1;
                futures_util::future::pending::<()>().await;
                unreachable!()
            }
            OpenMode::Ready => {
                let (tx, rx) = mpsc::channel(16);
                let mut state = self.0.lock().unwrap();
                state.opens += 1;
                state.events_tx = Some(tx);
                Ok((Box::new(FakeHandle(Arc::clone(&self.0))), rx))
            }
        }
    }
}

// Test harness.

struct Harness {
    controller: SessionController<FakeDevices, FakeConnector>,
    mic: Arc<Mutex<MicState>>,
    out: Arc<Mutex<OutState>>,
    conn: Arc<Mutex<ConnState>>,
}

impl Harness {
    fn new(mode: OpenMode) -> Self {
        init_logging();
        let devices = FakeDevices::default();
        let mic = Arc::clone(&devices.mic);
        let out = Arc::clone(&devices.out);
        let connector = FakeConnector::default();
        connector.0.lock().unwrap().mode = mode;
        let conn = Arc::clone(&connector.0);

        let config = LiveConfig::with_key("test-key".to_string()).unwrap();
        Self {
            controller: SessionController::new(config, devices, connector),
            mic,
            out,
            conn,
        }
    }

    async fn wait_until(&self, what: &str, mut condition: impl FnMut(&Self) -> bool) {
        let deadline = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if condition(self) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
        deadline.await.unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }

    async fn send_event(&self, event: ChannelEvent) {
        let tx = self
            .conn
            .lock()
            .unwrap()
            .events_tx
            .clone()
            .expect("channel not opened yet");
        tx.send(event).await.expect("session loop gone");
    }

    async fn connect_until_open(&mut self) {
        let opens_before = self.conn.lock().unwrap().opens;
        self.controller.connect().await.unwrap();
        self.wait_until("channel open call", |h| {
            h.conn.lock().unwrap().opens > opens_before
        })
        .await;
        self.send_event(ChannelEvent::Open).await;
        self.wait_until("connected state", |h| h.controller.is_connected())
            .await;
    }
}

fn audio_chunk(duration: f64) -> ChannelEvent {
    let samples = vec![0.1f32; (duration * OUTPUT_SAMPLE_RATE as f64).round() as usize];
    ChannelEvent::Audio {
        data: codec::encode_base64(&codec::encode_pcm16(&samples)),
    }
}

#[tokio::test]
async fn end_to_end_frame_out_audio_in_interruption() {
    let mut h = Harness::new(OpenMode::Ready);
    h.connect_until_open().await;
    assert_eq!(h.mic.lock().unwrap().started, 1);

    // Microphone frame: volume becomes visible, encoded bytes go out.
    let frame_tx = h.mic.lock().unwrap().frame_tx.clone().unwrap();
    let samples = vec![0.084f32; 4096];
    frame_tx
        .send(CaptureFrame {
            samples: samples.clone(),
            volume: 0.42,
        })
        .await
        .unwrap();
    h.wait_until("volume update", |h| {
        (h.controller.volume() - 0.42).abs() < 1e-6
    })
    .await;
    h.wait_until("frame transmitted", |h| !h.conn.lock().unwrap().sent.is_empty())
        .await;
    assert_eq!(
        h.conn.lock().unwrap().sent[0],
        codec::encode_pcm16(&samples)
    );

    // Model audio at device time 10.0: 0.5s then 0.3s, back to back.
    h.out.lock().unwrap().now = 10.0;
    h.send_event(audio_chunk(0.5)).await;
    h.wait_until("first chunk scheduled", |h| {
        h.out.lock().unwrap().started.len() == 1
    })
    .await;
    h.send_event(audio_chunk(0.3)).await;
    h.wait_until("second chunk scheduled", |h| {
        h.out.lock().unwrap().started.len() == 2
    })
    .await;
    {
        let out = h.out.lock().unwrap();
        let (_, at0, dur0) = out.started[0];
        let (_, at1, dur1) = out.started[1];
        assert!((at0 - 10.0).abs() < 1e-9 && (dur0 - 0.5).abs() < 1e-6);
        assert!((at1 - 10.5).abs() < 1e-9 && (dur1 - 0.3).abs() < 1e-6);
    }

    // Interruption at 10.6 stops both in-flight sources immediately.
    h.out.lock().unwrap().now = 10.6;
    h.send_event(ChannelEvent::Interrupted).await;
    h.wait_until("both sources stopped", |h| {
        h.out.lock().unwrap().stopped.len() == 2
    })
    .await;

    // Cursor was reset: the next chunk starts at the clock, not at 10.8.
    h.send_event(audio_chunk(0.2)).await;
    h.wait_until("post-flush chunk scheduled", |h| {
        h.out.lock().unwrap().started.len() == 3
    })
    .await;
    let (_, at2, _) = h.out.lock().unwrap().started[2];
    assert!((at2 - 10.6).abs() < 1e-9);

    h.controller.disconnect();
    h.controller.wait_idle().await;
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.controller.volume(), 0.0);
    assert_eq!(h.out.lock().unwrap().closed, 1);
    assert!(h.mic.lock().unwrap().stopped >= 1);
    assert!(h.conn.lock().unwrap().closed >= 1);
}

#[tokio::test]
async fn stale_open_after_disconnect_does_not_reactivate() {
    let mut h = Harness::new(OpenMode::Ready);
    h.controller.connect().await.unwrap();
    h.wait_until("channel open call", |h| h.conn.lock().unwrap().opens > 0)
        .await;

    // Disconnect before the server handshake resolves.
    h.controller.disconnect();
    h.controller.wait_idle().await;
    assert_eq!(h.controller.state(), SessionState::Idle);

    // The late open lands nowhere: the loop is gone, capture never starts.
    let tx = h.conn.lock().unwrap().events_tx.clone().unwrap();
    assert!(tx.send(ChannelEvent::Open).await.is_err());
    assert_eq!(h.mic.lock().unwrap().started, 0);
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.out.lock().unwrap().closed, 1);
}

#[tokio::test]
async fn disconnect_while_handshake_pending() {
    let mut h = Harness::new(OpenMode::Pending);
    h.controller.connect().await.unwrap();
    assert!(h.controller.is_connecting());

    h.controller.disconnect();
    h.controller.wait_idle().await;

    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.mic.lock().unwrap().started, 0);
    assert!(h.mic.lock().unwrap().stopped >= 1);
    assert_eq!(h.out.lock().unwrap().closed, 1);
}

#[tokio::test]
async fn handshake_failure_returns_to_idle_with_error() {
    let mut h = Harness::new(OpenMode::Fail);
    h.controller.connect().await.unwrap();
    h.controller.wait_idle().await;

    assert_eq!(h.controller.state(), SessionState::Idle);
    let error = h.controller.error().expect("error should be surfaced");
    assert!(error.contains("handshake"), "unexpected error: {}", error);
    assert_eq!(h.out.lock().unwrap().closed, 1);
    assert_eq!(h.mic.lock().unwrap().started, 0);
}

#[tokio::test]
async fn mic_acquisition_failure_is_fatal_to_connect() {
    init_logging();
    let mut devices = FakeDevices::default();
    devices.fail_mic_acquire = true;
    let config = LiveConfig::with_key("test-key".to_string()).unwrap();
    let mut controller = SessionController::new(config, devices, FakeConnector::default());

    let result = controller.connect().await;
    assert!(result.is_err());
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(controller.error().is_some());
}

#[tokio::test]
async fn transport_error_tears_down_and_records_message() {
    let mut h = Harness::new(OpenMode::Ready);
    h.connect_until_open().await;

    h.send_event(ChannelEvent::Error("network down".to_string()))
        .await;
    h.controller.wait_idle().await;

    assert_eq!(h.controller.state(), SessionState::Idle);
    let error = h.controller.error().unwrap();
    assert!(error.contains("network down"));
    assert_eq!(h.out.lock().unwrap().closed, 1);
    assert!(h.mic.lock().unwrap().stopped >= 1);
}

#[tokio::test]
async fn server_close_tears_down_without_error() {
    let mut h = Harness::new(OpenMode::Ready);
    h.connect_until_open().await;

    h.send_event(ChannelEvent::Closed).await;
    h.controller.wait_idle().await;

    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.controller.error(), None);
    assert_eq!(h.out.lock().unwrap().closed, 1);
}

#[tokio::test]
async fn undecodable_chunk_is_dropped_session_survives() {
    let mut h = Harness::new(OpenMode::Ready);
    h.connect_until_open().await;

    h.send_event(ChannelEvent::Audio {
        data: "@@not-base64@@".to_string(),
    })
    .await;
    h.send_event(audio_chunk(0.5)).await;

    h.wait_until("valid chunk scheduled", |h| {
        h.out.lock().unwrap().started.len() == 1
    })
    .await;
    assert!(h.controller.is_connected());
}

#[tokio::test]
async fn disconnect_is_idempotent_and_safe_when_idle() {
    let mut h = Harness::new(OpenMode::Ready);

    // Idle: nothing to do, no panic.
    h.controller.disconnect();
    assert_eq!(h.controller.state(), SessionState::Idle);

    h.connect_until_open().await;
    h.controller.disconnect();
    h.controller.disconnect();
    h.controller.wait_idle().await;
    h.controller.disconnect();

    assert_eq!(h.controller.state(), SessionState::Idle);
    // Each owned resource was released exactly once.
    assert_eq!(h.out.lock().unwrap().closed, 1);
}

#[tokio::test]
async fn connect_is_noop_while_active() {
    let mut h = Harness::new(OpenMode::Ready);
    h.connect_until_open().await;

    h.controller.connect().await.unwrap();
    assert_eq!(h.conn.lock().unwrap().opens, 1);
    assert!(h.controller.is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_during_slow_teardown_waits_for_old_session() {
    let mut h = Harness::new(OpenMode::Ready);
    h.mic.lock().unwrap().stop_delay = Some(Duration::from_millis(150));
    h.connect_until_open().await;

    h.controller.disconnect();
    h.wait_until("teardown in progress", |h| {
        h.controller.state() == SessionState::Closing
    })
    .await;

    // Reconnect while the old loop is still stopping its devices; it must
    // finish before the new session exists.
    h.connect_until_open().await;
    assert_eq!(h.conn.lock().unwrap().opens, 2);
    assert_eq!(h.mic.lock().unwrap().started, 2);

    // The old teardown ran to completion before the new session was built,
    // so its final state writes cannot land on the new session.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.controller.state(), SessionState::Connected);
}

#[tokio::test]
async fn disconnect_then_immediate_connect_reconnects() {
    let mut h = Harness::new(OpenMode::Ready);
    h.connect_until_open().await;

    // No wait between the two: the state still reads Connected while the
    // disconnect command is in flight, but the reconnect must not no-op.
    h.controller.disconnect();
    h.connect_until_open().await;

    assert_eq!(h.conn.lock().unwrap().opens, 2);
    assert!(h.controller.is_connected());
}

#[tokio::test]
async fn reconnect_builds_fresh_contexts() {
    let mut h = Harness::new(OpenMode::Ready);
    h.connect_until_open().await;
    h.controller.disconnect();
    h.controller.wait_idle().await;

    h.connect_until_open().await;
    assert_eq!(h.conn.lock().unwrap().opens, 2);
    assert_eq!(h.mic.lock().unwrap().started, 2);
}
