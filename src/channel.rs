use crate::codec;
use crate::config::{LiveConfig, INPUT_SAMPLE_RATE};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/\
    google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Outbound frames queued ahead of the writer task. Small on purpose: stale
/// microphone audio is worthless, dropping beats buffering.
const OUTBOUND_QUEUE: usize = 32;

/// Inbound events delivered to the session loop before it reads them.
const EVENT_QUEUE: usize = 64;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("WebSocket connection failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Everything the channel can tell the session, as a closed union the session
/// matches exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Server handshake completed; the session may start streaming.
    Open,
    /// A model audio chunk, still base64-encoded PCM16 at 24 kHz.
    Audio { data: String },
    /// Barge-in: the user started talking, drop queued model audio.
    Interrupted,
    /// Server closed the connection.
    Closed,
    /// Transport failure; fatal to the session.
    Error(String),
}

/// Write half of an open channel. `send_frame` is fire-and-forget; `close` is
/// idempotent.
pub trait ChannelHandle: Send + Sync {
    fn send_frame(&self, pcm: &[u8]);
    fn close(&self);
}

/// Seam for opening a channel, so the session state machine is testable with a
/// fake transport.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        config: &LiveConfig,
    ) -> Result<(Box<dyn ChannelHandle>, mpsc::Receiver<ChannelEvent>), ChannelError>;
}

// Typed views of the server JSON payloads.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<SetupComplete>,
    server_content: Option<ServerContent>,
}

#[derive(Debug, Deserialize)]
struct SetupComplete {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    interrupted: Option<bool>,
    model_turn: Option<ModelTurn>,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
}

/// Parse one server payload into events. Unknown or partial messages yield
/// nothing; a parse failure is logged and skipped, never fatal.
fn parse_server_message(payload: &str) -> Vec<ChannelEvent> {
    let message: ServerMessage = match serde_json::from_str(payload) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Failed to parse server message: {}", e);
            return Vec::new();
        }
    };

    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(ChannelEvent::Open);
    }

    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    events.push(ChannelEvent::Audio { data: inline.data });
                }
            }
        }
        if content.interrupted == Some(true) {
            events.push(ChannelEvent::Interrupted);
        }
    }

    events
}

/// The live API sends JSON in both text and binary frames; anything else
/// carries no events.
fn data_frame_events(message: &Message) -> Vec<ChannelEvent> {
    match message {
        Message::Text(text) => parse_server_message(text.as_str()),
        Message::Binary(bytes) => {
            parse_server_message(&String::from_utf8_lossy(bytes.as_slice()))
        }
        _ => Vec::new(),
    }
}

fn setup_message(config: &LiveConfig) -> String {
    json!({
        "setup": {
            "model": format!("models/{}", config.model),
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": config.voice }
                    }
                }
            },
            "systemInstruction": {
                "parts": [{ "text": config.system_instruction }]
            }
        }
    })
    .to_string()
}

fn realtime_input_message(pcm: &[u8]) -> String {
    json!({
        "realtimeInput": {
            "mediaChunks": [{
                "mimeType": format!("audio/pcm;rate={}", INPUT_SAMPLE_RATE),
                "data": codec::encode_base64(pcm)
            }]
        }
    })
    .to_string()
}

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

struct LiveHandle {
    out_tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl ChannelHandle for LiveHandle {
    fn send_frame(&self, pcm: &[u8]) {
        // Fire-and-forget; a full queue means the writer is behind and this
        // frame is already stale.
        if self.out_tx.try_send(Outbound::Frame(pcm.to_vec())).is_err() {
            log::warn!("Outbound frame dropped: writer not keeping up");
        }
    }

    fn close(&self) {
        let _ = self.out_tx.try_send(Outbound::Close);
        self.cancel.cancel();
    }
}

/// Connector for the hosted live API.
pub struct GeminiConnector;

#[async_trait::async_trait]
impl Connector for GeminiConnector {
    async fn open(
        &self,
        config: &LiveConfig,
    ) -> Result<(Box<dyn ChannelHandle>, mpsc::Receiver<ChannelEvent>), ChannelError> {
        let mut url = Url::parse(LIVE_ENDPOINT)?;
        url.query_pairs_mut().append_pair("key", config.api_key());

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        // The handshake starts with the setup message; the server answers
        // with setupComplete, surfaced below as ChannelEvent::Open.
        write.send(Message::Text(setup_message(config).into())).await?;
        log::info!("Channel transport open, setup sent (model: {})", config.model);

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let cancel = CancellationToken::new();

        // Writer task: serializes outbound frames onto the socket.
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    outbound = out_rx.recv() => match outbound {
                        Some(Outbound::Frame(pcm)) => {
                            let msg = realtime_input_message(&pcm);
                            if write.send(Message::Text(msg.into())).await.is_err() {
                                log::warn!("Failed to send audio frame, stopping writer");
                                break;
                            }
                        }
                        Some(Outbound::Close) | None => break,
                    },
                }
            }
            let _ = write.close().await;
            log::debug!("Channel writer exiting");
        });

        // Reader task: turns socket messages into ChannelEvents.
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    msg = read.next() => msg,
                };

                match msg {
                    Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                        for event in data_frame_events(&message) {
                            if event_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed channel: {:?}", frame);
                        let _ = event_tx.send(ChannelEvent::Closed).await;
                        break;
                    }
                    Some(Ok(_)) => {} // ping/pong
                    Some(Err(e)) => {
                        log::error!("Channel transport error: {}", e);
                        let _ = event_tx.send(ChannelEvent::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        let _ = event_tx.send(ChannelEvent::Closed).await;
                        break;
                    }
                }
            }
            reader_cancel.cancel();
            log::debug!("Channel reader exiting");
        });

        Ok((Box::new(LiveHandle { out_tx, cancel }), event_rx))
    }
}
