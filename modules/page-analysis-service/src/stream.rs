//! Stream consumer: pumps one session's event queue into a frame sink.
//!
//! Frame sequence per connection: `session`, then any mix of `message` and
//! `ping`, then for a final event one `message` followed by a terminal
//! `final_result` or `error`, and always `close` last. A consumer that
//! attaches after the final event was already taken gets a terminal frame
//! rebuilt from the session state instead.

use crate::registry::{SessionEntry, SessionRegistry};
use async_trait::async_trait;
use chrono::Utc;
use page_analysis_types::{Event, EventPayload, SessionStatus};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const SERVICE_NAME: &str = "page_analysis";

/// One outbound stream frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: u64,
    pub kind: FrameKind,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Session,
    Message,
    Ping,
    FinalResult,
    Error,
    Close,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Session => "session",
            FrameKind::Message => "message",
            FrameKind::Ping => "ping",
            FrameKind::FinalResult => "final_result",
            FrameKind::Error => "error",
            FrameKind::Close => "close",
        }
    }
}

#[derive(Debug)]
pub struct SinkError(pub String);

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream sink error: {}", self.0)
    }
}

impl std::error::Error for SinkError {}

/// Transport the consumer writes frames into
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), SinkError>;

    /// True once the client has gone away
    fn is_closed(&self) -> bool;
}

/// Sink backed by a bounded channel that feeds an HTTP response body
pub struct ChannelSink {
    tx: mpsc::Sender<Frame>,
}

impl ChannelSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Frame) -> Result<(), SinkError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| SinkError("client disconnected".to_string()))
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Final event delivered
    Finished,
    /// Client went away before the final event
    Disconnected,
    /// Sink write failed
    SinkFailed,
}

pub struct StreamConsumer {
    registry: Arc<SessionRegistry>,
    entry: Arc<SessionEntry>,
    poll_interval: Duration,
    grace: Duration,
    next_id: u64,
}

impl StreamConsumer {
    pub fn new(
        registry: Arc<SessionRegistry>,
        entry: Arc<SessionEntry>,
        poll_interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            registry,
            entry,
            poll_interval,
            grace,
            next_id: 0,
        }
    }

    fn frame(&mut self, kind: FrameKind, data: Value) -> Frame {
        let id = self.next_id;
        self.next_id += 1;
        Frame { id, kind, data }
    }

    pub async fn run<S: FrameSink>(mut self, sink: &mut S) -> StreamOutcome {
        let session_id = self.entry.queue.session_id().to_string();
        log::info!("[STREAM] Consumer attached to session {}", session_id);
        if self.entry.queue.is_closed() {
            log::debug!("[STREAM] Session {} already queued its final event", session_id);
        }

        let outcome = match self.pump(sink, &session_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("[STREAM] {} for session {}", e, session_id);
                let frame = self.frame(
                    FrameKind::Error,
                    json!({
                        "content": "Stream interrupted",
                        "error": e.to_string(),
                        "region": "error",
                        "source": "system",
                        "is_final": true,
                        "timestamp": Utc::now(),
                    }),
                );
                let _ = sink.send(frame).await;
                StreamOutcome::SinkFailed
            }
        };

        let close = self.frame(FrameKind::Close, json!({ "message": "stream closed" }));
        if sink.send(close).await.is_err() {
            log::debug!("[STREAM] Close frame not delivered for session {}", session_id);
        }
        log::info!("[STREAM] Consumer for session {} ended: {:?}", session_id, outcome);
        outcome
    }

    async fn pump<S: FrameSink>(
        &mut self,
        sink: &mut S,
        session_id: &str,
    ) -> Result<StreamOutcome, SinkError> {
        let hello = self.frame(
            FrameKind::Session,
            json!({
                "session_id": session_id,
                "status": "connected",
                "service": SERVICE_NAME,
            }),
        );
        sink.send(hello).await?;

        loop {
            if sink.is_closed() {
                return Ok(StreamOutcome::Disconnected);
            }

            let event = match self.entry.queue.take(self.poll_interval).await {
                Some(event) => event,
                // Final event already consumed; nothing more will arrive
                None if self.entry.queue.is_closed() => {
                    log::info!(
                        "[STREAM] Session {} already finished, replaying terminal state",
                        session_id
                    );
                    let (kind, data) = replayed_terminal_frame(&self.entry);
                    let terminal = self.frame(kind, data);
                    sink.send(terminal).await?;
                    return Ok(StreamOutcome::Finished);
                }
                None => {
                    let ping = self.frame(FrameKind::Ping, json!({ "timestamp": Utc::now() }));
                    sink.send(ping).await?;
                    continue;
                }
            };

            self.registry.touch(session_id);

            if log::log_enabled!(log::Level::Debug) {
                log::debug!(
                    "[STREAM] {} #{} {}",
                    session_id,
                    event.sequence,
                    event.payload.content()
                );
            }

            let is_final = event.is_final;
            let message = self.frame(FrameKind::Message, message_data(&event));
            sink.send(message).await?;

            if is_final {
                let (kind, data) = terminal_frame(&event);
                let terminal = self.frame(kind, data);
                sink.send(terminal).await?;
                tokio::time::sleep(self.grace).await;
                return Ok(StreamOutcome::Finished);
            }
        }
    }
}

/// `message` frame body: the flattened event plus its display region
fn message_data(event: &Event) -> Value {
    let mut data = serde_json::to_value(event).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut data {
        map.insert("region".to_string(), json!(event.payload.region()));
        // The aggregate travels on the terminal frame only
        map.remove("result");
    }
    data
}

fn terminal_frame(event: &Event) -> (FrameKind, Value) {
    let base = |content: &str| {
        json!({
            "session_id": event.session_id,
            "content": content,
            "source": event.source,
            "is_final": true,
            "timestamp": event.timestamp,
        })
    };

    match &event.payload {
        EventPayload::FinalResult { content, result } => {
            let mut data = base(content);
            data["region"] = json!("process");
            data["result"] = serde_json::to_value(result).unwrap_or(Value::Null);
            (FrameKind::FinalResult, data)
        }
        EventPayload::Error { content, error } => {
            let mut data = base(content);
            data["region"] = json!("error");
            data["error"] = json!(error);
            (FrameKind::Error, data)
        }
        // Message/Progress are never final; report as an error frame if one is
        other => {
            let mut data = base(other.content());
            data["region"] = json!("error");
            data["error"] = json!("unexpected final event");
            (FrameKind::Error, data)
        }
    }
}

/// Terminal frame for a session whose final event went to an earlier consumer
fn replayed_terminal_frame(entry: &SessionEntry) -> (FrameKind, Value) {
    let state = entry.state.read();
    let snapshot = state.snapshot();
    let mut data = json!({
        "session_id": snapshot.session_id,
        "source": "system",
        "is_final": true,
        "timestamp": Utc::now(),
        "status": snapshot,
    });

    match state.status {
        SessionStatus::Completed => {
            data["content"] = json!("Analysis already completed");
            data["region"] = json!("process");
            data["results"] = serde_json::to_value(&state.results).unwrap_or(Value::Null);
            (FrameKind::FinalResult, data)
        }
        _ => {
            let error = state.error.clone().unwrap_or_else(|| "session ended".to_string());
            data["content"] = json!(format!("Analysis failed: {}", error));
            data["region"] = json!("error");
            data["error"] = json!(error);
            (FrameKind::Error, data)
        }
    }
}
