//! Newline-delimited JSON transport over a byte stream pair (stdin/stdout in
//! production).
//!
//! Inbound frames:
//! `{"type":"message","from":"..","body":".."}`,
//! `{"type":"voice","from":"..","mime_type":"..","transcript":".."}`,
//! `{"type":"disconnect","reason":".."}`.
//! Outbound frames: `{"type":"send","to":"..","text":"..","watermark":".."}`.
//!
//! The input stream outlives any single transport: each connection resumes
//! reading from the shared [`LineInput`] and stops right after a disconnect
//! frame, leaving later lines for the next connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use relay_contract::{
    ConnectionStats, InboundMessage, MessagingTransport, OutboundPayload, SendError,
    TransportConnector, TransportError, TransportEvent, TransportEventSender, VoiceMessage,
};
use relay_core::current_unix_timestamp_ms;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) const REASON_MALFORMED_FRAME: &str = "transport_frame_malformed";

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Line reader plus frame counter shared by every transport built over the
/// same input.
pub(crate) struct LineInput {
    lines: Lines<BufReader<BoxedReader>>,
    sequence: u64,
}

pub(crate) type SharedInput = Arc<tokio::sync::Mutex<LineInput>>;

pub(crate) fn shared_input(reader: BoxedReader) -> SharedInput {
    Arc::new(tokio::sync::Mutex::new(LineInput {
        lines: BufReader::new(reader).lines(),
        sequence: 0,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    Message {
        #[serde(default)]
        id: String,
        from: String,
        #[serde(default)]
        body: String,
    },
    Voice {
        #[serde(default)]
        id: String,
        from: String,
        #[serde(default)]
        mime_type: String,
        #[serde(default)]
        transcript: String,
    },
    Disconnect {
        #[serde(default)]
        reason: String,
    },
}

#[derive(Debug, Serialize)]
struct OutboundFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    to: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    watermark: Option<&'a str>,
}

fn frame_id(id: String, sequence: u64) -> String {
    if id.trim().is_empty() {
        format!("line-{sequence}")
    } else {
        id
    }
}

/// Parses one input line. Blank lines yield `None`.
pub(crate) fn parse_inbound_frame(
    line: &str,
    now_unix_ms: u64,
    sequence: u64,
) -> Result<Option<TransportEvent>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let frame = serde_json::from_str::<InboundFrame>(trimmed)
        .with_context(|| format!("invalid transport frame on line {sequence}"))?;
    let event = match frame {
        InboundFrame::Message { id, from, body } => TransportEvent::Message(InboundMessage {
            id: frame_id(id, sequence),
            from,
            body,
            timestamp_unix_ms: now_unix_ms,
        }),
        InboundFrame::Voice {
            id,
            from,
            mime_type,
            transcript,
        } => TransportEvent::VoiceMessage(VoiceMessage {
            id: frame_id(id, sequence),
            from,
            mime_type,
            audio: transcript.into_bytes(),
        }),
        InboundFrame::Disconnect { reason } => TransportEvent::Disconnected {
            reason: if reason.trim().is_empty() {
                "remote requested disconnect".to_string()
            } else {
                reason
            },
        },
    };
    Ok(Some(event))
}

pub(crate) fn render_outbound_frame(identity: &str, payload: &OutboundPayload) -> Result<String> {
    let frame = OutboundFrame {
        kind: "send",
        to: identity,
        text: &payload.text,
        watermark: payload.watermark.as_deref(),
    };
    let mut line = serde_json::to_string(&frame).context("failed to encode outbound frame")?;
    line.push('\n');
    Ok(line)
}

/// Reads until end of input, a read error, or a disconnect frame. Lines after
/// a disconnect frame stay buffered in `input` for the next connection.
async fn read_frames(
    input: SharedInput,
    events: TransportEventSender,
    input_closed: Arc<Notify>,
    stats: Arc<Mutex<ConnectionStats>>,
) {
    let mut input = input.lock().await;
    loop {
        match input.lines.next_line().await {
            Ok(Some(line)) => {
                input.sequence = input.sequence.saturating_add(1);
                let sequence = input.sequence;
                match parse_inbound_frame(&line, current_unix_timestamp_ms(), sequence) {
                    Ok(Some(event)) => {
                        let disconnect = matches!(event, TransportEvent::Disconnected { .. });
                        if matches!(
                            event,
                            TransportEvent::Message(_) | TransportEvent::VoiceMessage(_)
                        ) {
                            let mut stats = lock(&stats);
                            stats.messages_received = stats.messages_received.saturating_add(1);
                        }
                        if disconnect {
                            lock(&stats).connected = false;
                        }
                        if events.send(event).await.is_err() {
                            debug!("event receiver gone; input reader stopping");
                            return;
                        }
                        if disconnect {
                            debug!(sequence, "disconnect frame read; input reader stopping");
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(error) => {
                        warn!(
                            reason_code = REASON_MALFORMED_FRAME,
                            error = %format!("{error:#}"),
                            "inbound frame skipped"
                        );
                    }
                }
            }
            Ok(None) => {
                lock(&stats).connected = false;
                input_closed.notify_one();
                return;
            }
            Err(error) => {
                lock(&stats).connected = false;
                let _ = events
                    .send(TransportEvent::Disconnected {
                        reason: format!("input read failed: {error}"),
                    })
                    .await;
                return;
            }
        }
    }
}

/// One connection over the shared input and its own output writer.
pub(crate) struct LineTransport {
    input: SharedInput,
    initialized: AtomicBool,
    writer: tokio::sync::Mutex<BoxedWriter>,
    input_closed: Arc<Notify>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<Mutex<ConnectionStats>>,
}

impl LineTransport {
    pub(crate) fn new(input: SharedInput, writer: BoxedWriter, input_closed: Arc<Notify>) -> Self {
        Self {
            input,
            initialized: AtomicBool::new(false),
            writer: tokio::sync::Mutex::new(writer),
            input_closed,
            reader_task: Mutex::new(None),
            stats: Arc::new(Mutex::new(ConnectionStats::default())),
        }
    }
}

#[async_trait]
impl MessagingTransport for LineTransport {
    async fn initialize(&self, events: TransportEventSender) -> Result<(), TransportError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(TransportError::Initialization(
                "transport already initialized".to_string(),
            ));
        }
        lock(&self.stats).connected = true;
        let _ = events.send(TransportEvent::Connected).await;
        let task = tokio::spawn(read_frames(
            Arc::clone(&self.input),
            events,
            Arc::clone(&self.input_closed),
            Arc::clone(&self.stats),
        ));
        *lock(&self.reader_task) = Some(task);
        Ok(())
    }

    async fn send_message(
        &self,
        identity: &str,
        payload: OutboundPayload,
    ) -> Result<(), SendError> {
        let line = render_outbound_frame(identity, &payload)
            .map_err(|error| SendError::new(identity, format!("{error:#}")))?;
        let result = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(line.as_bytes()).await {
                Ok(()) => writer.flush().await,
                Err(error) => Err(error),
            }
        };
        let mut stats = lock(&self.stats);
        match result {
            Ok(()) => {
                stats.messages_sent = stats.messages_sent.saturating_add(1);
                Ok(())
            }
            Err(error) => {
                stats.send_failures = stats.send_failures.saturating_add(1);
                Err(SendError::new(identity, error.to_string()))
            }
        }
    }

    async fn clean_shutdown(&self) -> Result<(), TransportError> {
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        lock(&self.stats).connected = false;
        self.writer
            .lock()
            .await
            .flush()
            .await
            .map_err(|error| TransportError::Fault(format!("output flush failed: {error}")))
    }

    fn connection_stats(&self) -> ConnectionStats {
        lock(&self.stats).clone()
    }
}

/// Builds a stdout transport for every connection attempt. All of them read
/// from one stdin line reader, so buffered lines survive a reconnect.
pub(crate) struct StdioConnector {
    input: SharedInput,
    input_closed: Arc<Notify>,
}

impl StdioConnector {
    pub(crate) fn new(input_closed: Arc<Notify>) -> Self {
        Self {
            input: shared_input(Box::new(tokio::io::stdin())),
            input_closed,
        }
    }
}

impl TransportConnector for StdioConnector {
    fn build(&self) -> Arc<dyn MessagingTransport> {
        Arc::new(LineTransport::new(
            Arc::clone(&self.input),
            Box::new(tokio::io::stdout()),
            Arc::clone(&self.input_closed),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use relay_contract::transport_event_channel;
    use serde_json::Value;
    use tokio::io::AsyncBufReadExt;

    use super::*;

    fn transport_over(input: &str) -> (LineTransport, tokio::io::DuplexStream, Arc<Notify>) {
        let (writer, output) = tokio::io::duplex(4096);
        let input_closed = Arc::new(Notify::new());
        let transport = LineTransport::new(
            shared_input(Box::new(Cursor::new(input.as_bytes().to_vec()))),
            Box::new(writer),
            Arc::clone(&input_closed),
        );
        (transport, output, input_closed)
    }

    #[test]
    fn unit_parse_inbound_frame_maps_each_frame_type() {
        let message = parse_inbound_frame(
            r#"{"type":"message","from":"alice","body":"/ping"}"#,
            42,
            7,
        )
        .expect("parse")
        .expect("event");
        assert_eq!(
            message,
            TransportEvent::Message(InboundMessage {
                id: "line-7".to_string(),
                from: "alice".to_string(),
                body: "/ping".to_string(),
                timestamp_unix_ms: 42,
            })
        );

        let voice = parse_inbound_frame(
            r#"{"type":"voice","id":"v1","from":"bob","mime_type":"audio/ogg","transcript":"status"}"#,
            0,
            1,
        )
        .expect("parse")
        .expect("event");
        match voice {
            TransportEvent::VoiceMessage(voice) => {
                assert_eq!(voice.id, "v1");
                assert_eq!(voice.audio, b"status".to_vec());
            }
            other => panic!("unexpected event {other:?}"),
        }

        let disconnect = parse_inbound_frame(r#"{"type":"disconnect"}"#, 0, 1)
            .expect("parse")
            .expect("event");
        assert_eq!(
            disconnect,
            TransportEvent::Disconnected {
                reason: "remote requested disconnect".to_string()
            }
        );
    }

    #[test]
    fn regression_blank_lines_are_skipped_and_unknown_types_rejected() {
        assert_eq!(parse_inbound_frame("   ", 0, 1).expect("blank"), None);
        let error = parse_inbound_frame(r#"{"type":"reaction","from":"x"}"#, 0, 3)
            .expect_err("unknown type must fail");
        assert!(format!("{error:#}").contains("line 3"));
    }

    #[test]
    fn unit_render_outbound_frame_omits_missing_watermark() {
        let line = render_outbound_frame("alice", &OutboundPayload::text("pong")).expect("render");
        assert_eq!(line, "{\"type\":\"send\",\"to\":\"alice\",\"text\":\"pong\"}\n");
    }

    #[tokio::test]
    async fn functional_line_transport_streams_events_until_disconnect() {
        let input = concat!(
            "{\"type\":\"message\",\"from\":\"alice\",\"body\":\"hello\"}\n",
            "not json\n",
            "{\"type\":\"disconnect\",\"reason\":\"network drop\"}\n",
        );
        let (transport, _output, _input_closed) = transport_over(input);
        let (events_tx, mut events_rx) = transport_event_channel();

        transport.initialize(events_tx).await.expect("initialize");
        assert_eq!(events_rx.recv().await, Some(TransportEvent::Connected));
        match events_rx.recv().await {
            Some(TransportEvent::Message(message)) => assert_eq!(message.body, "hello"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            events_rx.recv().await,
            Some(TransportEvent::Disconnected {
                reason: "network drop".to_string()
            })
        );
        assert_eq!(transport.connection_stats().messages_received, 1);
        assert!(!transport.connection_stats().connected);
    }

    #[tokio::test]
    async fn functional_end_of_input_is_reported_once_lines_run_out() {
        let (transport, _output, input_closed) =
            transport_over("{\"type\":\"message\",\"from\":\"alice\",\"body\":\"hi\"}\n");
        let (events_tx, mut events_rx) = transport_event_channel();

        transport.initialize(events_tx).await.expect("initialize");
        assert_eq!(events_rx.recv().await, Some(TransportEvent::Connected));
        assert!(matches!(events_rx.recv().await, Some(TransportEvent::Message(_))));
        tokio::time::timeout(Duration::from_secs(5), input_closed.notified())
            .await
            .expect("end of input must be reported");
        assert!(!transport.connection_stats().connected);
    }

    #[tokio::test]
    async fn regression_lines_after_disconnect_reach_the_next_connection() {
        let input = shared_input(Box::new(Cursor::new(
            concat!(
                "{\"type\":\"disconnect\",\"reason\":\"network drop\"}\n",
                "{\"type\":\"message\",\"from\":\"alice\",\"body\":\"/ping\"}\n",
            )
            .as_bytes()
            .to_vec(),
        )));
        let input_closed = Arc::new(Notify::new());
        let (first_writer, _first_output) = tokio::io::duplex(4096);
        let first = LineTransport::new(
            Arc::clone(&input),
            Box::new(first_writer),
            Arc::clone(&input_closed),
        );
        let (events_tx, mut events_rx) = transport_event_channel();

        first
            .initialize(events_tx.clone())
            .await
            .expect("first initialize");
        assert_eq!(events_rx.recv().await, Some(TransportEvent::Connected));
        assert_eq!(
            events_rx.recv().await,
            Some(TransportEvent::Disconnected {
                reason: "network drop".to_string()
            })
        );
        first.clean_shutdown().await.expect("first shutdown");

        let (second_writer, _second_output) = tokio::io::duplex(4096);
        let second = LineTransport::new(input, Box::new(second_writer), input_closed);
        second.initialize(events_tx).await.expect("second initialize");
        assert_eq!(events_rx.recv().await, Some(TransportEvent::Connected));
        match events_rx.recv().await {
            Some(TransportEvent::Message(message)) => {
                assert_eq!(message.from, "alice");
                assert_eq!(message.body, "/ping");
                assert_eq!(message.id, "line-2");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(second.connection_stats().messages_received, 1);
    }

    #[tokio::test]
    async fn functional_line_transport_writes_send_frames() {
        let (transport, output, _input_closed) = transport_over("");
        transport
            .send_message("alice", OutboundPayload::text("pong").with_watermark("relay"))
            .await
            .expect("send");

        let mut lines = tokio::io::BufReader::new(output).lines();
        let line = lines.next_line().await.expect("read").expect("line");
        let frame: Value = serde_json::from_str(&line).expect("json");
        assert_eq!(frame["type"], "send");
        assert_eq!(frame["to"], "alice");
        assert_eq!(frame["text"], "pong");
        assert_eq!(frame["watermark"], "relay");
        assert_eq!(transport.connection_stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn regression_second_initialize_is_refused() {
        let (transport, _output, _input_closed) = transport_over("");
        let (events_tx, _events_rx) = transport_event_channel();
        transport
            .initialize(events_tx.clone())
            .await
            .expect("first initialize");
        let error = transport
            .initialize(events_tx)
            .await
            .expect_err("transport already initialized");
        assert!(matches!(error, TransportError::Initialization(_)));
    }
}
