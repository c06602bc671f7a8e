// ABOUTME: Translates newline-delimited JSON envelopes from the sandboxed agent into typed events
// ABOUTME: Handles line reassembly across chunks, session-created dedup and token usage accounting

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Typed event delivered to the caller, one per logical protocol event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundEvent {
    #[serde(rename_all = "camelCase")]
    SessionCreated { session_id: String },

    #[serde(rename_all = "camelCase")]
    Content {
        session_id: Option<String>,
        message: JsonValue,
    },

    #[serde(rename_all = "camelCase")]
    TokenUsage {
        session_id: Option<String>,
        used_tokens: u64,
        context_window: u64,
        percentage: f64,
        input_tokens: u64,
        output_tokens: u64,
        cache_read_tokens: u64,
        cache_creation_tokens: u64,
    },

    #[serde(rename_all = "camelCase")]
    Complete { session_id: Option<String> },

    #[serde(rename_all = "camelCase")]
    Error {
        session_id: Option<String>,
        error: String,
    },
}

/// Destination for outbound events
pub trait EventSink: Send {
    fn emit(&mut self, event: OutboundEvent);
}

impl EventSink for mpsc::UnboundedSender<OutboundEvent> {
    fn emit(&mut self, event: OutboundEvent) {
        if self.send(event).is_err() {
            debug!("Event receiver dropped, discarding event");
        }
    }
}

impl EventSink for Vec<OutboundEvent> {
    fn emit(&mut self, event: OutboundEvent) {
        self.push(event);
    }
}

/// Per-session translation state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub session_id: Option<String>,
    pub has_external_id: bool,
    pub session_created_sent: bool,
    pub finished: bool,
}

impl SessionState {
    /// `external_id` is a session id the caller already knows, which
    /// suppresses the session-created event.
    pub fn new(external_id: Option<String>) -> Self {
        Self {
            has_external_id: external_id.is_some(),
            session_id: external_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Envelope {
    Content {
        message: JsonValue,
    },
    Done {
        #[serde(rename = "sessionId")]
        session_id: Option<JsonValue>,
    },
    Error {
        error: Option<JsonValue>,
        message: Option<JsonValue>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ProtocolTranslator {
    context_window: u64,
}

impl Default for ProtocolTranslator {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_WINDOW)
    }
}

impl ProtocolTranslator {
    pub fn new(context_window: u64) -> Self {
        Self {
            context_window: context_window.max(1),
        }
    }

    pub fn context_window(&self) -> u64 {
        self.context_window
    }

    /// Translate one line. Lines that are not a recognized JSON envelope are
    /// dropped, as is everything after a `done` envelope.
    pub fn translate_line(&self, line: &str, sink: &mut dyn EventSink, state: &mut SessionState) {
        if state.finished {
            return;
        }
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                trace!("Dropping non-protocol line: {}", e);
                return;
            }
        };

        match envelope {
            Envelope::Content { message } => self.on_content(message, sink, state),
            Envelope::Done { session_id } => {
                if let Some(id) = session_id.map(json_text) {
                    if !state.has_external_id {
                        state.session_id = Some(id);
                    }
                }
                sink.emit(OutboundEvent::Complete {
                    session_id: state.session_id.clone(),
                });
                state.finished = true;
            }
            Envelope::Error { error, message } => {
                let error = error
                    .or(message)
                    .map(json_text)
                    .unwrap_or_else(|| "Unknown error".to_string());
                sink.emit(OutboundEvent::Error {
                    session_id: state.session_id.clone(),
                    error,
                });
            }
        }
    }

    fn on_content(&self, message: JsonValue, sink: &mut dyn EventSink, state: &mut SessionState) {
        let agent_session = message
            .get("session_id")
            .and_then(JsonValue::as_str)
            .map(str::to_string);

        if !state.has_external_id && !state.session_created_sent {
            if let Some(id) = agent_session {
                state.session_id = Some(id.clone());
                state.session_created_sent = true;
                sink.emit(OutboundEvent::SessionCreated { session_id: id });
            }
        }

        let usage = if message.get("type").and_then(JsonValue::as_str) == Some("result") {
            Some(
                message
                    .get("usage")
                    .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
                    .unwrap_or_default(),
            )
        } else {
            None
        };

        sink.emit(OutboundEvent::Content {
            session_id: state.session_id.clone(),
            message,
        });

        if let Some(usage) = usage {
            sink.emit(self.token_usage(&usage, state));
        }
    }

    fn token_usage(&self, usage: &Usage, state: &SessionState) -> OutboundEvent {
        // Counts come from the sandboxed process and are not trusted to fit
        let used = usage
            .input_tokens
            .saturating_add(usage.output_tokens)
            .saturating_add(usage.cache_read_input_tokens)
            .saturating_add(usage.cache_creation_input_tokens);
        let percentage = (used as f64 / self.context_window as f64 * 1000.0).round() / 10.0;

        OutboundEvent::TokenUsage {
            session_id: state.session_id.clone(),
            used_tokens: used,
            context_window: self.context_window,
            percentage,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_input_tokens,
            cache_creation_tokens: usage.cache_creation_input_tokens,
        }
    }

    /// Translate a stream of raw stdout chunks until it closes.
    ///
    /// A trailing line without a newline is translated when the stream ends.
    pub async fn pump(
        &self,
        mut chunks: mpsc::UnboundedReceiver<Bytes>,
        sink: &mut dyn EventSink,
        state: &mut SessionState,
    ) {
        let mut lines = LineAssembler::new();
        while let Some(chunk) = chunks.recv().await {
            for line in lines.push(&chunk) {
                self.translate_line(&line, sink, state);
            }
        }
        if let Some(line) = lines.finish() {
            self.translate_line(&line, sink, state);
        }
    }
}

fn json_text(value: JsonValue) -> String {
    match value {
        JsonValue::String(s) => s,
        other => other.to_string(),
    }
}

/// Reassembles newline-delimited lines from arbitrarily split chunks
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
    // Bytes of `buf` already known to hold no newline
    scanned: usize,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            let line = &self.buf[start..end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
            self.scanned = start;
        }

        self.buf.drain(..start);
        self.scanned = self.buf.len();
        lines
    }

    /// Flush the trailing partial line, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn translate(lines: &[&str], external: Option<&str>) -> Vec<OutboundEvent> {
        let translator = ProtocolTranslator::default();
        let mut state = SessionState::new(external.map(str::to_string));
        let mut events = Vec::new();
        for line in lines {
            translator.translate_line(line, &mut events, &mut state);
        }
        events
    }

    #[test]
    fn test_done_emits_single_complete() {
        let events = translate(&[r#"{"type":"done","sessionId":"s1"}"#], None);
        assert_eq!(
            events,
            vec![OutboundEvent::Complete {
                session_id: Some("s1".to_string())
            }]
        );
    }

    #[rstest]
    #[case("not json")]
    #[case("")]
    #[case("{\"type\":\"mystery\"}")]
    #[case("[1,2,3]")]
    #[case("{\"type\":\"content\"}")]
    fn test_noise_lines_are_dropped(#[case] line: &str) {
        assert!(translate(&[line], None).is_empty());
    }

    #[test]
    fn test_lines_after_done_are_ignored() {
        let events = translate(
            &[
                r#"{"type":"done","sessionId":"s1"}"#,
                r#"{"type":"done","sessionId":"s1"}"#,
                r#"{"type":"error","error":"late"}"#,
            ],
            None,
        );
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_first_content_announces_session_once() {
        let events = translate(
            &[
                r#"{"type":"content","message":{"type":"system","session_id":"agent-1"}}"#,
                r#"{"type":"content","message":{"type":"assistant","session_id":"agent-1"}}"#,
            ],
            None,
        );

        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            OutboundEvent::SessionCreated {
                session_id: "agent-1".to_string()
            }
        );
        assert!(matches!(
            &events[1],
            OutboundEvent::Content { session_id: Some(id), .. } if id == "agent-1"
        ));
        assert!(matches!(&events[2], OutboundEvent::Content { .. }));
    }

    #[test]
    fn test_external_session_id_suppresses_session_created() {
        let events = translate(
            &[r#"{"type":"content","message":{"type":"system","session_id":"agent-1"}}"#],
            Some("known"),
        );
        assert_eq!(
            events,
            vec![OutboundEvent::Content {
                session_id: Some("known".to_string()),
                message: json!({"type": "system", "session_id": "agent-1"}),
            }]
        );
    }

    #[test]
    fn test_result_message_emits_token_usage() {
        let events = translate(
            &[r#"{"type":"content","message":{"type":"result","session_id":"a","usage":{"input_tokens":1000,"output_tokens":500,"cache_read_input_tokens":250,"cache_creation_input_tokens":250}}}"#],
            None,
        );

        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2],
            OutboundEvent::TokenUsage {
                session_id: Some("a".to_string()),
                used_tokens: 2000,
                context_window: DEFAULT_CONTEXT_WINDOW,
                percentage: 1.0,
                input_tokens: 1000,
                output_tokens: 500,
                cache_read_tokens: 250,
                cache_creation_tokens: 250,
            }
        );
    }

    #[test]
    fn test_token_usage_saturates_on_huge_counts() {
        let events = translate(
            &[r#"{"type":"content","message":{"type":"result","usage":{"input_tokens":18446744073709551615,"output_tokens":1,"cache_read_input_tokens":7}}}"#],
            None,
        );

        let Some(OutboundEvent::TokenUsage {
            used_tokens,
            input_tokens,
            ..
        }) = events.last()
        else {
            panic!("expected token usage, got {:?}", events);
        };
        assert_eq!(*used_tokens, u64::MAX);
        assert_eq!(*input_tokens, u64::MAX);
    }

    #[rstest]
    #[case(r#"{"type":"done","sessionId":42}"#, Some("42"))]
    #[case(r#"{"type":"done","sessionId":null}"#, None)]
    #[case(r#"{"type":"done"}"#, None)]
    fn test_done_with_odd_session_id_still_completes(
        #[case] line: &str,
        #[case] expected: Option<&str>,
    ) {
        let translator = ProtocolTranslator::default();
        let mut state = SessionState::new(None);
        let mut events = Vec::new();
        translator.translate_line(line, &mut events, &mut state);

        assert_eq!(
            events,
            vec![OutboundEvent::Complete {
                session_id: expected.map(str::to_string)
            }]
        );
        assert!(state.finished);
    }

    #[rstest]
    #[case(r#"{"type":"error","error":"boom"}"#, "boom")]
    #[case(r#"{"type":"error","message":"bad thing"}"#, "bad thing")]
    #[case(r#"{"type":"error","error":{"code":7}}"#, r#"{"code":7}"#)]
    #[case(r#"{"type":"error"}"#, "Unknown error")]
    fn test_error_envelope(#[case] line: &str, #[case] expected: &str) {
        let events = translate(&[line], None);
        assert_eq!(
            events,
            vec![OutboundEvent::Error {
                session_id: None,
                error: expected.to_string()
            }]
        );
    }

    #[test]
    fn test_events_serialize_with_kebab_type_and_camel_fields() {
        let value = serde_json::to_value(OutboundEvent::SessionCreated {
            session_id: "s1".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({"type": "session-created", "sessionId": "s1"}));

        let value = serde_json::to_value(OutboundEvent::Complete {
            session_id: Some("s1".to_string()),
        })
        .unwrap();
        assert_eq!(value, json!({"type": "complete", "sessionId": "s1"}));
    }

    #[test]
    fn test_line_assembler_joins_split_lines() {
        let mut lines = LineAssembler::new();
        assert!(lines.push(b"{\"type\":").is_empty());
        assert_eq!(lines.push(b"\"done\"}\r\nnext"), vec!["{\"type\":\"done\"}"]);
        assert_eq!(lines.push(b" line\n\n"), vec!["next line", ""]);
        assert_eq!(lines.finish(), None);

        lines.push(b"tail");
        assert_eq!(lines.finish().as_deref(), Some("tail"));
    }

    #[test]
    fn test_line_assembler_handles_long_line_in_tiny_chunks() {
        let long = format!("{{\"type\":\"done\",\"pad\":\"{}\"}}", "x".repeat(200_000));
        let input = format!("{}\r\nafter\n", long);

        let mut lines = LineAssembler::new();
        let mut out = Vec::new();
        for chunk in input.as_bytes().chunks(3) {
            out.extend(lines.push(chunk));
        }

        assert_eq!(out, vec![long, "after".to_string()]);
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_line_assembler_keeps_split_utf8_intact() {
        let text = "héllo\n".as_bytes();
        let mut lines = LineAssembler::new();
        assert!(lines.push(&text[..2]).is_empty());
        assert_eq!(lines.push(&text[2..]), vec!["héllo"]);
    }

    #[tokio::test]
    async fn test_pump_translates_chunked_stream() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Bytes::from_static(b"noise\n{\"type\":\"content\",\"mess"))
            .unwrap();
        tx.send(Bytes::from_static(
            b"age\":{\"type\":\"assistant\",\"session_id\":\"x\"}}\n{\"type\":\"done\"}",
        ))
        .unwrap();
        drop(tx);

        let translator = ProtocolTranslator::default();
        let mut state = SessionState::new(None);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut sink = event_tx;
        translator.pump(rx, &mut sink, &mut state).await;
        drop(sink);

        let mut events = Vec::new();
        while let Some(event) = event_rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2],
            OutboundEvent::Complete {
                session_id: Some("x".to_string())
            }
        );
        assert!(state.finished);
    }
}
