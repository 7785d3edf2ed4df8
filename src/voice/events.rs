//! Data-channel event vocabulary for the realtime voice model.
//!
//! ## Protocol
//!
//! ```text
//! client ──data channel (ordered)──▸ voice model
//!     ◂── server events ────────────◂
//! ```
//!
//! Every message is a single newline-free JSON object with a required `type`
//! discriminator. The first outbound message on every connection is
//! `session.update`. Inbound messages are decoded into [`ProtocolEvent`]s;
//! text and audio payloads come from a third-party model and are sanitized
//! here before anything downstream sees them.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::credential::Voice;
use super::error::DecodeError;

/// Longest transcript fragment kept after sanitization (bytes).
pub const MAX_TEXT_BYTES: usize = 16 * 1024;

/// Largest decoded audio chunk accepted from the data channel (bytes).
pub const MAX_AUDIO_CHUNK_BYTES: usize = 1024 * 1024;

/// Input transcription model requested in `session.update` unless configured.
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

// ── Untrusted text ─────────────────────────────────────────────────

/// Model-produced text with control and bidi-override characters removed.
///
/// The content is plain text, never markup: renderers that emit HTML must use
/// [`PlainText::escaped`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlainText(String);

impl PlainText {
    pub fn sanitize(raw: &str) -> Self {
        let mut out = String::with_capacity(raw.len().min(MAX_TEXT_BYTES));
        for c in raw.chars().filter(|c| is_allowed_char(*c)) {
            if out.len() + c.len_utf8() > MAX_TEXT_BYTES {
                break;
            }
            out.push(c);
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append another sanitized fragment, respecting the size cap.
    pub fn push(&mut self, other: &PlainText) {
        for c in other.0.chars() {
            if self.0.len() + c.len_utf8() > MAX_TEXT_BYTES {
                break;
            }
            self.0.push(c);
        }
    }

    /// HTML-escaped form for markup renderers.
    pub fn escaped(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for c in self.0.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#39;"),
                _ => out.push(c),
            }
        }
        out
    }
}

impl std::fmt::Display for PlainText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_allowed_char(c: char) -> bool {
    if c == '\n' || c == '\t' {
        return true;
    }
    if c.is_control() {
        return false;
    }
    // Bidi embedding/override/isolate controls can visually reorder text.
    !matches!(c, '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')
}

// ── Application-facing events ──────────────────────────────────────

/// Who produced a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Connection health as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Closed,
    Failed,
}

/// Event bus topic classes that cross into application state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ConnectionStatus,
    Transcript,
    Audio,
    Error,
}

/// How a model response ended (`response.done`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseOutcome {
    Completed,
    Cancelled,
    Failed,
    Incomplete,
}

impl ResponseOutcome {
    fn from_wire(status: Option<&str>) -> Self {
        match status {
            Some("cancelled") => Self::Cancelled,
            Some("failed") => Self::Failed,
            Some("incomplete") => Self::Incomplete,
            _ => Self::Completed,
        }
    }
}

/// Decoded protocol event. Created once, consumed by the event bus, never
/// mutated.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// The remote session acknowledged (`session.created` / `session.updated`).
    SessionConfig { session_id: Option<String> },
    /// Partial transcript text for one conversation item.
    TranscriptDelta {
        role: Role,
        item_id: String,
        text: PlainText,
    },
    /// Final transcript for one conversation item.
    TranscriptDone {
        role: Role,
        item_id: String,
        text: PlainText,
        at: DateTime<Utc>,
    },
    /// PCM16 audio from the model's response.
    AudioChunk { item_id: String, data: Vec<u8> },
    /// The model finished, was cancelled or gave up on a response. Lists
    /// the output items it produced.
    ResponseDone {
        response_id: Option<String>,
        outcome: ResponseOutcome,
        item_ids: Vec<String>,
    },
    ConnectionStatus(ConnectionStatus),
    ErrorNotice {
        code: Option<String>,
        message: PlainText,
        /// Fatal notices come from the lifecycle coordinator; model-side
        /// errors are informational.
        fatal: bool,
    },
}

impl ProtocolEvent {
    /// Bus topic for this event; `None` for events that stay internal.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            Self::SessionConfig { .. } => None,
            Self::TranscriptDelta { .. }
            | Self::TranscriptDone { .. }
            | Self::ResponseDone { .. } => Some(Topic::Transcript),
            Self::AudioChunk { .. } => Some(Topic::Audio),
            Self::ConnectionStatus(_) => Some(Topic::ConnectionStatus),
            Self::ErrorNotice { .. } => Some(Topic::Error),
        }
    }

    pub fn fatal(message: impl AsRef<str>) -> Self {
        Self::ErrorNotice {
            code: None,
            message: PlainText::sanitize(message.as_ref()),
            fatal: true,
        }
    }
}

// ── Client → model messages ────────────────────────────────────────

/// Server VAD turn detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputTranscription {
    pub model: String,
}

/// Body of `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSettings {
    pub modalities: Vec<String>,
    pub voice: Voice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputTranscription>,
    pub turn_detection: TurnDetection,
}

impl SessionSettings {
    pub fn new(voice: Voice) -> Self {
        Self {
            modalities: vec!["audio".to_string(), "text".to_string()],
            voice,
            instructions: None,
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: Some(InputTranscription {
                model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            }),
            turn_detection: TurnDetection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: Role,
    pub content: Vec<ContentPart>,
}

/// Messages the client sends over the data channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate,

    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    pub fn user_text(text: &str) -> Self {
        Self::ConversationItemCreate {
            item: ConversationItem {
                kind: "message".to_string(),
                role: Role::User,
                content: vec![ContentPart {
                    kind: "input_text".to_string(),
                    text: text.to_string(),
                }],
            },
        }
    }

    /// Wire encoding; `serde_json` never emits raw newlines for compact output.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ── Model → client messages ────────────────────────────────────────

/// Server event types recognized but not surfaced to the application.
const IGNORED_SERVER_EVENTS: &[&str] = &[
    "conversation.created",
    "conversation.item.created",
    "conversation.item.truncated",
    "conversation.item.deleted",
    "conversation.item.input_audio_transcription.failed",
    "input_audio_buffer.committed",
    "input_audio_buffer.cleared",
    "input_audio_buffer.speech_started",
    "input_audio_buffer.speech_stopped",
    "output_audio_buffer.started",
    "output_audio_buffer.stopped",
    "output_audio_buffer.cleared",
    "response.created",
    "response.output_item.added",
    "response.output_item.done",
    "response.content_part.added",
    "response.content_part.done",
    "response.text.delta",
    "response.text.done",
    "response.audio.done",
    "response.function_call_arguments.delta",
    "response.function_call_arguments.done",
    "rate_limits.updated",
];

#[derive(Debug, Deserialize)]
struct RemoteSession {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteItem {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output: Vec<RemoteItem>,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: RemoteSession },
    #[serde(rename = "session.updated")]
    SessionUpdated { session: RemoteSession },
    #[serde(rename = "response.audio_transcript.delta")]
    AssistantTranscriptDelta { item_id: String, delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    AssistantTranscriptDone { item_id: String, transcript: String },
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    UserTranscriptDelta { item_id: String, delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    UserTranscriptDone { item_id: String, transcript: String },
    #[serde(rename = "response.audio.delta")]
    AudioDelta { item_id: String, delta: String },
    #[serde(rename = "response.done")]
    ResponseDone { response: RemoteResponse },
    #[serde(rename = "error")]
    Error { error: RemoteError },
}

impl ServerEvent {
    const TYPES: &'static [&'static str] = &[
        "session.created",
        "session.updated",
        "response.audio_transcript.delta",
        "response.audio_transcript.done",
        "conversation.item.input_audio_transcription.delta",
        "conversation.item.input_audio_transcription.completed",
        "response.audio.delta",
        "response.done",
        "error",
    ];

    fn into_protocol_event(self) -> Result<ProtocolEvent, DecodeError> {
        let event = match self {
            Self::SessionCreated { session } | Self::SessionUpdated { session } => {
                ProtocolEvent::SessionConfig {
                    session_id: session.id,
                }
            }
            Self::AssistantTranscriptDelta { item_id, delta } => ProtocolEvent::TranscriptDelta {
                role: Role::Assistant,
                item_id,
                text: PlainText::sanitize(&delta),
            },
            Self::AssistantTranscriptDone {
                item_id,
                transcript,
            } => ProtocolEvent::TranscriptDone {
                role: Role::Assistant,
                item_id,
                text: PlainText::sanitize(&transcript),
                at: Utc::now(),
            },
            Self::UserTranscriptDelta { item_id, delta } => ProtocolEvent::TranscriptDelta {
                role: Role::User,
                item_id,
                text: PlainText::sanitize(&delta),
            },
            Self::UserTranscriptDone {
                item_id,
                transcript,
            } => ProtocolEvent::TranscriptDone {
                role: Role::User,
                item_id,
                text: PlainText::sanitize(&transcript),
                at: Utc::now(),
            },
            Self::AudioDelta { item_id, delta } => ProtocolEvent::AudioChunk {
                item_id,
                data: decode_audio(&delta)?,
            },
            Self::ResponseDone { response } => ProtocolEvent::ResponseDone {
                outcome: ResponseOutcome::from_wire(response.status.as_deref()),
                response_id: response.id,
                item_ids: response.output.into_iter().filter_map(|item| item.id).collect(),
            },
            Self::Error { error } => ProtocolEvent::ErrorNotice {
                code: error.code,
                message: PlainText::sanitize(
                    error.message.as_deref().unwrap_or("Unknown realtime error"),
                ),
                fatal: false,
            },
        };
        Ok(event)
    }
}

fn decode_audio(b64: &str) -> Result<Vec<u8>, DecodeError> {
    // base64 expands 3 bytes into 4 characters.
    if b64.len() / 4 * 3 > MAX_AUDIO_CHUNK_BYTES {
        return Err(DecodeError::Oversized {
            limit: MAX_AUDIO_CHUNK_BYTES,
        });
    }
    base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| DecodeError::InvalidAudio(e.to_string()))
}

/// Decode one inbound data-channel message.
///
/// `Ok(None)` means the type is part of the vocabulary but carries nothing
/// the application consumes. Unknown types are an error so the caller can
/// drop and log them.
pub fn decode_server_event(raw: &str) -> Result<Option<ProtocolEvent>, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or(DecodeError::MissingType)?;

    if IGNORED_SERVER_EVENTS.contains(&kind) {
        tracing::debug!(event_type = kind, "Realtime event (not surfaced)");
        return Ok(None);
    }
    if !ServerEvent::TYPES.contains(&kind) {
        return Err(DecodeError::UnknownType(kind.to_string()));
    }

    let event: ServerEvent = serde_json::from_value(value)?;
    event.into_protocol_event().map(Some)
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_update_wire_shape() {
        let mut settings = SessionSettings::new(Voice::Coral);
        settings.instructions = Some("Speak Spanish slowly.".into());
        let wire = ClientEvent::SessionUpdate { session: settings }
            .to_wire()
            .unwrap();
        assert!(!wire.contains('\n'));

        let v: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(v["type"], "session.update");
        assert_eq!(v["session"]["voice"], "coral");
        assert_eq!(v["session"]["input_audio_format"], "pcm16");
        assert_eq!(v["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(v["session"]["instructions"], "Speak Spanish slowly.");
    }

    #[test]
    fn unit_client_events_carry_only_type() {
        assert_eq!(
            ClientEvent::ResponseCreate.to_wire().unwrap(),
            r#"{"type":"response.create"}"#
        );
    }

    #[test]
    fn user_text_builds_input_text_item() {
        let v: serde_json::Value =
            serde_json::from_str(&ClientEvent::user_text("hola").to_wire().unwrap()).unwrap();
        assert_eq!(v["type"], "conversation.item.create");
        assert_eq!(v["item"]["role"], "user");
        assert_eq!(v["item"]["content"][0]["type"], "input_text");
        assert_eq!(v["item"]["content"][0]["text"], "hola");
    }

    #[test]
    fn decode_assistant_transcript_delta() {
        let raw = r#"{"type":"response.audio_transcript.delta","item_id":"i1","delta":"¿Qué tal?"}"#;
        let event = decode_server_event(raw).unwrap().unwrap();
        assert_eq!(
            event,
            ProtocolEvent::TranscriptDelta {
                role: Role::Assistant,
                item_id: "i1".into(),
                text: PlainText::sanitize("¿Qué tal?"),
            }
        );
        assert_eq!(event.topic(), Some(Topic::Transcript));
    }

    #[test]
    fn decode_user_transcription_completed() {
        let raw = r#"{"type":"conversation.item.input_audio_transcription.completed","item_id":"u1","content_index":0,"transcript":"Buenos días"}"#;
        match decode_server_event(raw).unwrap().unwrap() {
            ProtocolEvent::TranscriptDone { role, text, .. } => {
                assert_eq!(role, Role::User);
                assert_eq!(text.as_str(), "Buenos días");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decode_audio_delta() {
        let b64 = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3, 4]);
        let raw = format!(r#"{{"type":"response.audio.delta","item_id":"i2","delta":"{b64}"}}"#);
        let event = decode_server_event(&raw).unwrap().unwrap();
        assert_eq!(
            event,
            ProtocolEvent::AudioChunk {
                item_id: "i2".into(),
                data: vec![1, 2, 3, 4],
            }
        );
    }

    #[test]
    fn decode_cancelled_response_lists_its_items() {
        let raw = r#"{"type":"response.done","event_id":"e9","response":{"id":"resp_1","object":"realtime.response","status":"cancelled","status_details":{"type":"cancelled","reason":"client_cancelled"},"output":[{"id":"i7","type":"message"}]}}"#;
        let event = decode_server_event(raw).unwrap().unwrap();
        assert_eq!(
            event,
            ProtocolEvent::ResponseDone {
                response_id: Some("resp_1".into()),
                outcome: ResponseOutcome::Cancelled,
                item_ids: vec!["i7".into()],
            }
        );
        assert_eq!(event.topic(), Some(Topic::Transcript));
    }

    #[test]
    fn decode_response_done_without_status_counts_as_completed() {
        let raw = r#"{"type":"response.done","response":{"id":"resp_2"}}"#;
        match decode_server_event(raw).unwrap().unwrap() {
            ProtocolEvent::ResponseDone {
                outcome, item_ids, ..
            } => {
                assert_eq!(outcome, ResponseOutcome::Completed);
                assert!(item_ids.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_invalid_audio() {
        let raw = r#"{"type":"response.audio.delta","item_id":"i2","delta":"***"}"#;
        assert!(matches!(
            decode_server_event(raw),
            Err(DecodeError::InvalidAudio(_))
        ));
    }

    #[test]
    fn decode_error_event_is_not_fatal() {
        let raw = r#"{"type":"error","error":{"code":"rate_limit_exceeded","message":"Slow down"}}"#;
        match decode_server_event(raw).unwrap().unwrap() {
            ProtocolEvent::ErrorNotice {
                code,
                message,
                fatal,
            } => {
                assert_eq!(code.as_deref(), Some("rate_limit_exceeded"));
                assert_eq!(message.as_str(), "Slow down");
                assert!(!fatal);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decode_known_but_ignored_type_yields_nothing() {
        let raw = r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":120}"#;
        assert!(decode_server_event(raw).unwrap().is_none());
    }

    #[test]
    fn decode_unknown_type_is_error() {
        let raw = r#"{"type":"response.hologram.delta"}"#;
        assert!(matches!(
            decode_server_event(raw),
            Err(DecodeError::UnknownType(t)) if t == "response.hologram.delta"
        ));
    }

    #[test]
    fn decode_missing_type_and_bad_json() {
        assert!(matches!(
            decode_server_event(r#"{"delta":"x"}"#),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(
            decode_server_event("{not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn sanitize_strips_controls_and_bidi_overrides() {
        let text = PlainText::sanitize("hi\u{0007}\u{202E}there\nok\tgo");
        assert_eq!(text.as_str(), "hithere\nok\tgo");
    }

    #[test]
    fn sanitized_text_escapes_markup() {
        let text = PlainText::sanitize(r#"<script>alert("x")</script> & 'y'"#);
        assert_eq!(
            text.escaped(),
            "&lt;script&gt;alert(&quot;x&quot;)&lt;/script&gt; &amp; &#39;y&#39;"
        );
        // The raw form is kept verbatim; only rendering escapes.
        assert!(text.as_str().starts_with("<script>"));
    }

    #[test]
    fn sanitize_caps_length_on_char_boundary() {
        let long = "é".repeat(MAX_TEXT_BYTES);
        let text = PlainText::sanitize(&long);
        assert!(text.as_str().len() <= MAX_TEXT_BYTES);
        assert!(text.as_str().chars().all(|c| c == 'é'));
    }
}
