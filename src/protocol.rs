//! Realtime wire protocol
//!
//! Outbound client events are serialized from [`ClientEvent`]; inbound
//! server messages are parsed into [`InboundEvent`], the only shape the
//! session state machine sees.

use crate::codec::decode_pcm16_base64;
use crate::error::{Result, VoiceError};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize, Serializer};
use tracing::debug;

/// Response length limit for `max_response_output_tokens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseTokenLimit {
    Limited(u32),
    Unlimited,
}

impl Serialize for ResponseTokenLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Limited(n) => serializer.serialize_u32(*n),
            Self::Unlimited => serializer.serialize_str("inf"),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InputAudioTranscription {
    pub model: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

/// Body of a `session.update` message.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionUpdate {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: InputAudioTranscription,
    pub turn_detection: TurnDetection,
    pub temperature: f32,
    pub max_response_output_tokens: ResponseTokenLimit,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    /// A user message carrying typed text.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            role: "user".to_string(),
            content: vec![ContentPart {
                kind: "input_text".to_string(),
                text: text.into(),
            }],
        }
    }
}

/// Message sent from client to server.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdate },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientEvent {
    /// Wire name of this event, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            Self::ConversationItemCreate { .. } => "conversation.item.create",
            Self::ResponseCreate => "response.create",
        }
    }

    /// Serialize with a fresh client-side `event_id`.
    pub fn to_json(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("event_id".to_string(), serde_json::Value::String(new_event_id()));
        }
        Ok(serde_json::to_string(&value)?)
    }
}

fn new_event_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("evt_{}", suffix)
}

/// Inbound event after decoding, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    SessionCreated,
    SessionUpdated,
    Error { message: String },
    SpeechStarted,
    SpeechStopped,
    UserTranscript { text: String },
    AssistantTextDelta { text: String },
    AssistantTextDone { text: String },
    AssistantAudioDelta { bytes: Vec<u8> },
    ResponseDone,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// Server -> client messages
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerMessage {
    #[serde(rename = "session.created")]
    SessionCreated {},
    #[serde(rename = "session.updated")]
    SessionUpdated {},
    #[serde(rename = "error")]
    Error { error: ErrorDetail },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {},
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted { transcript: String },
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone { transcript: String },
    #[serde(rename = "response.text.delta")]
    TextDelta { delta: String },
    #[serde(rename = "response.text.done")]
    TextDone { text: String },
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.done")]
    ResponseDone {},
    #[serde(other)]
    Unknown,
}

/// Parse one text frame. Returns `Ok(None)` for message types the session
/// does not act on.
pub fn parse_server_message(text: &str) -> Result<Option<InboundEvent>> {
    let message: ServerMessage = serde_json::from_str(text)?;

    let event = match message {
        ServerMessage::SessionCreated {} => InboundEvent::SessionCreated,
        ServerMessage::SessionUpdated {} => InboundEvent::SessionUpdated,
        ServerMessage::Error { error } => {
            let message = match (error.message, error.code) {
                (Some(message), _) => message,
                (None, Some(code)) => code,
                (None, None) => "unknown server error".to_string(),
            };
            InboundEvent::Error { message }
        }
        ServerMessage::SpeechStarted {} => InboundEvent::SpeechStarted,
        ServerMessage::SpeechStopped {} => InboundEvent::SpeechStopped,
        ServerMessage::InputTranscriptionCompleted { transcript } => {
            InboundEvent::UserTranscript { text: transcript }
        }
        ServerMessage::AudioTranscriptDelta { delta } | ServerMessage::TextDelta { delta } => {
            InboundEvent::AssistantTextDelta { text: delta }
        }
        ServerMessage::AudioTranscriptDone { transcript } => {
            InboundEvent::AssistantTextDone { text: transcript }
        }
        ServerMessage::TextDone { text } => InboundEvent::AssistantTextDone { text },
        ServerMessage::AudioDelta { delta } => InboundEvent::AssistantAudioDelta {
            bytes: decode_pcm16_base64(&delta)?,
        },
        ServerMessage::ResponseDone {} => InboundEvent::ResponseDone,
        ServerMessage::Unknown => {
            debug!("Ignoring server message: {}", message_type(text));
            return Ok(None);
        }
    };

    Ok(Some(event))
}

/// Binary frames carry the same JSON payloads as text frames.
pub fn parse_binary_message(bytes: &[u8]) -> Result<Option<InboundEvent>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| VoiceError::Protocol(format!("binary frame is not UTF-8: {}", e)))?;
    parse_server_message(text)
}

fn message_type(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_else(|| "<untyped>".to_string())
}
