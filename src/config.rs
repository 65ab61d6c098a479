//! Session configuration

use crate::protocol::{InputAudioTranscription, ResponseTokenLimit, SessionUpdate, TurnDetection};
use crate::transport::ConnectRequest;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

pub const DEFAULT_URL: &str = "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview";

/// Output modalities requested from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Text,
    Audio,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
        }
    }
}

/// Server-side voice-activity detection thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct TurnDetectionConfig {
    pub threshold: f32,
    pub prefix_padding: Duration,
    pub silence_duration: Duration,
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding: Duration::from_millis(300),
            silence_duration: Duration::from_millis(500),
        }
    }
}

/// How long a listen request waits for the session to become active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenRetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ListenRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_millis(500),
        }
    }
}

/// Configuration for a realtime voice session
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: String,
    /// Name passed to the credential provider to obtain the API key
    pub credential_name: String,
    pub modalities: Vec<Modality>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub transcription_model: String,
    pub turn_detection: TurnDetectionConfig,
    pub temperature: f32,
    pub max_response_output_tokens: ResponseTokenLimit,
    pub listen_retry: ListenRetryPolicy,
    /// Captured chunks held while the session is still being configured
    pub pending_audio_limit: usize,
    pub capture_interval: Duration,
    /// Flush queued assistant audio when the user starts talking
    pub interrupt_playback_on_speech: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            credential_name: "OPENAI_API_KEY".to_string(),
            modalities: vec![Modality::Text, Modality::Audio],
            instructions: "You are a helpful tutor looking at a whiteboard with the user. \
                           Answer briefly and speak naturally."
                .to_string(),
            voice: "alloy".to_string(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            transcription_model: "whisper-1".to_string(),
            turn_detection: TurnDetectionConfig::default(),
            temperature: 0.8,
            max_response_output_tokens: ResponseTokenLimit::Limited(4096),
            listen_retry: ListenRetryPolicy::default(),
            pending_audio_limit: 50,
            capture_interval: Duration::from_millis(20),
            interrupt_playback_on_speech: true,
        }
    }
}

impl RealtimeConfig {
    /// The `session` body sent once the server reports `session.created`.
    pub fn session_update(&self) -> SessionUpdate {
        SessionUpdate {
            modalities: self.modalities.iter().map(|m| m.as_str().to_string()).collect(),
            instructions: self.instructions.clone(),
            voice: self.voice.clone(),
            input_audio_format: self.input_audio_format.clone(),
            output_audio_format: self.output_audio_format.clone(),
            input_audio_transcription: InputAudioTranscription {
                model: self.transcription_model.clone(),
            },
            turn_detection: TurnDetection {
                kind: "server_vad".to_string(),
                threshold: self.turn_detection.threshold,
                prefix_padding_ms: self.turn_detection.prefix_padding.as_millis() as u32,
                silence_duration_ms: self.turn_detection.silence_duration.as_millis() as u32,
            },
            temperature: self.temperature,
            max_response_output_tokens: self.max_response_output_tokens,
        }
    }

    /// Endpoint and headers for opening the duplex transport.
    pub fn connect_request(&self, api_key: &SecretString) -> ConnectRequest {
        ConnectRequest::new(&self.url)
            .header("Authorization", format!("Bearer {}", api_key.expose_secret()))
            .header("OpenAI-Beta", "realtime=v1")
    }
}
