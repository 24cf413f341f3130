//! Realtime wire protocol
//!
//! Text-framed JSON messages, discriminated by their `type` field.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::{Error, Result};

/// Outbound message to the realtime service
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Session configuration, sent once after connect
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdate },

    /// Base64 PCM16 mono 24 kHz audio
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    /// Cancel the in-progress response
    #[serde(rename = "response.cancel")]
    ResponseCancel {
        #[serde(skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
}

impl ClientEvent {
    /// Build an `input_audio_buffer.append` from raw PCM16 bytes
    #[must_use]
    pub fn audio_append(pcm: &[u8]) -> Self {
        Self::InputAudioBufferAppend {
            audio: base64::engine::general_purpose::STANDARD.encode(pcm),
        }
    }

    /// Wire type name, for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            Self::ResponseCancel { .. } => "response.cancel",
        }
    }
}

/// Audio encoding on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Pcm16,
}

/// Body of `session.update`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionUpdate {
    pub voice: String,
    pub instructions: String,
    pub input_audio_format: AudioFormat,
    pub output_audio_format: AudioFormat,
    pub input_audio_transcription: TranscriptionSettings,
    pub turn_detection: TurnDetectionSettings,
}

/// Input transcription settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptionSettings {
    pub model: String,
}

/// Server VAD settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetectionSettings {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl From<&SessionConfig> for SessionUpdate {
    fn from(config: &SessionConfig) -> Self {
        Self {
            voice: config.voice.clone(),
            instructions: config.instructions.clone(),
            input_audio_format: AudioFormat::Pcm16,
            output_audio_format: AudioFormat::Pcm16,
            input_audio_transcription: TranscriptionSettings {
                model: config.transcription_model.clone(),
            },
            turn_detection: TurnDetectionSettings {
                kind: "server_vad".to_string(),
                threshold: config.turn_detection.threshold,
                prefix_padding_ms: config.turn_detection.prefix_padding_ms,
                silence_duration_ms: config.turn_detection.silence_duration_ms,
            },
        }
    }
}

/// Inbound message from the realtime service
///
/// Only the subset the engine acts on is modeled; anything else decodes to
/// [`ServerEvent::Unknown`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,

    #[serde(rename = "session.updated")]
    SessionUpdated,

    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseInfo },

    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone {
        #[serde(default)]
        transcript: Option<String>,
    },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: Option<ResponseInfo>,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted { transcript: String },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    #[serde(rename = "error")]
    Error { error: ErrorDetail },

    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Decode one text frame
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if the frame is not a well-formed event
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Response this event belongs to, when the service says
    #[must_use]
    pub fn response_id(&self) -> Option<&str> {
        match self {
            Self::ResponseCreated { response } => response.id.as_deref(),
            Self::ResponseDone { response } => response.as_ref().and_then(|r| r.id.as_deref()),
            Self::AudioDelta { response_id, .. } | Self::TranscriptDelta { response_id, .. } => {
                response_id.as_deref()
            }
            _ => None,
        }
    }
}

/// Response descriptor carried by `response.created` / `response.done`
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Body of an `error` event
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl ErrorDetail {
    /// Whether this is the benign race where a cancel reaches the service
    /// after the response already finished
    #[must_use]
    pub fn is_cancel_race(&self) -> bool {
        self.code.as_deref() == Some("response_cancel_not_active")
            || self.message.to_lowercase().contains("no active response")
    }
}

/// Decode a base64 audio payload to raw PCM16 bytes
///
/// # Errors
///
/// Returns error if the payload is not valid base64
pub fn decode_audio(delta: &str) -> Result<Vec<u8>> {
    Ok(base64::engine::general_purpose::STANDARD.decode(delta)?)
}
