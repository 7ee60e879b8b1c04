//! Gemini Live wire format
//!
//! Client messages are serialized with serde's external tagging so the
//! variant name becomes the top-level key (`{"setup": {...}}`). Server
//! messages are parsed into [`ServerMessage`] and flattened by [`demux`] into
//! the [`Inbound`] events the session forwards.

use crate::config::SessionConfig;
use crate::error::Result;
use crate::frame::{InboundPayload, WireFrame};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, warn};

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<serde_json::Value>,
}

/// System instruction or turn content.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TextPart {
    pub text: String,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<serde_json::Value>,
}

impl Setup {
    /// Audio-out setup for the given session configuration.
    pub fn for_config(config: &SessionConfig) -> Self {
        let speech_config = config.voice.as_ref().map(|voice| {
            serde_json::json!({
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
            })
        });
        let transcription = config.transcribe.then(|| serde_json::json!({}));

        Self {
            model: config.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config,
            }),
            system_instruction: config.system_instruction.as_ref().map(|text| Content {
                parts: vec![TextPart { text: text.clone() }],
            }),
            input_audio_transcription: transcription.clone(),
            output_audio_transcription: transcription,
        }
    }
}

/// Realtime media blob.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// A chunk of realtime input
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn audio(frame: WireFrame) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(Blob {
                mime_type: frame.mime_type,
                data: frame.data,
            }),
            audio_stream_end: None,
        })
    }

    pub fn audio_stream_end() -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: None,
            audio_stream_end: Some(true),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Server -> client message. Exactly one field is normally present.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<serde_json::Value>,
    pub tool_call: Option<serde_json::Value>,
    pub session_resumption_update: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub generation_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub text: Option<String>,
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: Option<String>,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

/// Who a transcript belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Model,
}

/// Demultiplexed inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    SetupComplete,
    /// Synthesized speech, still encoded
    Audio(InboundPayload),
    ModelText(String),
    Transcript { speaker: Speaker, text: String },
    /// The user barged in; queued model audio is stale
    Interrupted,
    TurnComplete,
    /// Server will disconnect soon
    GoAway,
}

/// Parse one server frame into the events it carries, in wire order.
pub fn demux(text: &str) -> Result<SmallVec<[Inbound; 4]>> {
    let message: ServerMessage = serde_json::from_str(text)?;
    let mut out = SmallVec::new();

    if message.setup_complete.is_some() {
        out.push(Inbound::SetupComplete);
    }

    if let Some(content) = message.server_content {
        if content.interrupted {
            out.push(Inbound::Interrupted);
        }
        if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            out.push(Inbound::Transcript {
                speaker: Speaker::User,
                text: t.text,
            });
        }
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    if inline.data.is_empty() {
                        warn!("Received inline data without payload");
                        continue;
                    }
                    out.push(Inbound::Audio(InboundPayload {
                        mime_type: inline.mime_type,
                        data: inline.data,
                    }));
                } else if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    out.push(Inbound::ModelText(text));
                }
            }
        }
        if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            out.push(Inbound::Transcript {
                speaker: Speaker::Model,
                text: t.text,
            });
        }
        if content.turn_complete {
            out.push(Inbound::TurnComplete);
        }
    }

    if message.go_away.is_some() {
        out.push(Inbound::GoAway);
    }
    if message.tool_call.is_some() {
        debug!("Ignoring tool call, no tools are declared");
    }
    if message.session_resumption_update.is_some() {
        debug!("Ignoring session resumption update");
    }

    Ok(out)
}
