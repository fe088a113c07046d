//! Realtime wire protocol.
//!
//! All traffic is JSON-over-WebSocket. Every message carries a `type`
//! discriminator; client and server messages are modelled as two tagged enums.

use serde::{Deserialize, Serialize};

use crate::types::{ConversationItem, Modality};

/// Default PCM sample rate for input and output audio.
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Audio encoding on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    #[default]
    Pcm16,
    G711Ulaw,
    G711Alaw,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDetectionMode {
    #[default]
    ServerVad,
    SemanticVad,
}

/// Server-side voice activity detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type", default)]
    pub mode: TurnDetectionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_padding_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silence_duration_ms: Option<u32>,
    /// Whether the server requests a response on its own once speech stops.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_response: Option<bool>,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            mode: TurnDetectionMode::ServerVad,
            threshold: Some(0.5),
            prefix_padding_ms: Some(300),
            silence_duration_ms: Some(500),
            create_response: Some(true),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    pub model: String,
}

/// A function the model may call, as advertised in `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type", default = "default_tool_kind")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

fn default_tool_kind() -> String {
    "function".into()
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            kind: default_tool_kind(),
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Immutable snapshot of the session settings. Each `session.update`
/// replaces the previous snapshot wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub tools: Vec<ToolDefinition>,
    /// `None` disables turn detection (serialized as `null`).
    pub turn_detection: Option<TurnDetection>,
    pub modalities: Vec<Modality>,
    pub input_audio_format: AudioFormat,
    pub output_audio_format: AudioFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<u32>,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            model: None,
            voice: Some("alloy".into()),
            instructions: None,
            tools: Vec::new(),
            turn_detection: Some(TurnDetection::default()),
            modalities: vec![Modality::Text, Modality::Audio],
            input_audio_format: AudioFormat::Pcm16,
            output_audio_format: AudioFormat::Pcm16,
            input_audio_transcription: None,
            temperature: Some(0.8),
            max_response_output_tokens: None,
        }
    }
}

impl SessionConfiguration {
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn with_modalities(mut self, modalities: Vec<Modality>) -> Self {
        self.modalities = modalities;
        self
    }

    /// Add tool definitions, replacing any existing definition with the same name.
    pub fn with_tools(mut self, tools: impl IntoIterator<Item = ToolDefinition>) -> Self {
        for tool in tools {
            self.tools.retain(|t| t.name != tool.name);
            self.tools.push(tool);
        }
        self
    }

    pub fn wants_audio(&self) -> bool {
        self.modalities.contains(&Modality::Audio)
    }
}

/// Per-response overrides for `response.create`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<Modality>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Client -> Server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: Box<SessionConfiguration> },

    /// WARNING: `audio` is a base64 blob and can be large; log `event_type()` instead.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<ResponseParams>,
    },

    #[serde(rename = "response.cancel")]
    ResponseCancel,

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_item_id: Option<String>,
        item: ConversationItem,
    },

    #[serde(rename = "conversation.item.truncate")]
    ConversationItemTruncate {
        item_id: String,
        content_index: u32,
        audio_end_ms: u32,
    },

    #[serde(rename = "conversation.item.delete")]
    ConversationItemDelete { item_id: String },
}

impl ClientEvent {
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            Self::InputAudioBufferCommit => "input_audio_buffer.commit",
            Self::InputAudioBufferClear => "input_audio_buffer.clear",
            Self::ResponseCreate { .. } => "response.create",
            Self::ResponseCancel => "response.cancel",
            Self::ConversationItemCreate { .. } => "conversation.item.create",
            Self::ConversationItemTruncate { .. } => "conversation.item.truncate",
            Self::ConversationItemDelete { .. } => "conversation.item.delete",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Error payload of a server `error` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

/// Server -> Client message. Types this client does not understand decode
/// to [`ServerEvent::Unknown`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: serde_json::Value,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: serde_json::Value,
    },

    #[serde(rename = "response.text.delta")]
    ResponseTextDelta {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        item_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.text.done")]
    ResponseTextDone {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        text: String,
    },

    /// `delta` is base64-encoded PCM.
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        item_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.audio.done")]
    ResponseAudioDone {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "response.audio_transcript.delta")]
    ResponseAudioTranscriptDelta {
        #[serde(default)]
        item_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    ResponseAudioTranscriptDone {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: Option<u64>,
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: Option<u64>,
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputAudioTranscriptionCompleted {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        item_id: Option<String>,
        call_id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        arguments: String,
    },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: serde_json::Value,
    },

    #[serde(rename = "response.cancelled")]
    ResponseCancelled {
        #[serde(default)]
        response_id: Option<String>,
    },

    #[serde(rename = "error")]
    Error { error: ServerError },

    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session.created",
            Self::SessionUpdated { .. } => "session.updated",
            Self::ResponseTextDelta { .. } => "response.text.delta",
            Self::ResponseTextDone { .. } => "response.text.done",
            Self::ResponseAudioDelta { .. } => "response.audio.delta",
            Self::ResponseAudioDone { .. } => "response.audio.done",
            Self::ResponseAudioTranscriptDelta { .. } => "response.audio_transcript.delta",
            Self::ResponseAudioTranscriptDone { .. } => "response.audio_transcript.done",
            Self::SpeechStarted { .. } => "input_audio_buffer.speech_started",
            Self::SpeechStopped { .. } => "input_audio_buffer.speech_stopped",
            Self::InputAudioTranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            Self::FunctionCallArgumentsDone { .. } => "response.function_call_arguments.done",
            Self::ResponseDone { .. } => "response.done",
            Self::ResponseCancelled { .. } => "response.cancelled",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
