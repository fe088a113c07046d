use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of the physical streaming connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// What the user (or UI) observes about the conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    #[default]
    Idle,
    Listening,
    Processing,
    Speaking,
    Error,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Response channel requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Audio,
}

/// One part of a message item's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText {
        text: String,
    },
    InputAudio {
        /// Base64-encoded PCM.
        #[serde(skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        transcript: Option<String>,
    },
    Text {
        text: String,
    },
    Audio {
        #[serde(skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        transcript: Option<String>,
    },
}

impl ContentPart {
    /// Text carried by this part, if any (typed text or an audio transcript).
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::InputText { text } | Self::Text { text } => Some(text),
            Self::InputAudio { transcript, .. } | Self::Audio { transcript, .. } => {
                transcript.as_deref()
            }
        }
    }
}

/// An atomic, immutable unit of conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        role: Role,
        content: Vec<ContentPart>,
    },
    FunctionCall {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        call_id: String,
        arguments: String,
    },
    FunctionCallOutput {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        call_id: String,
        output: String,
    },
}

impl ConversationItem {
    /// A user message carrying typed text.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::Message {
            id: Some(new_item_id()),
            role: Role::User,
            content: vec![ContentPart::InputText { text: text.into() }],
        }
    }

    /// A function call as announced by the server. A fresh id is used when
    /// the server did not assign one.
    pub fn function_call(
        id: Option<String>,
        name: impl Into<String>,
        call_id: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::FunctionCall {
            id: Some(id.unwrap_or_else(new_item_id)),
            name: name.into(),
            call_id: call_id.into(),
            arguments: arguments.into(),
        }
    }

    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::FunctionCallOutput {
            id: Some(new_item_id()),
            call_id: call_id.into(),
            output: output.into(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Message { id, .. }
            | Self::FunctionCall { id, .. }
            | Self::FunctionCallOutput { id, .. } => id.as_deref(),
        }
    }

    /// Wire name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::FunctionCall { .. } => "function_call",
            Self::FunctionCallOutput { .. } => "function_call_output",
        }
    }
}

/// Generate a client-side item id (`item_<32 hex>`).
pub fn new_item_id() -> String {
    format!("item_{}", uuid::Uuid::new_v4().simple())
}

/// Display-oriented mirror of message items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Raw PCM of a spoken message, when one was produced.
    #[serde(skip)]
    pub audio: Option<Vec<u8>>,
}

impl ConversationMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
            audio: None,
        }
    }

    pub fn with_audio(mut self, audio: Vec<u8>) -> Self {
        if !audio.is_empty() {
            self.audio = Some(audio);
        }
        self
    }
}

/// Where and how to open the streaming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_text_item_wire_shape() {
        let item = ConversationItem::user_text("Hello");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "input_text");
        assert_eq!(json["content"][0]["text"], "Hello");
        assert!(json["id"].as_str().unwrap().starts_with("item_"));
    }

    #[test]
    fn test_function_call_output_wire_shape() {
        let item = ConversationItem::function_call_output("call_1", "Sunny, 22C");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "function_call_output");
        assert_eq!(json["call_id"], "call_1");
        assert_eq!(json["output"], "Sunny, 22C");
    }

    #[test]
    fn test_item_ids_are_unique() {
        assert_ne!(new_item_id(), new_item_id());
    }

    #[test]
    fn test_content_part_text() {
        let part = ContentPart::Audio {
            audio: None,
            transcript: Some("spoken".into()),
        };
        assert_eq!(part.text(), Some("spoken"));
        let part = ContentPart::InputAudio {
            audio: Some("AAAA".into()),
            transcript: None,
        };
        assert_eq!(part.text(), None);
    }

    #[test]
    fn test_message_audio_skipped_when_empty() {
        let msg = ConversationMessage::new(Role::Assistant, "hi").with_audio(Vec::new());
        assert!(msg.audio.is_none());
        let msg = ConversationMessage::new(Role::Assistant, "hi").with_audio(vec![1, 2]);
        assert_eq!(msg.audio.as_deref(), Some(&[1u8, 2][..]));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConversationState::Speaking.to_string(), "speaking");
    }
}
