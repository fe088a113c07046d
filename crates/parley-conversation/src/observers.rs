use parley_core::types::Role;
use serde::Serialize;

/// Incremental or final transcript text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEvent {
    pub role: Role,
    pub text: String,
    /// Final events carry the complete text of a message just added to history.
    pub is_final: bool,
}

impl TranscriptEvent {
    pub fn partial(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            is_final: false,
        }
    }

    pub fn complete(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            is_final: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSource {
    /// Audio the application appended.
    Input,
    /// Audio the server produced.
    Output,
}

/// Normalised RMS level, `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AudioLevel {
    pub source: AudioSource,
    pub level: f32,
}
