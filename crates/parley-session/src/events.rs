use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parley_core::protocol::{ServerError, ServerEvent};
use tracing::{debug, warn};

/// Decoded server event, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SessionCreated,
    SessionUpdated,
    TextDelta {
        item_id: Option<String>,
        delta: String,
    },
    TextDone {
        item_id: Option<String>,
        text: String,
    },
    /// Raw PCM, already base64-decoded.
    AudioDelta {
        item_id: Option<String>,
        audio: Vec<u8>,
    },
    AudioDone {
        item_id: Option<String>,
    },
    AudioTranscriptDelta {
        item_id: Option<String>,
        delta: String,
    },
    AudioTranscriptDone {
        item_id: Option<String>,
        transcript: String,
    },
    SpeechStarted,
    SpeechStopped,
    InputTranscriptionCompleted {
        item_id: Option<String>,
        transcript: String,
    },
    FunctionCallArgumentsDone {
        item_id: Option<String>,
        call_id: String,
        name: String,
        arguments: String,
    },
    ResponseDone,
    ResponseCancelled,
    Error(ServerError),
    /// The connection was re-established and buffered audio replayed.
    Reconnected,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::SessionUpdated => "session_updated",
            Self::TextDelta { .. } => "text_delta",
            Self::TextDone { .. } => "text_done",
            Self::AudioDelta { .. } => "audio_delta",
            Self::AudioDone { .. } => "audio_done",
            Self::AudioTranscriptDelta { .. } => "audio_transcript_delta",
            Self::AudioTranscriptDone { .. } => "audio_transcript_done",
            Self::SpeechStarted => "speech_started",
            Self::SpeechStopped => "speech_stopped",
            Self::InputTranscriptionCompleted { .. } => "input_transcription_completed",
            Self::FunctionCallArgumentsDone { .. } => "function_call_arguments_done",
            Self::ResponseDone => "response_done",
            Self::ResponseCancelled => "response_cancelled",
            Self::Error(_) => "error",
            Self::Reconnected => "reconnected",
        }
    }
}

/// Decode one text frame. Unknown types and malformed frames yield `None`.
pub fn decode(text: &str) -> Option<SessionEvent> {
    let event = match ServerEvent::from_json(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, len = text.len(), "Dropping undecodable server frame");
            return None;
        }
    };

    let decoded = match event {
        ServerEvent::SessionCreated { .. } => SessionEvent::SessionCreated,
        ServerEvent::SessionUpdated { .. } => SessionEvent::SessionUpdated,
        ServerEvent::ResponseTextDelta { item_id, delta, .. } => {
            SessionEvent::TextDelta { item_id, delta }
        }
        ServerEvent::ResponseTextDone { item_id, text, .. } => {
            SessionEvent::TextDone { item_id, text }
        }
        ServerEvent::ResponseAudioDelta { item_id, delta, .. } => match BASE64.decode(&delta) {
            Ok(audio) => SessionEvent::AudioDelta { item_id, audio },
            Err(e) => {
                warn!(error = %e, "Dropping audio delta with invalid base64");
                return None;
            }
        },
        ServerEvent::ResponseAudioDone { item_id, .. } => SessionEvent::AudioDone { item_id },
        ServerEvent::ResponseAudioTranscriptDelta { item_id, delta } => {
            SessionEvent::AudioTranscriptDelta { item_id, delta }
        }
        ServerEvent::ResponseAudioTranscriptDone {
            item_id,
            transcript,
        } => SessionEvent::AudioTranscriptDone {
            item_id,
            transcript,
        },
        ServerEvent::SpeechStarted { .. } => SessionEvent::SpeechStarted,
        ServerEvent::SpeechStopped { .. } => SessionEvent::SpeechStopped,
        ServerEvent::InputAudioTranscriptionCompleted {
            item_id,
            transcript,
        } => SessionEvent::InputTranscriptionCompleted {
            item_id,
            transcript,
        },
        ServerEvent::FunctionCallArgumentsDone {
            item_id,
            call_id,
            name,
            arguments,
            ..
        } => SessionEvent::FunctionCallArgumentsDone {
            item_id,
            call_id,
            name,
            arguments,
        },
        ServerEvent::ResponseDone { .. } => SessionEvent::ResponseDone,
        ServerEvent::ResponseCancelled { .. } => SessionEvent::ResponseCancelled,
        ServerEvent::Error { error } => SessionEvent::Error(error),
        ServerEvent::Unknown => {
            debug!("Ignoring unrecognized server event");
            return None;
        }
    };
    Some(decoded)
}
