//! Conversation state transitions as a pure function.

use parley_core::types::ConversationState;

/// What can move the conversation from one state to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    StartListening,
    StopListening,
    SendText,
    SpeechStarted,
    SpeechStopped,
    AudioDelta,
    AudioDone,
    TextDone,
    FunctionCallDone,
    ServerError,
    Interrupt,
    End,
}

impl Trigger {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::StartListening => "start listening",
            Self::StopListening => "stop listening",
            Self::SendText => "send text",
            Self::SpeechStarted => "handle speech start",
            Self::SpeechStopped => "handle speech stop",
            Self::AudioDelta => "handle audio",
            Self::AudioDone => "finish audio",
            Self::TextDone => "finish text",
            Self::FunctionCallDone => "handle function call",
            Self::ServerError => "handle server error",
            Self::Interrupt => "interrupt",
            Self::End => "end",
        }
    }
}

/// Next state for `trigger` in `from`, or `None` when there is no such edge.
///
/// `error` is terminal for everything except `start`, `interrupt` and `end`.
pub fn transition(from: ConversationState, trigger: Trigger) -> Option<ConversationState> {
    use ConversationState::*;

    match (from, trigger) {
        (_, Trigger::Start | Trigger::Interrupt | Trigger::End) => Some(Idle),
        (_, Trigger::ServerError) => Some(Error),
        (Error, _) => None,

        (Idle | Processing | Listening, Trigger::StartListening) => Some(Listening),
        (Listening, Trigger::StopListening) => Some(Processing),
        (_, Trigger::SendText) => Some(Processing),

        (Processing | Listening, Trigger::SpeechStarted) => Some(Listening),
        (Listening, Trigger::SpeechStopped) => Some(Processing),
        (Processing | Speaking, Trigger::AudioDelta) => Some(Speaking),
        (Speaking, Trigger::AudioDone) => Some(Idle),
        (Processing, Trigger::TextDone) => Some(Idle),
        (Processing, Trigger::FunctionCallDone) => Some(Processing),

        _ => None,
    }
}
