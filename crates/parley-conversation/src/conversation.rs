use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parley_core::protocol::{ServerError, SessionConfiguration};
use parley_core::types::{
    ContentPart, ConversationItem, ConversationMessage, ConversationState, Endpoint, Role,
    new_item_id,
};
use parley_session::{Session, SessionEvent, SessionEventStream, pcm16_level};
use parley_tools::ToolExecutor;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{ConversationError, Result};
use crate::observers::{AudioLevel, AudioSource, TranscriptEvent};
use crate::state::{Trigger, transition};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const OBSERVER_CAPACITY: usize = 256;

type Reply = oneshot::Sender<Result<()>>;

/// Intents queued onto the actor.
enum Command {
    SendText(String, Reply),
    StartListening(Reply),
    StopListening(Reply),
    Interrupt(Reply),
}

#[derive(Default)]
struct History {
    items: Vec<ConversationItem>,
    messages: Vec<ConversationMessage>,
}

struct Runner {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    session: Session,
    executor: Arc<ToolExecutor>,
    tool_timeout: Duration,
    state: watch::Sender<ConversationState>,
    transcript: broadcast::Sender<TranscriptEvent>,
    audio_level: broadcast::Sender<AudioLevel>,
    output_audio: broadcast::Sender<Vec<u8>>,
    history: RwLock<History>,
    last_error: StdMutex<Option<ServerError>>,
    runner: Mutex<Option<Runner>>,
}

impl Shared {
    fn state(&self) -> ConversationState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConversationState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Conversation state changed");
        }
    }

    /// Apply `trigger` if the current state has a matching edge.
    fn apply(&self, trigger: Trigger) -> bool {
        let current = self.state();
        match transition(current, trigger) {
            Some(next) => {
                self.set_state(next);
                true
            }
            None => {
                trace!(state = %current, ?trigger, "No transition");
                false
            }
        }
    }

    fn check(&self, trigger: Trigger) -> Result<()> {
        let state = self.state();
        match transition(state, trigger) {
            Some(_) => Ok(()),
            None => Err(ConversationError::InvalidState {
                state,
                action: trigger.action(),
            }),
        }
    }

    fn publish(&self, event: TranscriptEvent) {
        let _ = self.transcript.send(event);
    }

    fn publish_level(&self, source: AudioSource, bytes: &[u8]) {
        let _ = self.audio_level.send(AudioLevel {
            source,
            level: pcm16_level(bytes),
        });
    }

    fn push_item(&self, item: ConversationItem) {
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .push(item);
    }

    fn push_message(&self, item: ConversationItem, message: ConversationMessage) {
        let text = message.text.clone();
        let role = message.role;
        {
            let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
            history.items.push(item);
            history.messages.push(message);
        }
        self.publish(TranscriptEvent::complete(role, text));
    }
}

/// A realtime conversation. Clones share the same conversation.
#[derive(Clone)]
pub struct Conversation {
    shared: Arc<Shared>,
}

impl Conversation {
    pub fn new(session: Session, executor: Arc<ToolExecutor>) -> Self {
        let timeout = executor.default_timeout();
        Self::with_tool_timeout(session, executor, timeout)
    }

    /// Like [`Conversation::new`] with an explicit per-call tool timeout.
    pub fn with_tool_timeout(
        session: Session,
        executor: Arc<ToolExecutor>,
        tool_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConversationState::Idle);
        let (transcript, _) = broadcast::channel(OBSERVER_CAPACITY);
        let (audio_level, _) = broadcast::channel(OBSERVER_CAPACITY);
        let (output_audio, _) = broadcast::channel(OBSERVER_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                session,
                executor,
                tool_timeout,
                state,
                transcript,
                audio_level,
                output_audio,
                history: RwLock::new(History::default()),
                last_error: StdMutex::new(None),
                runner: Mutex::new(None),
            }),
        }
    }

    /// Connect, apply `configuration` (plus the executor's tool definitions)
    /// and start processing events. Any running conversation is ended first.
    pub async fn start(
        &self,
        endpoint: Endpoint,
        configuration: SessionConfiguration,
    ) -> Result<()> {
        self.stop_runner().await;
        let shared = &self.shared;

        shared.session.connect(endpoint).await?;
        let configuration = configuration.with_tools(shared.executor.definitions());
        if let Err(e) = shared.session.update_configuration(configuration).await {
            shared.session.disconnect().await;
            return Err(e.into());
        }

        *shared.history.write().unwrap_or_else(PoisonError::into_inner) = History::default();
        *shared.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
        shared.apply(Trigger::Start);

        let events = shared.session.events();
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let actor = Actor {
            shared: shared.clone(),
            text_draft: String::new(),
            audio_draft: AudioDraft::default(),
            tool_call: None,
            pending_tools: VecDeque::new(),
            deferred: VecDeque::new(),
        };
        let task = tokio::spawn(actor.run(events, command_rx, cancel.clone()));

        *shared.runner.lock().await = Some(Runner {
            commands,
            cancel,
            task,
        });
        info!("Conversation started");
        Ok(())
    }

    /// Stop processing events, disconnect and return to idle. After this
    /// returns no observer receives anything further from this conversation.
    /// A tool call still running is aborted and recorded as cancelled.
    pub async fn end(&self) {
        self.stop_runner().await;
        self.shared.apply(Trigger::End);
        self.shared.session.disconnect().await;
        info!("Conversation ended");
    }

    async fn stop_runner(&self) {
        let runner = self.shared.runner.lock().await.take();
        if let Some(runner) = runner {
            runner.cancel.cancel();
            let _ = runner.task.await;
        }
    }

    async fn ensure_started(&self) -> Result<()> {
        match *self.shared.runner.lock().await {
            Some(_) => Ok(()),
            None => Err(ConversationError::NotStarted),
        }
    }

    async fn commands(&self) -> Result<mpsc::Sender<Command>> {
        self.shared
            .runner
            .lock()
            .await
            .as_ref()
            .map(|r| r.commands.clone())
            .ok_or(ConversationError::NotStarted)
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<()> {
        let commands = self.commands().await?;
        let (reply, response) = oneshot::channel();
        commands
            .send(command(reply))
            .await
            .map_err(|_| ConversationError::NotStarted)?;
        response.await.map_err(|_| ConversationError::NotStarted)?
    }

    /// Add a user message and request a response.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| Command::SendText(text, reply)).await
    }

    pub async fn start_listening(&self) -> Result<()> {
        self.request(Command::StartListening).await
    }

    /// Commit the user's turn. Returns once every buffered chunk and the
    /// commit have been sent.
    pub async fn stop_listening(&self) -> Result<()> {
        self.request(Command::StopListening).await
    }

    /// Stream microphone audio. Buffered locally while disconnected.
    ///
    /// Goes straight to the session rather than through the intent queue, so
    /// it never waits behind a running tool call. Audio appended before
    /// [`Conversation::stop_listening`] is called is always committed.
    pub async fn append_audio(&self, pcm: impl Into<Vec<u8>>) -> Result<()> {
        self.ensure_started().await?;
        let pcm = pcm.into();
        self.shared.publish_level(AudioSource::Input, &pcm);
        self.shared.session.append_audio(&pcm).await;
        Ok(())
    }

    /// Cancel the in-flight response and drop its partial output. Tool calls
    /// that have not returned their output yet are abandoned. Buffered input
    /// audio is kept.
    pub async fn interrupt(&self) -> Result<()> {
        self.request(Command::Interrupt).await
    }

    pub fn state(&self) -> ConversationState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConversationState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe_transcript(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.shared.transcript.subscribe()
    }

    pub fn subscribe_audio_level(&self) -> broadcast::Receiver<AudioLevel> {
        self.shared.audio_level.subscribe()
    }

    /// Decoded PCM of the assistant's spoken output.
    pub fn subscribe_output_audio(&self) -> broadcast::Receiver<Vec<u8>> {
        self.shared.output_audio.subscribe()
    }

    pub fn messages(&self) -> Vec<ConversationMessage> {
        self.shared
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .messages
            .clone()
    }

    pub fn items(&self) -> Vec<ConversationItem> {
        self.shared
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .clone()
    }

    /// The server error that put the conversation into the error state.
    pub fn last_error(&self) -> Option<ServerError> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn session(&self) -> &Session {
        &self.shared.session
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.shared.executor
    }
}

/// Assistant audio and its transcript, accumulated until `response.done`.
#[derive(Default)]
struct AudioDraft {
    item_id: Option<String>,
    pcm: Vec<u8>,
    transcript: String,
}

impl AudioDraft {
    fn is_empty(&self) -> bool {
        self.pcm.is_empty() && self.transcript.is_empty()
    }
}

/// A function call announced by the server, waiting for its turn to run.
struct ToolCall {
    call_id: String,
    name: String,
    arguments: String,
}

impl ToolCall {
    /// Run the tool, then hand its output back and ask for the follow-up
    /// response.
    async fn run(self, shared: Arc<Shared>) {
        let Self {
            call_id,
            name,
            arguments,
        } = self;
        info!(tool = %name, call_id = %call_id, "Executing tool call");
        let execution = shared
            .executor
            .execute(&name, &arguments, shared.tool_timeout)
            .await;

        let output = ConversationItem::function_call_output(call_id, execution.result.to_output());
        if let Err(e) = shared.session.create_item(output.clone()).await {
            warn!(tool = %name, error = %e, "Failed to return tool output");
            return;
        }
        shared.push_item(output);

        if let Err(e) = shared.session.create_response(None).await {
            warn!(tool = %name, error = %e, "Failed to request follow-up response");
        }
    }
}

/// Drive the running tool call, or never resolve when there is none.
async fn drive(tool_call: &mut Option<BoxFuture<'static, ()>>) {
    match tool_call {
        Some(call) => call.await,
        None => std::future::pending().await,
    }
}

/// Sole owner of conversation mutation.
///
/// Tool calls run one at a time alongside event handling. Intents other than
/// interrupt wait in `deferred` until every pending tool call has finished.
struct Actor {
    shared: Arc<Shared>,
    text_draft: String,
    audio_draft: AudioDraft,
    tool_call: Option<BoxFuture<'static, ()>>,
    pending_tools: VecDeque<ToolCall>,
    deferred: VecDeque<Command>,
}

enum Step {
    Command(Command),
    Event(parley_session::Result<SessionEvent>),
    ToolDone,
    Finished,
}

impl Actor {
    async fn run(
        mut self,
        mut events: SessionEventStream,
        mut commands: mpsc::Receiver<Command>,
        cancel: CancellationToken,
    ) {
        loop {
            if self.tool_call.is_none() {
                if let Some(call) = self.pending_tools.pop_front() {
                    self.tool_call = Some(call.run(self.shared.clone()).boxed());
                } else if let Some(command) = self.deferred.pop_front() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.run_command(command) => {}
                    }
                    continue;
                }
            }

            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = drive(&mut self.tool_call), if self.tool_call.is_some() => Step::ToolDone,
                Some(command) = commands.recv() => Step::Command(command),
                event = events.next() => match event {
                    Some(event) => Step::Event(event),
                    None => Step::Finished,
                },
            };

            let keep_going = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                keep_going = self.step(step) => keep_going,
            };
            if !keep_going {
                break;
            }
        }
        debug!("Conversation loop stopped");
    }

    async fn step(&mut self, step: Step) -> bool {
        match step {
            Step::Command(command) => {
                self.handle_command(command).await;
                true
            }
            Step::Event(Ok(event)) => {
                self.handle_event(event).await;
                true
            }
            Step::ToolDone => {
                self.tool_call = None;
                true
            }
            Step::Event(Err(e)) => {
                warn!(error = %e, "Session event stream failed");
                self.shared.apply(Trigger::ServerError);
                false
            }
            Step::Finished => {
                debug!("Session event stream ended");
                false
            }
        }
    }

    fn tools_busy(&self) -> bool {
        self.tool_call.is_some() || !self.pending_tools.is_empty()
    }

    async fn handle_command(&mut self, command: Command) {
        let wait = self.tools_busy() || !self.deferred.is_empty();
        if wait && !matches!(command, Command::Interrupt(_)) {
            debug!("Intent deferred until tool calls finish");
            self.deferred.push_back(command);
            return;
        }
        self.run_command(command).await;
    }

    async fn run_command(&mut self, command: Command) {
        match command {
            Command::Interrupt(reply) => {
                let _ = reply.send(self.interrupt().await);
            }
            Command::SendText(text, reply) => {
                let _ = reply.send(self.send_text(text).await);
            }
            Command::StartListening(reply) => {
                let result = self.shared.check(Trigger::StartListening);
                if result.is_ok() {
                    self.shared.apply(Trigger::StartListening);
                }
                let _ = reply.send(result);
            }
            Command::StopListening(reply) => {
                let _ = reply.send(self.stop_listening().await);
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        self.shared.check(Trigger::SendText)?;
        let session = &self.shared.session;

        let item = ConversationItem::user_text(text.clone());
        session.create_item(item.clone()).await?;
        self.shared
            .push_message(item, ConversationMessage::new(Role::User, text));
        session.create_response(None).await?;
        self.shared.apply(Trigger::SendText);
        Ok(())
    }

    async fn stop_listening(&mut self) -> Result<()> {
        self.shared.check(Trigger::StopListening)?;
        let session = &self.shared.session;

        session.commit_audio().await?;
        let manual_turns = session
            .configuration()
            .is_some_and(|config| config.turn_detection.is_none());
        if manual_turns {
            session.create_response(None).await?;
        }
        self.shared.apply(Trigger::StopListening);
        Ok(())
    }

    async fn interrupt(&mut self) -> Result<()> {
        let abandoned = self.pending_tools.len() + usize::from(self.tool_call.is_some());
        if abandoned > 0 {
            info!(abandoned, "Abandoning tool calls");
        }
        self.tool_call = None;
        self.pending_tools.clear();

        match self.shared.session.cancel_response().await {
            Ok(()) => {}
            Err(e) if e.is_not_connected() => debug!("Cancel skipped while disconnected"),
            Err(e) => warn!(error = %e, "Failed to cancel response"),
        }
        self.text_draft.clear();
        self.audio_draft = AudioDraft::default();
        self.shared.apply(Trigger::Interrupt);
        Ok(())
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        trace!(event = event.name(), "Session event");
        let shared = self.shared.clone();

        match event {
            SessionEvent::SessionCreated | SessionEvent::SessionUpdated => {
                debug!("Session configuration acknowledged");
            }
            SessionEvent::TextDelta { delta, .. } => {
                self.text_draft.push_str(&delta);
                shared.publish(TranscriptEvent::partial(Role::Assistant, delta));
            }
            SessionEvent::TextDone { item_id, text } => {
                let draft = std::mem::take(&mut self.text_draft);
                let text = if text.is_empty() { draft } else { text };
                let item = ConversationItem::Message {
                    id: Some(item_id.unwrap_or_else(new_item_id)),
                    role: Role::Assistant,
                    content: vec![ContentPart::Text { text: text.clone() }],
                };
                shared.push_message(item, ConversationMessage::new(Role::Assistant, text));
                shared.apply(Trigger::TextDone);
            }
            SessionEvent::AudioDelta { item_id, audio } => {
                if self.audio_draft.item_id.is_none() {
                    self.audio_draft.item_id = item_id;
                }
                shared.publish_level(AudioSource::Output, &audio);
                self.audio_draft.pcm.extend_from_slice(&audio);
                let _ = shared.output_audio.send(audio);
                shared.apply(Trigger::AudioDelta);
            }
            SessionEvent::AudioTranscriptDelta { delta, .. } => {
                self.audio_draft.transcript.push_str(&delta);
                shared.publish(TranscriptEvent::partial(Role::Assistant, delta));
            }
            SessionEvent::AudioTranscriptDone { transcript, .. } => {
                if !transcript.is_empty() {
                    self.audio_draft.transcript = transcript;
                }
            }
            SessionEvent::AudioDone { .. } => {
                shared.apply(Trigger::AudioDone);
            }
            SessionEvent::ResponseDone => {
                self.finish_audio_message();
            }
            SessionEvent::ResponseCancelled => {
                self.text_draft.clear();
                self.audio_draft = AudioDraft::default();
            }
            SessionEvent::SpeechStarted => {
                shared.apply(Trigger::SpeechStarted);
            }
            SessionEvent::SpeechStopped => {
                shared.apply(Trigger::SpeechStopped);
            }
            SessionEvent::InputTranscriptionCompleted {
                item_id,
                transcript,
            } => {
                let item = ConversationItem::Message {
                    id: Some(item_id.unwrap_or_else(new_item_id)),
                    role: Role::User,
                    content: vec![ContentPart::InputAudio {
                        audio: None,
                        transcript: Some(transcript.clone()),
                    }],
                };
                shared.push_message(item, ConversationMessage::new(Role::User, transcript));
            }
            SessionEvent::FunctionCallArgumentsDone {
                item_id,
                call_id,
                name,
                arguments,
            } => {
                shared.push_item(ConversationItem::function_call(
                    item_id,
                    name.clone(),
                    call_id.clone(),
                    arguments.clone(),
                ));
                shared.apply(Trigger::FunctionCallDone);
                self.pending_tools.push_back(ToolCall {
                    call_id,
                    name,
                    arguments,
                });
            }
            SessionEvent::Error(error) => {
                warn!(
                    code = error.code.as_deref().unwrap_or(""),
                    message = %error.message,
                    "Server reported an error"
                );
                *shared.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
                shared.apply(Trigger::ServerError);
            }
            SessionEvent::Reconnected => {
                info!("Conversation resumed after reconnect");
            }
        }
    }

    fn finish_audio_message(&mut self) {
        let draft = std::mem::take(&mut self.audio_draft);
        if draft.is_empty() {
            return;
        }
        let item = ConversationItem::Message {
            id: Some(draft.item_id.unwrap_or_else(new_item_id)),
            role: Role::Assistant,
            content: vec![ContentPart::Audio {
                audio: None,
                transcript: Some(draft.transcript.clone()),
            }],
        };
        let message =
            ConversationMessage::new(Role::Assistant, draft.transcript).with_audio(draft.pcm);
        self.shared.push_message(item, message);
    }
}
