use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parley_conversation::{Conversation, ConversationError, TranscriptEvent};
use parley_core::config::{AudioConfig, ReconnectConfig, TransportConfig};
use parley_core::protocol::SessionConfiguration;
use parley_core::types::{ConversationItem, ConversationState, Role};
use parley_session::Session;
use parley_tools::{ExecutionResult, Tool, ToolError, ToolExecutor};
use parley_transport::Transport;
use parley_transport::testing::MockServer;
use serde_json::json;
use tokio::sync::{Notify, broadcast};

const WAIT: Duration = Duration::from_secs(5);

struct WeatherTool {
    delay: Duration,
    started: Arc<Notify>,
    finished: Arc<AtomicBool>,
}

impl WeatherTool {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            started: Arc::new(Notify::new()),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "getWeather"
    }

    fn description(&self) -> &str {
        "Current weather for a city"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "location": { "type": "string" } },
            "required": ["location"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> anyhow::Result<String> {
        self.started.notify_one();
        tokio::time::sleep(self.delay).await;
        self.finished.store(true, Ordering::SeqCst);
        let location = params["location"].as_str().unwrap_or_default();
        Ok(format!("Sunny in {location}, 22C"))
    }
}

fn session() -> Session {
    let transport = Transport::new(TransportConfig {
        connect_timeout_ms: 2_000,
        liveness_timeout_ms: 2_000,
        heartbeat_interval_ms: 30_000,
        reconnect: ReconnectConfig {
            max_attempts: 2,
            base_delay_ms: 10,
            max_delay_ms: 10,
        },
    });
    Session::new(
        transport,
        &AudioConfig {
            sample_rate: 24_000,
            chunk_bytes: 4,
            max_buffer_bytes: 1024,
        },
    )
}

fn conversation_with(executor: ToolExecutor) -> Conversation {
    Conversation::with_tool_timeout(session(), Arc::new(executor), Duration::from_secs(2))
}

/// Start against `server` and consume the initial `session.update`.
async fn start(conversation: &Conversation, server: &MockServer, config: SessionConfiguration) {
    conversation.start(server.endpoint(), config).await.unwrap();
    let update = server.next_json(WAIT).await.unwrap();
    assert_eq!(update["type"], "session.update");
}

async fn wait_for_state(conversation: &Conversation, state: ConversationState) {
    let mut rx = conversation.subscribe_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .unwrap();
}

async fn wait_for_messages(conversation: &Conversation, count: usize) {
    tokio::time::timeout(WAIT, async {
        while conversation.messages().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {count} messages"));
}

async fn next_transcript(rx: &mut broadcast::Receiver<TranscriptEvent>) -> TranscriptEvent {
    tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_start_advertises_registered_tools() {
    let server = MockServer::start().await;
    let executor = ToolExecutor::new();
    executor.register(Arc::new(WeatherTool::new(Duration::ZERO)));
    let conversation = conversation_with(executor);

    conversation
        .start(
            server.endpoint(),
            SessionConfiguration::default().with_instructions("Be brief."),
        )
        .await
        .unwrap();
    let update = server.next_json(WAIT).await.unwrap();
    assert_eq!(update["type"], "session.update");
    assert_eq!(update["session"]["instructions"], "Be brief.");
    assert_eq!(update["session"]["tools"][0]["name"], "getWeather");
    assert_eq!(update["session"]["tools"][0]["type"], "function");
    assert_eq!(conversation.state(), ConversationState::Idle);
    conversation.end().await;
}

#[tokio::test]
async fn test_text_response_becomes_one_message() {
    let server = MockServer::start().await;
    let conversation = conversation_with(ToolExecutor::new());
    start(&conversation, &server, SessionConfiguration::default()).await;
    let mut transcript = conversation.subscribe_transcript();

    conversation.send_text("hello").await.unwrap();
    assert_eq!(conversation.state(), ConversationState::Processing);

    let create = server.next_json(WAIT).await.unwrap();
    assert_eq!(create["type"], "conversation.item.create");
    assert_eq!(create["item"]["content"][0]["text"], "hello");
    let response = server.next_json(WAIT).await.unwrap();
    assert_eq!(response["type"], "response.create");

    assert_eq!(
        next_transcript(&mut transcript).await,
        TranscriptEvent::complete(Role::User, "hello")
    );

    server.send_json(json!({"type": "response.text.delta", "item_id": "item_a", "delta": "Hi"}));
    server.send_json(json!({"type": "response.text.delta", "item_id": "item_a", "delta": " there"}));
    server.send_json(json!({"type": "response.text.done", "item_id": "item_a", "text": "Hi there"}));
    server.send_json(json!({"type": "response.done", "response": {"status": "completed"}}));

    assert_eq!(
        next_transcript(&mut transcript).await,
        TranscriptEvent::partial(Role::Assistant, "Hi")
    );
    assert_eq!(
        next_transcript(&mut transcript).await,
        TranscriptEvent::partial(Role::Assistant, " there")
    );
    assert_eq!(
        next_transcript(&mut transcript).await,
        TranscriptEvent::complete(Role::Assistant, "Hi there")
    );

    wait_for_state(&conversation, ConversationState::Idle).await;
    let messages = conversation.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].text, "Hi there");

    let items = conversation.items();
    assert_eq!(items.len(), 2);
    assert_eq!(items[1].id(), Some("item_a"));
    conversation.end().await;
}

#[tokio::test]
async fn test_function_call_returns_output_then_requests_response() {
    let server = MockServer::start().await;
    let tool = WeatherTool::new(Duration::from_millis(200));
    let started = tool.started.clone();
    let executor = ToolExecutor::new();
    executor.register(Arc::new(tool));
    let conversation = conversation_with(executor);
    start(&conversation, &server, SessionConfiguration::default()).await;

    server.send_json(json!({
        "type": "response.function_call_arguments.done",
        "item_id": "fc_1",
        "call_id": "call_1",
        "name": "getWeather",
        "arguments": "{\"location\":\"Tokyo\"}"
    }));

    // Queue a text intent while the slow tool is running.
    tokio::time::timeout(WAIT, started.notified()).await.unwrap();
    let queued = {
        let conversation = conversation.clone();
        tokio::spawn(async move { conversation.send_text("thanks").await })
    };

    let output = server.next_json(WAIT).await.unwrap();
    assert_eq!(output["type"], "conversation.item.create");
    assert_eq!(output["item"]["type"], "function_call_output");
    assert_eq!(output["item"]["call_id"], "call_1");
    assert_eq!(output["item"]["output"], "Sunny in Tokyo, 22C");
    assert_eq!(server.next_json(WAIT).await.unwrap()["type"], "response.create");

    let user = server.next_json(WAIT).await.unwrap();
    assert_eq!(user["type"], "conversation.item.create");
    assert_eq!(user["item"]["content"][0]["text"], "thanks");
    assert_eq!(server.next_json(WAIT).await.unwrap()["type"], "response.create");
    queued.await.unwrap().unwrap();

    let kinds: Vec<&str> = conversation.items().iter().map(ConversationItem::kind).collect();
    assert_eq!(kinds, vec!["function_call", "function_call_output", "message"]);

    let history = conversation.executor().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].tool_name, "getWeather");
    conversation.end().await;
}

/// Start a conversation with a slow weather tool and have the server call it.
/// Returns once the tool body is running.
async fn conversation_mid_tool(
    server: &MockServer,
    delay: Duration,
) -> (Conversation, Arc<AtomicBool>) {
    let tool = WeatherTool::new(delay);
    let started = tool.started.clone();
    let finished = tool.finished.clone();
    let executor = ToolExecutor::new();
    executor.register(Arc::new(tool));
    let conversation = conversation_with(executor);
    start(&conversation, server, SessionConfiguration::default()).await;

    server.send_json(json!({
        "type": "response.function_call_arguments.done",
        "item_id": "fc_1",
        "call_id": "call_1",
        "name": "getWeather",
        "arguments": "{\"location\":\"Oslo\"}"
    }));
    tokio::time::timeout(WAIT, started.notified()).await.unwrap();
    (conversation, finished)
}

fn assert_cancelled_once(conversation: &Conversation) {
    let history = conversation.executor().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].tool_name, "getWeather");
    assert_eq!(
        history[0].result,
        ExecutionResult::Failure(ToolError::Execution("cancelled".into()))
    );
}

#[tokio::test]
async fn test_end_mid_tool_aborts_and_records_call() {
    let server = MockServer::start().await;
    let (conversation, finished) = conversation_mid_tool(&server, Duration::from_millis(300)).await;

    conversation.end().await;
    assert_cancelled_once(&conversation);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!finished.load(Ordering::SeqCst), "tool kept running after end");
    assert_eq!(conversation.executor().history().len(), 1);
}

#[tokio::test]
async fn test_append_audio_not_blocked_by_running_tool() {
    let server = MockServer::start().await;
    let (conversation, finished) = conversation_mid_tool(&server, Duration::from_secs(1)).await;

    tokio::time::timeout(
        Duration::from_millis(200),
        conversation.append_audio(vec![1u8, 0, 2, 0]),
    )
    .await
    .expect("append_audio waited for the tool")
    .unwrap();

    let append = server.next_json(Duration::from_millis(200)).await.unwrap();
    assert_eq!(append["type"], "input_audio_buffer.append");
    assert!(!finished.load(Ordering::SeqCst));

    let output = server.next_json(WAIT).await.unwrap();
    assert_eq!(output["item"]["type"], "function_call_output");
    conversation.end().await;
}

#[tokio::test]
async fn test_interrupt_abandons_running_tool() {
    let server = MockServer::start().await;
    let (conversation, finished) = conversation_mid_tool(&server, Duration::from_secs(1)).await;

    tokio::time::timeout(Duration::from_millis(200), conversation.interrupt())
        .await
        .expect("interrupt waited for the tool")
        .unwrap();
    assert_eq!(conversation.state(), ConversationState::Idle);
    assert_eq!(server.next_json(WAIT).await.unwrap()["type"], "response.cancel");
    assert_cancelled_once(&conversation);

    // The abandoned call never hands an output back.
    assert!(server.next_json(Duration::from_millis(1_500)).await.is_none());
    assert!(!finished.load(Ordering::SeqCst));
    let kinds: Vec<&str> = conversation.items().iter().map(ConversationItem::kind).collect();
    assert_eq!(kinds, vec!["function_call"]);

    conversation.send_text("never mind").await.unwrap();
    assert_eq!(conversation.state(), ConversationState::Processing);
    conversation.end().await;
}

#[tokio::test]
async fn test_unknown_tool_reports_error_output() {
    let server = MockServer::start().await;
    let conversation = conversation_with(ToolExecutor::new());
    start(&conversation, &server, SessionConfiguration::default()).await;

    server.send_json(json!({
        "type": "response.function_call_arguments.done",
        "call_id": "call_9",
        "name": "launchRocket",
        "arguments": "{}"
    }));

    let output = server.next_json(WAIT).await.unwrap();
    assert_eq!(output["item"]["type"], "function_call_output");
    assert_eq!(output["item"]["call_id"], "call_9");
    assert!(
        output["item"]["output"].as_str().unwrap().starts_with("Error"),
        "{output}"
    );
    assert_eq!(server.next_json(WAIT).await.unwrap()["type"], "response.create");
    conversation.end().await;
}

#[tokio::test]
async fn test_end_stops_dispatch() {
    let server = MockServer::start().await;
    let conversation = conversation_with(ToolExecutor::new());
    start(&conversation, &server, SessionConfiguration::default()).await;
    let mut transcript = conversation.subscribe_transcript();

    conversation.end().await;
    assert_eq!(conversation.state(), ConversationState::Idle);
    assert!(!conversation.session().is_connected());

    server.send_json(json!({"type": "response.text.delta", "delta": "late"}));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        transcript.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert!(conversation.messages().is_empty());

    assert!(matches!(
        conversation.send_text("anyone there?").await,
        Err(ConversationError::NotStarted)
    ));
}

#[tokio::test]
async fn test_stop_listening_commits_after_all_audio() {
    let server = MockServer::start().await;
    let conversation = conversation_with(ToolExecutor::new());
    start(&conversation, &server, SessionConfiguration::default()).await;

    conversation.start_listening().await.unwrap();
    assert_eq!(conversation.state(), ConversationState::Listening);

    let mut expected = Vec::new();
    for chunk in [[1u8, 0, 2, 0, 3, 0], [4, 0, 5, 0, 6, 0]] {
        conversation.append_audio(chunk.to_vec()).await.unwrap();
        expected.extend_from_slice(&chunk);
    }
    conversation.stop_listening().await.unwrap();
    assert_eq!(conversation.state(), ConversationState::Processing);

    let mut audio = Vec::new();
    let last = loop {
        let value = server.next_json(WAIT).await.unwrap();
        if value["type"] != "input_audio_buffer.append" {
            break value;
        }
        audio.extend(BASE64.decode(value["audio"].as_str().unwrap()).unwrap());
    };
    assert_eq!(audio, expected);
    assert_eq!(last["type"], "input_audio_buffer.commit");

    // Server-side turn detection creates the response itself.
    assert!(server.next_json(Duration::from_millis(100)).await.is_none());
    conversation.end().await;
}

#[tokio::test]
async fn test_manual_turns_request_response_on_stop() {
    let server = MockServer::start().await;
    let conversation = conversation_with(ToolExecutor::new());
    let config = SessionConfiguration {
        turn_detection: None,
        ..SessionConfiguration::default()
    };
    start(&conversation, &server, config).await;

    conversation.start_listening().await.unwrap();
    conversation.append_audio(vec![0u8; 4]).await.unwrap();
    conversation.stop_listening().await.unwrap();

    assert_eq!(
        server.next_json(WAIT).await.unwrap()["type"],
        "input_audio_buffer.append"
    );
    assert_eq!(
        server.next_json(WAIT).await.unwrap()["type"],
        "input_audio_buffer.commit"
    );
    assert_eq!(server.next_json(WAIT).await.unwrap()["type"], "response.create");
    conversation.end().await;
}

#[tokio::test]
async fn test_stop_listening_requires_listening() {
    let server = MockServer::start().await;
    let conversation = conversation_with(ToolExecutor::new());
    start(&conversation, &server, SessionConfiguration::default()).await;

    let err = conversation.stop_listening().await.unwrap_err();
    assert!(matches!(
        err,
        ConversationError::InvalidState {
            state: ConversationState::Idle,
            ..
        }
    ));
    assert!(server.next_json(Duration::from_millis(100)).await.is_none());
    conversation.end().await;
}

#[tokio::test]
async fn test_server_error_blocks_intents_until_interrupt() {
    let server = MockServer::start().await;
    let conversation = conversation_with(ToolExecutor::new());
    start(&conversation, &server, SessionConfiguration::default()).await;

    server.send_json(json!({
        "type": "error",
        "error": {"type": "invalid_request_error", "code": "bad_item", "message": "Item is malformed"}
    }));
    wait_for_state(&conversation, ConversationState::Error).await;
    let error = conversation.last_error().unwrap();
    assert_eq!(error.code.as_deref(), Some("bad_item"));
    assert_eq!(error.message, "Item is malformed");

    assert!(matches!(
        conversation.send_text("hello").await,
        Err(ConversationError::InvalidState {
            state: ConversationState::Error,
            ..
        })
    ));

    conversation.interrupt().await.unwrap();
    assert_eq!(conversation.state(), ConversationState::Idle);
    assert_eq!(server.next_json(WAIT).await.unwrap()["type"], "response.cancel");

    conversation.send_text("hello again").await.unwrap();
    assert_eq!(conversation.state(), ConversationState::Processing);
    conversation.end().await;
}

#[tokio::test]
async fn test_interrupt_discards_partial_response() {
    let server = MockServer::start().await;
    let conversation = conversation_with(ToolExecutor::new());
    start(&conversation, &server, SessionConfiguration::default()).await;
    let mut transcript = conversation.subscribe_transcript();

    conversation.send_text("tell me a story").await.unwrap();
    next_transcript(&mut transcript).await;
    server.next_json(WAIT).await.unwrap();
    server.next_json(WAIT).await.unwrap();

    server.send_json(json!({"type": "response.text.delta", "delta": "Once upon"}));
    assert_eq!(
        next_transcript(&mut transcript).await,
        TranscriptEvent::partial(Role::Assistant, "Once upon")
    );

    conversation.interrupt().await.unwrap();
    assert_eq!(conversation.state(), ConversationState::Idle);
    assert_eq!(server.next_json(WAIT).await.unwrap()["type"], "response.cancel");

    server.send_json(json!({"type": "response.cancelled"}));
    server.send_json(json!({"type": "response.done", "response": {"status": "cancelled"}}));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let messages = conversation.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text, "tell me a story");
    conversation.end().await;
}

#[tokio::test]
async fn test_audio_response_finalized_on_response_done() {
    let server = MockServer::start().await;
    let conversation = conversation_with(ToolExecutor::new());
    start(&conversation, &server, SessionConfiguration::default()).await;
    let mut output = conversation.subscribe_output_audio();

    conversation.send_text("say hello").await.unwrap();
    server.next_json(WAIT).await.unwrap();
    server.next_json(WAIT).await.unwrap();

    let pcm = vec![0u8, 1, 2, 3];
    server.send_json(json!({
        "type": "response.audio.delta",
        "item_id": "item_audio",
        "delta": BASE64.encode(&pcm)
    }));
    wait_for_state(&conversation, ConversationState::Speaking).await;
    assert_eq!(tokio::time::timeout(WAIT, output.recv()).await.unwrap().unwrap(), pcm);

    server.send_json(json!({"type": "response.audio_transcript.delta", "delta": "Hel"}));
    server.send_json(json!({"type": "response.audio_transcript.done", "transcript": "Hello"}));
    server.send_json(json!({"type": "response.audio.done", "item_id": "item_audio"}));
    wait_for_state(&conversation, ConversationState::Idle).await;
    assert_eq!(conversation.messages().len(), 1);

    server.send_json(json!({"type": "response.done", "response": {"status": "completed"}}));
    wait_for_messages(&conversation, 2).await;

    let messages = conversation.messages();
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].text, "Hello");
    assert_eq!(messages[1].audio.as_deref(), Some(&pcm[..]));
    assert_eq!(conversation.items()[1].id(), Some("item_audio"));
    conversation.end().await;
}

#[tokio::test]
async fn test_server_vad_turn() {
    let server = MockServer::start().await;
    let conversation = conversation_with(ToolExecutor::new());
    start(&conversation, &server, SessionConfiguration::default()).await;

    conversation.start_listening().await.unwrap();
    server.send_json(json!({"type": "input_audio_buffer.speech_started", "audio_start_ms": 100}));
    server.send_json(json!({"type": "input_audio_buffer.speech_stopped", "audio_end_ms": 900}));
    wait_for_state(&conversation, ConversationState::Processing).await;

    server.send_json(json!({
        "type": "conversation.item.input_audio_transcription.completed",
        "item_id": "item_user",
        "transcript": "what time is it"
    }));
    wait_for_messages(&conversation, 1).await;

    let messages = conversation.messages();
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].text, "what time is it");
    conversation.end().await;
}

#[tokio::test]
async fn test_restart_clears_history() {
    let server = MockServer::start().await;
    let conversation = conversation_with(ToolExecutor::new());
    start(&conversation, &server, SessionConfiguration::default()).await;
    conversation.send_text("first").await.unwrap();
    assert_eq!(conversation.messages().len(), 1);
    assert_eq!(
        server.next_json(WAIT).await.unwrap()["type"],
        "conversation.item.create"
    );
    assert_eq!(server.next_json(WAIT).await.unwrap()["type"], "response.create");

    conversation.end().await;
    start(&conversation, &server, SessionConfiguration::default()).await;
    assert!(conversation.messages().is_empty());
    assert_eq!(conversation.state(), ConversationState::Idle);
    conversation.end().await;
}
