//! In-process WebSocket server for tests.
//!
//! Records every text frame a client sends, pushes frames on demand and can
//! drop or refuse connections to exercise reconnection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parley_core::types::Endpoint;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

enum Command {
    Send(String),
    Drop,
    /// Stop reading, so pings go unanswered while the socket stays open.
    Stall,
}

type CommandSlot = Arc<StdMutex<Option<mpsc::UnboundedSender<Command>>>>;

pub struct MockServer {
    addr: SocketAddr,
    received: Mutex<mpsc::UnboundedReceiver<String>>,
    current: CommandSlot,
    accepted: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    refuse: Arc<AtomicUsize>,
    cancel: CancellationToken,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::spawn(None).await
    }

    /// Send `greeting` to every client right after its handshake.
    pub async fn start_with_greeting(greeting: impl Into<String>) -> Self {
        Self::spawn(Some(greeting.into())).await
    }

    async fn spawn(greeting: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|e| panic!("mock server bind failed: {e}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|e| panic!("mock server addr failed: {e}"));

        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let current: CommandSlot = Arc::new(StdMutex::new(None));
        let accepted = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicUsize::new(0));
        let refuse = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            greeting,
            received_tx,
            current.clone(),
            accepted.clone(),
            live.clone(),
            refuse.clone(),
            cancel.clone(),
        ));

        Self {
            addr,
            received: Mutex::new(received_rx),
            current,
            accepted,
            live,
            refuse,
            cancel,
            accept_task: StdMutex::new(Some(accept_task)),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/v1/realtime", self.addr)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.url())
    }

    /// Completed WebSocket handshakes so far.
    pub fn connection_count(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Connections whose socket is still being served.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Close the next `n` TCP connections before the handshake.
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Push a text frame to the live client. Returns false when none is connected.
    pub fn send_to_client(&self, text: impl Into<String>) -> bool {
        self.command(Command::Send(text.into()))
    }

    pub fn send_json(&self, value: serde_json::Value) -> bool {
        self.send_to_client(value.to_string())
    }

    /// Drop the live connection without a close frame.
    pub fn drop_connection(&self) -> bool {
        self.command(Command::Drop)
    }

    /// Stop reading from the live connection without closing it.
    pub fn stall_connection(&self) -> bool {
        self.command(Command::Stall)
    }

    fn command(&self, command: Command) -> bool {
        let slot = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().is_some_and(|tx| tx.send(command).is_ok())
    }

    /// Next text frame sent by any client, if one arrives within `wait`.
    pub async fn next_message(&self, wait: Duration) -> Option<String> {
        let mut rx = self.received.lock().await;
        tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
    }

    /// Next client frame parsed as JSON; non-JSON frames are skipped.
    pub async fn next_json(&self, wait: Duration) -> Option<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            let text = self.next_message(left).await?;
            if let Ok(value) = serde_json::from_str(&text) {
                return Some(value);
            }
        }
    }

    /// Next client frame whose `type` is `event_type`, skipping others.
    pub async fn next_of_type(
        &self,
        event_type: &str,
        wait: Duration,
    ) -> Option<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            let value = self.next_json(left).await?;
            if value["type"] == event_type {
                return Some(value);
            }
        }
    }

    /// Every frame received so far, without waiting.
    pub async fn drain(&self) -> Vec<String> {
        let mut rx = self.received.lock().await;
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(text);
        }
        out
    }

    /// Stop listening and drop every live connection.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    greeting: Option<String>,
    received: mpsc::UnboundedSender<String>,
    current: CommandSlot,
    accepted: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    refuse: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(_) => continue,
            },
        };

        let refused = refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            drop(stream);
            continue;
        }

        tokio::spawn(serve_connection(
            stream,
            greeting.clone(),
            received.clone(),
            current.clone(),
            accepted.clone(),
            live.clone(),
            cancel.clone(),
        ));
    }
}

async fn serve_connection(
    stream: TcpStream,
    greeting: Option<String>,
    received: mpsc::UnboundedSender<String>,
    current: CommandSlot,
    accepted: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let _live = LiveGuard::new(live);

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    *current.lock().unwrap_or_else(PoisonError::into_inner) = Some(cmd_tx);
    accepted.fetch_add(1, Ordering::SeqCst);

    if let Some(greeting) = greeting {
        if ws.send(Message::Text(greeting.into())).await.is_err() {
            return;
        }
    }

    let mut stalled = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            command = cmd_rx.recv() => match command {
                Some(Command::Send(text)) => {
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Command::Stall) => stalled = true,
                Some(Command::Drop) | None => break,
            },
            msg = ws.next(), if !stalled => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = received.send(text.to_string());
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(live)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
