//! One physical WebSocket connection at a time, with heartbeat and reconnection.
//!
//! Each successful connect starts a new *generation*: a receive loop and a
//! heartbeat loop bound to that socket. A failure in either loop ends the
//! generation; the first failure wins and hands over to a single reconnect
//! task, which tears the old generation down fully before opening the next.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use parley_core::config::TransportConfig;
use parley_core::types::{ConnectionState, Endpoint};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::policy::ReconnectPolicy;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const CLOSE_GRACE: Duration = Duration::from_millis(500);
const MIN_HEARTBEAT_INTERVAL_MS: u64 = 10;

/// Something received on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame, passed through untouched.
    Frame(String),
    Binary(Vec<u8>),
    /// A new generation is live after automatic reconnection. Emitted before
    /// any frame of that generation.
    Reconnected { attempts: u32 },
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<TransportEvent>> + Send>>;

type EventSender = mpsc::Sender<Result<TransportEvent>>;

/// Handle to the transport. Clones share the same connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    /// Generation currently considered live; 0 when none.
    active_generation: AtomicU64,
    next_generation: AtomicU64,
    link: Mutex<Option<Link>>,
    /// Held for the whole of `connect()` so concurrent calls cannot both install a link.
    connecting: Mutex<()>,
    /// Parameters of the last successful connect, reused by reconnection.
    endpoint: StdMutex<Option<Endpoint>>,
    events: StdMutex<EventChannel>,
    lifetime: StdMutex<CancellationToken>,
    reconnect_task: StdMutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct EventChannel {
    tx: Option<EventSender>,
    rx: Option<mpsc::Receiver<Result<TransportEvent>>>,
}

/// A live generation.
struct Link {
    generation: u64,
    sink: Arc<Mutex<WsSink>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    async fn shutdown(self, send_close: bool) {
        self.cancel.cancel();
        if send_close {
            let sink = self.sink.clone();
            let _ = tokio::time::timeout(CLOSE_GRACE, async move {
                let mut sink = sink.lock().await;
                let _ = sink.close().await;
            })
            .await;
        }
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        debug!(generation = self.generation, "Connection generation stopped");
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Transport {
    pub fn new(mut config: TransportConfig) -> Self {
        if config.heartbeat_interval_ms < MIN_HEARTBEAT_INTERVAL_MS {
            warn!(
                requested_ms = config.heartbeat_interval_ms,
                "Heartbeat interval too small, using {MIN_HEARTBEAT_INTERVAL_MS}ms"
            );
            config.heartbeat_interval_ms = MIN_HEARTBEAT_INTERVAL_MS;
        }
        let policy = ReconnectPolicy::from(&config);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                policy,
                state,
                attempts: AtomicU32::new(0),
                active_generation: AtomicU64::new(0),
                next_generation: AtomicU64::new(1),
                link: Mutex::new(None),
                connecting: Mutex::new(()),
                endpoint: StdMutex::new(None),
                events: StdMutex::new(EventChannel::default()),
                lifetime: StdMutex::new(CancellationToken::new()),
                reconnect_task: StdMutex::new(None),
            }),
        }
    }

    /// Open a connection, replacing any existing one.
    ///
    /// Succeeds once the handshake completes and a ping is answered within the
    /// liveness timeout. A fresh frame sequence is created for every call.
    pub async fn connect(&self, endpoint: Endpoint) -> Result<()> {
        let _connecting = self.inner.connecting.lock().await;
        self.disconnect().await;

        let inner = &self.inner;
        let lifetime = CancellationToken::new();
        *lock(&inner.lifetime) = lifetime.clone();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        {
            let mut events = lock(&inner.events);
            events.tx = Some(tx.clone());
            events.rx = Some(rx);
        }

        inner.set_state(ConnectionState::Connecting);
        info!(url = %endpoint.url, "Connecting");

        let opened = open_socket(&endpoint, &inner.config).await;
        let (ws, early) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                warn!(url = %endpoint.url, error = %e, "Connect failed");
                lock(&inner.events).tx = None;
                inner.set_state(ConnectionState::Error);
                return Err(e);
            }
        };

        let mut slot = inner.link.lock().await;
        if lifetime.is_cancelled() {
            return Err(TransportError::Closed("disconnected during connect".into()));
        }
        let link = Inner::start_link(&self.inner, ws, early, tx, None, lifetime.child_token());
        inner.attempts.store(0, Ordering::SeqCst);
        inner.active_generation.store(link.generation, Ordering::SeqCst);
        *lock(&inner.endpoint) = Some(endpoint);
        info!(generation = link.generation, "Connected");
        let stale = slot.replace(link);
        drop(slot);
        inner.set_state(ConnectionState::Connected);

        if let Some(stale) = stale {
            warn!(generation = stale.generation, "Replacing a link left by another connect");
            stale.shutdown(true).await;
        }
        Ok(())
    }

    /// Send one text frame on the live connection.
    pub async fn send(&self, text: impl Into<String>) -> Result<()> {
        let (sink, generation) = {
            let slot = self.inner.link.lock().await;
            match slot.as_ref() {
                Some(link)
                    if self.inner.active_generation.load(Ordering::SeqCst) == link.generation =>
                {
                    (link.sink.clone(), link.generation)
                }
                _ => return Err(TransportError::NotConnected),
            }
        };

        let text: String = text.into();
        let sent = sink.lock().await.send(Message::Text(text.into())).await;
        if let Err(e) = sent {
            let reason = e.to_string();
            self.inner.on_failure(generation, &reason);
            return Err(TransportError::Send(reason));
        }
        Ok(())
    }

    /// The frame sequence of the current connection.
    ///
    /// Can be taken once per `connect()`; later calls yield an empty stream.
    /// The sequence completes on `disconnect()` and ends with
    /// [`TransportError::ReconnectExhausted`] when reconnection gives up.
    pub fn receive(&self) -> FrameStream {
        match lock(&self.inner.events).rx.take() {
            Some(rx) => ReceiverStream::new(rx).boxed(),
            None => futures::stream::empty().boxed(),
        }
    }

    /// Stop both loops, close the socket and complete the frame sequence.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        lock(&inner.lifetime).cancel();
        inner.active_generation.store(0, Ordering::SeqCst);

        let reconnect = lock(&inner.reconnect_task).take();
        if let Some(task) = reconnect {
            task.abort();
            let _ = task.await;
        }

        let link = inner.link.lock().await.take();
        let had_link = link.is_some();
        if let Some(link) = link {
            link.shutdown(true).await;
        }

        lock(&inner.events).tx = None;
        if had_link {
            info!("Disconnected");
        }
        inner.set_state(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Consecutive failed reconnect attempts; reset by a successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    /// Endpoint reused by automatic reconnection.
    pub fn last_endpoint(&self) -> Option<Endpoint> {
        lock(&self.inner.endpoint).clone()
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
    }

    /// Split the socket and spawn the receive and heartbeat loops.
    fn start_link(
        this: &Arc<Self>,
        ws: WsStream,
        early: Vec<String>,
        tx: EventSender,
        announce: Option<u32>,
        cancel: CancellationToken,
    ) -> Link {
        let generation = this.next_generation.fetch_add(1, Ordering::SeqCst);
        let (sink, source) = ws.split();
        let sink = Arc::new(Mutex::new(sink));
        let pong_pending = Arc::new(AtomicBool::new(false));

        let receive = tokio::spawn(receive_loop(
            Arc::downgrade(this),
            generation,
            source,
            early,
            announce,
            tx,
            cancel.clone(),
            pong_pending.clone(),
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::downgrade(this),
            generation,
            sink.clone(),
            this.config.heartbeat_interval(),
            cancel.clone(),
            pong_pending,
        ));

        Link {
            generation,
            sink,
            cancel,
            tasks: vec![receive, heartbeat],
        }
    }

    /// Route a loop failure into reconnection. Only the first failure of the
    /// live generation has any effect.
    fn on_failure(self: &Arc<Self>, generation: u64, reason: &str) {
        if self
            .active_generation
            .compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(generation, reason, "Ignoring failure of a stale generation");
            return;
        }

        warn!(generation, reason, "Connection lost");
        self.set_state(ConnectionState::Disconnected);

        let lifetime = lock(&self.lifetime).clone();
        if lifetime.is_cancelled() {
            return;
        }
        let Some(tx) = lock(&self.events).tx.clone() else {
            return;
        };
        let Some(endpoint) = lock(&self.endpoint).clone() else {
            return;
        };

        let task = tokio::spawn(reconnect_loop(self.clone(), endpoint, lifetime, tx));
        *lock(&self.reconnect_task) = Some(task);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.lifetime
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

fn build_request(
    endpoint: &Endpoint,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = endpoint
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

    for (name, value) in &endpoint.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::InvalidRequest(format!("header {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::InvalidRequest(format!("header {name:?}: {e}")))?;
        request.headers_mut().append(name, value);
    }
    Ok(request)
}

/// Handshake, then a ping that must be answered within the liveness timeout.
/// Text frames that arrive before the pong are returned so they are not lost.
async fn open_socket(
    endpoint: &Endpoint,
    config: &TransportConfig,
) -> Result<(WsStream, Vec<String>)> {
    let request = build_request(endpoint)?;

    let (mut ws, _response) =
        tokio::time::timeout(config.connect_timeout(), tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout("handshake"))?
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

    ws.send(Message::Ping(Default::default()))
        .await
        .map_err(|e| TransportError::Send(e.to_string()))?;

    let liveness = async {
        let mut early = Vec::new();
        while let Some(msg) = ws.next().await {
            match msg.map_err(|e| TransportError::Closed(e.to_string()))? {
                Message::Pong(_) => return Ok(early),
                Message::Text(text) => early.push(text.to_string()),
                Message::Close(frame) => {
                    return Err(TransportError::Closed(format!("{frame:?}")));
                }
                _ => {}
            }
        }
        Err(TransportError::Closed("stream ended before pong".into()))
    };
    let early = tokio::time::timeout(config.liveness_timeout(), liveness)
        .await
        .map_err(|_| TransportError::Timeout("liveness check"))??;

    Ok((ws, early))
}

#[allow(clippy::too_many_arguments)]
async fn receive_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut source: WsSource,
    early: Vec<String>,
    announce: Option<u32>,
    tx: EventSender,
    cancel: CancellationToken,
    pong_pending: Arc<AtomicBool>,
) {
    if let Some(attempts) = announce {
        if tx.send(Ok(TransportEvent::Reconnected { attempts })).await.is_err() {
            return;
        }
    }
    for text in early {
        if tx.send(Ok(TransportEvent::Frame(text))).await.is_err() {
            return;
        }
    }

    let mut frames: u64 = 0;
    let reason = loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            msg = source.next() => msg,
        };

        let event = match msg {
            Some(Ok(Message::Text(text))) => TransportEvent::Frame(text.to_string()),
            Some(Ok(Message::Binary(data))) => TransportEvent::Binary(data.to_vec()),
            Some(Ok(Message::Pong(_))) => {
                pong_pending.store(false, Ordering::SeqCst);
                continue;
            }
            Some(Ok(Message::Ping(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(frame))) => break format!("closed by server: {frame:?}"),
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        };

        frames += 1;
        if frames == 1 || frames % 50 == 0 {
            debug!(generation, frames, "Receiving frames");
        }
        if tx.send(Ok(event)).await.is_err() {
            debug!(generation, "Frame receiver dropped, closing receive loop");
            return;
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.on_failure(generation, &reason);
    }
}

async fn heartbeat_loop(
    inner: Weak<Inner>,
    generation: u64,
    sink: Arc<Mutex<WsSink>>,
    period: Duration,
    cancel: CancellationToken,
    pong_pending: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if pong_pending.swap(true, Ordering::SeqCst) {
            break "heartbeat ping was not answered".to_string();
        }
        let sent = sink.lock().await.send(Message::Ping(Default::default())).await;
        if let Err(e) = sent {
            break format!("heartbeat ping failed: {e}");
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.on_failure(generation, &reason);
    }
}

async fn reconnect_loop(
    inner: Arc<Inner>,
    endpoint: Endpoint,
    lifetime: CancellationToken,
    tx: EventSender,
) {
    let stale = inner.link.lock().await.take();
    if let Some(link) = stale {
        link.shutdown(false).await;
    }

    loop {
        let so_far = inner.attempts.load(Ordering::SeqCst);
        if !inner.policy.allows(so_far) {
            warn!(attempts = so_far, "Reconnection attempts exhausted");
            inner.set_state(ConnectionState::Error);
            let _ = tx
                .send(Err(TransportError::ReconnectExhausted { attempts: so_far }))
                .await;
            lock(&inner.events).tx = None;
            return;
        }

        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = inner.policy.backoff_for_attempt(attempt);
        inner.set_state(ConnectionState::Reconnecting);
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

        tokio::select! {
            _ = lifetime.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let opened = tokio::select! {
            _ = lifetime.cancelled() => return,
            opened = open_socket(&endpoint, &inner.config) => opened,
        };

        match opened {
            Ok((ws, early)) => {
                let mut slot = inner.link.lock().await;
                if lifetime.is_cancelled() {
                    return;
                }
                let link = Inner::start_link(
                    &inner,
                    ws,
                    early,
                    tx.clone(),
                    Some(attempt),
                    lifetime.child_token(),
                );
                inner.attempts.store(0, Ordering::SeqCst);
                inner.active_generation.store(link.generation, Ordering::SeqCst);
                info!(attempt, generation = link.generation, "Reconnected");
                *slot = Some(link);
                inner.set_state(ConnectionState::Connected);
                return;
            }
            Err(e) => {
                warn!(attempt, error = %e, "Reconnect attempt failed");
            }
        }
    }
}
