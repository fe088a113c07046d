use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{Stream, StreamExt};
use parley_core::config::{AudioConfig, Config};
use parley_core::protocol::{ClientEvent, ResponseParams, SessionConfiguration};
use parley_core::types::{ConnectionState, ConversationItem, Endpoint, Modality};
use parley_transport::{Transport, TransportEvent};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::audio::AudioBuffer;
use crate::error::{Result, SessionError};
use crate::events::{SessionEvent, decode};

pub type SessionEventStream = Pin<Box<dyn Stream<Item = Result<SessionEvent>> + Send>>;

/// Protocol session over a [`Transport`]. Clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Transport,
    chunk_bytes: usize,
    /// Held across flush-and-send so appended audio leaves in order.
    audio: Mutex<AudioBuffer>,
    configuration: StdMutex<Option<SessionConfiguration>>,
    chunks_sent: AtomicU64,
}

impl Session {
    pub fn new(transport: Transport, audio: &AudioConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                chunk_bytes: audio.chunk_bytes.max(1),
                audio: Mutex::new(AudioBuffer::new(audio.max_buffer_bytes)),
                configuration: StdMutex::new(None),
                chunks_sent: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(Transport::new(config.transport.clone()), &config.audio)
    }

    pub async fn connect(&self, endpoint: Endpoint) -> Result<()> {
        self.inner.transport.connect(endpoint).await?;
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.inner.transport.disconnect().await;
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Last configuration accepted by `update_configuration`.
    pub fn configuration(&self) -> Option<SessionConfiguration> {
        self.inner
            .configuration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bytes currently held in the local audio buffer.
    pub async fn buffered_audio_len(&self) -> usize {
        self.inner.audio.lock().await.len()
    }

    async fn send(&self, event: &ClientEvent) -> Result<()> {
        let json = event.to_json()?;
        self.inner.transport.send(json).await?;
        trace!(event_type = event.event_type(), "Sent client event");
        Ok(())
    }

    /// Replace the session configuration with a full snapshot.
    pub async fn update_configuration(&self, configuration: SessionConfiguration) -> Result<()> {
        self.send(&ClientEvent::SessionUpdate {
            session: Box::new(configuration.clone()),
        })
        .await?;
        info!(
            tools = configuration.tools.len(),
            modalities = ?configuration.modalities,
            "Session configuration updated"
        );
        *self
            .inner
            .configuration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(configuration);
        Ok(())
    }

    /// Send audio now, or buffer it while disconnected.
    ///
    /// Residual buffered audio always goes out first. Never fails: audio that
    /// cannot be sent is kept in the bounded buffer.
    pub async fn append_audio(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut buffer = self.inner.audio.lock().await;

        if !self.is_connected() {
            let dropped = buffer.push(bytes);
            if dropped > 0 {
                debug!(dropped, buffered = buffer.len(), "Audio buffer full, dropped oldest bytes");
            }
            return;
        }

        let mut pending = buffer.take();
        pending.extend_from_slice(bytes);
        self.send_audio_locked(&mut buffer, &pending).await;
    }

    /// Send `pending` in chunk-sized appends; whatever is not sent goes back
    /// into the buffer. Returns false when something was re-buffered.
    async fn send_audio_locked(&self, buffer: &mut AudioBuffer, pending: &[u8]) -> bool {
        for (index, chunk) in pending.chunks(self.inner.chunk_bytes).enumerate() {
            let event = ClientEvent::InputAudioBufferAppend {
                audio: BASE64.encode(chunk),
            };
            if let Err(e) = self.send(&event).await {
                let offset = index * self.inner.chunk_bytes;
                buffer.push(&pending[offset..]);
                debug!(
                    error = %e,
                    rebuffered = pending.len() - offset,
                    "Audio send failed, buffering"
                );
                return false;
            }

            let sent = self.inner.chunks_sent.fetch_add(1, Ordering::Relaxed) + 1;
            if sent == 1 || sent % 50 == 0 {
                debug!(chunks = sent, bytes = chunk.len(), "Streaming audio");
            }
        }
        true
    }

    /// Send whatever is buffered, oldest first.
    async fn flush_buffered(&self) -> bool {
        let mut buffer = self.inner.audio.lock().await;
        if buffer.is_empty() {
            return true;
        }
        let pending = buffer.take();
        let bytes = pending.len();
        let flushed = self.send_audio_locked(&mut buffer, &pending).await;
        if flushed {
            info!(bytes, "Replayed buffered audio");
        }
        flushed
    }

    /// Commit the input audio buffer. Buffered audio is flushed first.
    /// A no-op while disconnected.
    pub async fn commit_audio(&self) -> Result<()> {
        if !self.is_connected() {
            debug!("Commit skipped while disconnected");
            return Ok(());
        }
        let mut buffer = self.inner.audio.lock().await;
        if !buffer.is_empty() {
            let pending = buffer.take();
            if !self.send_audio_locked(&mut buffer, &pending).await {
                return Err(SessionError::NotConnected);
            }
        }
        match self.send(&ClientEvent::InputAudioBufferCommit).await {
            Err(SessionError::NotConnected) => Ok(()),
            other => other,
        }
    }

    /// Empty the local buffer, and the server's when connected.
    pub async fn clear_audio_buffer(&self) -> Result<()> {
        let mut buffer = self.inner.audio.lock().await;
        buffer.clear();
        if !self.is_connected() {
            return Ok(());
        }
        match self.send(&ClientEvent::InputAudioBufferClear).await {
            Err(SessionError::NotConnected) => Ok(()),
            other => other,
        }
    }

    pub async fn create_response(&self, modalities: Option<Vec<Modality>>) -> Result<()> {
        let response = modalities.map(|modalities| ResponseParams {
            modalities: Some(modalities),
            instructions: None,
        });
        self.send(&ClientEvent::ResponseCreate { response }).await
    }

    pub async fn cancel_response(&self) -> Result<()> {
        self.send(&ClientEvent::ResponseCancel).await
    }

    pub async fn create_item(&self, item: ConversationItem) -> Result<()> {
        debug!(kind = item.kind(), id = ?item.id(), "Creating conversation item");
        self.send(&ClientEvent::ConversationItemCreate {
            previous_item_id: None,
            item,
        })
        .await
    }

    /// Truncate an assistant audio item at `audio_end_ms`.
    pub async fn truncate_conversation(&self, item_id: &str, audio_end_ms: u32) -> Result<()> {
        self.send(&ClientEvent::ConversationItemTruncate {
            item_id: item_id.to_string(),
            content_index: 0,
            audio_end_ms,
        })
        .await
    }

    pub async fn delete_item(&self, item_id: &str) -> Result<()> {
        self.send(&ClientEvent::ConversationItemDelete {
            item_id: item_id.to_string(),
        })
        .await
    }

    /// Typed server events for the current connection, in arrival order.
    ///
    /// After an automatic reconnect the last configuration is re-applied and
    /// buffered audio replayed before [`SessionEvent::Reconnected`] is yielded.
    /// A terminal transport error is yielded once, then the stream ends.
    pub fn events(&self) -> SessionEventStream {
        let frames = self.inner.transport.receive();
        let state = Some((frames, self.clone()));

        futures::stream::unfold(state, |state| async move {
            let (mut frames, session) = state?;
            loop {
                match frames.next().await {
                    None => return None,
                    Some(Err(e)) => {
                        warn!(error = %e, "Session event stream failed");
                        return Some((Err(SessionError::from(e)), None));
                    }
                    Some(Ok(TransportEvent::Frame(text))) => {
                        if let Some(event) = decode(&text) {
                            return Some((Ok(event), Some((frames, session))));
                        }
                    }
                    Some(Ok(TransportEvent::Binary(data))) => {
                        debug!(len = data.len(), "Ignoring binary frame");
                    }
                    Some(Ok(TransportEvent::Reconnected { attempts })) => {
                        session.resume_after_reconnect(attempts).await;
                        return Some((Ok(SessionEvent::Reconnected), Some((frames, session))));
                    }
                }
            }
        })
        .boxed()
    }

    async fn resume_after_reconnect(&self, attempts: u32) {
        info!(attempts, "Session resuming after reconnect");
        if let Some(configuration) = self.configuration() {
            if let Err(e) = self
                .send(&ClientEvent::SessionUpdate {
                    session: Box::new(configuration),
                })
                .await
            {
                warn!(error = %e, "Failed to re-apply session configuration");
            }
        }
        if !self.flush_buffered().await {
            warn!("Buffered audio could not be replayed yet");
        }
    }
}
