//! Client side of the relay connection
//!
//! A `SignalingLink` maintains one websocket to a relay endpoint out of a
//! configured list. When the connection drops, reconnects back off
//! exponentially; once the per-endpoint retry budget is spent the cursor
//! rotates to the next endpoint, and after a full pass over the list the
//! link switches to a slower backoff schedule. Sends issued while the link
//! is down wait for the connection to come back, up to a timeout.

use super::protocol::SignalMessage;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Relay connection settings.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Relay endpoint URLs, tried in order.
    pub endpoints: Vec<String>,
    /// Extra reconnect attempts against one endpoint before rotating to the
    /// next. Zero means rotate after every failure.
    pub retry_budget: u32,
    /// How long a send will wait for the link to come up.
    pub send_timeout: Duration,
    /// Poll interval while a send waits for the link.
    pub send_poll_interval: Duration,
    /// First reconnect delay in milliseconds.
    pub base_delay_ms: u64,
    /// Reconnect delay ceiling in milliseconds.
    pub max_delay_ms: u64,
    /// First reconnect delay once every endpoint has been tried.
    pub exhausted_base_delay_ms: u64,
    /// Delay ceiling once every endpoint has been tried.
    pub exhausted_max_delay_ms: u64,
    /// Multiplier applied per consecutive failure.
    pub backoff_growth: f64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            retry_budget: 0,
            send_timeout: Duration::from_secs(5),
            send_poll_interval: Duration::from_millis(100),
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            exhausted_base_delay_ms: 10_000,
            exhausted_max_delay_ms: 60_000,
            backoff_growth: 1.5,
        }
    }
}

/// Signaling error types
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("No relay endpoints configured")]
    NoEndpoints,
    #[error("Connection to {0} failed: {1}")]
    ConnectionFailed(String, String),
    #[error("Not connected to a relay")]
    NotConnected,
    #[error("Timed out waiting for the relay connection")]
    SendTimeout,
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Link is closed")]
    Closed,
}

/// Relay connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Disconnected,
    Connecting,
    Connected,
}

/// One websocket to the relay, with reconnect and endpoint rotation.
pub struct SignalingLink {
    config: SignalingConfig,
    state: RwLock<SignalingState>,
    cursor: AtomicUsize,
    attempts: AtomicU32,
    exhausted: AtomicBool,
    closed: AtomicBool,
    sink: AsyncMutex<Option<WsSink>>,
    inbound: mpsc::UnboundedSender<SignalMessage>,
    reconnect_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SignalingLink {
    /// Create a link and the stream of frames it will receive from the relay.
    pub fn new(
        config: SignalingConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SignalMessage>), SignalingError> {
        if config.endpoints.is_empty() {
            return Err(SignalingError::NoEndpoints);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            config,
            state: RwLock::new(SignalingState::Disconnected),
            cursor: AtomicUsize::new(0),
            attempts: AtomicU32::new(0),
            exhausted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sink: AsyncMutex::new(None),
            inbound: tx,
            reconnect_task: parking_lot::Mutex::new(None),
        });
        Ok((link, rx))
    }

    pub fn state(&self) -> SignalingState {
        *self.state.read()
    }

    /// Endpoint the next connect will target.
    pub fn current_endpoint(&self) -> &str {
        let idx = self.cursor.load(Ordering::SeqCst) % self.config.endpoints.len();
        &self.config.endpoints[idx]
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// Connect to the current endpoint. On failure the next attempt is
    /// scheduled automatically.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }

        let endpoint = self.current_endpoint().to_string();
        *self.state.write() = SignalingState::Connecting;
        debug!(endpoint = %endpoint, "Connecting to relay");

        let stream = match connect_async(endpoint.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Relay connection failed");
                *self.state.write() = SignalingState::Disconnected;
                self.schedule_reconnect();
                return Err(SignalingError::ConnectionFailed(endpoint, e.to_string()));
            }
        };

        let (sink, mut source) = stream.split();
        *self.sink.lock().await = Some(sink);
        *self.state.write() = SignalingState::Connected;
        self.attempts.store(0, Ordering::SeqCst);
        self.exhausted.store(false, Ordering::SeqCst);
        info!(endpoint = %endpoint, "Connected to relay");

        let link = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(&text) {
                        Ok(msg) => {
                            if link.inbound.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Dropping malformed relay frame");
                        }
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            *link.state.write() = SignalingState::Disconnected;
            link.sink.lock().await.take();
            if !link.closed.load(Ordering::SeqCst) {
                info!("Relay connection lost");
                link.schedule_reconnect();
            }
        });
        Ok(())
    }

    /// Send a frame to the relay. If the link is down, waits for it to come
    /// back up, polling until the send timeout elapses.
    pub async fn send(&self, msg: SignalMessage) -> Result<(), SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        let deadline = tokio::time::Instant::now() + self.config.send_timeout;
        while self.state() != SignalingState::Connected {
            if tokio::time::Instant::now() >= deadline {
                return Err(SignalingError::SendTimeout);
            }
            tokio::time::sleep(self.config.send_poll_interval).await;
        }
        self.transmit(&msg).await
    }

    async fn transmit(&self, msg: &SignalMessage) -> Result<(), SignalingError> {
        let text = serde_json::to_string(msg)?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(SignalingError::NotConnected)?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Record a failure, rotate the endpoint cursor when the budget is spent,
    /// and return the delay before the next attempt.
    fn next_reconnect_delay(&self) -> Duration {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.config.retry_budget {
            self.attempts.store(0, Ordering::SeqCst);
            let len = self.config.endpoints.len();
            let next = (self.cursor.load(Ordering::SeqCst) + 1) % len;
            self.cursor.store(next, Ordering::SeqCst);
            if next == 0 {
                self.exhausted.store(true, Ordering::SeqCst);
            }
        }
        self.backoff_delay(attempt)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let (base, cap) = if self.exhausted.load(Ordering::SeqCst) {
            (
                self.config.exhausted_base_delay_ms,
                self.config.exhausted_max_delay_ms,
            )
        } else {
            (self.config.base_delay_ms, self.config.max_delay_ms)
        };
        let grown = base as f64 * self.config.backoff_growth.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((grown as u64).min(cap))
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let delay = self.next_reconnect_delay();
        debug!(
            delay_ms = delay.as_millis() as u64,
            endpoint = %self.current_endpoint(),
            "Scheduling relay reconnect"
        );
        let link = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // connect() aborts whatever timer handle is stored; this task's
            // own handle must be gone by then.
            link.reconnect_task.lock().take();
            if let Err(e) = link.connect().await {
                debug!(error = %e, "Reconnect attempt failed");
            }
        });
        if let Some(previous) = self.reconnect_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Tear the link down for good. No reconnect will follow.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        *self.state.write() = SignalingState::Disconnected;
    }
}

// ============================================================================
// TESTS
// ============================================================================
