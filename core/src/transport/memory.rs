//! In-memory transport engine
//!
//! Deterministic in-process engine used by tests and demos. A shared hub
//! holds the directed sessions of every endpoint pair; once both sides of a
//! pair have applied the other's description, the hub links them, mirrors
//! the offerer's channel labels to the answerer, and reports `Connected`.
//! `send` delivers straight into the paired session's event queue, which
//! preserves per-channel arrival order.

use super::{
    IceCandidate, IceServer, IceState, SdpKind, SessionDescription, SessionEvent, SessionState,
    TransportEngine, TransportError, TransportSession,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Shared pairing table for one simulated network.
pub struct MemoryHub {
    sessions: Mutex<HashMap<(String, String), Arc<MemorySession>>>,
    /// Remote candidates applied across the hub, in application order.
    candidate_log: Mutex<Vec<(String, String, String)>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            candidate_log: Mutex::new(Vec::new()),
        })
    }

    /// `(local, remote, candidate)` triples in the order they were applied.
    pub fn candidate_log(&self) -> Vec<(String, String, String)> {
        self.candidate_log.lock().clone()
    }

    fn session(&self, local: &str, remote: &str) -> Option<Arc<MemorySession>> {
        self.sessions
            .lock()
            .get(&(local.to_string(), remote.to_string()))
            .cloned()
    }

    /// Link the two directed sessions of a pair once both remote
    /// descriptions are in place. Idempotent under concurrent calls from
    /// either side: both inner locks are taken in canonical key order.
    fn try_pair(&self, a: &str, b: &str) {
        let (Some(s_ab), Some(s_ba)) = (self.session(a, b), self.session(b, a)) else {
            return;
        };
        let (first, second) = if a < b { (s_ab, s_ba) } else { (s_ba, s_ab) };

        let labels;
        {
            let mut fi = first.inner.lock();
            let mut si = second.inner.lock();
            if fi.paired || si.paired || fi.closed || si.closed {
                return;
            }
            if fi.remote_description.is_none() || si.remote_description.is_none() {
                return;
            }
            let first_is_offerer = matches!(
                fi.local_description.as_ref().map(|d| d.kind),
                Some(SdpKind::Offer)
            );
            labels = if first_is_offerer {
                fi.channels.clone()
            } else {
                si.channels.clone()
            };
            fi.paired = true;
            si.paired = true;
            fi.open_channels = labels.clone();
            si.open_channels = labels.clone();
        }

        for session in [&first, &second] {
            for label in &labels {
                session.emit(SessionEvent::ChannelOpen {
                    label: label.clone(),
                });
            }
            session.emit(SessionEvent::IceStateChanged(IceState::Connected));
            session.emit(SessionEvent::StateChanged(SessionState::Connected));
        }
    }
}

/// Transport engine backed by a [`MemoryHub`].
pub struct MemoryEngine {
    hub: Arc<MemoryHub>,
}

impl MemoryEngine {
    /// Engine with its own private hub.
    pub fn new() -> Self {
        Self {
            hub: MemoryHub::new(),
        }
    }

    /// Engine sharing `hub` with other endpoints of the simulated network.
    pub fn with_hub(hub: Arc<MemoryHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> Arc<MemoryHub> {
        Arc::clone(&self.hub)
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportEngine for MemoryEngine {
    async fn create_session(
        &self,
        local: &str,
        remote: &str,
        _ice_servers: &[IceServer],
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let key = (local.to_string(), remote.to_string());
        let mut sessions = self.hub.sessions.lock();
        if let Some(existing) = sessions.get(&key) {
            return Ok(Arc::clone(existing) as Arc<dyn TransportSession>);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(MemorySession {
            local: local.to_string(),
            remote: remote.to_string(),
            hub: Arc::downgrade(&self.hub),
            tx,
            rx: Mutex::new(Some(rx)),
            inner: Mutex::new(SessionInner::default()),
        });
        sessions.insert(key, Arc::clone(&session));
        Ok(session as Arc<dyn TransportSession>)
    }
}

#[derive(Default)]
struct SessionInner {
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    /// Labels opened locally before pairing.
    channels: Vec<String>,
    /// Labels usable after pairing (offerer's set, mirrored).
    open_channels: Vec<String>,
    paired: bool,
    closed: bool,
}

/// One directed session inside a [`MemoryHub`].
pub struct MemorySession {
    local: String,
    remote: String,
    hub: Weak<MemoryHub>,
    tx: mpsc::UnboundedSender<SessionEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    inner: Mutex<SessionInner>,
}

impl MemorySession {
    fn emit(&self, event: SessionEvent) {
        // Receiver may already be gone during teardown.
        let _ = self.tx.send(event);
    }

    fn paired_session(&self) -> Option<Arc<MemorySession>> {
        self.hub.upgrade()?.session(&self.remote, &self.local)
    }
}

#[async_trait]
impl TransportSession for MemorySession {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let description = SessionDescription::offer(format!("memory:{}->{}", self.local, self.remote));
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TransportError::SessionClosed);
            }
            inner.local_description = Some(description.clone());
        }
        self.emit(SessionEvent::StateChanged(SessionState::Connecting));
        self.emit(SessionEvent::LocalCandidate(IceCandidate::new(format!(
            "memory:candidate:{}",
            self.local
        ))));
        Ok(description)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let description =
            SessionDescription::answer(format!("memory:{}->{}", self.local, self.remote));
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TransportError::SessionClosed);
            }
            inner.local_description = Some(description.clone());
        }
        self.emit(SessionEvent::StateChanged(SessionState::Connecting));
        self.emit(SessionEvent::LocalCandidate(IceCandidate::new(format!(
            "memory:candidate:{}",
            self.local
        ))));
        Ok(description)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TransportError::SessionClosed);
            }
            inner.remote_description = Some(description);
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.try_pair(&self.local, &self.remote);
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if self.inner.lock().closed {
            return Err(TransportError::SessionClosed);
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.candidate_log.lock().push((
                self.local.clone(),
                self.remote.clone(),
                candidate.candidate.clone(),
            ));
        }
        Ok(())
    }

    async fn create_channel(&self, label: &str) -> Result<(), TransportError> {
        let mirror = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TransportError::SessionClosed);
            }
            if !inner.channels.iter().any(|l| l == label) {
                inner.channels.push(label.to_string());
            }
            if inner.paired && !inner.open_channels.iter().any(|l| l == label) {
                inner.open_channels.push(label.to_string());
                true
            } else {
                false
            }
        };
        if mirror {
            self.emit(SessionEvent::ChannelOpen {
                label: label.to_string(),
            });
            if let Some(pair) = self.paired_session() {
                let mut pair_inner = pair.inner.lock();
                if !pair_inner.open_channels.iter().any(|l| l == label) {
                    pair_inner.open_channels.push(label.to_string());
                }
                drop(pair_inner);
                pair.emit(SessionEvent::ChannelOpen {
                    label: label.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn send(&self, label: &str, data: Vec<u8>) -> Result<(), TransportError> {
        {
            let inner = self.inner.lock();
            if inner.closed {
                return Err(TransportError::SessionClosed);
            }
            if !inner.paired || !inner.open_channels.iter().any(|l| l == label) {
                return Err(TransportError::ChannelNotOpen(label.to_string()));
            }
        }
        let pair = self
            .paired_session()
            .ok_or_else(|| TransportError::SendFailed("paired session is gone".to_string()))?;
        pair.emit(SessionEvent::ChannelMessage {
            label: label.to_string(),
            data,
        });
        Ok(())
    }

    fn events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.rx.lock().take()
    }

    async fn close(&self) {
        let already_closed = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.closed, true)
        };
        if already_closed {
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.sessions
                .lock()
                .remove(&(self.local.clone(), self.remote.clone()));
        }
        if let Some(pair) = self.paired_session() {
            pair.emit(SessionEvent::StateChanged(SessionState::Disconnected));
        }
        self.emit(SessionEvent::StateChanged(SessionState::Closed));
    }
}

// ============================================================================
// TESTS
// ============================================================================
