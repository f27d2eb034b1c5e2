//! Per-room fan-out of encoded server messages.
//!
//! Every session owns a bounded mpsc queue drained by its connection task.
//! Relays are best-effort and dropped for a session whose queue is full.
//! Acknowledgements must never be skipped, so a session too slow to take one
//! is evicted instead: its queue closes, its connection ends, and the client
//! catches up with a pull after reconnecting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

/// Identifier of one connected session.
pub type SessionId = Uuid;

/// One encoded outbound text frame, shared by every receiver.
pub type Frame = Arc<str>;

/// How a broadcast treats a session whose queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Wait for queue space. Used for replies to the requesting session.
    Reliable,
    /// Drop the frame for that session. Used for relays.
    BestEffort,
    /// Never wait: a session whose queue is full is removed from the set.
    /// Used for acknowledgements fanned out under the push lock.
    EvictLagging,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub sessions_evicted: u64,
    pub active_sessions: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    sessions_evicted: AtomicU64,
}

/// The live sessions of one room.
pub struct SessionSet {
    sessions: RwLock<HashMap<SessionId, mpsc::Sender<Frame>>>,
    /// Frames buffered per session
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl SessionSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a session and return the receiver its connection drains.
    pub async fn add_session(&self, id: SessionId) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.sessions.write().await.insert(id, tx);
        rx
    }

    /// Register a session unless `limit` sessions are already present.
    pub async fn try_add_session(&self, id: SessionId, limit: usize) -> Option<mpsc::Receiver<Frame>> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= limit {
            return None;
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        sessions.insert(id, tx);
        Some(rx)
    }

    /// Returns `true` if the session was registered.
    pub async fn remove_session(&self, id: &SessionId) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    /// Encode once and deliver to every session except `except`.
    ///
    /// Returns the number of sessions the frame was queued for.
    pub async fn broadcast(
        &self,
        message: &ServerMessage,
        except: Option<SessionId>,
        delivery: Delivery,
    ) -> Result<usize, ProtocolError> {
        let frame: Frame = message.encode()?.into();

        // Clone the senders so a slow session never holds the read lock
        let targets: Vec<(SessionId, mpsc::Sender<Frame>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(id, _)| Some(**id) != except)
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (id, tx) in targets {
            if self.deliver(&id, &tx, frame.clone(), delivery).await {
                delivered += 1;
            }
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        Ok(delivered)
    }

    /// Deliver to one session. Returns `false` if it is gone or the frame was dropped.
    pub async fn send_to(
        &self,
        id: &SessionId,
        message: &ServerMessage,
        delivery: Delivery,
    ) -> Result<bool, ProtocolError> {
        let frame: Frame = message.encode()?.into();
        let Some(tx) = self.sessions.read().await.get(id).cloned() else {
            return Ok(false);
        };
        let sent = self.deliver(id, &tx, frame, delivery).await;
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(sent)
    }

    async fn deliver(
        &self,
        id: &SessionId,
        tx: &mpsc::Sender<Frame>,
        frame: Frame,
        delivery: Delivery,
    ) -> bool {
        let result = match delivery {
            Delivery::Reliable => tx.send(frame).await.map_err(|_| "closed"),
            Delivery::BestEffort | Delivery::EvictLagging => tx.try_send(frame).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => "full",
                mpsc::error::TrySendError::Closed(_) => "closed",
            }),
        };
        match result {
            Ok(()) => true,
            Err(reason) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropped frame for session {id}: queue {reason}");
                if delivery == Delivery::EvictLagging && reason == "full" {
                    self.evict(id).await;
                }
                false
            }
        }
    }

    /// Remove a session that cannot keep up. Once every clone of its sender
    /// is gone the receiver yields `None`, which ends its connection.
    async fn evict(&self, id: &SessionId) {
        if self.sessions.write().await.remove(id).is_some() {
            self.stats.sessions_evicted.fetch_add(1, Ordering::Relaxed);
            log::warn!("Evicted session {id}: outbound queue full");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn has_session(&self, id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            sessions_evicted: self.stats.sessions_evicted.load(Ordering::Relaxed),
            active_sessions: self.session_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RelayPayload, ServerIncrement};

    fn relayed(json: &str) -> ServerMessage {
        ServerMessage::Relayed(RelayPayload::from_json(json).unwrap())
    }

    #[tokio::test]
    async fn test_add_remove_session() {
        let set = SessionSet::new(4);
        let id = Uuid::new_v4();

        let _rx = set.add_session(id).await;
        assert_eq!(set.session_count().await, 1);
        assert!(set.has_session(&id).await);

        assert!(set.remove_session(&id).await);
        assert!(!set.remove_session(&id).await);
        assert_eq!(set.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_try_add_session_limit() {
        let set = SessionSet::new(4);
        let _a = set.try_add_session(Uuid::new_v4(), 2).await.unwrap();
        let _b = set.try_add_session(Uuid::new_v4(), 2).await.unwrap();
        assert!(set.try_add_session(Uuid::new_v4(), 2).await.is_none());
        assert_eq!(set.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let set = SessionSet::new(4);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut rx_a = set.add_session(a).await;
        let mut rx_b = set.add_session(b).await;
        let mut rx_c = set.add_session(c).await;

        let msg = relayed(r#"{"cursor":[1,2]}"#);
        let delivered = set.broadcast(&msg, Some(a), Delivery::BestEffort).await.unwrap();
        assert_eq!(delivered, 2);

        let expected = msg.encode().unwrap();
        assert_eq!(&*rx_b.recv().await.unwrap(), expected.as_str());
        assert_eq!(&*rx_c.recv().await.unwrap(), expected.as_str());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_to_all() {
        let set = SessionSet::new(4);
        let mut receivers = Vec::new();
        for _ in 0..3 {
            receivers.push(set.add_session(Uuid::new_v4()).await);
        }

        let msg = ServerMessage::acknowledged(vec![ServerIncrement::new("x", 1, "p")]);
        assert_eq!(set.broadcast(&msg, None, Delivery::Reliable).await.unwrap(), 3);
        for rx in &mut receivers {
            assert!(rx.recv().await.is_some());
        }
    }

    #[tokio::test]
    async fn test_best_effort_drops_when_full() {
        let set = SessionSet::new(1);
        let id = Uuid::new_v4();
        let mut rx = set.add_session(id).await;

        let msg = relayed(r#""tick""#);
        assert_eq!(set.broadcast(&msg, None, Delivery::BestEffort).await.unwrap(), 1);
        assert_eq!(set.broadcast(&msg, None, Delivery::BestEffort).await.unwrap(), 0);

        let stats = set.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.active_sessions, 1);

        // Draining frees the slot again
        rx.recv().await.unwrap();
        assert_eq!(set.broadcast(&msg, None, Delivery::BestEffort).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reliable_waits_for_space() {
        let set = Arc::new(SessionSet::new(1));
        let id = Uuid::new_v4();
        let mut rx = set.add_session(id).await;

        let msg = ServerMessage::acknowledged(Vec::new());
        set.broadcast(&msg, None, Delivery::Reliable).await.unwrap();

        let sender = {
            let set = set.clone();
            let msg = msg.clone();
            tokio::spawn(async move { set.broadcast(&msg, None, Delivery::Reliable).await })
        };

        rx.recv().await.unwrap();
        assert_eq!(sender.await.unwrap().unwrap(), 1);
        assert!(rx.recv().await.is_some());
        assert_eq!(set.stats().await.messages_dropped, 0);
    }

    #[tokio::test]
    async fn test_evict_lagging_never_waits() {
        let set = SessionSet::new(1);
        let (fast, slow) = (Uuid::new_v4(), Uuid::new_v4());
        let mut fast_rx = set.add_session(fast).await;
        let mut slow_rx = set.add_session(slow).await;

        let msg = ServerMessage::acknowledged(vec![ServerIncrement::new("x", 1, "p")]);
        assert_eq!(set.broadcast(&msg, None, Delivery::EvictLagging).await.unwrap(), 2);
        fast_rx.recv().await.unwrap();

        // `slow` never drained its single slot
        assert_eq!(set.broadcast(&msg, None, Delivery::EvictLagging).await.unwrap(), 1);
        assert!(set.has_session(&fast).await);
        assert!(!set.has_session(&slow).await);
        assert_eq!(set.stats().await.sessions_evicted, 1);

        // The evicted receiver keeps its backlog, then sees the queue close
        assert!(slow_rx.recv().await.is_some());
        assert!(slow_rx.recv().await.is_none());
        assert!(fast_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_send_to_single_session() {
        let set = SessionSet::new(4);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut rx_a = set.add_session(a).await;
        let mut rx_b = set.add_session(b).await;

        let msg = ServerMessage::acknowledged(Vec::new());
        assert!(set.send_to(&a, &msg, Delivery::Reliable).await.unwrap());
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());

        assert!(!set.send_to(&Uuid::new_v4(), &msg, Delivery::Reliable).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_receiver_counts_as_dropped() {
        let set = SessionSet::new(4);
        let id = Uuid::new_v4();
        drop(set.add_session(id).await);

        let msg = relayed("null");
        assert_eq!(set.broadcast(&msg, None, Delivery::Reliable).await.unwrap(), 0);
        assert_eq!(set.stats().await.messages_dropped, 1);
    }
}
