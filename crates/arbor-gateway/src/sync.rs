//! Cross-session sync bus.
//!
//! In-process fan-out of conversation mutations to a user's other open
//! sessions. Each subscriber owns a bounded queue; a full queue drops the
//! event (clients reconcile by refetching on their next successful poll).

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use arbor_core::config::SYNC_QUEUE_CAPACITY;
use arbor_store::types::Conversation;

/// A conversation mutation broadcast to sibling sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    #[serde(rename = "conversationCreated", rename_all = "camelCase")]
    ConversationCreated {
        conversation_id: String,
        conversation: Conversation,
    },
    #[serde(rename = "conversationUpdated", rename_all = "camelCase")]
    ConversationUpdated {
        conversation_id: String,
        conversation: Conversation,
    },
    #[serde(rename = "conversationDeleted", rename_all = "camelCase")]
    ConversationDeleted { conversation_id: String },
}

/// Receiving half handed to a long-poll request.
pub struct Subscriber {
    pub rx: mpsc::Receiver<SyncEvent>,
    /// Fires when the slot is replaced by a reconnect or the bus shuts down.
    pub closed: CancellationToken,
}

struct Slot {
    tx: mpsc::Sender<SyncEvent>,
    closed: CancellationToken,
}

/// Per-user, per-session subscriber registry.
///
/// Subscribe/unsubscribe take the exclusive side of the lock, broadcasts the
/// shared side. Channel sends use `try_send`, so nothing blocks under the
/// lock.
#[derive(Default)]
pub struct SyncBus {
    inner: RwLock<HashMap<String, HashMap<String, Slot>>>,
}

impl SyncBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. An existing subscriber for the same
    /// (user, session) pair is closed first — reconnects after network
    /// blips replace their predecessor instead of leaking it.
    pub fn subscribe(&self, user: &str, session: &str) -> Subscriber {
        let (tx, rx) = mpsc::channel(SYNC_QUEUE_CAPACITY);
        let closed = CancellationToken::new();

        let mut inner = self.inner.write().unwrap();
        let sessions = inner.entry(user.to_string()).or_default();
        if let Some(prior) = sessions.insert(
            session.to_string(),
            Slot {
                tx,
                closed: closed.clone(),
            },
        ) {
            debug!(user, session, "replacing existing sync subscriber");
            prior.closed.cancel();
        }

        Subscriber { rx, closed }
    }

    /// Close and remove one session's subscriber. The user entry goes
    /// away with its last subscriber.
    pub fn unsubscribe(&self, user: &str, session: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(sessions) = inner.get_mut(user) {
            if let Some(slot) = sessions.remove(session) {
                slot.closed.cancel();
            }
            if sessions.is_empty() {
                inner.remove(user);
            }
        }
    }

    /// Deliver an event to every subscriber of `user` except the session
    /// that caused it. A full queue drops the event for that subscriber.
    pub fn broadcast(&self, user: &str, source_session: &str, event: SyncEvent) {
        let inner = self.inner.read().unwrap();
        let Some(sessions) = inner.get(user) else {
            return;
        };
        for (session, slot) in sessions {
            if session == source_session {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = slot.tx.try_send(event.clone()) {
                warn!(user, session, "sync queue full, dropping event");
            }
        }
    }

    /// Teardown: close every subscriber channel.
    pub fn shutdown(&self) {
        let mut inner = self.inner.write().unwrap();
        for (_, sessions) in inner.drain() {
            for (_, slot) in sessions {
                slot.closed.cancel();
            }
        }
    }
}

/// Unsubscribes when the owning request future completes or is dropped.
pub struct SubscriberGuard<'a> {
    pub bus: &'a SyncBus,
    pub user: String,
    pub session: String,
}

impl Drop for SubscriberGuard<'_> {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.user, &self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(id: &str) -> Conversation {
        Conversation {
            id: id.to_string(),
            user: "alice".to_string(),
            title: "t".to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn created(id: &str) -> SyncEvent {
        SyncEvent::ConversationCreated {
            conversation_id: id.to_string(),
            conversation: conv(id),
        }
    }

    #[tokio::test]
    async fn broadcast_skips_the_source_session() {
        let bus = SyncBus::new();
        let mut s1 = bus.subscribe("alice", "S1");
        let mut s2 = bus.subscribe("alice", "S2");

        bus.broadcast("alice", "S1", created("conv-1"));

        let ev = s2.rx.recv().await.unwrap();
        match ev {
            SyncEvent::ConversationCreated { conversation_id, .. } => {
                assert_eq!(conversation_id, "conv-1")
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(s1.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn other_users_never_see_the_event() {
        let bus = SyncBus::new();
        let mut bob = bus.subscribe("bob", "S1");
        bus.broadcast("alice", "", created("conv-1"));
        assert!(bob.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resubscribe_closes_the_predecessor() {
        let bus = SyncBus::new();
        let first = bus.subscribe("alice", "S1");
        assert!(!first.closed.is_cancelled());

        let mut second = bus.subscribe("alice", "S1");
        assert!(first.closed.is_cancelled());

        // Only the replacement receives events.
        bus.broadcast("alice", "other", created("conv-1"));
        assert!(second.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let bus = SyncBus::new();
        let mut sub = bus.subscribe("alice", "S1");

        for i in 0..SYNC_QUEUE_CAPACITY + 3 {
            bus.broadcast("alice", "other", created(&format!("conv-{i}")));
        }

        // The queue holds exactly its capacity; the rest were dropped and
        // the subscriber is still registered.
        let mut received = 0;
        while sub.rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SYNC_QUEUE_CAPACITY);

        bus.broadcast("alice", "other", created("late"));
        assert!(sub.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_prunes_empty_users() {
        let bus = SyncBus::new();
        let _sub = bus.subscribe("alice", "S1");
        bus.unsubscribe("alice", "S1");
        assert!(bus.inner.read().unwrap().get("alice").is_none());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(created("conv-1")).unwrap();
        assert_eq!(json["type"], "conversationCreated");
        assert_eq!(json["conversationId"], "conv-1");
        assert_eq!(json["conversation"]["id"], "conv-1");

        let json = serde_json::to_value(SyncEvent::ConversationDeleted {
            conversation_id: "conv-2".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "conversationDeleted");
        assert!(json.get("conversation").is_none());
    }
}
