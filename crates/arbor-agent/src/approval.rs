//! Human-in-the-loop approval gate for tool calls.
//!
//! Tools flagged `require_approval` park here while the client decides.
//! Each pending entry owns a one-shot decision channel; an HTTP endpoint
//! posts `{id, approved}` into it. Waits are bounded at two minutes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use arbor_core::config::APPROVAL_TIMEOUT_SECS;

/// Tool output when the client answers `approved: false`.
pub const DENIED_OUTPUT: &str = "Tool call was not approved.";
/// Tool output when no decision arrives inside the window.
pub const TIMEOUT_OUTPUT: &str = "Tool call approval timed out.";

/// The payload shown to the approving client.
#[derive(Debug, Clone)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub args: String,
}

struct PendingEntry {
    user: String,
    call: PendingToolCall,
    tx: oneshot::Sender<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Denied,
    TimedOut,
}

/// Process-wide registry of tool calls awaiting a decision.
///
/// Entries are inserted and removed under the lock; channel sends and
/// receives happen outside it.
#[derive(Default)]
pub struct ApprovalGate {
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a tool call and hand back the decision receiver.
    pub fn register(&self, user: &str, call: PendingToolCall) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap();
        pending.insert(
            call.id.clone(),
            PendingEntry {
                user: user.to_string(),
                call,
                tx,
            },
        );
        rx
    }

    /// Deliver a decision. Returns false when the id is unknown, already
    /// resolved, or owned by a different user.
    pub fn resolve(&self, user: &str, id: &str, approved: bool) -> bool {
        let entry = {
            let mut pending = self.pending.lock().unwrap();
            match pending.get(id) {
                Some(e) if e.user == user => pending.remove(id),
                _ => None,
            }
        };
        match entry {
            Some(e) => {
                debug!(id, tool = %e.call.name, approved, "tool call resolved");
                e.tx.send(approved).is_ok()
            }
            None => false,
        }
    }

    /// Drop a pending entry without answering (turn cancelled).
    pub fn cancel(&self, id: &str) {
        self.pending.lock().unwrap().remove(id);
    }

    /// Wait for the decision, bounded at the approval window.
    /// The entry is removed on timeout so a late POST cannot resolve it.
    pub async fn wait(&self, id: &str, rx: oneshot::Receiver<bool>) -> ApprovalOutcome {
        match tokio::time::timeout(Duration::from_secs(APPROVAL_TIMEOUT_SECS), rx).await {
            Ok(Ok(true)) => ApprovalOutcome::Approved,
            Ok(Ok(false)) => ApprovalOutcome::Denied,
            // Sender dropped without a decision — treated as a denial.
            Ok(Err(_)) => {
                debug!(id, "approval channel closed without decision");
                ApprovalOutcome::Denied
            }
            Err(_) => {
                self.cancel(id);
                ApprovalOutcome::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: &str) -> PendingToolCall {
        PendingToolCall {
            id: id.to_string(),
            name: "get_weather".to_string(),
            args: "{\"location\":\"Paris\"}".to_string(),
        }
    }

    #[tokio::test]
    async fn approve_resolves_the_wait() {
        let gate = ApprovalGate::new();
        let rx = gate.register("alice", pending("tc-1"));
        assert!(gate.resolve("alice", "tc-1", true));
        assert_eq!(gate.wait("tc-1", rx).await, ApprovalOutcome::Approved);
        // Already resolved — a second POST finds nothing.
        assert!(!gate.resolve("alice", "tc-1", true));
    }

    #[tokio::test]
    async fn deny_resolves_the_wait() {
        let gate = ApprovalGate::new();
        let rx = gate.register("alice", pending("tc-2"));
        assert!(gate.resolve("alice", "tc-2", false));
        assert_eq!(gate.wait("tc-2", rx).await, ApprovalOutcome::Denied);
    }

    #[tokio::test]
    async fn foreign_user_cannot_resolve() {
        let gate = ApprovalGate::new();
        let _rx = gate.register("alice", pending("tc-3"));
        assert!(!gate.resolve("mallory", "tc-3", true));
        // Entry still pending for the owner.
        assert!(gate.resolve("alice", "tc-3", true));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_after_the_window() {
        let gate = ApprovalGate::new();
        let rx = gate.register("alice", pending("tc-4"));
        // Paused clock: the two-minute window elapses instantly.
        assert_eq!(gate.wait("tc-4", rx).await, ApprovalOutcome::TimedOut);
        // Late decision finds no entry.
        assert!(!gate.resolve("alice", "tc-4", true));
    }
}
