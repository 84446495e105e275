use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use tether_core::protocol::{Decision, Prompt, PromptKind};

/// Snapshot of a prompt awaiting an operator decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingPrompt {
    pub id: String,
    pub kind: PromptKind,
    pub prompt: Prompt,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// How a pending prompt left the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Decided(Decision),
    TimedOut,
    Cancelled,
}

impl Settlement {
    /// Decision handed back to the helper.
    pub fn decision(&self, kind: PromptKind) -> Decision {
        match self {
            Self::Decided(decision) => decision.clone(),
            Self::TimedOut | Self::Cancelled => kind.fail_closed_decision(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveOutcome {
    Resolved,
    /// Unknown id, or already decided, timed out, or cancelled.
    NotPending,
}

struct Entry {
    view: PendingPrompt,
    slot: oneshot::Sender<Settlement>,
}

/// Table of prompts awaiting a decision.
///
/// Every settlement path removes the entry under the table lock before
/// writing to the entry's one-shot slot, so exactly one of resolve, expire,
/// or cancel wins for any id.
#[derive(Clone, Default)]
pub struct PendingRequests {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a prompt and return its snapshot plus the receiving end of its slot.
    pub fn create(
        &self,
        prompt: Prompt,
        context: Option<String>,
        timeout: Duration,
    ) -> (PendingPrompt, oneshot::Receiver<Settlement>) {
        let created_at = Utc::now();
        // Deadlines beyond chrono's range saturate instead of overflowing.
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| created_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let view = PendingPrompt {
            id: Uuid::new_v4().to_string(),
            kind: prompt.kind(),
            prompt,
            context,
            created_at,
            deadline,
        };
        let (slot, rx) = oneshot::channel();
        self.lock().insert(
            view.id.clone(),
            Entry {
                view: view.clone(),
                slot,
            },
        );
        (view, rx)
    }

    pub fn resolve(&self, id: &str, decision: Decision) -> ResolveOutcome {
        if self.settle(id, Settlement::Decided(decision)) {
            ResolveOutcome::Resolved
        } else {
            ResolveOutcome::NotPending
        }
    }

    /// Settle `id` with the timeout default; false if something else won first.
    pub fn expire(&self, id: &str) -> bool {
        self.settle(id, Settlement::TimedOut)
    }

    /// Settle `id` because the helper went away; false if something else won first.
    pub fn cancel(&self, id: &str) -> bool {
        self.settle(id, Settlement::Cancelled)
    }

    pub fn get(&self, id: &str) -> Option<PendingPrompt> {
        self.lock().get(id).map(|entry| entry.view.clone())
    }

    /// Outstanding prompts, oldest first.
    pub fn list(&self) -> Vec<PendingPrompt> {
        let mut prompts: Vec<PendingPrompt> =
            self.lock().values().map(|entry| entry.view.clone()).collect();
        prompts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        prompts
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn settle(&self, id: &str, settlement: Settlement) -> bool {
        let entry = self.lock().remove(id);
        match entry {
            Some(entry) => {
                // The waiter may already be gone; the entry is settled either way.
                let _ = entry.slot.send(settlement);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tether_core::protocol::{HostKeyPrompt, Verdict};

    fn host_key() -> Prompt {
        Prompt::HostKeyTrust(HostKeyPrompt {
            host: "example.com".into(),
            fingerprint: "SHA256:abc".into(),
            key_type: None,
            prompt: None,
        })
    }

    #[tokio::test]
    async fn first_settlement_wins() {
        let pending = PendingRequests::new();
        let (view, rx) = pending.create(host_key(), None, Duration::from_secs(30));
        assert_eq!(pending.len(), 1);
        assert_eq!(view.kind, PromptKind::HostKeyTrust);
        assert!(view.deadline > view.created_at);

        assert_eq!(
            pending.resolve(&view.id, Decision::allow()),
            ResolveOutcome::Resolved
        );
        assert!(!pending.expire(&view.id));
        assert_eq!(
            pending.resolve(&view.id, Decision::deny()),
            ResolveOutcome::NotPending
        );
        assert!(pending.is_empty());
        assert_eq!(rx.await.unwrap(), Settlement::Decided(Decision::allow()));
    }

    #[tokio::test]
    async fn expiry_delivers_fail_closed_default() {
        let pending = PendingRequests::new();
        let (view, rx) = pending.create(host_key(), Some("/repo".into()), Duration::ZERO);
        assert!(pending.expire(&view.id));
        assert_eq!(
            pending.resolve(&view.id, Decision::allow()),
            ResolveOutcome::NotPending
        );
        let settlement = rx.await.unwrap();
        assert_eq!(settlement, Settlement::TimedOut);
        assert_eq!(settlement.decision(view.kind).decision, Verdict::Deny);
    }

    #[tokio::test]
    async fn huge_timeout_saturates_the_deadline() {
        let pending = PendingRequests::new();
        let (view, rx) = pending.create(
            host_key(),
            None,
            Duration::from_millis(100_000_000_000_000_000),
        );
        assert_eq!(view.deadline, DateTime::<Utc>::MAX_UTC);
        assert!(serde_json::to_string(&view).is_ok());

        let (max, _rx) = pending.create(host_key(), None, Duration::MAX);
        assert_eq!(max.deadline, DateTime::<Utc>::MAX_UTC);

        assert!(pending.expire(&view.id));
        assert_eq!(rx.await.unwrap(), Settlement::TimedOut);
    }

    #[test]
    fn entries_are_independent() {
        let pending = PendingRequests::new();
        let (first, _rx1) = pending.create(host_key(), None, Duration::from_secs(30));
        let (second, _rx2) = pending.create(host_key(), None, Duration::from_secs(30));
        assert_ne!(first.id, second.id);

        assert!(pending.cancel(&second.id));
        assert!(pending.get(&second.id).is_none());
        assert_eq!(pending.get(&first.id).unwrap(), first);
        assert_eq!(pending.list(), vec![first]);
        assert_eq!(
            pending.resolve("no-such-id", Decision::deny()),
            ResolveOutcome::NotPending
        );
    }
}
