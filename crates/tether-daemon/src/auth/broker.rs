use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use tether_core::event::{kinds, StreamEvent};
use tether_core::protocol::{CredentialField, Decision, Prompt, Verdict};

use super::bridge::AuthObserver;
use super::pending::{PendingPrompt, PendingRequests, ResolveOutcome, Settlement};
use crate::events::PublishSink;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("invalid decision: {0}")]
    InvalidDecision(String),
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Write path for operator decisions and the source of `auth.*` events.
///
/// Events go to the global context and, when the prompt names one, to the
/// prompt's own context as well.
#[derive(Clone)]
pub struct AuthBroker {
    pending: PendingRequests,
    sink: Arc<dyn PublishSink>,
    global_context: String,
}

impl AuthBroker {
    pub fn new(
        pending: PendingRequests,
        sink: Arc<dyn PublishSink>,
        global_context: impl Into<String>,
    ) -> Self {
        Self {
            pending,
            sink,
            global_context: global_context.into(),
        }
    }

    /// Deliver an operator decision. The first decision for an id wins;
    /// later ones, and decisions for timed-out prompts, are no-ops.
    pub fn resolve(&self, id: &str, decision: Decision) -> Result<ResolveOutcome, BrokerError> {
        let Some(view) = self.pending.get(id) else {
            info!(correlation_id = %id, "ignoring decision for prompt that is no longer pending");
            return Ok(ResolveOutcome::NotPending);
        };
        let decision = normalize(&view.prompt, decision)?;
        let outcome = self.pending.resolve(id, decision);
        if outcome == ResolveOutcome::NotPending {
            info!(correlation_id = %id, "decision lost the race with another settlement");
        }
        Ok(outcome)
    }

    pub fn pending(&self) -> Vec<PendingPrompt> {
        self.pending.list()
    }

    fn publish(&self, prompt: &PendingPrompt, event: StreamEvent) {
        let mut delivered = 0;
        if let Some(context) = prompt
            .context
            .as_deref()
            .filter(|c| *c != self.global_context)
        {
            delivered += self.sink.publish(context, event.clone());
        }
        delivered += self.sink.publish(&self.global_context, event);
        debug!(correlation_id = %prompt.id, delivered, "published auth event");
    }
}

/// Check an allow against what the prompt asked for and drop secrets the
/// prompt kind cannot use.
fn normalize(prompt: &Prompt, decision: Decision) -> Result<Decision, BrokerError> {
    if decision.decision == Verdict::Deny {
        return Ok(Decision::deny());
    }
    match prompt {
        Prompt::HostKeyTrust(_) => Ok(Decision::allow()),
        Prompt::Credential(p) => {
            let missing = |value: &Option<String>| value.as_deref().map_or(true, str::is_empty);
            let wants_username = matches!(p.field, CredentialField::Username | CredentialField::Both);
            let wants_password = matches!(p.field, CredentialField::Password | CredentialField::Both);
            if wants_username && missing(&decision.username) {
                return Err(BrokerError::InvalidDecision(
                    "credential allow requires a username".into(),
                ));
            }
            if wants_password && missing(&decision.password) {
                return Err(BrokerError::InvalidDecision(
                    "credential allow requires a password".into(),
                ));
            }
            Ok(decision)
        }
    }
}

impl AuthObserver for AuthBroker {
    fn prompt_created(&self, prompt: &PendingPrompt) {
        let event = StreamEvent::synthetic(
            kinds::AUTH_PROMPT,
            json!({
                "id": prompt.id,
                "kind": prompt.kind,
                "prompt": prompt.prompt,
                "context": prompt.context,
                "deadline": prompt.deadline,
            }),
        );
        self.publish(prompt, event);
    }

    fn prompt_settled(&self, prompt: &PendingPrompt, settlement: &Settlement) {
        let event = match settlement {
            Settlement::Decided(decision) => StreamEvent::synthetic(
                kinds::AUTH_RESOLVED,
                json!({ "id": prompt.id, "decision": decision.decision }),
            ),
            Settlement::TimedOut => {
                StreamEvent::synthetic(kinds::AUTH_TIMEOUT, json!({ "id": prompt.id }))
            }
            Settlement::Cancelled => {
                StreamEvent::synthetic(kinds::AUTH_CANCELLED, json!({ "id": prompt.id }))
            }
        };
        self.publish(prompt, event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tether_core::protocol::{CredentialPrompt, HostKeyPrompt};

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(String, StreamEvent)>>,
    }

    impl PublishSink for RecordingSink {
        fn publish(&self, context: &str, event: StreamEvent) -> usize {
            self.events.lock().unwrap().push((context.to_string(), event));
            1
        }
    }

    fn broker() -> (AuthBroker, PendingRequests, Arc<RecordingSink>) {
        let pending = PendingRequests::new();
        let sink = Arc::new(RecordingSink::default());
        let broker = AuthBroker::new(pending.clone(), sink.clone(), "global");
        (broker, pending, sink)
    }

    fn credential(field: CredentialField) -> Prompt {
        Prompt::Credential(CredentialPrompt {
            url: "https://git.example.com/repo.git".into(),
            username: None,
            field,
            prompt: None,
        })
    }

    #[tokio::test]
    async fn host_key_allow_drops_stray_secrets() {
        let (broker, pending, _) = broker();
        let prompt = Prompt::HostKeyTrust(HostKeyPrompt {
            host: "example.com".into(),
            fingerprint: "SHA256:abc".into(),
            key_type: None,
            prompt: None,
        });
        let (view, rx) = pending.create(prompt, None, Duration::from_secs(30));
        let outcome = broker
            .resolve(&view.id, Decision::credentials(Some("u".into()), "p"))
            .unwrap();
        assert_eq!(outcome, ResolveOutcome::Resolved);
        assert_eq!(rx.await.unwrap(), Settlement::Decided(Decision::allow()));
    }

    #[test]
    fn credential_allow_without_secret_is_rejected_and_stays_pending() {
        let (broker, pending, _) = broker();
        let (view, _rx) = pending.create(credential(CredentialField::Both), None, Duration::from_secs(30));
        assert!(matches!(
            broker.resolve(&view.id, Decision::allow()),
            Err(BrokerError::InvalidDecision(_))
        ));
        assert_eq!(broker.pending().len(), 1);

        let (user_view, _rx) =
            pending.create(credential(CredentialField::Username), None, Duration::from_secs(30));
        assert!(broker
            .resolve(&user_view.id, Decision::credentials(None, "secret"))
            .is_err());
        assert_eq!(
            broker
                .resolve(&user_view.id, Decision::deny())
                .unwrap(),
            ResolveOutcome::Resolved
        );
    }

    #[tokio::test]
    async fn both_fields_need_username_and_password() {
        let (broker, pending, _) = broker();
        let (view, rx) = pending.create(credential(CredentialField::Both), None, Duration::from_secs(30));
        assert!(matches!(
            broker.resolve(&view.id, Decision::credentials(None, "secret")),
            Err(BrokerError::InvalidDecision(msg)) if msg.contains("username")
        ));
        assert_eq!(broker.pending().len(), 1);

        let full = Decision::credentials(Some("alice".into()), "secret");
        assert_eq!(
            broker.resolve(&view.id, full.clone()).unwrap(),
            ResolveOutcome::Resolved
        );
        assert_eq!(rx.await.unwrap(), Settlement::Decided(full));
    }

    #[test]
    fn late_decision_is_a_no_op() {
        let (broker, pending, _) = broker();
        let (view, _rx) = pending.create(credential(CredentialField::Password), None, Duration::ZERO);
        assert!(pending.expire(&view.id));
        assert_eq!(
            broker
                .resolve(&view.id, Decision::credentials(None, "secret"))
                .unwrap(),
            ResolveOutcome::NotPending
        );
    }

    #[test]
    fn events_reach_global_and_prompt_context_without_secrets() {
        let (broker, pending, sink) = broker();
        let (view, _rx) = pending.create(
            credential(CredentialField::Password),
            Some("/repo".into()),
            Duration::from_secs(30),
        );
        broker.prompt_created(&view);
        broker.prompt_settled(
            &view,
            &Settlement::Decided(Decision::credentials(None, "hunter2")),
        );

        let events = sink.events.lock().unwrap();
        let contexts: Vec<&str> = events.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(contexts, vec!["/repo", "global", "/repo", "global"]);
        assert_eq!(events[0].1.kind, kinds::AUTH_PROMPT);
        assert_eq!(events[0].1.payload["id"], view.id.as_str());
        assert_eq!(events[2].1.kind, kinds::AUTH_RESOLVED);
        assert_eq!(events[2].1.payload["decision"], "allow");
        assert!(!events[2].1.payload.to_string().contains("hunter2"));
    }

    #[test]
    fn global_prompts_publish_once() {
        let (broker, pending, sink) = broker();
        let (view, _rx) = pending.create(
            credential(CredentialField::Password),
            Some("global".into()),
            Duration::from_secs(30),
        );
        broker.prompt_settled(&view, &Settlement::TimedOut);
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "global");
        assert_eq!(events[0].1.kind, kinds::AUTH_TIMEOUT);
    }
}
