//! HTTP surface of the daemon.
//!
//! Requests under the configured API prefix are forwarded to the supervised
//! process with the prefix removed; everything else is served locally.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use tether_core::protocol::Decision;

use crate::auth::{AuthBroker, BrokerError, PendingPrompt, ResolveOutcome};
use crate::events::{Aggregator, AggregatorError};
use crate::proxy::{Proxy, ProxyError};
use crate::supervisor::{ProcessStatus, Supervisor};

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub proxy: Proxy,
    pub aggregator: Aggregator,
    pub broker: AuthBroker,
    pub api_prefix: String,
    pub global_context: String,
}

pub fn router(state: AppState) -> Router {
    let prefix = state.api_prefix.trim_end_matches('/').to_string();
    let mut router = Router::new()
        .route("/status", get(status))
        .route("/events", get(events))
        .route("/auth/pending", get(pending_prompts))
        .route("/auth/{id}/resolve", post(resolve_prompt));
    if prefix.is_empty() {
        router = router.fallback(forward);
    } else {
        router = router
            .route(&prefix, any(forward))
            .route(&format!("{prefix}/"), any(forward))
            .route(&format!("{prefix}/{{*path}}"), any(forward));
    }
    router.with_state(state)
}

impl IntoResponse for AggregatorError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidContext(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn status(State(state): State<AppState>) -> Json<ProcessStatus> {
    Json(state.supervisor.status())
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    directory: Option<String>,
}

async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AggregatorError> {
    let context = query
        .directory
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| state.global_context.clone());
    let subscription = state.aggregator.subscribe(&context)?;
    // The subscription detaches when the client goes away and axum drops the stream.
    let stream = subscription.map(|event| {
        let mut frame = Event::default().id(event.seq.to_string());
        // Upstream-supplied kinds may contain characters the SSE field cannot carry.
        if !event.kind.is_empty() && !event.kind.contains(['\n', '\r']) {
            frame = frame.event(event.kind.clone());
        }
        Ok(frame
            .json_data(&*event)
            .unwrap_or_else(|_| Event::default().comment("unencodable event")))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE)))
}

async fn pending_prompts(State(state): State<AppState>) -> Json<Vec<PendingPrompt>> {
    Json(state.broker.pending())
}

async fn resolve_prompt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(decision): Json<Decision>,
) -> Result<Json<serde_json::Value>, BrokerError> {
    let outcome = state.broker.resolve(&id, decision)?;
    Ok(Json(json!({
        "id": id,
        "resolved": outcome == ResolveOutcome::Resolved,
        "outcome": outcome,
    })))
}

async fn forward(State(state): State<AppState>, req: Request<Body>) -> Result<Response, ProxyError> {
    let target = upstream_path(req.uri().path(), &state.api_prefix);
    state.proxy.forward(req, &target).await
}

/// Map an inbound path under `prefix` to the upstream path.
fn upstream_path(path: &str, prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let rest = path.strip_prefix(prefix).unwrap_or(path);
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{rest}")
    }
}

#[cfg(test)]
mod tests {
    use super::upstream_path;

    #[test]
    fn prefix_is_removed_before_forwarding() {
        assert_eq!(upstream_path("/api/session/1", "/api"), "/session/1");
        assert_eq!(upstream_path("/api", "/api"), "/");
        assert_eq!(upstream_path("/api/", "/api/"), "/");
        assert_eq!(upstream_path("/session", ""), "/session");
    }
}
