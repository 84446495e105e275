//! Streaming HTTP forwarding to the supervised process.
//!
//! Neither request nor response bodies are buffered: the request body is
//! pumped chunk by chunk into the upstream request and the upstream body is
//! handed to axum as a stream. Dropping either side tears the other down.

use std::time::Duration;

use axum::body::{Body, HttpBody};
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::supervisor::{Supervisor, SupervisorError};

/// Chunks buffered between the inbound body and the upstream request.
const REQUEST_BODY_CHANNEL: usize = 8;

/// Seconds suggested to clients while the upstream is not ready.
const RETRY_AFTER_SECS: &str = "1";

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream not ready: {0}")]
    UpstreamNotReady(String),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<SupervisorError> for ProxyError {
    fn from(err: SupervisorError) -> Self {
        Self::UpstreamNotReady(err.to_string())
    }
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UpstreamNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        let mut resp = (status, body).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            resp.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from_static(RETRY_AFTER_SECS),
            );
        }
        resp
    }
}

#[derive(Clone)]
pub struct Proxy {
    supervisor: Supervisor,
    client: reqwest::Client,
}

impl Proxy {
    pub fn new(supervisor: Supervisor, connect_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_default();
        Self { supervisor, client }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Forward `req` to `target_path` on the supervised process.
    ///
    /// Fails with `UpstreamNotReady` without touching the network when the
    /// process is not `Ready`.
    pub async fn forward(
        &self,
        req: Request<Body>,
        target_path: &str,
    ) -> Result<Response, ProxyError> {
        let endpoint = self.supervisor.endpoint()?;
        if !target_path.starts_with('/') {
            return Err(ProxyError::InvalidRequest(format!(
                "target path must be absolute: {target_path}"
            )));
        }

        let (parts, body) = req.into_parts();
        let mut url = endpoint.url(target_path);
        if let Some(query) = parts.uri.query().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        debug!(method = %parts.method, path = %target_path, port = endpoint.port, "forwarding request");

        let mut builder = self
            .client
            .request(parts.method.clone(), &url)
            .headers(strip_hop_by_hop(&parts.headers, true));
        if has_body(&body) {
            builder = builder.body(stream_request_body(body));
        }

        let upstream = builder.send().await.map_err(classify)?;

        let status = upstream.status();
        let headers = strip_hop_by_hop(upstream.headers(), false);
        let path = target_path.to_string();
        let stream = upstream.bytes_stream().map_err(move |err| {
            // Surfacing the error aborts the response instead of ending it cleanly.
            warn!(path = %path, error = %err, "upstream stream failed mid-response");
            std::io::Error::other(err)
        });

        let mut resp = Response::new(Body::from_stream(stream));
        *resp.status_mut() = status;
        *resp.headers_mut() = headers;
        Ok(resp)
    }

    /// Open a long-lived event stream on the supervised process.
    pub async fn open_event_stream(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response, ProxyError> {
        let endpoint = self.supervisor.endpoint()?;
        let resp = self
            .client
            .get(endpoint.url(path))
            .query(query)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(classify)?;
        if !resp.status().is_success() {
            return Err(ProxyError::Upstream(format!(
                "event stream {path} returned {}",
                resp.status()
            )));
        }
        Ok(resp)
    }
}

fn classify(err: reqwest::Error) -> ProxyError {
    if err.is_connect() {
        ProxyError::UpstreamNotReady(err.to_string())
    } else {
        ProxyError::Upstream(err.to_string())
    }
}

/// Framing headers are optional on HTTP/2, so ask the body itself.
fn has_body(body: &Body) -> bool {
    !body.is_end_stream() && body.size_hint().exact() != Some(0)
}

/// Copy `headers` without hop-by-hop entries (and without `Host` on requests).
fn strip_hop_by_hop(headers: &HeaderMap, request: bool) -> HeaderMap {
    // Headers named by `Connection` are hop-by-hop too.
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || listed.iter().any(|l| l == lower) {
            continue;
        }
        if request && name == header::HOST {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn stream_request_body(body: Body) -> reqwest::Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(REQUEST_BODY_CHANNEL);
    tokio::spawn(async move {
        let mut chunks = body.into_data_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(std::io::Error::other);
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    });
    reqwest::Body::wrap_stream(ReceiverStream::new(rx))
}
