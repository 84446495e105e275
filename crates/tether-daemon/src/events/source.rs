use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;

use tether_core::config::AgentConfig;
use tether_core::event::StreamEvent;

use crate::proxy::{Proxy, ProxyError};
use crate::sse::{SseDecoder, SseFrame};

pub type EventStream = BoxStream<'static, Result<StreamEvent, SourceError>>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("event stream read failed: {0}")]
    Read(String),
}

/// Opens the upstream event subscription for one context key.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self, context: &str) -> Result<EventStream, SourceError>;
}

/// Subscribes to the supervised process's SSE endpoints through the proxy.
///
/// The global context key maps to the global endpoint; any other key is
/// sent as the `directory` query parameter of the per-directory endpoint.
pub struct HttpEventSource {
    proxy: Proxy,
    event_path: String,
    global_event_path: String,
    global_context: String,
}

impl HttpEventSource {
    pub fn new(proxy: Proxy, agent: &AgentConfig, global_context: impl Into<String>) -> Self {
        Self {
            proxy,
            event_path: agent.event_path.clone(),
            global_event_path: agent.global_event_path.clone(),
            global_context: global_context.into(),
        }
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn connect(&self, context: &str) -> Result<EventStream, SourceError> {
        let resp = if context == self.global_context {
            self.proxy
                .open_event_stream(&self.global_event_path, &[])
                .await?
        } else {
            self.proxy
                .open_event_stream(&self.event_path, &[("directory", context)])
                .await?
        };

        let state = (resp.bytes_stream().boxed(), SseDecoder::new(), VecDeque::<SseFrame>::new());
        let events = stream::unfold(state, |(mut body, mut decoder, mut pending)| async move {
            loop {
                if let Some(frame) = pending.pop_front() {
                    let event = StreamEvent::from_upstream_data(frame.event.as_deref(), &frame.data);
                    return Some((Ok(event), (body, decoder, pending)));
                }
                match body.next().await {
                    Some(Ok(chunk)) => pending.extend(decoder.feed(&chunk)),
                    Some(Err(err)) => {
                        return Some((Err(SourceError::Read(err.to_string())), (body, decoder, pending)))
                    }
                    None => return None,
                }
            }
        });
        Ok(events.boxed())
    }
}
