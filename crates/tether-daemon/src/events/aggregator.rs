use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_core::config::EventsConfig;
use tether_core::event::StreamEvent;

use super::source::{EventSource, EventStream};
use crate::backoff;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AggregatorError {
    #[error("event aggregator is shutting down")]
    ShuttingDown,
    #[error("invalid context key {0:?}")]
    InvalidContext(String),
}

/// Injection point for internal producers of synthetic events.
pub trait PublishSink: Send + Sync {
    /// Deliver `event` to the subscribers of `context`; returns how many received it.
    fn publish(&self, context: &str, event: StreamEvent) -> usize;
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub subscriber_buffer: usize,
    pub unsubscribe_grace: Duration,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl From<&EventsConfig> for AggregatorConfig {
    fn from(cfg: &EventsConfig) -> Self {
        Self {
            subscriber_buffer: cfg.subscriber_buffer,
            unsubscribe_grace: cfg.unsubscribe_grace(),
            reconnect_max_attempts: cfg.reconnect_max_attempts,
            reconnect_base_delay: cfg.reconnect_base_delay(),
            reconnect_max_delay: cfg.reconnect_max_delay(),
        }
    }
}

type EventSender = mpsc::Sender<Arc<StreamEvent>>;

struct ContextState {
    subscribers: HashMap<u64, EventSender>,
    /// Sequence number of the last delivered event.
    last_seq: u64,
    /// Bumped on every attach and on every transition to empty; a pending
    /// teardown only proceeds if the epoch it captured is still current.
    linger_epoch: u64,
    connected: bool,
    closed: bool,
}

struct Context {
    key: String,
    upstream: CancellationToken,
    state: Mutex<ContextState>,
}

struct Inner {
    config: AggregatorConfig,
    source: Arc<dyn EventSource>,
    // Lock order: `contexts` before any `Context::state`.
    contexts: Mutex<HashMap<String, Arc<Context>>>,
    next_subscriber: AtomicU64,
    shutdown: CancellationToken,
}

/// Fans one upstream event subscription per context key out to any number
/// of downstream subscribers.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    context: String,
    id: u64,
}

impl SubscriptionHandle {
    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// A downstream sink. Yields events until unsubscribed, dropped for falling
/// behind, or the upstream is lost. Dropping it unsubscribes.
pub struct Subscription {
    handle: SubscriptionHandle,
    events: mpsc::Receiver<Arc<StreamEvent>>,
    owner: Weak<Inner>,
}

impl Subscription {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub async fn recv(&mut self) -> Option<Arc<StreamEvent>> {
        self.events.recv().await
    }
}

impl Stream for Subscription {
    type Item = Arc<StreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.owner.upgrade() {
            inner.detach(&self.handle);
        }
    }
}

impl Aggregator {
    pub fn new(config: AggregatorConfig, source: Arc<dyn EventSource>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                contexts: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Attach a subscriber to `context`, opening the upstream subscription if
    /// this is the first one. Must be called within a tokio runtime.
    pub fn subscribe(&self, context: &str) -> Result<Subscription, AggregatorError> {
        let key = context.trim();
        if key.is_empty() {
            return Err(AggregatorError::InvalidContext(context.to_string()));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(AggregatorError::ShuttingDown);
        }

        let (tx, rx) = mpsc::channel(self.inner.config.subscriber_buffer.max(1));
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst) + 1;

        let (ctx, created, count) = {
            let mut contexts = lock(&self.inner.contexts);
            let (ctx, created) = match contexts.get(key) {
                Some(ctx) => (Arc::clone(ctx), false),
                None => {
                    let ctx = Arc::new(Context {
                        key: key.to_string(),
                        upstream: self.inner.shutdown.child_token(),
                        state: Mutex::new(ContextState {
                            subscribers: HashMap::new(),
                            last_seq: 0,
                            linger_epoch: 0,
                            connected: false,
                            closed: false,
                        }),
                    });
                    contexts.insert(key.to_string(), Arc::clone(&ctx));
                    (ctx, true)
                }
            };
            let mut state = lock(&ctx.state);
            state.subscribers.insert(id, tx);
            state.linger_epoch += 1;
            let count = state.subscribers.len();
            drop(state);
            (ctx, created, count)
        };

        if created {
            info!(context = %key, "opening upstream event subscription");
            tokio::spawn(run_upstream(Arc::downgrade(&self.inner), ctx));
        }
        debug!(context = %key, subscriber = id, subscribers = count, "subscriber attached");

        Ok(Subscription {
            handle: SubscriptionHandle {
                context: key.to_string(),
                id,
            },
            events: rx,
            owner: Arc::downgrade(&self.inner),
        })
    }

    /// Detach a subscriber. The upstream closes after the grace period once
    /// the last subscriber of a context is gone. Returns false if the handle
    /// was no longer attached.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.inner.detach(handle)
    }

    /// Stop all upstream subscriptions and end every downstream stream.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drained: Vec<Arc<Context>> = {
            let mut contexts = lock(&self.inner.contexts);
            contexts.drain().map(|(_, ctx)| ctx).collect()
        };
        for ctx in drained {
            let mut state = lock(&ctx.state);
            state.closed = true;
            state.subscribers.clear();
        }
        info!("event aggregator stopped");
    }

    pub fn context_count(&self) -> usize {
        lock(&self.inner.contexts).len()
    }

    pub fn subscriber_count(&self, context: &str) -> usize {
        self.inner
            .context(context)
            .map_or(0, |ctx| lock(&ctx.state).subscribers.len())
    }

    pub fn is_upstream_connected(&self, context: &str) -> bool {
        self.inner
            .context(context)
            .is_some_and(|ctx| lock(&ctx.state).connected)
    }

    pub fn last_seq(&self, context: &str) -> Option<u64> {
        self.inner
            .context(context)
            .map(|ctx| lock(&ctx.state).last_seq)
    }
}

impl PublishSink for Aggregator {
    fn publish(&self, context: &str, event: StreamEvent) -> usize {
        match self.inner.context(context) {
            Some(ctx) => self.inner.deliver(&ctx, event),
            None => {
                debug!(context = %context, kind = %event.kind, "no subscribers for published event");
                0
            }
        }
    }
}

impl Inner {
    fn context(&self, key: &str) -> Option<Arc<Context>> {
        lock(&self.contexts).get(key.trim()).cloned()
    }

    fn detach(self: &Arc<Self>, handle: &SubscriptionHandle) -> bool {
        let Some(ctx) = self.context(&handle.context) else {
            return false;
        };
        let epoch = {
            let mut state = lock(&ctx.state);
            if state.subscribers.remove(&handle.id).is_none() {
                return false;
            }
            debug!(context = %ctx.key, subscriber = handle.id, subscribers = state.subscribers.len(), "subscriber detached");
            if !state.subscribers.is_empty() {
                return true;
            }
            state.linger_epoch += 1;
            state.linger_epoch
        };
        self.schedule_linger(ctx, epoch);
        true
    }

    /// Stamp, then offer the event to every subscriber without blocking.
    fn deliver(self: &Arc<Self>, ctx: &Arc<Context>, mut event: StreamEvent) -> usize {
        let (delivered, linger) = {
            let mut state = lock(&ctx.state);
            if state.closed {
                return 0;
            }
            state.last_seq += 1;
            event.seq = state.last_seq;
            event.context = ctx.key.clone();
            let event = Arc::new(event);

            let mut delivered = 0;
            let mut dropped = Vec::new();
            for (id, tx) in &state.subscribers {
                match tx.try_send(Arc::clone(&event)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(context = %ctx.key, subscriber = id, "subscriber fell behind; dropping it");
                        dropped.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => dropped.push(*id),
                }
            }
            for id in &dropped {
                state.subscribers.remove(id);
            }

            let linger = if !dropped.is_empty() && state.subscribers.is_empty() {
                state.linger_epoch += 1;
                Some(state.linger_epoch)
            } else {
                None
            };
            (delivered, linger)
        };
        if let Some(epoch) = linger {
            self.schedule_linger(Arc::clone(ctx), epoch);
        }
        delivered
    }

    fn schedule_linger(self: &Arc<Self>, ctx: Arc<Context>, epoch: u64) {
        let grace = self.config.unsubscribe_grace;
        // Drop may run outside a runtime; tear down immediately then.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.teardown_if_idle(&ctx, epoch);
            return;
        };
        let weak = Arc::downgrade(self);
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                inner.teardown_if_idle(&ctx, epoch);
            }
        });
    }

    fn teardown_if_idle(&self, ctx: &Arc<Context>, epoch: u64) {
        let mut contexts = lock(&self.contexts);
        {
            let mut state = lock(&ctx.state);
            if state.closed || state.linger_epoch != epoch || !state.subscribers.is_empty() {
                return;
            }
            state.closed = true;
        }
        if contexts.get(&ctx.key).is_some_and(|c| Arc::ptr_eq(c, ctx)) {
            contexts.remove(&ctx.key);
        }
        drop(contexts);
        ctx.upstream.cancel();
        info!(context = %ctx.key, "closed idle upstream event subscription");
    }

    /// Give up on a context: terminal event to everyone, then remove it.
    fn upstream_lost(&self, ctx: &Arc<Context>, reason: &str, attempts: u32) {
        let (subscribers, seq) = {
            let mut contexts = lock(&self.contexts);
            let mut state = lock(&ctx.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.connected = false;
            if contexts.get(&ctx.key).is_some_and(|c| Arc::ptr_eq(c, ctx)) {
                contexts.remove(&ctx.key);
            }
            state.last_seq += 1;
            (std::mem::take(&mut state.subscribers), state.last_seq)
        };

        error!(context = %ctx.key, attempts, reason = %reason, subscribers = subscribers.len(), "upstream event stream lost");
        let mut event = StreamEvent::upstream_lost(reason, attempts);
        event.seq = seq;
        event.context = ctx.key.clone();
        let event = Arc::new(event);
        for tx in subscribers.values() {
            // A full queue misses the notice but still sees its stream end.
            let _ = tx.try_send(Arc::clone(&event));
        }
        ctx.upstream.cancel();
    }
}

impl Context {
    fn set_connected(&self, connected: bool) {
        lock(&self.state).connected = connected;
    }
}

/// Upstream pump for one context: connect, forward, reconnect with backoff.
async fn run_upstream(owner: Weak<Inner>, ctx: Arc<Context>) {
    let mut attempts: u32 = 0;
    loop {
        let Some((source, config)) = owner
            .upgrade()
            .map(|inner| (Arc::clone(&inner.source), inner.config.clone()))
        else {
            return;
        };

        let connected = tokio::select! {
            biased;
            _ = ctx.upstream.cancelled() => return,
            result = source.connect(&ctx.key) => result,
        };
        drop(source);

        let reason = match connected {
            Ok(stream) => {
                ctx.set_connected(true);
                info!(context = %ctx.key, "upstream event stream connected");
                let outcome = pump(&owner, &ctx, stream, &mut attempts).await;
                ctx.set_connected(false);
                match outcome {
                    Some(reason) => reason,
                    None => return,
                }
            }
            Err(err) => err.to_string(),
        };
        if ctx.upstream.is_cancelled() {
            return;
        }

        if attempts >= config.reconnect_max_attempts {
            if let Some(inner) = owner.upgrade() {
                inner.upstream_lost(&ctx, &reason, attempts);
            }
            return;
        }
        let delay = backoff::exponential(
            config.reconnect_base_delay,
            config.reconnect_max_delay,
            attempts,
        );
        attempts += 1;
        warn!(
            context = %ctx.key,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "upstream event stream interrupted; reconnecting"
        );
        tokio::select! {
            biased;
            _ = ctx.upstream.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Forward events until the stream ends (`Some(reason)`) or the context is
/// cancelled (`None`). Any delivered event resets the reconnect budget.
async fn pump(
    owner: &Weak<Inner>,
    ctx: &Arc<Context>,
    mut stream: EventStream,
    attempts: &mut u32,
) -> Option<String> {
    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.upstream.cancelled() => return None,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                *attempts = 0;
                let inner = owner.upgrade()?;
                inner.deliver(ctx, event);
            }
            Some(Err(err)) => return Some(err.to_string()),
            None => return Some("upstream closed the event stream".to_string()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
