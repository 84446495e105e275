#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use tether_core::event::{kinds, EventOrigin, StreamEvent};

use super::{
    Aggregator, AggregatorConfig, AggregatorError, EventSource, EventStream, PublishSink,
    SourceError, Subscription,
};

type UpstreamTx = mpsc::UnboundedSender<Result<StreamEvent, SourceError>>;

/// Decrements the live-upstream counter when the stream is dropped.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory upstream: every successful connect hands the test a sender.
struct MockEventSource {
    connects: mpsc::UnboundedSender<(String, UpstreamTx)>,
    active: Arc<AtomicUsize>,
    refuse: AtomicBool,
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn connect(&self, context: &str) -> Result<EventStream, SourceError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SourceError::Read("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.active));
        let _ = self.connects.send((context.to_string(), tx));
        Ok(UnboundedReceiverStream::new(rx)
            .map(move |item| {
                let _ = &guard;
                item
            })
            .boxed())
    }
}

struct Harness {
    aggregator: Aggregator,
    source: Arc<MockEventSource>,
    connects: mpsc::UnboundedReceiver<(String, UpstreamTx)>,
}

impl Harness {
    fn new(config: AggregatorConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Arc::new(MockEventSource {
            connects: tx,
            active: Arc::new(AtomicUsize::new(0)),
            refuse: AtomicBool::new(false),
        });
        Self {
            aggregator: Aggregator::new(config, source.clone()),
            source,
            connects: rx,
        }
    }

    fn active(&self) -> usize {
        self.source.active.load(Ordering::SeqCst)
    }

    async fn next_connect(&mut self) -> (String, UpstreamTx) {
        tokio::time::timeout(Duration::from_secs(2), self.connects.recv())
            .await
            .expect("upstream connect")
            .unwrap()
    }

    async fn no_connect_within(&mut self, wait: Duration) {
        assert!(
            tokio::time::timeout(wait, self.connects.recv()).await.is_err(),
            "unexpected upstream connect"
        );
    }
}

fn config() -> AggregatorConfig {
    AggregatorConfig {
        subscriber_buffer: 16,
        unsubscribe_grace: Duration::from_millis(100),
        reconnect_max_attempts: 2,
        reconnect_base_delay: Duration::from_millis(10),
        reconnect_max_delay: Duration::from_millis(50),
    }
}

async fn next(sub: &mut Subscription) -> Arc<StreamEvent> {
    tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("event within deadline")
        .expect("subscription still open")
}

async fn assert_silent(sub: &mut Subscription) {
    assert!(
        tokio::time::timeout(Duration::from_millis(50), sub.recv())
            .await
            .is_err(),
        "unexpected event"
    );
}

fn synthetic(n: u64) -> StreamEvent {
    StreamEvent::synthetic(kinds::AUTH_PROMPT, serde_json::json!({ "n": n }))
}

#[tokio::test]
async fn one_upstream_per_context_until_last_subscriber_leaves() {
    let mut h = Harness::new(config());
    let subs: Vec<Subscription> = (0..3)
        .map(|_| h.aggregator.subscribe("/repo").unwrap())
        .collect();
    let (context, _tx) = h.next_connect().await;
    assert_eq!(context, "/repo");
    h.no_connect_within(Duration::from_millis(50)).await;
    assert_eq!(h.active(), 1);
    assert_eq!(h.aggregator.subscriber_count("/repo"), 3);

    let mut subs = subs.into_iter();
    let first = subs.next().unwrap();
    let second = subs.next().unwrap();
    let last = subs.next().unwrap();

    assert!(h.aggregator.unsubscribe(first.handle()));
    assert!(!h.aggregator.unsubscribe(first.handle()));
    drop(second);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(h.active(), 1);
    assert_eq!(h.aggregator.context_count(), 1);

    drop(last);
    // Still open during the grace period.
    assert_eq!(h.aggregator.context_count(), 1);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.active(), 0);
    assert_eq!(h.aggregator.context_count(), 0);
    drop(first);
}

#[tokio::test]
async fn published_events_are_ordered_and_scoped_to_their_context() {
    let mut h = Harness::new(config());
    let mut a1 = h.aggregator.subscribe("a").unwrap();
    let mut a2 = h.aggregator.subscribe("a").unwrap();
    let mut b1 = h.aggregator.subscribe("b").unwrap();
    h.next_connect().await;
    h.next_connect().await;

    for n in 1..=3 {
        assert_eq!(h.aggregator.publish("a", synthetic(n)), 2);
    }
    for sub in [&mut a1, &mut a2] {
        for n in 1..=3u64 {
            let ev = next(sub).await;
            assert_eq!(ev.seq, n);
            assert_eq!(ev.context, "a");
            assert_eq!(ev.payload["n"], n);
            assert_eq!(ev.origin, EventOrigin::Synthetic);
        }
    }
    assert_silent(&mut b1).await;
    assert_eq!(h.aggregator.last_seq("a"), Some(3));
    assert_eq!(h.aggregator.last_seq("b"), Some(0));
}

#[tokio::test]
async fn upstream_events_are_stamped_and_forwarded() {
    let mut h = Harness::new(config());
    let mut sub = h.aggregator.subscribe("/repo").unwrap();
    let (_, tx) = h.next_connect().await;

    tx.send(Ok(StreamEvent::upstream(
        "session.updated",
        serde_json::json!({ "id": "s1" }),
    )))
    .unwrap();
    let ev = next(&mut sub).await;
    assert_eq!(ev.kind, "session.updated");
    assert_eq!(ev.context, "/repo");
    assert_eq!(ev.seq, 1);
    assert_eq!(ev.origin, EventOrigin::Upstream);
    assert!(h.aggregator.is_upstream_connected("/repo"));
}

#[tokio::test]
async fn slow_subscriber_is_dropped_without_blocking_others() {
    let mut cfg = config();
    cfg.subscriber_buffer = 2;
    let mut h = Harness::new(cfg);
    let mut fast = h.aggregator.subscribe("c").unwrap();
    let mut slow = h.aggregator.subscribe("c").unwrap();
    h.next_connect().await;

    let mut delivered = Vec::new();
    for n in 1..=5 {
        delivered.push(h.aggregator.publish("c", synthetic(n)));
        assert_eq!(next(&mut fast).await.payload["n"], n);
    }
    assert_eq!(delivered, vec![2, 2, 1, 1, 1]);

    // The slow subscriber drains what it had buffered, then its stream ends.
    assert_eq!(next(&mut slow).await.seq, 1);
    assert_eq!(next(&mut slow).await.seq, 2);
    assert!(slow.recv().await.is_none());
    assert_eq!(h.aggregator.subscriber_count("c"), 1);

    // Resubscribing restores delivery.
    let mut again = h.aggregator.subscribe("c").unwrap();
    h.aggregator.publish("c", synthetic(6));
    assert_eq!(next(&mut again).await.payload["n"], 6);
    assert_eq!(next(&mut fast).await.payload["n"], 6);
}

#[tokio::test]
async fn resubscribe_within_grace_reuses_the_upstream() {
    let mut h = Harness::new(config());
    let sub = h.aggregator.subscribe("/repo").unwrap();
    let (_, tx) = h.next_connect().await;
    drop(sub);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let mut sub = h.aggregator.subscribe("/repo").unwrap();
    h.no_connect_within(Duration::from_millis(300)).await;
    assert_eq!(h.active(), 1);

    tx.send(Ok(StreamEvent::upstream("ping", serde_json::Value::Null)))
        .unwrap();
    assert_eq!(next(&mut sub).await.kind, "ping");
}

#[tokio::test]
async fn reconnects_after_upstream_disconnect() {
    let mut h = Harness::new(config());
    let mut sub = h.aggregator.subscribe("/repo").unwrap();
    let (_, first) = h.next_connect().await;
    first
        .send(Ok(StreamEvent::upstream("a", serde_json::Value::Null)))
        .unwrap();
    assert_eq!(next(&mut sub).await.kind, "a");

    drop(first);
    let (context, second) = h.next_connect().await;
    assert_eq!(context, "/repo");
    second
        .send(Ok(StreamEvent::upstream("b", serde_json::Value::Null)))
        .unwrap();
    let ev = next(&mut sub).await;
    assert_eq!(ev.kind, "b");
    // No replay, sequence continues.
    assert_eq!(ev.seq, 2);
}

#[tokio::test]
async fn exhausted_reconnects_end_with_terminal_event() {
    let h = Harness::new(config());
    h.source.refuse.store(true, Ordering::SeqCst);
    let mut sub1 = h.aggregator.subscribe("/gone").unwrap();
    let mut sub2 = h.aggregator.subscribe("/gone").unwrap();

    for sub in [&mut sub1, &mut sub2] {
        let ev = next(sub).await;
        assert!(ev.is_terminal());
        assert_eq!(ev.kind, kinds::UPSTREAM_LOST);
        assert_eq!(ev.payload["attempts"], 2);
        assert!(ev.payload["reason"]
            .as_str()
            .unwrap()
            .contains("connection refused"));
        assert!(sub.recv().await.is_none());
    }
    assert_eq!(h.aggregator.context_count(), 0);
}

#[tokio::test]
async fn publish_without_subscribers_is_dropped() {
    let h = Harness::new(config());
    assert_eq!(h.aggregator.publish("nobody", synthetic(1)), 0);
    assert_eq!(h.aggregator.context_count(), 0);
}

#[tokio::test]
async fn rejects_blank_context_and_subscriptions_after_shutdown() {
    let mut h = Harness::new(config());
    assert_eq!(
        h.aggregator.subscribe("   ").err(),
        Some(AggregatorError::InvalidContext("   ".to_string()))
    );

    let mut sub = h.aggregator.subscribe("/repo").unwrap();
    h.next_connect().await;
    h.aggregator.shutdown();
    assert!(sub.recv().await.is_none());
    assert_eq!(
        h.aggregator.subscribe("/repo").err(),
        Some(AggregatorError::ShuttingDown)
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.active(), 0);
}
