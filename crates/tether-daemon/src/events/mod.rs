//! Per-context event fan-out.
//!
//! One upstream subscription per context key, shared by every downstream
//! subscriber of that key. Delivery is at-most-once: slow subscribers are
//! dropped, reconnects do not replay, and exhausting the reconnect budget
//! ends every subscription with a terminal `upstream.lost` event.

mod aggregator;
mod source;

pub use aggregator::{
    Aggregator, AggregatorConfig, AggregatorError, PublishSink, Subscription, SubscriptionHandle,
};
pub use source::{EventSource, EventStream, HttpEventSource, SourceError};

#[cfg(test)]
mod tests;
