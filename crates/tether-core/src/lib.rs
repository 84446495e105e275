//! tether-core: shared types for the tether control plane.
//!
//! Holds the pieces both the daemon and the out-of-process helper need:
//! - `config`: TOML configuration with defaults and validation
//! - `logging`: tracing bootstrap and secret redaction
//! - `event`: the event model fanned out by the aggregator
//! - `protocol`: the helper <-> bridge wire format

pub mod config;
pub mod event;
pub mod logging;
pub mod protocol;
