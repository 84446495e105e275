//! tether-daemon: supervises an agent server and fronts it over HTTP.
//!
//! - `supervisor`: lifecycle of the managed process (start, readiness, crash restart)
//! - `proxy`: streaming HTTP forwarding to the managed process
//! - `events`: per-context fan-out of the upstream event stream
//! - `auth`: IPC bridge for git/ssh helpers and the broker that resolves prompts
//! - `routes`, `daemon`, `bootstrap`: HTTP surface, wiring and process bootstrap

pub mod auth;
pub mod backoff;
pub mod bootstrap;
pub mod daemon;
pub mod events;
pub mod proxy;
pub mod routes;
pub mod sse;
pub mod supervisor;
