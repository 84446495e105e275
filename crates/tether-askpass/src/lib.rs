//! tether-askpass: the helper git and ssh invoke for interactive prompts.
//!
//! The helper forwards each prompt to the daemon's IPC bridge and blocks
//! until a decision comes back. It runs in two modes:
//! - askpass (`GIT_ASKPASS` / `SSH_ASKPASS`): one prompt string argument
//! - git credential helper: `get` / `store` / `erase` with a key=value description on stdin

pub mod client;
pub mod prompt;

pub use client::{AuthClient, ClientError};
