//! Helper prompts: the IPC bridge that blocks helpers, the pending-request
//! table, and the broker that accepts operator decisions.

mod bridge;
mod broker;
mod pending;

pub use bridge::{AuthObserver, BridgeConfig, BridgeError, IpcBridge};
pub use broker::{AuthBroker, BrokerError};
pub use pending::{PendingPrompt, PendingRequests, ResolveOutcome, Settlement};
