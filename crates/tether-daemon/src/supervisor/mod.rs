mod manager;
mod probe;
mod types;

pub use manager::{default_command, CommandBuilder, Supervisor};
pub use probe::{HttpProbe, ReadinessProbe};
pub use types::{
    Endpoint, HealthReport, ProcessState, ProcessStatus, SupervisorConfig, SupervisorError,
};
