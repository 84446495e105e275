use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use tether_core::config::AgentConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Ready,
    Crashed,
    Stopping,
}

impl ProcessState {
    /// States from which `start` may spawn a new process.
    pub fn accepts_start(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Crashed => "crashed",
            Self::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the managed process listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// `path` must start with `/`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot published on every state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub host: String,
    pub port: Option<u16>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_health: Option<HealthReport>,
    pub last_error: Option<String>,
}

impl ProcessStatus {
    pub fn stopped(host: &str) -> Self {
        Self {
            state: ProcessState::Stopped,
            pid: None,
            host: host.to_string(),
            port: None,
            started_at: None,
            restart_count: 0,
            last_health: None,
            last_error: None,
        }
    }

    /// Endpoint, only while `Ready`.
    pub fn endpoint(&self) -> Option<Endpoint> {
        match (self.state, self.port) {
            (ProcessState::Ready, Some(port)) => Some(Endpoint {
                host: self.host.clone(),
                port,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("agent server is not ready (state: {state})")]
    NotReady { state: ProcessState },
    #[error("agent server is already {state}")]
    AlreadyRunning { state: ProcessState },
    #[error("agent server failed to start: {reason}")]
    StartupFailed {
        reason: String,
        output_tail: Vec<String>,
    },
    #[error("failed to spawn agent server: {0}")]
    Spawn(String),
    #[error("failed to reserve a port: {0}")]
    PortReservation(String),
    #[error("failed to signal pid {pid}: {message}")]
    Signal { pid: u32, message: String },
    #[error("supervisor is shutting down")]
    ShuttingDown,
}

impl SupervisorError {
    /// Whether a caller can reasonably retry after a short wait.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotReady { .. } | Self::StartupFailed { .. })
    }
}

/// Supervisor tuning, resolved from `[agent]`.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<std::path::PathBuf>,
    pub host: String,
    pub port: u16,
    pub health_path: String,
    pub startup_timeout: Duration,
    pub readiness_interval: Duration,
    pub probe_timeout: Duration,
    pub health_interval: Duration,
    pub health_failure_threshold: u32,
    pub stop_grace: Duration,
    pub restart_max: u32,
    pub restart_window: Duration,
    pub restart_backoff: Duration,
    pub output_tail_lines: usize,
}

impl From<&AgentConfig> for SupervisorConfig {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            args: cfg.args.clone(),
            env: cfg
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            working_dir: cfg.working_dir.clone(),
            host: cfg.host.clone(),
            port: cfg.port,
            health_path: cfg.health_path.clone(),
            startup_timeout: cfg.startup_timeout(),
            readiness_interval: cfg.readiness_interval(),
            probe_timeout: cfg.probe_timeout(),
            health_interval: cfg.health_interval(),
            health_failure_threshold: cfg.health_failure_threshold,
            stop_grace: cfg.stop_grace(),
            restart_max: cfg.restart_max,
            restart_window: cfg.restart_window(),
            restart_backoff: cfg.restart_backoff(),
            output_tail_lines: cfg.output_tail_lines,
        }
    }
}

impl SupervisorConfig {
    /// Extra environment appended after the configured one.
    pub fn with_env<I>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(extra);
        self
    }
}
