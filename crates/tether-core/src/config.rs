//! Configuration for the tether daemon.
//!
//! One TOML document with `[server]`, `[agent]`, `[events]`, `[auth]` and
//! `[logging]` sections. Every field has a default so an empty file (or no
//! file at all) yields a runnable configuration; `validate` rejects values
//! that can only be misconfiguration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default bind host for the daemon's HTTP surface.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default HTTP port for the daemon.
pub const DEFAULT_PORT: u16 = 4097;

/// Context key that maps to the supervised process's global event stream.
pub const DEFAULT_GLOBAL_CONTEXT: &str = "global";

/// File name of the helper binary looked up next to the daemon executable.
pub const HELPER_BINARY_NAME: &str = "tether-askpass";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub events: EventsConfig,
    pub auth: AuthConfig,
    pub logging: LoggingSection,
}

/// HTTP surface of the daemon itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Requests under this prefix are forwarded verbatim to the supervised process.
    pub api_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            api_prefix: "/api".into(),
        }
    }
}

impl ServerConfig {
    /// Returns the bind address as "host:port".
    pub fn bind_addr(&self) -> String {
        let host = if self.host.is_empty() {
            DEFAULT_HOST
        } else {
            &self.host
        };
        format!("{host}:{}", self.port)
    }
}

/// The supervised agent server process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub command: String,
    /// Arguments; `{host}` and `{port}` are replaced with the bound endpoint.
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub host: String,
    /// Fixed port, or 0 to reserve an ephemeral one on every start.
    pub port: u16,
    pub health_path: String,
    pub event_path: String,
    pub global_event_path: String,
    pub startup_timeout_ms: u64,
    pub readiness_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub health_interval_ms: u64,
    pub health_failure_threshold: u32,
    pub stop_grace_ms: u64,
    pub restart_max: u32,
    pub restart_window_secs: u64,
    pub restart_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    pub output_tail_lines: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "opencode".into(),
            args: vec![
                "serve".into(),
                "--hostname".into(),
                "{host}".into(),
                "--port".into(),
                "{port}".into(),
            ],
            env: BTreeMap::new(),
            working_dir: None,
            host: DEFAULT_HOST.into(),
            port: 0,
            health_path: "/global/health".into(),
            event_path: "/event".into(),
            global_event_path: "/global/event".into(),
            startup_timeout_ms: 30_000,
            readiness_interval_ms: 250,
            probe_timeout_ms: 2_000,
            health_interval_ms: 10_000,
            health_failure_threshold: 3,
            stop_grace_ms: 5_000,
            restart_max: 5,
            restart_window_secs: 60,
            restart_backoff_ms: 500,
            connect_timeout_ms: 5_000,
            output_tail_lines: 50,
        }
    }
}

impl AgentConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Event aggregation tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Per-subscriber queue capacity; overflowing subscribers are dropped.
    pub subscriber_buffer: usize,
    pub unsubscribe_grace_ms: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub global_context: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            unsubscribe_grace_ms: 2_000,
            reconnect_max_attempts: 5,
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 5_000,
            global_context: DEFAULT_GLOBAL_CONTEXT.into(),
        }
    }
}

impl EventsConfig {
    pub fn unsubscribe_grace(&self) -> Duration {
        Duration::from_millis(self.unsubscribe_grace_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

/// IPC bridge for helper programs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub socket_path: PathBuf,
    pub decision_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub max_request_bytes: usize,
    /// Helper binary advertised to git/ssh; defaults to a sibling of the daemon executable.
    pub helper_path: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            decision_timeout_ms: 120_000,
            read_timeout_ms: 5_000,
            max_request_bytes: 64 * 1024,
            helper_path: None,
        }
    }
}

impl AuthConfig {
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Effective helper path: the configured one, else `tether-askpass`
    /// next to the running executable.
    pub fn effective_helper_path(&self) -> PathBuf {
        if let Some(path) = &self.helper_path {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(HELPER_BINARY_NAME)))
            .unwrap_or_else(|| PathBuf::from(HELPER_BINARY_NAME))
    }
}

/// Raw logging section; parsed leniently by [`crate::logging::LoggingConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "console".into(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    base.join("tether").join("auth.sock")
}

impl Config {
    /// Read and parse a config file, then validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg = Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load `path` when given, otherwise validated defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.api_prefix.starts_with('/') {
            return Err(invalid("server.api_prefix", "must start with '/'"));
        }
        if self.agent.command.trim().is_empty() {
            return Err(invalid("agent.command", "must not be empty"));
        }
        if self.agent.startup_timeout_ms == 0 {
            return Err(invalid("agent.startup_timeout_ms", "must be positive"));
        }
        if self.agent.readiness_interval_ms == 0 {
            return Err(invalid("agent.readiness_interval_ms", "must be positive"));
        }
        if self.events.subscriber_buffer == 0 {
            return Err(invalid("events.subscriber_buffer", "must be positive"));
        }
        if self.events.global_context.trim().is_empty() {
            return Err(invalid("events.global_context", "must not be empty"));
        }
        if self.auth.decision_timeout_ms == 0 {
            return Err(invalid("auth.decision_timeout_ms", "must be positive"));
        }
        if self.auth.max_request_bytes == 0 {
            return Err(invalid("auth.max_request_bytes", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.server.bind_addr(), "127.0.0.1:4097");
        assert_eq!(cfg.server.api_prefix, "/api");
        assert_eq!(cfg.agent.port, 0);
        assert_eq!(cfg.events.global_context, "global");
        assert_eq!(cfg.auth.decision_timeout(), Duration::from_secs(120));
        assert!(cfg.auth.socket_path.ends_with("tether/auth.sock"));
    }

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let raw = r#"
            [agent]
            command = "my-agent"
            args = ["--port", "{port}"]
            restart_max = 2

            [auth]
            decision_timeout_ms = 30000
        "#;
        let cfg = Config::from_toml_str(raw).unwrap();
        assert_eq!(cfg.agent.command, "my-agent");
        assert_eq!(cfg.agent.args, vec!["--port", "{port}"]);
        assert_eq!(cfg.agent.restart_max, 2);
        assert_eq!(cfg.agent.health_path, "/global/health");
        assert_eq!(cfg.auth.decision_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.events.subscriber_buffer, 256);
    }

    #[test]
    fn zero_decision_timeout_is_rejected() {
        let mut cfg = Config::default();
        cfg.auth.decision_timeout_ms = 0;
        match cfg.validate() {
            Err(ConfigError::Invalid { field, .. }) => {
                assert_eq!(field, "auth.decision_timeout_ms")
            }
            other => panic!("expected invalid decision timeout, got {other:?}"),
        }
    }

    #[test]
    fn relative_api_prefix_is_rejected() {
        let mut cfg = Config::default();
        cfg.server.api_prefix = "api".into();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                field: "server.api_prefix",
                ..
            })
        ));
    }

    #[test]
    fn load_reads_file_and_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.toml");
        std::fs::write(&good, "[server]\nport = 9000\n").unwrap();
        let cfg = Config::load(&good).unwrap();
        assert_eq!(cfg.server.port, 9000);

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[server\nport = ").unwrap();
        assert!(matches!(
            Config::load(&bad),
            Err(ConfigError::Parse { .. })
        ));

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Config::load(&missing),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn configured_helper_path_wins() {
        let cfg = AuthConfig {
            helper_path: Some(PathBuf::from("/opt/tether/bin/tether-askpass")),
            ..AuthConfig::default()
        };
        assert_eq!(
            cfg.effective_helper_path(),
            PathBuf::from("/opt/tether/bin/tether-askpass")
        );
        let default = AuthConfig::default().effective_helper_path();
        assert!(default.ends_with(HELPER_BINARY_NAME));
    }
}
