//! Daemon bootstrap: command line, version info, and shutdown ordering for tetherd.

use std::fmt;
use std::path::PathBuf;

use clap::Parser;

use tether_core::config::{Config, ConfigError};
use tether_core::logging::LoggingConfig;

/// Parsed `tetherd` command line. Every flag overrides the config file.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "tetherd", about = "Supervise a local agent server and broker its auth prompts")]
pub struct DaemonArgs {
    /// Path to a TOML config file.
    #[arg(long, env = "TETHER_CONFIG")]
    pub config: Option<PathBuf>,
    /// Address the HTTP surface binds to.
    #[arg(long)]
    pub host: Option<String>,
    /// Port the HTTP surface binds to.
    #[arg(long)]
    pub port: Option<u16>,
    /// Path of the auth bridge socket.
    #[arg(long)]
    pub socket: Option<PathBuf>,
    #[arg(long)]
    pub log_level: Option<String>,
    #[arg(long)]
    pub log_format: Option<String>,
}

/// Build information injected at compile time or defaulting to "dev".
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub version: String,
    pub commit: String,
    pub date: String,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            version: option_env!("TETHER_VERSION")
                .unwrap_or(env!("CARGO_PKG_VERSION"))
                .to_string(),
            commit: option_env!("TETHER_COMMIT").unwrap_or("none").to_string(),
            date: option_env!("TETHER_BUILD_DATE")
                .unwrap_or("unknown")
                .to_string(),
        }
    }
}

/// Load the config file (if any), apply CLI overrides, and validate.
pub fn load_config(args: &DaemonArgs) -> Result<(Config, LoggingConfig), ConfigError> {
    let cfg = Config::load_or_default(args.config.as_deref())?;
    let resolved = build_options(args, cfg);
    resolved.0.validate()?;
    Ok(resolved)
}

/// Apply CLI overrides to a loaded config and resolve the logging setup.
pub fn build_options(args: &DaemonArgs, mut cfg: Config) -> (Config, LoggingConfig) {
    if let Some(host) = args.host.as_deref().filter(|h| !h.trim().is_empty()) {
        cfg.server.host = host.to_string();
    }
    if let Some(port) = args.port {
        cfg.server.port = port;
    }
    if let Some(socket) = &args.socket {
        cfg.auth.socket_path = socket.clone();
    }
    let logging = LoggingConfig::resolve(
        &cfg.logging,
        args.log_level.as_deref(),
        args.log_format.as_deref(),
    );
    (cfg, logging)
}

/// Order in which daemon components are stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    HttpServer,
    AuthBridge,
    EventAggregator,
    Supervisor,
}

impl ShutdownPhase {
    pub fn ordered() -> &'static [ShutdownPhase] {
        &[
            Self::HttpServer,
            Self::AuthBridge,
            Self::EventAggregator,
            Self::Supervisor,
        ]
    }
}

impl fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::HttpServer => "http server",
            Self::AuthBridge => "auth bridge",
            Self::EventAggregator => "event aggregator",
            Self::Supervisor => "supervised process",
        };
        f.write_str(name)
    }
}
