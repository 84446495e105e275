//! Unix socket endpoint that helper programs block on.
//!
//! Each connection carries exactly one prompt. The connection task waits on
//! the prompt's one-shot slot, its deadline, and the helper's side of the
//! socket, whichever comes first, and writes the resulting decision back.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::config::AuthConfig;
use tether_core::protocol::{HelperRequest, HelperResponse, ProtocolError, SOCKET_ENV};

use super::pending::{PendingPrompt, PendingRequests, Settlement};

/// Receives lifecycle notifications for every prompt the bridge handles.
pub trait AuthObserver: Send + Sync {
    fn prompt_created(&self, prompt: &PendingPrompt);
    fn prompt_settled(&self, prompt: &PendingPrompt, settlement: &Settlement);
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid bridge configuration: {0}")]
    Config(String),
    #[error("failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub socket_path: PathBuf,
    pub decision_timeout: Duration,
    pub read_timeout: Duration,
    pub max_request_bytes: usize,
    pub helper_path: PathBuf,
}

impl From<&AuthConfig> for BridgeConfig {
    fn from(cfg: &AuthConfig) -> Self {
        Self {
            socket_path: cfg.socket_path.clone(),
            decision_timeout: cfg.decision_timeout(),
            read_timeout: cfg.read_timeout(),
            max_request_bytes: cfg.max_request_bytes,
            helper_path: cfg.effective_helper_path(),
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(BridgeError::Config("socket path is empty".into()));
        }
        if self.decision_timeout.is_zero() {
            return Err(BridgeError::Config(
                "decision timeout must be greater than zero".into(),
            ));
        }
        if self.read_timeout.is_zero() {
            return Err(BridgeError::Config(
                "read timeout must be greater than zero".into(),
            ));
        }
        if self.max_request_bytes == 0 {
            return Err(BridgeError::Config(
                "max request size must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Environment that routes git and ssh prompts of a child to this bridge.
    pub fn helper_env(&self) -> Vec<(String, String)> {
        let helper = self.helper_path.display().to_string();
        vec![
            ("GIT_ASKPASS".to_string(), helper.clone()),
            ("SSH_ASKPASS".to_string(), helper),
            ("SSH_ASKPASS_REQUIRE".to_string(), "force".to_string()),
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
            (
                SOCKET_ENV.to_string(),
                self.socket_path.display().to_string(),
            ),
        ]
    }
}

pub struct IpcBridge {
    config: BridgeConfig,
    listener: UnixListener,
    pending: PendingRequests,
    observer: Arc<dyn AuthObserver>,
}

impl IpcBridge {
    /// Validate the configuration and bind the socket. Must run inside a tokio runtime.
    pub fn bind(
        config: BridgeConfig,
        pending: PendingRequests,
        observer: Arc<dyn AuthObserver>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;
        let path = &config.socket_path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        remove_stale_socket(path)?;
        let listener = UnixListener::bind(path).map_err(|source| BridgeError::Bind {
            path: path.clone(),
            source,
        })?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        info!(path = %path.display(), "auth bridge listening");
        Ok(Self {
            config,
            listener,
            pending,
            observer,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    pub fn helper_env(&self) -> Vec<(String, String)> {
        self.config.helper_env()
    }

    /// Accept helpers until `shutdown` fires, then remove the socket file.
    ///
    /// Prompts still waiting at shutdown are cancelled and their helpers
    /// receive the fail-closed decision.
    pub async fn serve(self, shutdown: CancellationToken) {
        let shared = Arc::new(ConnectionContext {
            config: self.config.clone(),
            pending: self.pending.clone(),
            observer: Arc::clone(&self.observer),
            shutdown: shutdown.clone(),
        });
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let shared = Arc::clone(&shared);
                        tokio::spawn(async move {
                            if let Err(err) = shared.handle(stream).await {
                                debug!(error = %err, "helper connection ended");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "auth bridge accept failed"),
                },
            }
        }
        drop(self.listener);
        if let Err(err) = remove_stale_socket(&self.config.socket_path) {
            warn!(error = %err, "failed to remove auth bridge socket");
        }
        info!("auth bridge stopped");
    }
}

fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

struct ConnectionContext {
    config: BridgeConfig,
    pending: PendingRequests,
    observer: Arc<dyn AuthObserver>,
    shutdown: CancellationToken,
}

enum Wake {
    Slot(Option<Settlement>),
    Deadline,
    HelperGone,
    Shutdown,
}

impl ConnectionContext {
    async fn handle(&self, stream: UnixStream) -> std::io::Result<()> {
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let line = match self.read_request(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(()),
            Err(err) => {
                warn!(error = %err, "rejecting helper request");
                writer
                    .write_all(HelperResponse::error(err.to_string()).to_line().as_bytes())
                    .await?;
                return writer.shutdown().await;
            }
        };
        let (prompt, context) =
            match HelperRequest::parse_line(&line).and_then(HelperRequest::into_prompt) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(error = %err, "rejecting helper request");
                    writer
                        .write_all(HelperResponse::error(err.to_string()).to_line().as_bytes())
                        .await?;
                    return writer.shutdown().await;
                }
            };

        let summary = prompt.summary();
        let (view, mut rx) = self
            .pending
            .create(prompt, context, self.config.decision_timeout);
        info!(correlation_id = %view.id, kind = %view.kind, prompt = %summary, "auth prompt pending");
        self.observer.prompt_created(&view);

        let wake = tokio::select! {
            biased;
            settled = &mut rx => Wake::Slot(settled.ok()),
            _ = tokio::time::sleep(self.config.decision_timeout) => Wake::Deadline,
            _ = helper_closed(&mut reader) => Wake::HelperGone,
            _ = self.shutdown.cancelled() => Wake::Shutdown,
        };
        let settlement = match wake {
            Wake::Slot(Some(settlement)) => settlement,
            Wake::Slot(None) => Settlement::Cancelled,
            Wake::Deadline => self.settle_or_take(&view.id, rx, Settlement::TimedOut).await,
            Wake::HelperGone | Wake::Shutdown => {
                self.settle_or_take(&view.id, rx, Settlement::Cancelled).await
            }
        };

        let decision = settlement.decision(view.kind);
        match &settlement {
            Settlement::Decided(_) => {
                info!(correlation_id = %view.id, decision = decision.decision.as_str(), "auth prompt resolved")
            }
            Settlement::TimedOut => {
                warn!(correlation_id = %view.id, "auth prompt timed out; denying")
            }
            Settlement::Cancelled => {
                info!(correlation_id = %view.id, "auth prompt cancelled")
            }
        }
        self.observer.prompt_settled(&view, &settlement);

        writer
            .write_all(HelperResponse::decided(&view.id, &decision).to_line().as_bytes())
            .await?;
        writer.shutdown().await
    }

    /// Settle with `fallback` unless a decision got there first.
    async fn settle_or_take(
        &self,
        id: &str,
        rx: tokio::sync::oneshot::Receiver<Settlement>,
        fallback: Settlement,
    ) -> Settlement {
        let won = match fallback {
            Settlement::TimedOut => self.pending.expire(id),
            _ => self.pending.cancel(id),
        };
        match rx.await {
            Ok(settlement) => settlement,
            Err(_) if won => fallback,
            Err(_) => Settlement::Cancelled,
        }
    }

    async fn read_request(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
    ) -> Result<Option<String>, ProtocolError> {
        let limit = self.config.max_request_bytes;
        let mut raw = Vec::new();
        let read = tokio::time::timeout(
            self.config.read_timeout,
            (&mut *reader).take(limit as u64 + 1).read_until(b'\n', &mut raw),
        )
        .await
        .map_err(|_| ProtocolError::BadRequest("timed out waiting for request".into()))?
        .map_err(|err| ProtocolError::BadRequest(format!("read failed: {err}")))?;

        if read == 0 {
            return Ok(None);
        }
        if raw.last() == Some(&b'\n') {
            raw.pop();
        }
        if raw.len() > limit {
            return Err(ProtocolError::BadRequest(format!(
                "request exceeds {limit} bytes"
            )));
        }
        String::from_utf8(raw)
            .map(Some)
            .map_err(|_| ProtocolError::BadRequest("request is not valid UTF-8".into()))
    }
}

/// Resolves once the helper closes its side of the connection.
async fn helper_closed(reader: &mut BufReader<OwnedReadHalf>) {
    let mut buf = [0u8; 256];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BridgeConfig {
        BridgeConfig {
            socket_path: PathBuf::from("/tmp/tether-test.sock"),
            decision_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(5),
            max_request_bytes: 1024,
            helper_path: PathBuf::from("/opt/tether/bin/tether-askpass"),
        }
    }

    #[test]
    fn zero_deadline_is_a_configuration_error() {
        let mut cfg = config();
        cfg.decision_timeout = Duration::ZERO;
        assert!(matches!(cfg.validate(), Err(BridgeError::Config(_))));
        assert!(config().validate().is_ok());
    }

    #[test]
    fn helper_env_points_git_and_ssh_at_the_helper() {
        let env = config().helper_env();
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("GIT_ASKPASS"), Some("/opt/tether/bin/tether-askpass"));
        assert_eq!(get("SSH_ASKPASS"), Some("/opt/tether/bin/tether-askpass"));
        assert_eq!(get("SSH_ASKPASS_REQUIRE"), Some("force"));
        assert_eq!(get("GIT_TERMINAL_PROMPT"), Some("0"));
        assert_eq!(get(SOCKET_ENV), Some("/tmp/tether-test.sock"));
    }
}
