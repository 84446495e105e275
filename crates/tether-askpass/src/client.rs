//! Blocking client for the daemon's auth socket.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use tether_core::protocol::{
    Decision, HelperRequest, HelperResponse, Prompt, ProtocolError, SOCKET_ENV, TIMEOUT_ENV,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("TETHER_AUTH_SOCKET is not set")]
    MissingSocket,
    #[error("invalid TETHER_ASKPASS_TIMEOUT_SECS value {0:?}")]
    InvalidTimeout(String),
    #[error("connect {path:?}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("socket io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bridge closed the connection without a response")]
    NoResponse,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Rejected(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct AuthClient {
    socket: PathBuf,
    /// Read timeout; `None` waits for as long as the bridge holds the prompt.
    timeout: Option<Duration>,
}

impl AuthClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_env() -> Result<Self, ClientError> {
        let socket = std::env::var_os(SOCKET_ENV)
            .filter(|v| !v.is_empty())
            .ok_or(ClientError::MissingSocket)?;
        let timeout = match std::env::var(TIMEOUT_ENV) {
            Ok(raw) if !raw.trim().is_empty() => {
                let secs = raw
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ClientError::InvalidTimeout(raw.clone()))?;
                Some(Duration::from_secs(secs))
            }
            _ => None,
        };
        Ok(Self::new(socket).with_timeout(timeout))
    }

    pub fn socket(&self) -> &PathBuf {
        &self.socket
    }

    /// Send one prompt and block until the bridge answers.
    pub fn request(&self, prompt: &Prompt, context: Option<String>) -> Result<Decision, ClientError> {
        let mut stream = UnixStream::connect(&self.socket).map_err(|source| ClientError::Connect {
            path: self.socket.clone(),
            source,
        })?;
        stream.set_read_timeout(self.timeout)?;

        let mut line = serde_json::to_string(&HelperRequest::new(prompt, context))
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        line.push('\n');
        stream.write_all(line.as_bytes())?;
        stream.flush()?;

        // Write side stays open: the bridge treats EOF as cancellation.
        let mut reader = BufReader::new(&stream);
        let mut response = String::new();
        let n = reader.read_line(&mut response)?;
        if n == 0 || response.trim().is_empty() {
            return Err(ClientError::NoResponse);
        }
        let response: HelperResponse = serde_json::from_str(response.trim())
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        Ok(response.into_decision()?)
    }
}
