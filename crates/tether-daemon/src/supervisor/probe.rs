use std::time::Duration;

use async_trait::async_trait;

use super::types::Endpoint;

/// Decides whether the managed process is serving.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self, endpoint: &Endpoint) -> Result<(), String>;
}

/// `GET <health_path>` must answer 2xx.
pub struct HttpProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpProbe {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            path: path.into(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn check(&self, endpoint: &Endpoint) -> Result<(), String> {
        let resp = self
            .client
            .get(endpoint.url(&self.path))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("health check returned {}", resp.status()))
        }
    }
}
