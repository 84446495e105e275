//! Component wiring and the daemon run loop.

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tether_core::config::{Config, ConfigError};

use crate::auth::{AuthBroker, BridgeConfig, BridgeError, IpcBridge, PendingRequests};
use crate::bootstrap::ShutdownPhase;
use crate::events::{Aggregator, AggregatorConfig, HttpEventSource};
use crate::proxy::Proxy;
use crate::routes::{self, AppState};
use crate::supervisor::{
    default_command, CommandBuilder, HttpProbe, ReadinessProbe, Supervisor, SupervisorConfig,
};

/// How long in-flight responses may drain after shutdown begins.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("http server failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A fully wired daemon whose bridge socket is already bound.
pub struct Daemon {
    config: Config,
    supervisor: Supervisor,
    proxy: Proxy,
    aggregator: Aggregator,
    broker: AuthBroker,
    bridge: IpcBridge,
}

impl Daemon {
    /// Wire every component from `config`. Must run inside a tokio runtime.
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        let probe = Arc::new(HttpProbe::new(
            config.agent.health_path.clone(),
            config.agent.probe_timeout(),
        ));
        Self::with_supervisor_parts(config, Arc::new(default_command), probe)
    }

    /// Like [`Daemon::new`] with a custom child command and readiness probe.
    pub fn with_supervisor_parts(
        config: Config,
        builder: CommandBuilder,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Result<Self, DaemonError> {
        config.validate()?;
        let global_context = config.events.global_context.clone();

        let bridge_config = BridgeConfig::from(&config.auth);
        bridge_config.validate()?;
        let supervisor_config =
            SupervisorConfig::from(&config.agent).with_env(bridge_config.helper_env());
        let supervisor = Supervisor::with_parts(supervisor_config, builder, probe);
        let proxy = Proxy::new(supervisor.clone(), config.agent.connect_timeout());

        let source = Arc::new(HttpEventSource::new(
            proxy.clone(),
            &config.agent,
            global_context.clone(),
        ));
        let aggregator = Aggregator::new(AggregatorConfig::from(&config.events), source);

        let pending = PendingRequests::new();
        let broker = AuthBroker::new(
            pending.clone(),
            Arc::new(aggregator.clone()),
            global_context,
        );
        let bridge = IpcBridge::bind(bridge_config, pending, Arc::new(broker.clone()))?;

        Ok(Self {
            config,
            supervisor,
            proxy,
            aggregator,
            broker,
            bridge,
        })
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn broker(&self) -> &AuthBroker {
        &self.broker
    }

    pub fn socket_path(&self) -> PathBuf {
        self.bridge.socket_path().to_path_buf()
    }

    pub fn helper_env(&self) -> Vec<(String, String)> {
        self.bridge.helper_env()
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            supervisor: self.supervisor.clone(),
            proxy: self.proxy.clone(),
            aggregator: self.aggregator.clone(),
            broker: self.broker.clone(),
            api_prefix: self.config.server.api_prefix.clone(),
            global_context: self.config.events.global_context.clone(),
        }
    }

    /// Serve until `shutdown` fires, then stop components in order.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), DaemonError> {
        let app = routes::router(self.app_state());
        let Daemon {
            supervisor,
            aggregator,
            bridge,
            ..
        } = self;

        let bridge_token = CancellationToken::new();
        let mut bridge_task = Some(tokio::spawn(bridge.serve(bridge_token.clone())));

        let starter = supervisor.clone();
        let start_task = tokio::spawn(async move {
            match starter.start_or_recover().await {
                Ok(endpoint) => info!(url = %endpoint.base_url(), "supervised process ready"),
                Err(err) => error!(error = %err, "supervised process failed to start"),
            }
        });
        let health_task = supervisor.spawn_health_monitor();

        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "http surface listening");
        }

        // Event streams never end on their own; closing the aggregator lets
        // open SSE responses finish so the server can drain.
        let signal = {
            let shutdown = shutdown.clone();
            let aggregator = aggregator.clone();
            async move {
                shutdown.cancelled().await;
                aggregator.shutdown();
            }
        };
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .into_future();
        let drain_deadline = async {
            shutdown.cancelled().await;
            tokio::time::sleep(DRAIN_TIMEOUT).await;
        };
        let served = tokio::select! {
            res = server => res,
            _ = drain_deadline => {
                warn!(timeout_ms = DRAIN_TIMEOUT.as_millis() as u64, "abandoning in-flight responses");
                Ok(())
            }
        };

        for phase in ShutdownPhase::ordered() {
            info!(phase = %phase, "stopping");
            match phase {
                ShutdownPhase::HttpServer => {}
                ShutdownPhase::AuthBridge => {
                    bridge_token.cancel();
                    if let Some(task) = bridge_task.take() {
                        if let Err(err) = task.await {
                            warn!(error = %err, "auth bridge task failed");
                        }
                    }
                }
                ShutdownPhase::EventAggregator => aggregator.shutdown(),
                ShutdownPhase::Supervisor => {
                    if let Err(err) = supervisor.shutdown().await {
                        warn!(error = %err, "failed to stop supervised process");
                    }
                    start_task.abort();
                    health_task.abort();
                }
            }
        }
        info!("tetherd stopped");
        served.map_err(DaemonError::from)
    }
}
