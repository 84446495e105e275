//! Entry point for the tether daemon (`tetherd`).

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tether_core::logging::init_logging;
use tether_daemon::bootstrap::{load_config, DaemonArgs, VersionInfo};
use tether_daemon::daemon::Daemon;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = DaemonArgs::parse();
    let (config, logging) = load_config(&args).context("failed to load configuration")?;
    init_logging(&logging);

    let version = VersionInfo::default();
    info!(
        version = %version.version,
        commit = %version.commit,
        built = %version.date,
        "tetherd starting"
    );

    let bind = config.server.bind_addr();
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    let daemon = Daemon::new(config).context("failed to initialise daemon")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));
    daemon.run(listener, shutdown).await?;
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = term.recv() => info!("received SIGTERM"),
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt");
    }
    shutdown.cancel();
}
