//! kubeterm: web terminal and log viewer for Kubernetes containers.

use anyhow::{Context, Result};
use clap::Parser;
use kt_core::shutdown::ShutdownSignal;
use kt_daemon::backend::Backend;
use kt_daemon::cli::Cli;
use kt_daemon::daemon::{Daemon, LeadershipLost};
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Cli::parse().into_config()?;
    kt_telemetry::logging::init_logging("kubeterm", &config.logging)
        .context("failed to initialise logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.backend.kind,
        addr = %config.server.listen_addr(),
        "kubeterm starting"
    );

    let backend = Backend::from_config(&config)?;
    let daemon = Daemon::new(config, backend);
    info!(identity = daemon.identity(), "contender identity");

    tokio::spawn(wait_for_signal(daemon.shutdown_handle()));

    match daemon.run().await {
        Ok(()) => Ok(()),
        Err(e) if e.is::<LeadershipLost>() => {
            error!("leadership lost, exiting");
            std::process::exit(1);
        }
        Err(e) => Err(e),
    }
}

/// Trigger shutdown on ctrl-c or SIGTERM.
async fn wait_for_signal(shutdown: ShutdownSignal) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
    shutdown.trigger();
}
