//! kubez-autoscaler - annotation-driven HorizontalPodAutoscaler controller

mod config;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kubez_autoscaler::Controller;
use kubez_common::kube_utils::create_client;
use kubez_common::leader_election::LeaderElector;
use kubez_common::telemetry::init_telemetry;

use crate::config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(cli.log_format)?;
    cli.validate()?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting kubez-autoscaler");

    let client = create_client(cli.kubeconfig.as_deref()).await?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let mut guard = match cli.leader_election_config() {
        Some(config) => {
            let elector = Arc::new(LeaderElector::new(client.clone(), config));
            tokio::select! {
                acquired = elector.acquire() => Some(acquired?),
                _ = cancel.cancelled() => {
                    info!("Shutdown requested before acquiring leadership");
                    return Ok(());
                }
            }
        }
        None => {
            warn!("Leader election disabled; run a single replica");
            None
        }
    };

    let controller = Controller::new(client, cli.controller_config());
    let mut run = tokio::spawn(controller.run(cancel.clone()));

    let result = match guard.as_mut() {
        Some(guard) => tokio::select! {
            joined = &mut run => joined,
            _ = guard.lost() => {
                error!("Leadership lost, shutting down");
                cancel.cancel();
                run.await
            }
        },
        None => run.await,
    };

    if let Some(guard) = guard {
        if let Err(e) = guard.release_leadership().await {
            warn!(error = %e, "Failed to release lease");
        }
    }

    result??;
    info!("kubez-autoscaler stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received terminate signal, initiating graceful shutdown"),
    }
}
