use std::sync::Arc;
use std::time::Duration;

use coordination_store::CoordinationStore;
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use forge_manager::bootstrap::run_bootstrap;
use forge_manager::clock::{Clock, SystemClock};
use forge_manager::config::{Config, CredentialConfig, ManagerConfig};
use forge_manager::credentials::{remove_all, CredentialState};
use forge_manager::http;
use forge_manager::manager::ForgeManager;
use forge_manager::metrics::setup_metrics_routes;
use forge_manager::signal::ProcessSignaler;
use forge_manager::status::StatusBoard;
use forge_manager::store::ForgeStore;

fn init_tracing(log_format: &str) {
    let base_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);
    let log_layer = if log_format.eq_ignore_ascii_case("json") {
        base_layer.json().boxed()
    } else {
        base_layer.boxed()
    };

    tracing_subscriber::registry()
        .with(log_layer)
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

async fn shutdown_signal() -> Result<()> {
    let mut term = signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("shutting down gracefully...");
    Ok(())
}

/// The store may not be reachable yet when the pod starts; keep trying
/// until it is or we are asked to stop.
async fn connect_store(config: &ManagerConfig, cancel: &CancellationToken) -> Option<ForgeStore> {
    loop {
        match CoordinationStore::connect_etcd(config.store.clone()).await {
            Ok(store) => {
                info!(endpoints = ?config.store.endpoints, prefix = %config.store.prefix, "connected to coordination store");
                return Some(ForgeStore::new(store));
            }
            Err(e) => {
                warn!(error = %e, "failed to connect to coordination store, retrying");
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(config.tick_interval) => {}
        }
    }
}

/// Last resort when the control loop died without running its shutdown:
/// nothing else will take the credentials away.
fn remove_credentials_after_failure(credentials: &CredentialConfig) {
    match remove_all(&credentials.files) {
        Ok(()) => warn!("removed forging credentials after control loop failure"),
        Err(e) => error!(error = %e, "failed to remove forging credentials after control loop failure"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().wrap_err("invalid configuration")?;
    init_tracing(&config.log_format);

    let manager_config = config
        .to_manager_config()
        .wrap_err("invalid configuration")?;

    info!(
        holder = %manager_config.identity.holder_identity(),
        region = %manager_config.identity.region,
        lease = %manager_config.lease.name,
        cluster_management = manager_config.cluster.enabled,
        network = %manager_config.cluster.network_name,
        network_magic = manager_config.cluster.network_magic,
        pool_id = %manager_config.cluster.pool_id,
        "starting forge manager"
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "signal handling failed");
        }
        signal_cancel.cancel();
    });

    let board = Arc::new(StatusBoard::new(manager_config.tick_interval));
    let app = setup_metrics_routes(http::app(board.clone()))
        .wrap_err("failed to install metrics recorder")?;
    let mut http_server = tokio::spawn(http::listen(app, config.bind_address()));

    let Some(store) = connect_store(&manager_config, &cancel).await else {
        info!("shutdown requested before the store was reachable");
        return Ok(());
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let initial_credentials = match &manager_config.bootstrap {
        Some(bootstrap) => run_bootstrap(
            bootstrap,
            &manager_config.credentials,
            &store,
            &manager_config.identity,
            &manager_config.lease,
            clock.clone(),
            &cancel,
        )
        .await
        .initial_credential_state(),
        None => CredentialState::Disabled,
    };

    let signaler = Arc::new(ProcessSignaler::new(
        manager_config.forging_process_name.clone(),
    ));
    let manager = ForgeManager::new(
        &manager_config,
        store,
        signaler,
        clock,
        initial_credentials,
    )?;

    let mut control_loop = tokio::spawn(manager.run(board, cancel.clone()));

    tokio::select! {
        res = &mut control_loop => {
            if let Err(e) = res {
                error!(error = %e, "control loop panicked");
                remove_credentials_after_failure(&manager_config.credentials);
            }
        }
        res = &mut http_server => {
            error!("http server exited");
            if let Ok(Err(e)) = res {
                error!(error = %e, "server failed");
            }
            // Without probes the pod is unmanageable; stop forging and exit.
            cancel.cancel();
            let grace = manager_config.shutdown_timeout + Duration::from_secs(1);
            match tokio::time::timeout(grace, control_loop).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "control loop panicked");
                    remove_credentials_after_failure(&manager_config.credentials);
                }
                Err(_) => {
                    error!("control loop did not stop within the shutdown grace period");
                    remove_credentials_after_failure(&manager_config.credentials);
                }
            }
        }
    }

    info!("exiting");
    Ok(())
}
