use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::{BootstrapConfig, CredentialConfig, LeaseConfig};
use crate::credentials::{install_all, remove_all, CredentialState};
use crate::store::ForgeStore;
use crate::types::PodIdentity;

const SOCKET_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Another replica holds a live lease, or the store could not confirm
    /// that nobody does. Nothing was installed.
    Skipped,
    /// Credentials installed and the forging process came up.
    Ready,
    /// Credentials installed but the forging process did not come up in time.
    TimedOut,
    Cancelled,
    /// Installation failed partway and the partial install could not be
    /// removed either. The control loop finishes the removal.
    Aborted,
}

impl BootstrapOutcome {
    /// Where the credential state machine starts after this phase.
    pub fn initial_credential_state(&self) -> CredentialState {
        match self {
            BootstrapOutcome::Skipped => CredentialState::Disabled,
            // Files may be on disk; the first tick reconciles from "enabled"
            // so they are removed if this replica is not the forging one.
            BootstrapOutcome::Ready | BootstrapOutcome::TimedOut | BootstrapOutcome::Cancelled => {
                CredentialState::Enabled
            }
            BootstrapOutcome::Aborted => CredentialState::Disabling,
        }
    }
}

/// One-shot pre-loop phase: when no replica holds the lease yet, install
/// credentials so the forging process can start as a block producer, then
/// wait for its socket.
pub async fn run_bootstrap(
    config: &BootstrapConfig,
    credentials: &CredentialConfig,
    store: &ForgeStore,
    identity: &PodIdentity,
    lease: &LeaseConfig,
    clock: Arc<dyn Clock>,
    cancel: &CancellationToken,
) -> BootstrapOutcome {
    match store
        .get_lease(&identity.region, &identity.namespace, &lease.name)
        .await
    {
        Ok(Some(current)) if !current.value.is_expired(clock.now()) => {
            info!(
                holder = ?current.value.holder_identity,
                "lease already held, skipping credential bootstrap"
            );
            return BootstrapOutcome::Skipped;
        }
        Ok(_) => {}
        Err(e) => {
            warn!(error = %e, "cannot read lease, skipping credential bootstrap");
            return BootstrapOutcome::Skipped;
        }
    }

    if let Err(e) = install_all(&credentials.files, credentials.mode) {
        warn!(error = %e, "credential bootstrap failed, removing partial install");
        return match remove_all(&credentials.files) {
            Ok(()) => BootstrapOutcome::Skipped,
            Err(e) => {
                warn!(error = %e, "failed to remove partial credential install");
                BootstrapOutcome::Aborted
            }
        };
    }
    info!(socket = %config.socket_path.display(), "credentials bootstrapped, waiting for forging process");

    let wait = async {
        while !tokio::fs::try_exists(&config.socket_path)
            .await
            .unwrap_or(false)
        {
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => BootstrapOutcome::Cancelled,
        result = tokio::time::timeout(config.timeout, wait) => match result {
            Ok(()) => {
                info!("forging process ready, bootstrap complete");
                BootstrapOutcome::Ready
            }
            Err(_) => {
                warn!(timeout = ?config.timeout, "forging process not ready before bootstrap timeout");
                BootstrapOutcome::TimedOut
            }
        },
    }
}
