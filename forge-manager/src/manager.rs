use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::cluster::{ClusterCoordinator, LocalView};
use crate::config::ManagerConfig;
use crate::credentials::{CredentialManager, CredentialState, ReconcileOutcome};
use crate::decision::ForgeDecisionEngine;
use crate::error::Result;
use crate::health::HealthChecker;
use crate::leader::LocalLeaderElector;
use crate::metrics::{self, ForgeMetrics};
use crate::signal::ForgeSignaler;
use crate::status::{StatusBoard, TickReport};
use crate::store::ForgeStore;
use crate::types::PodIdentity;

const SHUTDOWN_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// The per-replica control loop: health, cluster arbitration, lease, forge
/// decision, credential reconciliation, in that order, once per tick.
pub struct ForgeManager {
    identity: PodIdentity,
    holder: String,
    tick_interval: Duration,
    shutdown_timeout: Duration,
    health: HealthChecker,
    elector: LocalLeaderElector,
    coordinator: ClusterCoordinator,
    engine: ForgeDecisionEngine,
    credentials: CredentialManager,
    metrics: ForgeMetrics,
    clock: Arc<dyn Clock>,
    ticks: u64,
}

impl ForgeManager {
    pub fn new(
        config: &ManagerConfig,
        store: ForgeStore,
        signaler: Arc<dyn ForgeSignaler>,
        clock: Arc<dyn Clock>,
        initial_credentials: CredentialState,
    ) -> Result<Self> {
        let health = HealthChecker::from_config(&config.health, clock.clone())?;
        let elector = LocalLeaderElector::new(
            store.clone(),
            &config.identity,
            &config.lease,
            config.legacy_leader_record,
            clock.clone(),
        );
        let coordinator = ClusterCoordinator::new(
            store,
            &config.identity,
            config.cluster.clone(),
            config.health.spec(),
            clock.clone(),
        );
        let credentials =
            CredentialManager::with_state(&config.credentials, signaler, initial_credentials);

        Ok(Self {
            holder: config.identity.holder_identity(),
            identity: config.identity.clone(),
            tick_interval: config.tick_interval,
            shutdown_timeout: config.shutdown_timeout,
            health,
            elector,
            coordinator,
            engine: if initial_credentials == CredentialState::Enabled {
                ForgeDecisionEngine::bootstrapped()
            } else {
                ForgeDecisionEngine::new()
            },
            credentials,
            metrics: ForgeMetrics::new(
                config.identity.name.clone(),
                config.identity.region.clone(),
            ),
            clock,
            ticks: 0,
        })
    }

    /// Swap the health checker, e.g. for a scripted probe.
    pub fn with_health_checker(mut self, health: HealthChecker) -> Self {
        self.health = health;
        self
    }

    pub fn identity(&self) -> &PodIdentity {
        &self.identity
    }

    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    pub fn credential_state(&self) -> CredentialState {
        self.credentials.state()
    }

    pub fn is_forging(&self) -> bool {
        self.credentials.is_enabled()
    }

    /// One full pass. Never fails: every error is logged, counted, and
    /// reflected in the report; the next tick retries.
    pub async fn tick(&mut self) -> TickReport {
        let started = Instant::now();
        self.ticks += 1;

        let health_eligible = self.health.poll().await;

        // Status writes are gated on the leadership confirmed last tick; the
        // lease attempt below decides this tick's forging.
        let view = LocalView {
            health_eligible,
            is_leader: self.elector.is_leader(),
            forging: self.credentials.is_enabled(),
        };
        let cluster = match self.coordinator.evaluate(view).await {
            Ok(evaluation) => Some(evaluation),
            Err(e) => {
                metrics::store_error("cluster");
                warn!(error = %e, "cluster evaluation failed, no fresh eligibility this tick");
                None
            }
        };

        let leadership = self.elector.try_acquire_or_renew().await;
        if leadership.changed {
            self.metrics.leadership_changed();
        }

        let decision = self
            .engine
            .decide(leadership.is_leader, cluster.as_ref().map(|c| c.eligible));

        let credential_error = match self.credentials.reconcile(decision.forge).await {
            Ok(ReconcileOutcome::Transitioned(state)) => {
                info!(
                    holder = %self.holder,
                    state = ?state,
                    leader = leadership.is_leader,
                    cluster_eligible = decision.cluster_eligible,
                    "forging state changed"
                );
                None
            }
            Ok(ReconcileOutcome::Unchanged) => None,
            Err(e) => {
                error!(error = %e, desired = decision.forge, "credential reconciliation failed");
                Some(e.to_string())
            }
        };

        self.metrics.set_leader(leadership.is_leader);
        self.metrics.set_forging(self.credentials.is_enabled());
        self.metrics
            .set_health_failures(self.health.consecutive_failures());
        if let Some(evaluation) = &cluster {
            self.metrics
                .set_cluster(decision.cluster_eligible, evaluation.effective_priority);
        }
        self.metrics.tick(started);

        TickReport {
            tick: self.ticks,
            at: self.clock.now(),
            holder_identity: self.holder.clone(),
            region: self.identity.region.clone(),
            is_leader: leadership.is_leader,
            leadership_changed: leadership.changed,
            health_eligible,
            health_consecutive_failures: self.health.consecutive_failures(),
            cluster,
            cluster_eligible: decision.cluster_eligible,
            forge: decision.forge,
            credential_state: self.credentials.state(),
            credential_error,
        }
    }

    /// Tick until cancelled, then shut down. A tick that overruns its
    /// interval is abandoned and the next one starts from fresh reads.
    pub async fn run(mut self, board: Arc<StatusBoard>, cancel: CancellationToken) {
        let budget = self.tick_interval;
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(holder = %self.holder, region = %self.identity.region, tick = ?budget, "control loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match tokio::time::timeout(budget, self.tick()).await {
                Ok(report) => board.record(report),
                Err(_) => warn!(budget = ?budget, "tick overran its interval and was abandoned"),
            }
        }

        self.shutdown().await;
    }

    /// Drive credentials to disabled within the shutdown deadline, then hand
    /// the lease back. If credentials could not be removed the lease is left
    /// to expire instead, so no standby starts forging alongside us.
    pub async fn shutdown(&mut self) {
        info!(holder = %self.holder, "shutting down, disabling forging");

        let credentials = &mut self.credentials;
        let disable = async {
            loop {
                match credentials.reconcile(false).await {
                    Ok(_) => break,
                    Err(e) => {
                        warn!(error = %e, "failed to disable forging during shutdown, retrying");
                        tokio::time::sleep(SHUTDOWN_RETRY_INTERVAL).await;
                    }
                }
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, disable)
            .await
            .is_err()
        {
            error!(
                timeout = ?self.shutdown_timeout,
                state = ?self.credentials.state(),
                "forging not disabled before shutdown deadline, leaving lease to expire"
            );
            return;
        }
        self.metrics.set_forging(false);

        match self.elector.release().await {
            Ok(true) => {}
            Ok(false) => info!("no lease to release"),
            Err(e) => warn!(error = %e, "failed to release lease, it will expire"),
        }
        self.metrics.set_leader(false);
    }
}
