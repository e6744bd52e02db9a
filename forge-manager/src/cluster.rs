use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ClusterConfig;
use crate::error::Result;
use crate::metrics;
use crate::store::ForgeStore;
use crate::types::{
    ClusterRecord, ClusterStatusPatch, EffectivePriority, ForgeState, HealthCheckSpec,
    HealthStatus, PodIdentity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMode {
    /// No cluster record: local leadership alone decides.
    SingleRegion,
    MultiRegion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterEvaluation {
    pub mode: ClusterMode,
    pub eligible: bool,
    pub effective_priority: EffectivePriority,
    /// Region currently winning arbitration, if any region is eligible.
    pub active_region: Option<String>,
    pub override_active: bool,
    pub status_written: bool,
}

impl ClusterEvaluation {
    fn single_region(priority: u32) -> Self {
        Self {
            mode: ClusterMode::SingleRegion,
            eligible: true,
            effective_priority: EffectivePriority::Finite(priority),
            active_region: None,
            override_active: false,
            status_written: false,
        }
    }
}

/// What this replica knows at evaluation time.
#[derive(Debug, Clone, Copy)]
pub struct LocalView {
    pub health_eligible: bool,
    /// Leadership as of the previous tick. Only the regional leader writes
    /// status.
    pub is_leader: bool,
    pub forging: bool,
}

/// Resolve a region's effective priority from its record.
///
/// An active override wins outright (and bypasses health); otherwise a
/// `Disabled` forge state or an ineligible health signal makes the region
/// ineligible, else the static priority applies. Returns the priority and
/// whether an override was in force.
pub fn resolve_effective_priority(
    record: &ClusterRecord,
    health_eligible: bool,
    now: DateTime<Utc>,
) -> (EffectivePriority, bool) {
    let forge_override = &record.forge_override;
    if forge_override.is_active(now) {
        let priority = if forge_override.forced_state == Some(ForgeState::Disabled) {
            EffectivePriority::Ineligible
        } else {
            EffectivePriority::Finite(forge_override.forced_priority.unwrap_or(record.priority))
        };
        return (priority, true);
    }

    let priority = if record.forge_state == ForgeState::Disabled || !health_eligible {
        EffectivePriority::Ineligible
    } else {
        EffectivePriority::Finite(record.priority)
    };
    (priority, false)
}

/// Pick the winning region: lowest effective priority, ties broken by the
/// lexically smallest region name. Ineligible regions never win.
pub fn arbitrate<'a>(
    candidates: impl IntoIterator<Item = (&'a str, EffectivePriority)>,
) -> Option<&'a str> {
    candidates
        .into_iter()
        .filter(|(_, priority)| priority.is_eligible())
        .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)))
        .map(|(region, _)| region)
}

/// Computes this region's cluster eligibility each tick and, when this
/// replica is the regional leader, publishes the region's status.
pub struct ClusterCoordinator {
    store: ForgeStore,
    identity: PodIdentity,
    holder: String,
    config: ClusterConfig,
    health_spec: HealthCheckSpec,
    clock: Arc<dyn Clock>,
}

impl ClusterCoordinator {
    pub fn new(
        store: ForgeStore,
        identity: &PodIdentity,
        config: ClusterConfig,
        health_spec: HealthCheckSpec,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            holder: identity.holder_identity(),
            identity: identity.clone(),
            config,
            health_spec,
            clock,
        }
    }

    /// The record this region starts from when none exists yet.
    pub fn default_record(&self) -> ClusterRecord {
        ClusterRecord {
            network_name: self.config.network_name.clone(),
            pool_id: self.config.pool_id.clone(),
            region: self.identity.region.clone(),
            priority: self.config.priority,
            forge_state: self.config.forge_state,
            health_check: self.health_spec.clone(),
            forge_override: self.config.initial_override.clone(),
            status: None,
        }
    }

    /// One evaluation from a fresh read. A store error means "no fresh
    /// read this tick"; the caller decides what the previous value is worth.
    pub async fn evaluate(&self, view: LocalView) -> Result<ClusterEvaluation> {
        if !self.config.enabled {
            return Ok(ClusterEvaluation::single_region(self.config.priority));
        }

        let network = self.config.network_name.as_str();
        let pool_id = self.config.pool_id.as_str();
        let region = self.identity.region.as_str();
        let now = self.clock.now();

        let (mut record, version) = match self
            .store
            .get_cluster_record(network, pool_id, region)
            .await?
        {
            Some(current) => (current.value, current.version),
            // Evaluated as if present; the regional leader creates it below.
            None if self.config.auto_create => (self.default_record(), 0),
            None => {
                debug!(network, pool_id, region, "no cluster record, single-region mode");
                return Ok(ClusterEvaluation::single_region(self.config.priority));
            }
        };

        let (effective_priority, override_active) =
            resolve_effective_priority(&record, view.health_eligible, now);

        let staleness = chrono::Duration::from_std(self.config.sibling_staleness)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
        let listing = self.store.list_cluster_records(network, pool_id).await?;
        let mut siblings: Vec<(String, EffectivePriority)> = listing
            .records
            .into_iter()
            .filter(|sibling| sibling.value.region != region)
            .map(|sibling| {
                let reported = sibling.value.reported_priority(now, staleness);
                (sibling.value.region, reported)
            })
            .collect();
        // An unreadable sibling cannot claim the pool, but it must not stop
        // the readable ones from arbitrating either.
        for malformed in listing.malformed_regions {
            if malformed != region {
                metrics::malformed_record("cluster");
                warn!(sibling = %malformed, "unreadable cluster record, treating region as ineligible");
                siblings.push((malformed, EffectivePriority::Ineligible));
            }
        }

        let active_region = arbitrate(
            std::iter::once((region, effective_priority))
                .chain(siblings.iter().map(|(r, p)| (r.as_str(), *p))),
        )
        .map(str::to_string);
        // Siblings arbitrate against what this region has published, not
        // against its live priority. Until the published status also wins,
        // some sibling may still believe it is the active region.
        let published = record.reported_priority(now, staleness);
        let announced = arbitrate(
            std::iter::once((region, published))
                .chain(siblings.iter().map(|(r, p)| (r.as_str(), *p))),
        ) == Some(region);
        let eligible = active_region.as_deref() == Some(region) && announced;
        if active_region.as_deref() == Some(region) && !announced {
            debug!(region, %published, "winning arbitration, waiting for published status to catch up");
        }

        let status_written = if view.is_leader {
            let patch = ClusterStatusPatch {
                effective_priority,
                health_status: if view.health_eligible {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Unhealthy
                },
                active_leader: Some(self.holder.clone()),
                forging_enabled: view.forging,
                observed_by: self.holder.clone(),
                now,
            };
            let transitioned = patch.apply(&mut record);
            self.write_status(&record, version, transitioned).await
        } else {
            false
        };

        Ok(ClusterEvaluation {
            mode: ClusterMode::MultiRegion,
            eligible,
            effective_priority,
            active_region,
            override_active,
            status_written,
        })
    }

    async fn write_status(&self, record: &ClusterRecord, version: i64, transitioned: bool) -> bool {
        match self.store.put_cluster_record(record, version).await {
            Ok(true) => {
                if version == 0 {
                    info!(
                        network = %record.network_name,
                        pool_id = %record.pool_id,
                        region = %record.region,
                        "created cluster record"
                    );
                } else if transitioned {
                    info!(
                        region = %record.region,
                        status = ?record.status,
                        "cluster status transitioned"
                    );
                }
                true
            }
            Ok(false) => {
                metrics::store_conflict("cluster_status");
                debug!(region = %record.region, "cluster record changed underneath us, retrying next tick");
                false
            }
            Err(e) => {
                metrics::store_error("cluster_status");
                warn!(region = %record.region, error = %e, "failed to write cluster status");
                false
            }
        }
    }
}
