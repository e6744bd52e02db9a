use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::LeaseConfig;
use crate::error::Result;
use crate::metrics;
use crate::store::ForgeStore;
use crate::types::{LeaseRecord, LegacyLeaderRecord, PodIdentity};

/// Result of one acquire-or-renew attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderObservation {
    pub is_leader: bool,
    pub changed: bool,
}

/// Per-region exclusive lease over a versioned conditional write.
///
/// One attempt per tick, no retry loop. Anything short of a confirmed
/// successful write (store error, timeout, lost race) reports "not leader":
/// forging must never continue on an unverified lease.
pub struct LocalLeaderElector {
    store: ForgeStore,
    region: String,
    namespace: String,
    holder: String,
    lease_name: String,
    lease_duration: Duration,
    legacy_record: bool,
    clock: Arc<dyn Clock>,
    is_leader: bool,
}

impl LocalLeaderElector {
    pub fn new(
        store: ForgeStore,
        identity: &PodIdentity,
        lease: &LeaseConfig,
        legacy_record: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            region: identity.region.clone(),
            namespace: identity.namespace.clone(),
            holder: identity.holder_identity(),
            lease_name: lease.name.clone(),
            lease_duration: lease.duration,
            legacy_record,
            clock,
            is_leader: false,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn holder_identity(&self) -> &str {
        &self.holder
    }

    pub async fn try_acquire_or_renew(&mut self) -> LeaderObservation {
        let is_leader = match self.attempt().await {
            Ok(held) => held,
            Err(e) => {
                metrics::store_error("lease");
                warn!(lease = %self.lease_name, error = %e, "lease attempt failed, treating as not leader");
                false
            }
        };

        let changed = is_leader != self.is_leader;
        if changed {
            if is_leader {
                info!(lease = %self.lease_name, holder = %self.holder, "acquired leadership");
            } else {
                info!(lease = %self.lease_name, holder = %self.holder, "lost leadership");
            }
        }
        self.is_leader = is_leader;

        if is_leader && self.legacy_record {
            self.write_legacy_record().await;
        }

        LeaderObservation { is_leader, changed }
    }

    async fn attempt(&self) -> Result<bool> {
        let now = self.clock.now();
        let current = self
            .store
            .get_lease(&self.region, &self.namespace, &self.lease_name)
            .await?;

        let (version, next) = match current {
            None => (0, self.fresh_lease(now, 0)),
            Some(current) if current.value.is_held_by(&self.holder) => {
                let mut renewed = current.value.clone();
                renewed.renew_time = Some(now);
                renewed.lease_duration_seconds = self.duration_seconds();
                (current.version, renewed)
            }
            Some(current) if current.value.is_expired(now) => {
                debug!(
                    lease = %self.lease_name,
                    previous = ?current.value.holder_identity,
                    "lease expired, attempting takeover"
                );
                let transitions = current.value.lease_transitions.saturating_add(1);
                (current.version, self.fresh_lease(now, transitions))
            }
            Some(current) => {
                debug!(
                    lease = %self.lease_name,
                    holder = ?current.value.holder_identity,
                    "lease held elsewhere, standing by"
                );
                return Ok(false);
            }
        };

        let written = self
            .store
            .put_lease(&self.region, &self.namespace, &self.lease_name, version, &next)
            .await?;
        if !written {
            metrics::store_conflict("lease");
            debug!(lease = %self.lease_name, "lost lease race to another replica");
        }
        Ok(written)
    }

    fn fresh_lease(&self, now: DateTime<Utc>, transitions: u32) -> LeaseRecord {
        LeaseRecord {
            holder_identity: Some(self.holder.clone()),
            lease_duration_seconds: self.duration_seconds(),
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: transitions,
        }
    }

    fn duration_seconds(&self) -> i64 {
        i64::try_from(self.lease_duration.as_secs()).unwrap_or(i64::MAX)
    }

    /// Best-effort mirror of the current holder into the reduced schema.
    async fn write_legacy_record(&self) {
        let record = LegacyLeaderRecord {
            holder_identity: self.holder.clone(),
            last_renew_time: self.clock.now(),
        };
        let result = async {
            let version = self
                .store
                .get_legacy_leader(&self.region, &self.namespace, &self.lease_name)
                .await?
                .map_or(0, |current| current.version);
            self.store
                .put_legacy_leader(
                    &self.region,
                    &self.namespace,
                    &self.lease_name,
                    version,
                    &record,
                )
                .await
        }
        .await;
        match result {
            Ok(true) => {}
            Ok(false) => metrics::store_conflict("legacy_leader"),
            Err(e) => {
                metrics::store_error("legacy_leader");
                debug!(error = %e, "failed to update legacy leader record");
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for
    /// expiry. Only writes if this replica still holds the lease.
    pub async fn release(&mut self) -> Result<bool> {
        let was_leader = std::mem::replace(&mut self.is_leader, false);
        if !was_leader {
            return Ok(false);
        }

        let current = self
            .store
            .get_lease(&self.region, &self.namespace, &self.lease_name)
            .await?;
        let Some(current) = current else {
            return Ok(false);
        };
        if !current.value.is_held_by(&self.holder) {
            return Ok(false);
        }

        let mut released = current.value.clone();
        released.holder_identity = None;
        released.renew_time = None;
        let written = self
            .store
            .put_lease(
                &self.region,
                &self.namespace,
                &self.lease_name,
                current.version,
                &released,
            )
            .await?;
        if written {
            info!(lease = %self.lease_name, holder = %self.holder, "released lease");
        }
        Ok(written)
    }
}
