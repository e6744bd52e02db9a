use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Static description of the running replica.
///
/// The holder identity (`namespace/name`) is what gets stamped on the lease and
/// on cluster record updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodIdentity {
    pub namespace: String,
    pub name: String,
    pub region: String,
}

impl PodIdentity {
    pub fn holder_identity(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.namespace, self.name, self.region)
    }
}

/// Per-deployment exclusive lease, stored under
/// `{prefix}leases/{region}/{namespace}/{name}`.
///
/// Ownership only changes through a versioned conditional write, so two
/// replicas can never both succeed in stamping themselves as holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub holder_identity: Option<String>,
    pub lease_duration_seconds: i64,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease_transitions: u32,
}

impl LeaseRecord {
    /// `None` when the expiry is past the representable range.
    fn expiry_after(&self, renewed: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Duration::try_seconds(self.lease_duration_seconds)
            .and_then(|duration| renewed.checked_add_signed(duration))
    }

    /// A lease with no holder, or one not renewed within its duration, is up
    /// for grabs. A held lease whose expiry cannot be computed is treated as
    /// live.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.holder_identity.is_none() {
            return true;
        }
        let Some(renewed) = self.renew_time else {
            return true;
        };
        match self.expiry_after(renewed) {
            Some(expires_at) => now > expires_at,
            None => false,
        }
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder_identity.as_deref() == Some(identity)
    }
}

/// Reduced single-region schema, kept alongside `ClusterRecord` while
/// deployments migrate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyLeaderRecord {
    pub holder_identity: String,
    pub last_renew_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForgeState {
    Enabled,
    Disabled,
    PriorityBased,
    Manual,
}

impl FromStr for ForgeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "enabled" => Ok(ForgeState::Enabled),
            "disabled" => Ok(ForgeState::Disabled),
            "prioritybased" | "priority-based" | "priority_based" => Ok(ForgeState::PriorityBased),
            "manual" => Ok(ForgeState::Manual),
            _ => Err(format!(
                "unknown forge state: {s}, must be one of Enabled, Disabled, PriorityBased, Manual"
            )),
        }
    }
}

/// The arbitration value between regions. Lower wins; `Ineligible` never wins.
///
/// Serialized as a nullable integer, `null` meaning ineligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Option<u32>", into = "Option<u32>")]
pub enum EffectivePriority {
    Finite(u32),
    Ineligible,
}

impl EffectivePriority {
    pub fn is_eligible(&self) -> bool {
        matches!(self, EffectivePriority::Finite(_))
    }

    /// Numeric form for gauges; ineligible is reported as -1.
    pub fn as_gauge(&self) -> f64 {
        match self {
            EffectivePriority::Finite(p) => f64::from(*p),
            EffectivePriority::Ineligible => -1.0,
        }
    }
}

impl From<Option<u32>> for EffectivePriority {
    fn from(value: Option<u32>) -> Self {
        value.map_or(EffectivePriority::Ineligible, EffectivePriority::Finite)
    }
}

impl From<EffectivePriority> for Option<u32> {
    fn from(value: EffectivePriority) -> Self {
        match value {
            EffectivePriority::Finite(p) => Some(p),
            EffectivePriority::Ineligible => None,
        }
    }
}

impl fmt::Display for EffectivePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffectivePriority::Finite(p) => write!(f, "{p}"),
            EffectivePriority::Ineligible => write!(f, "ineligible"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    pub endpoint: Option<String>,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    pub failure_threshold: u32,
}

/// Operator-supplied, time-bounded forced value that bypasses health and
/// priority arbitration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgeOverride {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub forced_priority: Option<u32>,
    #[serde(default)]
    pub forced_state: Option<ForgeState>,
}

impl ForgeOverride {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub effective_priority: EffectivePriority,
    pub health_status: HealthStatus,
    pub last_transition_time: Option<DateTime<Utc>>,
    pub active_leader: Option<String>,
    #[serde(default)]
    pub forging_enabled: bool,
    pub last_heartbeat_time: DateTime<Utc>,
    pub observed_by: String,
}

/// Cluster-scoped coordination record, one per network + pool + region.
///
/// Stored under `{prefix}clusters/{network}/{pool_id}/{region}`. Operators own
/// the spec fields (priority, forge state, override); the regional leader owns
/// `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRecord {
    pub network_name: String,
    pub pool_id: String,
    pub region: String,
    pub priority: u32,
    pub forge_state: ForgeState,
    pub health_check: HealthCheckSpec,
    #[serde(default, rename = "override")]
    pub forge_override: ForgeOverride,
    #[serde(default)]
    pub status: Option<ClusterStatus>,
}

impl ClusterRecord {
    /// The last effective priority this region reported, treating a missing
    /// or stale report as ineligible.
    pub fn reported_priority(&self, now: DateTime<Utc>, staleness: Duration) -> EffectivePriority {
        match &self.status {
            Some(status) if now - status.last_heartbeat_time <= staleness => {
                status.effective_priority
            }
            _ => EffectivePriority::Ineligible,
        }
    }
}

/// Explicit patch of the server-side status of a `ClusterRecord`.
///
/// Applied to a freshly read record and written back under the version it was
/// read at; a concurrent operator edit makes the write fail and the patch is
/// recomputed on the next tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStatusPatch {
    pub effective_priority: EffectivePriority,
    pub health_status: HealthStatus,
    pub active_leader: Option<String>,
    pub forging_enabled: bool,
    pub observed_by: String,
    pub now: DateTime<Utc>,
}

impl ClusterStatusPatch {
    /// Apply to `record`. Returns true if a transition (priority or forging
    /// change) was recorded.
    pub fn apply(&self, record: &mut ClusterRecord) -> bool {
        let previous = record.status.take();
        let transitioned = match &previous {
            Some(prev) => {
                prev.effective_priority != self.effective_priority
                    || prev.forging_enabled != self.forging_enabled
            }
            None => true,
        };
        let last_transition_time = if transitioned {
            Some(self.now)
        } else {
            previous.and_then(|prev| prev.last_transition_time)
        };

        record.status = Some(ClusterStatus {
            effective_priority: self.effective_priority,
            health_status: self.health_status,
            last_transition_time,
            active_leader: self.active_leader.clone(),
            forging_enabled: self.forging_enabled,
            last_heartbeat_time: self.now,
            observed_by: self.observed_by.clone(),
        });
        transitioned
    }
}
