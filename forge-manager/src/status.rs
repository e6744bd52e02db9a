use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cluster::ClusterEvaluation;
use crate::credentials::CredentialState;

/// Snapshot of one completed tick, served on `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub at: DateTime<Utc>,
    pub holder_identity: String,
    pub region: String,
    pub is_leader: bool,
    pub leadership_changed: bool,
    pub health_eligible: bool,
    pub health_consecutive_failures: u32,
    /// `None` when the cluster read failed this tick.
    pub cluster: Option<ClusterEvaluation>,
    pub cluster_eligible: bool,
    pub forge: bool,
    pub credential_state: CredentialState,
    pub credential_error: Option<String>,
}

#[derive(Debug)]
struct Inner {
    latest: Option<TickReport>,
    last_tick: Option<Instant>,
}

/// Shared between the control loop (writer) and the HTTP handlers.
#[derive(Debug)]
pub struct StatusBoard {
    inner: RwLock<Inner>,
    liveness_window: Duration,
}

impl StatusBoard {
    /// The loop counts as alive while it completes a tick at least every
    /// four tick intervals.
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                latest: None,
                last_tick: None,
            }),
            liveness_window: tick_interval * 4,
        }
    }

    pub fn record(&self, report: TickReport) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.latest = Some(report);
        inner.last_tick = Some(Instant::now());
    }

    pub fn latest(&self) -> Option<TickReport> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .latest
            .clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .latest
            .is_some()
    }

    /// Before the first tick (bootstrap may be waiting on the node) the
    /// process is considered alive.
    pub fn is_live(&self) -> bool {
        match self.inner.read().unwrap_or_else(|e| e.into_inner()).last_tick {
            Some(at) => at.elapsed() <= self.liveness_window,
            None => true,
        }
    }
}
