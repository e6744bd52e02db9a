//! In-process doubles used by unit and integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::SignalError;
use crate::health::HealthProbe;
use crate::signal::{ForgeSignaler, ReloadNotice, ReloadReason};
use crate::types::{ClusterRecord, ForgeOverride, ForgeState, HealthCheckSpec};

/// Records every delivered notice instead of signalling a process.
#[derive(Debug, Default)]
pub struct RecordingSignaler {
    notices: Mutex<Vec<ReloadNotice>>,
    failing: AtomicBool,
}

impl RecordingSignaler {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every delivery fails as if the forging process were gone.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn notices(&self) -> Vec<ReloadNotice> {
        self.notices.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reasons(&self) -> Vec<ReloadReason> {
        self.notices().into_iter().map(|n| n.reason).collect()
    }

    pub fn count(&self) -> usize {
        self.notices.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl ForgeSignaler for RecordingSignaler {
    async fn notify(&self, notice: ReloadNotice) -> Result<usize, SignalError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SignalError::ProcessNotFound("recording".to_string()));
        }
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notice);
        Ok(1)
    }
}

/// Health probe that replays a queued script, then reports healthy, or a
/// fixed outcome when one is set.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    script: Mutex<VecDeque<bool>>,
    fixed: Mutex<Option<bool>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_failures(&self, n: usize) {
        self.push(false, n);
    }

    pub fn push_successes(&self, n: usize) {
        self.push(true, n);
    }

    fn push(&self, healthy: bool, n: usize) {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        script.extend(std::iter::repeat(healthy).take(n));
    }

    /// Report `healthy` on every call until changed. Clears any script.
    pub fn set_healthy(&self, healthy: bool) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self.fixed.lock().unwrap_or_else(|e| e.into_inner()) = Some(healthy);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let fixed = *self.fixed.lock().unwrap_or_else(|e| e.into_inner());
        if next.or(fixed).unwrap_or(true) {
            Ok(())
        } else {
            Err("scripted failure".to_string())
        }
    }
}

/// A `mainnet`/`pool1` record for `region` with no status yet.
pub fn cluster_record(region: &str, priority: u32) -> ClusterRecord {
    ClusterRecord {
        network_name: "mainnet".to_string(),
        pool_id: "pool1".to_string(),
        region: region.to_string(),
        priority,
        forge_state: ForgeState::PriorityBased,
        health_check: HealthCheckSpec {
            endpoint: None,
            interval_seconds: 30,
            timeout_seconds: 3,
            failure_threshold: 3,
        },
        forge_override: ForgeOverride::default(),
        status: None,
    }
}
