#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use envconfig::Envconfig;
use tempfile::TempDir;

use coordination_store::{CoordinationStore, MemoryStore};
use forge_manager::clock::ManualClock;
use forge_manager::config::{Config, ManagerConfig};
use forge_manager::credentials::CredentialState;
use forge_manager::health::HealthChecker;
use forge_manager::manager::ForgeManager;
use forge_manager::status::TickReport;
use forge_manager::store::ForgeStore;
use forge_manager::testing::{RecordingSignaler, ScriptedProbe};

pub use forge_manager::clock::Clock;

pub const TICK: Duration = Duration::from_secs(5);
pub const LEASE_DURATION: Duration = Duration::from_secs(15);
pub const PREFIX: &str = "/forge-manager/";

pub fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// Shared store and clock for a set of simulated replicas.
pub struct Sim {
    pub backend: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub dir: TempDir,
}

impl Sim {
    pub fn new() -> Self {
        Self {
            backend: Arc::new(MemoryStore::new()),
            clock: Arc::new(ManualClock::new(start_time())),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn store(&self) -> ForgeStore {
        ForgeStore::new(CoordinationStore::new(
            self.backend.clone(),
            PREFIX,
            Duration::from_secs(2),
        ))
    }

    pub fn advance(&self) {
        self.clock.advance(TICK);
    }

    pub fn advance_by(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Single-region replica.
    pub fn replica(&self, name: &str, region: &str) -> Replica {
        self.build(name, region, &[])
    }

    /// Replica taking part in multi-region arbitration for `pool1`.
    pub fn regional_replica(&self, name: &str, region: &str, priority: u32) -> Replica {
        let priority = priority.to_string();
        self.build(
            name,
            region,
            &[
                ("CLUSTER_MANAGEMENT_ENABLED", "true"),
                ("POOL_ID", "pool1"),
                ("PRIORITY", &priority),
            ],
        )
    }

    pub fn build(&self, name: &str, region: &str, extra: &[(&str, &str)]) -> Replica {
        let root = self.dir.path().join(region).join(name);
        let mut env: HashMap<String, String> = HashMap::new();
        env.insert("POD_NAME".to_string(), name.to_string());
        env.insert("POD_NAMESPACE".to_string(), "cardano".to_string());
        env.insert("REGION".to_string(), region.to_string());
        env.insert("TICK_INTERVAL_MS".to_string(), TICK.as_millis().to_string());
        env.insert(
            "LEASE_DURATION_SECS".to_string(),
            LEASE_DURATION.as_secs().to_string(),
        );
        for (key, file) in [
            ("KES_KEY", "kes.skey"),
            ("VRF_KEY", "vrf.skey"),
            ("OP_CERT", "node.cert"),
        ] {
            let source = root.join("secrets").join(file);
            std::fs::create_dir_all(source.parent().unwrap()).unwrap();
            std::fs::write(&source, format!("{name} {file}")).unwrap();
            env.insert(format!("SOURCE_{key}"), source.display().to_string());
            env.insert(
                format!("TARGET_{key}"),
                root.join("node").join(file).display().to_string(),
            );
        }
        for (key, value) in extra {
            env.insert(key.to_string(), value.to_string());
        }

        let config = Config::init_from_hashmap(&env)
            .unwrap()
            .to_manager_config()
            .unwrap();
        self.replica_from_config(config, root)
    }

    pub fn replica_from_config(&self, config: ManagerConfig, root: PathBuf) -> Replica {
        let signaler = Arc::new(RecordingSignaler::new());
        let probe = Arc::new(ScriptedProbe::new());
        let health = HealthChecker::new(
            Some(probe.clone()),
            TICK,
            config.health.failure_threshold,
            self.clock.clone(),
        );
        let manager = ForgeManager::new(
            &config,
            self.store(),
            signaler.clone(),
            self.clock.clone(),
            CredentialState::Disabled,
        )
        .unwrap()
        .with_health_checker(health);

        Replica {
            manager,
            signaler,
            probe,
            config,
            root,
            crashed: false,
            last: None,
        }
    }
}

pub struct Replica {
    pub manager: ForgeManager,
    pub signaler: Arc<RecordingSignaler>,
    pub probe: Arc<ScriptedProbe>,
    pub config: ManagerConfig,
    pub root: PathBuf,
    /// A crashed replica stops ticking; its files stay as they were.
    pub crashed: bool,
    pub last: Option<TickReport>,
}

impl Replica {
    pub async fn tick(&mut self) -> Option<&TickReport> {
        if self.crashed {
            return None;
        }
        self.last = Some(self.manager.tick().await);
        self.last.as_ref()
    }

    pub fn is_forging(&self) -> bool {
        !self.crashed && self.manager.is_forging()
    }

    pub fn name(&self) -> &str {
        &self.config.identity.name
    }

    pub fn credentials_on_disk(&self) -> bool {
        self.config
            .credentials
            .files
            .iter()
            .all(|f| f.target.exists())
    }

    pub fn node_dir(&self) -> PathBuf {
        self.root.join("node")
    }
}

/// Tick every live replica once, in order.
pub async fn tick_all(replicas: &mut [Replica]) {
    for replica in replicas.iter_mut() {
        replica.tick().await;
    }
}

/// Tick every live replica once, last to first.
pub async fn tick_all_reversed(replicas: &mut [Replica]) {
    for replica in replicas.iter_mut().rev() {
        replica.tick().await;
    }
}

pub fn forging(replicas: &[Replica]) -> Vec<String> {
    replicas
        .iter()
        .filter(|r| r.is_forging())
        .map(|r| format!("{}@{}", r.name(), r.config.identity.region))
        .collect()
}

pub fn leaders(replicas: &[Replica]) -> Vec<String> {
    replicas
        .iter()
        .filter(|r| !r.crashed && r.manager.is_leader())
        .map(|r| r.name().to_string())
        .collect()
}
