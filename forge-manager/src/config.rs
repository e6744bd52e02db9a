use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use coordination_store::util::validate_identifier;
use coordination_store::StoreConfig;
use envconfig::Envconfig;
use thiserror::Error;

use crate::types::{ForgeOverride, ForgeState, HealthCheckSpec, PodIdentity};

/// Upper bound on `LEASE_DURATION_SECS`. A standby waits this long after a
/// crash before taking over, so anything longer is a misconfiguration.
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(3600);

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // ── HTTP (probes, status, metrics) ──────────────────────────────
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8000")]
    pub port: u16,

    #[envconfig(default = "text")]
    pub log_format: String,

    // ── Identity ────────────────────────────────────────────────────
    pub pod_name: String,

    #[envconfig(default = "default")]
    pub pod_namespace: String,

    #[envconfig(default = "default")]
    pub region: String,

    // ── Coordination store ──────────────────────────────────────────
    #[envconfig(default = "http://localhost:2379")]
    pub etcd_endpoints: String,

    #[envconfig(default = "/forge-manager/")]
    pub etcd_prefix: String,

    #[envconfig(default = "2000")]
    pub store_timeout_ms: u64,

    // ── Loop / lease ────────────────────────────────────────────────
    #[envconfig(default = "5000")]
    pub tick_interval_ms: u64,

    #[envconfig(default = "cardano-node-leader")]
    pub lease_name: String,

    #[envconfig(default = "15")]
    pub lease_duration_secs: u64,

    #[envconfig(default = "10")]
    pub shutdown_timeout_secs: u64,

    #[envconfig(default = "false")]
    pub legacy_leader_record: bool,

    // ── Cluster (multi-region) ──────────────────────────────────────
    #[envconfig(default = "false")]
    pub cluster_management_enabled: bool,

    #[envconfig(default = "true")]
    pub cluster_record_auto_create: bool,

    #[envconfig(default = "mainnet")]
    pub network_name: String,

    #[envconfig(default = "764824073")]
    pub network_magic: u32,

    pub pool_id: Option<String>,

    #[envconfig(default = "1")]
    pub priority: u32,

    #[envconfig(default = "PriorityBased")]
    pub forge_state: String,

    #[envconfig(default = "60")]
    pub sibling_staleness_secs: u64,

    #[envconfig(default = "false")]
    pub override_enabled: bool,

    pub override_reason: Option<String>,

    /// RFC 3339 timestamp.
    pub override_expires_at: Option<String>,

    pub override_forced_priority: Option<u32>,

    pub override_forced_state: Option<String>,

    // ── Health check ────────────────────────────────────────────────
    pub health_check_endpoint: Option<String>,

    #[envconfig(default = "30")]
    pub health_check_interval_secs: u64,

    #[envconfig(default = "3")]
    pub health_check_timeout_secs: u64,

    #[envconfig(default = "3")]
    pub health_check_failure_threshold: u32,

    // ── Credentials ─────────────────────────────────────────────────
    #[envconfig(default = "/secrets/kes.skey")]
    pub source_kes_key: String,

    #[envconfig(default = "/secrets/vrf.skey")]
    pub source_vrf_key: String,

    #[envconfig(default = "/secrets/node.cert")]
    pub source_op_cert: String,

    #[envconfig(default = "/opt/cardano/secrets/kes.skey")]
    pub target_kes_key: String,

    #[envconfig(default = "/opt/cardano/secrets/vrf.skey")]
    pub target_vrf_key: String,

    #[envconfig(default = "/opt/cardano/secrets/node.cert")]
    pub target_op_cert: String,

    /// Octal permission bits for installed credentials.
    #[envconfig(default = "400")]
    pub credential_file_mode: String,

    // ── Forging process ─────────────────────────────────────────────
    #[envconfig(default = "cardano-node")]
    pub forging_process_name: String,

    #[envconfig(default = "false")]
    pub bootstrap_enabled: bool,

    #[envconfig(default = "/ipc/node.socket")]
    pub node_socket_path: String,

    #[envconfig(default = "600")]
    pub bootstrap_timeout_secs: u64,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error(
        "tick interval {tick:?} must be at most a third of the lease duration {lease:?} \
         so a single missed tick does not lose the lease"
    )]
    RenewRatio { tick: Duration, lease: Duration },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn identifier(field: &'static str, value: &str) -> Result<(), ConfigError> {
    validate_identifier(value).map_err(|e| invalid(field, e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    KesKey,
    VrfKey,
    OperationalCertificate,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::KesKey => "kes_key",
            CredentialKind::VrfKey => "vrf_key",
            CredentialKind::OperationalCertificate => "op_cert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialFile {
    pub kind: CredentialKind,
    pub source: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub files: Vec<CredentialFile>,
    pub mode: u32,
}

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub name: String,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub endpoint: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
}

impl HealthCheckConfig {
    pub fn spec(&self) -> HealthCheckSpec {
        HealthCheckSpec {
            endpoint: self.endpoint.clone(),
            interval_seconds: self.interval.as_secs(),
            timeout_seconds: self.timeout.as_secs(),
            failure_threshold: self.failure_threshold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub enabled: bool,
    pub auto_create: bool,
    pub network_name: String,
    pub network_magic: u32,
    pub pool_id: String,
    pub priority: u32,
    pub forge_state: ForgeState,
    pub sibling_staleness: Duration,
    pub initial_override: ForgeOverride,
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub socket_path: PathBuf,
    pub timeout: Duration,
}

/// Immutable configuration built once at startup and handed to every
/// component constructor.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub identity: PodIdentity,
    pub tick_interval: Duration,
    pub shutdown_timeout: Duration,
    pub store: StoreConfig,
    pub lease: LeaseConfig,
    pub cluster: ClusterConfig,
    pub health: HealthCheckConfig,
    pub credentials: CredentialConfig,
    pub forging_process_name: String,
    pub bootstrap: Option<BootstrapConfig>,
    pub legacy_leader_record: bool,
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn etcd_endpoint_list(&self) -> Vec<String> {
        self.etcd_endpoints
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Lease name, scoped by network and pool when running multi-tenant.
    pub fn scoped_lease_name(&self) -> String {
        match self.pool_id.as_deref().filter(|p| !p.is_empty()) {
            Some(pool_id) => {
                let pool_short: String = pool_id.chars().take(8).collect();
                format!("{}-{}-{}", self.lease_name, self.network_name, pool_short)
            }
            None => self.lease_name.clone(),
        }
    }

    /// Validate everything and produce the immutable runtime configuration.
    /// Any error here is a startup failure.
    pub fn to_manager_config(&self) -> Result<ManagerConfig, ConfigError> {
        identifier("POD_NAMESPACE", &self.pod_namespace)?;
        identifier("POD_NAME", &self.pod_name)?;
        identifier("REGION", &self.region)?;
        identifier("NETWORK_NAME", &self.network_name)?;
        let lease_name = self.scoped_lease_name();
        identifier("LEASE_NAME", &lease_name)?;

        let pool_id = self
            .pool_id
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "default".to_string());
        identifier("POOL_ID", &pool_id)?;

        let endpoints = self.etcd_endpoint_list();
        if endpoints.is_empty() {
            return Err(invalid("ETCD_ENDPOINTS", "at least one endpoint is required"));
        }
        if !self.etcd_prefix.starts_with('/') || !self.etcd_prefix.ends_with('/') {
            return Err(invalid("ETCD_PREFIX", "must start and end with '/'"));
        }

        let tick_interval = Duration::from_millis(self.tick_interval_ms);
        let lease_duration = Duration::from_secs(self.lease_duration_secs);
        let store_timeout = Duration::from_millis(self.store_timeout_ms);
        if tick_interval.is_zero() {
            return Err(invalid("TICK_INTERVAL_MS", "must be positive"));
        }
        if lease_duration > MAX_LEASE_DURATION {
            return Err(invalid(
                "LEASE_DURATION_SECS",
                format!("must be at most {}", MAX_LEASE_DURATION.as_secs()),
            ));
        }
        if tick_interval
            .checked_mul(3)
            .map_or(true, |renew_window| renew_window > lease_duration)
        {
            return Err(ConfigError::RenewRatio {
                tick: tick_interval,
                lease: lease_duration,
            });
        }
        if store_timeout.is_zero() || store_timeout >= tick_interval {
            return Err(invalid(
                "STORE_TIMEOUT_MS",
                "must be positive and shorter than the tick interval",
            ));
        }

        let health = HealthCheckConfig {
            endpoint: self
                .health_check_endpoint
                .clone()
                .filter(|e| !e.trim().is_empty()),
            interval: Duration::from_secs(self.health_check_interval_secs),
            timeout: Duration::from_secs(self.health_check_timeout_secs),
            failure_threshold: self.health_check_failure_threshold,
        };
        if health.failure_threshold == 0 {
            return Err(invalid("HEALTH_CHECK_FAILURE_THRESHOLD", "must be at least 1"));
        }
        if health.endpoint.is_some() && (health.timeout.is_zero() || health.timeout >= tick_interval)
        {
            return Err(invalid(
                "HEALTH_CHECK_TIMEOUT_SECS",
                "must be positive and shorter than the tick interval",
            ));
        }

        let forge_state: ForgeState = self
            .forge_state
            .parse()
            .map_err(|e: String| invalid("FORGE_STATE", e))?;

        let initial_override = self.initial_override()?;

        let mode = u32::from_str_radix(self.credential_file_mode.trim(), 8)
            .map_err(|e| invalid("CREDENTIAL_FILE_MODE", e.to_string()))?;
        if mode & 0o077 != 0 || mode & 0o400 == 0 {
            return Err(invalid(
                "CREDENTIAL_FILE_MODE",
                format!("{mode:o} must be owner-readable and grant nothing to group or other"),
            ));
        }

        let files = vec![
            CredentialFile {
                kind: CredentialKind::KesKey,
                source: PathBuf::from(&self.source_kes_key),
                target: PathBuf::from(&self.target_kes_key),
            },
            CredentialFile {
                kind: CredentialKind::VrfKey,
                source: PathBuf::from(&self.source_vrf_key),
                target: PathBuf::from(&self.target_vrf_key),
            },
            CredentialFile {
                kind: CredentialKind::OperationalCertificate,
                source: PathBuf::from(&self.source_op_cert),
                target: PathBuf::from(&self.target_op_cert),
            },
        ];
        for file in &files {
            if file.source == file.target {
                return Err(invalid(
                    "credential paths",
                    format!(
                        "{} source and target are both {}",
                        file.kind.as_str(),
                        file.source.display()
                    ),
                ));
            }
            if file.target.file_name().is_none() || file.target.parent().is_none() {
                return Err(invalid(
                    "credential paths",
                    format!(
                        "{} target {} is not a file path",
                        file.kind.as_str(),
                        file.target.display()
                    ),
                ));
            }
        }

        let bootstrap = self.bootstrap_enabled.then(|| BootstrapConfig {
            socket_path: PathBuf::from(&self.node_socket_path),
            timeout: Duration::from_secs(self.bootstrap_timeout_secs),
        });

        Ok(ManagerConfig {
            identity: PodIdentity {
                namespace: self.pod_namespace.clone(),
                name: self.pod_name.clone(),
                region: self.region.clone(),
            },
            tick_interval,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            store: StoreConfig {
                endpoints,
                prefix: self.etcd_prefix.clone(),
                timeout: store_timeout,
            },
            lease: LeaseConfig {
                name: lease_name,
                duration: lease_duration,
            },
            cluster: ClusterConfig {
                enabled: self.cluster_management_enabled,
                auto_create: self.cluster_record_auto_create,
                network_name: self.network_name.clone(),
                network_magic: self.network_magic,
                pool_id,
                priority: self.priority,
                forge_state,
                sibling_staleness: Duration::from_secs(self.sibling_staleness_secs),
                initial_override,
            },
            health,
            credentials: CredentialConfig { files, mode },
            forging_process_name: self.forging_process_name.clone(),
            bootstrap,
            legacy_leader_record: self.legacy_leader_record,
        })
    }

    fn initial_override(&self) -> Result<ForgeOverride, ConfigError> {
        let expires_at = self
            .override_expires_at
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                DateTime::parse_from_rfc3339(s.trim())
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| invalid("OVERRIDE_EXPIRES_AT", e.to_string()))
            })
            .transpose()?;
        let forced_state = self
            .override_forced_state
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<ForgeState>().map_err(|e| invalid("OVERRIDE_FORCED_STATE", e)))
            .transpose()?;

        if self.override_enabled && forced_state.is_none() && self.override_forced_priority.is_none()
        {
            return Err(invalid(
                "OVERRIDE_ENABLED",
                "an enabled override needs OVERRIDE_FORCED_STATE or OVERRIDE_FORCED_PRIORITY",
            ));
        }

        Ok(ForgeOverride {
            enabled: self.override_enabled,
            reason: self.override_reason.clone(),
            expires_at,
            forced_priority: self.override_forced_priority,
            forced_state,
        })
    }
}
