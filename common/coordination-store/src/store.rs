use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, ConnectOptions, GetOptions, Txn, TxnOp};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};

/// A value together with the store version it was read at.
///
/// Version `0` means "absent": a conditional write against version `0` only
/// succeeds if nobody created the key in the meantime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: i64,
}

/// The single primitive everything else is built on: versioned reads plus a
/// compare-and-swap write.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>>;

    /// All keys under `prefix`, sorted by key.
    async fn list_raw(&self, prefix: &str) -> Result<Vec<(String, Versioned<Vec<u8>>)>>;

    /// Write `value` only if the key's current version equals
    /// `expected_version`. Returns `Ok(false)` when another writer got there
    /// first.
    async fn compare_and_put_raw(
        &self,
        key: &str,
        expected_version: i64,
        value: Vec<u8>,
    ) -> Result<bool>;
}

/// Result of a prefix listing. A value that does not decode is reported by
/// key instead of failing the whole listing, so one bad record cannot hide
/// its neighbours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing<T> {
    pub entries: Vec<(String, Versioned<T>)>,
    pub malformed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    /// Key prefix for all operations, e.g. "/forge-manager/".
    pub prefix: String,
    /// Upper bound on any single store round-trip.
    pub timeout: Duration,
}

/// etcd-backed `VersionedStore`.
///
/// `Client` is `Clone` (it wraps an inner `Arc`), so each method clones it.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(config.timeout)
            .with_timeout(config.timeout);
        let client = Client::connect(&config.endpoints, Some(options)).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl VersionedStore for EtcdStore {
    async fn get_raw(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>> {
        let resp = self.client.clone().get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| Versioned {
            value: kv.value().to_vec(),
            version: kv.version(),
        }))
    }

    async fn list_raw(&self, prefix: &str) -> Result<Vec<(String, Versioned<Vec<u8>>)>> {
        let options = GetOptions::new().with_prefix();
        let resp = self.client.clone().get(prefix, Some(options)).await?;
        let mut entries: Vec<_> = resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).into_owned(),
                    Versioned {
                        value: kv.value().to_vec(),
                        version: kv.version(),
                    },
                )
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn compare_and_put_raw(
        &self,
        key: &str,
        expected_version: i64,
        value: Vec<u8>,
    ) -> Result<bool> {
        let txn = Txn::new()
            .when(vec![Compare::version(
                key,
                CompareOp::Equal,
                expected_version,
            )])
            .and_then(vec![TxnOp::put(key, value, None)]);
        let resp = self.client.clone().txn(txn).await?;
        Ok(resp.succeeded())
    }
}

/// Prefixed, timeout-guarded store with typed JSON helpers.
///
/// Domain stores compose this: they own key resolution and record types, and
/// delegate the versioned reads and conditional writes here.
#[derive(Clone)]
pub struct CoordinationStore {
    backend: Arc<dyn VersionedStore>,
    prefix: String,
    timeout: Duration,
}

impl CoordinationStore {
    pub fn new(
        backend: Arc<dyn VersionedStore>,
        prefix: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            timeout,
        }
    }

    pub async fn connect_etcd(config: StoreConfig) -> Result<Self> {
        let backend = EtcdStore::connect(&config).await?;
        Ok(Self::new(Arc::new(backend), config.prefix, config.timeout))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?self.timeout, "store operation timed out");
                Err(Error::Timeout(self.timeout))
            }
        }
    }

    // ── JSON helpers ─────────────────────────────────────────────

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Versioned<T>>> {
        let raw = self.bounded(self.backend.get_raw(key)).await?;
        raw.map(|v| -> Result<Versioned<T>> {
            Ok(Versioned {
                value: serde_json::from_slice(&v.value)?,
                version: v.version,
            })
        })
        .transpose()
    }

    pub async fn list<T: DeserializeOwned>(&self, prefix: &str) -> Result<Listing<T>> {
        let raw = self.bounded(self.backend.list_raw(prefix)).await?;
        let mut listing = Listing {
            entries: Vec::with_capacity(raw.len()),
            malformed: Vec::new(),
        };
        for (key, v) in raw {
            match serde_json::from_slice(&v.value) {
                Ok(value) => listing.entries.push((
                    key,
                    Versioned {
                        value,
                        version: v.version,
                    },
                )),
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping undecodable value");
                    listing.malformed.push(key);
                }
            }
        }
        Ok(listing)
    }

    /// Conditionally write `value`. `expected_version` is the version the
    /// caller read, or `0` to create.
    pub async fn compare_and_put<T: Serialize>(
        &self,
        key: &str,
        expected_version: i64,
        value: &T,
    ) -> Result<bool> {
        let bytes = serde_json::to_vec(value)?;
        self.bounded(self.backend.compare_and_put_raw(key, expected_version, bytes))
            .await
    }
}
