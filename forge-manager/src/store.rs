use coordination_store::{CoordinationStore, Versioned};

use crate::error::Result;
use crate::types::{ClusterRecord, LeaseRecord, LegacyLeaderRecord};

/// All key patterns used by the forge manager.
///
/// Full key scheme:
/// ```text
/// {prefix}leases/{region}/{namespace}/{lease_name}
/// {prefix}legacy/{region}/{namespace}/{lease_name}
/// {prefix}clusters/{network}/{pool_id}/{region}
/// ```
enum StoreKey<'a> {
    /// One lease per regional deployment.
    Lease {
        region: &'a str,
        namespace: &'a str,
        name: &'a str,
    },
    /// Reduced leader record kept for consumers of the single-region schema.
    LegacyLeader {
        region: &'a str,
        namespace: &'a str,
        name: &'a str,
    },
    Cluster {
        network: &'a str,
        pool_id: &'a str,
        region: &'a str,
    },
    /// Every region's record for one network + pool.
    ClustersForPool {
        network: &'a str,
        pool_id: &'a str,
    },
}

impl StoreKey<'_> {
    fn resolve(&self, prefix: &str) -> String {
        match self {
            StoreKey::Lease {
                region,
                namespace,
                name,
            } => format!("{prefix}leases/{region}/{namespace}/{name}"),
            StoreKey::LegacyLeader {
                region,
                namespace,
                name,
            } => format!("{prefix}legacy/{region}/{namespace}/{name}"),
            StoreKey::Cluster {
                network,
                pool_id,
                region,
            } => format!("{prefix}clusters/{network}/{pool_id}/{region}"),
            StoreKey::ClustersForPool { network, pool_id } => {
                format!("{prefix}clusters/{network}/{pool_id}/")
            }
        }
    }
}

/// A pool's cluster records, plus the regions whose record did not decode.
#[derive(Debug, Clone)]
pub struct ClusterListing {
    pub records: Vec<Versioned<ClusterRecord>>,
    pub malformed_regions: Vec<String>,
}

/// Domain store for leases and cluster records.
///
/// Every write is a conditional put against the version that was read;
/// `Ok(false)` means another writer won and the caller re-reads next tick.
#[derive(Clone)]
pub struct ForgeStore {
    inner: CoordinationStore,
}

impl ForgeStore {
    pub fn new(inner: CoordinationStore) -> Self {
        Self { inner }
    }

    fn key(&self, k: StoreKey<'_>) -> String {
        k.resolve(self.inner.prefix())
    }

    // ── Leases ───────────────────────────────────────────────────

    pub async fn get_lease(
        &self,
        region: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Versioned<LeaseRecord>>> {
        let key = self.key(StoreKey::Lease {
            region,
            namespace,
            name,
        });
        Ok(self.inner.get(&key).await?)
    }

    pub async fn put_lease(
        &self,
        region: &str,
        namespace: &str,
        name: &str,
        expected_version: i64,
        lease: &LeaseRecord,
    ) -> Result<bool> {
        let key = self.key(StoreKey::Lease {
            region,
            namespace,
            name,
        });
        Ok(self.inner.compare_and_put(&key, expected_version, lease).await?)
    }

    pub async fn get_legacy_leader(
        &self,
        region: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Versioned<LegacyLeaderRecord>>> {
        let key = self.key(StoreKey::LegacyLeader {
            region,
            namespace,
            name,
        });
        Ok(self.inner.get(&key).await?)
    }

    pub async fn put_legacy_leader(
        &self,
        region: &str,
        namespace: &str,
        name: &str,
        expected_version: i64,
        record: &LegacyLeaderRecord,
    ) -> Result<bool> {
        let key = self.key(StoreKey::LegacyLeader {
            region,
            namespace,
            name,
        });
        Ok(self
            .inner
            .compare_and_put(&key, expected_version, record)
            .await?)
    }

    // ── Cluster records ──────────────────────────────────────────

    pub async fn get_cluster_record(
        &self,
        network: &str,
        pool_id: &str,
        region: &str,
    ) -> Result<Option<Versioned<ClusterRecord>>> {
        let key = self.key(StoreKey::Cluster {
            network,
            pool_id,
            region,
        });
        Ok(self.inner.get(&key).await?)
    }

    /// All regions' records for a pool, sorted by region.
    pub async fn list_cluster_records(&self, network: &str, pool_id: &str) -> Result<ClusterListing> {
        let key = self.key(StoreKey::ClustersForPool { network, pool_id });
        let listing = self.inner.list::<ClusterRecord>(&key).await?;
        Ok(ClusterListing {
            records: listing
                .entries
                .into_iter()
                .map(|(_, record)| record)
                .collect(),
            malformed_regions: listing
                .malformed
                .iter()
                .filter_map(|k| k.strip_prefix(key.as_str()))
                .map(str::to_string)
                .collect(),
        })
    }

    /// Conditional write keyed by the record's own network, pool and region.
    pub async fn put_cluster_record(
        &self,
        record: &ClusterRecord,
        expected_version: i64,
    ) -> Result<bool> {
        let key = self.key(StoreKey::Cluster {
            network: &record.network_name,
            pool_id: &record.pool_id,
            region: &record.region,
        });
        Ok(self
            .inner
            .compare_and_put(&key, expected_version, record)
            .await?)
    }
}
