use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::store::{Versioned, VersionedStore};

/// In-process `VersionedStore` with the same version semantics as etcd:
/// a key's version starts at 1 on creation and increments on every write.
///
/// Used to simulate many replicas contending on one store without a running
/// etcd. `set_unavailable` makes every call fail, to exercise transient-error
/// paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, (Vec<u8>, i64)>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Unconditional write, bypassing version checks. Test setup only.
    pub fn insert_raw(&self, key: &str, value: Vec<u8>) {
        let mut entries = self.lock();
        let version = entries.get(key).map(|(_, v)| *v).unwrap_or(0) + 1;
        entries.insert(key.to_string(), (value, version));
    }

    /// Remove a key, as an operator deleting a resource would.
    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, (Vec<u8>, i64)>> {
        // A poisoned lock only means a test panicked mid-write; the map is still usable.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn get_raw(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>> {
        self.check_available()?;
        Ok(self.lock().get(key).map(|(value, version)| Versioned {
            value: value.clone(),
            version: *version,
        }))
    }

    async fn list_raw(&self, prefix: &str) -> Result<Vec<(String, Versioned<Vec<u8>>)>> {
        self.check_available()?;
        Ok(self
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, version))| {
                (
                    key.clone(),
                    Versioned {
                        value: value.clone(),
                        version: *version,
                    },
                )
            })
            .collect())
    }

    async fn compare_and_put_raw(
        &self,
        key: &str,
        expected_version: i64,
        value: Vec<u8>,
    ) -> Result<bool> {
        self.check_available()?;
        let mut entries = self.lock();
        let current = entries.get(key).map(|(_, v)| *v).unwrap_or(0);
        if current != expected_version {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value, current + 1));
        Ok(true)
    }
}
