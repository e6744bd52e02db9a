//! Versioned key/value coordination primitives shared by services that need
//! cross-replica exclusion.
//!
//! Everything funnels through a single conditional-write primitive: a value is
//! only written if the key's version still matches what the writer last read.
//! etcd provides this natively through transactions; `MemoryStore` provides the
//! same semantics in-process for tests and simulations.

pub mod error;
pub mod memory;
pub mod store;
pub mod util;

pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use store::{
    CoordinationStore, EtcdStore, Listing, StoreConfig, Versioned, VersionedStore,
};
