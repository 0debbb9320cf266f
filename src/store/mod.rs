//! Store traits and definitions.
//!
//! A [`Store`] is the uniform get/put/delete surface over a versioned
//! key-value namespace; a [`StorageEngine`] additionally exposes iteration
//! over its entries, which the bulk transfer path requires.

use std::collections::BTreeMap;

use crate::error::{Result, StoreError};
use crate::versioning::{Versioned, VectorClock};

mod fs;
mod memory;
mod metadata;
mod slop;

pub use fs::FilesystemStore;
pub use memory::{CacheStorageEngine, InMemoryStorageEngine};
pub use metadata::{
    MetadataStore, ServerState, CLUSTER_KEY, KNOWN_KEYS, METADATA_STORE_NAME, OLD_CLUSTER_KEY,
    SERVER_STATE_KEY, STORES_KEY,
};
pub use slop::{Slop, SlopDetectingStore, SlopOp};

/// Uniform versioned store surface.
///
/// `put` semantics: an existing version that is `After` or `Equal` to the
/// incoming one fails the call with `ObsoleteVersion`; versions `Before`
/// the incoming one are replaced; `Concurrently` related versions survive
/// as siblings. Put is atomic with respect to concurrent readers of the
/// same key.
pub trait Store<K, V>: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, key: &K) -> Result<Vec<Versioned<V>>>;

    fn put(&self, key: K, value: Versioned<V>) -> Result<()>;

    /// Removes every stored version dominated by `version` (comparing
    /// `Before` or `Equal` to it). True iff anything was removed.
    fn delete(&self, key: &K, version: &VectorClock) -> Result<bool>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A store that can enumerate its contents. Engines back the bulk
/// partition transfer; iteration observes a consistent snapshot.
pub trait StorageEngine<K, V>: Store<K, V> {
    fn entries(&self) -> Result<Box<dyn Iterator<Item = (K, Versioned<V>)> + Send>>;
}

/// Multi-get over any store: absent keys are omitted from the result.
pub fn get_all<K, V>(store: &dyn Store<K, V>, keys: &[K]) -> Result<BTreeMap<K, Vec<Versioned<V>>>>
where
    K: Ord + Clone,
{
    let mut found = BTreeMap::new();
    for key in keys {
        let versions = store.get(key)?;
        if !versions.is_empty() {
            found.insert(key.clone(), versions);
        }
    }
    Ok(found)
}

/// Which engine backs a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreType {
    Memory,
    Cache,
}

impl StoreType {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreType::Memory => "memory",
            StoreType::Cache => "cache",
        }
    }

    pub fn parse(raw: &str) -> Result<StoreType> {
        match raw {
            "memory" => Ok(StoreType::Memory),
            "cache" => Ok(StoreType::Cache),
            other => Err(StoreError::InvalidRequest(format!(
                "unknown persistence type `{other}`"
            ))),
        }
    }
}

/// Where routing decisions are made for a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingTier {
    Client,
    Server,
}

impl RoutingTier {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingTier::Client => "client",
            RoutingTier::Server => "server",
        }
    }

    pub fn parse(raw: &str) -> Result<RoutingTier> {
        match raw {
            "client" => Ok(RoutingTier::Client),
            "server" => Ok(RoutingTier::Server),
            other => Err(StoreError::InvalidRequest(format!(
                "unknown routing tier `{other}`"
            ))),
        }
    }
}

/// Declared shape of one store: replication and quorum settings plus the
/// serializer names its clients agree on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreDefinition {
    pub name: String,
    pub store_type: StoreType,
    pub routing: RoutingTier,
    pub replication_factor: u8,
    pub required_reads: u8,
    pub preferred_reads: u8,
    pub required_writes: u8,
    pub preferred_writes: u8,
    pub key_serializer: String,
    pub value_serializer: String,
}

impl StoreDefinition {
    /// `1 <= required <= preferred <= replication_factor` on both sides.
    pub fn validate(&self) -> Result<()> {
        let check = |what: &str, required: u8, preferred: u8| -> Result<()> {
            if required == 0
                || required > preferred
                || preferred > self.replication_factor
            {
                return Err(StoreError::InvalidRequest(format!(
                    "store `{}`: invalid {what} quorum {required}/{preferred} for replication factor {}",
                    self.name, self.replication_factor
                )));
            }
            Ok(())
        };
        check("read", self.required_reads, self.preferred_reads)?;
        check("write", self.required_writes, self.preferred_writes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(rf: u8, required: u8, preferred: u8) -> StoreDefinition {
        StoreDefinition {
            name: "users".into(),
            store_type: StoreType::Memory,
            routing: RoutingTier::Server,
            replication_factor: rf,
            required_reads: required,
            preferred_reads: preferred,
            required_writes: required,
            preferred_writes: preferred,
            key_serializer: "string".into(),
            value_serializer: "string".into(),
        }
    }

    #[test]
    fn quorum_bounds_are_enforced() {
        assert!(definition(3, 1, 2).validate().is_ok());
        assert!(definition(3, 2, 2).validate().is_ok());
        assert!(definition(3, 0, 2).validate().is_err());
        assert!(definition(3, 3, 2).validate().is_err());
        assert!(definition(2, 2, 3).validate().is_err());
    }

    #[test]
    fn get_all_skips_absent_keys() {
        let engine: InMemoryStorageEngine<String, String> = InMemoryStorageEngine::new("test");
        engine
            .put(
                "here".to_string(),
                Versioned::new("v".to_string(), VectorClock::new().incremented(0, 1)),
            )
            .unwrap();
        let found = get_all(&engine, &["here".to_string(), "gone".to_string()]).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("here"));
    }
}
