//! The metadata store: authoritative cluster topology, store definitions,
//! and server lifecycle state, with versioned single-writer semantics.

use std::sync::Mutex;

use bytes::Bytes;

use crate::cluster::Cluster;
use crate::error::{Result, StoreError};
use crate::store::{FilesystemStore, StorageEngine, Store, StoreDefinition};
use crate::versioning::{Occurred, Versioned, VectorClock};
use crate::xml;

pub const METADATA_STORE_NAME: &str = "metadata";
pub const CLUSTER_KEY: &str = "cluster.xml";
pub const STORES_KEY: &str = "stores.xml";
pub const SERVER_STATE_KEY: &str = "server.state";
pub const OLD_CLUSTER_KEY: &str = "old.cluster.xml";

pub const KNOWN_KEYS: [&str; 4] = [CLUSTER_KEY, STORES_KEY, SERVER_STATE_KEY, OLD_CLUSTER_KEY];

/// Server lifecycle state, persisted under `server.state`. Transitions are
/// driven only by admin opcodes; a node boots into `Normal` when the key
/// is absent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Normal,
    Rebalancing,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Normal => "NORMAL_STATE",
            ServerState::Rebalancing => "REBALANCING_STATE",
        }
    }

    pub fn parse(raw: &str) -> Result<ServerState> {
        match raw {
            "NORMAL_STATE" => Ok(ServerState::Normal),
            "REBALANCING_STATE" => Ok(ServerState::Rebalancing),
            other => Err(StoreError::InconsistentMetadata(format!(
                "unrecognized server state `{other}`"
            ))),
        }
    }
}

/// Versioned, validated persistence over a small string-valued inner
/// store. All writes funnel through one critical section; reads go
/// straight to the inner store.
pub struct MetadataStore {
    inner: FilesystemStore,
    write_lock: Mutex<()>,
}

impl MetadataStore {
    pub fn new(inner: FilesystemStore) -> MetadataStore {
        MetadataStore {
            inner,
            write_lock: Mutex::new(()),
        }
    }

    pub fn get_versioned(&self, key: &str) -> Result<Vec<Versioned<String>>> {
        self.inner.get(&key.to_string())
    }

    /// Clock of the single current version, or an empty clock when the key
    /// has never been written. Handlers increment this to version their
    /// updates.
    pub fn current_version(&self, key: &str) -> Result<VectorClock> {
        let found = self.get_versioned(key)?;
        match found.len() {
            0 => Ok(VectorClock::default()),
            1 => Ok(found.into_iter().next().expect("one element").version),
            n => Err(StoreError::InconsistentMetadata(format!(
                "key `{key}` has {n} current versions"
            ))),
        }
    }

    pub fn put_string(&self, key: &str, value: Versioned<String>) -> Result<()> {
        let _guard = self.write_lock.lock().expect("metadata write lock poisoned");
        if !KNOWN_KEYS.contains(&key) {
            return Err(StoreError::UnknownMetadataKey(key.to_string()));
        }

        match key {
            STORES_KEY => {
                xml::parse_stores(&value.value)?;
                let current = self.get_versioned(STORES_KEY)?;
                match current.len() {
                    0 => {}
                    1 => {
                        if current[0].version.compare(&value.version) != Occurred::Before {
                            return Err(StoreError::ObsoleteVersion(
                                "attempt to put out-of-date store metadata".into(),
                            ));
                        }
                    }
                    n => {
                        return Err(StoreError::InconsistentMetadata(format!(
                            "stores.xml has {n} current versions"
                        )));
                    }
                }
            }
            CLUSTER_KEY | OLD_CLUSTER_KEY => {
                xml::parse_cluster(&value.value)?;
            }
            SERVER_STATE_KEY => {
                ServerState::parse(&value.value)?;
            }
            _ => unreachable!("key membership checked above"),
        }

        self.inner.put(key.to_string(), value)
    }

    pub fn get_cluster(&self) -> Result<Cluster> {
        xml::parse_cluster(&self.single_value(CLUSTER_KEY)?)
    }

    pub fn get_stores(&self) -> Result<Vec<StoreDefinition>> {
        xml::parse_stores(&self.single_value(STORES_KEY)?)
    }

    pub fn get_store(&self, store_name: &str) -> Result<StoreDefinition> {
        self.get_stores()?
            .into_iter()
            .find(|def| def.name == store_name)
            .ok_or_else(|| StoreError::StoreNotFound(store_name.to_string()))
    }

    pub fn server_state(&self) -> Result<ServerState> {
        let found = self.get_versioned(SERVER_STATE_KEY)?;
        match found.len() {
            0 => Ok(ServerState::Normal),
            1 => ServerState::parse(&found[0].value),
            n => Err(StoreError::InconsistentMetadata(format!(
                "server.state has {n} current versions"
            ))),
        }
    }

    fn single_value(&self, key: &str) -> Result<String> {
        let found = self.get_versioned(key)?;
        if found.len() != 1 {
            return Err(StoreError::InconsistentMetadata(format!(
                "expected 1 version of `{key}`, found {}",
                found.len()
            )));
        }
        Ok(found.into_iter().next().expect("one element").value)
    }
}

impl Store<Bytes, Bytes> for MetadataStore {
    fn name(&self) -> &str {
        METADATA_STORE_NAME
    }

    fn get(&self, key: &Bytes) -> Result<Vec<Versioned<Bytes>>> {
        let key = utf8(key, "metadata key")?;
        Ok(self
            .get_versioned(&key)?
            .into_iter()
            .map(|versioned| versioned.map(Bytes::from))
            .collect())
    }

    fn put(&self, key: Bytes, value: Versioned<Bytes>) -> Result<()> {
        let key = utf8(&key, "metadata key")?;
        let text = utf8(&value.value, "metadata value")?;
        self.put_string(&key, Versioned::new(text, value.version))
    }

    fn delete(&self, _key: &Bytes, _version: &VectorClock) -> Result<bool> {
        Err(StoreError::PermissionDenied(
            "metadata is not deletable".into(),
        ))
    }
}

impl StorageEngine<Bytes, Bytes> for MetadataStore {
    fn entries(&self) -> Result<Box<dyn Iterator<Item = (Bytes, Versioned<Bytes>)> + Send>> {
        Err(StoreError::NotSupported(
            "metadata cannot be iterated".into(),
        ))
    }
}

fn utf8(bytes: &Bytes, what: &str) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| StoreError::InvalidRequest(format!("{what} is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Node;
    use crate::versioning::now_ms;

    fn store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let inner = FilesystemStore::open(METADATA_STORE_NAME, dir.path()).unwrap();
        (dir, MetadataStore::new(inner))
    }

    fn cluster_xml() -> String {
        let cluster = Cluster::new(
            "test",
            vec![
                Node::new(0, "localhost", 8081, 6666, 7777, vec![0, 1]),
                Node::new(1, "localhost", 8082, 6667, 7778, vec![2, 3]),
            ],
        )
        .unwrap();
        xml::write_cluster(&cluster)
    }

    fn stores_xml() -> String {
        use crate::store::{RoutingTier, StoreType};
        xml::write_stores(&[StoreDefinition {
            name: "users".into(),
            store_type: StoreType::Memory,
            routing: RoutingTier::Server,
            replication_factor: 1,
            required_reads: 1,
            preferred_reads: 1,
            required_writes: 1,
            preferred_writes: 1,
            key_serializer: "string".into(),
            value_serializer: "string".into(),
        }])
    }

    fn clock(node: u16, count: u64) -> VectorClock {
        let mut c = VectorClock::new();
        for _ in 0..count {
            c = c.incremented(node, now_ms());
        }
        c
    }

    #[test]
    fn cluster_roundtrips_through_metadata() {
        let (_dir, meta) = store();
        meta.put_string(CLUSTER_KEY, Versioned::new(cluster_xml(), clock(0, 1)))
            .unwrap();
        let cluster = meta.get_cluster().unwrap();
        assert_eq!(cluster.name(), "test");
        assert_eq!(cluster.node_count(), 2);
    }

    #[test]
    fn stores_put_requires_strictly_newer_version() {
        let (_dir, meta) = store();
        meta.put_string(STORES_KEY, Versioned::new(stores_xml(), clock(0, 1)))
            .unwrap();

        // Same clock again: obsolete.
        let err = meta
            .put_string(STORES_KEY, Versioned::new(stores_xml(), clock(0, 1)))
            .unwrap_err();
        assert!(matches!(err, StoreError::ObsoleteVersion(_)));

        // Concurrent clock: also obsolete.
        let err = meta
            .put_string(STORES_KEY, Versioned::new(stores_xml(), clock(1, 1)))
            .unwrap_err();
        assert!(matches!(err, StoreError::ObsoleteVersion(_)));

        // Strictly newer: accepted.
        meta.put_string(STORES_KEY, Versioned::new(stores_xml(), clock(0, 2)))
            .unwrap();
        assert_eq!(meta.get_store("users").unwrap().name, "users");
    }

    #[test]
    fn unknown_keys_are_refused() {
        let (_dir, meta) = store();
        let err = meta
            .put_string("rogue.key", Versioned::new("x".into(), clock(0, 1)))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownMetadataKey(_)));
    }

    #[test]
    fn metadata_is_not_deletable_or_iterable() {
        let (_dir, meta) = store();
        let err = meta
            .delete(&Bytes::from_static(b"cluster.xml"), &clock(0, 1))
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));

        let err = meta.entries().err().unwrap();
        assert!(matches!(err, StoreError::NotSupported(_)));
    }

    #[test]
    fn missing_store_is_reported_by_name() {
        let (_dir, meta) = store();
        meta.put_string(STORES_KEY, Versioned::new(stores_xml(), clock(0, 1)))
            .unwrap();
        let err = meta.get_store("absent").unwrap_err();
        assert!(matches!(err, StoreError::StoreNotFound(name) if name == "absent"));
    }

    #[test]
    fn server_state_defaults_to_normal() {
        let (_dir, meta) = store();
        assert_eq!(meta.server_state().unwrap(), ServerState::Normal);

        meta.put_string(
            SERVER_STATE_KEY,
            Versioned::new(ServerState::Rebalancing.as_str().into(), clock(0, 1)),
        )
        .unwrap();
        assert_eq!(meta.server_state().unwrap(), ServerState::Rebalancing);
    }

    #[test]
    fn cluster_getter_requires_exactly_one_version() {
        let (_dir, meta) = store();
        let err = meta.get_cluster().unwrap_err();
        assert!(matches!(err, StoreError::InconsistentMetadata(_)));
    }
}
