#![allow(dead_code)]

//! Shared test support: an in-process ring of real node servers on
//! ephemeral ports, plus small data helpers and a store double that
//! always fails.

use std::fs;
use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use ringkv::admin::{AdminClient, SocketPool};
use ringkv::cluster::{Cluster, Node};
use ringkv::config::{NodeConfig, SocketPoolConfig};
use ringkv::error::{Result, StoreError};
use ringkv::server::NodeServer;
use ringkv::store::{RoutingTier, Store, StoreDefinition, StoreType, CLUSTER_KEY};
use ringkv::versioning::{now_ms, Versioned, VectorClock};
use ringkv::xml;

/// A memory-backed store definition with symmetric quorums.
pub fn memory_store_def(name: &str, replication_factor: u8) -> StoreDefinition {
    StoreDefinition {
        name: name.into(),
        store_type: StoreType::Memory,
        routing: RoutingTier::Server,
        replication_factor,
        required_reads: 1,
        preferred_reads: replication_factor,
        required_writes: 1,
        preferred_writes: replication_factor,
        key_serializer: "string".into(),
        value_serializer: "string".into(),
    }
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_bytes(rng: &mut StdRng, len: usize) -> Bytes {
    let mut buf = vec![0u8; len];
    rng.fill(buf.as_mut_slice());
    Bytes::from(buf)
}

pub struct TestNode {
    pub home: TempDir,
    pub server: NodeServer,
}

/// A running multi-node ring. Boot order: seed every home with a
/// placeholder topology (admin port 0), start the servers, then rewrite
/// cluster.xml on every node with the ports that actually got bound and
/// restart services so routing sees the real topology.
pub struct TestRing {
    pub nodes: Vec<TestNode>,
    pub cluster: Cluster,
    pub pool: Arc<SocketPool>,
}

impl TestRing {
    pub fn start(partitions: &[Vec<u16>], defs: &[StoreDefinition]) -> TestRing {
        let bootstrap = build_cluster(partitions, |_| 0);
        let cluster_xml = xml::write_cluster(&bootstrap);
        let stores_xml = xml::write_stores(defs);

        let mut nodes = Vec::with_capacity(partitions.len());
        for node_id in 0..partitions.len() as u16 {
            let home = TempDir::new().expect("create node home");
            let metadata_dir = home.path().join("metadata");
            fs::create_dir_all(&metadata_dir).expect("create metadata dir");
            fs::write(metadata_dir.join("cluster.xml"), &cluster_xml).expect("seed cluster.xml");
            fs::write(metadata_dir.join("stores.xml"), &stores_xml).expect("seed stores.xml");

            let mut config = NodeConfig {
                node_id,
                home: home.path().to_path_buf(),
                admin_port: 0,
                ..NodeConfig::default()
            };
            config.socket_pool.pool_timeout_ms = 1_000;
            let server = NodeServer::start(&config).expect("start node server");
            nodes.push(TestNode { home, server });
        }

        let cluster = build_cluster(partitions, |id| {
            nodes[id as usize].server.admin_addr().port()
        });
        let real_xml = xml::write_cluster(&cluster);
        for node in &nodes {
            let metadata = node.server.metadata();
            let version = metadata
                .current_version(CLUSTER_KEY)
                .expect("read cluster version")
                .incremented(node.server.identity().id, now_ms());
            metadata
                .put_string(CLUSTER_KEY, Versioned::new(real_xml.clone(), version))
                .expect("write real cluster.xml");
            node.server.services().restart().expect("restart services");
        }

        let pool = Arc::new(SocketPool::new(SocketPoolConfig {
            pool_timeout_ms: 1_000,
            ..SocketPoolConfig::default()
        }));

        TestRing {
            nodes,
            cluster,
            pool,
        }
    }

    pub fn server(&self, node_id: u16) -> &NodeServer {
        &self.nodes[node_id as usize].server
    }

    /// An admin client whose local identity is `node_id`, sharing this
    /// ring's socket pool and that node's metadata store.
    pub fn admin_client(&self, node_id: u16) -> AdminClient {
        let local = self
            .cluster
            .node(node_id)
            .expect("client node exists")
            .clone();
        AdminClient::new(
            local,
            self.server(node_id).metadata().clone(),
            self.pool.clone(),
        )
    }
}

fn build_cluster(partitions: &[Vec<u16>], admin_port: impl Fn(u16) -> u16) -> Cluster {
    let nodes = partitions
        .iter()
        .enumerate()
        .map(|(i, parts)| {
            let id = i as u16;
            Node::new(id, "127.0.0.1", 0, 0, admin_port(id), parts.clone())
        })
        .collect();
    Cluster::new("test-ring", nodes).expect("valid test cluster")
}

/// A store that fails every operation with a configured error. Lets the
/// layers above exercise their error paths.
pub struct FailingStore {
    name: String,
    kind: fn(String) -> StoreError,
    message: String,
}

impl FailingStore {
    pub fn new(name: impl Into<String>) -> Self {
        FailingStore {
            name: name.into(),
            kind: StoreError::NotSupported,
            message: "operation failed".into(),
        }
    }

    pub fn with_error(
        name: impl Into<String>,
        kind: fn(String) -> StoreError,
        message: impl Into<String>,
    ) -> Self {
        FailingStore {
            name: name.into(),
            kind,
            message: message.into(),
        }
    }

    fn error(&self) -> StoreError {
        (self.kind)(self.message.clone())
    }
}

impl<K: Send + Sync, V: Send + Sync> Store<K, V> for FailingStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, _key: &K) -> Result<Vec<Versioned<V>>> {
        Err(self.error())
    }

    fn put(&self, _key: K, _value: Versioned<V>) -> Result<()> {
        Err(self.error())
    }

    fn delete(&self, _key: &K, _version: &VectorClock) -> Result<bool> {
        Err(self.error())
    }

    fn close(&self) -> Result<()> {
        Err(self.error())
    }
}
