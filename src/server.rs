//! Node server: owns the metadata store and every storage engine by name,
//! and runs the admin service. Everything else borrows from here.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::info;

use crate::admin::{AdminServer, AdminServerHandle};
use crate::cluster::Node;
use crate::config::NodeConfig;
use crate::error::{Result, StoreError};
use crate::routing::ConsistentRouting;
use crate::store::{
    CacheStorageEngine, FilesystemStore, InMemoryStorageEngine, MetadataStore, ServerState, Slop,
    SlopDetectingStore, StorageEngine, Store, StoreDefinition, StoreType, SERVER_STATE_KEY,
};
use crate::versioning::{now_ms, Versioned};

/// One named store as the server sees it: its definition, the raw engine
/// (admin bulk ops go here), and the slop-detecting front the routing
/// tier writes through.
pub struct StoreContext {
    pub definition: StoreDefinition,
    pub engine: Arc<dyn StorageEngine<Bytes, Bytes>>,
    pub routed: Arc<SlopDetectingStore>,
}

/// Shared service state: the arena that owns stores by name. The admin
/// server borrows this to serve opcodes; the node server drives restarts.
pub struct Services {
    local_node_id: u16,
    metadata: Arc<MetadataStore>,
    stores: BTreeMap<String, StoreContext>,
    slop_store: Arc<InMemoryStorageEngine<Bytes, Slop>>,
    generation: AtomicU64,
}

impl Services {
    pub fn local_node_id(&self) -> u16 {
        self.local_node_id
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn slop_store(&self) -> &Arc<InMemoryStorageEngine<Bytes, Slop>> {
        &self.slop_store
    }

    pub fn engine(&self, store_name: &str) -> Result<Arc<dyn StorageEngine<Bytes, Bytes>>> {
        self.stores
            .get(store_name)
            .map(|ctx| ctx.engine.clone())
            .ok_or_else(|| StoreError::StoreNotFound(store_name.to_string()))
    }

    pub fn routed(&self, store_name: &str) -> Result<Arc<SlopDetectingStore>> {
        self.stores
            .get(store_name)
            .map(|ctx| ctx.routed.clone())
            .ok_or_else(|| StoreError::StoreNotFound(store_name.to_string()))
    }

    pub fn definition(&self, store_name: &str) -> Result<&StoreDefinition> {
        self.stores
            .get(store_name)
            .map(|ctx| &ctx.definition)
            .ok_or_else(|| StoreError::StoreNotFound(store_name.to_string()))
    }

    pub fn store_names(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Fresh routing for one store from the current topology.
    pub fn routing_for(&self, store_name: &str) -> Result<ConsistentRouting> {
        let definition = self.definition(store_name)?;
        let cluster = self.metadata.get_cluster()?;
        ConsistentRouting::new(&cluster, definition.replication_factor as usize)
    }

    /// Re-reads the topology and swaps every store's routing strategy.
    /// This is what the RESTART_SERVICES opcode runs.
    pub fn restart(&self) -> Result<()> {
        let cluster = self.metadata.get_cluster()?;
        for ctx in self.stores.values() {
            let routing = ConsistentRouting::new(&cluster, ctx.definition.replication_factor as usize)?;
            ctx.routed.set_routing(Arc::new(routing));
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let state = self.metadata.server_state()?;
        info!(generation, state = state.as_str(), "services restarted");
        Ok(())
    }
}

/// A running node: bootstraps stores from the metadata directory and
/// serves the admin channel until stopped.
pub struct NodeServer {
    identity: Node,
    services: Arc<Services>,
    admin: Option<AdminServerHandle>,
}

impl NodeServer {
    pub fn start(config: &NodeConfig) -> Result<NodeServer> {
        let inner = FilesystemStore::open("metadata", config.metadata_dir())?;
        let metadata = Arc::new(MetadataStore::new(inner));
        fs::create_dir_all(config.data_dir())?;

        let cluster = metadata.get_cluster()?;
        let definitions = metadata.get_stores()?;
        let identity = cluster.node(config.node_id)?.clone();

        // First boot: persist the default lifecycle state.
        if metadata.get_versioned(SERVER_STATE_KEY)?.is_empty() {
            let version = metadata
                .current_version(SERVER_STATE_KEY)?
                .incremented(config.node_id, now_ms());
            metadata.put_string(
                SERVER_STATE_KEY,
                Versioned::new(ServerState::Normal.as_str().into(), version),
            )?;
        }

        let slop_store: Arc<InMemoryStorageEngine<Bytes, Slop>> =
            Arc::new(InMemoryStorageEngine::new("slop"));

        type EngineAndView = (
            Arc<dyn StorageEngine<Bytes, Bytes>>,
            Arc<dyn Store<Bytes, Bytes>>,
        );

        let mut stores = BTreeMap::new();
        for definition in definitions {
            definition.validate()?;
            if definition.replication_factor as usize > cluster.node_count() {
                return Err(StoreError::InvalidRequest(format!(
                    "store `{}`: replication factor {} exceeds cluster size {}",
                    definition.name,
                    definition.replication_factor,
                    cluster.node_count()
                )));
            }
            let (engine, store_view): EngineAndView = match definition.store_type {
                StoreType::Memory => {
                    let concrete: Arc<InMemoryStorageEngine<Bytes, Bytes>> =
                        Arc::new(InMemoryStorageEngine::new(definition.name.clone()));
                    let engine: Arc<dyn StorageEngine<Bytes, Bytes>> = concrete.clone();
                    let view: Arc<dyn Store<Bytes, Bytes>> = concrete;
                    (engine, view)
                }
                StoreType::Cache => {
                    let concrete: Arc<CacheStorageEngine<Bytes, Bytes>> = Arc::new(
                        CacheStorageEngine::new(definition.name.clone(), config.cache_capacity),
                    );
                    let engine: Arc<dyn StorageEngine<Bytes, Bytes>> = concrete.clone();
                    let view: Arc<dyn Store<Bytes, Bytes>> = concrete;
                    (engine, view)
                }
            };
            fs::create_dir_all(config.data_dir().join(&definition.name))?;
            let routing = ConsistentRouting::new(&cluster, definition.replication_factor as usize)?;
            let routed = Arc::new(SlopDetectingStore::new(
                store_view,
                slop_store.clone(),
                config.node_id,
                definition.replication_factor as usize,
                Arc::new(routing),
            ));
            stores.insert(
                definition.name.clone(),
                StoreContext {
                    definition,
                    engine,
                    routed,
                },
            );
        }

        let services = Arc::new(Services {
            local_node_id: config.node_id,
            metadata,
            stores,
            slop_store,
            generation: AtomicU64::new(0),
        });

        let admin = AdminServer::new(
            services.clone(),
            format!("{}:{}", config.admin_host, config.admin_port),
            config.socket_pool.max_connections_per_node,
        )
        .start()?;

        info!(
            node_id = config.node_id,
            admin_addr = %admin.local_addr(),
            stores = services.stores.len(),
            "node server started"
        );

        Ok(NodeServer {
            identity,
            services,
            admin: Some(admin),
        })
    }

    pub fn identity(&self) -> &Node {
        &self.identity
    }

    pub fn admin_addr(&self) -> SocketAddr {
        self.admin
            .as_ref()
            .expect("admin service running")
            .local_addr()
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.services.metadata
    }

    pub fn stop(mut self) {
        if let Some(admin) = self.admin.take() {
            admin.shutdown();
        }
        info!(node_id = self.services.local_node_id, "node server stopped");
    }
}

impl Drop for NodeServer {
    fn drop(&mut self) {
        if let Some(admin) = self.admin.take() {
            admin.shutdown();
        }
    }
}
