//! Misrouted-write detection.
//!
//! A delegating store that checks every write against the key's preference
//! list. Writes that do not belong on this node are parked in a local slop
//! store for later hand-off instead of entering the inner store.

use std::sync::{Arc, RwLock};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::Result;
use crate::routing::{ConsistentRouting, RoutingStrategy};
use crate::store::Store;
use crate::versioning::{now_ms, Versioned, VectorClock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlopOp {
    Put,
    Delete,
}

/// A write quarantined on the wrong node, waiting for delivery to its
/// rightful owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slop {
    pub store_name: String,
    pub op: SlopOp,
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub origin_node_id: u16,
    pub arrival_ms: u64,
}

impl Slop {
    /// Slop-store key, derived from everything but the value and arrival
    /// time so that re-queueing the same op on the same hop is idempotent.
    pub fn make_key(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + self.store_name.len() + self.key.len());
        buf.put_u8(match self.op {
            SlopOp::Put => 0,
            SlopOp::Delete => 1,
        });
        buf.put_u16(self.origin_node_id);
        buf.put_u16(self.store_name.len() as u16);
        buf.put_slice(self.store_name.as_bytes());
        buf.put_slice(&self.key);
        buf.freeze()
    }
}

/// Wraps an inner store and a slop store; consults the routing strategy on
/// every write. The strategy is swappable so a services restart can pick
/// up a new topology without rebuilding the store stack.
pub struct SlopDetectingStore {
    inner: Arc<dyn Store<Bytes, Bytes>>,
    slop_store: Arc<dyn Store<Bytes, Slop>>,
    local_node_id: u16,
    replication_factor: usize,
    routing: RwLock<Arc<ConsistentRouting>>,
}

impl SlopDetectingStore {
    pub fn new(
        inner: Arc<dyn Store<Bytes, Bytes>>,
        slop_store: Arc<dyn Store<Bytes, Slop>>,
        local_node_id: u16,
        replication_factor: usize,
        routing: Arc<ConsistentRouting>,
    ) -> Self {
        SlopDetectingStore {
            inner,
            slop_store,
            local_node_id,
            replication_factor,
            routing: RwLock::new(routing),
        }
    }

    pub fn set_routing(&self, routing: Arc<ConsistentRouting>) {
        *self.routing.write().expect("routing lock poisoned") = routing;
    }

    fn is_local(&self, key: &[u8]) -> bool {
        let routing = self.routing.read().expect("routing lock poisoned").clone();
        routing
            .route(key)
            .iter()
            .take(self.replication_factor)
            .any(|node| node.id == self.local_node_id)
    }

    fn divert(&self, op: SlopOp, key: &Bytes, value: Option<Bytes>, version: VectorClock) -> Result<()> {
        let slop = Slop {
            store_name: self.inner.name().to_string(),
            op,
            key: key.clone(),
            value,
            origin_node_id: self.local_node_id,
            arrival_ms: now_ms(),
        };
        debug!(
            store = self.inner.name(),
            op = ?op,
            "diverting misrouted write to slop"
        );
        self.slop_store
            .put(slop.make_key(), Versioned::new(slop, version))
    }
}

impl Store<Bytes, Bytes> for SlopDetectingStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get(&self, key: &Bytes) -> Result<Vec<Versioned<Bytes>>> {
        self.inner.get(key)
    }

    fn put(&self, key: Bytes, value: Versioned<Bytes>) -> Result<()> {
        if self.is_local(&key) {
            self.inner.put(key, value)
        } else {
            self.divert(SlopOp::Put, &key, Some(value.value), value.version)
        }
    }

    fn delete(&self, key: &Bytes, version: &VectorClock) -> Result<bool> {
        if self.is_local(key) {
            self.inner.delete(key, version)
        } else {
            self.divert(SlopOp::Delete, key, None, version.clone())?;
            Ok(false)
        }
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
