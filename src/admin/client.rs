//! Admin client: remote admin ops and the rebalance choreography.

use std::collections::BTreeSet;
use std::io::{BufReader, BufWriter, Write};
use std::net::TcpStream;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, warn};

use crate::admin::pool::{SocketDestination, SocketPool};
use crate::admin::wire::{self, OpCode};
use crate::cluster::{self, Cluster, Node};
use crate::error::{Result, StoreError};
use crate::store::{MetadataStore, StoreDefinition, CLUSTER_KEY, OLD_CLUSTER_KEY, STORES_KEY};
use crate::versioning::{now_ms, Versioned, VectorClock};
use crate::xml;

/// Drives remote admin opcodes against peers and orchestrates partition
/// moves. Holds a read-only handle on the local metadata store and shares
/// the process-wide socket pool.
pub struct AdminClient {
    local_node: Node,
    metadata: Arc<MetadataStore>,
    pool: Arc<SocketPool>,
}

impl AdminClient {
    pub fn new(local_node: Node, metadata: Arc<MetadataStore>, pool: Arc<SocketPool>) -> Self {
        AdminClient {
            local_node,
            metadata,
            pool,
        }
    }

    pub fn local_node(&self) -> &Node {
        &self.local_node
    }

    /// Writes a cluster document under `metadata_key` on `node_id`. The
    /// local node is updated directly so the coordinator's own snapshot
    /// does not depend on its admin socket.
    pub fn update_cluster_metadata(
        &self,
        node_id: u16,
        cluster: &Cluster,
        metadata_key: &str,
    ) -> Result<()> {
        let cluster_xml = xml::write_cluster(cluster);
        if node_id == self.local_node.id {
            return self.put_local(metadata_key, cluster_xml);
        }
        let node = self.resolve(node_id, Some(cluster))?;
        self.with_socket(&node, |stream| {
            wire::write_u8(stream, OpCode::UpdateClusterMetadata as u8)?;
            wire::write_utf(stream, metadata_key)?;
            wire::write_utf(stream, &cluster_xml)?;
            stream.flush()?;
            wire::read_prelude(stream)
        })
    }

    pub fn update_stores_metadata(&self, node_id: u16, defs: &[StoreDefinition]) -> Result<()> {
        let stores_xml = xml::write_stores(defs);
        if node_id == self.local_node.id {
            return self.put_local(STORES_KEY, stores_xml);
        }
        let node = self.resolve(node_id, None)?;
        self.with_socket(&node, |stream| {
            wire::write_u8(stream, OpCode::UpdateStoresMetadata as u8)?;
            wire::write_utf(stream, &stores_xml)?;
            stream.flush()?;
            wire::read_prelude(stream)
        })
    }

    pub fn restart_services(&self, node_id: u16) -> Result<()> {
        self.simple_op(node_id, OpCode::RestartServices)
    }

    pub fn set_rebalancing_state_and_restart(&self, node_id: u16) -> Result<()> {
        self.simple_op(node_id, OpCode::RebalancingServerMode)?;
        self.restart_services(node_id)
    }

    pub fn set_normal_state_and_restart(&self, node_id: u16) -> Result<()> {
        self.simple_op(node_id, OpCode::NormalServerMode)?;
        self.restart_services(node_id)
    }

    /// Fetches all current versions of `key` from a peer's store,
    /// bypassing that peer's routing checks.
    pub fn redirect_get(
        &self,
        node_id: u16,
        store_name: &str,
        key: &[u8],
    ) -> Result<Vec<Versioned<Bytes>>> {
        let node = self.resolve(node_id, None)?;
        self.with_socket(&node, |stream| {
            wire::write_u8(stream, OpCode::RedirectGet as u8)?;
            wire::write_utf(stream, store_name)?;
            wire::write_blob(stream, key)?;
            stream.flush()?;

            let mut reader = BufReader::new(stream.try_clone()?);
            wire::read_prelude(&mut reader)?;
            let count = wire::read_i32(&mut reader)?;
            let mut values = Vec::with_capacity(count.max(0) as usize);
            for _ in 0..count {
                let blob = wire::read_blob(&mut reader)?;
                let (clock, consumed) = VectorClock::from_bytes_prefix(&blob)?;
                values.push(Versioned::new(
                    Bytes::copy_from_slice(&blob[consumed..]),
                    clock,
                ));
            }
            Ok(values)
        })
    }

    /// Pumps `partitions` of `store_name` from one node to another:
    /// GET_PARTITION_AS_STREAM on the source, PUT_PARTITION_AS_STREAM on
    /// the sink, tuples copied until the source's end sentinel, then both
    /// preludes checked.
    pub fn pipe_get_and_put_streams(
        &self,
        from_id: u16,
        to_id: u16,
        store_name: &str,
        partitions: &[u16],
    ) -> Result<()> {
        let from = self.resolve(from_id, None)?;
        let to = self.resolve(to_id, None)?;
        let get_dest = SocketDestination::new(from.host.clone(), from.admin_port);
        let put_dest = SocketDestination::new(to.host.clone(), to.admin_port);

        let get_sock = self.pool.checkout(&get_dest)?;
        let put_sock = match self.pool.checkout(&put_dest) {
            Ok(sock) => sock,
            Err(err) => {
                self.pool.checkin(&get_dest, get_sock);
                return Err(err);
            }
        };

        let outcome = pump_streams(&get_sock, &put_sock, store_name, partitions).map_err(map_io);
        let fatal = outcome
            .as_ref()
            .err()
            .map(connection_fatal)
            .unwrap_or(false);
        if fatal {
            self.pool.destroy(&get_dest, get_sock);
            self.pool.destroy(&put_dest, put_sock);
        } else {
            self.pool.checkin(&get_dest, get_sock);
            self.pool.checkin(&put_dest, put_sock);
        }
        outcome
    }

    /// Grows this node's share of the ring: snapshot the topology, enter
    /// rebalancing mode, then move the planned steal list donor by donor,
    /// propagating the per-donor intermediate cluster before each
    /// transfer. One donor is in flight at a time; the first failing
    /// donor aborts the run, leaving `old.cluster.xml` snapshots behind
    /// as the operator's rollback anchor.
    pub fn steal_partitions_from_cluster(&self, store_name: &str) -> Result<()> {
        let local_id = self.local_node.id;
        let current = self.metadata.get_cluster()?;

        self.update_cluster_metadata(local_id, &current, OLD_CLUSTER_KEY)?;
        self.set_rebalancing_state_and_restart(local_id)?;

        let updated = cluster::steal_partitions(&current, local_id)?;
        let targets = node_union(&current, &updated);
        let mut running = current.clone();

        for donor in current.nodes() {
            if donor.id == local_id {
                continue;
            }
            let steal = cluster::steal_list(&current, &updated, donor.id, local_id)?;
            if steal.is_empty() {
                continue;
            }
            info!(donor = donor.id, thief = local_id, ?steal, "stealing partitions");

            running = cluster::temp_cluster(&running, donor.id, local_id, &steal)?;
            for &target in &targets {
                self.update_cluster_metadata(target, &running, CLUSTER_KEY)?;
            }
            self.pipe_get_and_put_streams(donor.id, local_id, store_name, &steal)?;
        }

        self.set_normal_state_and_restart(local_id)
    }

    /// The symmetric leave operation: this node hands its partitions back,
    /// one recipient at a time, flipping each recipient through
    /// rebalancing mode around its transfer.
    pub fn return_partitions_to_cluster(&self, store_name: &str) -> Result<()> {
        let local_id = self.local_node.id;
        let current = self.metadata.get_cluster()?;
        let updated = cluster::delete_node(&current, local_id)?;
        let targets = node_union(&current, &updated);
        let mut running = current.clone();

        for recipient in updated.nodes() {
            if recipient.id == local_id {
                continue;
            }
            let steal = cluster::steal_list(&current, &updated, local_id, recipient.id)?;
            if steal.is_empty() {
                continue;
            }
            info!(
                from = local_id,
                recipient = recipient.id,
                ?steal,
                "returning partitions"
            );

            self.update_cluster_metadata(recipient.id, &current, OLD_CLUSTER_KEY)?;
            running = cluster::temp_cluster(&running, local_id, recipient.id, &steal)?;
            for &target in &targets {
                self.update_cluster_metadata(target, &running, CLUSTER_KEY)?;
            }
            self.set_rebalancing_state_and_restart(recipient.id)?;
            self.pipe_get_and_put_streams(local_id, recipient.id, store_name, &steal)?;
            self.set_normal_state_and_restart(recipient.id)?;
        }
        Ok(())
    }

    fn simple_op(&self, node_id: u16, op: OpCode) -> Result<()> {
        let node = self.resolve(node_id, None)?;
        self.with_socket(&node, |stream| {
            wire::write_u8(stream, op as u8)?;
            stream.flush()?;
            wire::read_prelude(stream)
        })
    }

    fn put_local(&self, key: &str, value: String) -> Result<()> {
        let version = self
            .metadata
            .current_version(key)?
            .incremented(self.local_node.id, now_ms());
        self.metadata.put_string(key, Versioned::new(value, version))
    }

    /// Looks a node up in the cluster being propagated when one is at
    /// hand (it may carry fresher ports), falling back to the local
    /// metadata view.
    fn resolve(&self, node_id: u16, cluster: Option<&Cluster>) -> Result<Node> {
        if let Some(cluster) = cluster {
            if let Ok(node) = cluster.node(node_id) {
                return Ok(node.clone());
            }
        }
        Ok(self.metadata.get_cluster()?.node(node_id)?.clone())
    }

    /// Runs one request/response exchange on a pooled socket. Healthy
    /// sockets go back to the pool; connection-fatal failures close them.
    fn with_socket<T>(
        &self,
        node: &Node,
        exchange: impl FnOnce(&mut TcpStream) -> Result<T>,
    ) -> Result<T> {
        let dest = SocketDestination::new(node.host.clone(), node.admin_port);
        let mut stream = self.pool.checkout(&dest)?;
        match exchange(&mut stream).map_err(map_io) {
            Ok(value) => {
                self.pool.checkin(&dest, stream);
                Ok(value)
            }
            Err(err) => {
                if connection_fatal(&err) {
                    warn!(node = node.id, "closing admin socket after failure: {err}");
                    self.pool.destroy(&dest, stream);
                } else {
                    self.pool.checkin(&dest, stream);
                }
                Err(err)
            }
        }
    }
}

fn pump_streams(
    get_sock: &TcpStream,
    put_sock: &TcpStream,
    store_name: &str,
    partitions: &[u16],
) -> Result<()> {
    let mut get_w = get_sock.try_clone()?;
    wire::write_u8(&mut get_w, OpCode::GetPartitionAsStream as u8)?;
    wire::write_utf(&mut get_w, store_name)?;
    wire::write_i32(&mut get_w, partitions.len() as i32)?;
    for &p in partitions {
        wire::write_i32(&mut get_w, p as i32)?;
    }
    get_w.flush()?;

    let mut get_r = BufReader::new(get_sock.try_clone()?);
    let mut put_w = BufWriter::new(put_sock.try_clone()?);
    wire::write_u8(&mut put_w, OpCode::PutPartitionAsStream as u8)?;
    wire::write_utf(&mut put_w, store_name)?;

    let mut piped = 0usize;
    while let Some((key, value)) = wire::read_stream_entry(&mut get_r)? {
        wire::write_stream_entry(&mut put_w, &key, &value)?;
        piped += 1;
    }
    wire::write_stream_end(&mut put_w)?;
    put_w.flush()?;
    drop(put_w);

    // Drain both preludes even when the first reports an error, so a
    // surviving socket is left in frame for reuse.
    let get_status = wire::read_prelude(&mut get_r);
    let mut put_r = put_sock.try_clone()?;
    let put_status = wire::read_prelude(&mut put_r);
    get_status?;
    put_status?;
    info!(store = store_name, piped, "partition pipe complete");
    Ok(())
}

/// Reads that hit the socket timeout surface as `Timeout`, not bare IO.
fn map_io(err: StoreError) -> StoreError {
    if let StoreError::Io(io) = &err {
        if matches!(
            io.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
        ) {
            return StoreError::Timeout(io.to_string());
        }
    }
    err
}

/// Errors after which the stream may be out of frame and must not be
/// reused. Application errors arrive via the response prelude and leave
/// the stream healthy.
fn connection_fatal(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::Io(_) | StoreError::Timeout(_) | StoreError::InvalidClockFormat(_)
    )
}

fn node_union(a: &Cluster, b: &Cluster) -> BTreeSet<u16> {
    a.node_ids().chain(b.node_ids()).collect()
}
