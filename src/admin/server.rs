//! Admin service: accept loop, connection workers, and opcode handlers,
//! including the server side of the bulk partition streams.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::admin::wire::{self, OpCode};
use crate::error::{Result, StoreError};
use crate::routing::RoutingStrategy;
use crate::server::Services;
use crate::store::{
    ServerState, CLUSTER_KEY, OLD_CLUSTER_KEY, SERVER_STATE_KEY, STORES_KEY,
};
use crate::versioning::{now_ms, Versioned, VectorClock};
use crate::xml;

/// Pending connections the accept loop may queue ahead of the workers.
const ACCEPT_BACKLOG: usize = 64;

pub struct AdminServer {
    services: Arc<Services>,
    listen_addr: String,
    workers: usize,
}

pub struct AdminServerHandle {
    shutdown: Arc<AtomicBool>,
    accept_join: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl AdminServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.accept_join.join();
    }
}

impl AdminServer {
    pub fn new(services: Arc<Services>, listen_addr: String, workers: usize) -> AdminServer {
        AdminServer {
            services,
            listen_addr,
            workers: workers.max(1),
        }
    }

    pub fn start(self) -> Result<AdminServerHandle> {
        let listener = TcpListener::bind(&self.listen_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let (tx, rx) = bounded::<TcpStream>(ACCEPT_BACKLOG);
        for i in 0..self.workers {
            let rx = rx.clone();
            let services = self.services.clone();
            thread::Builder::new()
                .name(format!("admin-conn-{i}"))
                .spawn(move || run_worker(rx, services))
                .map_err(StoreError::Io)?;
        }

        let accept_shutdown = shutdown.clone();
        let accept_join = thread::Builder::new()
            .name("admin-accept".into())
            .spawn(move || run_accept_loop(listener, tx, accept_shutdown))
            .map_err(StoreError::Io)?;

        info!(addr = %local_addr, workers = self.workers, "admin service listening");
        Ok(AdminServerHandle {
            shutdown,
            accept_join,
            local_addr,
        })
    }
}

fn run_accept_loop(listener: TcpListener, tx: Sender<TcpStream>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                match tx.try_send(stream) {
                    Ok(()) => debug!(%peer, "admin connection accepted"),
                    Err(TrySendError::Full(_)) => {
                        warn!(%peer, "admin backlog full, dropping connection");
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(err) => {
                warn!("admin accept failed: {err}");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
    // Dropping the sender drains the workers once their current
    // connections finish.
}

fn run_worker(rx: Receiver<TcpStream>, services: Arc<Services>) {
    while let Ok(stream) = rx.recv() {
        if let Err(err) = handle_connection(&services, stream) {
            debug!("admin connection closed: {err}");
        }
    }
}

/// Serves framed requests on one connection until the peer hangs up or a
/// wire-level error desynchronizes the stream.
fn handle_connection(services: &Services, stream: TcpStream) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    loop {
        let mut first = [0u8; 1];
        match reader.read(&mut first) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(err) => return Err(err.into()),
        }
        let op = match OpCode::from_u8(first[0]) {
            Ok(op) => op,
            Err(err) => {
                // Unknown opcode: report and drop the connection, the
                // remaining bytes cannot be framed.
                let _ = wire::write_error(&mut writer, &err);
                let _ = writer.flush();
                return Err(err);
            }
        };
        serve_opcode(services, op, &mut reader, &mut writer)?;
        writer.flush()?;
    }
}

fn serve_opcode(
    services: &Services,
    op: OpCode,
    r: &mut impl Read,
    w: &mut impl Write,
) -> Result<()> {
    match op {
        OpCode::UpdateClusterMetadata => {
            let key = wire::read_utf(r)?;
            let cluster_xml = wire::read_utf(r)?;
            respond(w, apply_cluster_update(services, &key, &cluster_xml))
        }
        OpCode::UpdateStoresMetadata => {
            let stores_xml = wire::read_utf(r)?;
            respond(w, apply_stores_update(services, &stores_xml))
        }
        OpCode::RebalancingServerMode => {
            respond(w, apply_server_state(services, ServerState::Rebalancing))
        }
        OpCode::NormalServerMode => respond(w, apply_server_state(services, ServerState::Normal)),
        OpCode::RestartServices => respond(w, services.restart()),
        OpCode::RedirectGet => {
            let store_name = wire::read_utf(r)?;
            let key = wire::read_blob(r)?;
            serve_redirect_get(services, &store_name, &key, w)
        }
        OpCode::GetPartitionAsStream => {
            let store_name = wire::read_utf(r)?;
            let count = wire::read_i32(r)?;
            if !(0..=u16::MAX as i32).contains(&count) {
                return Err(StoreError::InvalidRequest(format!(
                    "bad partition count {count}"
                )));
            }
            let mut partitions = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let p = wire::read_i32(r)?;
                let p = u16::try_from(p).map_err(|_| {
                    StoreError::InvalidRequest(format!("bad partition id {p}"))
                })?;
                partitions.push(p);
            }
            serve_get_partition_stream(services, &store_name, &partitions, w)
        }
        OpCode::PutPartitionAsStream => {
            let store_name = wire::read_utf(r)?;
            serve_put_partition_stream(services, &store_name, r, w)
        }
    }
}

/// Writes the prelude for a payload-less opcode. Application failures are
/// reported to the peer and keep the connection alive.
fn respond(w: &mut impl Write, outcome: Result<()>) -> Result<()> {
    match outcome {
        Ok(()) => wire::write_ok(w),
        Err(err) => {
            warn!("admin op failed: {err}");
            wire::write_error(w, &err)
        }
    }
}

fn apply_cluster_update(services: &Services, key: &str, cluster_xml: &str) -> Result<()> {
    if key != CLUSTER_KEY && key != OLD_CLUSTER_KEY {
        return Err(StoreError::UnknownMetadataKey(key.to_string()));
    }
    let cluster = xml::parse_cluster(cluster_xml)?;
    let metadata = services.metadata();
    let version = metadata
        .current_version(key)?
        .incremented(services.local_node_id(), now_ms());
    metadata.put_string(key, Versioned::new(cluster_xml.to_string(), version))?;
    info!(key, cluster = cluster.name(), "cluster metadata updated");
    Ok(())
}

fn apply_stores_update(services: &Services, stores_xml: &str) -> Result<()> {
    let defs = xml::parse_stores(stores_xml)?;
    let metadata = services.metadata();
    let version = metadata
        .current_version(STORES_KEY)?
        .incremented(services.local_node_id(), now_ms());
    metadata.put_string(STORES_KEY, Versioned::new(stores_xml.to_string(), version))?;
    info!(stores = defs.len(), "store metadata updated");
    Ok(())
}

fn apply_server_state(services: &Services, state: ServerState) -> Result<()> {
    let metadata = services.metadata();
    let version = metadata
        .current_version(SERVER_STATE_KEY)?
        .incremented(services.local_node_id(), now_ms());
    metadata.put_string(
        SERVER_STATE_KEY,
        Versioned::new(state.as_str().to_string(), version),
    )?;
    info!(state = state.as_str(), "server state changed");
    Ok(())
}

fn serve_redirect_get(
    services: &Services,
    store_name: &str,
    key: &[u8],
    w: &mut impl Write,
) -> Result<()> {
    let found = services
        .engine(store_name)
        .and_then(|engine| engine.get(&Bytes::copy_from_slice(key)));
    match found {
        Ok(values) => {
            wire::write_ok(w)?;
            wire::write_i32(w, values.len() as i32)?;
            for versioned in values {
                let mut buf = versioned.version.to_bytes();
                buf.extend_from_slice(&versioned.value);
                wire::write_blob(w, &buf)?;
            }
            Ok(())
        }
        Err(err) => {
            warn!(store = store_name, "redirect get failed: {err}");
            wire::write_error(w, &err)
        }
    }
}

/// Streams every entry whose master partition is in the requested set,
/// then the end sentinel, then the prelude. Pre-stream failures still
/// emit a well-formed (empty) stream so the peer can parse the error.
fn serve_get_partition_stream(
    services: &Services,
    store_name: &str,
    partitions: &[u16],
    w: &mut impl Write,
) -> Result<()> {
    let prepared = services.engine(store_name).and_then(|engine| {
        let routing = services.routing_for(store_name)?;
        let entries = engine.entries()?;
        Ok((routing, entries))
    });
    let (routing, entries) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => {
            warn!(store = store_name, "partition stream refused: {err}");
            wire::write_stream_end(w)?;
            return wire::write_error(w, &err);
        }
    };

    let mut streamed = 0usize;
    for (key, versioned) in entries {
        let master = routing.partition_list(&key)[0];
        if !partitions.contains(&master) {
            continue;
        }
        let mut buf = versioned.version.to_bytes();
        buf.extend_from_slice(&versioned.value);
        wire::write_stream_entry(w, &key, &buf)?;
        streamed += 1;
    }
    wire::write_stream_end(w)?;
    wire::write_ok(w)?;
    debug!(store = store_name, streamed, "partition stream served");
    Ok(())
}

/// Applies a streamed partition onto the local engine. `ObsoleteVersion`
/// from the engine is swallowed and counted: transfers are idempotent and
/// may race newer live writes. Any other failure terminates the stream
/// with a nonzero prelude and drops the connection.
fn serve_put_partition_stream(
    services: &Services,
    store_name: &str,
    r: &mut impl Read,
    w: &mut impl Write,
) -> Result<()> {
    let engine = services.engine(store_name);
    let mut applied = 0usize;
    let mut obsolete = 0usize;

    while let Some((key, value)) = wire::read_stream_entry(r)? {
        let Ok(engine) = &engine else {
            // Unknown store: keep draining so the sentinel and prelude
            // stay in frame.
            continue;
        };
        let outcome = VectorClock::from_bytes_prefix(&value)
            .map_err(StoreError::from)
            .and_then(|(clock, consumed)| {
                engine.put(
                    Bytes::copy_from_slice(&key),
                    Versioned::new(Bytes::copy_from_slice(&value[consumed..]), clock),
                )
            });
        match outcome {
            Ok(()) => applied += 1,
            Err(StoreError::ObsoleteVersion(_)) => obsolete += 1,
            Err(err) => {
                warn!(store = store_name, "partition stream aborted: {err}");
                wire::write_error(w, &err)?;
                w.flush()?;
                return Err(err);
            }
        }
    }

    match engine {
        Ok(_) => {
            debug!(store = store_name, applied, obsolete, "partition stream applied");
            wire::write_ok(w)
        }
        Err(err) => {
            warn!(store = store_name, "partition stream refused: {err}");
            wire::write_error(w, &err)
        }
    }
}
