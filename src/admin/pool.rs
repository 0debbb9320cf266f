//! Blocking socket pool for the admin channel.
//!
//! Checkout is exclusive per destination: a stream is either idle in the
//! pool or in exactly one caller's hands. Callers return healthy sockets
//! with [`SocketPool::checkin`] and close broken ones with
//! [`SocketPool::destroy`] so a failed stream is never reused.

use std::collections::{HashMap, VecDeque};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::config::SocketPoolConfig;
use crate::error::{Result, StoreError};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SocketDestination {
    pub host: String,
    pub port: u16,
}

impl SocketDestination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        SocketDestination {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for SocketDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Default)]
struct DestinationState {
    idle: VecDeque<TcpStream>,
    active: usize,
}

pub struct SocketPool {
    config: SocketPoolConfig,
    state: Mutex<HashMap<SocketDestination, DestinationState>>,
    released: Condvar,
}

impl SocketPool {
    pub fn new(config: SocketPoolConfig) -> SocketPool {
        SocketPool {
            config,
            state: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Takes an idle stream or opens a new one, blocking up to the pool
    /// timeout when the destination is at its connection limit.
    pub fn checkout(&self, dest: &SocketDestination) -> Result<TcpStream> {
        let deadline = Instant::now() + Duration::from_millis(self.config.pool_timeout_ms);
        let mut state = self.lock();
        loop {
            let entry = state.entry(dest.clone()).or_default();
            if let Some(stream) = entry.idle.pop_front() {
                entry.active += 1;
                return Ok(stream);
            }
            if entry.active < self.config.max_connections_per_node {
                entry.active += 1;
                drop(state);
                return match self.connect(dest) {
                    Ok(stream) => Ok(stream),
                    Err(err) => {
                        self.release_slot(dest);
                        Err(err)
                    }
                };
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(StoreError::Timeout(format!(
                    "socket pool exhausted for {dest}"
                )));
            };
            let (guard, _) = self
                .released
                .wait_timeout(state, remaining)
                .expect("socket pool mutex poisoned");
            state = guard;
        }
    }

    /// Returns a healthy stream for reuse.
    pub fn checkin(&self, dest: &SocketDestination, stream: TcpStream) {
        let mut state = self.lock();
        let entry = state.entry(dest.clone()).or_default();
        entry.active = entry.active.saturating_sub(1);
        if entry.idle.len() < self.config.max_cached_per_node {
            entry.idle.push_back(stream);
        }
        drop(state);
        self.released.notify_one();
    }

    /// Drops a stream that saw an IO failure instead of returning it.
    pub fn destroy(&self, dest: &SocketDestination, stream: TcpStream) {
        drop(stream);
        self.release_slot(dest);
    }

    fn release_slot(&self, dest: &SocketDestination) {
        let mut state = self.lock();
        let entry = state.entry(dest.clone()).or_default();
        entry.active = entry.active.saturating_sub(1);
        drop(state);
        self.released.notify_one();
    }

    fn connect(&self, dest: &SocketDestination) -> Result<TcpStream> {
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let socket_timeout = Duration::from_millis(self.config.socket_timeout_ms);
        let addr = format!("{}:{}", dest.host, dest.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                StoreError::InvalidRequest(format!("destination {dest} does not resolve"))
            })?;
        let stream = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|err| {
            if err.kind() == std::io::ErrorKind::TimedOut {
                StoreError::Timeout(format!("connect to {dest} timed out"))
            } else {
                StoreError::Io(err)
            }
        })?;
        stream.set_read_timeout(Some(socket_timeout))?;
        stream.set_write_timeout(Some(socket_timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SocketDestination, DestinationState>> {
        self.state.lock().expect("socket pool mutex poisoned")
    }
}
