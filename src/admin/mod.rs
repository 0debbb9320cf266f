//! The admin channel: opcode wire format, socket pool, server-side
//! handlers, and the client that drives rebalancing.

pub mod client;
pub mod pool;
pub mod server;
pub mod wire;

pub use client::AdminClient;
pub use pool::{SocketDestination, SocketPool};
pub use server::{AdminServer, AdminServerHandle};
