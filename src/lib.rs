#![forbid(unsafe_code)]

//! ringkv: the cluster-aware storage plane of a partitioned, replicated
//! key-value store. Nodes own partitions of a hash ring, version values
//! with vector clocks, quarantine misrouted writes as slop, and migrate
//! partitions between each other over an opcode-framed admin channel.

pub mod admin;
pub mod cluster;
pub mod config;
pub mod error;
pub mod routing;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod versioning;
pub mod xml;

pub use error::{Result, StoreError};
pub use versioning::{Occurred, VectorClock, Versioned};
