//! Key-to-owner routing over the partition ring.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::Hasher;

use crate::cluster::{Cluster, Node};
use crate::error::{Result, StoreError};

/// Maps a key to its ordered preference list. Deterministic and total:
/// the same cluster and key always produce the same list.
pub trait RoutingStrategy: Send + Sync {
    /// Ordered owner list for `key`, length `min(replication_factor, nodes)`.
    fn route(&self, key: &[u8]) -> Vec<Node>;

    /// The same ring walk, yielding the partition that introduced each
    /// distinct owner. The first element is the key's master partition.
    fn partition_list(&self, key: &[u8]) -> Vec<u16>;
}

/// Hash the key to a partition, then walk the ring collecting distinct
/// owners until the replication factor is met. Ring order breaks ties.
pub struct ConsistentRouting {
    nodes: BTreeMap<u16, Node>,
    partition_owner: Vec<u16>,
    replicas: usize,
}

impl ConsistentRouting {
    pub fn new(cluster: &Cluster, replication_factor: usize) -> Result<ConsistentRouting> {
        let num_partitions = cluster.num_partitions() as usize;
        if num_partitions == 0 {
            return Err(StoreError::InvalidRequest(format!(
                "cluster `{}` has no partitions",
                cluster.name()
            )));
        }
        let mut partition_owner = vec![0u16; num_partitions];
        for node in cluster.nodes() {
            for &p in &node.partitions {
                partition_owner[p as usize] = node.id;
            }
        }
        Ok(ConsistentRouting {
            nodes: cluster.nodes().map(|n| (n.id, n.clone())).collect(),
            partition_owner,
            replicas: replication_factor,
        })
    }

    pub fn num_partitions(&self) -> usize {
        self.partition_owner.len()
    }

    pub fn master_partition(&self, key: &[u8]) -> u16 {
        let mut hasher = DefaultHasher::new();
        hasher.write(key);
        (hasher.finish() % self.partition_owner.len() as u64) as u16
    }

    fn walk(&self, key: &[u8]) -> Vec<(u16, u16)> {
        let total = self.partition_owner.len();
        let wanted = self.replicas.min(self.nodes.len());
        let start = self.master_partition(key) as usize;
        let mut picked: Vec<(u16, u16)> = Vec::with_capacity(wanted);
        for i in 0..total {
            let partition = ((start + i) % total) as u16;
            let owner = self.partition_owner[partition as usize];
            if picked.iter().all(|&(_, o)| o != owner) {
                picked.push((partition, owner));
                if picked.len() == wanted {
                    break;
                }
            }
        }
        picked
    }
}

impl RoutingStrategy for ConsistentRouting {
    fn route(&self, key: &[u8]) -> Vec<Node> {
        self.walk(key)
            .into_iter()
            .map(|(_, owner)| self.nodes[&owner].clone())
            .collect()
    }

    fn partition_list(&self, key: &[u8]) -> Vec<u16> {
        self.walk(key).into_iter().map(|(p, _)| p).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Node;

    fn cluster() -> Cluster {
        Cluster::new(
            "test",
            vec![
                Node::new(0, "localhost", 8081, 6666, 7777, vec![0, 2, 4]),
                Node::new(1, "localhost", 8082, 6667, 7778, vec![1, 5]),
                Node::new(2, "localhost", 8083, 6668, 7779, vec![3]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn routing_is_deterministic() {
        let a = ConsistentRouting::new(&cluster(), 2).unwrap();
        let b = ConsistentRouting::new(&cluster(), 2).unwrap();
        for key in [&b"alpha"[..], b"beta", b"gamma", b""] {
            assert_eq!(a.route(key), b.route(key));
            assert_eq!(a.partition_list(key), b.partition_list(key));
        }
    }

    #[test]
    fn route_length_and_distinctness() {
        for rf in 1..=4usize {
            let routing = ConsistentRouting::new(&cluster(), rf).unwrap();
            for i in 0..64u32 {
                let key = i.to_be_bytes();
                let owners = routing.route(&key);
                assert_eq!(owners.len(), rf.min(3));
                for (i, a) in owners.iter().enumerate() {
                    for b in &owners[i + 1..] {
                        assert_ne!(a.id, b.id);
                    }
                }
            }
        }
    }

    #[test]
    fn master_partition_heads_the_partition_list() {
        let routing = ConsistentRouting::new(&cluster(), 3).unwrap();
        for i in 0..64u32 {
            let key = i.to_be_bytes();
            let partitions = routing.partition_list(&key);
            assert_eq!(partitions[0], routing.master_partition(&key));
        }
    }

    #[test]
    fn ring_walk_yields_successive_owners() {
        let routing = ConsistentRouting::new(&cluster(), 3).unwrap();
        for i in 0..16u32 {
            let key = i.to_be_bytes();
            let owners = routing.route(&key);
            let partitions = routing.partition_list(&key);
            assert_eq!(owners.len(), partitions.len());
            for (node, &p) in owners.iter().zip(&partitions) {
                assert!(node.partitions.contains(&p));
            }
        }
    }
}
