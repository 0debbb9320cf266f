//! Cluster topology: nodes, partition ownership, and rebalance planning.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{Result, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    Available,
    Unavailable,
}

/// One server in the cluster and the partitions it owns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub id: u16,
    pub host: String,
    pub http_port: u16,
    pub socket_port: u16,
    pub admin_port: u16,
    pub partitions: Vec<u16>,
    pub status: NodeStatus,
}

impl Node {
    pub fn new(
        id: u16,
        host: impl Into<String>,
        http_port: u16,
        socket_port: u16,
        admin_port: u16,
        partitions: Vec<u16>,
    ) -> Self {
        let mut partitions = partitions;
        partitions.sort_unstable();
        Node {
            id,
            host: host.into(),
            http_port,
            socket_port,
            admin_port,
            partitions,
            status: NodeStatus::Available,
        }
    }

    /// The same node with a different partition set.
    pub fn with_partitions(&self, partitions: Vec<u16>) -> Node {
        let mut node = self.clone();
        let mut partitions = partitions;
        partitions.sort_unstable();
        node.partitions = partitions;
        node
    }

    pub fn admin_addr(&self) -> String {
        format!("{}:{}", self.host, self.admin_port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} ({}:{})", self.id, self.host, self.socket_port)
    }
}

/// The full topology. Node ids are unique and the partition sets of all
/// nodes partition `[0, P)` disjointly and exhaustively.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cluster {
    name: String,
    nodes: BTreeMap<u16, Node>,
}

impl Cluster {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>) -> Result<Cluster> {
        let name = name.into();
        let mut map = BTreeMap::new();
        let mut seen = BTreeSet::new();
        let mut total = 0usize;
        for node in nodes {
            for &p in &node.partitions {
                if !seen.insert(p) {
                    return Err(StoreError::InvalidRequest(format!(
                        "partition {p} owned by more than one node in cluster `{name}`"
                    )));
                }
                total += 1;
            }
            if map.insert(node.id, node).is_some() {
                return Err(StoreError::InvalidRequest(format!(
                    "duplicate node id in cluster `{name}`"
                )));
            }
        }
        // Contiguity: the union must be exactly 0..P.
        if let Some(&max) = seen.iter().next_back() {
            if max as usize + 1 != total {
                return Err(StoreError::InvalidRequest(format!(
                    "partitions of cluster `{name}` are not contiguous from 0"
                )));
            }
        }
        Ok(Cluster { name, nodes: map })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self, id: u16) -> Result<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| StoreError::InvalidRequest(format!("no node {id} in cluster")))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.nodes.keys().copied()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_partitions(&self) -> u16 {
        self.nodes.values().map(|n| n.partitions.len() as u16).sum()
    }
}

/// Planned final topology when `thief_id` steals partitions from every
/// other node: each donor cedes the first half (rounded down) of its
/// partition list, in ascending partition order.
pub fn steal_partitions(cluster: &Cluster, thief_id: u16) -> Result<Cluster> {
    cluster.node(thief_id)?;
    let mut nodes = Vec::with_capacity(cluster.node_count());
    let mut stolen: Vec<u16> = Vec::new();
    for node in cluster.nodes() {
        if node.id == thief_id {
            continue;
        }
        let take = node.partitions.len() / 2;
        stolen.extend_from_slice(&node.partitions[..take]);
        nodes.push(node.with_partitions(node.partitions[take..].to_vec()));
    }
    let thief = cluster.node(thief_id)?;
    let mut kept = thief.partitions.clone();
    kept.extend_from_slice(&stolen);
    nodes.push(thief.with_partitions(kept));
    Cluster::new(cluster.name(), nodes)
}

/// Planned topology after `leaving_id` departs: its partitions are dealt
/// round-robin over the surviving nodes in ascending node-id order.
pub fn delete_node(cluster: &Cluster, leaving_id: u16) -> Result<Cluster> {
    let leaving = cluster.node(leaving_id)?.clone();
    let survivors: Vec<&Node> = cluster.nodes().filter(|n| n.id != leaving_id).collect();
    if survivors.is_empty() {
        return Err(StoreError::InvalidRequest(
            "cannot remove the last node of a cluster".into(),
        ));
    }
    let mut intake: BTreeMap<u16, Vec<u16>> = BTreeMap::new();
    for (i, &p) in leaving.partitions.iter().enumerate() {
        intake
            .entry(survivors[i % survivors.len()].id)
            .or_default()
            .push(p);
    }
    let mut nodes = Vec::with_capacity(survivors.len() + 1);
    for node in survivors {
        let mut partitions = node.partitions.clone();
        if let Some(extra) = intake.get(&node.id) {
            partitions.extend_from_slice(extra);
        }
        nodes.push(node.with_partitions(partitions));
    }
    nodes.push(leaving.with_partitions(Vec::new()));
    Cluster::new(cluster.name(), nodes)
}

/// Partitions that move from `from_id` to `to_id` between the two plans:
/// owned by `from` in `old` and by `to` in `updated`.
pub fn steal_list(old: &Cluster, updated: &Cluster, from_id: u16, to_id: u16) -> Result<Vec<u16>> {
    let from_old: BTreeSet<u16> = old.node(from_id)?.partitions.iter().copied().collect();
    let to_new = &updated.node(to_id)?.partitions;
    Ok(to_new
        .iter()
        .copied()
        .filter(|p| from_old.contains(p))
        .collect())
}

/// The atomic per-donor intermediate: `current` with `steal` moved from
/// `from_id` to `to_id` and every other node untouched.
pub fn temp_cluster(
    current: &Cluster,
    from_id: u16,
    to_id: u16,
    steal: &[u16],
) -> Result<Cluster> {
    let moving: BTreeSet<u16> = steal.iter().copied().collect();
    let mut nodes = Vec::with_capacity(current.node_count());
    for node in current.nodes() {
        if node.id == from_id {
            let kept: Vec<u16> = node
                .partitions
                .iter()
                .copied()
                .filter(|p| !moving.contains(p))
                .collect();
            nodes.push(node.with_partitions(kept));
        } else if node.id == to_id {
            let mut grown = node.partitions.clone();
            grown.extend(moving.iter().copied());
            nodes.push(node.with_partitions(grown));
        } else {
            nodes.push(node.clone());
        }
    }
    Cluster::new(current.name(), nodes)
}
