//! Directed weighted graph of mesh nodes rooted at the coordinator.

use crate::nodeid::fmt_node_id;
use crate::GraphError;
use hub_wire::MeshNodeId;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use tracing::debug;

/// Tag given to the coordinator vertex
pub const LOCAL_NODE_TAG: &str = "local";

/// Largest RSSI magnitude taken into account by [`rssi_to_weight`]
pub const RSSI_CLAMP: i32 = 44;

/// Convert a radio RSSI reading into an edge cost.
///
/// Non positive readings are doubled in magnitude, everything is clamped at
/// 44, and the result is `1 - rssi / 45`. The weight always lies in
/// `[1/45, 1]`.
pub fn rssi_to_weight(rssi: i16) -> f64 {
    let rssi = rssi as i32;
    let magnitude = if rssi <= 0 { rssi * -2 } else { rssi };
    1.0 - magnitude.min(RSSI_CLAMP) as f64 / 45.0
}

/// Mesh node vertex
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node address
    pub id: MeshNodeId,
    /// Administratively enabled
    pub in_use: bool,
    /// Neighbour table already collected
    pub discovered: bool,
    /// Free text label
    #[serde(default)]
    pub tag: String,
}

impl Node {
    /// New enabled, undiscovered node
    pub fn new(id: MeshNodeId) -> Self {
        Self {
            id,
            in_use: true,
            discovered: false,
            tag: String::new(),
        }
    }
}

/// Directed edge
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node
    pub from: MeshNodeId,
    /// Destination node
    pub to: MeshNodeId,
    /// Cost in (0, 1]
    pub weight: f64,
}

/// Serializable form of a [`Network`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    /// Coordinator node
    pub local: MeshNodeId,
    /// All vertices
    pub nodes: Vec<Node>,
    /// All edges
    pub edges: Vec<Edge>,
}

/// Lowest cost path from the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    /// Node sequence, coordinator first and target last
    pub nodes: Vec<MeshNodeId>,
    /// Sum of edge weights
    pub weight: f64,
}

impl Path {
    /// Number of vertices on the path (1 for the coordinator itself)
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True for an empty path (never returned by [`Network::get_path`])
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Target node
    pub fn target(&self) -> Option<MeshNodeId> {
        self.nodes.last().copied()
    }

    /// Hops strictly between coordinator and target
    pub fn intermediate(&self) -> &[MeshNodeId] {
        if self.nodes.len() <= 2 {
            &[]
        } else {
            &self.nodes[1..self.nodes.len() - 1]
        }
    }

    /// Every hop after the coordinator, target included
    pub fn after_local(&self) -> &[MeshNodeId] {
        self.nodes.get(1..).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Cost(f64);

impl Eq for Cost {}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cost {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

fn check_weight(weight: f64) -> Result<(), GraphError> {
    if weight.is_finite() && weight > 0.0 && weight <= 1.0 {
        Ok(())
    } else {
        Err(GraphError::InvalidWeight(weight))
    }
}

/// Mesh graph with exactly one coordinator vertex
#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    local: MeshNodeId,
    nodes: BTreeMap<MeshNodeId, Node>,
    edges: BTreeMap<MeshNodeId, BTreeMap<MeshNodeId, f64>>,
}

impl Network {
    /// Graph holding only the coordinator
    pub fn new(local: MeshNodeId) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            local,
            Node {
                id: local,
                in_use: true,
                discovered: false,
                tag: LOCAL_NODE_TAG.to_string(),
            },
        );
        Self {
            local,
            nodes,
            edges: BTreeMap::new(),
        }
    }

    /// Rebuild a graph from a snapshot
    pub fn from_snapshot(snapshot: NetworkSnapshot) -> Result<Self, GraphError> {
        let mut network = Self::new(snapshot.local);
        for node in snapshot.nodes {
            network.nodes.insert(node.id, node);
        }
        for edge in snapshot.edges {
            network.set_edge_weight(edge.from, edge.to, edge.weight)?;
        }
        Ok(network)
    }

    /// Serializable copy of the graph
    pub fn snapshot(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            local: self.local,
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges().collect(),
        }
    }

    /// Coordinator node id
    pub fn local_node_id(&self) -> MeshNodeId {
        self.local
    }

    /// Lookup a node
    pub fn node(&self, id: MeshNodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// True when the node exists
    pub fn contains_node(&self, id: MeshNodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// All nodes ordered by id
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Ids of enabled nodes
    pub fn in_use_nodes(&self) -> Vec<MeshNodeId> {
        self.nodes
            .values()
            .filter(|n| n.in_use)
            .map(|n| n.id)
            .collect()
    }

    /// Insert a node if missing and return it
    pub fn add_node(&mut self, id: MeshNodeId) -> &mut Node {
        self.nodes.entry(id).or_insert_with(|| Node::new(id))
    }

    /// Remove a node and every edge touching it
    pub fn remove_node(&mut self, id: MeshNodeId) -> Result<Node, GraphError> {
        if id == self.local {
            return Err(GraphError::LocalNode(id));
        }
        let node = self.nodes.remove(&id).ok_or(GraphError::NodeNotFound(id))?;
        self.edges.remove(&id);
        for targets in self.edges.values_mut() {
            targets.remove(&id);
        }
        self.edges.retain(|_, targets| !targets.is_empty());
        Ok(node)
    }

    fn node_mut(&mut self, id: MeshNodeId) -> Result<&mut Node, GraphError> {
        self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))
    }

    /// Enable or disable a node
    pub fn set_node_in_use(&mut self, id: MeshNodeId, in_use: bool) -> Result<(), GraphError> {
        self.node_mut(id)?.in_use = in_use;
        Ok(())
    }

    /// Mark a node as discovered
    pub fn set_node_discovered(
        &mut self,
        id: MeshNodeId,
        discovered: bool,
    ) -> Result<(), GraphError> {
        self.node_mut(id)?.discovered = discovered;
        Ok(())
    }

    /// Change a node tag
    pub fn set_node_tag(&mut self, id: MeshNodeId, tag: impl Into<String>) -> Result<(), GraphError> {
        self.node_mut(id)?.tag = tag.into();
        Ok(())
    }

    /// Clear the discovered flag everywhere
    pub fn clear_discovered(&mut self) {
        for node in self.nodes.values_mut() {
            node.discovered = false;
        }
    }

    /// Weight of the edge `from -> to`
    pub fn edge_weight(&self, from: MeshNodeId, to: MeshNodeId) -> Option<f64> {
        self.edges.get(&from).and_then(|t| t.get(&to)).copied()
    }

    /// All edges ordered by source then destination
    pub fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        self.edges.iter().flat_map(|(from, targets)| {
            targets.iter().map(move |(to, weight)| Edge {
                from: *from,
                to: *to,
                weight: *weight,
            })
        })
    }

    /// Outgoing neighbours of a node
    pub fn neighbors(&self, id: MeshNodeId) -> Vec<(MeshNodeId, f64)> {
        self.edges
            .get(&id)
            .map(|t| t.iter().map(|(to, w)| (*to, *w)).collect())
            .unwrap_or_default()
    }

    /// Overwrite the weight of `from -> to`, creating missing nodes
    pub fn set_edge_weight(
        &mut self,
        from: MeshNodeId,
        to: MeshNodeId,
        weight: f64,
    ) -> Result<(), GraphError> {
        if from == to {
            return Err(GraphError::SelfLoop(from));
        }
        check_weight(weight)?;
        self.add_node(from);
        self.add_node(to);
        self.edges.entry(from).or_default().insert(to, weight);
        Ok(())
    }

    /// Merge a measurement into both directions of a link.
    ///
    /// `from -> to` receives `weight_to` and `to -> from` receives
    /// `weight_from`. A missing edge takes the value directly, an existing
    /// one becomes the average of old and new. Missing nodes are created
    /// enabled.
    pub fn change_edge_weight(
        &mut self,
        from: MeshNodeId,
        to: MeshNodeId,
        weight_from: f64,
        weight_to: f64,
    ) -> Result<(), GraphError> {
        if from == to {
            return Err(GraphError::SelfLoop(from));
        }
        check_weight(weight_from)?;
        check_weight(weight_to)?;

        self.merge_directed(from, to, weight_to);
        self.merge_directed(to, from, weight_from);
        Ok(())
    }

    fn merge_directed(&mut self, from: MeshNodeId, to: MeshNodeId, weight: f64) {
        self.add_node(from);
        self.add_node(to);
        let targets = self.edges.entry(from).or_default();
        let merged = match targets.get(&to) {
            Some(old) => (old + weight) / 2.0,
            None => weight,
        };
        debug!(
            "Edge {} -> {} weight {:.3}",
            fmt_node_id(from),
            fmt_node_id(to),
            merged
        );
        targets.insert(to, merged);
    }

    /// Remove the edge `from -> to`
    pub fn remove_edge(&mut self, from: MeshNodeId, to: MeshNodeId) -> Option<f64> {
        let targets = self.edges.get_mut(&from)?;
        let removed = targets.remove(&to);
        if targets.is_empty() {
            self.edges.remove(&from);
        }
        removed
    }

    /// Shortest path from the coordinator to `to` (Dijkstra).
    ///
    /// Disabled nodes are never used as relays.
    pub fn get_path(&self, to: MeshNodeId) -> Result<Path, GraphError> {
        let target = self.nodes.get(&to).ok_or(GraphError::NodeNotFound(to))?;
        if !target.in_use {
            return Err(GraphError::NodeNotInUse(to));
        }
        if to == self.local {
            return Ok(Path {
                nodes: vec![self.local],
                weight: 0.0,
            });
        }

        let mut distances: HashMap<MeshNodeId, f64> = HashMap::new();
        let mut previous: HashMap<MeshNodeId, MeshNodeId> = HashMap::new();
        let mut unvisited: BinaryHeap<Reverse<(Cost, MeshNodeId)>> = BinaryHeap::new();

        distances.insert(self.local, 0.0);
        unvisited.push(Reverse((Cost(0.0), self.local)));

        while let Some(Reverse((Cost(current_dist), current_node))) = unvisited.pop() {
            if current_node == to {
                break;
            }
            // Skip if we've already found a better path
            if current_dist > distances.get(&current_node).copied().unwrap_or(f64::INFINITY) {
                continue;
            }

            let Some(targets) = self.edges.get(&current_node) else {
                continue;
            };
            for (&neighbor, &weight) in targets {
                let usable = self.nodes.get(&neighbor).map(|n| n.in_use).unwrap_or(false);
                if !usable {
                    continue;
                }
                let new_dist = current_dist + weight;
                if new_dist < distances.get(&neighbor).copied().unwrap_or(f64::INFINITY) {
                    distances.insert(neighbor, new_dist);
                    previous.insert(neighbor, current_node);
                    unvisited.push(Reverse((Cost(new_dist), neighbor)));
                }
            }
        }

        let weight = *distances.get(&to).ok_or(GraphError::NoPath(to))?;

        let mut nodes = vec![to];
        let mut cursor = to;
        while let Some(&prev) = previous.get(&cursor) {
            nodes.push(prev);
            cursor = prev;
        }
        nodes.reverse();

        Ok(Path { nodes, weight })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_network() -> Network {
        // 1 -> 2 -> 3 -> 4 plus a costly shortcut 1 -> 3
        let mut net = Network::new(1);
        net.set_edge_weight(1, 2, 0.2).unwrap();
        net.set_edge_weight(2, 3, 0.2).unwrap();
        net.set_edge_weight(3, 4, 0.2).unwrap();
        net.set_edge_weight(1, 3, 0.9).unwrap();
        net
    }

    #[test]
    fn test_new_network_has_local_node() {
        let net = Network::new(0x42);
        let local = net.node(0x42).unwrap();
        assert!(local.in_use);
        assert_eq!(local.tag, LOCAL_NODE_TAG);
        assert_eq!(net.node_count(), 1);
        assert!(matches!(net.clone().remove_node(0x42), Err(GraphError::LocalNode(0x42))));
    }

    #[test]
    fn test_path_to_local() {
        let net = line_network();
        let path = net.get_path(1).unwrap();
        assert_eq!(path.nodes, vec![1]);
        assert_eq!(path.len(), 1);
        assert!(path.intermediate().is_empty());
    }

    #[test]
    fn test_shortest_path() {
        let net = line_network();
        let path = net.get_path(4).unwrap();
        assert_eq!(path.nodes, vec![1, 2, 3, 4]);
        assert!((path.weight - 0.6).abs() < 1e-9);
        assert_eq!(path.intermediate(), &[2, 3]);
        assert_eq!(path.after_local(), &[2, 3, 4]);
    }

    #[test]
    fn test_path_errors() {
        let mut net = line_network();
        net.add_node(9);
        assert!(matches!(net.get_path(9), Err(GraphError::NoPath(9))));
        assert!(matches!(net.get_path(77), Err(GraphError::NodeNotFound(77))));

        net.set_node_in_use(4, false).unwrap();
        assert!(matches!(net.get_path(4), Err(GraphError::NodeNotInUse(4))));
    }

    #[test]
    fn test_disabled_relay_is_avoided() {
        let mut net = line_network();
        net.set_node_in_use(2, false).unwrap();
        let path = net.get_path(4).unwrap();
        assert_eq!(path.nodes, vec![1, 3, 4]);
    }

    #[test]
    fn test_change_edge_weight_averages_each_direction() {
        let mut net = Network::new(1);
        net.change_edge_weight(1, 2, 0.4, 0.8).unwrap();
        assert_eq!(net.edge_weight(1, 2), Some(0.8));
        assert_eq!(net.edge_weight(2, 1), Some(0.4));
        assert!(net.node(2).unwrap().in_use);

        net.change_edge_weight(1, 2, 0.6, 0.2).unwrap();
        assert!((net.edge_weight(1, 2).unwrap() - 0.5).abs() < 1e-9);
        assert!((net.edge_weight(2, 1).unwrap() - 0.5).abs() < 1e-9);

        // Only one direction known: the other is set directly
        net.set_edge_weight(3, 1, 0.3).unwrap();
        net.change_edge_weight(1, 3, 0.9, 0.7).unwrap();
        assert!((net.edge_weight(3, 1).unwrap() - 0.6).abs() < 1e-9);
        assert_eq!(net.edge_weight(1, 3), Some(0.7));
    }

    #[test]
    fn test_invalid_edges() {
        let mut net = Network::new(1);
        assert!(matches!(net.set_edge_weight(1, 1, 0.5), Err(GraphError::SelfLoop(1))));
        assert!(matches!(
            net.set_edge_weight(1, 2, 0.0),
            Err(GraphError::InvalidWeight(_))
        ));
        assert!(net.set_edge_weight(1, 2, f64::NAN).is_err());
        assert!(net.set_edge_weight(1, 2, 1.0).is_ok());
    }

    #[test]
    fn test_remove_node_drops_edges() {
        let mut net = line_network();
        net.remove_node(3).unwrap();
        assert_eq!(net.edge_weight(2, 3), None);
        assert_eq!(net.edge_weight(3, 4), None);
        assert_eq!(net.edges().count(), 1);
        assert!(matches!(net.get_path(4), Err(GraphError::NoPath(4))));
    }

    #[test]
    fn test_snapshot_restores_graph() {
        let mut net = line_network();
        net.set_node_tag(2, "hall").unwrap();
        net.set_node_discovered(3, true).unwrap();
        let json = serde_json::to_string(&net.snapshot()).unwrap();
        let restored =
            Network::from_snapshot(serde_json::from_str::<NetworkSnapshot>(&json).unwrap())
                .unwrap();
        assert_eq!(restored, net);
    }

    #[test]
    fn test_rssi_to_weight() {
        assert_eq!(rssi_to_weight(0), 1.0);
        assert!((rssi_to_weight(44) - (1.0 - 44.0 / 45.0)).abs() < 1e-12);
        assert_eq!(rssi_to_weight(60), rssi_to_weight(44));
        assert!((rssi_to_weight(44) - 0.0222).abs() < 1e-3);
        assert!((rssi_to_weight(-10) - (1.0 - 20.0 / 45.0)).abs() < 1e-12);
        for rssi in i16::MIN..=i16::MAX {
            let w = rssi_to_weight(rssi);
            assert!((0.0..=1.0).contains(&w), "rssi {} -> {}", rssi, w);
        }
    }
}
