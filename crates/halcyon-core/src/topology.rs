//! Parent/child tree view over the device list

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::device::{Device, DeviceState, Udi};

/// A node in the device tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyNode {
    pub udi: Udi,
    /// Human-readable product name (`info.product`), if known
    pub product: Option<String>,
    pub state: DeviceState,
    /// Bus the device sits on (`info.bus`)
    pub bus: Option<String>,
    pub children: Vec<Udi>,
}

/// Device tree built from parent links
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    nodes: HashMap<Udi, TopologyNode>,
    /// Devices without a parent, or whose parent is not in the tree
    roots: Vec<Udi>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the tree from a device snapshot
    pub fn from_devices(devices: &[Device]) -> Self {
        let mut topology = Self::new();

        for device in devices {
            topology.add_node(TopologyNode {
                udi: device.udi.clone(),
                product: device.properties.get_string("info.product").map(str::to_string),
                state: device.state,
                bus: device.properties.get_string("info.bus").map(str::to_string),
                children: Vec::new(),
            });
        }

        for device in devices {
            match &device.parent {
                Some(parent) if topology.nodes.contains_key(parent) => {
                    topology.add_child(parent, &device.udi);
                }
                _ => topology.roots.push(device.udi.clone()),
            }
        }

        topology.roots.sort();
        for node in topology.nodes.values_mut() {
            node.children.sort();
        }
        topology
    }

    pub fn add_node(&mut self, node: TopologyNode) {
        self.nodes.insert(node.udi.clone(), node);
    }

    pub fn add_child(&mut self, parent: &Udi, child: &Udi) {
        if let Some(node) = self.nodes.get_mut(parent) {
            if !node.children.contains(child) {
                node.children.push(child.clone());
            }
        }
    }

    pub fn get_node(&self, udi: &Udi) -> Option<&TopologyNode> {
        self.nodes.get(udi)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.values()
    }

    pub fn roots(&self) -> Vec<&TopologyNode> {
        self.roots.iter().filter_map(|udi| self.nodes.get(udi)).collect()
    }

    pub fn children(&self, udi: &Udi) -> Vec<&TopologyNode> {
        self.nodes
            .get(udi)
            .map(|node| {
                node.children
                    .iter()
                    .filter_map(|c| self.nodes.get(c))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get topology as JSON-serializable structure
    pub fn to_graph(&self) -> TopologyGraph {
        let mut nodes: Vec<TopologyNode> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.udi.cmp(&b.udi));
        TopologyGraph {
            nodes,
            roots: self.roots.clone(),
        }
    }
}

/// Serializable topology graph for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyGraph {
    pub nodes: Vec<TopologyNode>,
    pub roots: Vec<Udi>,
}
