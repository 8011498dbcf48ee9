// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Explicit tree form of a topology declaration.
//!
//! Nodes live in a single arena in pre-order, so a parent always has a
//! lower index than any of its descendants, and index order is the order
//! devices are created, numbered and rendered in.

use crate::config::PcieDeviceConfig;
use crate::config::PcieDeviceSettings;
use crate::config::PcieTopologyConfig;
use std::sync::Arc;

/// Index of a node in a [`TopologyTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIndex(usize);

impl NodeIndex {
    /// The position of the node in pre-order.
    pub fn index(self) -> usize {
        self.0
    }
}

/// One declared device and its links.
#[derive(Debug, Clone)]
pub struct TreeNode {
    settings: PcieDeviceSettings,
    parent: Option<NodeIndex>,
    children: Vec<NodeIndex>,
}

impl TreeNode {
    /// The device's declaration.
    pub fn settings(&self) -> &PcieDeviceSettings {
        &self.settings
    }

    /// The parent node, or `None` for devices on the root bus.
    pub fn parent(&self) -> Option<NodeIndex> {
        self.parent
    }

    /// The child nodes, in declaration order.
    pub fn children(&self) -> &[NodeIndex] {
        &self.children
    }
}

/// The shape of a topology, independent of bus numbering.
#[derive(Debug, Clone)]
pub struct TopologyTree {
    root_bus: Arc<str>,
    nodes: Vec<TreeNode>,
    roots: Vec<NodeIndex>,
}

impl TopologyTree {
    /// Flattens a declaration into a pre-order arena.
    pub fn from_config(config: &PcieTopologyConfig) -> Self {
        let mut tree = Self {
            root_bus: config.root_bus.as_str().into(),
            nodes: Vec::with_capacity(config.iter().count()),
            roots: Vec::with_capacity(config.devices.len()),
        };
        for device in &config.devices {
            let index = tree.insert(None, device);
            tree.roots.push(index);
        }
        tree
    }

    fn insert(&mut self, parent: Option<NodeIndex>, device: &PcieDeviceConfig) -> NodeIndex {
        let index = NodeIndex(self.nodes.len());
        self.nodes.push(TreeNode {
            settings: device.settings.clone(),
            parent,
            children: Vec::with_capacity(device.sub_devices.len()),
        });
        for child in &device.sub_devices {
            let child_index = self.insert(Some(index), child);
            self.nodes[index.0].children.push(child_index);
        }
        index
    }

    /// The name of the bus root-level devices attach to.
    pub fn root_bus(&self) -> &Arc<str> {
        &self.root_bus
    }

    /// The number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The root-level nodes.
    pub fn roots(&self) -> &[NodeIndex] {
        &self.roots
    }

    /// Looks up a node.
    pub fn node(&self, index: NodeIndex) -> &TreeNode {
        &self.nodes[index.0]
    }

    /// Iterates all nodes in pre-order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeIndex, &TreeNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (NodeIndex(i), node))
    }
}
