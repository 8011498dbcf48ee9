// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bus numbering and domain propagation over a [`TopologyTree`].
//!
//! Secondary bus numbers come from a single counter shared by the whole
//! forest, so sibling subtrees never reuse a bus number. Devices directly
//! on the root bus have primary bus 0. Below that, the children of a device
//! get the value of the running counter right after their parent was
//! numbered as their primary bus.
//!
//! The out-of-domain flag only ever flows downwards: once a device is
//! outside the firmware-visible domain, so is everything behind it.

use crate::FIRST_SECONDARY_BUS;
use crate::device::PcieDevice;
use crate::error::ConfigError;
use crate::tree::NodeIndex;
use crate::tree::TopologyTree;
use std::sync::Arc;

/// The running secondary bus counter.
#[derive(Debug, Clone)]
pub(crate) struct BusNumbering {
    next_secondary_bus: u16,
}

impl BusNumbering {
    /// Starts numbering secondary buses at 1, right below the root bus.
    pub(crate) fn new() -> Self {
        Self {
            next_secondary_bus: FIRST_SECONDARY_BUS,
        }
    }

    /// Assigns buses to `devices`, which hold one device per node of `tree`,
    /// indexed by [`NodeIndex`].
    pub(crate) fn assign(
        &mut self,
        tree: &TopologyTree,
        devices: &mut [PcieDevice],
    ) -> Result<(), ConfigError> {
        debug_assert_eq!(tree.len(), devices.len());
        self.assign_level(tree, devices, tree.roots(), tree.root_bus(), 0, false)
    }

    fn assign_level(
        &mut self,
        tree: &TopologyTree,
        devices: &mut [PcieDevice],
        nodes: &[NodeIndex],
        bus: &Arc<str>,
        primary_bus: u8,
        in_domain: bool,
    ) -> Result<(), ConfigError> {
        for &index in nodes {
            let device = &mut devices[index.index()];
            self.next_secondary_bus =
                device.assign_bus(bus.clone(), primary_bus, self.next_secondary_bus)?;
            device.set_domain(in_domain);

            tracing::debug!(
                id = device.id(),
                bus = device.bus(),
                primary_bus = device.primary_bus(),
                secondary_bus = device.secondary_bus(),
                in_domain = device.in_domain(),
                "assigned bus"
            );

            let children = tree.node(index).children();
            if children.is_empty() {
                continue;
            }

            let child_bus: Arc<str> = device.id().into();
            let child_in_domain = device.in_domain();
            let child_primary_bus = u8::try_from(self.next_secondary_bus).map_err(|_| {
                ConfigError::BusNumbersExhausted {
                    id: device.id().to_owned(),
                }
            })?;
            self.assign_level(
                tree,
                devices,
                children,
                &child_bus,
                child_primary_bus,
                child_in_domain,
            )?;
        }

        Ok(())
    }
}
