// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The topology builder.

use crate::address::Bdf;
use crate::config::PcieTopologyConfig;
use crate::device::PcieDevice;
use crate::error::ConfigError;
use crate::error::TopologyError;
use crate::fw_cfg::FirmwareConfigEntry;
use crate::fw_cfg::FirmwareConfigSink;
use crate::numbering::BusNumbering;
use crate::tree::TopologyTree;
use std::collections::BTreeMap;

/// The phases a [`PcieTopology`] moves through. Each operation is valid in
/// exactly one phase and there is no going back. An operation that fails
/// moves the builder to [`TopologyPhase::Failed`] for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyPhase {
    /// Nothing has been checked yet.
    Unvalidated,
    /// Ids and slots are known to be unique.
    Validated,
    /// Devices exist and buses are numbered.
    Built,
    /// Devices are initialized and firmware entries have been emitted.
    Initialized,
    /// An operation failed. Nothing further can be done with the builder.
    Failed,
}

/// Builds a PCIe topology from its declaration.
///
/// ```
/// # use pcie_topology::*;
/// let config = PcieTopologyConfig::from_yaml(
///     "- id: rp0\n  device: ioh3420\n  addr: \"1c.0\"\n",
/// )?;
/// let mut topology = PcieTopology::new(Some(config));
/// topology.validate()?;
/// topology.build()?;
/// let mut entries: Vec<FirmwareConfigEntry> = Vec::new();
/// topology.initialize_all(&mut entries)?;
/// assert_eq!(
///     topology.render_options()?,
///     ["-device ioh3420,id=rp0,bus=pcie.0,addr=1c.0"]
/// );
/// assert_eq!(entries[0].sec_bus, 1);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct PcieTopology {
    config: Option<PcieTopologyConfig>,
    phase: TopologyPhase,
    tree: Option<TopologyTree>,
    devices: Vec<PcieDevice>,
}

impl PcieTopology {
    /// Creates a builder for `config`. A missing declaration is reported by
    /// [`PcieTopology::validate`].
    pub fn new(config: Option<PcieTopologyConfig>) -> Self {
        Self {
            config,
            phase: TopologyPhase::Unvalidated,
            tree: None,
            devices: Vec::new(),
        }
    }

    /// The current phase.
    pub fn phase(&self) -> TopologyPhase {
        self.phase
    }

    /// The explicit tree, once built.
    pub fn tree(&self) -> Option<&TopologyTree> {
        self.tree.as_ref()
    }

    /// All devices in creation (pre-order) order. Empty until built.
    pub fn devices(&self) -> &[PcieDevice] {
        &self.devices
    }

    /// Looks up a device by id.
    pub fn device(&self, id: &str) -> Option<&PcieDevice> {
        self.devices.iter().find(|device| device.id() == id)
    }

    fn expect_phase(
        &self,
        operation: &'static str,
        expected: TopologyPhase,
    ) -> Result<(), TopologyError> {
        if self.phase != expected {
            return Err(TopologyError::InvalidPhase {
                operation,
                expected,
                actual: self.phase,
            });
        }
        Ok(())
    }

    fn advance<T>(
        &mut self,
        result: Result<T, TopologyError>,
        next: TopologyPhase,
    ) -> Result<T, TopologyError> {
        self.phase = if result.is_ok() {
            next
        } else {
            TopologyPhase::Failed
        };
        result
    }

    /// Checks that a declaration is present and that every id, and every
    /// declared slot, is unique across the whole forest.
    pub fn validate(&mut self) -> Result<(), TopologyError> {
        self.expect_phase("validate", TopologyPhase::Unvalidated)?;
        let result = self.check_declaration();
        self.advance(result, TopologyPhase::Validated)
    }

    fn check_declaration(&self) -> Result<(), TopologyError> {
        let config = self.config.as_ref().ok_or(ConfigError::MissingTopology)?;

        let mut ids = BTreeMap::<&str, usize>::new();
        let mut slots = BTreeMap::<u32, usize>::new();
        for device in config.iter() {
            *ids.entry(device.settings.id.as_str()).or_default() += 1;
            if let Some(slot) = device.settings.slot {
                *slots.entry(slot).or_default() += 1;
            }
        }

        let duplicate_ids: Vec<String> = ids
            .into_iter()
            .filter(|&(_, count)| count > 1)
            .map(|(id, _)| id.to_owned())
            .collect();
        if !duplicate_ids.is_empty() {
            return Err(ConfigError::DuplicateIds(duplicate_ids).into());
        }

        let duplicate_slots: Vec<u32> = slots
            .into_iter()
            .filter(|&(_, count)| count > 1)
            .map(|(slot, _)| slot)
            .collect();
        if !duplicate_slots.is_empty() {
            return Err(ConfigError::DuplicateSlots(duplicate_slots).into());
        }

        Ok(())
    }

    /// Creates one device per declared element and numbers the buses.
    pub fn build(&mut self) -> Result<(), TopologyError> {
        self.expect_phase("build", TopologyPhase::Validated)?;
        let result = self.create_devices();
        let (tree, devices) = self.advance(result, TopologyPhase::Built)?;
        self.tree = Some(tree);
        self.devices = devices;
        Ok(())
    }

    fn create_devices(&self) -> Result<(TopologyTree, Vec<PcieDevice>), TopologyError> {
        let config = self.config.as_ref().ok_or(ConfigError::MissingTopology)?;

        tracing::info!(root_bus = config.root_bus.as_str(), "pcie topology build start");

        let tree = TopologyTree::from_config(config);
        let mut devices: Vec<_> = tree
            .iter()
            .map(|(_, node)| PcieDevice::new(node.settings().clone()))
            .collect();
        BusNumbering::new().assign(&tree, &mut devices)?;

        Ok((tree, devices))
    }

    /// Validates and initializes every device in creation order, and hands
    /// each firmware-visible device's entry to `sink`.
    ///
    /// Entries are only handed over once every device has initialized, so a
    /// failure leaves `sink` untouched.
    pub fn initialize_all(&mut self, sink: &mut dyn FirmwareConfigSink) -> Result<(), TopologyError> {
        self.expect_phase("initialize", TopologyPhase::Built)?;
        let result = self.initialize_devices();
        let entries = self.advance(result, TopologyPhase::Initialized)?;

        for entry in entries {
            sink.add_topology_entry(entry);
        }

        tracing::info!(devices = self.devices.len(), "pcie topology end");
        Ok(())
    }

    fn initialize_devices(&mut self) -> Result<Vec<FirmwareConfigEntry>, TopologyError> {
        let mut entries = Vec::new();
        for device in &mut self.devices {
            device.validate()?;
            device.initialize();
            if let Some(entry) = device.firmware_config_entry()? {
                tracing::info!(
                    id = entry.id.as_str(),
                    bdf = entry.bdf,
                    address = %Bdf::decode(entry.bdf),
                    sec_bus = entry.sec_bus,
                    "firmware config entry"
                );
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Renders the `-device` option fragments of all devices, in creation
    /// order.
    pub fn render_options(&self) -> Result<Vec<String>, TopologyError> {
        self.expect_phase("render options", TopologyPhase::Initialized)?;
        Ok(self
            .devices
            .iter()
            .map(PcieDevice::option_fragment)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PcieDeviceConfig;
    use crate::device::PcieDeviceKind;

    fn run(config: PcieTopologyConfig) -> (PcieTopology, Vec<FirmwareConfigEntry>) {
        let mut topology = PcieTopology::new(Some(config));
        topology.validate().unwrap();
        topology.build().unwrap();
        let mut entries: Vec<FirmwareConfigEntry> = Vec::new();
        topology.initialize_all(&mut entries).unwrap();
        (topology, entries)
    }

    #[test]
    fn test_missing_topology() {
        let mut topology = PcieTopology::new(None);
        assert!(matches!(
            topology.validate(),
            Err(TopologyError::Config(ConfigError::MissingTopology))
        ));
        assert_eq!(topology.phase(), TopologyPhase::Failed);
        assert!(matches!(
            topology.validate(),
            Err(TopologyError::InvalidPhase {
                actual: TopologyPhase::Failed,
                ..
            })
        ));
    }

    #[test]
    fn test_duplicate_ids_across_subtrees() {
        let mut topology = PcieTopology::new(Some(PcieTopologyConfig::new(vec![
            PcieDeviceConfig::new("rp0", PcieDeviceKind::RootPort).with_sub_device(
                PcieDeviceConfig::new("dup", PcieDeviceKind::UpstreamSwitchPort),
            ),
            PcieDeviceConfig::new("rp1", PcieDeviceKind::RootPort)
                .with_sub_device(PcieDeviceConfig::new("x", PcieDeviceKind::UpstreamSwitchPort))
                .with_sub_device(PcieDeviceConfig::new("dup", PcieDeviceKind::UpstreamSwitchPort)),
        ])));
        match topology.validate() {
            Err(TopologyError::Config(ConfigError::DuplicateIds(ids))) => assert_eq!(ids, ["dup"]),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_root_ids() {
        let mut topology = PcieTopology::new(Some(PcieTopologyConfig::new(vec![
            PcieDeviceConfig::new("rp0", PcieDeviceKind::RootPort),
            PcieDeviceConfig::new("rp0", PcieDeviceKind::RootPort),
        ])));
        assert!(matches!(
            topology.validate(),
            Err(TopologyError::Config(ConfigError::DuplicateIds(_)))
        ));
    }

    #[test]
    fn test_duplicate_slots() {
        let mut topology = PcieTopology::new(Some(PcieTopologyConfig::new(vec![
            PcieDeviceConfig::new("rp0", PcieDeviceKind::RootPort).with_slot(3),
            PcieDeviceConfig::new("rp1", PcieDeviceKind::RootPort)
                .with_slot(4)
                .with_sub_device(
                    PcieDeviceConfig::new("up0", PcieDeviceKind::UpstreamSwitchPort).with_sub_device(
                        PcieDeviceConfig::new("down0", PcieDeviceKind::DownstreamSwitchPort)
                            .with_slot(3),
                    ),
                ),
        ])));
        match topology.validate() {
            Err(TopologyError::Config(ConfigError::DuplicateSlots(slots))) => {
                assert_eq!(slots, [3])
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_phase_order_is_enforced() {
        let mut topology = PcieTopology::new(Some(PcieTopologyConfig::new(vec![
            PcieDeviceConfig::new("rp0", PcieDeviceKind::RootPort),
        ])));
        assert!(matches!(
            topology.build(),
            Err(TopologyError::InvalidPhase {
                expected: TopologyPhase::Validated,
                actual: TopologyPhase::Unvalidated,
                ..
            })
        ));
        assert!(topology.render_options().is_err());
        assert!(topology.initialize_all(&mut Vec::<FirmwareConfigEntry>::new()).is_err());

        topology.validate().unwrap();
        assert!(topology.validate().is_err());
        topology.build().unwrap();
        assert!(topology.build().is_err());
        assert!(topology.render_options().is_err());
        topology.initialize_all(&mut Vec::<FirmwareConfigEntry>::new()).unwrap();
        assert!(topology.initialize_all(&mut Vec::<FirmwareConfigEntry>::new()).is_err());
        assert_eq!(topology.render_options().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_forest() {
        let (topology, entries) = run(PcieTopologyConfig::new(Vec::new()));
        assert!(topology.render_options().unwrap().is_empty());
        assert!(entries.is_empty());
    }

    #[test]
    fn test_device_validation_runs_at_initialize() {
        let mut vmd = PcieDeviceConfig::new("vmd0", PcieDeviceKind::Vmd);
        vmd.settings.chassis = Some(1);
        let mut topology = PcieTopology::new(Some(PcieTopologyConfig::new(vec![
            PcieDeviceConfig::new("rp0", PcieDeviceKind::RootPort).with_sub_device(vmd),
        ])));
        topology.validate().unwrap();
        topology.build().unwrap();
        assert!(matches!(
            topology.initialize_all(&mut Vec::<FirmwareConfigEntry>::new()),
            Err(TopologyError::Config(ConfigError::UnsupportedField { field: "chassis", .. }))
        ));
        assert_eq!(topology.phase(), TopologyPhase::Failed);
    }

    #[test]
    fn test_failed_initialize_emits_nothing_and_cannot_rerun() {
        let mut topology = PcieTopology::new(Some(PcieTopologyConfig::new(vec![
            PcieDeviceConfig::new("rp0", PcieDeviceKind::RootPort),
            PcieDeviceConfig::new("rp1", PcieDeviceKind::RootPort).with_addr("bogus"),
        ])));
        topology.validate().unwrap();
        topology.build().unwrap();

        let mut entries: Vec<FirmwareConfigEntry> = Vec::new();
        assert!(matches!(
            topology.initialize_all(&mut entries),
            Err(TopologyError::Addressing(_))
        ));
        assert!(entries.is_empty());
        assert_eq!(topology.phase(), TopologyPhase::Failed);

        assert!(matches!(
            topology.initialize_all(&mut entries),
            Err(TopologyError::InvalidPhase {
                expected: TopologyPhase::Built,
                actual: TopologyPhase::Failed,
                ..
            })
        ));
        assert!(entries.is_empty());
        assert!(topology.render_options().is_err());
    }

    #[test]
    fn test_failed_build_is_terminal() {
        let mut topology = PcieTopology::new(Some(PcieTopologyConfig::new(vec![
            PcieDeviceConfig::new("rp0", PcieDeviceKind::RootPort).with_sec_bus(4),
            PcieDeviceConfig::new("rp1", PcieDeviceKind::RootPort).with_sec_bus(4),
        ])));
        topology.validate().unwrap();
        assert!(matches!(
            topology.build(),
            Err(TopologyError::Config(ConfigError::SecondaryBusReused { .. }))
        ));
        assert_eq!(topology.phase(), TopologyPhase::Failed);
        assert!(topology.devices().is_empty());
        assert!(topology.build().is_err());
    }

    #[test]
    fn test_malformed_address_fails_initialize() {
        let mut topology = PcieTopology::new(Some(PcieTopologyConfig::new(vec![
            PcieDeviceConfig::new("rp0", PcieDeviceKind::RootPort).with_addr("one.two"),
        ])));
        topology.validate().unwrap();
        topology.build().unwrap();
        assert!(matches!(
            topology.initialize_all(&mut Vec::<FirmwareConfigEntry>::new()),
            Err(TopologyError::Addressing(_))
        ));
    }

    #[test]
    fn test_malformed_address_behind_vmd_is_not_resolved() {
        let (topology, entries) = run(PcieTopologyConfig::new(vec![
            PcieDeviceConfig::new("vmd0", PcieDeviceKind::Vmd).with_sub_device(
                PcieDeviceConfig::new("rp0", PcieDeviceKind::RootPort).with_addr("bogus"),
            ),
        ]));
        assert!(entries.is_empty());
        assert_eq!(topology.device("rp0").unwrap().addr(), Some("bogus"));
    }

    #[test]
    fn test_root_bus_name() {
        let mut config = PcieTopologyConfig::new(vec![PcieDeviceConfig::new(
            "rp0",
            PcieDeviceKind::RootPort,
        )]);
        config.root_bus = "pcie.1".into();
        let (topology, _) = run(config);
        assert_eq!(
            topology.render_options().unwrap(),
            ["-device ioh3420,id=rp0,bus=pcie.1,addr=0.0"]
        );
        assert_eq!(&**topology.tree().unwrap().root_bus(), "pcie.1");
    }
}
