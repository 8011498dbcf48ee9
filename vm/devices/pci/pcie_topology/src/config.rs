// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Declarative topology description.
//!
//! A topology is a forest of device declarations. It is written either as a
//! bare list of root-level devices:
//!
//! ```yaml
//! - id: rp0
//!   device: ioh3420
//!   addr: "1c.0"
//!   sub_devices:
//!     - id: up0
//!       device: x3130-upstream
//! ```
//!
//! or as a map naming the host bridge bus as well:
//!
//! ```yaml
//! root_bus: pcie.1
//! devices:
//!   - id: rp0
//!     device: ioh3420
//! ```

use crate::DEFAULT_ROOT_BUS;
use crate::device::PcieDeviceKind;
use crate::error::ConfigError;
use serde::Deserialize;
use std::fmt;

/// An `on`/`off` option value. Accepts either the strings `on`/`off` or a
/// boolean in the declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawOnOff")]
pub enum OnOff {
    /// `on`
    On,
    /// `off`
    Off,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOnOff {
    Bool(bool),
    Str(String),
}

impl TryFrom<RawOnOff> for OnOff {
    type Error = String;

    fn try_from(value: RawOnOff) -> Result<Self, Self::Error> {
        match value {
            RawOnOff::Bool(true) => Ok(OnOff::On),
            RawOnOff::Bool(false) => Ok(OnOff::Off),
            RawOnOff::Str(s) => match s.as_str() {
                "on" => Ok(OnOff::On),
                "off" => Ok(OnOff::Off),
                _ => Err(format!("expected 'on' or 'off', got '{s}'")),
            },
        }
    }
}

impl fmt::Display for OnOff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            OnOff::On => "on",
            OnOff::Off => "off",
        })
    }
}

/// The per-device fields of a declaration, without its children.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PcieDeviceSettings {
    /// Unique device id. Also the bus name that children attach to.
    pub id: String,
    /// The device kind.
    pub device: PcieDeviceKind,
    /// The `device.function` address on the parent bus.
    #[serde(default)]
    pub addr: Option<String>,
    /// Chassis number.
    #[serde(default)]
    pub chassis: Option<u32>,
    /// Physical slot number, unique across the topology.
    #[serde(default)]
    pub slot: Option<u32>,
    /// Multi-function flag.
    #[serde(default)]
    pub multifunction: Option<OnOff>,
    /// Explicit secondary bus number, overriding the running counter.
    #[serde(default)]
    pub sec_bus: Option<u8>,
    /// VMD memory BAR 1 size.
    #[serde(default)]
    pub bar1_size: Option<u64>,
    /// VMD memory BAR 2 size.
    #[serde(default)]
    pub bar2_size: Option<u64>,
}

impl PcieDeviceSettings {
    /// Creates settings with only the required fields set.
    pub fn new(id: impl Into<String>, device: PcieDeviceKind) -> Self {
        Self {
            id: id.into(),
            device,
            addr: None,
            chassis: None,
            slot: None,
            multifunction: None,
            sec_bus: None,
            bar1_size: None,
            bar2_size: None,
        }
    }
}

/// One declared device and the devices behind it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PcieDeviceConfig {
    /// This device's own fields.
    #[serde(flatten)]
    pub settings: PcieDeviceSettings,
    /// Devices attached below this one.
    #[serde(default)]
    pub sub_devices: Vec<PcieDeviceConfig>,
}

impl PcieDeviceConfig {
    /// Creates a declaration with no optional fields and no children.
    pub fn new(id: impl Into<String>, device: PcieDeviceKind) -> Self {
        Self {
            settings: PcieDeviceSettings::new(id, device),
            sub_devices: Vec::new(),
        }
    }

    /// Sets the address.
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.settings.addr = Some(addr.into());
        self
    }

    /// Sets the slot number.
    pub fn with_slot(mut self, slot: u32) -> Self {
        self.settings.slot = Some(slot);
        self
    }

    /// Sets an explicit secondary bus number.
    pub fn with_sec_bus(mut self, sec_bus: u8) -> Self {
        self.settings.sec_bus = Some(sec_bus);
        self
    }

    /// Appends a child declaration.
    pub fn with_sub_device(mut self, child: PcieDeviceConfig) -> Self {
        self.sub_devices.push(child);
        self
    }
}

/// A complete topology declaration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PcieTopologyConfig {
    /// Name of the bus root-level devices attach to.
    #[serde(default = "default_root_bus")]
    pub root_bus: String,
    /// The root-level devices.
    pub devices: Vec<PcieDeviceConfig>,
}

fn default_root_bus() -> String {
    DEFAULT_ROOT_BUS.into()
}

/// Just enough of a declaration to check its device kinds, so that an
/// unknown kind is reported as such instead of as a generic parse error.
#[derive(Deserialize)]
#[serde(untagged)]
enum KindScan {
    List(Vec<KindScanDevice>),
    Rooted { devices: Vec<KindScanDevice> },
}

#[derive(Deserialize)]
struct KindScanDevice {
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    sub_devices: Vec<KindScanDevice>,
}

impl KindScan {
    /// Fails on the first unknown kind, in pre-order.
    fn check(self) -> Result<(), ConfigError> {
        let (KindScan::List(devices) | KindScan::Rooted { devices }) = self;
        let mut stack: Vec<_> = devices.into_iter().rev().collect();
        while let Some(device) = stack.pop() {
            if let Some(kind) = &device.device {
                kind.parse::<PcieDeviceKind>()?;
            }
            stack.extend(device.sub_devices.into_iter().rev());
        }
        Ok(())
    }
}

impl PcieTopologyConfig {
    /// Creates a topology on the default root bus.
    pub fn new(devices: Vec<PcieDeviceConfig>) -> Self {
        Self {
            root_bus: default_root_bus(),
            devices,
        }
    }

    /// Parses a YAML declaration, either a bare device list or a
    /// `{ root_bus, devices }` map.
    pub fn from_yaml(s: &str) -> Result<Self, ConfigError> {
        let value: serde_yaml::Value = serde_yaml::from_str(s)?;
        if value.is_null() {
            return Err(ConfigError::MissingTopology);
        }
        if let Ok(scan) = serde_yaml::from_value::<KindScan>(value.clone()) {
            scan.check()?;
        }
        if value.is_sequence() {
            Ok(Self::new(serde_yaml::from_value(value)?))
        } else {
            Ok(serde_yaml::from_value(value)?)
        }
    }

    /// Parses a JSON declaration, either a bare device list or a
    /// `{ root_bus, devices }` object.
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(s)?;
        if value.is_null() {
            return Err(ConfigError::MissingTopology);
        }
        if let Ok(scan) = serde_json::from_value::<KindScan>(value.clone()) {
            scan.check()?;
        }
        if value.is_array() {
            Ok(Self::new(serde_json::from_value(value)?))
        } else {
            Ok(serde_json::from_value(value)?)
        }
    }

    /// Iterates every declared device in pre-order.
    pub fn iter(&self) -> impl Iterator<Item = &PcieDeviceConfig> {
        let mut stack: Vec<&PcieDeviceConfig> = self.devices.iter().rev().collect();
        std::iter::from_fn(move || {
            let next = stack.pop()?;
            stack.extend(next.sub_devices.iter().rev());
            Some(next)
        })
    }
}
