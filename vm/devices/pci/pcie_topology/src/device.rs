// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCIe topology elements.
//!
//! Every declared element becomes a [`PcieDevice`]. The four kinds differ
//! only in their default addressing, in whether they take part in bus
//! numbering, and in whether boot firmware can ever address them:
//!
//! | kind | default addr | bus numbering | firmware-visible |
//! |---|---|---|---|
//! | root port | `0.0` | bridge | unless behind a VMD |
//! | upstream switch port | `0.0` | bridge | unless behind a VMD |
//! | downstream switch port | `0.0` | bridge | unless behind a VMD |
//! | VMD | `5.5`, multifunction | none | never |

use crate::address::Bdf;
use crate::address::DeviceFunction;
use crate::config::OnOff;
use crate::config::PcieDeviceSettings;
use crate::error::AddressError;
use crate::error::ConfigError;
use crate::fw_cfg::FirmwareConfigEntry;
use crate::option::DeviceOption;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const BRIDGE_DEFAULT_ADDR: &str = "0.0";
const VMD_DEFAULT_ADDR: &str = "5.5";

/// The kind of a topology element, named after the device model the
/// hypervisor instantiates for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum PcieDeviceKind {
    /// A root port (`ioh3420`).
    RootPort,
    /// A switch upstream port (`x3130-upstream`).
    UpstreamSwitchPort,
    /// A switch downstream port (`xio3130-downstream`).
    DownstreamSwitchPort,
    /// A volume management device aggregator (`vmd`). Devices behind it live
    /// in a separate PCI domain.
    Vmd,
}

impl PcieDeviceKind {
    /// All known kinds.
    pub const ALL: [PcieDeviceKind; 4] = [
        PcieDeviceKind::RootPort,
        PcieDeviceKind::UpstreamSwitchPort,
        PcieDeviceKind::DownstreamSwitchPort,
        PcieDeviceKind::Vmd,
    ];

    /// The hypervisor device model name.
    pub fn driver_name(self) -> &'static str {
        match self {
            PcieDeviceKind::RootPort => "ioh3420",
            PcieDeviceKind::UpstreamSwitchPort => "x3130-upstream",
            PcieDeviceKind::DownstreamSwitchPort => "xio3130-downstream",
            PcieDeviceKind::Vmd => "vmd",
        }
    }

    /// Whether this kind is a PCI-to-PCI bridge with its own secondary bus.
    pub fn is_bridge(self) -> bool {
        match self {
            PcieDeviceKind::RootPort
            | PcieDeviceKind::UpstreamSwitchPort
            | PcieDeviceKind::DownstreamSwitchPort => true,
            PcieDeviceKind::Vmd => false,
        }
    }
}

impl FromStr for PcieDeviceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.driver_name() == s)
            .ok_or_else(|| ConfigError::UnknownDeviceKind(s.to_owned()))
    }
}

impl TryFrom<String> for PcieDeviceKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for PcieDeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.driver_name())
    }
}

/// Option values resolved from the declaration by [`PcieDevice::initialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedOptions {
    addr: Option<String>,
    chassis: Option<u32>,
    slot: Option<u32>,
    multifunction: Option<OnOff>,
    extra_args: Vec<(&'static str, String)>,
}

impl ResolvedOptions {
    fn resolve(settings: &PcieDeviceSettings) -> Self {
        match settings.device {
            PcieDeviceKind::RootPort
            | PcieDeviceKind::UpstreamSwitchPort
            | PcieDeviceKind::DownstreamSwitchPort => Self {
                addr: Some(
                    settings
                        .addr
                        .clone()
                        .unwrap_or_else(|| BRIDGE_DEFAULT_ADDR.into()),
                ),
                chassis: settings.chassis,
                slot: settings.slot,
                multifunction: settings.multifunction,
                extra_args: Vec::new(),
            },
            PcieDeviceKind::Vmd => {
                let extra_args = [
                    ("mbar1_size", settings.bar1_size),
                    ("mbar2_size", settings.bar2_size),
                ]
                .into_iter()
                .filter_map(|(key, size)| Some((key, size?.to_string())))
                .collect();

                Self {
                    addr: Some(
                        settings
                            .addr
                            .clone()
                            .unwrap_or_else(|| VMD_DEFAULT_ADDR.into()),
                    ),
                    chassis: None,
                    slot: None,
                    multifunction: Some(settings.multifunction.unwrap_or(OnOff::On)),
                    extra_args,
                }
            }
        }
    }
}

/// A single element of the topology.
///
/// A device goes through bus assignment, domain propagation, validation and
/// initialization, in that order, and is read-only afterwards.
#[derive(Debug, Clone)]
pub struct PcieDevice {
    settings: PcieDeviceSettings,
    /// The bus this device sits on: the parent's id, or the root bus name.
    bus: Option<Arc<str>>,
    /// The bus number of the bus this device sits on.
    primary_bus: Option<u8>,
    /// The bus number this device originates. Bridges only.
    secondary_bus: Option<u8>,
    /// Whether this device lives in a domain boot firmware cannot describe.
    in_domain: bool,
    options: Option<ResolvedOptions>,
}

impl PcieDevice {
    /// Creates a device from its declaration.
    pub fn new(settings: PcieDeviceSettings) -> Self {
        // Firmware has no way to describe a VMD, whatever its ancestors are.
        let in_domain = settings.device == PcieDeviceKind::Vmd;
        Self {
            settings,
            bus: None,
            primary_bus: None,
            secondary_bus: None,
            in_domain,
            options: None,
        }
    }

    /// The device id.
    pub fn id(&self) -> &str {
        &self.settings.id
    }

    /// The device kind.
    pub fn kind(&self) -> PcieDeviceKind {
        self.settings.device
    }

    /// The declaration this device was created from.
    pub fn settings(&self) -> &PcieDeviceSettings {
        &self.settings
    }

    /// The name of the bus this device is attached to.
    pub fn bus(&self) -> Option<&str> {
        self.bus.as_deref()
    }

    /// The bus number of the bus this device is attached to.
    pub fn primary_bus(&self) -> Option<u8> {
        self.primary_bus
    }

    /// The bus number behind this device, if it is a bridge.
    pub fn secondary_bus(&self) -> Option<u8> {
        self.secondary_bus
    }

    /// Attaches the device to `bus`, whose bus number is `primary_bus`, and
    /// gives it a secondary bus.
    ///
    /// A secondary bus declared in the configuration is kept as long as it
    /// is not below `next_secondary_bus`; otherwise `next_secondary_bus` is
    /// taken. Returns the next free secondary bus number.
    ///
    /// A VMD is not a bridge: it only records `bus` and hands
    /// `next_secondary_bus` back unchanged.
    pub fn assign_bus(
        &mut self,
        bus: Arc<str>,
        primary_bus: u8,
        next_secondary_bus: u16,
    ) -> Result<u16, ConfigError> {
        self.bus = Some(bus);
        if !self.kind().is_bridge() {
            return Ok(next_secondary_bus);
        }

        let secondary_bus = match self.settings.sec_bus {
            Some(sec_bus) if u16::from(sec_bus) < next_secondary_bus => {
                return Err(ConfigError::SecondaryBusReused {
                    id: self.settings.id.clone(),
                    sec_bus,
                    next_secondary_bus,
                });
            }
            Some(sec_bus) => {
                if u16::from(sec_bus) > next_secondary_bus {
                    tracing::debug!(
                        id = self.id(),
                        sec_bus,
                        next_secondary_bus,
                        "declared secondary bus skips bus numbers"
                    );
                }
                sec_bus
            }
            None => u8::try_from(next_secondary_bus).map_err(|_| {
                ConfigError::BusNumbersExhausted {
                    id: self.settings.id.clone(),
                }
            })?,
        };

        self.primary_bus = Some(primary_bus);
        self.secondary_bus = Some(secondary_bus);
        Ok(u16::from(secondary_bus) + 1)
    }

    /// Marks the device as living outside the firmware-visible domain.
    ///
    /// The flag is sticky: once set it is never cleared. A VMD is always
    /// outside the domain, so this has no effect on it.
    pub fn set_domain(&mut self, in_domain: bool) {
        if self.kind() == PcieDeviceKind::Vmd {
            return;
        }
        self.in_domain |= in_domain;
    }

    /// Whether the device lives outside the firmware-visible domain.
    pub fn in_domain(&self) -> bool {
        self.in_domain
    }

    /// Checks the declaration for fields that make no sense for this kind.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.settings.id.is_empty() {
            return Err(ConfigError::EmptyId);
        }

        match self.kind() {
            PcieDeviceKind::RootPort
            | PcieDeviceKind::UpstreamSwitchPort
            | PcieDeviceKind::DownstreamSwitchPort => {}
            PcieDeviceKind::Vmd => {
                let unsupported = [
                    ("sec_bus", self.settings.sec_bus.is_some()),
                    ("chassis", self.settings.chassis.is_some()),
                    ("slot", self.settings.slot.is_some()),
                ];
                if let Some((field, _)) = unsupported.into_iter().find(|(_, set)| *set) {
                    return Err(ConfigError::UnsupportedField {
                        id: self.settings.id.clone(),
                        field,
                    });
                }
            }
        }

        Ok(())
    }

    /// Resolves the option values, filling in the per-kind defaults.
    pub fn initialize(&mut self) {
        self.options = Some(ResolvedOptions::resolve(&self.settings));
    }

    /// The resolved `device.function` address, once initialized.
    pub fn addr(&self) -> Option<&str> {
        self.options.as_ref()?.addr.as_deref()
    }

    /// Builds the `-device` option for this device.
    ///
    /// Before [`PcieDevice::initialize`] only `id` and `bus` are present.
    pub fn option(&self) -> DeviceOption {
        let mut option = DeviceOption::new(self.kind().driver_name());
        option.push("id", self.id());
        if let Some(bus) = &self.bus {
            option.push("bus", &**bus);
        }

        if let Some(options) = &self.options {
            if let Some(multifunction) = options.multifunction {
                option.push("multifunction", multifunction.to_string());
            }
            if let Some(addr) = &options.addr {
                option.push("addr", addr.as_str());
            }
            if let Some(chassis) = options.chassis {
                option.push("chassis", chassis.to_string());
            }
            if let Some(slot) = options.slot {
                option.push("slot", slot.to_string());
            }
            for (key, value) in &options.extra_args {
                option.push(*key, value.as_str());
            }
        }

        option
    }

    /// Renders the `-device` option fragment for this device.
    pub fn option_fragment(&self) -> String {
        self.option().to_string()
    }

    /// The address boot firmware uses to find this device, or `None` if the
    /// device lives outside the firmware-visible domain.
    pub fn firmware_config_entry(&self) -> Result<Option<FirmwareConfigEntry>, AddressError> {
        if self.in_domain {
            return Ok(None);
        }

        let addr = self.addr().ok_or_else(|| AddressError::Missing {
            id: self.settings.id.clone(),
        })?;
        let device_function =
            addr.parse::<DeviceFunction>()
                .map_err(|source| AddressError::Malformed {
                    id: self.settings.id.clone(),
                    addr: addr.to_owned(),
                    source,
                })?;

        let (Some(primary_bus), Some(secondary_bus)) = (self.primary_bus, self.secondary_bus)
        else {
            return Err(AddressError::Unassigned {
                id: self.settings.id.clone(),
            });
        };

        let bdf = Bdf {
            bus: primary_bus,
            device_function,
        };

        Ok(Some(FirmwareConfigEntry {
            id: self.settings.id.clone(),
            bdf: bdf.encode(),
            sec_bus: secondary_bus,
        }))
    }
}
