// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCI Express topology description for an external hypervisor process.
//!
//! A topology is declared as a forest of root ports, switch ports and VMD
//! aggregators. [`PcieTopology`] validates the declaration, numbers the
//! buses behind every bridge, decides which devices sit outside the
//! standard enumeration domain, and finally renders:
//!
//! - one `-device` option fragment per declared element, in pre-order, and
//! - one [`FirmwareConfigEntry`] per element that boot firmware can address
//!   directly, pushed to a [`FirmwareConfigSink`].

#![forbid(unsafe_code)]

pub mod address;
pub mod builder;
pub mod config;
pub mod device;
pub mod error;
pub mod fw_cfg;
mod numbering;
pub mod option;
pub mod tree;

pub use address::Bdf;
pub use address::DeviceFunction;
pub use builder::PcieTopology;
pub use builder::TopologyPhase;
pub use config::OnOff;
pub use config::PcieDeviceConfig;
pub use config::PcieDeviceSettings;
pub use config::PcieTopologyConfig;
pub use device::PcieDevice;
pub use device::PcieDeviceKind;
pub use error::AddressError;
pub use error::ConfigError;
pub use error::DeviceFunctionParseError;
pub use error::TopologyError;
pub use fw_cfg::FirmwareConfigEntry;
pub use fw_cfg::FirmwareConfigSink;
pub use option::DeviceOption;
pub use option::DeviceOptionParseError;

/// Name of the host bridge bus that root-level devices attach to.
pub const DEFAULT_ROOT_BUS: &str = "pcie.0";

/// The first secondary bus number handed out below the root bus.
const FIRST_SECONDARY_BUS: u16 = 1;

const BDF_BUS_SHIFT: u16 = 8;
const BDF_DEVICE_SHIFT: u16 = 3;
const BDF_FUNCTION_MASK: u16 = 0x7;

const MAX_DEVICES_PER_BUS: u8 = 32;
const MAX_FUNCTIONS_PER_DEVICE: u8 = 8;
