// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for topology construction.

use crate::builder::TopologyPhase;
use thiserror::Error;

/// Errors in the declared topology. These abort the build before any
/// hypervisor invocation is attempted.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No topology was declared at all.
    #[error("pci topology is required")]
    MissingTopology,
    /// The `device` discriminator does not name a known device kind.
    #[error("unknown pcie device kind '{0}'")]
    UnknownDeviceKind(String),
    /// One or more ids are declared more than once.
    #[error("pcie device id {0:?} duplicated")]
    DuplicateIds(Vec<String>),
    /// One or more slot numbers are declared more than once.
    #[error("pcie device slot {0:?} duplicated")]
    DuplicateSlots(Vec<u32>),
    /// A device was declared with an empty id.
    #[error("pcie device id must not be empty")]
    EmptyId,
    /// A field was declared on a device kind that cannot use it.
    #[error("pcie device '{id}' does not support field '{field}'")]
    UnsupportedField {
        /// The offending device.
        id: String,
        /// The field name as it appears in the declaration.
        field: &'static str,
    },
    /// The running secondary bus counter ran past the last bus number.
    #[error("no bus numbers left for pcie device '{id}'")]
    BusNumbersExhausted {
        /// The device that could not be given a secondary bus.
        id: String,
    },
    /// A declared secondary bus is below a bus number already handed out.
    #[error(
        "pcie device '{id}' declares secondary bus {sec_bus}, but buses below {next_secondary_bus} are already in use"
    )]
    SecondaryBusReused {
        /// The device declaring the secondary bus.
        id: String,
        /// The declared secondary bus.
        sec_bus: u8,
        /// The lowest bus number still free.
        next_secondary_bus: u16,
    },
    /// The declaration could not be parsed as YAML.
    #[error("failed to parse yaml topology")]
    Yaml(#[from] serde_yaml::Error),
    /// The declaration could not be parsed as JSON.
    #[error("failed to parse json topology")]
    Json(#[from] serde_json::Error),
}

/// Errors parsing a `device.function` address string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceFunctionParseError {
    /// The string is not of the form `device.function`.
    #[error("expected 'device.function'")]
    Syntax,
    /// The device number is not a hex number below 0x20.
    #[error("invalid device number '{0}'")]
    Device(String),
    /// The function number is not a decimal number below 8.
    #[error("invalid function number '{0}'")]
    Function(String),
}

/// Errors resolving a device's address for firmware.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The device has no resolved address.
    #[error("pcie device '{id}' has no address")]
    Missing {
        /// The device without an address.
        id: String,
    },
    /// The address could not be parsed.
    #[error("pcie device '{id}' has malformed address '{addr}'")]
    Malformed {
        /// The device carrying the address.
        id: String,
        /// The address as declared.
        addr: String,
        /// What was wrong with it.
        #[source]
        source: DeviceFunctionParseError,
    },
    /// The device has no primary bus assigned yet.
    #[error("pcie device '{id}' has no primary bus")]
    Unassigned {
        /// The device without a bus assignment.
        id: String,
    },
}

/// Top-level error returned by [`PcieTopology`](crate::PcieTopology).
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The declared topology is invalid.
    #[error("invalid pcie topology")]
    Config(#[from] ConfigError),
    /// A device address could not be resolved.
    #[error("invalid pcie device address")]
    Addressing(#[from] AddressError),
    /// A builder operation was called out of order.
    #[error("cannot {operation} in phase {actual:?}, expected {expected:?}")]
    InvalidPhase {
        /// The operation that was attempted.
        operation: &'static str,
        /// The phase the operation requires.
        expected: TopologyPhase,
        /// The phase the builder is actually in.
        actual: TopologyPhase,
    },
}
