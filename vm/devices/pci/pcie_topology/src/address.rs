// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCI bus/device/function addressing.

use crate::BDF_BUS_SHIFT;
use crate::BDF_DEVICE_SHIFT;
use crate::BDF_FUNCTION_MASK;
use crate::MAX_DEVICES_PER_BUS;
use crate::MAX_FUNCTIONS_PER_DEVICE;
use crate::error::DeviceFunctionParseError;
use std::fmt;
use std::str::FromStr;

/// A device and function number on a bus, as written in a `-device ...,addr=`
/// option: a hexadecimal device number, a dot, and a decimal function number
/// (`"1c.0"`, `"5.5"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceFunction {
    device: u8,
    function: u8,
}

impl DeviceFunction {
    /// Creates a new device/function pair, checking both numbers are in range.
    pub fn new(device: u8, function: u8) -> Option<Self> {
        (device < MAX_DEVICES_PER_BUS && function < MAX_FUNCTIONS_PER_DEVICE)
            .then_some(Self { device, function })
    }

    /// The device number, `0..32`.
    pub fn device(self) -> u8 {
        self.device
    }

    /// The function number, `0..8`.
    pub fn function(self) -> u8 {
        self.function
    }
}

impl FromStr for DeviceFunction {
    type Err = DeviceFunctionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (device, function) = s.split_once('.').ok_or(DeviceFunctionParseError::Syntax)?;

        let device = u8::from_str_radix(device, 16)
            .ok()
            .filter(|&d| d < MAX_DEVICES_PER_BUS)
            .ok_or_else(|| DeviceFunctionParseError::Device(device.to_owned()))?;

        let function = function
            .parse::<u8>()
            .ok()
            .filter(|&f| f < MAX_FUNCTIONS_PER_DEVICE)
            .ok_or_else(|| DeviceFunctionParseError::Function(function.to_owned()))?;

        Ok(Self { device, function })
    }
}

impl fmt::Display for DeviceFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{}", self.device, self.function)
    }
}

/// A full bus/device/function address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bdf {
    /// The bus number.
    pub bus: u8,
    /// The device and function on that bus.
    pub device_function: DeviceFunction,
}

impl Bdf {
    /// Encodes the address as `(bus << 8) | (device << 3) | function`.
    pub fn encode(self) -> u16 {
        ((self.bus as u16) << BDF_BUS_SHIFT)
            | ((self.device_function.device as u16) << BDF_DEVICE_SHIFT)
            | (self.device_function.function as u16 & BDF_FUNCTION_MASK)
    }

    /// Decodes an address produced by [`Bdf::encode`].
    pub fn decode(value: u16) -> Self {
        Self {
            bus: (value >> BDF_BUS_SHIFT) as u8,
            device_function: DeviceFunction {
                device: ((value >> BDF_DEVICE_SHIFT) as u8) & (MAX_DEVICES_PER_BUS - 1),
                function: (value & BDF_FUNCTION_MASK) as u8,
            },
        }
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}.{:x}",
            self.bus, self.device_function.device, self.device_function.function
        )
    }
}
