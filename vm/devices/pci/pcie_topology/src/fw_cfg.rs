// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Firmware configuration records describing how boot firmware can reach
//! topology elements without enumerating the whole hierarchy.

use crate::address::Bdf;
use serde::Serialize;

/// The addressing record for one firmware-visible device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareConfigEntry {
    /// The device id.
    pub id: String,
    /// The encoded bus/device/function on the device's primary bus.
    pub bdf: u16,
    /// The secondary bus number behind the device.
    pub sec_bus: u8,
}

impl FirmwareConfigEntry {
    /// The decoded bus/device/function.
    pub fn bdf(&self) -> Bdf {
        Bdf::decode(self.bdf)
    }
}

/// Receives firmware configuration records as a topology is initialized.
pub trait FirmwareConfigSink {
    /// Adds one record.
    fn add_topology_entry(&mut self, entry: FirmwareConfigEntry);
}

impl FirmwareConfigSink for Vec<FirmwareConfigEntry> {
    fn add_topology_entry(&mut self, entry: FirmwareConfigEntry) {
        self.push(entry);
    }
}
