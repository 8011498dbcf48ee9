// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! `-device` option fragments.

use std::fmt;
use thiserror::Error;

const DEVICE_FLAG: &str = "-device";

/// Errors parsing a `-device` option fragment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceOptionParseError {
    /// The fragment does not start with `-device `.
    #[error("expected '-device <driver>,...'")]
    MissingFlag,
    /// The driver name is empty.
    #[error("missing device driver name")]
    MissingDriver,
    /// A property is not of the form `key=value`.
    #[error("expected 'key=value', got '{0}'")]
    Property(String),
}

/// A device instantiation directive: a driver name followed by ordered
/// `key=value` properties, rendered as `-device driver,key=value,...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOption {
    driver: String,
    properties: Vec<(String, String)>,
}

impl DeviceOption {
    /// Creates an option with no properties.
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            properties: Vec::new(),
        }
    }

    /// Appends a property. Properties render in insertion order.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.push((key.into(), value.into()));
    }

    /// The device driver name.
    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// The properties in order.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Looks up the first property named `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Parses a fragment produced by the [`Display`](fmt::Display)
    /// implementation.
    pub fn parse(s: &str) -> Result<Self, DeviceOptionParseError> {
        let rest = s
            .trim()
            .strip_prefix(DEVICE_FLAG)
            .and_then(|rest| rest.strip_prefix(' '))
            .ok_or(DeviceOptionParseError::MissingFlag)?;

        let mut parts = rest.trim_start().split(',');
        let driver = parts
            .next()
            .filter(|driver| !driver.is_empty())
            .ok_or(DeviceOptionParseError::MissingDriver)?;

        let properties = parts
            .map(|part| {
                part.split_once('=')
                    .filter(|(key, _)| !key.is_empty())
                    .map(|(key, value)| (key.to_owned(), value.to_owned()))
                    .ok_or_else(|| DeviceOptionParseError::Property(part.to_owned()))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            driver: driver.to_owned(),
            properties,
        })
    }
}

impl fmt::Display for DeviceOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", DEVICE_FLAG, self.driver)?;
        for (key, value) in &self.properties {
            write!(f, ",{}={}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        let mut option = DeviceOption::new("vmd");
        option.push("id", "vmd0");
        option.push("bus", "rp0");
        option.push("mbar1_size", "25");
        assert_eq!(option.to_string(), "-device vmd,id=vmd0,bus=rp0,mbar1_size=25");
        assert_eq!(DeviceOption::new("ioh3420").to_string(), "-device ioh3420");
    }

    #[test]
    fn test_parse() {
        let option =
            DeviceOption::parse("-device ioh3420,id=rp0,bus=pcie.0,addr=1c.0,slot=1").unwrap();
        assert_eq!(option.driver(), "ioh3420");
        assert_eq!(option.get("id"), Some("rp0"));
        assert_eq!(option.get("bus"), Some("pcie.0"));
        assert_eq!(option.get("addr"), Some("1c.0"));
        assert_eq!(option.get("slot"), Some("1"));
        assert_eq!(option.get("chassis"), None);
        assert_eq!(
            option.properties().map(|(k, _)| k).collect::<Vec<_>>(),
            ["id", "bus", "addr", "slot"]
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            DeviceOption::parse("ioh3420,id=rp0"),
            Err(DeviceOptionParseError::MissingFlag)
        );
        assert_eq!(
            DeviceOption::parse("-device ,id=rp0"),
            Err(DeviceOptionParseError::MissingDriver)
        );
        assert_eq!(
            DeviceOption::parse("-device ioh3420,id"),
            Err(DeviceOptionParseError::Property("id".into()))
        );
    }
}
