//! Bluetooth radio address value type
//!
//! Radio addresses travel as six raw bytes inside advertisements and as
//! colon-separated hex strings everywhere else. `"0:0:0:0:0:0"` is the
//! well-known "unknown" sentinel used by devices that have not yet learned
//! their own address.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Sentinel string for an unresolved local Bluetooth address
pub const UNKNOWN_BLUETOOTH_MAC_ADDRESS: &str = "0:0:0:0:0:0";

/// Number of bytes in a Bluetooth radio address
pub const MAC_ADDRESS_LENGTH: usize = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MacAddressError {
    #[error("Invalid Bluetooth address: {0}")]
    Invalid(String),
}

/// A 6-byte Bluetooth radio address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress([u8; MAC_ADDRESS_LENGTH]);

impl MacAddress {
    /// The all-zero address, meaning "not known yet"
    pub const UNKNOWN: MacAddress = MacAddress([0u8; MAC_ADDRESS_LENGTH]);

    pub const fn new(bytes: [u8; MAC_ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Build an address from a slice that must be exactly six bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MacAddressError> {
        let array: [u8; MAC_ADDRESS_LENGTH] = bytes
            .try_into()
            .map_err(|_| MacAddressError::Invalid(format!("{} bytes", bytes.len())))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; MAC_ADDRESS_LENGTH] {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == [0u8; MAC_ADDRESS_LENGTH]
    }

    /// Check whether an address string denotes the unknown sentinel.
    ///
    /// Empty strings and anything that parses to all zeros count as unknown.
    pub fn is_unknown_str(address: &str) -> bool {
        if address.trim().is_empty() {
            return true;
        }
        address
            .parse::<MacAddress>()
            .map(|mac| mac.is_unknown())
            .unwrap_or(false)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = MacAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; MAC_ADDRESS_LENGTH];
        let mut count = 0;

        for part in s.trim().split(':') {
            if count == MAC_ADDRESS_LENGTH || part.is_empty() || part.len() > 2 {
                return Err(MacAddressError::Invalid(s.to_string()));
            }
            bytes[count] =
                u8::from_str_radix(part, 16).map_err(|_| MacAddressError::Invalid(s.to_string()))?;
            count += 1;
        }

        if count != MAC_ADDRESS_LENGTH {
            return Err(MacAddressError::Invalid(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

impl From<[u8; MAC_ADDRESS_LENGTH]> for MacAddress {
    fn from(bytes: [u8; MAC_ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl Serialize for MacAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
