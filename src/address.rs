use crate::crc::crc8;
use crate::error::AddressError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use static_assertions::assert_eq_size;
use std::fmt;
use std::str::FromStr;

pub const ADDRESS_LEN: usize = 8;
const SERIAL_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// 64-bit device identity as it appears on the wire.
///
/// Byte 0 is the family code, bytes 1..=6 the 48-bit serial number (least
/// significant byte first) and byte 7 the CRC-8 of the first seven bytes.
/// Textual form is the 16-digit hex rendering of the little-endian `u64`,
/// so the CRC comes first and the family code last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress {
    raw: [u8; ADDRESS_LEN],
}

assert_eq_size!(DeviceAddress, u64);

impl DeviceAddress {
    pub const fn from_raw(raw: [u8; ADDRESS_LEN]) -> Self {
        Self { raw }
    }

    /// Builds an address from family and serial, computing the check byte.
    /// Serial bits above 48 are discarded.
    pub fn new(family_code: u8, serial: u64) -> Self {
        let serial_bytes = (serial & SERIAL_MASK).to_le_bytes();
        let mut raw = [0u8; ADDRESS_LEN];
        raw[0] = family_code;
        raw[1..7].copy_from_slice(&serial_bytes[..6]);
        raw[7] = crc8(&raw[..7]);
        Self { raw }
    }

    pub fn from_u64(value: u64) -> Self {
        Self::from_raw(value.to_le_bytes())
    }

    pub fn as_raw(&self) -> &[u8; ADDRESS_LEN] {
        &self.raw
    }

    pub fn to_u64(self) -> u64 {
        u64::from_le_bytes(self.raw)
    }

    pub fn family_code(&self) -> u8 {
        self.raw[0]
    }

    pub fn serial(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..6].copy_from_slice(&self.raw[1..7]);
        u64::from_le_bytes(bytes)
    }

    pub fn crc(&self) -> u8 {
        self.raw[7]
    }

    pub fn is_crc_valid(&self) -> bool {
        crc8(&self.raw[..7]) == self.raw[7]
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.to_u64())
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if digits.len() != ADDRESS_LEN * 2 {
            return Err(AddressError::InvalidLength(digits.len()));
        }

        let value = u64::from_str_radix(digits, 16)
            .map_err(|_| AddressError::InvalidHex(digits.to_string()))?;

        Ok(Self::from_u64(value))
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
