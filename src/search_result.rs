use crate::address::DeviceAddress;
use crate::crc::Crc32;
use crate::error::SearchResultError;
use serde::{Deserialize, Serialize};

/// Snapshot of one successful search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    addresses: Vec<DeviceAddress>,
    fingerprint: u32,
    write_ctm: u64,
}

impl SearchResult {
    /// `addresses` keeps discovery order; `write_ctm` must be positive.
    pub fn new(addresses: Vec<DeviceAddress>, write_ctm: u64) -> Result<Self, SearchResultError> {
        if write_ctm == 0 {
            return Err(SearchResultError::InvalidWriteTime);
        }

        let fingerprint = fingerprint_of(&addresses);

        Ok(Self {
            addresses,
            fingerprint,
            write_ctm,
        })
    }

    pub fn addresses(&self) -> &[DeviceAddress] {
        &self.addresses
    }

    pub fn fingerprint(&self) -> u32 {
        self.fingerprint
    }

    pub fn write_ctm(&self) -> u64 {
        self.write_ctm
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// CRC-32 folded over the raw 8-byte form of every address, in list order.
pub fn fingerprint_of(addresses: &[DeviceAddress]) -> u32 {
    let mut crc = Crc32::new();
    for address in addresses {
        crc.update(address.as_raw());
    }
    crc.finalize()
}
