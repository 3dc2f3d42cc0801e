//! Checksums used on the bus.
//!
//! - CRC-8 (Dallas/Maxim, reflected polynomial 0x8C) guards the last byte of
//!   every 64-bit device address.
//! - CRC-32 (IEEE 802.3, reflected polynomial 0xEDB88320) fingerprints an
//!   ordered list of addresses so repeated search results can be recognized.

const CRC8_POLY: u8 = 0x8C;
const CRC32_POLY: u32 = 0xEDB8_8320;

const CRC8_TABLE: [u8; 256] = build_crc8_table();
const CRC32_TABLE: [u32; 256] = build_crc32_table();

const fn build_crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x01 != 0 { (crc >> 1) ^ CRC8_POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x01 != 0 { (crc >> 1) ^ CRC32_POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Dallas/Maxim CRC-8 over `data`, starting from zero.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |crc, &byte| CRC8_TABLE[usize::from(crc ^ byte)])
}

/// Incremental IEEE CRC-32.
#[derive(Debug, Clone, Copy)]
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    pub fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let index = usize::from((self.state as u8) ^ byte);
            self.state = (self.state >> 8) ^ CRC32_TABLE[index];
        }
    }

    pub fn finalize(self) -> u32 {
        !self.state
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crc32(data: &[u8]) -> u32 {
        let mut crc = Crc32::new();
        crc.update(data);
        crc.finalize()
    }

    #[test]
    fn test_crc32_check_value() {
        // Standard check value for "123456789"
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_crc32_incremental_matches_one_shot() {
        let mut crc = Crc32::new();
        crc.update(b"1234");
        crc.update(b"56789");
        assert_eq!(crc.finalize(), crc32(b"123456789"));
    }

    #[test]
    fn test_crc8_check_value() {
        // Maxim CRC-8 check value for "123456789"
        assert_eq!(crc8(b"123456789"), 0xA1);
    }

    #[test]
    fn test_crc8_of_valid_rom_is_zero() {
        let mut rom = [0x28, 0xFF, 0x4A, 0x3B, 0x61, 0x16, 0x03, 0x00];
        rom[7] = crc8(&rom[..7]);
        assert_eq!(crc8(&rom), 0);
    }
}
