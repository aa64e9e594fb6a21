//! Registry hive base block (header) parsing and emission.
//!
//! The base block is the first 4096 bytes (0x1000) of a registry hive file.
//! It contains metadata about the hive including version, timestamps, and
//! the root key cell offset.

use crate::error::{RegistryError, Result};
use crate::strings::read_fixed_ascii;
use crate::utils::{calculate_checksum, read_u32_le};
use std::fmt;

/// Size of the base block in bytes.
pub const BASE_BLOCK_SIZE: usize = 4096;

/// Expected signature for a valid registry hive ("regf").
pub const REGF_SIGNATURE: &[u8; 4] = b"regf";

/// Offset of the checksum field in the base block.
const CHECKSUM_OFFSET: usize = 0x1FC;

/// Hive format version written by the rebuild pipeline.
const EMIT_MAJOR_VERSION: u32 = 1;
const EMIT_MINOR_VERSION: u32 = 5;

/// Registry hive base block header.
///
/// This structure represents the first 4KB of a registry hive file and contains
/// critical metadata about the hive.
#[derive(Debug, Clone)]
pub struct BaseBlock {
    /// Signature, should be "regf" (0x66676572).
    pub signature: [u8; 4],

    /// Primary sequence number.
    pub primary_sequence: u32,

    /// Secondary sequence number.
    pub secondary_sequence: u32,

    /// Last written timestamp (Windows FILETIME).
    pub last_written: u64,

    /// Major version of the hive format.
    pub major_version: u32,

    /// Minor version of the hive format.
    pub minor_version: u32,

    /// File type (0 = normal, 1 = transaction log).
    pub file_type: u32,

    /// File format (1 = direct memory load).
    pub file_format: u32,

    /// Offset to root key cell (relative to first hbin).
    pub root_cell_offset: u32,

    /// Length of hive bin data in bytes.
    pub hive_length: u32,

    /// Clustering factor (always 1).
    pub clustering_factor: u32,

    /// File name (embedded, 64 UTF-16LE characters).
    pub file_name: String,

    /// Checksum (XOR of first 508 bytes).
    pub checksum: u32,
}

impl BaseBlock {
    /// Parses a base block from raw bytes.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw bytes of the base block (must be at least 4096 bytes).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Data is too small
    /// - Signature is invalid
    /// - Checksum doesn't match
    /// - Version is unsupported
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BASE_BLOCK_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: data.len(),
                minimum: BASE_BLOCK_SIZE,
            });
        }

        // Read signature
        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);

        if &signature != REGF_SIGNATURE {
            return Err(RegistryError::invalid_signature(REGF_SIGNATURE, &signature));
        }

        // Parse header fields
        let primary_sequence = read_u32_le(data, 0x04)?;
        let secondary_sequence = read_u32_le(data, 0x08)?;

        // Last written timestamp (8 bytes at offset 0x0C)
        let last_written = u64::from(read_u32_le(data, 0x0C)?)
            | (u64::from(read_u32_le(data, 0x10)?) << 32);

        let major_version = read_u32_le(data, 0x14)?;
        let minor_version = read_u32_le(data, 0x18)?;
        let file_type = read_u32_le(data, 0x1C)?;
        let file_format = read_u32_le(data, 0x20)?;
        let root_cell_offset = read_u32_le(data, 0x24)?;
        let hive_length = read_u32_le(data, 0x28)?;
        let clustering_factor = read_u32_le(data, 0x2C)?;

        // File name at offset 0x30 (64 UTF-16LE characters = 128 bytes)
        let file_name_bytes = &data[0x30..0xB0];
        let file_name = read_fixed_ascii(file_name_bytes, 64);

        // Checksum at offset 0x1FC
        let checksum = read_u32_le(data, CHECKSUM_OFFSET)?;

        // Verify checksum
        let calculated = calculate_checksum(data);
        if checksum != calculated {
            return Err(RegistryError::ChecksumMismatch {
                expected: checksum,
                calculated,
            });
        }

        // Verify version (support 1.3, 1.4, 1.5, 1.6)
        if major_version != 1 || minor_version < 3 || minor_version > 6 {
            return Err(RegistryError::UnsupportedVersion {
                major: major_version,
                minor: minor_version,
            });
        }

        Ok(BaseBlock {
            signature,
            primary_sequence,
            secondary_sequence,
            last_written,
            major_version,
            minor_version,
            file_type,
            file_format,
            root_cell_offset,
            hive_length,
            clustering_factor,
            file_name,
            checksum,
        })
    }

    /// Returns true if the hive is in a consistent state.
    ///
    /// The hive is consistent when primary and secondary sequence numbers match.
    pub fn is_consistent(&self) -> bool {
        self.primary_sequence == self.secondary_sequence
    }

    /// Converts the last written timestamp to a human-readable format.
    pub fn last_written_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        crate::utils::filetime_to_datetime(self.last_written)
    }
}

impl fmt::Display for BaseBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Registry Hive Header:\n\
             - Version: {}.{}\n\
             - Root Cell Offset: {:#x}\n\
             - Hive Length: {} bytes\n\
             - Consistent: {}\n\
             - File Name: {}",
            self.major_version,
            self.minor_version,
            self.root_cell_offset,
            self.hive_length,
            self.is_consistent(),
            self.file_name
        )
    }
}

/// Builds a fresh 4 KiB base block for a rebuilt image.
///
/// Sequence numbers are written as a consistent 1/1 pair, the version is
/// pinned to 1.5, and the checksum (XOR of the first 127 little-endian
/// 32-bit words) is stored at offset 0x1FC.
///
/// # Arguments
///
/// * `root_cell_offset` - Root NK reference, relative to the first hbin.
/// * `hive_length` - Total size of all hive bins in bytes.
/// * `last_written` - FILETIME stamp for the header.
pub fn write_base_block(root_cell_offset: u32, hive_length: u32, last_written: u64) -> Vec<u8> {
    let mut block = vec![0u8; BASE_BLOCK_SIZE];

    block[0..4].copy_from_slice(REGF_SIGNATURE);
    block[0x04..0x08].copy_from_slice(&1u32.to_le_bytes());
    block[0x08..0x0C].copy_from_slice(&1u32.to_le_bytes());
    block[0x0C..0x14].copy_from_slice(&last_written.to_le_bytes());
    block[0x14..0x18].copy_from_slice(&EMIT_MAJOR_VERSION.to_le_bytes());
    block[0x18..0x1C].copy_from_slice(&EMIT_MINOR_VERSION.to_le_bytes());
    block[0x1C..0x20].copy_from_slice(&0u32.to_le_bytes()); // file type: normal
    block[0x20..0x24].copy_from_slice(&1u32.to_le_bytes()); // format: memory load
    block[0x24..0x28].copy_from_slice(&root_cell_offset.to_le_bytes());
    block[0x28..0x2C].copy_from_slice(&hive_length.to_le_bytes());
    block[0x2C..0x30].copy_from_slice(&1u32.to_le_bytes()); // clustering factor

    let checksum = calculate_checksum(&block);
    block[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());

    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_block_size() {
        assert_eq!(BASE_BLOCK_SIZE, 4096);
    }

    #[test]
    fn test_invalid_signature() {
        let mut data = vec![0u8; BASE_BLOCK_SIZE];
        data[0..4].copy_from_slice(b"XXXX");

        let result = BaseBlock::parse(&data);
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), RegistryError::InvalidSignature { .. }));
    }

    #[test]
    fn test_too_small() {
        let data = vec![0u8; 100];
        let result = BaseBlock::parse(&data);
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), RegistryError::HiveTooSmall { .. }));
    }

    #[test]
    fn test_write_parse_round_trip() {
        let block = write_base_block(0x20, 4096, 0x01DA_1234_5678_9ABC);
        let parsed = BaseBlock::parse(&block).unwrap();

        assert_eq!(parsed.root_cell_offset, 0x20);
        assert_eq!(parsed.hive_length, 4096);
        assert_eq!(parsed.last_written, 0x01DA_1234_5678_9ABC);
        assert_eq!(parsed.major_version, 1);
        assert_eq!(parsed.minor_version, 5);
        assert!(parsed.is_consistent());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut block = write_base_block(0x20, 4096, 0);
        block[0x24] ^= 0xFF;
        let result = BaseBlock::parse(&block);
        assert!(matches!(result, Err(RegistryError::ChecksumMismatch { .. })));
    }
}
