//! Big data block (db) parsing.
//!
//! Value payloads too large for a single data cell are stored through a
//! "db" indirection: a small header cell pointing at a blocklist of data
//! block cells, each holding at most [`BIG_DATA_BLOCK_SIZE`] bytes.

use crate::error::{RegistryError, Result};
use crate::utils::{read_u16_le, read_u32_le};

/// Maximum payload bytes carried by a single big-data block cell.
pub const BIG_DATA_BLOCK_SIZE: usize = 16344;

/// Big data block header structure.
///
/// Format:
/// ```text
/// Offset  Size  Description
/// 0x00    2     Signature ("db")
/// 0x02    2     Number of blocks
/// 0x04    4     Offset to blocklist
/// ```
#[derive(Debug, Clone)]
pub struct BigDataBlock {
    /// Number of data blocks
    pub block_count: u16,

    /// Offset to the list of block offsets
    pub block_list_offset: u32,
}

impl BigDataBlock {
    /// Minimum size of a big data block header
    const MIN_SIZE: usize = 8;

    /// Parses a big data block header from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "db" signature)
    /// * `offset` - Offset of this cell for error reporting
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: Self::MIN_SIZE,
                actual: data.len(),
            });
        }

        // Verify signature
        if &data[0..2] != b"db" {
            return Err(RegistryError::InvalidFormat(format!(
                "Expected 'db' signature at offset {:#x}, found {:?}",
                offset,
                &data[0..2]
            )));
        }

        let block_count = read_u16_le(data, 0x02)?;
        let block_list_offset = read_u32_le(data, 0x04)?;

        Ok(BigDataBlock {
            block_count,
            block_list_offset,
        })
    }

    /// Number of blocks needed to cover `length` bytes of payload.
    pub fn blocks_for(length: usize) -> usize {
        (length + BIG_DATA_BLOCK_SIZE - 1) / BIG_DATA_BLOCK_SIZE
    }
}
