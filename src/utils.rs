//! Utility functions for binary parsing, bounds checking, and timestamps.

use crate::error::{RegistryError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Offset where hive bins start (after base block)
pub const HBIN_START_OFFSET: u32 = 0x1000;

/// Size of a cell's size-prefix header in bytes.
pub const CELL_HEADER_SIZE: usize = 4;

/// Alignment of every cell within a bin.
pub const CELL_ALIGNMENT: usize = 8;

/// Bin size granularity; every bin is a multiple of this.
pub const BIN_ALIGNMENT: usize = 4096;

/// Sentinel cell reference meaning "no reference".
pub const INVALID_OFFSET: u32 = 0xFFFF_FFFF;

/// High bit of a VK data length marking inline storage.
pub const INLINE_DATA_BIT: u32 = 0x8000_0000;

/// Difference between the FILETIME epoch (1601) and the Unix epoch (1970),
/// in seconds.
const FILETIME_UNIX_DIFF: i64 = 11_644_473_600;

/// Reads a u32 from a byte slice at the given offset.
pub fn read_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    if offset + 4 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 4,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 4]);
    Ok(cursor.read_u32::<LittleEndian>()?)
}

/// Reads a u16 from a byte slice at the given offset.
pub fn read_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    if offset + 2 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 2,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 2]);
    Ok(cursor.read_u16::<LittleEndian>()?)
}

/// Reads an i32 from a byte slice at the given offset.
pub fn read_i32_le(data: &[u8], offset: usize) -> Result<i32> {
    if offset + 4 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 4,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 4]);
    Ok(cursor.read_i32::<LittleEndian>()?)
}

/// Reads a u64 from a byte slice at the given offset.
pub fn read_u64_le(data: &[u8], offset: usize) -> Result<u64> {
    if offset + 8 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 8,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 8]);
    Ok(cursor.read_u64::<LittleEndian>()?)
}

/// Overflow-safe addition of two usize offsets.
pub fn checked_add(a: usize, b: usize) -> Result<usize> {
    a.checked_add(b).ok_or(RegistryError::InvalidOffset {
        offset: a as u32,
        hive_size: 0,
    })
}

/// Overflow-safe multiplication of a count and an element size.
pub fn checked_mul(a: usize, b: usize) -> Result<usize> {
    a.checked_mul(b).ok_or(RegistryError::InvalidOffset {
        offset: a as u32,
        hive_size: 0,
    })
}

/// Validates that `count` elements of `elem_size` bytes starting at
/// `offset` lie within a buffer of `buf_len` bytes.
///
/// Returns the end offset of the list on success.
///
/// # Errors
///
/// Returns `RegistryError::InvalidCount` if the arithmetic overflows or
/// the list escapes the buffer.
pub fn check_list_bounds(
    buf_len: usize,
    offset: usize,
    count: usize,
    elem_size: usize,
) -> Result<usize> {
    let bytes = checked_mul(count, elem_size)?;
    let end = checked_add(offset, bytes)?;
    if end > buf_len {
        return Err(RegistryError::InvalidCount {
            count,
            offset: offset as u32,
        });
    }
    Ok(end)
}

/// Rounds a cell size up to the 8-byte cell alignment.
#[inline]
pub fn align_cell_size(size: usize) -> usize {
    (size + CELL_ALIGNMENT - 1) & !(CELL_ALIGNMENT - 1)
}

/// Rounds a byte count up to the next 4 KiB bin boundary.
#[inline]
pub fn align_bin_size(size: usize) -> usize {
    (size + BIN_ALIGNMENT - 1) & !(BIN_ALIGNMENT - 1)
}

/// Calculates XOR checksum for the first 508 bytes of the base block.
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut checksum: u32 = 0;

    // XOR all DWORDs except the checksum field itself (at offset 0x1FC)
    for i in (0..0x1FC).step_by(4) {
        if i + 4 <= data.len() {
            if let Ok(dword) = read_u32_le(data, i) {
                checksum ^= dword;
            }
        }
    }

    checksum
}

/// Converts a relative cell offset to an absolute hive offset.
///
/// Cell offsets in the registry are relative to the first hbin (at 0x1000).
/// This function adds 0x1000 to convert to an absolute offset.
///
/// # Errors
///
/// Returns `RegistryError::InvalidOffset` if the offset would overflow.
#[inline]
pub fn cell_offset_to_absolute(cell_offset: u32) -> Result<u32> {
    cell_offset
        .checked_add(HBIN_START_OFFSET)
        .ok_or(RegistryError::InvalidOffset {
            offset: cell_offset,
            hive_size: 0,
        })
}

/// Converts an absolute hive offset to a relative cell offset.
///
/// # Errors
///
/// Returns `RegistryError::InvalidFormat` if the offset is before hbin start.
#[inline]
pub fn absolute_to_cell_offset(absolute_offset: u32) -> Result<u32> {
    if absolute_offset < HBIN_START_OFFSET {
        return Err(RegistryError::InvalidFormat(format!(
            "Absolute offset {:#x} is before hbin start",
            absolute_offset
        )));
    }
    Ok(absolute_offset - HBIN_START_OFFSET)
}

/// Converts a Windows FILETIME to a `chrono` UTC datetime.
///
/// FILETIME counts 100-nanosecond intervals since 1601-01-01.
pub fn filetime_to_datetime(filetime: u64) -> Option<chrono::DateTime<chrono::Utc>> {
    let seconds = (filetime / 10_000_000) as i64 - FILETIME_UNIX_DIFF;
    let nanos = ((filetime % 10_000_000) * 100) as u32;

    chrono::DateTime::from_timestamp(seconds, nanos)
}

/// Converts a `chrono` UTC datetime to a Windows FILETIME.
///
/// Times before the FILETIME epoch clamp to zero.
pub fn datetime_to_filetime(dt: chrono::DateTime<chrono::Utc>) -> u64 {
    let seconds = dt.timestamp() + FILETIME_UNIX_DIFF;
    if seconds < 0 {
        return 0;
    }
    (seconds as u64) * 10_000_000 + u64::from(dt.timestamp_subsec_nanos() / 100)
}
