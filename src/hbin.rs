//! Hive bin (hbin) parsing and emission.
//!
//! Bins are the 4 KiB-aligned containers that hold cells. The read side
//! here validates exactly what the rebuild pipeline relies on: the
//! `hbin` magic, the bin's position, and a size that is a nonzero
//! multiple of the bin alignment. The write side emits the 32-byte
//! header for bins laid out by the allocator; the reserved tail of the
//! header is always zero in our images.

use crate::error::{RegistryError, Result};
use crate::utils::{read_u32_le, BIN_ALIGNMENT};

/// Expected signature for hive bins ("hbin").
pub const HBIN_SIGNATURE: &[u8; 4] = b"hbin";

/// Size of an hbin header.
pub const HBIN_HEADER_SIZE: usize = 0x20;

/// Hive bin header.
///
/// Only the fields the engine consumes are retained: the bin's offset
/// relative to the first hbin and its total size. The remaining 20
/// header bytes (reserved words, a timestamp, a spare field) carry no
/// meaning for either the cell walk or the rebuild and are skipped.
#[derive(Debug, Clone)]
pub struct HbinHeader {
    /// Offset of this hbin from the start of the hive bins (relative to 0x1000).
    pub offset: u32,

    /// Size of this hbin in bytes (including header).
    pub size: u32,
}

impl HbinHeader {
    /// Parses and validates an hbin header.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw bytes starting at the hbin header.
    /// * `expected_offset` - Where this bin must claim to sit, relative
    ///   to the first hbin.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is too small, the signature is
    /// wrong, the stored offset disagrees with the bin's actual
    /// position, or the size is not a nonzero multiple of 4 KiB.
    pub fn parse(data: &[u8], expected_offset: u32) -> Result<Self> {
        if data.len() < HBIN_HEADER_SIZE {
            return Err(RegistryError::TruncatedData {
                offset: expected_offset,
                expected: HBIN_HEADER_SIZE,
                actual: data.len(),
            });
        }

        if &data[0..4] != HBIN_SIGNATURE {
            return Err(RegistryError::invalid_signature(HBIN_SIGNATURE, &data[0..4]));
        }

        let offset = read_u32_le(data, 0x04)?;
        let size = read_u32_le(data, 0x08)?;

        if offset != expected_offset {
            return Err(RegistryError::InvalidFormat(format!(
                "Hbin offset mismatch: expected {:#x}, found {:#x}",
                expected_offset, offset
            )));
        }

        // A bin that is not a 4 KiB multiple would desync the whole walk
        if size == 0 || size as usize % BIN_ALIGNMENT != 0 {
            return Err(RegistryError::InvalidFormat(format!(
                "Hbin at {:#x} has size {:#x}, not a 4 KiB multiple",
                expected_offset, size
            )));
        }

        Ok(HbinHeader { offset, size })
    }

    /// Returns the size of the cell region (excluding the header).
    pub fn data_size(&self) -> u32 {
        self.size - HBIN_HEADER_SIZE as u32
    }
}

/// Writes a 32-byte hbin header into `dest`.
///
/// Everything past the size field is zeroed; rebuilt images never carry
/// bin timestamps.
///
/// # Arguments
///
/// * `dest` - Destination slice, at least `HBIN_HEADER_SIZE` bytes.
/// * `offset` - Bin offset relative to the first hbin.
/// * `size` - Total bin size in bytes (multiple of 4096).
pub fn write_hbin_header(dest: &mut [u8], offset: u32, size: u32) {
    debug_assert!(dest.len() >= HBIN_HEADER_SIZE);
    debug_assert!(size != 0 && size as usize % BIN_ALIGNMENT == 0);

    dest[..HBIN_HEADER_SIZE].fill(0);
    dest[0..4].copy_from_slice(HBIN_SIGNATURE);
    dest[0x04..0x08].copy_from_slice(&offset.to_le_bytes());
    dest[0x08..0x0C].copy_from_slice(&size.to_le_bytes());
}

/// Walks the cells of one bin's data area, yielding allocated and free
/// cells alike until the region is exhausted.
pub struct HbinCellIterator<'a> {
    data: &'a [u8],
    offset: usize,
    hbin_offset: u32,
}

impl<'a> HbinCellIterator<'a> {
    /// Creates a cell iterator over `data`, the bin's region after the
    /// header. `hbin_offset` is the bin's offset from the first hbin,
    /// used to report hive-relative cell positions.
    pub fn new(data: &'a [u8], hbin_offset: u32) -> Self {
        Self {
            data,
            offset: 0,
            hbin_offset,
        }
    }
}

impl<'a> Iterator for HbinCellIterator<'a> {
    type Item = Result<CellInfo<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let size = match read_u32_le(self.data, self.offset) {
            Ok(s) => s as i32,
            Err(e) => return Some(Err(e)),
        };

        if size == 0 {
            // Zeroed tail; nothing left to walk
            return None;
        }

        let abs_size = size.unsigned_abs() as usize;
        let cell_offset = self.hbin_offset + self.offset as u32;

        if abs_size < 4 || abs_size % 8 != 0 {
            return Some(Err(RegistryError::invalid_cell_size(size, cell_offset)));
        }

        let data_end = self.offset + abs_size;
        if data_end > self.data.len() {
            return Some(Err(RegistryError::TruncatedData {
                offset: cell_offset,
                expected: abs_size,
                actual: self.data.len() - self.offset,
            }));
        }

        let cell_info = CellInfo {
            offset: cell_offset,
            size: abs_size as u32,
            is_allocated: size < 0,
            data: &self.data[self.offset + 4..data_end],
        };

        self.offset = data_end;
        Some(Ok(cell_info))
    }
}

/// One cell as seen by the bin walk.
#[derive(Debug)]
pub struct CellInfo<'a> {
    /// Offset of this cell from the first hbin.
    pub offset: u32,

    /// Size of the cell (including the size field).
    pub size: u32,

    /// Whether this cell is allocated (true) or free (false).
    pub is_allocated: bool,

    /// Cell data (excluding the size field).
    pub data: &'a [u8],
}

impl<'a> CellInfo<'a> {
    /// Returns the cell type signature (first 2 bytes of data).
    pub fn cell_type(&self) -> Option<[u8; 2]> {
        if self.data.len() >= 2 {
            Some([self.data[0], self.data[1]])
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hbin_header_size() {
        assert_eq!(HBIN_HEADER_SIZE, 32);
    }

    #[test]
    fn test_invalid_signature() {
        let mut data = vec![0u8; HBIN_HEADER_SIZE];
        data[0..4].copy_from_slice(b"XXXX");

        let result = HbinHeader::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_write_parse_round_trip() {
        let mut data = vec![0u8; HBIN_HEADER_SIZE];
        write_hbin_header(&mut data, 0x2000, 8192);

        let header = HbinHeader::parse(&data, 0x2000).unwrap();
        assert_eq!(header.offset, 0x2000);
        assert_eq!(header.size, 8192);
        assert_eq!(header.data_size(), 8192 - 32);
        // Reserved region stays zero on emit
        assert!(data[0x0C..HBIN_HEADER_SIZE].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_misaligned_bin_size_rejected() {
        let mut data = vec![0u8; HBIN_HEADER_SIZE];
        write_hbin_header(&mut data, 0, 4096);
        data[0x08..0x0C].copy_from_slice(&4100u32.to_le_bytes());
        assert!(HbinHeader::parse(&data, 0).is_err());

        data[0x08..0x0C].copy_from_slice(&0u32.to_le_bytes());
        assert!(HbinHeader::parse(&data, 0).is_err());
    }

    #[test]
    fn test_offset_mismatch_rejected() {
        let mut data = vec![0u8; HBIN_HEADER_SIZE];
        write_hbin_header(&mut data, 0x1000, 4096);
        assert!(HbinHeader::parse(&data, 0x2000).is_err());
    }

    #[test]
    fn test_cell_iterator_walks_allocated_and_free() {
        let mut data = Vec::new();
        // One allocated 16-byte cell.
        data.extend_from_slice(&(-16i32).to_le_bytes());
        data.extend_from_slice(b"nk\0\0\0\0\0\0\0\0\0\0");
        // One free 8-byte cell.
        data.extend_from_slice(&8i32.to_le_bytes());
        data.extend_from_slice(&[0u8; 4]);

        let cells: Vec<_> = HbinCellIterator::new(&data, 0)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(cells.len(), 2);
        assert!(cells[0].is_allocated);
        assert_eq!(cells[0].size, 16);
        assert_eq!(cells[0].cell_type(), Some(*b"nk"));
        assert!(!cells[1].is_allocated);
        assert_eq!(cells[1].size, 8);
    }

    #[test]
    fn test_cell_iterator_rejects_misaligned_cell() {
        let mut data = Vec::new();
        data.extend_from_slice(&(-12i32).to_le_bytes());
        data.extend_from_slice(&[0u8; 8]);

        let result: Result<Vec<_>> = HbinCellIterator::new(&data, 0).collect();
        assert!(matches!(result, Err(RegistryError::InvalidCellSize { .. })));
    }
}
