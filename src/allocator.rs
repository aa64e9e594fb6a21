//! Bin-aware cell allocator.
//!
//! The rebuild pipeline serializes cells into a single growing cell
//! buffer that holds only cell bytes (no bin headers). The allocator
//! hands out offsets within that buffer while honoring the on-disk
//! constraints: every cell size is a multiple of 8 and no cell crosses a
//! 4 KiB bin boundary. When a cell does not fit the current bin's
//! remainder, the remainder becomes a free cell and a new bin opens,
//! sized up the 4 -> 8 -> 12 -> 16 KiB ladder as needed.
//!
//! Each bin's position is recorded so the image assembler can wrap the
//! buffer in `hbin` headers and convert buffer offsets to hive-relative
//! references in O(log n).

use crate::error::{RegistryError, Result};
use crate::hbin::HBIN_HEADER_SIZE;
use crate::pool;
use crate::utils::{align_bin_size, align_cell_size, read_i32_le, CELL_HEADER_SIZE};

/// Largest bin the ladder opens; cells beyond this cannot be stored.
pub const MAX_BIN_SIZE: usize = 4 * 4096;

/// Placement of one bin within the cell buffer and the final image.
#[derive(Debug, Clone, Copy)]
pub struct BinDescriptor {
    /// Start of this bin's cell region within the cell buffer.
    pub buf_start: usize,

    /// Total bin size in bytes, including the 32-byte header.
    pub size: u32,

    /// Bin start relative to the first hbin (cumulative file offset).
    pub file_start: u32,
}

impl BinDescriptor {
    /// Capacity of the cell region (bin size minus header).
    pub fn capacity(&self) -> usize {
        self.size as usize - HBIN_HEADER_SIZE
    }
}

/// Cell allocator over a pooled buffer.
///
/// A single rebuild owns one allocator; offsets are handed out strictly
/// monotonically.
pub struct CellAllocator {
    buf: Vec<u8>,
    bins: Vec<BinDescriptor>,
}

impl CellAllocator {
    /// Creates an allocator backed by a pooled buffer with the given
    /// capacity pre-reserved.
    pub fn new(capacity_hint: usize) -> Self {
        CellAllocator {
            buf: pool::get(capacity_hint),
            bins: Vec::new(),
        }
    }

    /// Allocates a cell with room for `payload_len` payload bytes.
    ///
    /// The cell header (negative size) is written immediately; the
    /// payload is zeroed. Returns the buffer offset of the cell header.
    ///
    /// # Errors
    ///
    /// Returns `AllocatorExhaustion` if the rounded cell cannot fit even
    /// the largest bin on the ladder.
    pub fn alloc(&mut self, payload_len: usize) -> Result<u32> {
        let total = align_cell_size(payload_len + CELL_HEADER_SIZE);

        if total + HBIN_HEADER_SIZE > MAX_BIN_SIZE {
            return Err(RegistryError::AllocatorExhaustion {
                size: total,
                max: MAX_BIN_SIZE,
            });
        }

        let needs_new_bin = match self.bins.last() {
            None => true,
            Some(bin) => {
                let used = self.buf.len() - bin.buf_start;
                total > bin.capacity() - used
            }
        };

        if needs_new_bin {
            self.close_current_bin();
            self.open_bin(total);
        }

        let offset = self.buf.len();
        self.buf.resize(offset + total, 0);
        let size_field = -(total as i32);
        self.buf[offset..offset + 4].copy_from_slice(&size_field.to_le_bytes());

        Ok(offset as u32)
    }

    /// Marks the remainder of the current bin as a free cell.
    fn close_current_bin(&mut self) {
        let Some(bin) = self.bins.last() else {
            return;
        };

        let used = self.buf.len() - bin.buf_start;
        let remaining = bin.capacity() - used;
        if remaining == 0 {
            return;
        }

        // 8-byte alignment guarantees the remainder can hold a free cell
        debug_assert!(remaining >= 8);
        let marker_pos = self.buf.len();
        self.buf.resize(marker_pos + remaining, 0);
        self.buf[marker_pos..marker_pos + 4]
            .copy_from_slice(&(remaining as i32).to_le_bytes());
    }

    /// Opens a bin big enough for a cell of `total` bytes.
    fn open_bin(&mut self, total: usize) {
        let size = align_bin_size(total + HBIN_HEADER_SIZE) as u32;
        let file_start = self
            .bins
            .last()
            .map(|b| b.file_start + b.size)
            .unwrap_or(0);

        self.bins.push(BinDescriptor {
            buf_start: self.buf.len(),
            size,
            file_start,
        });
    }

    /// Returns the mutable payload slice of an allocated cell.
    pub fn payload_mut(&mut self, cell: u32) -> &mut [u8] {
        let start = cell as usize;
        let size = self.cell_size(cell);
        &mut self.buf[start + CELL_HEADER_SIZE..start + size]
    }

    /// Returns the total size (header included) of an allocated cell.
    pub fn cell_size(&self, cell: u32) -> usize {
        let size = read_i32_le(&self.buf, cell as usize)
            .expect("cell offset produced by this allocator");
        size.unsigned_abs() as usize
    }

    /// Converts a cell-buffer offset into a hive-relative reference.
    ///
    /// The reference accounts for every preceding bin's 32-byte header.
    pub fn to_hive_ref(&self, cell: u32) -> u32 {
        let cell = cell as usize;
        let idx = self.bins.partition_point(|b| b.buf_start <= cell) - 1;
        let bin = &self.bins[idx];
        bin.file_start + HBIN_HEADER_SIZE as u32 + (cell - bin.buf_start) as u32
    }

    /// Returns the recorded bin descriptors.
    pub fn bins(&self) -> &[BinDescriptor] {
        &self.bins
    }

    /// Total size of all bins (the header's hive-length field).
    pub fn total_bins_size(&self) -> u32 {
        self.bins.iter().map(|b| b.size).sum()
    }

    /// Returns the cell buffer contents.
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    /// Releases the backing buffer to the pool.
    pub fn release(self) {
        pool::put(self.buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::HBIN_START_OFFSET;

    #[test]
    fn test_alloc_rounds_to_eight() {
        let mut alloc = CellAllocator::new(0);
        let a = alloc.alloc(1).unwrap();
        let b = alloc.alloc(5).unwrap();
        assert_eq!(alloc.cell_size(a), 8);
        assert_eq!(alloc.cell_size(b), 16);
        assert_eq!(b - a, 8);
    }

    #[test]
    fn test_cell_header_is_negative_size() {
        let mut alloc = CellAllocator::new(0);
        let cell = alloc.alloc(20).unwrap();
        let raw = read_i32_le(alloc.buf(), cell as usize).unwrap();
        assert_eq!(raw, -24);
    }

    #[test]
    fn test_first_bin_is_4k() {
        let mut alloc = CellAllocator::new(0);
        alloc.alloc(60).unwrap();
        assert_eq!(alloc.bins().len(), 1);
        assert_eq!(alloc.bins()[0].size, 4096);
        assert_eq!(alloc.bins()[0].file_start, 0);
        assert_eq!(alloc.total_bins_size(), 4096);
    }

    #[test]
    fn test_bin_overflow_writes_free_tail() {
        let mut alloc = CellAllocator::new(0);
        // Fill most of the first bin: capacity 4064, take 4000.
        alloc.alloc(3996).unwrap();
        // 64 bytes remain; a 100-byte payload cannot fit.
        let cell = alloc.alloc(100).unwrap();

        assert_eq!(alloc.bins().len(), 2);
        // Free marker covers the 64-byte tail of bin 0.
        let marker = read_i32_le(alloc.buf(), 4000).unwrap();
        assert_eq!(marker, 64);
        // New cell starts at the second bin's cell region.
        assert_eq!(cell as usize, alloc.bins()[1].buf_start);
        assert_eq!(alloc.bins()[1].file_start, 4096);
    }

    #[test]
    fn test_bin_ladder_for_large_cells() {
        let mut alloc = CellAllocator::new(0);
        // An 8196-byte payload (1024-entry lh) needs a 12 KiB bin.
        alloc.alloc(8196).unwrap();
        assert_eq!(alloc.bins()[0].size, 12288);

        // The very largest cell still fits a 16 KiB bin.
        alloc.alloc(MAX_BIN_SIZE - HBIN_HEADER_SIZE - 4).unwrap();
        assert_eq!(alloc.bins().last().unwrap().size, 16384);

        // One byte more and the allocator gives up.
        let result = alloc.alloc(MAX_BIN_SIZE - HBIN_HEADER_SIZE + 4);
        assert!(matches!(result, Err(RegistryError::AllocatorExhaustion { .. })));
    }

    #[test]
    fn test_hive_ref_accounts_for_bin_headers() {
        let mut alloc = CellAllocator::new(0);
        let first = alloc.alloc(60).unwrap();
        assert_eq!(alloc.to_hive_ref(first), 32);

        // Force a second bin and re-check the mapping.
        alloc.alloc(3900).unwrap();
        let far = alloc.alloc(200).unwrap();
        let bin = alloc.bins()[1];
        assert_eq!(
            alloc.to_hive_ref(far),
            bin.file_start + 32 + (far as usize - bin.buf_start) as u32
        );
        // Sanity: hive-relative refs convert to absolute file offsets
        assert!(alloc.to_hive_ref(far) + HBIN_START_OFFSET > HBIN_START_OFFSET);
    }

    #[test]
    fn test_payload_is_zeroed_and_writable() {
        let mut alloc = CellAllocator::new(0);
        let cell = alloc.alloc(16).unwrap();
        assert!(alloc.payload_mut(cell).iter().all(|&b| b == 0));
        alloc.payload_mut(cell)[0] = 0xAB;
        assert_eq!(alloc.buf()[cell as usize + 4], 0xAB);
    }
}
