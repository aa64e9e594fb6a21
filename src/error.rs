//! Error types for registry hive operations.
//!
//! This module provides comprehensive error handling for all engine
//! operations: parsing the base image, staging transactional edits, and
//! rebuilding a fresh hive image.

use std::io;
use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur while reading, editing, or rebuilding a hive.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// I/O error occurred while reading or writing a hive file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid magic signature in header or structure.
    #[error("Invalid signature: expected {expected:?}, found {found:?}")]
    InvalidSignature {
        expected: Vec<u8>,
        found: Vec<u8>,
    },

    /// Invalid hive format or corrupted data.
    #[error("Invalid hive format: {0}")]
    InvalidFormat(String),

    /// Cell offset is out of bounds.
    #[error("Invalid cell offset: {offset:#x} (hive size: {hive_size:#x})")]
    InvalidOffset {
        offset: u32,
        hive_size: usize,
    },

    /// Cell size is invalid or corrupted.
    #[error("Invalid cell size: {size} at offset {offset:#x}")]
    InvalidCellSize {
        size: i32,
        offset: u32,
    },

    /// Key or value not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Data truncated or incomplete.
    #[error("Truncated data at offset {offset:#x}: expected {expected} bytes, got {actual} bytes")]
    TruncatedData {
        offset: u32,
        expected: usize,
        actual: usize,
    },

    /// A count-like field is inconsistent with the structure around it.
    #[error("Invalid count {count} at offset {offset:#x}")]
    InvalidCount {
        count: usize,
        offset: u32,
    },

    /// A count-like field exceeds the cap chosen to bound pathological reads.
    #[error("Sanity limit exceeded: {what} is {actual} (cap: {cap})")]
    SanityLimit {
        what: &'static str,
        actual: usize,
        cap: usize,
    },

    /// Invalid UTF-16 string data.
    #[error("Invalid UTF-16 string at offset {offset:#x}")]
    InvalidUtf16 {
        offset: u32,
    },

    /// A name cannot be represented in any supported on-disk encoding.
    #[error("Name {0:?} cannot be encoded")]
    EncodingError(String),

    /// Hive is too small to be valid.
    #[error("Hive too small: {size} bytes (minimum: {minimum} bytes)")]
    HiveTooSmall {
        size: usize,
        minimum: usize,
    },

    /// Checksum mismatch in hive header.
    #[error("Checksum mismatch: expected {expected:#x}, calculated {calculated:#x}")]
    ChecksumMismatch {
        expected: u32,
        calculated: u32,
    },

    /// Unsupported hive version.
    #[error("Unsupported hive version: {major}.{minor}")]
    UnsupportedVersion {
        major: u32,
        minor: u32,
    },

    /// Invalid subkey list type.
    #[error("Invalid subkey list type: {list_type:?}")]
    InvalidSubkeyList {
        list_type: [u8; 2],
    },

    /// Transaction misuse (operation on a committed or rolled-back transaction).
    #[error("Transaction state error: {0}")]
    StateError(&'static str),

    /// A single cell cannot fit even the largest bin the allocator opens.
    #[error("Cell of {size} bytes exceeds the {max} byte bin ceiling")]
    AllocatorExhaustion {
        size: usize,
        max: usize,
    },

    /// A staged edit exceeds a configured hive limit.
    #[error("Limit violation: {rule} is {actual} (bound: {bound})")]
    LimitViolation {
        rule: &'static str,
        bound: u64,
        actual: u64,
    },
}

impl RegistryError {
    /// Creates an invalid signature error with context.
    ///
    /// # Arguments
    ///
    /// * `expected` - Expected signature bytes
    /// * `found` - Actual signature bytes found
    pub fn invalid_signature(expected: &[u8], found: &[u8]) -> Self {
        Self::InvalidSignature {
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }

    /// Creates an invalid offset error with context.
    ///
    /// # Arguments
    ///
    /// * `offset` - The invalid offset
    /// * `hive_size` - Total size of the hive for context
    pub fn invalid_offset(offset: u32, hive_size: usize) -> Self {
        Self::InvalidOffset { offset, hive_size }
    }

    /// Creates an invalid cell size error with context.
    pub fn invalid_cell_size(size: i32, offset: u32) -> Self {
        Self::InvalidCellSize { size, offset }
    }

    /// Creates a format error with detailed context.
    pub fn format_error(message: String) -> Self {
        Self::InvalidFormat(message)
    }

    /// Creates a not found error with context about what was being searched.
    ///
    /// # Arguments
    ///
    /// * `item_type` - Type of item (e.g., "key", "value")
    /// * `name` - Name of the item that wasn't found
    pub fn not_found(item_type: &str, name: &str) -> Self {
        Self::NotFound(format!("{} '{}'", item_type, name))
    }

    /// Creates a sanity limit error for a capped count field.
    pub fn sanity_limit(what: &'static str, actual: usize, cap: usize) -> Self {
        Self::SanityLimit { what, actual, cap }
    }

    /// Creates a limit violation carrying the rule name and numeric bound.
    pub fn limit_violation(rule: &'static str, bound: u64, actual: u64) -> Self {
        Self::LimitViolation { rule, bound, actual }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let err = RegistryError::invalid_signature(b"regf", b"XXXX");
        assert!(matches!(err, RegistryError::InvalidSignature { .. }));

        let err = RegistryError::not_found("key", "Software\\Missing");
        assert!(err.to_string().contains("Software\\Missing"));

        let err = RegistryError::sanity_limit("ri sublists", 100_000, 4096);
        assert!(matches!(err, RegistryError::SanityLimit { actual: 100_000, .. }));
    }

    #[test]
    fn test_limit_violation_display() {
        let err = RegistryError::limit_violation("value_data_size", 1024, 4096);
        let msg = err.to_string();
        assert!(msg.contains("value_data_size"));
        assert!(msg.contains("1024"));
    }
}
