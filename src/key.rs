//! Registry key node (nk) parsing and representation.

use crate::cell::KeyNodeFlags;
use crate::error::{RegistryError, Result};
use crate::strings::decode_name;
use crate::utils::{read_u16_le, read_u32_le, read_u64_le};

/// Size of the fixed key node header in bytes (name follows).
pub const KEY_NODE_FIXED_SIZE: usize = 76;

/// Minimum key node payload size; shorter payloads are padded up.
pub const KEY_NODE_MIN_PAYLOAD: usize = 80;

/// Offset of the key name in the key node structure.
pub const KEY_NAME_OFFSET: usize = 0x4C;

/// Key node (nk) structure.
///
/// Represents a registry key with metadata including name, timestamps,
/// and references to subkeys and values. The raw name bytes and their
/// encoding flag are retained so a rebuild can re-emit inherited names
/// without re-encoding.
#[derive(Debug, Clone)]
pub struct KeyNode {
    /// Flags for this key.
    pub flags: KeyNodeFlags,

    /// Last written timestamp (Windows FILETIME).
    pub last_written: u64,

    /// Access bits (unused).
    pub access_bits: u32,

    /// Offset to parent key node.
    pub parent_offset: u32,

    /// Number of subkeys.
    pub subkey_count: u32,

    /// Number of volatile subkeys.
    pub volatile_subkey_count: u32,

    /// Offset to subkey list.
    pub subkey_list_offset: u32,

    /// Offset to volatile subkey list.
    pub volatile_subkey_list_offset: u32,

    /// Number of values.
    pub value_count: u32,

    /// Offset to value list.
    pub value_list_offset: u32,

    /// Offset to security descriptor.
    pub security_offset: u32,

    /// Offset to class name.
    pub class_name_offset: u32,

    /// Length of key name in bytes.
    pub name_length: u16,

    /// Length of class name.
    pub class_name_length: u16,

    /// Key name.
    pub name: String,

    /// Key name folded to lowercase (lookup key).
    pub name_lower: String,

    /// Raw on-disk name bytes in their original encoding.
    pub name_raw: Vec<u8>,
}

impl KeyNode {
    /// Parses a key node from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "nk" signature).
    /// * `offset` - Offset of this cell for error reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < KEY_NODE_FIXED_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: KEY_NODE_FIXED_SIZE,
                actual: data.len(),
            });
        }

        // Verify signature
        if &data[0..2] != b"nk" {
            return Err(RegistryError::InvalidFormat(format!(
                "Expected 'nk' signature at offset {:#x}",
                offset
            )));
        }

        let flags = KeyNodeFlags::new(read_u16_le(data, 0x02)?);
        let last_written = read_u64_le(data, 0x04)?;
        let access_bits = read_u32_le(data, 0x0C)?;
        let parent_offset = read_u32_le(data, 0x10)?;
        let subkey_count = read_u32_le(data, 0x14)?;
        let volatile_subkey_count = read_u32_le(data, 0x18)?;
        let subkey_list_offset = read_u32_le(data, 0x1C)?;
        let volatile_subkey_list_offset = read_u32_le(data, 0x20)?;
        let value_count = read_u32_le(data, 0x24)?;
        let value_list_offset = read_u32_le(data, 0x28)?;
        let security_offset = read_u32_le(data, 0x2C)?;
        let class_name_offset = read_u32_le(data, 0x30)?;

        // Max-length hints at 0x34..0x44 and the work var at 0x44 are
        // read-side noise; the rebuild writes them as zero.

        let name_length = read_u16_le(data, 0x48)?;
        let class_name_length = read_u16_le(data, 0x4A)?;

        // Key name starts at offset 0x4C
        let (name, name_raw) = if name_length > 0 {
            let name_end = KEY_NAME_OFFSET + name_length as usize;
            if name_end > data.len() {
                return Err(RegistryError::TruncatedData {
                    offset,
                    expected: name_end,
                    actual: data.len(),
                });
            }

            let name_data = &data[KEY_NAME_OFFSET..name_end];
            let name = decode_name(name_data, flags.is_compressed(), offset)?;
            (name, name_data.to_vec())
        } else {
            (String::new(), Vec::new())
        };

        let name_lower = name.to_lowercase();

        Ok(KeyNode {
            flags,
            last_written,
            access_bits,
            parent_offset,
            subkey_count,
            volatile_subkey_count,
            subkey_list_offset,
            volatile_subkey_list_offset,
            value_count,
            value_list_offset,
            security_offset,
            class_name_offset,
            name_length,
            class_name_length,
            name,
            name_lower,
            name_raw,
        })
    }

    /// Returns true if this key has subkeys.
    pub fn has_subkeys(&self) -> bool {
        self.subkey_count > 0
    }

    /// Returns true if this key has values.
    pub fn has_values(&self) -> bool {
        self.value_count > 0
    }

    /// Returns true if this is the root key.
    pub fn is_root(&self) -> bool {
        self.flags.is_root()
    }
}
