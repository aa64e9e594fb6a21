//! Registry value (vk) parsing and data extraction.

use crate::cell::{ValueKeyFlags, ValueType};
use crate::error::{RegistryError, Result};
use crate::strings::{decode_name, read_utf16_string};
use crate::utils::{read_i32_le, read_u16_le, read_u32_le, INLINE_DATA_BIT};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Size of the fixed value key header in bytes (name follows).
pub const VALUE_KEY_FIXED_SIZE: usize = 20;

/// Offset of the value name in the value key structure.
pub const VALUE_NAME_OFFSET: usize = 0x14;

/// Value key (vk) structure.
///
/// Represents a registry value with its name, type, and data. The
/// default (unnamed) value has an empty name.
#[derive(Debug, Clone)]
pub struct ValueKey {
    /// Length of value name.
    pub name_length: u16,

    /// Length of value data (inline bit stripped).
    pub data_length: u32,

    /// Offset to value data (or inline data if the inline bit was set).
    pub data_offset: u32,

    /// Value data type.
    pub data_type: ValueType,

    /// Flags (0x0001 = name is compressed).
    pub flags: ValueKeyFlags,

    /// True if the data is stored inline in the offset field.
    pub inline: bool,

    /// Value name.
    pub name: String,

    /// Value name folded to lowercase (lookup key).
    pub name_lower: String,

    /// Raw on-disk name bytes in their original encoding.
    pub name_raw: Vec<u8>,
}

impl ValueKey {
    /// Parses a value key from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "vk" signature).
    /// * `offset` - Offset of this cell for error reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < VALUE_KEY_FIXED_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: VALUE_KEY_FIXED_SIZE,
                actual: data.len(),
            });
        }

        // Verify signature
        if &data[0..2] != b"vk" {
            return Err(RegistryError::InvalidFormat(format!(
                "Expected 'vk' signature at offset {:#x}",
                offset
            )));
        }

        let name_length = read_u16_le(data, 0x02)?;

        // Data length is stored with the high bit indicating inline data
        let data_length_raw = read_i32_le(data, 0x04)? as u32;
        let inline = (data_length_raw & INLINE_DATA_BIT) != 0;
        let data_length = data_length_raw & !INLINE_DATA_BIT;

        let data_offset = read_u32_le(data, 0x08)?;
        let data_type = ValueType::from_u32(read_u32_le(data, 0x0C)?);
        let flags = ValueKeyFlags::new(read_u16_le(data, 0x10)?);

        // Spare field at 0x12 (2 bytes) - unused

        // Value name starts at offset 0x14
        let (name, name_raw) = if name_length > 0 {
            let name_end = VALUE_NAME_OFFSET + name_length as usize;
            if name_end > data.len() {
                return Err(RegistryError::TruncatedData {
                    offset,
                    expected: name_end,
                    actual: data.len(),
                });
            }

            let name_data = &data[VALUE_NAME_OFFSET..name_end];
            let name = decode_name(name_data, flags.is_compressed(), offset)?;
            (name, name_data.to_vec())
        } else {
            // Default (unnamed) value
            (String::new(), Vec::new())
        };

        let name_lower = name.to_lowercase();

        Ok(ValueKey {
            name_length,
            data_length,
            data_offset,
            data_type,
            flags,
            inline,
            name,
            name_lower,
            name_raw,
        })
    }

    /// Returns true if the data is stored inline (in the data_offset field).
    pub fn is_inline_data(&self) -> bool {
        self.inline
    }

    /// Extracts inline data (at most 4 bytes from the offset field).
    pub fn inline_data(&self) -> Vec<u8> {
        let bytes = self.data_offset.to_le_bytes();
        let len = (self.data_length as usize).min(4);
        bytes[..len].to_vec()
    }
}

/// Parsed registry value data.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ValueData {
    /// No data.
    None,

    /// String value.
    String(String),

    /// Expandable string value.
    ExpandString(String),

    /// Binary data.
    Binary(Vec<u8>),

    /// 32-bit integer.
    Dword(u32),

    /// 32-bit big-endian integer.
    DwordBigEndian(u32),

    /// Multiple strings.
    MultiString(Vec<String>),

    /// 64-bit integer.
    Qword(u64),

    /// Unknown or unsupported type.
    Unknown(Vec<u8>),
}

impl ValueData {
    /// Parses value data based on the value type.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw value data bytes.
    /// * `value_type` - Type of the value.
    /// * `offset` - Offset for error reporting.
    pub fn parse(data: &[u8], value_type: ValueType, offset: u32) -> Result<Self> {
        if data.is_empty() {
            return Ok(ValueData::None);
        }

        match value_type {
            ValueType::None => Ok(ValueData::None),

            ValueType::String | ValueType::ExpandString => {
                let s = read_utf16_string(data, offset)?;
                if value_type == ValueType::String {
                    Ok(ValueData::String(s))
                } else {
                    Ok(ValueData::ExpandString(s))
                }
            }

            ValueType::Binary => Ok(ValueData::Binary(data.to_vec())),

            ValueType::Dword => {
                if data.len() < 4 {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: 4,
                        actual: data.len(),
                    });
                }
                let mut cursor = Cursor::new(data);
                let value = cursor.read_u32::<LittleEndian>()?;
                Ok(ValueData::Dword(value))
            }

            ValueType::DwordBigEndian => {
                if data.len() < 4 {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: 4,
                        actual: data.len(),
                    });
                }
                let mut cursor = Cursor::new(data);
                let value = cursor.read_u32::<BigEndian>()?;
                Ok(ValueData::DwordBigEndian(value))
            }

            ValueType::Qword => {
                if data.len() < 8 {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: 8,
                        actual: data.len(),
                    });
                }
                let mut cursor = Cursor::new(data);
                let value = cursor.read_u64::<LittleEndian>()?;
                Ok(ValueData::Qword(value))
            }

            ValueType::MultiString => {
                let full_string = read_utf16_string(data, offset)?;
                let strings: Vec<String> = full_string
                    .split('\0')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect();
                Ok(ValueData::MultiString(strings))
            }

            // For other types, return raw binary data
            _ => Ok(ValueData::Unknown(data.to_vec())),
        }
    }

    /// Converts the value data to a string representation.
    pub fn to_display_string(&self) -> String {
        match self {
            ValueData::None => String::from("(none)"),
            ValueData::String(s) | ValueData::ExpandString(s) => s.clone(),
            ValueData::Binary(b) => format!("{:02X?}", b),
            ValueData::Dword(d) => format!("{} (0x{:08X})", d, d),
            ValueData::DwordBigEndian(d) => format!("{} (0x{:08X})", d, d),
            ValueData::Qword(q) => format!("{} (0x{:016X})", q, q),
            ValueData::MultiString(strings) => strings.join(", "),
            ValueData::Unknown(b) => format!("{:02X?}", b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_key_minimum_size() {
        let data = vec![0u8; 19];
        let result = ValueKey::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_value_key_invalid_signature() {
        let mut data = vec![0u8; 24];
        data[0..2].copy_from_slice(b"XX");
        let result = ValueKey::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_inline_data() {
        let mut data = vec![0u8; 24];
        data[0..2].copy_from_slice(b"vk");
        // Inline bit set, length 4
        data[0x04..0x08].copy_from_slice(&(4u32 | INLINE_DATA_BIT).to_le_bytes());
        data[0x08..0x0C].copy_from_slice(&[0x01, 0x02, 0x03, 0x04]);

        let vk = ValueKey::parse(&data, 0).unwrap();
        assert!(vk.is_inline_data());
        assert_eq!(vk.data_length, 4);
        assert_eq!(vk.inline_data(), vec![0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_default_value_has_empty_name() {
        let mut data = vec![0u8; 24];
        data[0..2].copy_from_slice(b"vk");
        let vk = ValueKey::parse(&data, 0).unwrap();
        assert_eq!(vk.name, "");
        assert!(vk.name_raw.is_empty());
    }

    #[test]
    fn test_compressed_value_name() {
        let name = b"DisplayName";
        let mut data = vec![0u8; VALUE_NAME_OFFSET + name.len()];
        data[0..2].copy_from_slice(b"vk");
        data[0x02..0x04].copy_from_slice(&(name.len() as u16).to_le_bytes());
        data[0x10..0x12].copy_from_slice(&ValueKeyFlags::COMP_NAME.to_le_bytes());
        data[VALUE_NAME_OFFSET..].copy_from_slice(name);

        let vk = ValueKey::parse(&data, 0).unwrap();
        assert_eq!(vk.name, "DisplayName");
        assert_eq!(vk.name_lower, "displayname");
        assert!(vk.flags.is_compressed());
    }

    #[test]
    fn test_value_data_dword() {
        let data = ValueData::parse(&[0x78, 0x56, 0x34, 0x12], ValueType::Dword, 0).unwrap();
        assert!(matches!(data, ValueData::Dword(0x12345678)));
    }

    #[test]
    fn test_value_data_multi_string() {
        let bytes = crate::strings::encode_wide("A\0B\0\0");
        let data = ValueData::parse(&bytes, ValueType::MultiString, 0).unwrap();
        match data {
            ValueData::MultiString(strings) => assert_eq!(strings, vec!["A", "B"]),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
