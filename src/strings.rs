//! Name codecs and the registry name hash.
//!
//! Key and value names are stored on disk in one of two encodings,
//! selected by a flag on the owning cell: Windows-1252 ("compressed",
//! one byte per character, including the 0x80-0x9F punctuation range) or
//! UTF-16LE (two bytes per BMP character, four for a surrogate pair).

use crate::error::{RegistryError, Result};
use encoding_rs::{UTF_16LE, WINDOWS_1252};

/// Name bytes in their on-disk encoding.
///
/// Compressed names re-encode to Windows-1252; anything outside that
/// repertoire falls back to UTF-16LE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameBytes {
    /// Windows-1252 bytes, one per character.
    Compressed(Vec<u8>),

    /// UTF-16LE bytes.
    Wide(Vec<u8>),
}

impl NameBytes {
    /// Encodes a name, preferring the compressed form.
    pub fn encode(name: &str) -> Self {
        match encode_compressed(name) {
            Some(bytes) => NameBytes::Compressed(bytes),
            None => NameBytes::Wide(encode_wide(name)),
        }
    }

    /// Wraps already-encoded bytes from a base image.
    pub fn from_raw(bytes: Vec<u8>, compressed: bool) -> Self {
        if compressed {
            NameBytes::Compressed(bytes)
        } else {
            NameBytes::Wide(bytes)
        }
    }

    /// Returns the raw encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            NameBytes::Compressed(b) | NameBytes::Wide(b) => b,
        }
    }

    /// Returns the encoded length in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Returns true if the encoding is empty.
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Returns true for the Windows-1252 variant.
    pub fn is_compressed(&self) -> bool {
        matches!(self, NameBytes::Compressed(_))
    }
}

/// Decodes an on-disk name given its compression flag.
pub fn decode_name(data: &[u8], compressed: bool, offset: u32) -> Result<String> {
    if compressed {
        Ok(decode_compressed(data))
    } else {
        read_utf16_string(data, offset)
    }
}

/// Decodes Windows-1252 name bytes.
///
/// Every byte value maps to a character, so this cannot fail.
pub fn decode_compressed(data: &[u8]) -> String {
    let (decoded, _encoding, _had_errors) = WINDOWS_1252.decode(data);
    decoded.into_owned()
}

/// Encodes a name as Windows-1252, or `None` if any character falls
/// outside the codepage.
pub fn encode_compressed(name: &str) -> Option<Vec<u8>> {
    let (encoded, _encoding, had_errors) = WINDOWS_1252.encode(name);
    if had_errors {
        None
    } else {
        Some(encoded.into_owned())
    }
}

/// Encodes a name as UTF-16LE bytes (surrogate pairs for astral chars).
pub fn encode_wide(name: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(name.len() * 2);
    for unit in name.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

/// Reads a UTF-16LE string from a byte slice, trimming null terminators.
///
/// Registry strings are typically null-terminated. This function decodes
/// UTF-16LE data and removes trailing null characters.
///
/// # Errors
///
/// Returns an error if the data length is not even (UTF-16 requires
/// 2-byte units) or if the UTF-16 decoding fails.
pub fn read_utf16_string(data: &[u8], offset: u32) -> Result<String> {
    if data.is_empty() {
        return Ok(String::new());
    }

    // UTF-16 requires even number of bytes
    if data.len() % 2 != 0 {
        return Err(RegistryError::InvalidUtf16 { offset });
    }

    let (decoded, _encoding, had_errors) = UTF_16LE.decode(data);

    if had_errors {
        return Err(RegistryError::InvalidUtf16 { offset });
    }

    // Trim null terminators (common in registry strings)
    Ok(decoded.trim_end_matches('\0').to_string())
}

/// Reads a fixed-length ASCII string (not null-terminated).
pub fn read_fixed_ascii(data: &[u8], len: usize) -> String {
    data.iter()
        .take(len)
        .map(|&b| if b == 0 { ' ' } else { b as char })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Computes the registry name hash over folded-uppercase characters.
///
/// `hash = hash * 37 + uppercase(c)` per logical character, which is the
/// hash stored in `lh` leaf entries.
pub fn registry_hash(name: &str) -> u32 {
    let mut hash: u32 = 0;
    for c in name.chars() {
        let upper = c.to_uppercase().next().unwrap_or(c);
        hash = hash.wrapping_mul(37).wrapping_add(upper as u32);
    }
    hash
}
