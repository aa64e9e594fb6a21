//! Base-image reader with memory-mapped file support.
//!
//! A [`Hive`] is the read-only capability a transaction is layered on
//! top of: it resolves the tree of a hive image and yields keys, values,
//! and raw value data. The rebuild pipeline walks it through the same
//! interface the public API uses.

use crate::bigdata::BigDataBlock;
use crate::error::{RegistryError, Result};
use crate::hbin::HbinHeader;
use crate::header::{BaseBlock, BASE_BLOCK_SIZE};
use crate::key::KeyNode;
use crate::subkey_list;
use crate::transaction::normalize_path;
use crate::utils::{cell_offset_to_absolute, INVALID_OFFSET};
use crate::value::{ValueData, ValueKey};
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, instrument};

/// Main registry hive reader.
///
/// This structure provides access to a Windows registry hive image using
/// memory-mapped I/O for efficient, zero-copy parsing.
///
/// # Caching
///
/// The hive maintains an internal cache of parsed key nodes to avoid redundant
/// parsing during traversal. The cache uses interior mutability via `RwLock`
/// to allow caching while keeping the API immutable and thread-safe.
pub struct Hive {
    /// Hive data - either memory-mapped or owned.
    data: HiveData,

    /// Parsed base block header.
    base_block: BaseBlock,

    /// Cache of parsed key nodes (offset -> KeyNode).
    key_cache: RwLock<HashMap<u32, KeyNode>>,
}

/// Represents hive data storage.
enum HiveData {
    /// Memory-mapped file data.
    Mapped(Mmap),
    /// Owned data (e.g. a freshly rebuilt image).
    Owned(Arc<Vec<u8>>),
}

impl HiveData {
    /// Returns a slice of the hive data.
    fn as_slice(&self) -> &[u8] {
        match self {
            HiveData::Mapped(mmap) => mmap,
            HiveData::Owned(data) => data,
        }
    }
}

impl Hive {
    /// Opens a registry hive file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the registry hive file.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - File cannot be opened
    /// - File is not a valid registry hive
    /// - Header is corrupted
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening registry hive");
        let file = File::open(&path)?;

        // Validate file size BEFORE creating memory map
        let metadata = file.metadata()?;
        let file_size = metadata.len() as usize;

        if file_size < BASE_BLOCK_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: file_size,
                minimum: BASE_BLOCK_SIZE,
            });
        }

        // SAFETY: This is safe because:
        // 1. The file is opened in read-only mode (no write access)
        // 2. The file size has been validated to be at least BASE_BLOCK_SIZE
        // 3. The mmap lifetime is tied to the Hive lifetime
        // 4. All access to the mmap is bounds-checked via read_cell() and other methods
        let mmap = unsafe { Mmap::map(&file)? };
        debug!(size = mmap.len(), "Memory mapped hive file");

        Self::from_data(HiveData::Mapped(mmap))
    }

    /// Creates a hive reader from a memory-mapped region.
    pub fn from_mmap(mmap: Mmap) -> Result<Self> {
        Self::from_data(HiveData::Mapped(mmap))
    }

    /// Creates a hive reader from owned data.
    pub fn from_vec(data: Vec<u8>) -> Result<Self> {
        Self::from_data(HiveData::Owned(Arc::new(data)))
    }

    /// Creates a hive reader from hive data.
    fn from_data(data: HiveData) -> Result<Self> {
        // Parse base block (includes checksum verification)
        let base_block = BaseBlock::parse(data.as_slice())?;

        Ok(Self {
            data,
            base_block,
            key_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Returns a reference to the base block header.
    pub fn base_block(&self) -> &BaseBlock {
        &self.base_block
    }

    /// Returns the cell offset of the root key node.
    pub fn root_offset(&self) -> u32 {
        self.base_block.root_cell_offset
    }

    /// Returns the root key of the hive.
    ///
    /// # Errors
    ///
    /// Returns an error if the root key cannot be parsed.
    #[instrument(skip(self))]
    pub fn root_key(&self) -> Result<RegistryKey> {
        debug!(offset = %format!("{:#x}", self.base_block.root_cell_offset), "Accessing root key");
        self.get_key(self.base_block.root_cell_offset)
    }

    /// Gets a key node by its cell offset.
    ///
    /// # Arguments
    ///
    /// * `offset` - Cell offset (relative to first hbin).
    ///
    /// # Caching
    ///
    /// This method uses an internal cache to avoid re-parsing the same key node
    /// multiple times during traversal. The cache is transparent to the caller.
    pub fn get_key(&self, offset: u32) -> Result<RegistryKey> {
        let key_node = self.key_node(offset)?;
        Ok(RegistryKey {
            hive: self,
            offset,
            key_node,
        })
    }

    /// Parses (or retrieves from cache) the key node at the given offset.
    pub(crate) fn key_node(&self, offset: u32) -> Result<KeyNode> {
        if let Some(key_node) = self
            .key_cache
            .read()
            .expect("key cache lock poisoned")
            .get(&offset)
        {
            return Ok(key_node.clone());
        }

        let cell_data = self.read_cell(offset)?;
        let key_node = KeyNode::parse(cell_data, offset)?;
        self.key_cache
            .write()
            .expect("key cache lock poisoned")
            .insert(offset, key_node.clone());

        Ok(key_node)
    }

    /// Reads a cell at the given offset.
    ///
    /// # Arguments
    ///
    /// * `offset` - Cell offset (relative to first hbin).
    ///
    /// # Returns
    ///
    /// Returns the cell data (excluding the size field).
    pub(crate) fn read_cell(&self, offset: u32) -> Result<&[u8]> {
        let abs_offset = cell_offset_to_absolute(offset)? as usize;
        let data = self.data.as_slice();

        if abs_offset >= data.len() {
            return Err(RegistryError::invalid_offset(offset, data.len()));
        }

        // Read cell size
        if abs_offset + 4 > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: 4,
                actual: data.len() - abs_offset,
            });
        }

        let size_bytes = &data[abs_offset..abs_offset + 4];
        let size = i32::from_le_bytes([size_bytes[0], size_bytes[1], size_bytes[2], size_bytes[3]]);

        let abs_size = size.unsigned_abs() as usize;

        if abs_size < 4 {
            return Err(RegistryError::invalid_cell_size(size, offset));
        }

        let data_start = abs_offset + 4;
        let data_end = abs_offset + abs_size;

        if data_end > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: abs_size,
                actual: data.len() - abs_offset,
            });
        }

        Ok(&data[data_start..data_end])
    }

    /// Parses a value key at the given offset.
    pub(crate) fn value_key(&self, offset: u32) -> Result<ValueKey> {
        let cell_data = self.read_cell(offset)?;
        ValueKey::parse(cell_data, offset)
    }

    /// Reads the VK references of a key's value list.
    pub(crate) fn value_list_refs(&self, key_node: &KeyNode) -> Result<Vec<u32>> {
        if !key_node.has_values()
            || key_node.value_list_offset == INVALID_OFFSET
            || key_node.value_list_offset == 0
        {
            return Ok(Vec::new());
        }

        let list_data = self.read_cell(key_node.value_list_offset)?;
        let value_count = key_node.value_count as usize;

        crate::utils::check_list_bounds(list_data.len(), 0, value_count, 4)?;

        let mut refs = Vec::with_capacity(value_count);
        for i in 0..value_count {
            refs.push(crate::utils::read_u32_le(list_data, i * 4)?);
        }
        Ok(refs)
    }

    /// Reads the raw data bytes of a parsed value key.
    pub(crate) fn value_bytes(&self, value_key: &ValueKey) -> Result<Vec<u8>> {
        if value_key.is_inline_data() {
            Ok(value_key.inline_data())
        } else if value_key.data_offset == INVALID_OFFSET || value_key.data_length == 0 {
            Ok(Vec::new())
        } else {
            self.read_value_data(value_key.data_offset, value_key.data_length)
        }
    }

    /// Reads value data at the given offset.
    ///
    /// Handles both direct data cells and big-data (db) indirection. The
    /// storage class is detected by the target cell's signature rather
    /// than a length threshold, so images using either the 4 KiB or the
    /// 16344-byte cutover read back identically.
    fn read_value_data(&self, offset: u32, length: u32) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }

        let cell = self.read_cell(offset)?;

        if length as usize > cell.len() && cell.len() >= 2 && &cell[0..2] == b"db" {
            return self.read_big_data(offset, length);
        }

        if (length as usize) > cell.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: length as usize,
                actual: cell.len(),
            });
        }

        Ok(cell[..length as usize].to_vec())
    }

    /// Reads a big data (db) record and reassembles its blocks.
    fn read_big_data(&self, offset: u32, expected_length: u32) -> Result<Vec<u8>> {
        debug!(
            offset = %format!("{:#x}", offset),
            length = expected_length,
            "Reading big data record"
        );

        let header_cell = self.read_cell(offset)?;
        let db_header = BigDataBlock::parse(header_cell, offset)?;

        let block_list_cell = self.read_cell(db_header.block_list_offset)?;
        let count = db_header.block_count as usize;

        crate::utils::check_list_bounds(block_list_cell.len(), 0, count, 4)?;

        let mut data = Vec::with_capacity(expected_length as usize);
        for i in 0..count {
            let block_ref = crate::utils::read_u32_le(block_list_cell, i * 4)?;
            let block_data = self.read_cell(block_ref & 0x7FFF_FFFF)?;
            data.extend_from_slice(block_data);

            if data.len() >= expected_length as usize {
                break;
            }
        }

        if data.len() < expected_length as usize {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: expected_length as usize,
                actual: data.len(),
            });
        }

        // Blocks are cell-aligned and may carry padding past the payload
        data.truncate(expected_length as usize);
        Ok(data)
    }

    /// Finds a key by its backslash-separated path from the root.
    ///
    /// Path matching is case-insensitive and uses the same normalization
    /// as the transaction surface. The empty path resolves to the root.
    pub fn find(&self, path: &str) -> Result<RegistryKey> {
        let normalized = normalize_path(path);
        let mut key = self.root_key()?;

        if normalized.is_empty() {
            return Ok(key);
        }

        for component in normalized.split('\\') {
            key = key.subkey(component)?;
        }
        Ok(key)
    }

    /// Finds the immediate child of a key by name (case-insensitive).
    pub fn lookup<'a>(
        &self,
        parent: &RegistryKey<'a>,
        child_name: &str,
    ) -> Result<RegistryKey<'a>> {
        parent.subkey(child_name)
    }

    /// Iterates over all hbins in the hive.
    pub fn hbins(&self) -> HbinIterator {
        let data = self.data.as_slice();
        HbinIterator {
            data: &data[BASE_BLOCK_SIZE..],
            offset: 0,
        }
    }

    /// Returns the raw image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_slice()
    }
}

/// Iterator over hbins in a hive.
pub struct HbinIterator<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for HbinIterator<'a> {
    type Item = Result<HbinHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let hbin_data = &self.data[self.offset..];
        let result = HbinHeader::parse(hbin_data, self.offset as u32);

        match result {
            Ok(ref header) => {
                self.offset += header.size as usize;
                Some(Ok(header.clone()))
            }
            Err(RegistryError::InvalidSignature { .. }) => {
                // Stop iteration when we hit invalid signatures (padding/EOF)
                None
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// A registry key with access to its hive.
pub struct RegistryKey<'a> {
    hive: &'a Hive,
    /// Cell offset of this key (relative to first hbin).
    pub offset: u32,
    key_node: KeyNode,
}

impl<'a> RegistryKey<'a> {
    /// Returns a reference to the parsed key node.
    pub fn key_node(&self) -> &KeyNode {
        &self.key_node
    }

    /// Returns the key name.
    pub fn name(&self) -> &str {
        &self.key_node.name
    }

    /// Returns the number of subkeys.
    pub fn subkey_count(&self) -> u32 {
        self.key_node.subkey_count
    }

    /// Returns the number of values.
    pub fn value_count(&self) -> u32 {
        self.key_node.value_count
    }

    /// Returns this key's subkeys, ordered as stored on disk.
    pub fn subkeys(&self) -> Result<Vec<RegistryKey<'a>>> {
        if !self.key_node.has_subkeys() {
            return Ok(Vec::new());
        }

        let offsets =
            subkey_list::read_offsets(self.hive, self.key_node.subkey_list_offset)?;

        let mut subkeys = Vec::with_capacity(offsets.len());
        for offset in offsets {
            subkeys.push(self.hive.get_key(offset)?);
        }
        Ok(subkeys)
    }

    /// Finds an immediate subkey by name (case-insensitive binary search).
    pub fn subkey(&self, name: &str) -> Result<RegistryKey<'a>> {
        if !self.key_node.has_subkeys() {
            return Err(RegistryError::not_found("key", name));
        }

        let entries =
            subkey_list::read_entries(self.hive, self.key_node.subkey_list_offset)?;
        let name_lower = name.to_lowercase();

        match subkey_list::find_entry(&entries, &name_lower) {
            Some(entry) => self.hive.get_key(entry.key_offset),
            None => Err(RegistryError::not_found("key", name)),
        }
    }

    /// Returns this key's values.
    pub fn values(&self) -> Result<Vec<RegistryValue<'a>>> {
        let refs = self.hive.value_list_refs(&self.key_node)?;

        let mut values = Vec::with_capacity(refs.len());
        for offset in refs {
            let value_key = self.hive.value_key(offset)?;
            values.push(RegistryValue {
                hive: self.hive,
                value_key,
            });
        }
        Ok(values)
    }

    /// Gets a specific value by name (case-insensitive).
    ///
    /// The default (unnamed) value is addressed by the empty string.
    pub fn value(&self, name: &str) -> Result<RegistryValue<'a>> {
        let name_lower = name.to_lowercase();
        for value in self.values()? {
            if value.value_key.name_lower == name_lower {
                return Ok(value);
            }
        }

        Err(RegistryError::not_found("value", name))
    }
}

/// A registry value.
pub struct RegistryValue<'a> {
    hive: &'a Hive,
    value_key: ValueKey,
}

impl<'a> RegistryValue<'a> {
    /// Returns a reference to the parsed value key.
    pub fn value_key(&self) -> &ValueKey {
        &self.value_key
    }

    /// Returns the value name (empty for the default value).
    pub fn name(&self) -> &str {
        &self.value_key.name
    }

    /// Returns the value data type.
    pub fn value_type(&self) -> crate::cell::ValueType {
        self.value_key.data_type
    }

    /// Returns the parsed value data.
    pub fn data(&self) -> Result<ValueData> {
        let raw_data = self.hive.value_bytes(&self.value_key)?;
        ValueData::parse(&raw_data, self.value_key.data_type, self.value_key.data_offset)
    }

    /// Returns the raw value data as bytes.
    pub fn raw_data(&self) -> Result<Vec<u8>> {
        self.hive.value_bytes(&self.value_key)
    }
}
