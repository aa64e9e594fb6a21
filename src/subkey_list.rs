//! Subkey list engine (lf, lh, li, ri).
//!
//! Registry keys organize their children in one of four list shapes. The
//! engine reads all four (flattening `ri` indirection), maintains the
//! logical sorted form in memory, and writes lists back choosing the
//! shape from the entry count:
//!
//! | entries | shape |
//! |---|---|
//! | 0 | no list (invalid reference) |
//! | 1..=12 | `lf` |
//! | 13..=1024 | `lh` |
//! | > 1024 | `ri` over `lh` chunks of 1024 |
//!
//! `li` lists are read but never written; a rewrite collapses them to
//! `lf`/`lh`. Entries are kept sorted ascending by lowercased name,
//! which is what lookup relies on; the stored hash is a hint only.

use crate::allocator::CellAllocator;
use crate::error::{RegistryError, Result};
use crate::hive::Hive;
use crate::strings::{decode_name, registry_hash};
use crate::utils::{check_list_bounds, read_u16_le, read_u32_le, INVALID_OFFSET};
use std::collections::HashSet;
use tracing::warn;

/// Maximum entries in a fast leaf (lf) before promotion to a hash leaf.
pub const MAX_FAST_LEAF_ENTRIES: usize = 12;

/// Maximum entries in a hash leaf (lh) before promotion to an index root.
pub const MAX_HASH_LEAF_ENTRIES: usize = 1024;

/// Cap on sublists reachable through one index root.
const MAX_INDEX_ROOT_SUBLISTS: usize = 4096;

/// Cap on total entries collected from one list tree.
const MAX_LIST_ENTRIES: usize = 1 << 20;

/// Subkey list types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubkeyListType {
    /// Index leaf (li) - simple list of offsets.
    IndexLeaf,

    /// Fast leaf (lf) - list with hash hints.
    FastLeaf,

    /// Hash leaf (lh) - list with hash hints.
    HashLeaf,

    /// Index root (ri) - list of subkey list offsets.
    IndexRoot,
}

impl SubkeyListType {
    /// Parses a subkey list type from a 2-byte signature.
    pub fn from_signature(sig: &[u8; 2]) -> Result<Self> {
        match sig {
            b"li" => Ok(SubkeyListType::IndexLeaf),
            b"lf" => Ok(SubkeyListType::FastLeaf),
            b"lh" => Ok(SubkeyListType::HashLeaf),
            b"ri" => Ok(SubkeyListType::IndexRoot),
            _ => Err(RegistryError::InvalidSubkeyList { list_type: *sig }),
        }
    }

    /// Returns the 2-byte signature for this list type.
    pub fn signature(&self) -> &'static [u8; 2] {
        match self {
            SubkeyListType::IndexLeaf => b"li",
            SubkeyListType::FastLeaf => b"lf",
            SubkeyListType::HashLeaf => b"lh",
            SubkeyListType::IndexRoot => b"ri",
        }
    }
}

/// Returns the list shape the writer picks for a given entry count.
///
/// `None` means no list cell at all (zero entries).
pub fn list_format_for(count: usize) -> Option<SubkeyListType> {
    match count {
        0 => None,
        n if n <= MAX_FAST_LEAF_ENTRIES => Some(SubkeyListType::FastLeaf),
        n if n <= MAX_HASH_LEAF_ENTRIES => Some(SubkeyListType::HashLeaf),
        _ => Some(SubkeyListType::IndexRoot),
    }
}

/// One logical subkey list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubkeyEntry {
    /// Child key name folded to lowercase (the sort key).
    pub name_lower: String,

    /// Cell offset of the child key node.
    pub key_offset: u32,

    /// Registry name hash, written into lf/lh entries.
    pub hash: u32,
}

impl SubkeyEntry {
    /// Builds an entry from a child name and its NK reference.
    pub fn new(name: &str, key_offset: u32) -> Self {
        SubkeyEntry {
            name_lower: name.to_lowercase(),
            key_offset,
            hash: registry_hash(name),
        }
    }
}

/// Reads the logical entries of a subkey list, following `ri`
/// indirection and resolving each child's name.
///
/// An invalid or zero reference yields an empty list. A corrupt sublist
/// inside an index root is skipped rather than failing the whole read.
pub fn read_entries(hive: &Hive, list_offset: u32) -> Result<Vec<SubkeyEntry>> {
    let offsets = read_offsets(hive, list_offset)?;

    let mut entries = Vec::with_capacity(offsets.len());
    for key_offset in offsets {
        let key_node = hive.key_node(key_offset)?;
        entries.push(SubkeyEntry {
            hash: registry_hash(&key_node.name),
            name_lower: key_node.name_lower,
            key_offset,
        });
    }
    Ok(entries)
}

/// Reads the bare NK references of a subkey list, skipping name decode.
///
/// Used by fast paths that only need child identity.
pub fn read_offsets(hive: &Hive, list_offset: u32) -> Result<Vec<u32>> {
    let mut offsets = Vec::new();
    if list_offset != INVALID_OFFSET && list_offset != 0 {
        collect_offsets(hive, list_offset, 0, &mut offsets)?;
    }
    Ok(offsets)
}

fn collect_offsets(
    hive: &Hive,
    list_offset: u32,
    depth: usize,
    out: &mut Vec<u32>,
) -> Result<()> {
    let data = hive.read_cell(list_offset)?;
    if data.len() < 4 {
        return Err(RegistryError::TruncatedData {
            offset: list_offset,
            expected: 4,
            actual: data.len(),
        });
    }

    let sig = [data[0], data[1]];
    let list_type = SubkeyListType::from_signature(&sig)?;
    let count = read_u16_le(data, 2)? as usize;

    match list_type {
        SubkeyListType::IndexLeaf => {
            // li: signature (2) + count (2) + offsets (4 * count)
            check_list_bounds(data.len(), 4, count, 4)?;
            reserve_entries(out, count)?;
            for i in 0..count {
                out.push(read_u32_le(data, 4 + i * 4)?);
            }
        }

        SubkeyListType::FastLeaf | SubkeyListType::HashLeaf => {
            // lf/lh: signature (2) + count (2) + entries (8 * count)
            check_list_bounds(data.len(), 4, count, 8)?;
            reserve_entries(out, count)?;
            for i in 0..count {
                out.push(read_u32_le(data, 4 + i * 8)?);
            }
        }

        SubkeyListType::IndexRoot => {
            if depth > 0 {
                // Nested index roots don't occur in well-formed hives
                return Err(RegistryError::InvalidSubkeyList { list_type: sig });
            }
            if count > MAX_INDEX_ROOT_SUBLISTS {
                return Err(RegistryError::sanity_limit(
                    "index root sublists",
                    count,
                    MAX_INDEX_ROOT_SUBLISTS,
                ));
            }
            check_list_bounds(data.len(), 4, count, 4)?;
            for i in 0..count {
                let sub_offset = read_u32_le(data, 4 + i * 4)?;
                // Best effort: a single bad pointer in a big index
                // should not doom the read.
                if let Err(e) = collect_offsets(hive, sub_offset, depth + 1, out) {
                    match e {
                        RegistryError::SanityLimit { .. } => return Err(e),
                        _ => warn!(
                            offset = %format!("{:#x}", sub_offset),
                            error = %e,
                            "Skipping corrupt sublist in index root"
                        ),
                    }
                }
            }
        }
    }

    Ok(())
}

fn reserve_entries(out: &mut Vec<u32>, additional: usize) -> Result<()> {
    if out.len().saturating_add(additional) > MAX_LIST_ENTRIES {
        return Err(RegistryError::sanity_limit(
            "subkey list entries",
            out.len() + additional,
            MAX_LIST_ENTRIES,
        ));
    }
    out.reserve(additional);
    Ok(())
}

/// Resolves the given NK references whose names are in `targets`
/// (lowercased), comparing compressed names byte-wise without a full
/// decode.
pub fn match_from_offsets(
    hive: &Hive,
    offsets: &[u32],
    targets: &HashSet<String>,
) -> Result<Vec<SubkeyEntry>> {
    let mut matched = Vec::new();

    for &key_offset in offsets {
        let data = hive.read_cell(key_offset)?;
        if data.len() < crate::key::KEY_NODE_FIXED_SIZE || &data[0..2] != b"nk" {
            return Err(RegistryError::InvalidFormat(format!(
                "Expected 'nk' signature at offset {:#x}",
                key_offset
            )));
        }

        let flags = read_u16_le(data, 0x02)?;
        let compressed = (flags & crate::cell::KeyNodeFlags::COMP_NAME) != 0;
        let name_len = read_u16_le(data, 0x48)? as usize;
        let name_end = crate::key::KEY_NAME_OFFSET + name_len;
        if name_end > data.len() {
            return Err(RegistryError::TruncatedData {
                offset: key_offset,
                expected: name_end,
                actual: data.len(),
            });
        }
        let name_bytes = &data[crate::key::KEY_NAME_OFFSET..name_end];

        let hit = if compressed && name_bytes.is_ascii() {
            // Cheap path: fold and compare without allocating per target
            targets.iter().any(|t| {
                t.len() == name_bytes.len()
                    && t.bytes()
                        .zip(name_bytes.iter())
                        .all(|(a, b)| a == b.to_ascii_lowercase())
            })
        } else {
            let name = decode_name(name_bytes, compressed, key_offset)?;
            targets.contains(&name.to_lowercase())
        };

        if hit {
            let name = decode_name(name_bytes, compressed, key_offset)?;
            matched.push(SubkeyEntry::new(&name, key_offset));
        }
    }

    Ok(matched)
}

/// Binary search over entries sorted by lowercased name.
pub fn find_entry<'e>(entries: &'e [SubkeyEntry], name_lower: &str) -> Option<&'e SubkeyEntry> {
    entries
        .binary_search_by(|e| e.name_lower.as_str().cmp(name_lower))
        .ok()
        .map(|i| &entries[i])
}

/// Inserts an entry keeping the sort order; a duplicate (by lowercased
/// name) is replaced in place.
pub fn insert_entry(entries: &mut Vec<SubkeyEntry>, entry: SubkeyEntry) {
    match entries.binary_search_by(|e| e.name_lower.cmp(&entry.name_lower)) {
        Ok(i) => entries[i] = entry,
        Err(i) => entries.insert(i, entry),
    }
}

/// Removes the entry with the given lowercased name. Returns true if an
/// entry was removed.
pub fn remove_entry(entries: &mut Vec<SubkeyEntry>, name_lower: &str) -> bool {
    match entries.binary_search_by(|e| e.name_lower.as_str().cmp(name_lower)) {
        Ok(i) => {
            entries.remove(i);
            true
        }
        Err(_) => false,
    }
}

/// Filters `target_ref` out of a list's raw NK references without
/// parsing any key node.
///
/// Works over all four list shapes, including `li`. The caller rewrites
/// the surviving references through [`write_list`] (which is why
/// `li`-origin lists collapse to `lf`/`lh` on commit).
pub fn remove_by_ref(hive: &Hive, list_offset: u32, target_ref: u32) -> Result<Vec<u32>> {
    let mut offsets = read_offsets(hive, list_offset)?;
    offsets.retain(|&o| o != target_ref);
    Ok(offsets)
}

/// Writes a sorted entry slice as an on-disk subkey list.
///
/// Returns the hive-relative reference of the list cell, or the invalid
/// reference for an empty slice.
///
/// # Errors
///
/// Fails only on allocator exhaustion.
pub fn write_list(alloc: &mut CellAllocator, entries: &[SubkeyEntry]) -> Result<u32> {
    debug_assert!(entries.windows(2).all(|w| w[0].name_lower <= w[1].name_lower));

    match list_format_for(entries.len()) {
        None => Ok(INVALID_OFFSET),
        Some(SubkeyListType::FastLeaf) => write_leaf(alloc, SubkeyListType::FastLeaf, entries),
        Some(SubkeyListType::HashLeaf) => write_leaf(alloc, SubkeyListType::HashLeaf, entries),
        Some(SubkeyListType::IndexRoot) => {
            // Mirror the read-side cap: never emit an index root the
            // engine's own reader would refuse, and never let the
            // 16-bit count field wrap.
            let chunk_count = index_root_chunk_count(entries.len())?;

            let mut sublist_refs = Vec::with_capacity(chunk_count);
            for chunk in entries.chunks(MAX_HASH_LEAF_ENTRIES) {
                sublist_refs.push(write_leaf(alloc, SubkeyListType::HashLeaf, chunk)?);
            }

            let payload_len = 4 + sublist_refs.len() * 4;
            let cell = alloc.alloc(payload_len)?;
            let payload = alloc.payload_mut(cell);
            payload[0..2].copy_from_slice(SubkeyListType::IndexRoot.signature());
            payload[2..4].copy_from_slice(&(sublist_refs.len() as u16).to_le_bytes());
            for (i, sub_ref) in sublist_refs.iter().enumerate() {
                payload[4 + i * 4..8 + i * 4].copy_from_slice(&sub_ref.to_le_bytes());
            }
            Ok(alloc.to_hive_ref(cell))
        }
        Some(SubkeyListType::IndexLeaf) => unreachable!("li is never selected for writes"),
    }
}

/// Number of hash-leaf chunks an index root needs for `entry_count`
/// entries, or `SanityLimit` once that exceeds the same cap the read
/// side enforces.
fn index_root_chunk_count(entry_count: usize) -> Result<usize> {
    let chunks = (entry_count + MAX_HASH_LEAF_ENTRIES - 1) / MAX_HASH_LEAF_ENTRIES;
    if chunks > MAX_INDEX_ROOT_SUBLISTS {
        return Err(RegistryError::sanity_limit(
            "index root sublists",
            chunks,
            MAX_INDEX_ROOT_SUBLISTS,
        ));
    }
    Ok(chunks)
}

fn write_leaf(
    alloc: &mut CellAllocator,
    list_type: SubkeyListType,
    entries: &[SubkeyEntry],
) -> Result<u32> {
    let payload_len = 4 + entries.len() * 8;
    let cell = alloc.alloc(payload_len)?;
    let payload = alloc.payload_mut(cell);

    payload[0..2].copy_from_slice(list_type.signature());
    payload[2..4].copy_from_slice(&(entries.len() as u16).to_le_bytes());
    for (i, entry) in entries.iter().enumerate() {
        let base = 4 + i * 8;
        payload[base..base + 4].copy_from_slice(&entry.key_offset.to_le_bytes());
        payload[base + 4..base + 8].copy_from_slice(&entry.hash.to_le_bytes());
    }

    Ok(alloc.to_hive_ref(cell))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, offset: u32) -> SubkeyEntry {
        SubkeyEntry::new(name, offset)
    }

    #[test]
    fn test_subkey_list_type() {
        assert_eq!(
            SubkeyListType::from_signature(b"li").unwrap(),
            SubkeyListType::IndexLeaf
        );
        assert_eq!(
            SubkeyListType::from_signature(b"lf").unwrap(),
            SubkeyListType::FastLeaf
        );
        assert_eq!(
            SubkeyListType::from_signature(b"lh").unwrap(),
            SubkeyListType::HashLeaf
        );
        assert_eq!(
            SubkeyListType::from_signature(b"ri").unwrap(),
            SubkeyListType::IndexRoot
        );
    }

    #[test]
    fn test_invalid_signature() {
        let result = SubkeyListType::from_signature(b"XX");
        assert!(result.is_err());
    }

    #[test]
    fn test_format_table() {
        assert_eq!(list_format_for(0), None);
        assert_eq!(list_format_for(1), Some(SubkeyListType::FastLeaf));
        assert_eq!(list_format_for(12), Some(SubkeyListType::FastLeaf));
        assert_eq!(list_format_for(13), Some(SubkeyListType::HashLeaf));
        assert_eq!(list_format_for(1024), Some(SubkeyListType::HashLeaf));
        assert_eq!(list_format_for(1025), Some(SubkeyListType::IndexRoot));
    }

    #[test]
    fn test_insert_keeps_sort_and_replaces_duplicates() {
        let mut entries = Vec::new();
        insert_entry(&mut entries, entry("Zeta", 0x100));
        insert_entry(&mut entries, entry("alpha", 0x200));
        insert_entry(&mut entries, entry("Mid", 0x300));

        let names: Vec<_> = entries.iter().map(|e| e.name_lower.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);

        // Case-insensitive duplicate replaces in place
        insert_entry(&mut entries, entry("ALPHA", 0x400));
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key_offset, 0x400);
    }

    #[test]
    fn test_find_and_remove() {
        let mut entries = Vec::new();
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            insert_entry(&mut entries, entry(name, i as u32));
        }

        assert_eq!(find_entry(&entries, "c").unwrap().key_offset, 2);
        assert!(find_entry(&entries, "x").is_none());

        assert!(remove_entry(&mut entries, "b"));
        assert!(!remove_entry(&mut entries, "b"));
        assert!(find_entry(&entries, "b").is_none());
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn test_entry_hash_matches_registry_hash() {
        let e = entry("ControlSet001", 0x80);
        assert_eq!(e.hash, registry_hash("controlset001"));
        assert_eq!(e.name_lower, "controlset001");
    }

    #[test]
    fn test_index_root_chunk_cap_matches_read_side() {
        assert_eq!(index_root_chunk_count(1025).unwrap(), 2);
        assert_eq!(index_root_chunk_count(MAX_HASH_LEAF_ENTRIES * 2).unwrap(), 2);

        // The largest fanout the reader accepts still writes
        let max_entries = MAX_HASH_LEAF_ENTRIES * MAX_INDEX_ROOT_SUBLISTS;
        assert_eq!(
            index_root_chunk_count(max_entries).unwrap(),
            MAX_INDEX_ROOT_SUBLISTS
        );

        // One entry past it errors instead of wrapping the u16 count
        let result = index_root_chunk_count(max_entries + 1);
        assert!(matches!(result, Err(RegistryError::SanityLimit { .. })));
    }

    #[test]
    fn test_write_list_shapes() {
        let mut alloc = CellAllocator::new(0);

        let empty = write_list(&mut alloc, &[]).unwrap();
        assert_eq!(empty, INVALID_OFFSET);

        let twelve: Vec<_> = (0..12).map(|i| entry(&format!("k{:02}", i), i)).collect();
        let lf_ref = write_list(&mut alloc, &twelve).unwrap();
        assert_ne!(lf_ref, INVALID_OFFSET);

        let thirteen: Vec<_> = (0..13).map(|i| entry(&format!("k{:02}", i), i)).collect();
        let lh_ref = write_list(&mut alloc, &thirteen).unwrap();
        assert_ne!(lh_ref, lf_ref);
    }
}
