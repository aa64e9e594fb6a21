//! Cell emitter and image assembler.
//!
//! Serializes a rebuild tree into cells (NK, VK, value lists, data,
//! big-data) through the bin-aware allocator, then wraps the cell buffer
//! in hbin headers and a checksummed base block.
//!
//! Emission is post-order per node: the NK cell is reserved first (so
//! children know their parent's reference), children are serialized,
//! then values, then the subkey list, and finally the NK's two list
//! references and counts are patched in. Every reference therefore
//! points into already-allocated space.

use crate::allocator::CellAllocator;
use crate::bigdata::BIG_DATA_BLOCK_SIZE;
use crate::cell::{KeyNodeFlags, ValueKeyFlags};
use crate::error::Result;
use crate::hbin::{write_hbin_header, HBIN_HEADER_SIZE};
use crate::header::write_base_block;
use crate::key::{KEY_NODE_FIXED_SIZE, KEY_NODE_MIN_PAYLOAD};
use crate::strings::NameBytes;
use crate::subkey_list::{self, SubkeyEntry};
use crate::transaction::WriteOptions;
use crate::tree::{NodeId, RebuildTree, TreeValue};
use crate::utils::{datetime_to_filetime, INLINE_DATA_BIT, INVALID_OFFSET};
use crate::value::VALUE_KEY_FIXED_SIZE;
use tracing::{debug, instrument};

/// Largest payload stored in a single dedicated data cell; bigger
/// values go through a big-data record.
const MAX_INLINE_CELL_DATA: usize = 4096;

/// Serializes the rebuild tree and assembles the final hive image.
#[instrument(skip_all)]
pub(crate) fn rebuild_image(
    tree: &mut RebuildTree,
    options: &WriteOptions,
    capacity_hint: usize,
) -> Result<Vec<u8>> {
    let timestamp = datetime_to_filetime(
        options.timestamp.unwrap_or_else(chrono::Utc::now),
    );

    let mut alloc = CellAllocator::new(capacity_hint);
    let root_ref = serialize_node(tree, &mut alloc, tree.root(), None, timestamp)?;

    debug!(
        root_ref = %format!("{:#x}", root_ref),
        bins = alloc.bins().len(),
        cell_bytes = alloc.buf().len(),
        "Cell emission complete"
    );

    let image = assemble_image(&alloc, root_ref, timestamp);
    alloc.release();
    Ok(image)
}

/// Serializes one node and its subtree. Returns the node's
/// hive-relative NK reference.
///
/// The parent's NK cell is always reserved before its children are
/// serialized, so the parent back-reference resolves through the
/// parent's recorded cell-buffer offset.
fn serialize_node(
    tree: &mut RebuildTree,
    alloc: &mut CellAllocator,
    id: NodeId,
    parent: Option<NodeId>,
    now: u64,
) -> Result<u32> {
    tree.ensure_materialized(id)?;

    let parent_ref = match parent {
        Some(p) => alloc.to_hive_ref(
            tree.node(p)
                .cell_offset
                .expect("parent NK reserved before children"),
        ),
        None => INVALID_OFFSET,
    };

    // Reserve the NK cell first so children can reference their parent.
    let node = tree.node(id);
    let name = name_bytes_for(node.name_raw.as_deref(), node.compressed, &node.name);
    let last_written = if node.last_written != 0 {
        node.last_written
    } else {
        now
    };

    let payload_len = (KEY_NODE_FIXED_SIZE + name.len()).max(KEY_NODE_MIN_PAYLOAD);
    let cell = alloc.alloc(payload_len)?;
    let nk_ref = alloc.to_hive_ref(cell);
    tree.node_mut(id).cell_offset = Some(cell);

    let mut flags = 0u16;
    if name.is_compressed() {
        flags |= KeyNodeFlags::COMP_NAME;
    }
    if parent.is_none() {
        flags |= KeyNodeFlags::ROOT_KEY | KeyNodeFlags::NO_DELETE;
    }

    {
        let payload = alloc.payload_mut(cell);
        payload[0..2].copy_from_slice(b"nk");
        payload[0x02..0x04].copy_from_slice(&flags.to_le_bytes());
        payload[0x04..0x0C].copy_from_slice(&last_written.to_le_bytes());
        // access bits stay zero
        payload[0x10..0x14].copy_from_slice(&parent_ref.to_le_bytes());
        // subkey counts and list refs patched after the post-order pass
        payload[0x20..0x24].copy_from_slice(&INVALID_OFFSET.to_le_bytes());
        payload[0x2C..0x30].copy_from_slice(&INVALID_OFFSET.to_le_bytes());
        payload[0x30..0x34].copy_from_slice(&INVALID_OFFSET.to_le_bytes());
        // max-length hints and the work var stay zero
        payload[0x48..0x4A].copy_from_slice(&(name.len() as u16).to_le_bytes());
        payload[0x4C..0x4C + name.len()].copy_from_slice(name.as_bytes());
    }

    // Children first: their offsets feed the subkey list.
    let child_ids: Vec<NodeId> = tree
        .node(id)
        .children
        .clone()
        .expect("node materialized above");

    let mut entries = Vec::with_capacity(child_ids.len());
    for child_id in child_ids {
        let child_ref = serialize_node(tree, alloc, child_id, Some(id), now)?;
        let child = tree.node(child_id);
        entries.push(SubkeyEntry::new(&child.name, child_ref));
    }

    // Values: each VK cell, then the list of their references.
    let value_count;
    let value_list_ref;
    {
        let values = tree.node(id).values.as_ref().expect("node materialized above");
        value_count = values.len() as u32;
        let mut vk_refs = Vec::with_capacity(values.len());
        for value in values {
            vk_refs.push(write_value_key(alloc, value)?);
        }

        value_list_ref = if vk_refs.is_empty() {
            INVALID_OFFSET
        } else {
            let list_cell = alloc.alloc(vk_refs.len() * 4)?;
            let payload = alloc.payload_mut(list_cell);
            for (i, vk_ref) in vk_refs.iter().enumerate() {
                payload[i * 4..i * 4 + 4].copy_from_slice(&vk_ref.to_le_bytes());
            }
            alloc.to_hive_ref(list_cell)
        };
    }

    let subkey_count = entries.len() as u32;
    let subkey_list_ref = subkey_list::write_list(alloc, &entries)?;

    // Patch the two list references and counts into the reserved NK.
    let payload = alloc.payload_mut(cell);
    payload[0x14..0x18].copy_from_slice(&subkey_count.to_le_bytes());
    payload[0x1C..0x20].copy_from_slice(&subkey_list_ref.to_le_bytes());
    payload[0x24..0x28].copy_from_slice(&value_count.to_le_bytes());
    payload[0x28..0x2C].copy_from_slice(&value_list_ref.to_le_bytes());

    Ok(nk_ref)
}

/// Encodes a name, reusing inherited on-disk bytes when available.
fn name_bytes_for(raw: Option<&[u8]>, compressed: bool, name: &str) -> NameBytes {
    match raw {
        Some(bytes) => NameBytes::from_raw(bytes.to_vec(), compressed),
        None => NameBytes::encode(name),
    }
}

/// Writes one value: its data cell(s) as needed, then the VK cell.
/// Returns the VK's hive-relative reference.
fn write_value_key(alloc: &mut CellAllocator, value: &TreeValue) -> Result<u32> {
    let name = name_bytes_for(value.name_raw.as_deref(), value.compressed, &value.name);
    let data_len = value.data.len();

    // Data placement: inline in the offset field, one data cell, or a
    // big-data record with blocklist and block cells.
    let (length_field, offset_field) = if data_len <= 4 {
        let mut inline = [0u8; 4];
        inline[..data_len].copy_from_slice(&value.data);
        (data_len as u32 | INLINE_DATA_BIT, inline)
    } else if data_len <= MAX_INLINE_CELL_DATA {
        let data_cell = alloc.alloc(data_len)?;
        alloc.payload_mut(data_cell)[..data_len].copy_from_slice(&value.data);
        (data_len as u32, alloc.to_hive_ref(data_cell).to_le_bytes())
    } else {
        let db_ref = write_big_data(alloc, &value.data)?;
        (data_len as u32, db_ref.to_le_bytes())
    };

    let flags: u16 = if name.is_compressed() {
        ValueKeyFlags::COMP_NAME
    } else {
        0
    };

    let vk_cell = alloc.alloc(VALUE_KEY_FIXED_SIZE + name.len())?;
    let payload = alloc.payload_mut(vk_cell);
    payload[0..2].copy_from_slice(b"vk");
    payload[0x02..0x04].copy_from_slice(&(name.len() as u16).to_le_bytes());
    payload[0x04..0x08].copy_from_slice(&length_field.to_le_bytes());
    payload[0x08..0x0C].copy_from_slice(&offset_field);
    payload[0x0C..0x10].copy_from_slice(&value.value_type.to_u32().to_le_bytes());
    payload[0x10..0x12].copy_from_slice(&flags.to_le_bytes());
    // 2-byte spare stays zero
    payload[0x14..0x14 + name.len()].copy_from_slice(name.as_bytes());

    Ok(alloc.to_hive_ref(vk_cell))
}

/// Writes the three-level big-data structure: block cells, a blocklist
/// cell referencing them, and the db record cell. Returns the db cell's
/// hive-relative reference.
fn write_big_data(alloc: &mut CellAllocator, data: &[u8]) -> Result<u32> {
    let mut block_refs = Vec::with_capacity(crate::bigdata::BigDataBlock::blocks_for(data.len()));
    for chunk in data.chunks(BIG_DATA_BLOCK_SIZE) {
        let block_cell = alloc.alloc(chunk.len())?;
        alloc.payload_mut(block_cell)[..chunk.len()].copy_from_slice(chunk);
        block_refs.push(alloc.to_hive_ref(block_cell));
    }

    let list_cell = alloc.alloc(block_refs.len() * 4)?;
    let payload = alloc.payload_mut(list_cell);
    for (i, block_ref) in block_refs.iter().enumerate() {
        payload[i * 4..i * 4 + 4].copy_from_slice(&block_ref.to_le_bytes());
    }
    let list_ref = alloc.to_hive_ref(list_cell);

    let db_cell = alloc.alloc(12)?;
    let payload = alloc.payload_mut(db_cell);
    payload[0..2].copy_from_slice(b"db");
    payload[0x02..0x04].copy_from_slice(&(block_refs.len() as u16).to_le_bytes());
    payload[0x04..0x08].copy_from_slice(&list_ref.to_le_bytes());

    Ok(alloc.to_hive_ref(db_cell))
}

/// Wraps the cell buffer into bins and prepends the base block.
fn assemble_image(alloc: &CellAllocator, root_ref: u32, timestamp: u64) -> Vec<u8> {
    let total_bins = alloc.total_bins_size();
    let mut image = write_base_block(root_ref, total_bins, timestamp);
    image.reserve(total_bins as usize);

    let buf = alloc.buf();
    for bin in alloc.bins() {
        let mut header = [0u8; HBIN_HEADER_SIZE];
        write_hbin_header(&mut header, bin.file_start, bin.size);
        image.extend_from_slice(&header);

        let region_end = (bin.buf_start + bin.capacity()).min(buf.len());
        let cells = &buf[bin.buf_start..region_end];
        image.extend_from_slice(cells);

        // Unused tail of the final bin becomes one free cell
        let tail = bin.capacity() - cells.len();
        if tail >= 4 {
            image.extend_from_slice(&(tail as i32).to_le_bytes());
            image.resize(image.len() + tail - 4, 0);
        } else if tail > 0 {
            image.resize(image.len() + tail, 0);
        }
    }

    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::ValueType;

    fn owned_value(name: &str, value_type: ValueType, data: Vec<u8>) -> TreeValue {
        TreeValue {
            name: name.to_string(),
            name_lower: name.to_lowercase(),
            name_raw: None,
            compressed: true,
            value_type,
            data,
        }
    }

    #[test]
    fn test_inline_value_sets_high_bit() {
        let mut alloc = CellAllocator::new(0);
        let value = owned_value("v", ValueType::Dword, vec![0x78, 0x56, 0x34, 0x12]);
        let vk_ref = write_value_key(&mut alloc, &value).unwrap();

        // Resolve the VK payload back out of the buffer.
        let buf_off = (vk_ref - 32) as usize;
        let payload = &alloc.buf()[buf_off + 4..];
        assert_eq!(&payload[0..2], b"vk");
        let length_field = u32::from_le_bytes(payload[0x04..0x08].try_into().unwrap());
        assert_eq!(length_field, 4 | INLINE_DATA_BIT);
        assert_eq!(&payload[0x08..0x0C], &[0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_external_value_allocates_data_cell() {
        let mut alloc = CellAllocator::new(0);
        let data = vec![0xAAu8; 100];
        let value = owned_value("v", ValueType::Binary, data);
        write_value_key(&mut alloc, &value).unwrap();

        // Two cells: the data cell then the VK cell. The 100-byte
        // payload plus the 4-byte header rounds to 104 total.
        assert_eq!(alloc.cell_size(0), 104);
    }

    #[test]
    fn test_big_data_block_layout() {
        let mut alloc = CellAllocator::new(0);
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
        let db_ref = write_big_data(&mut alloc, &data).unwrap();

        // Find the db cell and check its block count.
        let bins = alloc.bins();
        assert!(!bins.is_empty());
        let db_buf_off = resolve_ref(&alloc, db_ref);
        let payload = &alloc.buf()[db_buf_off + 4..];
        assert_eq!(&payload[0..2], b"db");
        let count = u16::from_le_bytes(payload[2..4].try_into().unwrap());
        assert_eq!(count as usize, crate::bigdata::BigDataBlock::blocks_for(20_000));
    }

    fn resolve_ref(alloc: &CellAllocator, hive_ref: u32) -> usize {
        for bin in alloc.bins() {
            let start = bin.file_start + 32;
            let end = bin.file_start + bin.size;
            if hive_ref >= start && hive_ref < end {
                return bin.buf_start + (hive_ref - start) as usize;
            }
        }
        panic!("reference {:#x} outside every bin", hive_ref);
    }
}
