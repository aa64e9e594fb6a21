//! Image-level invariants of rebuilt hives: checksum, bin geometry,
//! cell alignment, and free-tail accounting.

use reg_forge::hbin::{HbinCellIterator, HBIN_HEADER_SIZE};
use reg_forge::utils::calculate_checksum;
use reg_forge::{Hive, MemorySink, Transaction, ValueType, WriteOptions};

fn build_busy_image() -> Vec<u8> {
    let mut tx = Transaction::begin(None);
    for i in 0..40 {
        let path = format!("Software\\Vendor\\App{:02}", i);
        tx.create_key(&path, true).unwrap();
        tx.set_value(&path, "index", ValueType::Dword, &(i as u32).to_le_bytes())
            .unwrap();
        tx.set_value(&path, "payload", ValueType::Binary, &vec![i as u8; 600])
            .unwrap();
    }
    // One big-data value to force a multi-bin layout
    let blob: Vec<u8> = (0..30_000u32).map(|i| (i % 251) as u8).collect();
    tx.set_value("Software\\Vendor", "blob", ValueType::Binary, &blob)
        .unwrap();

    let mut sink = MemorySink::new();
    tx.commit(&mut sink, &WriteOptions::default()).unwrap();
    sink.into_bytes()
}

#[test]
fn stored_checksum_matches_recomputation() {
    let image = build_busy_image();
    let stored = u32::from_le_bytes(image[0x1FC..0x200].try_into().unwrap());
    assert_eq!(stored, calculate_checksum(&image));
}

#[test]
fn bins_are_4k_multiples_and_cover_the_image() {
    let image = build_busy_image();
    let hive = Hive::from_vec(image).unwrap();

    let mut total = 0u32;
    for header in hive.hbins() {
        let header = header.unwrap();
        assert_eq!(header.size % 4096, 0, "bin size must be a 4 KiB multiple");
        assert_eq!(header.offset, total, "bins must be contiguous");
        total += header.size;
    }

    assert_eq!(total, hive.base_block().hive_length);
    assert_eq!(total as usize + 4096, hive.as_bytes().len());
}

#[test]
fn every_cell_lies_within_one_bin() {
    let image = build_busy_image();
    let hive = Hive::from_vec(image).unwrap();
    let bytes = hive.as_bytes();

    let mut allocated = 0usize;
    let mut free = 0usize;
    for header in hive.hbins() {
        let header = header.unwrap();
        let bin_start = 0x1000 + header.offset as usize;
        let data =
            &bytes[bin_start + HBIN_HEADER_SIZE..bin_start + header.size as usize];

        let mut covered = 0usize;
        for cell in HbinCellIterator::new(data, header.offset) {
            let cell = cell.unwrap();
            assert_eq!(cell.size % 8, 0, "cell sizes are multiples of 8");
            covered += cell.size as usize;
            if cell.is_allocated {
                allocated += 1;
            } else {
                free += 1;
            }
        }

        // The cell walk exactly tiles the bin's data area: no cell
        // crosses out of the bin and no gap is left behind.
        assert_eq!(covered, data.len());
    }

    assert!(allocated > 40, "busy image should carry many cells");
    // Only bin tails are free; never more than one per bin
    assert!(free <= hive.hbins().count());
}

#[test]
fn rebuilt_image_reopens_and_resolves_offsets() {
    let image = build_busy_image();
    let hive = Hive::from_vec(image).unwrap();

    let vendor = hive.find("Software\\Vendor").unwrap();
    assert_eq!(vendor.subkey_count(), 40);
    assert_eq!(
        vendor.value("blob").unwrap().raw_data().unwrap().len(),
        30_000
    );

    for (i, app) in vendor.subkeys().unwrap().iter().enumerate() {
        assert_eq!(app.name(), format!("App{:02}", i));
        assert_eq!(app.value_count(), 2);
        assert_eq!(
            app.value("payload").unwrap().raw_data().unwrap(),
            vec![i as u8; 600]
        );
    }
}

#[test]
fn identity_rebuild_preserves_structure() {
    let first = build_busy_image();
    let base = Hive::from_vec(first).unwrap();

    // Commit with no staged edits: the whole base streams through the
    // lazy tree untouched.
    let mut tx = Transaction::begin(Some(&base));
    let mut sink = MemorySink::new();
    tx.commit(&mut sink, &WriteOptions::default()).unwrap();

    let second = Hive::from_vec(sink.into_bytes()).unwrap();
    assert_eq!(snapshot(&base), snapshot(&second));
}

/// Structural digest of a hive: names, types, and bytes, tree-ordered.
fn snapshot(hive: &Hive) -> Vec<String> {
    let mut out = Vec::new();
    let root = hive.root_key().unwrap();
    walk(&root, String::new(), &mut out);
    out
}

fn walk(key: &reg_forge::RegistryKey, path: String, out: &mut Vec<String>) {
    for value in key.values().unwrap() {
        out.push(format!(
            "{}!{}={:?}:{:02x?}",
            path,
            value.name(),
            value.value_type(),
            value.raw_data().unwrap()
        ));
    }
    for child in key.subkeys().unwrap() {
        let child_path = format!("{}\\{}", path, child.name());
        out.push(child_path.clone());
        walk(&child, child_path, out);
    }
}
