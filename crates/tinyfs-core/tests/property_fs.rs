//! Property-based tests for the file system invariants
//!
//! Uses proptest to verify that round-trips, directory bookkeeping and
//! allocator accounting hold across many random operation sequences.

use proptest::prelude::*;
use std::collections::HashSet;
use tinyfs::{BlockDevice, FormatParams, MemDevice, TinyFs, TinyFsError};

const STATUS_IN_USE: u8 = 2;

fn new_fs() -> TinyFs<MemDevice> {
    let params = FormatParams {
        num_pages: 2000,
        page_size: 512,
        block_size: 8,
        hash_size: 4,
        metadata_size: 32,
        max_file_name_size: 12,
        erase_first: true,
    };
    TinyFs::format(MemDevice::new(2000, 512), &params).unwrap()
}

fn used_block_bits(fs: &TinyFs<MemDevice>) -> u32 {
    let geo = fs.geometry();
    let valid = geo.state_section_bytes() as usize;
    let mut buf = vec![0u8; geo.page_size as usize];
    fs.device().read(1, &mut buf, 0).unwrap();
    buf[..valid].iter().map(|b| b.count_zeros()).sum()
}

proptest! {
    #[test]
    fn prop_sequential_write_read_round_trip(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..512), 1..40)
    ) {
        let mut fs = new_fs();
        let mut file = fs.open("stream.bin").unwrap();

        // Pack the chunks back to back, splitting at page boundaries; the
        // write position always equals the current EOF.
        let mut positions = Vec::new();
        let mut page = 0u32;
        let mut byte = 0u16;
        for chunk in &chunks {
            let mut rest = &chunk[..];
            while !rest.is_empty() {
                let space = (512 - byte) as usize;
                let n = rest.len().min(space);
                fs.write(&mut file, page, &rest[..n], byte).unwrap();
                positions.push((page, byte, rest[..n].to_vec()));

                // EOF monotonicity after every write.
                prop_assert!(
                    (file.eof_page(), file.eof_byte()) >= (page, byte),
                    "EOF moved backwards"
                );

                byte += n as u16;
                if byte == 512 {
                    byte = 0;
                    page += 1;
                }
                rest = &rest[n..];
            }
        }

        for (page, byte, expected) in &positions {
            let mut buf = vec![0u8; expected.len()];
            fs.read(&mut file, *page, &mut buf, *byte).unwrap();
            prop_assert_eq!(&buf, expected);
        }

        fs.close(file).unwrap();
    }

    #[test]
    fn prop_directory_tracks_live_files(
        ops in prop::collection::vec((0usize..8, any::<bool>()), 1..60)
    ) {
        let mut fs = new_fs();
        let names: Vec<String> = (0..8).map(|i| format!("file.{}", i)).collect();
        let mut live: HashSet<usize> = HashSet::new();

        for (idx, create) in ops {
            if create {
                let file = fs.open(&names[idx]).unwrap();
                fs.close(file).unwrap();
                live.insert(idx);
            } else {
                match fs.remove(&names[idx]) {
                    Ok(()) => {
                        prop_assert!(live.remove(&idx), "removed a file that never existed");
                    }
                    Err(TinyFsError::FileNotFound) => {
                        prop_assert!(!live.contains(&idx));
                    }
                    Err(e) => prop_assert!(false, "unexpected error: {:?}", e),
                }
            }
        }

        for (idx, name) in names.iter().enumerate() {
            prop_assert_eq!(fs.exists(name).unwrap(), live.contains(&idx));
        }
    }

    #[test]
    fn prop_directory_injectivity_and_hash_tombstones(
        ops in prop::collection::vec((0usize..8, any::<bool>()), 1..60)
    ) {
        let mut fs = new_fs();
        let names: Vec<String> = (0..8).map(|i| format!("file.{}", i)).collect();

        for (idx, create) in ops {
            if create {
                let file = fs.open(&names[idx]).unwrap();
                fs.close(file).unwrap();
            } else {
                let _ = fs.remove(&names[idx]);
            }
        }

        // With a pool of 8 names and tombstone reuse, every slot stays on
        // the first page of the hash and metadata files.
        let geo = fs.geometry();
        let hash_page = geo.block_address(1);
        let entry_page = geo.block_address(3);

        let mut hashes = [0u8; 512];
        let mut entries = [0u8; 512];
        fs.device().read(hash_page, &mut hashes, 0).unwrap();
        fs.device().read(entry_page, &mut entries, 0).unwrap();

        let mut seen_names = HashSet::new();
        for slot in 0..16 {
            let h = u32::from_le_bytes(
                hashes[slot * 4..slot * 4 + 4].try_into().unwrap(),
            );
            let entry = &entries[slot * 32..(slot + 1) * 32];
            let status = entry[0];

            if status == STATUS_IN_USE {
                // A live entry has a live hash, and its name is unique.
                prop_assert_ne!(h, 0);
                let name = &entry[11..23];
                let end = name.iter().position(|&b| b == 0).unwrap_or(12);
                prop_assert!(
                    seen_names.insert(name[..end].to_vec()),
                    "duplicate live name"
                );
            } else {
                // Deleted and never-used entries carry a zero hash slot.
                prop_assert_eq!(h, 0);
            }
        }
    }

    #[test]
    fn prop_allocator_accounting(
        ops in prop::collection::vec((0usize..8, any::<bool>()), 1..60)
    ) {
        let mut fs = new_fs();
        let names: Vec<String> = (0..8).map(|i| format!("file.{}", i)).collect();
        let mut live: HashSet<usize> = HashSet::new();

        for (idx, create) in ops {
            if create {
                let file = fs.open(&names[idx]).unwrap();
                fs.close(file).unwrap();
                live.insert(idx);
            } else if fs.remove(&names[idx]).is_ok() {
                live.remove(&idx);
            }
        }

        // Four system blocks, plus a root and a data block per live
        // (empty) file; nothing else may hold a block.
        prop_assert_eq!(used_block_bits(&fs), 4 + 2 * live.len() as u32);
    }

    #[test]
    fn prop_data_survives_remount(
        payload in prop::collection::vec(any::<u8>(), 1..2000)
    ) {
        let mut fs = new_fs();
        let mut file = fs.open("keep.bin").unwrap();

        let mut page = 0u32;
        for chunk in payload.chunks(512) {
            fs.write(&mut file, page, chunk, 0).unwrap();
            page += 1;
        }
        fs.close(file).unwrap();

        let device = fs.unmount().unwrap();
        let mut fs = TinyFs::mount(device).unwrap();
        let mut file = fs.open("keep.bin").unwrap();

        for (i, chunk) in payload.chunks(512).enumerate() {
            let mut buf = vec![0u8; chunk.len()];
            fs.read(&mut file, i as u32, &mut buf, 0).unwrap();
            prop_assert_eq!(&buf, chunk);
        }
    }
}
