//! Directory: name to metadata-slot resolution
//!
//! The directory is two parallel system files. The hash-entries file is a
//! packed array of `hash_size`-byte name hashes; the metadata-entries file
//! holds the fixed-size directory entries at matching slot indices. Lookup
//! walks both in lockstep until the hash file ends. There is no chaining:
//! colliding names occupy distinct slots and are told apart by comparing
//! the stored names. A zero hash slot is a deletion tombstone, reusable by
//! the next create; the hash function never produces zero.

use crate::device::BlockDevice;
use crate::error::{Result, TinyFsError};
use crate::file::FileHandle;
use crate::volume::{Volume, ENTRY_NAME_OFFSET, ENTRY_STATUS_OFFSET};

/// Metadata entry was never allocated.
pub(crate) const STATUS_EMPTY: u8 = 0;
/// Metadata entry was allocated and deleted since.
pub(crate) const STATUS_DELETED: u8 = 1;
/// Metadata entry is live.
pub(crate) const STATUS_IN_USE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LookupOp {
    /// Locate an existing entry.
    Find,
    /// Locate an existing entry, or claim a slot for a new one.
    Open,
    /// Locate an existing entry and zero its hash slot.
    Remove,
}

/// Location of a directory entry inside the metadata-entries file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotLocation {
    pub dir_page: u32,
    pub dir_byte: u16,
}

pub(crate) enum Lookup {
    /// Entry exists; for `Remove` its hash slot has been zeroed.
    Found(SlotLocation),
    /// No entry with this name; a hash slot was claimed for it (`Open`).
    Created(SlotLocation),
}

/// DJB2a over the name bytes. Zero is reserved as the tombstone value, so
/// an input hashing to zero maps to one; 2-byte directories fold the hash
/// into the largest 16-bit prime.
pub(crate) fn hash_name(name: &[u8], hash_size: u8) -> u32 {
    let mut hash: u32 = 5381;
    for &byte in name {
        hash = (hash << 5).wrapping_add(hash) ^ u32::from(byte);
    }
    if hash == 0 {
        hash = 1;
    }
    if hash_size == 2 {
        hash % 65521
    } else {
        hash
    }
}

/// Walk the directory for `name`.
///
/// The first slot whose hash and stored name both match wins. For `Open`,
/// a miss claims the first tombstoned slot seen, or extends the hash file
/// at its EOF.
pub(crate) fn lookup<D: BlockDevice>(
    vol: &mut Volume<D>,
    hash_file: &mut FileHandle,
    meta_file: &mut FileHandle,
    name: &[u8],
    op: LookupOp,
) -> Result<Lookup> {
    let hash_size = vol.geo.hash_size as usize;
    let metadata_size = vol.geo.metadata_size;
    let max_name = vol.geo.max_file_name_size as usize;
    let page_size = vol.geo.page_size;

    let wanted = hash_name(name, vol.geo.hash_size);

    let mut tombstone: Option<(u32, u16, SlotLocation)> = None;
    let mut hash_page = 0u32;
    let mut hash_byte = 0u16;
    let mut dir_page = 0u32;
    let mut dir_byte = 0u16;

    loop {
        let mut slot_bytes = [0u8; 4];
        match vol.read_file(hash_file, hash_page, &mut slot_bytes[..hash_size], hash_byte) {
            Ok(()) => {}
            Err(TinyFsError::Eof) => {
                return match op {
                    LookupOp::Find | LookupOp::Remove => Err(TinyFsError::FileNotFound),
                    LookupOp::Open => {
                        let (claim_page, claim_byte, location) =
                            tombstone.unwrap_or((hash_page, hash_byte, SlotLocation {
                                dir_page,
                                dir_byte,
                            }));
                        let bytes = wanted.to_le_bytes();
                        vol.write_file(
                            hash_file,
                            None,
                            claim_page,
                            &bytes[..hash_size],
                            claim_byte,
                        )?;
                        Ok(Lookup::Created(location))
                    }
                };
            }
            Err(e) => return Err(e),
        }
        let slot = u32::from_le_bytes(slot_bytes);

        if slot == wanted {
            let mut status = [0u8; 1];
            vol.read_file(
                meta_file,
                dir_page,
                &mut status,
                dir_byte + ENTRY_STATUS_OFFSET,
            )?;

            if status[0] == STATUS_IN_USE {
                let mut stored = vec![0u8; max_name];
                vol.read_file(meta_file, dir_page, &mut stored, dir_byte + ENTRY_NAME_OFFSET)?;
                let len = stored.iter().position(|&b| b == 0).unwrap_or(max_name);

                if &stored[..len] == name {
                    if op == LookupOp::Remove {
                        let zero = [0u8; 4];
                        vol.write_file(hash_file, None, hash_page, &zero[..hash_size], hash_byte)?;
                    }
                    return Ok(Lookup::Found(SlotLocation { dir_page, dir_byte }));
                }
            }
        } else if slot == 0 && op == LookupOp::Open && tombstone.is_none() {
            tombstone = Some((hash_page, hash_byte, SlotLocation { dir_page, dir_byte }));
        }

        // Entries never straddle a page boundary.
        dir_byte += metadata_size;
        if dir_byte as u32 + metadata_size as u32 > page_size as u32 {
            dir_page += 1;
            dir_byte = 0;
        }

        hash_byte += hash_size as u16;
        if hash_byte >= page_size {
            hash_page += 1;
            hash_byte = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_hashes() {
        assert_eq!(hash_name(b"test.aaa", 4), 3_764_686_876);
        assert_eq!(hash_name(b"file.0", 4), 1_355_706_013);
    }

    #[test]
    fn test_collision_pair() {
        // Distinct names, same DJB2a value; the directory must keep both.
        assert_eq!(hash_name(b"playwright", 4), 195_669_366);
        assert_eq!(hash_name(b"snush", 4), 195_669_366);
    }

    #[test]
    fn test_two_byte_hashes_are_folded() {
        let wide = hash_name(b"test.aaa", 4);
        assert_eq!(hash_name(b"test.aaa", 2), wide % 65521);
        assert!(hash_name(b"test.aaa", 2) < 65521);
    }

    #[test]
    fn test_empty_name_hashes_to_seed() {
        assert_eq!(hash_name(b"", 4), 5381);
    }
}
