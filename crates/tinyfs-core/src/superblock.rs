//! Superblock (info page)
//!
//! The first device page holds the formatted parameters plus the embedded
//! directory entries of the two system files. All integers little-endian,
//! packed at byte 0:
//!
//! ```text
//! 0..4    magic, four 0xFC bytes
//! 4..8    number of pages          u32
//! 8       page size exponent      u8
//! 9       block size exponent     u8
//! 10      address size exponent   u8
//! 11      hash size               u8
//! 12..14  metadata entry size     u16
//! 14..16  max file name size      u16
//! 16..20  state section pages     u32
//! 20..30  hash-entries file       { eof_page u32, eof_byte u16, root u32 }
//! 30..40  metadata-entries file   { eof_page u32, eof_byte u16, root u32 }
//! ```

use crate::error::{Result, TinyFsError};
use crate::geometry::Geometry;

pub(crate) const MAGIC_BYTE: u8 = 0xFC;
pub(crate) const MAGIC_LEN: usize = 4;

/// Serialized size of the superblock prefix.
pub(crate) const SUPERBLOCK_SIZE: usize = 40;

/// Info-page offset of the hash-entries embedded directory entry.
pub(crate) const HASH_ENTRY_OFFSET: u16 = 20;
/// Info-page offset of the metadata-entries embedded directory entry.
pub(crate) const META_ENTRY_OFFSET: u16 = 30;

/// Directory entry embedded in the info page for a system file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct EmbeddedEntry {
    pub eof_page: u32,
    pub eof_byte: u16,
    pub root_index_block: u32,
}

impl EmbeddedEntry {
    fn to_bytes(self) -> [u8; 10] {
        let mut bytes = [0u8; 10];
        bytes[0..4].copy_from_slice(&self.eof_page.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.eof_byte.to_le_bytes());
        bytes[6..10].copy_from_slice(&self.root_index_block.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        EmbeddedEntry {
            eof_page: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            eof_byte: u16::from_le_bytes([bytes[4], bytes[5]]),
            root_index_block: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Superblock {
    pub num_pages: u32,
    pub page_size_exp: u8,
    pub block_size_exp: u8,
    pub address_size_exp: u8,
    pub hash_size: u8,
    pub metadata_size: u16,
    pub max_file_name_size: u16,
    pub state_section_size: u32,
    pub hash_entries: EmbeddedEntry,
    pub metadata_entries: EmbeddedEntry,
}

impl Superblock {
    /// Superblock for a freshly formatted device: both system files empty,
    /// roots at the given block addresses.
    pub fn new(geo: &Geometry, hash_root: u32, metadata_root: u32) -> Self {
        Superblock {
            num_pages: geo.num_pages,
            page_size_exp: geo.page_size_exp,
            block_size_exp: geo.block_size_exp,
            address_size_exp: geo.address_size_exp,
            hash_size: geo.hash_size,
            metadata_size: geo.metadata_size,
            max_file_name_size: geo.max_file_name_size,
            state_section_size: geo.state_section_size,
            hash_entries: EmbeddedEntry {
                root_index_block: hash_root,
                ..EmbeddedEntry::default()
            },
            metadata_entries: EmbeddedEntry {
                root_index_block: metadata_root,
                ..EmbeddedEntry::default()
            },
        }
    }

    /// Serialize into the first `SUPERBLOCK_SIZE` bytes of the info page.
    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut bytes = [0u8; SUPERBLOCK_SIZE];

        bytes[0..MAGIC_LEN].fill(MAGIC_BYTE);
        bytes[4..8].copy_from_slice(&self.num_pages.to_le_bytes());
        bytes[8] = self.page_size_exp;
        bytes[9] = self.block_size_exp;
        bytes[10] = self.address_size_exp;
        bytes[11] = self.hash_size;
        bytes[12..14].copy_from_slice(&self.metadata_size.to_le_bytes());
        bytes[14..16].copy_from_slice(&self.max_file_name_size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.state_section_size.to_le_bytes());
        bytes[20..30].copy_from_slice(&self.hash_entries.to_bytes());
        bytes[30..40].copy_from_slice(&self.metadata_entries.to_bytes());

        bytes
    }

    /// Parse the info page. `NotFormatted` if the magic does not match.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SUPERBLOCK_SIZE {
            return Err(TinyFsError::NotFormatted);
        }
        if bytes[0..MAGIC_LEN].iter().any(|&b| b != MAGIC_BYTE) {
            return Err(TinyFsError::NotFormatted);
        }

        Ok(Superblock {
            num_pages: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            page_size_exp: bytes[8],
            block_size_exp: bytes[9],
            address_size_exp: bytes[10],
            hash_size: bytes[11],
            metadata_size: u16::from_le_bytes([bytes[12], bytes[13]]),
            max_file_name_size: u16::from_le_bytes([bytes[14], bytes[15]]),
            state_section_size: u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
            hash_entries: EmbeddedEntry::from_bytes(&bytes[20..30]),
            metadata_entries: EmbeddedEntry::from_bytes(&bytes[30..40]),
        })
    }

    /// Rebuild the derived geometry from the stored exponents.
    pub fn geometry(&self) -> Geometry {
        let page_size = 1u16 << self.page_size_exp;
        let block_size = 1u16 << self.block_size_exp;
        let address_size = 1u8 << self.address_size_exp;
        let addresses_per_block =
            ((page_size as u32) << self.block_size_exp) >> self.address_size_exp;

        Geometry {
            num_pages: self.num_pages,
            page_size,
            block_size,
            address_size,
            page_size_exp: self.page_size_exp,
            block_size_exp: self.block_size_exp,
            address_size_exp: self.address_size_exp,
            addresses_per_block,
            addresses_per_block_exp: addresses_per_block.trailing_zeros() as u8,
            hash_size: self.hash_size,
            metadata_size: self.metadata_size,
            max_file_name_size: self.max_file_name_size,
            state_section_size: self.state_section_size,
        }
    }
}
