//! Formatted geometry and derived constants
//!
//! Every size in the format is a power of two, so the hot paths work on
//! exponents (shift and mask) rather than multiply and divide. `Geometry`
//! holds the formatted parameters plus the derived exponents.

use crate::error::{Result, TinyFsError};

/// Fixed prefix of a metadata entry before the file name:
/// status byte, `eof_page: u32`, `eof_byte: u16`, `root_index_block: u32`.
pub const ENTRY_STATIC_SIZE: u16 = 11;

/// Parameters for formatting a device.
#[derive(Debug, Clone)]
pub struct FormatParams {
    /// Number of physical pages on the device.
    pub num_pages: u32,
    /// Page size in bytes. Power of two, 64..=32768.
    pub page_size: u16,
    /// Block size in pages. Power of two.
    pub block_size: u16,
    /// Directory hash width in bytes, 2 or 4.
    pub hash_size: u8,
    /// Size of one directory metadata entry, name included.
    pub metadata_size: u16,
    /// Fixed maximum file name length.
    pub max_file_name_size: u16,
    /// Erase the whole device before formatting.
    pub erase_first: bool,
}

impl Default for FormatParams {
    fn default() -> Self {
        FormatParams {
            num_pages: 0,
            page_size: 512,
            block_size: 8,
            hash_size: 4,
            metadata_size: 32,
            max_file_name_size: 12,
            erase_first: false,
        }
    }
}

/// Loaded geometry of a formatted device.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub num_pages: u32,
    pub page_size: u16,
    pub block_size: u16,
    pub address_size: u8,
    pub page_size_exp: u8,
    pub block_size_exp: u8,
    pub address_size_exp: u8,
    pub addresses_per_block: u32,
    pub addresses_per_block_exp: u8,
    pub hash_size: u8,
    pub metadata_size: u16,
    pub max_file_name_size: u16,
    /// Size of the free-block state bitmap, in pages.
    pub state_section_size: u32,
}

fn exponent_of(value: u32) -> u8 {
    value.trailing_zeros() as u8
}

impl Geometry {
    /// Derive and validate geometry from format parameters.
    pub fn from_params(params: &FormatParams) -> Result<Geometry> {
        let page_size = params.page_size;
        let block_size = params.block_size;

        if !page_size.is_power_of_two() || !(64..=32768).contains(&page_size) {
            return Err(TinyFsError::InvalidPageSize(page_size));
        }
        if !block_size.is_power_of_two() || block_size > 32768 {
            return Err(TinyFsError::InvalidBlockSize(block_size));
        }
        if params.hash_size != 2 && params.hash_size != 4 {
            return Err(TinyFsError::InvalidHashSize(params.hash_size));
        }
        if params.metadata_size < params.max_file_name_size + ENTRY_STATIC_SIZE
            || params.metadata_size > page_size
        {
            return Err(TinyFsError::InvalidMetadataSize(params.metadata_size));
        }

        // 2-byte addresses suffice while every page fits in a u16.
        let address_size: u8 = if params.num_pages < 1 << 16 { 2 } else { 4 };

        let page_size_exp = exponent_of(page_size as u32);
        let block_size_exp = exponent_of(block_size as u32);
        let address_size_exp = exponent_of(address_size as u32);

        let addresses_per_block =
            ((page_size as u32) << block_size_exp) >> address_size_exp;

        let state_section_bytes =
            (params.num_pages.saturating_sub(1)) >> (block_size_exp + 3);
        let state_section_size = if state_section_bytes == 0 {
            0
        } else {
            ((state_section_bytes - 1) >> page_size_exp) + 1
        };

        let geo = Geometry {
            num_pages: params.num_pages,
            page_size,
            block_size,
            address_size,
            page_size_exp,
            block_size_exp,
            address_size_exp,
            addresses_per_block,
            addresses_per_block_exp: exponent_of(addresses_per_block),
            hash_size: params.hash_size,
            metadata_size: params.metadata_size,
            max_file_name_size: params.max_file_name_size,
            state_section_size,
        };

        // Info page, state section and the four system blocks must fit.
        let minimum = geo.block_address(4) + block_size as u32;
        if params.num_pages < minimum {
            return Err(TinyFsError::DeviceTooSmall(params.num_pages));
        }

        Ok(geo)
    }

    /// First page covered by the block allocator: everything after the info
    /// page and the state section.
    pub fn first_block_page(&self) -> u32 {
        1 + self.state_section_size
    }

    /// Device page address of allocatable block `n`.
    pub fn block_address(&self, n: u32) -> u32 {
        (n << self.block_size_exp) + self.first_block_page()
    }

    /// Number of file pages a single child index block can map: one
    /// data-block address per slot, `block_size` pages per data block.
    /// Below this EOF the root block doubles as the child block
    /// (degenerate tree); the wrap that reaches it promotes the tree.
    pub fn single_child_page_limit(&self) -> u32 {
        self.addresses_per_block << self.block_size_exp
    }

    /// Valid bytes in the state bitmap (trailing bytes of the last state
    /// page are dead).
    pub fn state_section_bytes(&self) -> u32 {
        (self.num_pages.saturating_sub(1)) >> (self.block_size_exp + 3)
    }
}
