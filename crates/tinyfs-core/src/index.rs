//! Index tree address mapping
//!
//! A file page is located through a two-level tree: the root index block
//! points at child index blocks, each child points at data blocks. These
//! functions map a logical file page to the slot positions inside those
//! blocks; they are pure arithmetic over the formatted geometry.

use crate::geometry::Geometry;

/// Position of an address slot inside an index block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotPos {
    /// Page within the index block.
    pub page: u32,
    /// Byte offset within that page.
    pub byte: u16,
}

/// Which child index block covers `page`.
pub(crate) fn child_number(geo: &Geometry, page: u32) -> u32 {
    page >> (geo.block_size_exp + geo.addresses_per_block_exp)
}

/// Slot of `page`'s child index block inside the root index block.
pub(crate) fn root_slot(geo: &Geometry, page: u32) -> SlotPos {
    let child = child_number(geo, page);
    SlotPos {
        page: child >> (geo.page_size_exp - geo.address_size_exp),
        byte: ((child << geo.address_size_exp) & (geo.page_size as u32 - 1)) as u16,
    }
}

/// Slot of `page`'s data block inside its child index block.
pub(crate) fn child_slot(geo: &Geometry, page: u32) -> SlotPos {
    let block_in_child = (page >> geo.block_size_exp) & (geo.addresses_per_block - 1);
    SlotPos {
        page: block_in_child >> (geo.page_size_exp - geo.address_size_exp),
        byte: ((block_in_child << geo.address_size_exp) & (geo.page_size as u32 - 1)) as u16,
    }
}

/// Page offset of `page` within its data block.
pub(crate) fn page_in_block(geo: &Geometry, page: u32) -> u32 {
    page & (geo.block_size as u32 - 1)
}
