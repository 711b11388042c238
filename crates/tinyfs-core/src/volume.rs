//! Volume: the device with its geometry and allocator
//!
//! `Volume` owns the block device plus the formatted geometry and the
//! free-block allocator, and implements the page-addressed read/write path
//! through a file's index tree. The directory and the public API sit on
//! top of it.
//!
//! Index slots hold block addresses; the values 0 (never written) and 1
//! (tombstoned by a release) are reserved markers. Index blocks are erased
//! on reservation so the markers are trustworthy.

use crate::allocator::BlockAllocator;
use crate::device::BlockDevice;
use crate::error::{Result, TinyFsError};
use crate::file::{FileHandle, SUPERBLOCK_DIR_PAGE};
use crate::geometry::Geometry;
use crate::index;

/// Highest reserved index-slot marker: 0 is a slot that was never
/// written, 1 a slot whose block was released.
pub(crate) const SLOT_DELETED: u32 = 1;

/// Offset of the root-address field inside an embedded directory entry.
const EMBEDDED_ROOT_OFFSET: u16 = 6;

/// Offsets inside a metadata-file directory entry.
pub(crate) const ENTRY_STATUS_OFFSET: u16 = 0;
pub(crate) const ENTRY_EOF_PAGE_OFFSET: u16 = 1;
pub(crate) const ENTRY_EOF_BYTE_OFFSET: u16 = 5;
pub(crate) const ENTRY_ROOT_OFFSET: u16 = 7;
pub(crate) const ENTRY_NAME_OFFSET: u16 = 11;

pub(crate) struct Volume<D> {
    pub device: D,
    pub geo: Geometry,
    pub alloc: BlockAllocator,
}

impl<D: BlockDevice> Volume<D> {
    /// Reserve a data block.
    pub fn reserve_block(&mut self) -> Result<u32> {
        self.alloc.reserve(&self.device, &self.geo)
    }

    /// Reserve an index block and erase it, so its slots read as empty.
    pub fn reserve_index_block(&mut self) -> Result<u32> {
        let addr = self.alloc.reserve(&self.device, &self.geo)?;
        BlockAllocator::erase_block(&self.device, &self.geo, addr)?;
        Ok(addr)
    }

    /// Return a block to the pool.
    pub fn release_at(&mut self, block_addr: u32) -> Result<()> {
        self.alloc.release(&self.device, &self.geo, block_addr)
    }

    /// Read an `address_size`-wide block address.
    pub fn read_address(&self, page: u32, offset: u16) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.device
            .read(page, &mut buf[..self.geo.address_size as usize], offset)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write an `address_size`-wide block address.
    pub fn write_address(&self, page: u32, offset: u16, addr: u32) -> Result<()> {
        let bytes = addr.to_le_bytes();
        self.device
            .write(page, &bytes[..self.geo.address_size as usize], offset)
    }

    /// Tombstone an index slot: deleted marker in the first byte, zeros in
    /// the rest of the address field.
    fn write_tombstone(&self, page: u32, offset: u16) -> Result<()> {
        let mut bytes = [0u8; 4];
        bytes[0] = SLOT_DELETED as u8;
        self.device
            .write(page, &bytes[..self.geo.address_size as usize], offset)
    }

    /// True while the root block doubles as the only child block.
    fn is_degenerate(&self, f: &FileHandle) -> bool {
        f.eof_page < self.geo.single_child_page_limit()
    }

    /// Walk to the child index block covering `page`, updating the cached
    /// path. `grow` decides whether a dead slot is replaced by a fresh
    /// block or reported as [`TinyFsError::UnreleasedBlock`].
    fn locate_child(&mut self, f: &mut FileHandle, page: u32, grow: bool) -> Result<()> {
        let child_idx = index::child_number(&self.geo, page);
        if self.is_degenerate(f)
            || (f.data_block_number >> self.geo.addresses_per_block_exp) == child_idx
        {
            return Ok(());
        }

        let slot = index::root_slot(&self.geo, page);
        if slot.page >= self.geo.block_size as u32 {
            return Err(TinyFsError::FileFull);
        }

        let addr = self.read_address(f.root_index_block + slot.page, slot.byte)?;
        f.child_index_block = if addr > SLOT_DELETED {
            addr
        } else if grow {
            let fresh = self.reserve_index_block()?;
            self.write_address(f.root_index_block + slot.page, slot.byte, fresh)?;
            fresh
        } else {
            return Err(TinyFsError::UnreleasedBlock);
        };
        Ok(())
    }

    /// Resolve the data block covering `page` from the child index block.
    fn locate_data(&mut self, f: &mut FileHandle, page: u32, grow: bool) -> Result<()> {
        let slot = index::child_slot(&self.geo, page);
        let addr = self.read_address(f.child_index_block + slot.page, slot.byte)?;
        f.data_block = if addr > SLOT_DELETED {
            addr
        } else if grow {
            let fresh = self.reserve_block()?;
            self.write_address(f.child_index_block + slot.page, slot.byte, fresh)?;
            fresh
        } else {
            return Err(TinyFsError::UnreleasedBlock);
        };
        Ok(())
    }

    /// Write `data` into logical `page` of the file at `offset`.
    ///
    /// Writes may touch any page up to and including the EOF page, and may
    /// extend the file only contiguously: on the EOF page the write must
    /// start at or before `eof_byte`. When the EOF page fills up the size
    /// wraps to the next page, and the wrap that reaches the single-child
    /// limit promotes the tree: a fresh root is reserved, the old block
    /// becomes the first child, and the directory entry is repointed.
    ///
    /// `dir` is the metadata-entries file for files whose directory entry
    /// lives there; system files pass `None` and update the superblock.
    pub fn write_file(
        &mut self,
        f: &mut FileHandle,
        mut dir: Option<&mut FileHandle>,
        page: u32,
        data: &[u8],
        offset: u16,
    ) -> Result<()> {
        assert!(offset as usize + data.len() <= self.geo.page_size as usize);
        let n = data.len() as u16;
        let mut is_new_page = false;

        if page == f.eof_page {
            if offset > f.eof_byte {
                return Err(TinyFsError::WritePastEnd);
            }
            if offset as u32 + n as u32 > f.eof_byte as u32 {
                if f.eof_byte == 0 {
                    is_new_page = true;
                }
                f.eof_byte = offset + n;
            }
            f.size_consistent = false;

            if f.eof_byte == self.geo.page_size {
                f.eof_byte = 0;
                f.eof_page += 1;

                if f.eof_page == self.geo.single_child_page_limit() {
                    // Promote: the old block becomes child 0 of a new root.
                    let new_root = self.reserve_index_block()?;
                    self.write_address(new_root, 0, f.child_index_block)?;
                    f.root_index_block = new_root;

                    if f.directory_page == SUPERBLOCK_DIR_PAGE {
                        self.device.write(
                            0,
                            &new_root.to_le_bytes(),
                            f.directory_byte + EMBEDDED_ROOT_OFFSET,
                        )?;
                    } else if let Some(meta) = dir.as_deref_mut() {
                        let bytes = new_root.to_le_bytes();
                        let at = f.directory_byte + ENTRY_ROOT_OFFSET;
                        self.write_file(meta, None, f.directory_page, &bytes, at)?;
                    }
                }
            }
        } else if page > f.eof_page {
            return Err(TinyFsError::WritePastEnd);
        }

        let in_cached_block = page == f.current_page_number
            || (page >> self.geo.block_size_exp) == f.data_block_number;

        if !in_cached_block {
            self.locate_child(f, page, true)?;
            self.locate_data(f, page, true)?;
            f.data_block_number = page >> self.geo.block_size_exp;
        }

        self.device.set_dirty_write(is_new_page);
        let written = self.device.write(
            f.data_block + index::page_in_block(&self.geo, page),
            data,
            offset,
        );
        self.device.set_dirty_write(false);
        written?;

        f.current_page_number = page;
        Ok(())
    }

    /// Read from logical `page` of the file at `offset`.
    pub fn read_file(
        &mut self,
        f: &mut FileHandle,
        page: u32,
        buf: &mut [u8],
        offset: u16,
    ) -> Result<()> {
        assert!(offset as usize + buf.len() <= self.geo.page_size as usize);

        if page > f.eof_page
            || (page == f.eof_page && offset as u32 + buf.len() as u32 > f.eof_byte as u32)
        {
            return Err(TinyFsError::Eof);
        }

        let in_cached_block = page == f.current_page_number
            || (page >> self.geo.block_size_exp) == f.data_block_number;

        if !in_cached_block {
            self.locate_child(f, page, false)?;
            self.locate_data(f, page, false)?;
            f.data_block_number = page >> self.geo.block_size_exp;
        }

        self.device.read(
            f.data_block + index::page_in_block(&self.geo, page),
            buf,
            offset,
        )?;

        f.current_page_number = page;
        Ok(())
    }

    /// Release the data block containing logical page `file_page` and
    /// tombstone its child slot. A child whose slots are all dead is itself
    /// released and tombstoned in the root (promoted trees only; a
    /// degenerate tree has no separate child to give back).
    pub fn release_file_block(&mut self, f: &mut FileHandle, file_page: u32) -> Result<()> {
        let block_number = file_page >> self.geo.block_size_exp;
        let child_pos = index::child_slot(&self.geo, file_page);
        let root_pos = index::root_slot(&self.geo, file_page);

        if block_number != f.data_block_number {
            self.locate_child(f, file_page, false)?;
            self.locate_data(f, file_page, false)?;
        }

        self.release_at(f.data_block)?;
        self.write_tombstone(f.child_index_block + child_pos.page, child_pos.byte)?;

        if !self.is_degenerate(f) && self.index_block_is_empty(f.child_index_block)? {
            self.write_tombstone(f.root_index_block + root_pos.page, root_pos.byte)?;
            self.release_at(f.child_index_block)?;
        }

        f.invalidate_cache();
        self.device.flush()?;
        Ok(())
    }

    /// Whether every slot of an index block is empty or tombstoned.
    fn index_block_is_empty(&self, block_addr: u32) -> Result<bool> {
        let mut page_buf = vec![0u8; self.geo.page_size as usize];
        let step = self.geo.address_size as usize;

        for page in block_addr..block_addr + self.geo.block_size as u32 {
            self.device.read(page, &mut page_buf, 0)?;
            for chunk in page_buf.chunks_exact(step) {
                let mut bytes = [0u8; 4];
                bytes[..step].copy_from_slice(chunk);
                if u32::from_le_bytes(bytes) > SLOT_DELETED {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Persist a system file's size into its embedded superblock entry.
    pub fn persist_embedded_eof(&mut self, f: &mut FileHandle) -> Result<()> {
        debug_assert_eq!(f.directory_page, SUPERBLOCK_DIR_PAGE);
        self.device
            .write(0, &f.eof_page.to_le_bytes(), f.directory_byte)?;
        self.device
            .write(0, &f.eof_byte.to_le_bytes(), f.directory_byte + 4)?;
        f.size_consistent = true;
        Ok(())
    }
}
