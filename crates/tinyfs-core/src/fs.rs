//! File system façade
//!
//! `TinyFs` owns the volume and the two system-file handles and exposes the
//! public operations: format, mount, open, exists, remove, read, write,
//! flush, close, release_block.

use crate::allocator::BlockAllocator;
use crate::device::BlockDevice;
use crate::directory::{self, Lookup, LookupOp, STATUS_DELETED, STATUS_EMPTY, STATUS_IN_USE};
use crate::error::{Result, TinyFsError};
use crate::file::{FileHandle, SUPERBLOCK_DIR_PAGE};
use crate::geometry::{FormatParams, Geometry};
use crate::index;
use crate::superblock::{
    EmbeddedEntry, Superblock, HASH_ENTRY_OFFSET, META_ENTRY_OFFSET, SUPERBLOCK_SIZE,
};
use crate::volume::{
    Volume, ENTRY_EOF_BYTE_OFFSET, ENTRY_EOF_PAGE_OFFSET, ENTRY_NAME_OFFSET, ENTRY_ROOT_OFFSET,
    ENTRY_STATUS_OFFSET, SLOT_DELETED,
};

/// A mounted file system.
///
/// All state lives here: the superblock-derived geometry, the free-block
/// cursor, and the handles of the two system files. Every operation takes
/// `&mut self`; callers wanting to share a `TinyFs` across threads must
/// serialize at the boundary.
pub struct TinyFs<D> {
    vol: Volume<D>,
    hash_entries: FileHandle,
    metadata: FileHandle,
}

impl<D: BlockDevice> TinyFs<D> {
    /// Format `device` and mount the fresh file system.
    ///
    /// Writes the info page, the state bitmap with the four system blocks
    /// marked in use, and the root and first data blocks of the two system
    /// files. With `erase_first` the whole device is erased beforehand;
    /// a failed erase surfaces as [`TinyFsError::Erase`].
    pub fn format(device: D, params: &FormatParams) -> Result<TinyFs<D>> {
        if params.erase_first {
            device.erase_all().map_err(|_| TinyFsError::Erase)?;
        }

        let geo = Geometry::from_params(params)?;
        tracing::debug!(
            num_pages = geo.num_pages,
            page_size = geo.page_size,
            block_size = geo.block_size,
            "formatting device"
        );

        let hash_root = geo.block_address(0);
        let hash_data = geo.block_address(1);
        let meta_root = geo.block_address(2);
        let meta_data = geo.block_address(3);

        // Info page.
        let sb = Superblock::new(&geo, hash_root, meta_root);
        let mut info_page = vec![0u8; geo.page_size as usize];
        info_page[..SUPERBLOCK_SIZE].copy_from_slice(&sb.to_bytes());
        device.write(0, &info_page, 0)?;

        // State bitmap: every usable bit free, dead tail bytes zero, and
        // the four system blocks in use. The bitmap's first bit is the
        // first block after the info page and state section, so the info
        // page itself consumes no bit.
        let valid_bytes = geo.state_section_bytes();
        let mut bitmap_page = vec![0u8; geo.page_size as usize];
        for state_page in 0..geo.state_section_size {
            let base = state_page << geo.page_size_exp;
            for (i, byte) in bitmap_page.iter_mut().enumerate() {
                *byte = if base + (i as u32) < valid_bytes { 0xFF } else { 0x00 };
            }
            if state_page == 0 {
                bitmap_page[0] = 0x0F;
            }
            device.write(1 + state_page, &bitmap_page, 0)?;
        }

        let vol = Volume {
            device,
            geo,
            alloc: BlockAllocator::default(),
        };

        // System file roots: erased index blocks pointing at their first
        // data block.
        for (root, data) in [(hash_root, hash_data), (meta_root, meta_data)] {
            BlockAllocator::erase_block(&vol.device, &vol.geo, root)?;
            vol.write_address(root, 0, data)?;
        }
        vol.device.flush()?;

        let mut fs = TinyFs {
            hash_entries: Self::system_handle(
                &vol,
                &EmbeddedEntry {
                    root_index_block: hash_root,
                    ..EmbeddedEntry::default()
                },
                HASH_ENTRY_OFFSET,
            )?,
            metadata: Self::system_handle(
                &vol,
                &EmbeddedEntry {
                    root_index_block: meta_root,
                    ..EmbeddedEntry::default()
                },
                META_ENTRY_OFFSET,
            )?,
            vol,
        };
        fs.vol.alloc.locate(&fs.vol.device, &fs.vol.geo)?;
        Ok(fs)
    }

    /// Mount an already formatted device.
    ///
    /// Validates the magic, loads the geometry, opens the two system files
    /// from their embedded entries and positions the free-block cursor.
    pub fn mount(device: D) -> Result<TinyFs<D>> {
        let mut prefix = [0u8; SUPERBLOCK_SIZE];
        device.read(0, &mut prefix, 0)?;
        let sb = Superblock::from_bytes(&prefix)?;

        if !(6..=15).contains(&sb.page_size_exp)
            || sb.block_size_exp > 15
            || !(1..=2).contains(&sb.address_size_exp)
            || (sb.hash_size != 2 && sb.hash_size != 4)
        {
            return Err(TinyFsError::NotFormatted);
        }

        let geo = sb.geometry();
        tracing::debug!(
            num_pages = geo.num_pages,
            page_size = geo.page_size,
            block_size = geo.block_size,
            "mounting device"
        );

        let vol = Volume {
            device,
            geo,
            alloc: BlockAllocator::default(),
        };

        let mut fs = TinyFs {
            hash_entries: Self::system_handle(&vol, &sb.hash_entries, HASH_ENTRY_OFFSET)?,
            metadata: Self::system_handle(&vol, &sb.metadata_entries, META_ENTRY_OFFSET)?,
            vol,
        };
        fs.vol.alloc.locate(&fs.vol.device, &fs.vol.geo)?;
        Ok(fs)
    }

    fn system_handle(
        vol: &Volume<D>,
        entry: &EmbeddedEntry,
        entry_offset: u16,
    ) -> Result<FileHandle> {
        let mut f = FileHandle {
            directory_page: SUPERBLOCK_DIR_PAGE,
            directory_byte: entry_offset,
            eof_page: entry.eof_page,
            eof_byte: entry.eof_byte,
            root_index_block: entry.root_index_block,
            ..FileHandle::default()
        };

        f.child_index_block = if f.eof_page >= vol.geo.single_child_page_limit() {
            vol.read_address(f.root_index_block, 0)?
        } else {
            f.root_index_block
        };

        let first_data = vol.read_address(f.child_index_block, 0)?;
        f.data_block = first_data;
        if first_data <= SLOT_DELETED {
            f.invalidate_cache();
        }
        Ok(f)
    }

    /// Geometry of the mounted volume.
    pub fn geometry(&self) -> &Geometry {
        &self.vol.geo
    }

    /// The underlying block device.
    pub fn device(&self) -> &D {
        &self.vol.device
    }

    /// Flush everything and hand the device back.
    pub fn unmount(mut self) -> Result<D> {
        self.sync_system_files()?;
        self.vol.device.flush()?;
        Ok(self.vol.device)
    }

    /// Open `name`, creating the file if it does not exist.
    ///
    /// A new file gets a zeroed directory entry (status written last, so a
    /// torn create never looks live), a fresh root block and a first data
    /// block. An existing file's handle is primed from its directory entry.
    pub fn open(&mut self, name: &str) -> Result<FileHandle> {
        let name = name.as_bytes();
        if name.len() > self.vol.geo.max_file_name_size as usize {
            return Err(TinyFsError::FileNameTooLong);
        }

        let lookup = directory::lookup(
            &mut self.vol,
            &mut self.hash_entries,
            &mut self.metadata,
            name,
            LookupOp::Open,
        )?;

        let mut f = FileHandle::default();
        match lookup {
            Lookup::Created(loc) => {
                f.directory_page = loc.dir_page;
                f.directory_byte = loc.dir_byte;

                // A skipped page tail (entries never straddle pages) must be
                // zero-padded before the entry can extend the metadata file.
                while self.metadata.eof_page < loc.dir_page {
                    let pad =
                        vec![0u8; (self.vol.geo.page_size - self.metadata.eof_byte) as usize];
                    let (p, b) = (self.metadata.eof_page, self.metadata.eof_byte);
                    self.vol.write_file(&mut self.metadata, None, p, &pad, b)?;
                }

                let db = loc.dir_byte;
                self.vol.write_file(
                    &mut self.metadata,
                    None,
                    loc.dir_page,
                    &[STATUS_EMPTY],
                    db + ENTRY_STATUS_OFFSET,
                )?;
                self.vol.write_file(
                    &mut self.metadata,
                    None,
                    loc.dir_page,
                    &0u32.to_le_bytes(),
                    db + ENTRY_EOF_PAGE_OFFSET,
                )?;
                self.vol.write_file(
                    &mut self.metadata,
                    None,
                    loc.dir_page,
                    &0u16.to_le_bytes(),
                    db + ENTRY_EOF_BYTE_OFFSET,
                )?;

                let root = self.vol.reserve_index_block()?;
                self.vol.write_file(
                    &mut self.metadata,
                    None,
                    loc.dir_page,
                    &root.to_le_bytes(),
                    db + ENTRY_ROOT_OFFSET,
                )?;

                // Name plus zero padding up to the full entry size.
                let mut tail =
                    vec![0u8; (self.vol.geo.metadata_size - ENTRY_NAME_OFFSET) as usize];
                tail[..name.len()].copy_from_slice(name);
                self.vol.write_file(
                    &mut self.metadata,
                    None,
                    loc.dir_page,
                    &tail,
                    db + ENTRY_NAME_OFFSET,
                )?;

                self.vol.write_file(
                    &mut self.metadata,
                    None,
                    loc.dir_page,
                    &[STATUS_IN_USE],
                    db + ENTRY_STATUS_OFFSET,
                )?;

                let data = self.vol.reserve_block()?;
                self.vol.write_address(root, 0, data)?;

                f.root_index_block = root;
                f.child_index_block = root;
                f.data_block = data;

                self.sync_system_files()?;
                self.vol.device.flush()?;
            }
            Lookup::Found(loc) => {
                f.directory_page = loc.dir_page;
                f.directory_byte = loc.dir_byte;

                let mut b4 = [0u8; 4];
                self.vol.read_file(
                    &mut self.metadata,
                    loc.dir_page,
                    &mut b4,
                    loc.dir_byte + ENTRY_EOF_PAGE_OFFSET,
                )?;
                f.eof_page = u32::from_le_bytes(b4);

                let mut b2 = [0u8; 2];
                self.vol.read_file(
                    &mut self.metadata,
                    loc.dir_page,
                    &mut b2,
                    loc.dir_byte + ENTRY_EOF_BYTE_OFFSET,
                )?;
                f.eof_byte = u16::from_le_bytes(b2);

                self.vol.read_file(
                    &mut self.metadata,
                    loc.dir_page,
                    &mut b4,
                    loc.dir_byte + ENTRY_ROOT_OFFSET,
                )?;
                f.root_index_block = u32::from_le_bytes(b4);

                if f.eof_page >= self.vol.geo.single_child_page_limit() {
                    let child = self.vol.read_address(f.root_index_block, 0)?;
                    f.child_index_block = child;
                } else {
                    f.child_index_block = f.root_index_block;
                }

                if f.child_index_block <= SLOT_DELETED {
                    f.invalidate_cache();
                } else {
                    let first_data = self.vol.read_address(f.child_index_block, 0)?;
                    f.data_block = first_data;
                    if first_data <= SLOT_DELETED {
                        f.invalidate_cache();
                    }
                }
            }
        }

        f.size_consistent = true;
        Ok(f)
    }

    /// Whether a live file named `name` exists.
    pub fn exists(&mut self, name: &str) -> Result<bool> {
        match directory::lookup(
            &mut self.vol,
            &mut self.hash_entries,
            &mut self.metadata,
            name.as_bytes(),
            LookupOp::Find,
        ) {
            Ok(Lookup::Found(_)) => Ok(true),
            Ok(Lookup::Created(_)) => unreachable!("Find never claims a slot"),
            Err(TinyFsError::FileNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write `data` into logical `page` of the file at `offset`.
    pub fn write(
        &mut self,
        file: &mut FileHandle,
        page: u32,
        data: &[u8],
        offset: u16,
    ) -> Result<()> {
        self.vol
            .write_file(file, Some(&mut self.metadata), page, data, offset)
    }

    /// Read `buf.len()` bytes from logical `page` of the file at `offset`.
    pub fn read(
        &mut self,
        file: &mut FileHandle,
        page: u32,
        buf: &mut [u8],
        offset: u16,
    ) -> Result<()> {
        self.vol.read_file(file, page, buf, offset)
    }

    /// Release the data block containing logical page `file_page`.
    pub fn release_block(&mut self, file: &mut FileHandle, file_page: u32) -> Result<()> {
        self.vol.release_file_block(file, file_page)
    }

    /// Persist the file's size if it is stale, then flush the device.
    pub fn flush(&mut self, file: &mut FileHandle) -> Result<()> {
        if !file.size_consistent {
            self.persist_eof(file)?;
        }
        self.sync_system_files()?;
        self.vol.device.flush()
    }

    /// Close the file. Equivalent to [`TinyFs::flush`].
    pub fn close(&mut self, mut file: FileHandle) -> Result<()> {
        self.flush(&mut file)
    }

    /// Delete `name`: release every block of its index tree, mark the
    /// directory entry deleted. The hash slot is zeroed by the lookup.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let loc = match directory::lookup(
            &mut self.vol,
            &mut self.hash_entries,
            &mut self.metadata,
            name.as_bytes(),
            LookupOp::Remove,
        )? {
            Lookup::Found(loc) => loc,
            Lookup::Created(_) => unreachable!("Remove never claims a slot"),
        };

        let mut b4 = [0u8; 4];
        self.vol.read_file(
            &mut self.metadata,
            loc.dir_page,
            &mut b4,
            loc.dir_byte + ENTRY_EOF_PAGE_OFFSET,
        )?;
        let eof_page = u32::from_le_bytes(b4);

        self.vol.read_file(
            &mut self.metadata,
            loc.dir_page,
            &mut b4,
            loc.dir_byte + ENTRY_ROOT_OFFSET,
        )?;
        let root = u32::from_le_bytes(b4);

        self.release_tree(root, eof_page)?;

        self.vol.write_file(
            &mut self.metadata,
            None,
            loc.dir_page,
            &[STATUS_DELETED],
            loc.dir_byte + ENTRY_STATUS_OFFSET,
        )?;
        self.sync_system_files()?;
        self.vol.device.flush()?;
        Ok(())
    }

    /// Release every block reachable from `root`, in slot order, stopping
    /// at the slot that covers the EOF page. Tombstoned and empty slots
    /// are skipped.
    fn release_tree(&mut self, root: u32, eof_page: u32) -> Result<()> {
        let geo = self.vol.geo.clone();
        let promoted = eof_page >= geo.single_child_page_limit();
        let end_root = index::root_slot(&geo, eof_page);
        let end_child = index::child_slot(&geo, eof_page);
        let step = geo.address_size as u16;

        let mut done = false;
        for rp in 0..=end_root.page {
            let mut rb = 0u16;
            while rb < geo.page_size && !done {
                let child = if promoted {
                    self.vol.read_address(root + rp, rb)?
                } else {
                    root
                };
                let last_root_slot = rp == end_root.page && rb == end_root.byte;

                if child > SLOT_DELETED {
                    'child: for cp in 0..geo.block_size as u32 {
                        let mut cb = 0u16;
                        while cb < geo.page_size {
                            let data = self.vol.read_address(child + cp, cb)?;
                            if data > SLOT_DELETED {
                                self.vol.release_at(data)?;
                            }
                            if last_root_slot && cp == end_child.page && cb == end_child.byte {
                                done = true;
                                break 'child;
                            }
                            cb += step;
                        }
                    }
                    self.vol.release_at(child)?;
                } else if last_root_slot {
                    done = true;
                }

                rb += step;
            }
            if done {
                break;
            }
        }

        if promoted {
            self.vol.release_at(root)?;
        }
        Ok(())
    }

    fn persist_eof(&mut self, file: &mut FileHandle) -> Result<()> {
        if file.directory_page == SUPERBLOCK_DIR_PAGE {
            return self.vol.persist_embedded_eof(file);
        }

        self.vol.write_file(
            &mut self.metadata,
            None,
            file.directory_page,
            &file.eof_page.to_le_bytes(),
            file.directory_byte + ENTRY_EOF_PAGE_OFFSET,
        )?;
        self.vol.write_file(
            &mut self.metadata,
            None,
            file.directory_page,
            &file.eof_byte.to_le_bytes(),
            file.directory_byte + ENTRY_EOF_BYTE_OFFSET,
        )?;
        file.size_consistent = true;
        Ok(())
    }

    /// Keep the embedded directory entries of the system files current, so
    /// a mount after power loss sees their true sizes.
    fn sync_system_files(&mut self) -> Result<()> {
        if !self.hash_entries.size_consistent {
            self.vol.persist_embedded_eof(&mut self.hash_entries)?;
        }
        if !self.metadata.size_consistent {
            self.vol.persist_embedded_eof(&mut self.metadata)?;
        }
        Ok(())
    }
}
