//! Free-block allocator
//!
//! Block reservations are tracked in the state section: one bit per
//! allocatable block, MSB first within each byte, 1 = free, 0 = in use.
//! The bitmap lives on the device right after the info page; only the
//! next-free cursor and the sticky pool-empty flag are kept in RAM.

use crate::device::BlockDevice;
use crate::error::{Result, TinyFsError};
use crate::geometry::Geometry;

#[derive(Debug, Default)]
pub(crate) struct BlockAllocator {
    /// Bit index of the next candidate free block.
    cursor: u32,
    /// Set once a forward scan exhausts the bitmap; cleared on release.
    pool_empty: bool,
}

fn state_page(geo: &Geometry, byte_index: u32) -> u32 {
    1 + (byte_index >> geo.page_size_exp)
}

fn state_offset(geo: &Geometry, byte_index: u32) -> u16 {
    (byte_index & (geo.page_size as u32 - 1)) as u16
}

impl BlockAllocator {
    /// Position the cursor on the first free block. Used on mount and after
    /// format.
    pub fn locate<D: BlockDevice>(&mut self, device: &D, geo: &Geometry) -> Result<()> {
        match self.find_next_free(device, geo, 0)? {
            Some(bit) => {
                self.cursor = bit;
                self.pool_empty = false;
            }
            None => self.pool_empty = true,
        }
        Ok(())
    }

    /// Reserve one block and return its device page address.
    pub fn reserve<D: BlockDevice>(&mut self, device: &D, geo: &Geometry) -> Result<u32> {
        if self.pool_empty {
            return Err(TinyFsError::DeviceFull);
        }

        let mut bit = self.cursor;
        let mut byte = self.read_state_byte(device, geo, bit >> 3)?;
        let mut mask = 0x80u8 >> (bit & 7);

        if byte & mask == 0 {
            // The cursor should always rest on a free bit; resynchronize if
            // the bitmap disagrees.
            tracing::warn!(bit, "free-block cursor pointed at a reserved block");
            match self.find_next_free(device, geo, bit + 1)? {
                Some(next) => {
                    bit = next;
                    byte = self.read_state_byte(device, geo, bit >> 3)?;
                    mask = 0x80u8 >> (bit & 7);
                }
                None => {
                    self.pool_empty = true;
                    return Err(TinyFsError::DeviceFull);
                }
            }
        }

        byte &= !mask;
        device.write(
            state_page(geo, bit >> 3),
            &[byte],
            state_offset(geo, bit >> 3),
        )?;

        self.cursor = bit + 1;
        match self.find_next_free(device, geo, self.cursor)? {
            Some(next) => self.cursor = next,
            None => self.pool_empty = true,
        }

        device.flush()?;
        Ok(geo.block_address(bit))
    }

    /// Return a block to the pool. Releasing an already-free block is a
    /// no-op success.
    pub fn release<D: BlockDevice>(
        &mut self,
        device: &D,
        geo: &Geometry,
        block_addr: u32,
    ) -> Result<()> {
        debug_assert!(block_addr >= geo.first_block_page());
        let bit = (block_addr - geo.first_block_page()) >> geo.block_size_exp;

        let mut byte = self.read_state_byte(device, geo, bit >> 3)?;
        let mask = 0x80u8 >> (bit & 7);

        if byte & mask != 0 {
            tracing::debug!(block_addr, "release of a block that is already free");
            return Ok(());
        }

        byte |= mask;
        device.write(
            state_page(geo, bit >> 3),
            &[byte],
            state_offset(geo, bit >> 3),
        )?;
        device.flush()?;

        if bit < self.cursor {
            self.cursor = bit;
        }
        self.pool_empty = false;
        Ok(())
    }

    /// Fill every page of a block with zeros. Fresh index blocks are erased
    /// so empty slots are distinguishable from block addresses.
    pub fn erase_block<D: BlockDevice>(device: &D, geo: &Geometry, block_addr: u32) -> Result<()> {
        let zeros = vec![0u8; geo.page_size as usize];
        for page in block_addr..block_addr + geo.block_size as u32 {
            device.write(page, &zeros, 0)?;
        }
        Ok(())
    }

    fn read_state_byte<D: BlockDevice>(
        &self,
        device: &D,
        geo: &Geometry,
        byte_index: u32,
    ) -> Result<u8> {
        let mut buf = [0u8; 1];
        device.read(
            state_page(geo, byte_index),
            &mut buf,
            state_offset(geo, byte_index),
        )?;
        Ok(buf[0])
    }

    /// First free bit at or after `from_bit`, scanning page by page. Bytes
    /// past the valid bitmap region are zero and never match.
    fn find_next_free<D: BlockDevice>(
        &self,
        device: &D,
        geo: &Geometry,
        from_bit: u32,
    ) -> Result<Option<u32>> {
        let total_bytes = geo.state_section_size << geo.page_size_exp;
        let mut byte_index = from_bit >> 3;
        if byte_index >= total_bytes {
            return Ok(None);
        }

        let mut page_buf = vec![0u8; geo.page_size as usize];
        let mut first_mask = 0xFFu8 >> (from_bit & 7);

        while byte_index < total_bytes {
            let page = state_page(geo, byte_index);
            device.read(page, &mut page_buf, 0)?;

            let mut offset = state_offset(geo, byte_index) as usize;
            while offset < geo.page_size as usize {
                let byte = page_buf[offset] & first_mask;
                first_mask = 0xFF;

                if byte != 0 {
                    let bit = (byte_index << 3) + byte.leading_zeros();
                    return Ok(Some(bit));
                }

                byte_index += 1;
                offset += 1;
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::geometry::FormatParams;

    // 1000 pages, 8-page blocks: 15 valid bitmap bytes, 120 usable blocks,
    // first allocatable block at page 2.
    fn setup() -> (MemDevice, Geometry) {
        let geo = Geometry::from_params(&FormatParams {
            num_pages: 1000,
            ..FormatParams::default()
        })
        .unwrap();
        let device = MemDevice::new(geo.num_pages, geo.page_size);

        let mut bitmap = vec![0u8; geo.page_size as usize];
        for byte in bitmap.iter_mut().take(geo.state_section_bytes() as usize) {
            *byte = 0xFF;
        }
        bitmap[0] = 0x0F; // four system blocks in use
        device.write(1, &bitmap, 0).unwrap();

        (device, geo)
    }

    #[test]
    fn test_reserve_skips_system_blocks() {
        let (device, geo) = setup();
        let mut alloc = BlockAllocator::default();
        alloc.locate(&device, &geo).unwrap();

        assert_eq!(alloc.reserve(&device, &geo).unwrap(), geo.block_address(4));
        assert_eq!(alloc.reserve(&device, &geo).unwrap(), geo.block_address(5));
        assert_eq!(alloc.reserve(&device, &geo).unwrap(), geo.block_address(6));
    }

    #[test]
    fn test_release_pulls_cursor_back() {
        let (device, geo) = setup();
        let mut alloc = BlockAllocator::default();
        alloc.locate(&device, &geo).unwrap();

        let a = alloc.reserve(&device, &geo).unwrap();
        let _b = alloc.reserve(&device, &geo).unwrap();

        alloc.release(&device, &geo, a).unwrap();
        assert_eq!(alloc.reserve(&device, &geo).unwrap(), a);
    }

    #[test]
    fn test_release_is_idempotent() {
        let (device, geo) = setup();
        let mut alloc = BlockAllocator::default();
        alloc.locate(&device, &geo).unwrap();

        let a = alloc.reserve(&device, &geo).unwrap();
        alloc.release(&device, &geo, a).unwrap();
        alloc.release(&device, &geo, a).unwrap();
        assert_eq!(alloc.reserve(&device, &geo).unwrap(), a);
    }

    #[test]
    fn test_pool_exhaustion_is_sticky_until_release() {
        let (device, geo) = setup();
        let mut alloc = BlockAllocator::default();
        alloc.locate(&device, &geo).unwrap();

        let mut last = 0;
        for _ in 0..116 {
            last = alloc.reserve(&device, &geo).unwrap();
        }
        assert!(matches!(
            alloc.reserve(&device, &geo),
            Err(TinyFsError::DeviceFull)
        ));

        alloc.release(&device, &geo, last).unwrap();
        assert_eq!(alloc.reserve(&device, &geo).unwrap(), last);
    }

    #[test]
    fn test_erase_block_zeroes_all_pages() {
        let (device, geo) = setup();
        let addr = geo.block_address(4);

        for page in addr..addr + geo.block_size as u32 {
            device.write(page, &[0xEE; 512], 0).unwrap();
        }
        BlockAllocator::erase_block(&device, &geo, addr).unwrap();

        let mut buf = [0xAAu8; 512];
        for page in addr..addr + geo.block_size as u32 {
            device.read(page, &mut buf, 0).unwrap();
            assert!(buf.iter().all(|&b| b == 0));
        }
    }
}
