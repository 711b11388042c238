//! Disk-backed block device
//!
//! [`FileDevice`] maps device pages onto a regular file and keeps a single
//! page buffered in RAM, the way an SPI transport keeps one page in its
//! transfer buffer. Writes land in the buffer and reach the file when the
//! buffer is evicted or flushed. The dirty-write hint lets the buffer skip
//! loading a page whose previous contents are known to be dead.

use crate::device::BlockDevice;
use crate::error::{Result, TinyFsError};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

struct PageBuf {
    page: u32,
    data: Vec<u8>,
    loaded: bool,
    dirty: bool,
}

struct DeviceState {
    file: File,
    buf: PageBuf,
    dirty_write: bool,
}

/// File-backed page device with a one-page write-back buffer.
pub struct FileDevice {
    state: Mutex<DeviceState>,
    page_size: u16,
    num_pages: u32,
}

impl FileDevice {
    /// Create a device file of `num_pages * page_size` bytes, truncating any
    /// existing file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, num_pages: u32, page_size: u16) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(num_pages as u64 * page_size as u64)?;

        Ok(Self::from_file(file, num_pages, page_size))
    }

    /// Open an existing device file. The page size must match the one the
    /// file was created with; the page count is derived from the file length.
    pub fn open<P: AsRef<Path>>(path: P, page_size: u16) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let num_pages = (len / page_size as u64) as u32;

        Ok(Self::from_file(file, num_pages, page_size))
    }

    fn from_file(file: File, num_pages: u32, page_size: u16) -> Self {
        FileDevice {
            state: Mutex::new(DeviceState {
                file,
                buf: PageBuf {
                    page: 0,
                    data: vec![0u8; page_size as usize],
                    loaded: false,
                    dirty: false,
                },
                dirty_write: false,
            }),
            page_size,
            num_pages,
        }
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    pub fn page_size(&self) -> u16 {
        self.page_size
    }

    fn check_range(&self, page: u32, offset: u16, len: usize) -> bool {
        page < self.num_pages && offset as usize + len <= self.page_size as usize
    }

    fn write_back(state: &mut DeviceState, page_size: u16) -> std::io::Result<()> {
        if state.buf.loaded && state.buf.dirty {
            let pos = state.buf.page as u64 * page_size as u64;
            state.file.seek(SeekFrom::Start(pos))?;
            state.file.write_all(&state.buf.data)?;
            state.buf.dirty = false;
        }
        Ok(())
    }

    /// Point the buffer at `page`. When `load_contents` is false the buffer
    /// is zero-filled instead of read from the file (dirty write, or a write
    /// that covers the whole page).
    fn switch_to(
        state: &mut DeviceState,
        page_size: u16,
        page: u32,
        load_contents: bool,
    ) -> std::io::Result<()> {
        if state.buf.loaded && state.buf.page == page {
            return Ok(());
        }

        Self::write_back(state, page_size)?;

        if load_contents {
            let pos = page as u64 * page_size as u64;
            state.file.seek(SeekFrom::Start(pos))?;
            state.file.read_exact(&mut state.buf.data)?;
        } else {
            state.buf.data.fill(0);
        }

        state.buf.page = page;
        state.buf.loaded = true;
        state.buf.dirty = !load_contents;
        Ok(())
    }
}

impl BlockDevice for FileDevice {
    fn read(&self, page: u32, buf: &mut [u8], offset: u16) -> Result<()> {
        if !self.check_range(page, offset, buf.len()) {
            return Err(TinyFsError::Read);
        }

        let mut state = self.state.lock();
        Self::switch_to(&mut state, self.page_size, page, true).map_err(|_| TinyFsError::Read)?;

        let start = offset as usize;
        buf.copy_from_slice(&state.buf.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, page: u32, data: &[u8], offset: u16) -> Result<()> {
        if !self.check_range(page, offset, data.len()) {
            return Err(TinyFsError::Write);
        }

        let mut state = self.state.lock();
        let whole_page = offset == 0 && data.len() == self.page_size as usize;
        let load = !(state.dirty_write || whole_page);
        Self::switch_to(&mut state, self.page_size, page, load).map_err(|_| TinyFsError::Write)?;

        let start = offset as usize;
        state.buf.data[start..start + data.len()].copy_from_slice(data);
        state.buf.dirty = true;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::write_back(&mut state, self.page_size).map_err(|_| TinyFsError::Write)?;
        state.file.sync_data().map_err(|_| TinyFsError::Write)?;
        Ok(())
    }

    fn set_dirty_write(&self, enabled: bool) {
        self.state.lock().dirty_write = enabled;
    }

    fn erase_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.buf.loaded = false;
        state.buf.dirty = false;

        let zeros = vec![0u8; self.page_size as usize];
        let erase = |state: &mut DeviceState| -> std::io::Result<()> {
            state.file.seek(SeekFrom::Start(0))?;
            for _ in 0..self.num_pages {
                state.file.write_all(&zeros)?;
            }
            state.file.sync_data()
        };
        erase(&mut state).map_err(|_| TinyFsError::Erase)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_create_write_read() {
        let temp = NamedTempFile::new().unwrap();
        let dev = FileDevice::create(temp.path(), 64, 512).unwrap();

        dev.write(5, b"payload", 17).unwrap();
        let mut buf = [0u8; 7];
        dev.read(5, &mut buf, 17).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn test_reopen_after_flush() {
        let temp = NamedTempFile::new().unwrap();
        {
            let dev = FileDevice::create(temp.path(), 16, 512).unwrap();
            dev.write(2, &[0xA5; 512], 0).unwrap();
            dev.flush().unwrap();
        }

        let dev = FileDevice::open(temp.path(), 512).unwrap();
        assert_eq!(dev.num_pages(), 16);

        let mut buf = [0u8; 512];
        dev.read(2, &mut buf, 0).unwrap();
        assert!(buf.iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn test_buffer_evicts_on_page_switch() {
        let temp = NamedTempFile::new().unwrap();
        let dev = FileDevice::create(temp.path(), 16, 512).unwrap();

        dev.write(0, b"first", 0).unwrap();
        dev.write(1, b"second", 0).unwrap();

        // Page 0 was evicted to the file; read it back through the buffer.
        let mut buf = [0u8; 5];
        dev.read(0, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"first");
    }

    #[test]
    fn test_dirty_write_skips_stale_contents() {
        let temp = NamedTempFile::new().unwrap();
        let dev = FileDevice::create(temp.path(), 16, 512).unwrap();

        dev.write(3, &[0xFF; 512], 0).unwrap();
        dev.flush().unwrap();
        // Point the buffer elsewhere so page 3 has to be re-assembled.
        dev.write(7, &[1], 0).unwrap();

        // A dirty write assembles the page in a zeroed buffer; the old 0xFF
        // bytes outside the written range must not survive.
        dev.set_dirty_write(true);
        dev.write(3, b"new", 0).unwrap();
        dev.set_dirty_write(false);
        dev.flush().unwrap();

        let mut buf = [0u8; 8];
        dev.read(3, &mut buf, 0).unwrap();
        assert_eq!(&buf[..3], b"new");
        assert!(buf[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let temp = NamedTempFile::new().unwrap();
        let dev = FileDevice::create(temp.path(), 4, 512).unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(dev.read(4, &mut buf, 0), Err(TinyFsError::Read)));
        assert!(matches!(
            dev.write(0, &[0u8; 4], 510),
            Err(TinyFsError::Write)
        ));
    }
}
