//! Tiny embedded file system
//!
//! A file system for block-oriented persistent storage (SD/MMC cards,
//! dataflash) on hosts with very little RAM. Files are named, hold
//! arbitrary page-addressed data, and are located through a two-level
//! index tree instead of a file allocation table.
//!
//! ## Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ Page 0: info page (superblock)              │
//! │  - magic 0xFC×4, geometry, name/hash sizes  │
//! │  - embedded entries of the 2 system files   │
//! ├─────────────────────────────────────────────┤
//! │ State section: free-block bitmap            │
//! │  - 1 bit per block, MSB first, 1 = free     │
//! ├─────────────────────────────────────────────┤
//! │ System blocks: hash-entries file,           │
//! │ metadata-entries file (root + data blocks)  │
//! ├─────────────────────────────────────────────┤
//! │ User blocks: index and data blocks          │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The directory is the pair of system files: a packed array of file-name
//! hashes, and the fixed-size metadata entries at matching slot indices.
//! Both are ordinary files that grow through the same allocator and index
//! machinery as user data.
//!
//! ## Example
//!
//! ```
//! use tinyfs::{FormatParams, MemDevice, TinyFs};
//!
//! let device = MemDevice::new(1000, 512);
//! let mut fs = TinyFs::format(
//!     device,
//!     &FormatParams {
//!         num_pages: 1000,
//!         erase_first: true,
//!         ..FormatParams::default()
//!     },
//! )
//! .unwrap();
//!
//! let mut file = fs.open("sensor.log").unwrap();
//! fs.write(&mut file, 0, b"reading 42", 0).unwrap();
//!
//! let mut buf = [0u8; 10];
//! fs.read(&mut file, 0, &mut buf, 0).unwrap();
//! assert_eq!(&buf, b"reading 42");
//!
//! fs.close(file).unwrap();
//! ```
//!
//! The core is strictly single-owner: one mounted [`TinyFs`] per device,
//! no operation overlaps another. Crash safety is limited to the
//! file-size-consistency rule: a crash loses writes since the last flush,
//! and a file whose size was never flushed reads back with its old length.

// Storage abstraction
pub mod device;
// Disk-backed device with a one-page buffer
pub mod io;
// Error taxonomy
pub mod error;
// Formatted parameters and derived constants
pub mod geometry;
// Open-file handles
pub mod file;
// The mounted file system
pub mod fs;

// Superblock packing
mod superblock;
// Free-block bitmap
mod allocator;
// Index tree arithmetic
mod index;
// Name -> metadata-slot resolution
mod directory;
// Device + geometry + allocator composite
mod volume;

pub use device::{BlockDevice, MemDevice};
pub use error::{Result, TinyFsError};
pub use file::FileHandle;
pub use fs::TinyFs;
pub use geometry::{FormatParams, Geometry};
pub use io::FileDevice;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
