use thiserror::Error;

#[derive(Error, Debug)]
pub enum TinyFsError {
    #[error("device read failed")]
    Read,

    #[error("device write failed")]
    Write,

    #[error("device erase failed")]
    Erase,

    #[error("no free blocks available")]
    DeviceFull,

    #[error("file exceeds index tree capacity")]
    FileFull,

    #[error("file not found")]
    FileNotFound,

    #[error("index slot is empty or tombstoned where a block was expected")]
    UnreleasedBlock,

    #[error("device is not formatted")]
    NotFormatted,

    #[error("write past end of file")]
    WritePastEnd,

    #[error("read past end of file")]
    Eof,

    #[error("file name exceeds the formatted maximum")]
    FileNameTooLong,

    #[error("invalid page size: {0}")]
    InvalidPageSize(u16),

    #[error("invalid block size: {0}")]
    InvalidBlockSize(u16),

    #[error("invalid hash size: {0}")]
    InvalidHashSize(u8),

    #[error("invalid metadata entry size: {0}")]
    InvalidMetadataSize(u16),

    #[error("device too small: {0} pages")]
    DeviceTooSmall(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TinyFsError>;
