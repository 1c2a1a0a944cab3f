use std::io;

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the store. Every failure propagates to the caller;
/// none are silently swallowed.
#[derive(Error, Debug)]
pub enum Error {
    /// A filesystem operation failed (open, read, write, stat, mkdir,
    /// rename, unlink, seek, lock).
    #[error("I/O error - {0}")]
    Access(#[from] io::Error),

    /// The backing region could not satisfy an allocation.
    #[error("out of memory - region exhausted")]
    OutOfMemory,

    /// Keydir capacity is zero or not a power of two.
    #[error("invalid capacity - must be a nonzero power of two")]
    InvalidSize,

    /// A composite failure while opening the store or replaying its files.
    #[error("initialization failed - {0}")]
    Init(#[source] Box<Error>),

    /// A write was attempted on a read-only handle.
    #[error("store is opened read-only")]
    ReadOnly,

    /// A record's checksum did not verify on read.
    #[error("record failed CRC verification")]
    Crc,

    /// A computed length or offset would exceed the size type's maximum.
    #[error("arithmetic overflow in length or offset computation")]
    ArithmeticOverflow,

    /// Merge requires at least two data files.
    #[error("nothing to merge - fewer than two data files")]
    Merge,

    /// The keydir could not place an entry.
    #[error("keydir insert failed - table full")]
    InsertFailed,
}
