use std::io;

use nix::errno::Errno;
use thiserror::Error;

/// Errors that can occur while attaching a process to a shared table.
///
/// An attach that fails never hands out a partial table: every descriptor and
/// mapping opened along the way is released before the error is returned.
#[derive(Error, Debug)]
pub enum AttachError {
    /// The table name cannot be turned into shared memory object names
    #[error("invalid table name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Bucket count or entry capacity out of range
    #[error("invalid table configuration: {0}")]
    InvalidConfig(String),

    /// `shm_open` failed, or the data segment of an existing table is missing
    #[error("failed to open shared memory segment `{segment}`: {source}")]
    Open {
        segment: String,
        #[source]
        source: Errno,
    },

    /// `ftruncate` or `fstat` failed on a segment
    #[error("failed to size shared memory segment `{segment}`: {source}")]
    Size {
        segment: String,
        #[source]
        source: io::Error,
    },

    /// `mmap` failed on a segment
    #[error("failed to map shared memory segment `{segment}`: {source}")]
    Map {
        segment: String,
        #[source]
        source: io::Error,
    },

    /// The existing segment was laid out by a process using other constants
    #[error("segment `{segment}` layout mismatch: {detail}")]
    LayoutMismatch { segment: String, detail: String },

    /// The creating process never finished initializing the segment
    #[error("segment `{segment}` was not initialized by its creator in time")]
    NotReady { segment: String },
}

/// Errors returned by operations on an attached table.
///
/// A missing key is not an error: lookups and deletes report it as `None`.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TableError {
    /// Every arena slot is occupied and the free list is empty
    #[error("table capacity exceeded ({capacity} entries)")]
    CapacityExceeded { capacity: u32 },

    /// The table behind this handle has been destroyed
    #[error("table `{name}` has been destroyed")]
    InvalidHandle { name: String },

    /// A link stored in shared memory points outside the arena
    #[error("corrupted table: location {location} outside arena of {capacity} entries")]
    Corrupted { location: i32, capacity: u32 },
}

/// Errors reported while tearing a handle down.
///
/// Teardown is best effort: every step is attempted even when an earlier
/// one failed, and the first failure is the one returned.
#[derive(Error, Debug)]
pub enum DetachError {
    #[error("failed to unmap shared memory segment `{segment}`: {source}")]
    Unmap {
        segment: String,
        #[source]
        source: Errno,
    },

    #[error("failed to close shared memory segment `{segment}`: {source}")]
    Close {
        segment: String,
        #[source]
        source: Errno,
    },

    #[error("failed to unlink shared memory segment `{segment}`: {source}")]
    Unlink {
        segment: String,
        #[source]
        source: Errno,
    },
}

pub type Result<T> = std::result::Result<T, TableError>;
