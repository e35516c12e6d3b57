use crate::error::AttachError;
use crate::layout::{MAX_ENTRY_CAPACITY, VALUE_SIZE};

/// Default number of hash buckets.
pub const DEFAULT_BUCKET_COUNT: u32 = 256;

/// Default number of arena slots.
pub const DEFAULT_ENTRY_CAPACITY: u32 = 4096;

/// Longest table name accepted by [`ShmTable::attach`](crate::ShmTable::attach),
/// not counting a leading `/`.
///
/// The object names append a four-byte suffix and must fit in `NAME_MAX`
/// (255 bytes).
pub const MAX_NAME_LEN: usize = 251;

/// Fixed geometry of a shared table.
///
/// Both numbers are part of the shared layout: every process attaching to the
/// same name must use the same configuration, otherwise the attach fails with
/// [`AttachError::LayoutMismatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableConfig {
    bucket_count: u32,
    entry_capacity: u32,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            bucket_count: DEFAULT_BUCKET_COUNT,
            entry_capacity: DEFAULT_ENTRY_CAPACITY,
        }
    }
}

impl TableConfig {
    pub fn new(bucket_count: u32, entry_capacity: u32) -> Self {
        Self {
            bucket_count,
            entry_capacity,
        }
    }

    pub fn with_bucket_count(mut self, bucket_count: u32) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    pub fn with_entry_capacity(mut self, entry_capacity: u32) -> Self {
        self.entry_capacity = entry_capacity;
        self
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    pub fn entry_capacity(&self) -> u32 {
        self.entry_capacity
    }

    /// Size in bytes of the longest value an entry can hold.
    pub fn value_size(&self) -> usize {
        VALUE_SIZE
    }

    /// Checks that both dimensions are non-zero and that every location fits
    /// the `i32` links stored in shared memory.
    pub fn validate(&self) -> Result<(), AttachError> {
        if self.bucket_count == 0 {
            return Err(AttachError::InvalidConfig(
                "bucket count must be at least 1".into(),
            ));
        }
        if self.entry_capacity == 0 {
            return Err(AttachError::InvalidConfig(
                "entry capacity must be at least 1".into(),
            ));
        }
        if self.entry_capacity > MAX_ENTRY_CAPACITY {
            return Err(AttachError::InvalidConfig(format!(
                "entry capacity {} exceeds the maximum of {}",
                self.entry_capacity, MAX_ENTRY_CAPACITY
            )));
        }
        Ok(())
    }
}
