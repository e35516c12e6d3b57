//! Byte layout of the two shared segments.
//!
//! ```text
//! index segment  (<name>hash)
//! +---------------+-------------+------------------------------------+
//! | control block | IndexHeader | Bucket * bucket_count              |
//! |   64 bytes    |  16 bytes   |   i32 chain head or -1             |
//! +---------------+-------------+------------------------------------+
//!
//! data segment   (<name>data)
//! +-------------+----------------------------------------------------+
//! | ArenaHeader | Entry * entry_capacity                             |
//! |  16 bytes   |   272 bytes each                                   |
//! +-------------+----------------------------------------------------+
//! ```
//!
//! All links are arena indices stored as `i32`, with `-1` as the terminator,
//! so the structures mean the same thing at any mapping address.

use std::mem::size_of;

use bytemuck::{Pod, Zeroable};

use crate::config::TableConfig;

/// Bytes of value storage in every entry.
pub const VALUE_SIZE: usize = 256;

/// Link value meaning "no entry".
pub const SENTINEL: i32 = -1;

/// Largest arena addressable with `i32` links.
pub const MAX_ENTRY_CAPACITY: u32 = i32::MAX as u32;

/// Bumped whenever the meaning of any shared byte changes.
pub const LAYOUT_VERSION: u32 = 1;

/// Offsets within the control block at the start of the index segment.
/// Accessed as `AtomicU32` via pointer arithmetic, never through `&mut`.
pub(crate) mod control {
    /// Spinlock word: 0 = unlocked, otherwise the pid of the holder.
    pub const LOCK_OFFSET: usize = 0;
    /// Segment state, see [`crate::lock::SegmentState`].
    pub const STATE_OFFSET: usize = 4;
    /// Padded to a cache line.
    pub const SIZE: usize = 64;
}

/// Geometry recorded by the creator so attachers can verify compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct IndexHeader {
    pub bucket_count: u32,
    pub entry_capacity: u32,
    pub value_size: u32,
    pub version: u32,
}

impl IndexHeader {
    pub fn for_config(config: &TableConfig) -> Self {
        Self {
            bucket_count: config.bucket_count(),
            entry_capacity: config.entry_capacity(),
            value_size: VALUE_SIZE as u32,
            version: LAYOUT_VERSION,
        }
    }
}

/// One hash bucket: the arena location of its chain head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct Bucket {
    pub location: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct ArenaHeader {
    /// Next never-used slot.
    pub cursor: i32,
    /// Head of the free list.
    pub free_head: i32,
    /// Occupied slots.
    pub len: i32,
    pub entry_capacity: u32,
}

impl ArenaHeader {
    pub fn fresh(entry_capacity: u32) -> Self {
        Self {
            cursor: 0,
            free_head: SENTINEL,
            len: 0,
            entry_capacity,
        }
    }
}

/// One arena slot.
///
/// While occupied, `next` links to the following entry of the same bucket
/// chain; while free, it links to the next free slot. `len` is the number of
/// meaningful bytes in `value`, so a value filling the whole buffer needs no
/// terminator.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct Entry {
    pub next: i32,
    pub len: u32,
    pub key: u64,
    pub value: [u8; VALUE_SIZE],
}

impl Entry {
    /// An entry filled with the sentinel byte pattern.
    pub fn vacant() -> Self {
        let mut entry = Entry::zeroed();
        bytemuck::bytes_of_mut(&mut entry).fill(0xff);
        entry
    }

    pub fn occupied(key: u64, value: &[u8], next: i32) -> Self {
        let mut entry = Entry::vacant();
        entry.key = key;
        entry.next = next;
        entry.set_value(value);
        entry
    }

    /// Copies at most [`VALUE_SIZE`] bytes of `value` in, returning how many
    /// were kept.
    pub fn set_value(&mut self, value: &[u8]) -> usize {
        let len = value.len().min(VALUE_SIZE);
        self.value[..len].copy_from_slice(&value[..len]);
        self.value[len..].fill(0);
        self.len = len as u32;
        len
    }

    pub fn value(&self) -> &[u8] {
        let len = (self.len as usize).min(VALUE_SIZE);
        &self.value[..len]
    }
}

pub(crate) const INDEX_HEADER_OFFSET: usize = control::SIZE;
pub(crate) const BUCKETS_OFFSET: usize = INDEX_HEADER_OFFSET + size_of::<IndexHeader>();
pub(crate) const ARENA_HEADER_OFFSET: usize = 0;
pub(crate) const ENTRIES_OFFSET: usize = size_of::<ArenaHeader>();

const _: () = assert!(size_of::<Entry>() == 272, "entry layout changed");
const _: () = assert!(BUCKETS_OFFSET % std::mem::align_of::<Bucket>() == 0);
const _: () = assert!(ENTRIES_OFFSET % std::mem::align_of::<Entry>() == 0);

/// Exact size of the index segment for `config`.
pub fn index_segment_size(config: &TableConfig) -> usize {
    BUCKETS_OFFSET + config.bucket_count() as usize * size_of::<Bucket>()
}

/// Exact size of the data segment for `config`.
pub fn data_segment_size(config: &TableConfig) -> usize {
    ENTRIES_OFFSET + config.entry_capacity() as usize * size_of::<Entry>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_sizes_default() {
        let config = TableConfig::default();
        assert_eq!(index_segment_size(&config), 64 + 16 + 256 * 4);
        assert_eq!(data_segment_size(&config), 16 + 4096 * 272);
    }

    #[test]
    fn test_vacant_is_sentinel_pattern() {
        let entry = Entry::vacant();
        assert_eq!(entry.next, SENTINEL);
        assert!(bytemuck::bytes_of(&entry).iter().all(|&b| b == 0xff));
    }

    #[test]
    fn test_value_exact_length_is_kept() {
        let value = [b'x'; VALUE_SIZE];
        let entry = Entry::occupied(7, &value, SENTINEL);
        assert_eq!(entry.value(), &value[..]);
        assert_eq!(entry.len as usize, VALUE_SIZE);
    }

    #[test]
    fn test_value_is_truncated() {
        let value = vec![b'y'; VALUE_SIZE + 10];
        let mut entry = Entry::vacant();
        assert_eq!(entry.set_value(&value), VALUE_SIZE);
        assert_eq!(entry.value().len(), VALUE_SIZE);
    }

    #[test]
    fn test_overwrite_shorter_value_clears_tail() {
        let mut entry = Entry::occupied(1, b"a longer value", SENTINEL);
        entry.set_value(b"short");
        assert_eq!(entry.value(), b"short");
        assert!(entry.value[5..].iter().all(|&b| b == 0));
    }
}
