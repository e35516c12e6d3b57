use tracing::warn;

use crate::error::{Result, TableError};
use crate::layout::{ArenaHeader, Entry, SENTINEL};

/// A slot index into the arena.
///
/// Locations are the only way entries refer to each other, so they stay
/// meaningful in every process regardless of where the segment is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location(u32);

impl Location {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn link(self) -> i32 {
        self.0 as i32
    }
}

/// Bump-pointer plus free-list allocator over the fixed entry array.
///
/// Slots below `cursor` are either on the free list or in exactly one
/// bucket chain; slots at or above `cursor` have never been handed out.
pub(crate) struct Arena<'a> {
    header: &'a mut ArenaHeader,
    entries: &'a mut [Entry],
}

impl<'a> Arena<'a> {
    pub fn new(header: &'a mut ArenaHeader, entries: &'a mut [Entry]) -> Self {
        Self { header, entries }
    }

    pub fn capacity(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn cursor(&self) -> u32 {
        self.header.cursor.max(0) as u32
    }

    /// Occupied slots.
    pub fn len(&self) -> u32 {
        self.header.len.max(0) as u32
    }

    /// Turns a link read from shared memory into a location, rejecting
    /// anything that does not point at a handed-out slot.
    pub fn resolve(&self, link: i32) -> Result<Option<Location>> {
        if link == SENTINEL {
            return Ok(None);
        }
        if link < 0 || link as u32 >= self.cursor() {
            return Err(TableError::Corrupted {
                location: link,
                capacity: self.capacity(),
            });
        }
        Ok(Some(Location(link as u32)))
    }

    pub fn entry(&self, location: Location) -> &Entry {
        &self.entries[location.index()]
    }

    pub fn entry_mut(&mut self, location: Location) -> &mut Entry {
        &mut self.entries[location.index()]
    }

    /// Hands out a slot, preferring recycled ones over never-used ones.
    pub fn allocate(&mut self) -> Result<Location> {
        if let Some(location) = self.resolve(self.header.free_head)? {
            let next = self.entries[location.index()].next;
            // Validate before committing so a bad link leaves the list intact.
            self.resolve(next)?;
            self.header.free_head = next;
            self.header.len += 1;
            return Ok(location);
        }

        let cursor = self.cursor();
        if cursor >= self.capacity() {
            warn!(capacity = self.capacity(), "arena exhausted");
            return Err(TableError::CapacityExceeded {
                capacity: self.capacity(),
            });
        }
        self.header.cursor += 1;
        self.header.len += 1;
        Ok(Location(cursor))
    }

    /// Returns a slot that was just unlinked from its bucket chain to the
    /// free list.
    pub fn release(&mut self, location: Location) {
        let free_head = self.header.free_head;
        let entry = &mut self.entries[location.index()];
        *entry = Entry::vacant();
        entry.next = free_head;
        self.header.free_head = location.link();
        self.header.len -= 1;
    }

    /// Length of the free list.
    pub fn free_len(&self) -> Result<u32> {
        let mut count = 0;
        let mut link = self.header.free_head;
        while let Some(location) = self.resolve(link)? {
            count += 1;
            if count > self.capacity() {
                return Err(TableError::Corrupted {
                    location: link,
                    capacity: self.capacity(),
                });
            }
            link = self.entry(location).next;
        }
        Ok(count)
    }

    /// Resets the arena to the freshly created state: every slot filled
    /// with the sentinel pattern, nothing handed out.
    pub fn reset(&mut self) {
        self.entries.fill(Entry::vacant());
        *self.header = ArenaHeader::fresh(self.capacity());
    }
}
