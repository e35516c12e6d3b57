use tracing::trace;

use crate::arena::{Arena, Location};
use crate::error::{Result, TableError};
use crate::index::HashIndex;
use crate::layout::{Entry, VALUE_SIZE};
use crate::value::Value;

/// Where a key sits in its chain.
struct Found {
    bucket: u32,
    prev: Option<Location>,
    location: Location,
}

/// Usage numbers of a table, read under the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub bucket_count: u32,
    pub entry_capacity: u32,
    /// Occupied entries.
    pub len: u32,
    /// Slots ever handed out by the bump pointer.
    pub cursor: u32,
    /// Released slots waiting for reuse.
    pub free: u32,
    pub occupied_buckets: u32,
    pub longest_chain: u32,
}

/// Chained hash table over the bucket table and arena of one locked table.
///
/// Every method assumes the caller holds the table lock for the whole
/// lifetime of the engine.
pub(crate) struct Engine<'a> {
    index: HashIndex<'a>,
    arena: Arena<'a>,
}

impl<'a> Engine<'a> {
    pub fn new(index: HashIndex<'a>, arena: Arena<'a>) -> Self {
        Self { index, arena }
    }

    /// Empties the table.
    pub fn reset(&mut self) {
        self.index.reset();
        self.arena.reset();
    }

    pub fn len(&self) -> u32 {
        self.arena.len()
    }

    /// Walks the chain of `bucket` in link order. Stops with `Corrupted` if
    /// the chain is longer than the arena, which only a cycle can cause.
    fn walk(
        &self,
        bucket: u32,
        mut visit: impl FnMut(Option<Location>, Location, &Entry) -> bool,
    ) -> Result<()> {
        let mut prev = None;
        let mut link = self.index.head(bucket);
        let mut steps = 0u32;
        while let Some(location) = self.arena.resolve(link)? {
            steps += 1;
            if steps > self.arena.capacity() {
                return Err(TableError::Corrupted {
                    location: link,
                    capacity: self.arena.capacity(),
                });
            }
            let entry = self.arena.entry(location);
            if !visit(prev, location, entry) {
                return Ok(());
            }
            prev = Some(location);
            link = entry.next;
        }
        Ok(())
    }

    fn find(&self, key: u64) -> Result<Option<Found>> {
        let bucket = self.index.bucket_of(key);
        let mut found = None;
        self.walk(bucket, |prev, location, entry| {
            if entry.key == key {
                found = Some(Found {
                    bucket,
                    prev,
                    location,
                });
                false
            } else {
                true
            }
        })?;
        Ok(found)
    }

    pub fn locate(&self, key: u64) -> Result<Option<Location>> {
        Ok(self.find(key)?.map(|found| found.location))
    }

    pub fn get(&self, key: u64) -> Result<Option<Value>> {
        Ok(self
            .find(key)?
            .map(|found| Value::from_entry(self.arena.entry(found.location))))
    }

    /// Upsert: overwrites the value of an existing key in place, otherwise
    /// prepends a new entry to the key's bucket chain.
    pub fn insert(&mut self, key: u64, value: &[u8]) -> Result<Option<Value>> {
        if value.len() > VALUE_SIZE {
            trace!(key, len = value.len(), "value truncated to {VALUE_SIZE} bytes");
        }

        if let Some(found) = self.find(key)? {
            let entry = self.arena.entry_mut(found.location);
            let previous = Value::from_entry(entry);
            entry.set_value(value);
            return Ok(Some(previous));
        }

        let bucket = self.index.bucket_of(key);
        let head = self.index.head(bucket);
        // A broken head must not be linked behind a new entry.
        self.arena.resolve(head)?;
        let location = self.arena.allocate()?;
        *self.arena.entry_mut(location) = Entry::occupied(key, value, head);
        self.index.set_head(bucket, location.link());
        Ok(None)
    }

    /// Unlinks `key` from its chain and returns its slot to the free list.
    pub fn delete(&mut self, key: u64) -> Result<Option<Value>> {
        let Some(found) = self.find(key)? else {
            return Ok(None);
        };

        let entry = self.arena.entry(found.location);
        let removed = Value::from_entry(entry);
        let next = entry.next;
        match found.prev {
            None => self.index.set_head(found.bucket, next),
            Some(prev) => self.arena.entry_mut(prev).next = next,
        }
        self.arena.release(found.location);
        Ok(Some(removed))
    }

    /// Visits every entry, bucket by bucket in index order and in link order
    /// within a bucket.
    pub fn for_each_bucket(&self, mut visit: impl FnMut(u32, u64, &[u8])) -> Result<()> {
        for bucket in 0..self.index.bucket_count() {
            self.walk(bucket, |_, _, entry| {
                visit(bucket, entry.key, entry.value());
                true
            })?;
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<TableStats> {
        let mut occupied_buckets = 0;
        let mut longest_chain = 0;
        for bucket in 0..self.index.bucket_count() {
            let mut chain = 0;
            self.walk(bucket, |_, _, _| {
                chain += 1;
                true
            })?;
            if chain > 0 {
                occupied_buckets += 1;
            }
            longest_chain = longest_chain.max(chain);
        }

        Ok(TableStats {
            bucket_count: self.index.bucket_count(),
            entry_capacity: self.arena.capacity(),
            len: self.arena.len(),
            cursor: self.arena.cursor(),
            free: self.arena.free_len()?,
            occupied_buckets,
            longest_chain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{ArenaHeader, Bucket, SENTINEL};
    use proptest::prelude::*;
    use std::collections::HashMap as StdHashMap;

    /// Heap-backed stand-in for the two shared segments.
    struct Parts {
        buckets: Vec<Bucket>,
        header: ArenaHeader,
        entries: Vec<Entry>,
    }

    impl Parts {
        fn new(bucket_count: usize, capacity: usize) -> Self {
            Self {
                buckets: vec![Bucket { location: SENTINEL }; bucket_count],
                header: ArenaHeader::fresh(capacity as u32),
                entries: vec![Entry::vacant(); capacity],
            }
        }

        fn engine(&mut self) -> Engine<'_> {
            Engine::new(
                HashIndex::new(&mut self.buckets),
                Arena::new(&mut self.header, &mut self.entries),
            )
        }
    }

    fn collect(engine: &Engine<'_>) -> Vec<(u32, u64, Vec<u8>)> {
        let mut out = Vec::new();
        engine
            .for_each_bucket(|bucket, key, value| out.push((bucket, key, value.to_vec())))
            .unwrap();
        out
    }

    #[test]
    fn test_insert_lookup_update_delete() {
        let mut parts = Parts::new(256, 4096);
        let mut engine = parts.engine();

        assert_eq!(engine.insert(42, b"hello").unwrap(), None);
        assert_eq!(engine.get(42).unwrap().unwrap(), "hello");

        let old = engine.insert(42, b"world").unwrap();
        assert_eq!(old.unwrap(), "hello");
        assert_eq!(engine.get(42).unwrap().unwrap(), "world");
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.stats().unwrap().cursor, 1);

        assert_eq!(engine.delete(42).unwrap().unwrap(), "world");
        assert_eq!(engine.get(42).unwrap(), None);
        assert_eq!(engine.delete(42).unwrap(), None);
    }

    #[test]
    fn test_chain_is_prepended() {
        let mut parts = Parts::new(4, 16);
        let mut engine = parts.engine();
        // 1, 5 and 9 all land in bucket 1.
        engine.insert(1, b"a").unwrap();
        engine.insert(5, b"b").unwrap();
        engine.insert(9, b"c").unwrap();
        engine.insert(2, b"d").unwrap();

        let keys: Vec<_> = collect(&engine).iter().map(|(b, k, _)| (*b, *k)).collect();
        assert_eq!(keys, vec![(1, 9), (1, 5), (1, 1), (2, 2)]);
        assert_eq!(engine.stats().unwrap().longest_chain, 3);
    }

    #[test]
    fn test_delete_head_middle_tail() {
        for victim in [1u64, 5, 9] {
            let mut parts = Parts::new(4, 16);
            let mut engine = parts.engine();
            for key in [1u64, 5, 9] {
                engine.insert(key, key.to_string().as_bytes()).unwrap();
            }
            engine.delete(victim).unwrap().unwrap();
            for key in [1u64, 5, 9] {
                let got = engine.get(key).unwrap();
                if key == victim {
                    assert_eq!(got, None);
                } else {
                    assert_eq!(got.unwrap(), key.to_string().as_str());
                }
            }
            assert_eq!(engine.stats().unwrap().free, 1);
        }
    }

    #[test]
    fn test_missing_delete_changes_nothing() {
        let mut parts = Parts::new(4, 16);
        let mut engine = parts.engine();
        engine.insert(1, b"a").unwrap();
        engine.insert(5, b"b").unwrap();
        let before = collect(&engine);
        assert_eq!(engine.delete(9).unwrap(), None);
        assert_eq!(engine.delete(2).unwrap(), None);
        assert_eq!(collect(&engine), before);
    }

    #[test]
    fn test_capacity_boundary_leaves_table_unchanged() {
        let mut parts = Parts::new(4, 8);
        let mut engine = parts.engine();
        for key in 1..=8u64 {
            engine.insert(key, b"v").unwrap();
        }
        let before = collect(&engine);
        assert_eq!(
            engine.insert(9, b"v"),
            Err(TableError::CapacityExceeded { capacity: 8 })
        );
        assert_eq!(collect(&engine), before);
        assert_eq!(engine.get(9).unwrap(), None);
        // Updating an existing key still works when full.
        assert!(engine.insert(8, b"w").unwrap().is_some());
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut parts = Parts::new(8, 64);
        let mut engine = parts.engine();
        for key in 0..40u64 {
            engine.insert(key, b"x").unwrap();
        }
        let cursor = engine.stats().unwrap().cursor;
        for key in 0..20u64 {
            engine.delete(key).unwrap();
        }
        for key in 100..120u64 {
            engine.insert(key, b"y").unwrap();
        }
        assert!(engine.stats().unwrap().cursor <= cursor);
        assert_eq!(engine.len(), 40);
    }

    #[test]
    fn test_cycle_is_detected() {
        let mut parts = Parts::new(1, 2);
        {
            let mut engine = parts.engine();
            engine.insert(0, b"a").unwrap();
            engine.insert(1, b"b").unwrap();
        }
        // Point the tail back at the head.
        parts.entries[0].next = 1;
        let engine = parts.engine();
        assert!(matches!(
            engine.get(7),
            Err(TableError::Corrupted { .. })
        ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u64, Vec<u8>),
        Delete(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..48, proptest::collection::vec(any::<u8>(), 0..300))
                .prop_map(|(k, v)| Op::Insert(k, v)),
            (0u64..48).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #[test]
        fn prop_matches_std_hashmap(ops in proptest::collection::vec(op_strategy(), 1..200)) {
            let mut parts = Parts::new(7, 32);
            let mut engine = parts.engine();
            let mut model: StdHashMap<u64, Vec<u8>> = StdHashMap::new();

            for op in ops {
                match op {
                    Op::Insert(k, v) => {
                        let stored = v[..v.len().min(VALUE_SIZE)].to_vec();
                        match engine.insert(k, &v) {
                            Ok(old) => {
                                let expected = model.insert(k, stored);
                                prop_assert_eq!(old.map(|o| o.to_vec()), expected);
                            }
                            Err(TableError::CapacityExceeded { .. }) => {
                                prop_assert!(!model.contains_key(&k));
                                prop_assert_eq!(model.len(), 32);
                            }
                            Err(e) => prop_assert!(false, "unexpected error {e}"),
                        }
                    }
                    Op::Delete(k) => {
                        let removed = engine.delete(k).unwrap();
                        prop_assert_eq!(removed.map(|v| v.to_vec()), model.remove(&k));
                    }
                }

                let stats = engine.stats().unwrap();
                prop_assert_eq!(stats.len as usize, model.len());
                prop_assert_eq!(stats.len + stats.free, stats.cursor);
            }

            for (k, v) in &model {
                prop_assert_eq!(engine.get(*k).unwrap().map(|v| v.to_vec()), Some(v.clone()));
            }
        }
    }
}
