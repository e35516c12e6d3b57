use tracing::{debug, info};

use crate::arena::{Arena, Location};
use crate::config::TableConfig;
use crate::engine::{Engine, TableStats};
use crate::error::{AttachError, DetachError, Result, TableError};
use crate::index::HashIndex;
use crate::layout::{
    ARENA_HEADER_OFFSET, ArenaHeader, BUCKETS_OFFSET, Bucket, ENTRIES_OFFSET, Entry,
    INDEX_HEADER_OFFSET, IndexHeader,
};
use crate::lock::{ControlBlock, SegmentState};
use crate::region::FixedRegion;
use crate::storage::TableStorage;
use crate::value::Value;

/// One entry as seen by a full-table traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEntry {
    pub bucket: u32,
    pub key: u64,
    pub value: Value,
}

/// A fixed-capacity `u64 -> bytes` hash table living in two named shared
/// memory segments.
///
/// Every process that attaches under the same name sees and mutates the same
/// table. Each operation holds the table's cross-process spinlock for its
/// whole duration, so no process ever observes a half-updated chain.
///
/// ```no_run
/// use shmstore::ShmTable;
///
/// let table = ShmTable::attach("demo").unwrap();
/// table.insert(42, "hello").unwrap();
/// assert_eq!(table.lookup(42).unwrap().unwrap(), "hello");
/// table.detach(false).unwrap();
/// ```
pub struct ShmTable {
    name: String,
    config: TableConfig,
    created: bool,
    control: ControlBlock,
    index_header: FixedRegion<IndexHeader>,
    buckets: FixedRegion<Bucket>,
    arena_header: FixedRegion<ArenaHeader>,
    entries: FixedRegion<Entry>,
    /// Owns the mappings every region above points into.
    storage: TableStorage,
}

// SAFETY: the regions point into mappings owned by `storage`, which move
// with the table. All access to them happens through `with_engine` and
// `initialize`, under the spinlock that also serializes other processes.
unsafe impl Send for ShmTable {}
unsafe impl Sync for ShmTable {}

impl ShmTable {
    /// Attaches to table `name` with the default geometry, creating it if it
    /// does not exist yet.
    pub fn attach(name: &str) -> std::result::Result<Self, AttachError> {
        Self::attach_with(name, TableConfig::default())
    }

    /// Attaches to table `name`, creating it with `config` if it does not
    /// exist yet. An existing table must have been created with the same
    /// configuration.
    pub fn attach_with(name: &str, config: TableConfig) -> std::result::Result<Self, AttachError> {
        config.validate()?;
        let mut storage = TableStorage::attach(name, &config)?;
        let created = storage.created();

        let index_base = storage.index.base();
        let data_base = storage.data.base();
        // SAFETY: the storage mapped both segments with exactly the sizes the
        // layout computes for `config`.
        let table = unsafe {
            Self {
                name: name.to_string(),
                config,
                created,
                control: ControlBlock::new(index_base),
                index_header: FixedRegion::at_offset(index_base, INDEX_HEADER_OFFSET, 1),
                buckets: FixedRegion::at_offset(
                    index_base,
                    BUCKETS_OFFSET,
                    config.bucket_count() as usize,
                ),
                arena_header: FixedRegion::at_offset(data_base, ARENA_HEADER_OFFSET, 1),
                entries: FixedRegion::at_offset(
                    data_base,
                    ENTRIES_OFFSET,
                    config.entry_capacity() as usize,
                ),
                storage,
            }
        };

        if created {
            table.initialize();
        } else {
            table.verify_layout()?;
        }

        info!(
            table = name,
            created,
            buckets = config.bucket_count(),
            capacity = config.entry_capacity(),
            "attached shared table"
        );
        Ok(table)
    }

    /// Writes the empty table and publishes it to other attachers.
    fn initialize(&self) {
        {
            let _guard = self.control.lock();
            // SAFETY: lock held; nobody else can see the segment before
            // it is published below.
            unsafe {
                self.engine().reset();
                *self.index_header.first_mut() = IndexHeader::for_config(&self.config);
            }
        }
        self.control.publish(SegmentState::Ready);
        debug!(table = %self.name, "initialized shared table");
    }

    /// Compares the geometry recorded by the creator with ours.
    fn verify_layout(&self) -> std::result::Result<(), AttachError> {
        let _guard = self.control.lock();
        // SAFETY: lock held.
        let (index_header, arena_header) =
            unsafe { (*self.index_header.first_mut(), *self.arena_header.first_mut()) };

        let expected = IndexHeader::for_config(&self.config);
        if index_header != expected {
            return Err(AttachError::LayoutMismatch {
                segment: self.storage.index.name().to_string(),
                detail: format!("found {index_header:?}, expected {expected:?}"),
            });
        }
        if arena_header.entry_capacity != self.config.entry_capacity() {
            return Err(AttachError::LayoutMismatch {
                segment: self.storage.data.name().to_string(),
                detail: format!(
                    "arena holds {} entries, expected {}",
                    arena_header.entry_capacity,
                    self.config.entry_capacity()
                ),
            });
        }
        Ok(())
    }

    /// Runs `f` against the table while holding the lock.
    fn with_engine<R>(&self, f: impl FnOnce(&mut Engine<'_>) -> Result<R>) -> Result<R> {
        let _guard = self.control.lock();
        if self.control.state() != SegmentState::Ready {
            return Err(TableError::InvalidHandle {
                name: self.name.clone(),
            });
        }
        // SAFETY: lock held until after `f` returns.
        let mut engine = unsafe { self.engine() };
        f(&mut engine)
    }

    /// Views of the bucket table and arena.
    ///
    /// # Safety
    /// The caller must hold the lock for the lifetime of the engine and must
    /// not create a second engine meanwhile.
    unsafe fn engine(&self) -> Engine<'_> {
        // The three regions do not overlap each other.
        unsafe {
            Engine::new(
                HashIndex::new(self.buckets.slice_mut()),
                Arena::new(self.arena_header.first_mut(), self.entries.slice_mut()),
            )
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Whether this handle created (and initialized) the table.
    pub fn is_creator(&self) -> bool {
        self.created
    }

    /// Inserts or updates `key`.
    ///
    /// Values longer than [`VALUE_SIZE`](crate::VALUE_SIZE) bytes are
    /// truncated. Returns the previous value if the key was present; fails
    /// with [`TableError::CapacityExceeded`] without modifying the table if a
    /// new slot is needed and none is left.
    pub fn insert(&self, key: u64, value: impl AsRef<[u8]>) -> Result<Option<Value>> {
        self.with_engine(|engine| engine.insert(key, value.as_ref()))
    }

    /// Returns a copy of the value stored under `key`.
    pub fn lookup(&self, key: u64) -> Result<Option<Value>> {
        self.with_engine(|engine| engine.get(key))
    }

    /// Returns the arena slot holding `key`.
    pub fn locate(&self, key: u64) -> Result<Option<Location>> {
        self.with_engine(|engine| engine.locate(key))
    }

    pub fn contains_key(&self, key: u64) -> Result<bool> {
        Ok(self.locate(key)?.is_some())
    }

    /// Removes `key`, returning its value, or `None` if it was not present.
    pub fn delete(&self, key: u64) -> Result<Option<Value>> {
        self.with_engine(|engine| engine.delete(key))
    }

    /// Calls `visit(bucket, key, value)` for every entry, bucket by bucket.
    ///
    /// The lock is held for the whole traversal, so `visit` must not call
    /// back into any handle of this table; it would spin forever.
    pub fn for_each_bucket(&self, visit: impl FnMut(u32, u64, &[u8])) -> Result<()> {
        self.with_engine(|engine| engine.for_each_bucket(visit))
    }

    /// Copies out every entry in traversal order.
    pub fn entries(&self) -> Result<Vec<BucketEntry>> {
        let mut out = Vec::new();
        self.for_each_bucket(|bucket, key, value| {
            out.push(BucketEntry {
                bucket,
                key,
                value: Value::new(value),
            })
        })?;
        Ok(out)
    }

    pub fn len(&self) -> Result<usize> {
        self.with_engine(|engine| Ok(engine.len() as usize))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn stats(&self) -> Result<TableStats> {
        self.with_engine(|engine| engine.stats())
    }

    /// Unmaps the table from this process and closes its descriptors.
    ///
    /// With `unlink`, the table is also destroyed for everybody: handles of
    /// other processes start failing with [`TableError::InvalidHandle`] and
    /// the next attach under the same name creates a fresh table.
    ///
    /// A handle whose table was already destroyed by someone else only
    /// detaches: the names may by now belong to a newer table.
    pub fn detach(self, unlink: bool) -> std::result::Result<(), DetachError> {
        let unlink = unlink && {
            let _guard = self.control.lock();
            if self.control.state() == SegmentState::Destroyed {
                debug!(table = %self.name, "table already destroyed, skipping unlink");
                false
            } else {
                self.control.publish(SegmentState::Destroyed);
                true
            }
        };
        let Self { name, storage, .. } = self;
        debug!(table = %name, unlink, "detaching shared table");
        storage.detach(unlink)
    }

    /// Removes the named segments of table `name` without attaching.
    /// Processes still attached keep their mappings.
    pub fn unlink(name: &str) -> std::result::Result<(), DetachError> {
        TableStorage::unlink(name)
    }
}

impl std::fmt::Debug for ShmTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmTable")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("created", &self.created)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::VALUE_SIZE;

    fn unique(tag: &str) -> String {
        format!("shmstore-table-{}-{}", std::process::id(), tag)
    }

    fn small(tag: &str, buckets: u32, capacity: u32) -> ShmTable {
        let name = unique(tag);
        let _ = ShmTable::unlink(&name);
        ShmTable::attach_with(&name, TableConfig::new(buckets, capacity)).unwrap()
    }

    #[test]
    fn test_concrete_scenario() {
        let name = unique("scenario");
        let _ = ShmTable::unlink(&name);
        let table = ShmTable::attach(&name).unwrap();
        assert!(table.is_creator());

        table.insert(42, "hello").unwrap();
        assert_eq!(table.lookup(42).unwrap().unwrap(), "hello");

        let cursor = table.stats().unwrap().cursor;
        table.insert(42, "world").unwrap();
        assert_eq!(table.lookup(42).unwrap().unwrap(), "world");
        assert_eq!(table.stats().unwrap().cursor, cursor);
        assert_eq!(table.len().unwrap(), 1);

        assert_eq!(table.delete(42).unwrap().unwrap(), "world");
        assert_eq!(table.lookup(42).unwrap(), None);

        for key in 1..=4096u64 {
            table.insert(key, format!("v{key}")).unwrap();
        }
        assert_eq!(
            table.insert(4097, "overflow"),
            Err(TableError::CapacityExceeded { capacity: 4096 })
        );
        assert_eq!(table.lookup(4097).unwrap(), None);
        assert_eq!(table.lookup(4096).unwrap().unwrap(), "v4096");

        table.detach(true).unwrap();

        let fresh = ShmTable::attach(&name).unwrap();
        assert!(fresh.is_creator());
        let stats = fresh.stats().unwrap();
        assert_eq!(stats.cursor, 0);
        assert_eq!(stats.len, 0);
        assert_eq!(fresh.lookup(42).unwrap(), None);
        fresh.detach(true).unwrap();
    }

    #[test]
    fn test_exact_size_value_round_trips() {
        let table = small("exact", 4, 4);
        let exact = vec![b'e'; VALUE_SIZE];
        table.insert(1, &exact).unwrap();
        let got = table.lookup(1).unwrap().unwrap();
        assert!(got.is_full());
        assert_eq!(got.as_bytes(), &exact[..]);

        table.insert(2, vec![b'l'; VALUE_SIZE + 1]).unwrap();
        assert_eq!(table.lookup(2).unwrap().unwrap().len(), VALUE_SIZE);
        table.detach(true).unwrap();
    }

    #[test]
    fn test_second_handle_sees_inserts() {
        let first = small("visible", 8, 16);
        let second = ShmTable::attach_with(first.name(), *first.config()).unwrap();
        assert!(!second.is_creator());

        first.insert(7, "from first").unwrap();
        assert_eq!(second.lookup(7).unwrap().unwrap(), "from first");
        second.insert(8, "from second").unwrap();
        assert_eq!(first.lookup(8).unwrap().unwrap(), "from second");
        assert_eq!(second.locate(7).unwrap(), first.locate(7).unwrap());

        second.detach(false).unwrap();
        assert_eq!(first.len().unwrap(), 2);
        first.detach(true).unwrap();
    }

    #[test]
    fn test_layout_mismatch_is_rejected() {
        let table = small("mismatch", 8, 16);
        let err = ShmTable::attach_with(table.name(), TableConfig::new(8, 32)).unwrap_err();
        assert!(matches!(err, AttachError::LayoutMismatch { .. }));
        let err = ShmTable::attach_with(table.name(), TableConfig::new(4, 16)).unwrap_err();
        assert!(matches!(err, AttachError::LayoutMismatch { .. }));
        table.detach(true).unwrap();
    }

    #[test]
    fn test_destroyed_table_invalidates_other_handles() {
        let first = small("destroyed", 8, 16);
        let second = ShmTable::attach_with(first.name(), *first.config()).unwrap();
        first.insert(1, "a").unwrap();

        first.detach(true).unwrap();
        assert_eq!(
            second.lookup(1),
            Err(TableError::InvalidHandle {
                name: second.name().to_string()
            })
        );
        second.detach(false).unwrap();
    }

    #[test]
    fn test_stale_unlink_keeps_newer_table() {
        let config = TableConfig::new(8, 16);
        let a = small("stale", 8, 16);
        let b = ShmTable::attach_with(a.name(), config).unwrap();
        let name = a.name().to_string();
        a.detach(true).unwrap();

        let c = ShmTable::attach_with(&name, config).unwrap();
        assert!(c.is_creator());
        c.insert(1, "kept").unwrap();

        // `b` still maps the destroyed table; detaching it must leave the
        // names of the new one alone.
        b.detach(true).unwrap();

        let d = ShmTable::attach_with(&name, config).unwrap();
        assert!(!d.is_creator());
        assert_eq!(d.lookup(1).unwrap().unwrap(), "kept");
        d.detach(false).unwrap();
        c.detach(true).unwrap();
    }

    #[test]
    fn test_longest_name_attaches() {
        let longest = "p".repeat(crate::config::MAX_NAME_LEN);
        let _ = ShmTable::unlink(&longest);
        let table = ShmTable::attach_with(&longest, TableConfig::new(4, 4)).unwrap();
        table.insert(1, "long").unwrap();
        table.detach(true).unwrap();

        let too_long = "p".repeat(crate::config::MAX_NAME_LEN + 1);
        assert!(matches!(
            ShmTable::attach_with(&too_long, TableConfig::new(4, 4)),
            Err(AttachError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_entries_grouped_by_bucket() {
        let table = small("entries", 4, 16);
        for key in [3u64, 1, 5, 4] {
            table.insert(key, key.to_string()).unwrap();
        }
        let keys: Vec<_> = table
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| (e.bucket, e.key))
            .collect();
        assert_eq!(keys, vec![(0, 4), (1, 5), (1, 1), (3, 3)]);
        table.detach(true).unwrap();
    }

    #[test]
    fn test_invalid_config_and_name() {
        assert!(matches!(
            ShmTable::attach_with(&unique("zero"), TableConfig::new(0, 4)),
            Err(AttachError::InvalidConfig(_))
        ));
        assert!(matches!(
            ShmTable::attach("bad/name"),
            Err(AttachError::InvalidName { .. })
        ));
    }
}
