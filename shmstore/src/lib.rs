//! A fixed-capacity `u64 -> bytes` hash table shared between processes.
//!
//! The table lives in two named POSIX shared memory objects, `<name>hash`
//! (bucket heads) and `<name>data` (the entry arena). Chains and the free
//! list are linked by arena indices rather than pointers, so every process
//! can map the segments wherever it likes. The first process to attach under
//! a name creates and initializes the table; later ones map it as is.
//!
//! - [`ShmTable`]: the handle; insert/lookup/delete/traverse, detach/unlink.
//! - [`TableConfig`]: bucket count and entry capacity, fixed at creation.
//! - [`Value`]: an owned copy of a stored value (at most [`VALUE_SIZE`]
//!   bytes, length carried explicitly).

mod arena;
pub mod config;
mod engine;
pub mod error;
mod index;
pub mod layout;
mod lock;
mod region;
pub mod segment;
mod storage;
mod table;
mod value;

pub use arena::Location;
pub use config::{DEFAULT_BUCKET_COUNT, DEFAULT_ENTRY_CAPACITY, TableConfig};
pub use engine::TableStats;
pub use error::{AttachError, DetachError, TableError};
pub use index::bucket_of;
pub use layout::VALUE_SIZE;
pub use storage::segment_names;
pub use table::{BucketEntry, ShmTable};
pub use value::Value;
