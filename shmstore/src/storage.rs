use tracing::{debug, warn};

use crate::config::{MAX_NAME_LEN, TableConfig};
use crate::error::{AttachError, DetachError};
use crate::layout::{data_segment_size, index_segment_size};
use crate::lock::{ControlBlock, SegmentState};
use crate::segment::Segment;

const INDEX_SUFFIX: &str = "hash";
const DATA_SUFFIX: &str = "data";

/// Attempts at attaching while the table keeps getting destroyed underneath.
const ATTACH_ATTEMPTS: u32 = 8;

/// The pair of shared memory segments backing one table.
pub(crate) struct TableStorage {
    pub index: Segment,
    pub data: Segment,
}

/// Object names of the index and data segments of table `name`.
pub fn segment_names(name: &str) -> Result<(String, String), AttachError> {
    let invalid = |reason| AttachError::InvalidName {
        name: name.to_string(),
        reason,
    };
    let base = name.strip_prefix('/').unwrap_or(name);
    if base.is_empty() {
        return Err(invalid("name is empty"));
    }
    if base.len() > MAX_NAME_LEN {
        return Err(invalid("name is longer than 251 bytes"));
    }
    if base.contains('/') {
        return Err(invalid("name contains '/'"));
    }
    if base.contains('\0') {
        return Err(invalid("name contains a NUL byte"));
    }
    Ok((
        format!("/{base}{INDEX_SUFFIX}"),
        format!("/{base}{DATA_SUFFIX}"),
    ))
}

impl TableStorage {
    /// Opens or creates both segments of table `name`.
    ///
    /// Whoever creates the index segment also (re)creates the data segment
    /// and is responsible for initializing both; everybody else waits for
    /// the creator to publish the index before opening the data segment.
    pub fn attach(name: &str, config: &TableConfig) -> Result<Self, AttachError> {
        let (index_name, data_name) = segment_names(name)?;
        let index_size = index_segment_size(config);
        let data_size = data_segment_size(config);

        for _ in 0..ATTACH_ATTEMPTS {
            let mut index = Segment::open_or_create(&index_name, index_size)?;

            if index.created() {
                // A data segment without an index is a leftover of a table
                // whose unlink was interrupted; it is never reused.
                if let Err(e) = Segment::unlink(&data_name) {
                    warn!(error = %e, "failed to remove stale data segment");
                }
                let data = match Segment::open_or_create(&data_name, data_size) {
                    Ok(data) => data,
                    Err(e) => {
                        drop(index);
                        if let Err(unlink_err) = Segment::unlink(&index_name) {
                            warn!(error = %unlink_err, "failed to remove index segment after failed attach");
                        }
                        return Err(e);
                    }
                };
                return Ok(Self { index, data });
            }

            let control = unsafe { ControlBlock::new(index.base()) };
            match control.wait_published(&index_name)? {
                SegmentState::Destroyed => {
                    debug!(table = name, "table destroyed while attaching, retrying");
                    continue;
                }
                _ => {
                    let data = Segment::open_existing(&data_name, data_size)?;
                    return Ok(Self { index, data });
                }
            }
        }

        Err(AttachError::NotReady {
            segment: index_name,
        })
    }

    /// Whether this process created the table.
    pub fn created(&self) -> bool {
        self.index.created()
    }

    /// Removes both named objects of table `name`.
    pub fn unlink(name: &str) -> Result<(), DetachError> {
        let (index_name, data_name) =
            segment_names(name).map_err(|_| DetachError::Unlink {
                segment: name.to_string(),
                source: nix::errno::Errno::EINVAL,
            })?;
        // Data first: once the index name is gone a new table may be created
        // under the same name, and its data segment must not be removed.
        let data = Segment::unlink(&data_name);
        let index = Segment::unlink(&index_name);
        first_failure([data, index])
    }

    /// Unmaps and closes both segments, then optionally removes them. Every
    /// step is attempted; the first failure is returned.
    pub fn detach(self, unlink: bool) -> Result<(), DetachError> {
        let Self { index, data } = self;
        let index_name = index.name().to_string();
        let data_name = data.name().to_string();

        let mut results = vec![index.close(), data.close()];
        if unlink {
            results.push(Segment::unlink(&data_name));
            results.push(Segment::unlink(&index_name));
        }
        first_failure(results)
    }
}

fn first_failure(
    results: impl IntoIterator<Item = Result<(), DetachError>>,
) -> Result<(), DetachError> {
    let mut first = None;
    for result in results {
        if let Err(e) = result {
            warn!(error = %e, "teardown step failed");
            first.get_or_insert(e);
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
