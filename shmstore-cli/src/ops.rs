use std::io::Write;

use anyhow::{Context, Result};
use shmstore::{ShmTable, TableError};
use tracing::{debug, warn};

use crate::parser::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Delete,
    Lookup,
    /// Print every entry grouped by bucket.
    Dump,
}

impl Operation {
    /// Maps the numeric operation argument. Anything that is not 1, 2 or 3,
    /// including text that is not a number at all, selects a dump.
    pub fn from_code(code: &str) -> Self {
        match code.trim().parse::<i64>() {
            Ok(1) => Operation::Insert,
            Ok(2) => Operation::Delete,
            Ok(3) => Operation::Lookup,
            _ => Operation::Dump,
        }
    }
}

/// Per-key problems that were reported but did not stop the run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub failed_inserts: usize,
    pub missing_deletes: usize,
}

/// Applies `operation` to `table` for every record, writing results to `out`.
///
/// Capacity failures and deletes of absent keys are counted in the outcome;
/// any other table error aborts the run.
pub fn run(
    table: &ShmTable,
    operation: Operation,
    records: &[Record],
    out: &mut impl Write,
) -> Result<Outcome> {
    debug!(?operation, records = records.len(), "running operation");
    let mut outcome = Outcome::default();
    match operation {
        Operation::Insert => {
            for record in records {
                match table.insert(record.key, &record.value) {
                    Ok(_) => {}
                    Err(err @ TableError::CapacityExceeded { .. }) => {
                        warn!(key = record.key, "insert failed: {err}");
                        outcome.failed_inserts += 1;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Operation::Delete => {
            for record in records {
                if table.delete(record.key)?.is_none() {
                    warn!(key = record.key, "delete of absent key");
                    outcome.missing_deletes += 1;
                }
            }
        }
        Operation::Lookup => {
            for record in records {
                match table.lookup(record.key)? {
                    Some(value) => writeln!(out, "key: {} data: {value}", record.key)?,
                    None => writeln!(out, "Key {} NOT FOUND", record.key)?,
                }
            }
        }
        Operation::Dump => dump(table, out)?,
    }
    Ok(outcome)
}

/// Runs `operation`, then detaches `table` (unlinking it if asked) whether
/// or not the operation succeeded. The operation's error takes precedence.
pub fn run_and_detach(
    table: ShmTable,
    operation: Operation,
    records: &[Record],
    out: &mut impl Write,
    unlink: bool,
) -> Result<Outcome> {
    let result = run(&table, operation, records, out);
    let flushed = out.flush();

    let name = table.name().to_string();
    let detached = table
        .detach(unlink)
        .with_context(|| format!("failed to detach shared table {name:?}"));

    let outcome = result?;
    flushed?;
    detached?;
    Ok(outcome)
}

/// Writes `Bucket: B` followed by one tab-indented line per entry, for every
/// non-empty bucket in ascending order.
pub fn dump(table: &ShmTable, out: &mut impl Write) -> Result<()> {
    let mut current = None;
    for entry in table.entries()? {
        if current != Some(entry.bucket) {
            writeln!(out, "Bucket: {}", entry.bucket)?;
            current = Some(entry.bucket);
        }
        writeln!(out, "\tkey: {} data: {}", entry.key, entry.value)?;
    }
    Ok(())
}
