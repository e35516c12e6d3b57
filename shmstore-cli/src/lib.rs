//! Command-line front end for [`shmstore`]: reads `<key> <value>` records
//! from a file and inserts, deletes, looks up or dumps them against a named
//! shared table.

pub mod ops;
pub mod parser;

pub use ops::{Operation, Outcome, dump, run, run_and_detach};
pub use parser::{MAX_RECORDS, ParseError, Record, parse_file, parse_str};
