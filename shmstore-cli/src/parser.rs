//! Reader for record files: one `<u64 key> <value>` pair per line.

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

/// Upper bound on records accepted from one file.
pub const MAX_RECORDS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: u64,
    pub value: String,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: invalid key {token:?}")]
    InvalidKey { line: usize, token: String },
    #[error("line {line}: missing value for key {key}")]
    MissingValue { line: usize, key: u64 },
    #[error("more than {MAX_RECORDS} records")]
    TooManyRecords,
}

pub fn parse_file(path: impl AsRef<Path>) -> Result<Vec<Record>, ParseError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_str(&text)
}

/// Parses every line of `text`. Blank lines are skipped; the value is the
/// second space-separated token and anything after it is ignored.
pub fn parse_str(text: &str) -> Result<Vec<Record>, ParseError> {
    let mut records = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            continue;
        }
        if records.len() == MAX_RECORDS {
            return Err(ParseError::TooManyRecords);
        }
        records.push(parse_line(index + 1, line)?);
    }
    Ok(records)
}

fn parse_line(line: usize, text: &str) -> Result<Record, ParseError> {
    let mut tokens = text.split(' ').filter(|t| !t.is_empty());
    // Callers skip blank lines, so the first token is always present.
    let token = tokens.next().unwrap_or_default();
    let key = token.parse::<u64>().map_err(|_| ParseError::InvalidKey {
        line,
        token: token.to_string(),
    })?;
    let value = tokens.next().ok_or(ParseError::MissingValue { line, key })?;
    Ok(Record {
        key,
        value: value.to_string(),
    })
}
