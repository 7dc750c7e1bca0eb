//! Append-only CSV outcome ledgers.
//!
//! The task writes one row per outcome. The runner only counts rows, taking a
//! snapshot before and after the session to cross-check in-memory counters.

use std::fs::{create_dir_all, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

/// Ledger I/O failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Reading or writing the file failed.
    #[error("ledger {path}: {source}")]
    Io {
        /// Ledger file.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// A countable outcome ledger.
pub trait Ledger: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Data rows recorded so far; an absent ledger has zero.
    ///
    /// # Errors
    ///
    /// The ledger exists but cannot be read.
    fn row_count(&self) -> Result<u64, LedgerError>;
}

/// CSV file with a header row.
#[derive(Debug, Clone)]
pub struct CsvLedger {
    name: String,
    path: PathBuf,
    header: Vec<String>,
}

impl CsvLedger {
    /// Ledger at `path` with the given column names.
    pub fn new(name: impl Into<String>, path: impl AsRef<Path>, header: &[&str]) -> Self {
        Self {
            name: name.into(),
            path: path.as_ref().to_path_buf(),
            header: header.iter().map(ToString::to_string).collect(),
        }
    }

    /// File backing this ledger.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Append one row, writing the header first when the file is new.
    ///
    /// # Errors
    ///
    /// The file cannot be created or written.
    pub fn append(&self, fields: &[&str]) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let is_new = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        let mut out = String::new();
        if is_new {
            out.push_str(&encode_row(self.header.iter().map(String::as_str)));
            out.push('\n');
        }
        out.push_str(&encode_row(fields.iter().copied()));
        out.push('\n');
        file.write_all(out.as_bytes()).map_err(|e| self.io_err(e))
    }
}

impl Ledger for CsvLedger {
    fn name(&self) -> &str {
        &self.name
    }

    fn row_count(&self) -> Result<u64, LedgerError> {
        let file = match OpenOptions::new().read(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(self.io_err(e)),
        };
        // Rows are counted over raw bytes: the task may write any encoding, and
        // a newline inside a quoted field does not end the record.
        let mut records = 0_u64;
        let mut in_quotes = false;
        let mut has_content = false;
        for chunk in BufReader::new(file).split(b'\n') {
            let chunk = chunk.map_err(|e| self.io_err(e))?;
            for &byte in &chunk {
                if byte == b'"' {
                    in_quotes = !in_quotes;
                }
            }
            has_content |= chunk.iter().any(|b| !b.is_ascii_whitespace());
            if !in_quotes {
                records += u64::from(has_content);
                has_content = false;
            }
        }
        // An unterminated quote at end of file is still one record.
        records += u64::from(has_content);
        Ok(records.saturating_sub(1))
    }
}

fn encode_row<'a>(fields: impl Iterator<Item = &'a str>) -> String {
    fields
        .map(|field| {
            // One physical line per row keeps row counting exact.
            let field = field.replace(['\r', '\n'], " ");
            if field.contains([',', '"']) {
                format!("\"{}\"", field.replace('"', "\"\""))
            } else {
                field
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Row counts of the outcome ledgers at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    /// Successful application rows.
    pub applied: u64,
    /// Failed application rows.
    pub failed: u64,
}

/// The success and failure ledgers for a task.
#[derive(Clone)]
pub struct LedgerSet {
    /// Successful applications.
    pub applied: Arc<dyn Ledger>,
    /// Failed applications.
    pub failed: Arc<dyn Ledger>,
}

impl std::fmt::Debug for LedgerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerSet")
            .field("applied", &self.applied.name())
            .field("failed", &self.failed.name())
            .finish()
    }
}

/// Default columns for both ledgers.
pub const LEDGER_HEADER: &[&str] = &["timestamp", "session_id", "job_id", "title", "company", "detail"];

impl LedgerSet {
    /// `applied.csv` and `failed.csv` under `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            applied: Arc::new(CsvLedger::new("applied", dir.join("applied.csv"), LEDGER_HEADER)),
            failed: Arc::new(CsvLedger::new("failed", dir.join("failed.csv"), LEDGER_HEADER)),
        }
    }

    /// Count both ledgers.
    ///
    /// # Errors
    ///
    /// Either ledger is unreadable.
    pub fn snapshot(&self) -> Result<LedgerCounts, LedgerError> {
        Ok(LedgerCounts {
            applied: self.applied.row_count()?,
            failed: self.failed.row_count()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_ledger_counts_zero() {
        let dir = tempfile::tempdir().unwrap();
        let set = LedgerSet::in_dir(dir.path());
        assert_eq!(set.snapshot().unwrap(), LedgerCounts::default());
    }

    #[test]
    fn test_append_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = CsvLedger::new("applied", dir.path().join("nested/applied.csv"), &["a", "b"]);
        ledger.append(&["1", "acme, inc"]).unwrap();
        ledger.append(&["2", "multi\nline \"quoted\""]).unwrap();
        assert_eq!(ledger.row_count().unwrap(), 2);

        let raw = std::fs::read_to_string(ledger.path()).unwrap();
        let lines: Vec<_> = raw.lines().collect();
        assert_eq!(lines[0], "a,b");
        assert_eq!(lines[1], "1,\"acme, inc\"");
        assert_eq!(lines[2], "2,\"multi line \"\"quoted\"\"\"");
    }

    #[test]
    fn test_row_count_tolerates_non_utf8_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("applied.csv");
        std::fs::write(&path, b"job,company\n1,Caf\xe9\n2,Acme\n").unwrap();
        let ledger = CsvLedger::new("applied", &path, &["job", "company"]);
        assert_eq!(ledger.row_count().unwrap(), 2);
    }

    #[test]
    fn test_quoted_newline_is_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("applied.csv");
        std::fs::write(
            &path,
            "job,detail\r\n1,\"line1\nline2\"\r\n2,\"said \"\"hi\"\"\nthen left\"\r\n\n3,plain",
        )
        .unwrap();
        let ledger = CsvLedger::new("applied", &path, &["job", "detail"]);
        assert_eq!(ledger.row_count().unwrap(), 3);
    }
}
