//! Instance journal
//!
//! Durable record of every instance ever created, stored as a JSON array at
//! a fixed path. Entries are never removed; restore and provision only append.
//! Every write replaces the whole file through a temp file and rename, so a
//! crash never leaves a half-written journal behind.

use crate::error::JournalError;
use crate::instance::Instance;
use parking_lot::Mutex;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct Journal {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every entry in file order. A missing or blank file is an empty journal
    pub fn load(&self) -> Result<Vec<Instance>, JournalError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Journal does not exist yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content).map_err(|source| JournalError::CorruptData {
            path: self.path.clone(),
            source,
        })
    }

    /// Append one entry
    pub fn append(&self, entry: &Instance) -> Result<(), JournalError> {
        self.append_all(std::slice::from_ref(entry))
    }

    /// Append entries in order as one write
    pub fn append_all(&self, entries: &[Instance]) -> Result<(), JournalError> {
        if entries.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        let mut all = self.load()?;
        all.extend_from_slice(entries);
        self.write(&all)?;

        info!(
            path = %self.path.display(),
            appended = entries.len(),
            total = all.len(),
            "Journal updated"
        );
        Ok(())
    }

    /// Overwrite the journal with exactly `entries`
    pub fn replace_all(&self, entries: &[Instance]) -> Result<(), JournalError> {
        let _guard = self.write_lock.lock();
        self.write(entries)
    }

    fn write(&self, entries: &[Instance]) -> Result<(), JournalError> {
        let content = serde_json::to_string_pretty(entries).map_err(|source| JournalError::Serialize {
            path: self.path.clone(),
            source,
        })?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;

        // Temp file in the same directory so the rename stays on one filesystem
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.io_error(e))?;
        tmp.write_all(content.as_bytes()).map_err(|e| self.io_error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_error(e.error))?;
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> JournalError {
        JournalError::IoFailure {
            path: self.path.clone(),
            source,
        }
    }
}
