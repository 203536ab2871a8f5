//! JSONL journal writer with daily file rotation.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{NaiveDate, Utc};

use super::{AuditEntry, AuditLogger};
use crate::{AppError, Result};

struct OpenFile {
    date: NaiveDate,
    writer: BufWriter<File>,
}

/// Appends one JSON object per line to `<dir>/journal-YYYY-MM-DD.jsonl`.
///
/// A new file is opened when the UTC date changes between writes.
pub struct JsonlAuditWriter {
    dir: PathBuf,
    current: Mutex<Option<OpenFile>>,
}

impl JsonlAuditWriter {
    /// Create a writer rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be created.
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::Io(format!(
                "failed to create journal directory {}: {err}",
                dir.display()
            ))
        })?;
        Ok(Self {
            dir,
            current: Mutex::new(None),
        })
    }

    /// Path of the journal file for `date`.
    #[must_use]
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        file_for(&self.dir, date)
    }
}

fn file_for(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("journal-{date}.jsonl"))
}

fn open(dir: &Path, date: NaiveDate) -> Result<BufWriter<File>> {
    let path = file_for(dir, date);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| AppError::Io(format!("failed to open journal {}: {err}", path.display())))?;
    Ok(BufWriter::new(file))
}

impl AuditLogger for JsonlAuditWriter {
    fn log_entry(&self, entry: AuditEntry) -> Result<()> {
        let line = serde_json::to_string(&entry)?;
        let today = Utc::now().date_naive();

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let file = match current.take() {
            Some(file) if file.date == today => file,
            _ => OpenFile {
                date: today,
                writer: open(&self.dir, today)?,
            },
        };
        let file = current.insert(file);

        writeln!(file.writer, "{line}")
            .and_then(|()| file.writer.flush())
            .map_err(|err| AppError::Io(format!("journal write failed: {err}")))
    }
}
