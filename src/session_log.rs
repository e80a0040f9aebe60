//! Append-only CSV log holding the joined records of one consumer session.
//!
//! Each row is encoded in memory and written to the file in one go. If the write or the
//! sync fails the file is cut back to its last good length, so a failed append never
//! leaves a torn row behind and a retried record is written exactly once.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::domain::EnergyRecord;

pub const HEADER: [&str; 4] = ["timestamp", "meter_power_kw", "pv_power_kw", "net_power_kw"];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create session log {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write session log: {0}")]
    Write(#[from] csv::Error),
    #[error("Failed to flush session log: {0}")]
    Flush(#[from] std::io::Error),
    #[error("Session log is closed")]
    Closed,
}

pub struct SessionLog {
    path: PathBuf,
    file: Option<File>,
    /// Length of the file up to the last complete row
    committed_len: u64,
    records_written: u64,
}

impl SessionLog {
    /// `<data_dir>/<PV_ID>/energy_data_<epoch>.csv`
    pub fn session_path(data_dir: &Path, pv_id: &str, started_epoch: i64) -> PathBuf {
        data_dir
            .join(pv_id.to_uppercase())
            .join(format!("energy_data_{started_epoch}.csv"))
    }

    /// Create (or truncate) the log and write the header row
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let create_err = |source| StorageError::Create {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(create_err)?;
            }
        }
        let mut file = File::create(&path).map_err(create_err)?;

        let header = encode_row(|writer| writer.write_record(HEADER))?;
        file.write_all(&header)?;
        file.sync_data()?;

        info!(path = %path.display(), "session log initialised");
        Ok(Self {
            path,
            file: Some(file),
            committed_len: header.len() as u64,
            records_written: 0,
        })
    }

    /// Append one record and push it through to the disk before returning.
    ///
    /// On error nothing of the record remains in the file.
    pub fn append(&mut self, record: &EnergyRecord) -> Result<(), StorageError> {
        let file = self.file.as_mut().ok_or(StorageError::Closed)?;
        let row = encode_row(|writer| writer.serialize(record))?;

        let written = file.write_all(&row).and_then(|()| file.sync_data());
        if let Err(e) = written {
            self.rollback();
            return Err(e.into());
        }

        self.committed_len += row.len() as u64;
        self.records_written += 1;
        debug!(records = self.records_written, "record appended");
        Ok(())
    }

    /// Cut the file back to the last complete row on a fresh handle
    fn rollback(&mut self) {
        let committed_len = self.committed_len;
        let repaired = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .and_then(|mut file| {
                file.set_len(committed_len)?;
                file.seek(SeekFrom::Start(committed_len))?;
                file.sync_data()?;
                Ok(file)
            });

        match repaired {
            Ok(file) => {
                self.file = Some(file);
                warn!(path = %self.path.display(), committed_len, "partial row discarded");
            }
            Err(e) => error!(
                error = %e,
                path = %self.path.display(),
                "failed to discard partial row"
            ),
        }
    }

    /// Sync and release the file handle. Returns `false` if it was already closed.
    pub fn close(&mut self) -> Result<bool, StorageError> {
        let Some(file) = self.file.take() else {
            return Ok(false);
        };
        file.sync_all()?;
        info!(path = %self.path.display(), records = self.records_written, "session log closed");
        Ok(true)
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }
}

/// Encode a single CSV row into memory
fn encode_row(
    write: impl FnOnce(&mut csv::Writer<Vec<u8>>) -> Result<(), csv::Error>,
) -> Result<Vec<u8>, StorageError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    write(&mut writer)?;
    writer
        .into_inner()
        .map_err(|e| StorageError::Flush(e.into_error()))
}
