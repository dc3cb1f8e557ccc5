//! Durable journals backing a task log.
//!
//! A journal is an append-only sequence of [`JournalRecord`]s. `FileJournal`
//! stores length-prefixed bincode frames and syncs after each record, so a record
//! acknowledged by `append` survives a process restart.

use super::types::JournalRecord;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Storage behind a task log. Called only from inside the log's writer section.
pub trait Journal: Send {
    fn append(&mut self, record: &JournalRecord) -> Result<()>;

    /// Reads back every record in write order.
    fn replay(&mut self) -> Result<Vec<JournalRecord>>;

    /// Atomically replaces the journal contents with `records`.
    fn rewrite(&mut self, records: &[JournalRecord]) -> Result<()>;
}

/// File-backed journal: `[u32 little-endian length][bincode record]` frames.
pub struct FileJournal {
    path: PathBuf,
    file: File,
}

impl FileJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating journal directory {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .with_context(|| format!("opening journal {}", path.display()))?;

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode_frame(record: &JournalRecord) -> Result<Vec<u8>> {
        let body = bincode::serialize(record)?;
        let len = u32::try_from(body.len()).context("journal record larger than 4 GiB")?;
        let mut frame = Vec::with_capacity(body.len() + 4);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

impl Journal for FileJournal {
    fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let frame = Self::encode_frame(record)?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn replay(&mut self) -> Result<Vec<JournalRecord>> {
        let mut bytes = Vec::new();
        File::open(&self.path)?.read_to_end(&mut bytes)?;

        let mut records = Vec::new();
        let mut offset = 0usize;

        while offset < bytes.len() {
            let Some(header) = bytes.get(offset..offset + 4) else {
                break;
            };
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let Some(body) = bytes.get(offset + 4..offset + 4 + len) else {
                break;
            };
            match bincode::deserialize::<JournalRecord>(body) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        "Corrupt journal frame at offset {} in {}: {}",
                        offset,
                        self.path.display(),
                        e
                    );
                    break;
                }
            }
            offset += 4 + len;
        }

        // A crash mid-write leaves a torn frame at the tail; drop it so later
        // appends start on a frame boundary.
        if offset < bytes.len() {
            tracing::warn!(
                "Truncating {} trailing bytes of torn journal frame in {}",
                bytes.len() - offset,
                self.path.display()
            );
            self.file.set_len(offset as u64)?;
            self.file.sync_data()?;
        }

        Ok(records)
    }

    fn rewrite(&mut self, records: &[JournalRecord]) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = File::create(&tmp_path)
                .with_context(|| format!("creating {}", tmp_path.display()))?;
            for record in records {
                tmp.write_all(&Self::encode_frame(record)?)?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        self.file = OpenOptions::new()
            .append(true)
            .read(true)
            .open(&self.path)?;

        Ok(())
    }
}

/// In-process journal. Clones share the same records, which lets tests "restart"
/// a log by reopening it over a clone.
#[derive(Clone, Default)]
pub struct MemoryJournal {
    records: Arc<Mutex<Vec<JournalRecord>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail (or succeed again), simulating
    /// unavailable storage.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn records(&self) -> Vec<JournalRecord> {
        self.records.lock().clone()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("storage unavailable");
        }
        Ok(())
    }
}

impl Journal for MemoryJournal {
    fn append(&mut self, record: &JournalRecord) -> Result<()> {
        self.check_writable()?;
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn replay(&mut self) -> Result<Vec<JournalRecord>> {
        Ok(self.records.lock().clone())
    }

    fn rewrite(&mut self, records: &[JournalRecord]) -> Result<()> {
        self.check_writable()?;
        *self.records.lock() = records.to_vec();
        Ok(())
    }
}
