//! Scalar metric sinks
//!
//! Training emits named groups of scalars ("train", "validation") tagged with
//! the global step. `SummaryWriter` appends them as JSON lines under the
//! session's log directory; `MemorySink` keeps them in memory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// File name of the scalar log inside a session's log directory
pub const SCALARS_FILE: &str = "scalars.jsonl";

pub trait MetricsSink {
    fn add_scalars(&mut self, group: &str, scalars: &[(&str, f64)], step: u64) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Flush and release the underlying resource. Further writes are an error.
    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub group: String,
    pub step: u64,
    /// Seconds since the Unix epoch
    pub wall_time: f64,
    pub scalars: BTreeMap<String, f64>,
}

impl ScalarRecord {
    fn new(group: &str, scalars: &[(&str, f64)], step: u64) -> Self {
        Self {
            group: group.to_string(),
            step,
            wall_time: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            scalars: scalars
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
        }
    }
}

/// Appends scalar records to `<log_dir>/scalars.jsonl`.
pub struct SummaryWriter {
    log_dir: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl SummaryWriter {
    pub fn new(log_dir: impl AsRef<Path>) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

        let path = log_dir.join(SCALARS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open scalar log {}", path.display()))?;

        tracing::debug!("Writing training stats to {}", path.display());
        Ok(Self {
            log_dir,
            writer: Some(BufWriter::new(file)),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Read back every record in a log directory.
    pub fn read_records(log_dir: impl AsRef<Path>) -> Result<Vec<ScalarRecord>> {
        let path = log_dir.as_ref().join(SCALARS_FILE);
        let file = File::open(&path)
            .with_context(|| format!("Failed to open scalar log {}", path.display()))?;

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl MetricsSink for SummaryWriter {
    fn add_scalars(&mut self, group: &str, scalars: &[(&str, f64)], step: u64) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .context("Summary writer already closed")?;
        let record = ScalarRecord::new(group, scalars, step);
        serde_json::to_writer(&mut *writer, &record)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

impl Drop for SummaryWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close summary writer: {}", e);
        }
    }
}

/// Keeps records in memory; clones share the same record list.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<ScalarRecord>>>,
    flushes: Arc<Mutex<usize>>,
    closed: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ScalarRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Records of one group, in emission order
    pub fn group(&self, group: &str) -> Vec<ScalarRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.group == group)
            .collect()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.lock().map(|f| *f).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().map(|c| *c).unwrap_or_default()
    }
}

impl MetricsSink for MemorySink {
    fn add_scalars(&mut self, group: &str, scalars: &[(&str, f64)], step: u64) -> Result<()> {
        if self.is_closed() {
            anyhow::bail!("Memory sink already closed");
        }
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory sink lock poisoned"))?;
        records.push(ScalarRecord::new(group, scalars, step));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut flushes = self
            .flushes
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory sink lock poisoned"))?;
        *flushes += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        let mut closed = self
            .closed
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory sink lock poisoned"))?;
        *closed = true;
        Ok(())
    }
}
