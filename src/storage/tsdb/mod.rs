//! Embedded label-indexed time-series engine.
//!
//! This module provides a small append-only series database:
//! - Series identified by a sorted label set
//! - Transactional appenders (commit or rollback as a whole)
//! - Equality matcher queries returning series snapshots
//! - Durability through a write-ahead log replayed on open
//! - Sealing: finished series move from memory into immutable block files and
//!   the log is checkpointed down to what is still in memory

mod block;
mod wal;

use crate::core::{HeapwatchError, Result};
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use wal::{Wal, WalBatch};

const WAL_FILE: &str = "wal.log";
const BLOCKS_DIR: &str = "blocks";

/// Sorted set of label name/value pairs identifying one series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a label, builder style.
    pub fn with<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Selects series whose label `name` equals `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matcher {
    name: String,
    value: String,
}

impl Matcher {
    pub fn equal<K: Into<String>, V: Into<String>>(name: K, value: V) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        labels.get(&self.name) == Some(self.value.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Nanoseconds since the Unix epoch
    pub timestamp: i64,
    pub value: f64,
}

/// Snapshot of one series handed out by queries.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone, Copy)]
pub struct TsdbOptions {
    /// fsync the WAL after every commit
    pub sync_write: bool,
}

/// In-memory head holding every series with its postings index.
#[derive(Default)]
struct Head {
    series: Vec<Series>,
    by_labels: AHashMap<Labels, usize>,
    postings: AHashMap<(String, String), Vec<usize>>,
}

impl Head {
    fn last_timestamp(&self, labels: &Labels) -> Option<i64> {
        self.by_labels
            .get(labels)
            .and_then(|&idx| self.series[idx].samples.last())
            .map(|s| s.timestamp)
    }

    /// Rejects samples that do not strictly advance their series, and any
    /// sample for a series that was already sealed.
    fn validate(&self, batch: &WalBatch, blocks: &Blocks) -> Result<()> {
        for (labels, samples) in &batch.series {
            if blocks.sealed.contains_key(labels) {
                return Err(HeapwatchError::storage(format!("series {labels:?} is sealed")));
            }
            let mut last = self.last_timestamp(labels);
            for sample in samples {
                if let Some(prev) = last {
                    if sample.timestamp <= prev {
                        return Err(HeapwatchError::storage(format!(
                            "out of order sample at {} (last {}) for series {:?}",
                            sample.timestamp, prev, labels
                        )));
                    }
                }
                last = Some(sample.timestamp);
            }
        }
        Ok(())
    }

    fn apply(&mut self, batch: WalBatch) {
        for (labels, samples) in batch.series {
            let idx = match self.by_labels.get(&labels) {
                Some(&idx) => idx,
                None => self.insert_series(labels),
            };
            self.series[idx].samples.extend(samples);
        }
    }

    fn insert_series(&mut self, labels: Labels) -> usize {
        let idx = self.series.len();
        for (name, value) in labels.iter() {
            self.postings
                .entry((name.to_string(), value.to_string()))
                .or_default()
                .push(idx);
        }
        self.by_labels.insert(labels.clone(), idx);
        self.series.push(Series {
            labels,
            samples: Vec::new(),
        });
        idx
    }

    /// Removes and returns every series matching all `matchers`.
    fn take_matching(&mut self, matchers: &[Matcher]) -> Vec<Series> {
        let (taken, kept): (Vec<Series>, Vec<Series>) = std::mem::take(&mut self.series)
            .into_iter()
            .partition(|series| matchers.iter().all(|m| m.matches(&series.labels)));

        *self = Head::default();
        for series in kept {
            let idx = self.insert_series(series.labels);
            self.series[idx].samples = series.samples;
        }
        taken
    }

    fn checkpoint(&self) -> WalBatch {
        WalBatch {
            series: self
                .series
                .iter()
                .map(|s| (s.labels.clone(), s.samples.clone()))
                .collect(),
        }
    }

    fn select(&self, matchers: &[Matcher]) -> Vec<Series> {
        let candidates: Vec<usize> = match matchers.first() {
            None => (0..self.series.len()).collect(),
            Some(first) => self
                .postings
                .get(&(first.name.clone(), first.value.clone()))
                .cloned()
                .unwrap_or_default(),
        };

        candidates
            .into_iter()
            .map(|idx| &self.series[idx])
            .filter(|series| matchers.iter().all(|m| m.matches(&series.labels)))
            .cloned()
            .collect()
    }
}

/// Label index of the sealed series. Samples stay in the block files.
#[derive(Default)]
struct Blocks {
    dir: PathBuf,
    sealed: AHashMap<Labels, u64>,
    next_id: u64,
}

impl Blocks {
    fn load(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let mut blocks = Blocks {
            dir,
            ..Blocks::default()
        };
        for id in block::scan(&blocks.dir)? {
            for labels in block::read_labels(&block::block_path(&blocks.dir, id))? {
                blocks.sealed.insert(labels, id);
            }
            blocks.next_id = id + 1;
        }
        Ok(blocks)
    }

    fn select(&self, matchers: &[Matcher]) -> Result<Vec<Series>> {
        let mut ids: Vec<u64> = self
            .sealed
            .iter()
            .filter(|(labels, _)| matchers.iter().all(|m| m.matches(labels)))
            .map(|(_, &id)| id)
            .collect();
        ids.sort_unstable();
        ids.dedup();

        let mut selected = Vec::new();
        for id in ids {
            let series = block::read_series(&block::block_path(&self.dir, id))?;
            selected.extend(
                series
                    .into_iter()
                    .filter(|series| matchers.iter().all(|m| m.matches(&series.labels))),
            );
        }
        Ok(selected)
    }
}

/// Series database rooted in one directory.
pub struct TimeSeriesDb {
    head: RwLock<Head>,
    blocks: RwLock<Blocks>,
    wal: Mutex<Option<Wal>>,
}

impl TimeSeriesDb {
    /// Opens the database: loads the block index, then replays the
    /// write-ahead log into memory.
    pub fn open(dir: &Path, options: TsdbOptions) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir)?;
        let blocks = Blocks::load(dir.join(BLOCKS_DIR))?;
        let (wal, batches) = Wal::open(&dir.join(WAL_FILE), options.sync_write)?;

        let mut head = Head::default();
        let replayed = batches.len();
        for mut batch in batches {
            // Sealed before the log was checkpointed.
            batch.series.retain(|(labels, _)| !blocks.sealed.contains_key(labels));
            head.apply(batch);
        }
        tracing::debug!(
            "Opened time-series database at {} ({} batches, {} series in memory, {} sealed)",
            dir.display(),
            replayed,
            head.series.len(),
            blocks.sealed.len()
        );

        Ok(Arc::new(Self {
            head: RwLock::new(head),
            blocks: RwLock::new(blocks),
            wal: Mutex::new(Some(wal)),
        }))
    }

    /// Starts a new transaction.
    pub fn appender(self: &Arc<Self>) -> Appender {
        Appender {
            db: Arc::clone(self),
            pending: BTreeMap::new(),
        }
    }

    /// Returns snapshots of every series matching all `matchers`, ordered by
    /// labels. Sealed series are read back from their blocks.
    pub fn select(&self, matchers: &[Matcher]) -> Result<Vec<Series>> {
        // Both locks are held so a concurrent seal is seen entirely or not at all.
        let head = self.head.read();
        let blocks = self.blocks.read();

        let mut selected = head.select(matchers);
        selected.extend(blocks.select(matchers)?);
        selected.sort_by(|a, b| a.labels.cmp(&b.labels));
        Ok(selected)
    }

    pub fn series_count(&self) -> usize {
        self.head.read().series.len() + self.blocks.read().sealed.len()
    }

    /// Series currently held in memory
    pub fn head_series_count(&self) -> usize {
        self.head.read().series.len()
    }

    /// Moves every in-memory series matching all `matchers` into a new block
    /// and checkpoints the log. Sealed series accept no further samples.
    /// Returns the number of series sealed.
    pub fn seal(&self, matchers: &[Matcher]) -> Result<usize> {
        let mut guard = self.wal.lock();
        let wal = guard
            .as_mut()
            .ok_or_else(|| HeapwatchError::storage("time-series database is closed"))?;
        let mut head = self.head.write();
        let mut blocks = self.blocks.write();

        let taken = head.take_matching(matchers);
        if taken.is_empty() {
            return Ok(0);
        }

        let id = blocks.next_id;
        let path = match block::write_block(&blocks.dir, id, &taken) {
            Ok(path) => path,
            Err(e) => {
                head.apply(WalBatch {
                    series: taken.into_iter().map(|s| (s.labels, s.samples)).collect(),
                });
                return Err(e);
            }
        };
        blocks.next_id = id + 1;
        let count = taken.len();
        for series in taken {
            blocks.sealed.insert(series.labels, id);
        }

        // The block is durable, so a failed checkpoint only leaves sealed
        // samples in the log; replay skips them.
        if let Err(e) = wal.rewrite(&head.checkpoint()) {
            tracing::warn!("Failed to checkpoint WAL {}: {}", wal.path().display(), e);
        }
        tracing::debug!(
            "Sealed {} series into {} (WAL now {} bytes)",
            count,
            path.display(),
            wal.size_bytes()
        );
        Ok(count)
    }

    /// Flushes and closes the log. Later commits fail.
    pub fn close(&self) -> Result<()> {
        if let Some(mut wal) = self.wal.lock().take() {
            wal.sync()?;
            tracing::debug!("Closed WAL {}", wal.path().display());
        }
        Ok(())
    }

    fn commit(&self, batch: WalBatch) -> Result<()> {
        // WAL order must match head order, so both locks are held together.
        let mut guard = self.wal.lock();
        let wal = guard
            .as_mut()
            .ok_or_else(|| HeapwatchError::storage("time-series database is closed"))?;
        let mut head = self.head.write();
        let blocks = self.blocks.read();

        head.validate(&batch, &blocks)?;
        wal.append(&batch)?;
        head.apply(batch);
        Ok(())
    }
}

/// Pending samples that become visible together on [`Appender::commit`].
pub struct Appender {
    db: Arc<TimeSeriesDb>,
    pending: BTreeMap<Labels, Vec<Sample>>,
}

impl Appender {
    pub fn add(&mut self, labels: Labels, timestamp: i64, value: f64) {
        self.pending
            .entry(labels)
            .or_default()
            .push(Sample { timestamp, value });
    }

    /// Number of pending samples
    pub fn len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Persists and publishes all pending samples, or none of them.
    /// Returns the number of samples committed.
    pub fn commit(self) -> Result<usize> {
        let count = self.len();
        if count == 0 {
            return Ok(0);
        }
        let batch = WalBatch {
            series: self.pending.into_iter().collect(),
        };
        self.db.commit(batch)?;
        Ok(count)
    }

    /// Discards all pending samples.
    pub fn rollback(self) {
        drop(self.pending);
    }
}
