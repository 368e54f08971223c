//! Write-ahead log of committed sample batches.
//!
//! Every committed batch becomes one frame: a little-endian `u32` payload
//! length followed by the LZ4 compressed bincode encoding of the batch.
//! On open the log is replayed front to back. A frame that is cut short or
//! fails to decode marks the end of the usable log and everything after it
//! is truncated away.
//!
//! A write that fails midway leaves a partial frame behind. The log remembers
//! the end of its last intact frame and cuts back to it before the next append,
//! so later commits never land behind unreadable bytes.

use super::{Labels, Sample};
use crate::core::{HeapwatchError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const FRAME_HEADER: usize = 4;

/// One atomically committed group of samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct WalBatch {
    pub series: Vec<(Labels, Vec<Sample>)>,
}

pub(crate) struct Wal {
    file: File,
    path: PathBuf,
    sync_write: bool,
    /// Byte length of the intact frames
    end: u64,
    /// Bytes past `end` may hold a partial frame
    torn: bool,
}

impl Wal {
    /// Opens (or creates) the log and returns every intact batch in commit order.
    pub fn open(path: &Path, sync_write: bool) -> Result<(Self, Vec<WalBatch>)> {
        let existing = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let (batches, valid_len) = decode_frames(&existing);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        if valid_len < existing.len() {
            tracing::warn!(
                "Truncating {} trailing bytes of damaged WAL at {}",
                existing.len() - valid_len,
                path.display()
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        let wal = Wal {
            file,
            path: path.to_path_buf(),
            sync_write,
            end: valid_len as u64,
            torn: false,
        };
        Ok((wal, batches))
    }

    /// Appends one batch as a single frame. On error the frame is not part
    /// of the log.
    pub fn append(&mut self, batch: &WalBatch) -> Result<()> {
        let frame = encode_frame(batch)?;
        self.repair()?;

        match self.write_frame(&frame) {
            Ok(()) => {
                self.end += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.torn = true;
                if let Err(cut) = self.repair() {
                    tracing::warn!(
                        "Cannot cut partial frame from WAL {} yet: {}",
                        self.path.display(),
                        cut
                    );
                }
                Err(e.into())
            }
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.file.write_all(frame)?;
        if self.sync_write {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Drops whatever a failed append left past the last intact frame.
    fn repair(&mut self) -> Result<()> {
        if self.torn {
            self.file.set_len(self.end)?;
            self.torn = false;
            tracing::warn!("Cut partial frame from WAL {}", self.path.display());
        }
        Ok(())
    }

    /// Replaces the whole log with a single frame holding `batch`, or with an
    /// empty log when the batch has no series. The new log is complete on disk
    /// before it takes the old one's name.
    pub fn rewrite(&mut self, batch: &WalBatch) -> Result<()> {
        let bytes = if batch.series.is_empty() {
            Vec::new()
        } else {
            encode_frame(batch)?
        };

        let tmp = self.path.with_extension("log.tmp");
        std::fs::write(&tmp, &bytes)?;
        let file = OpenOptions::new().append(true).open(&tmp)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;

        self.file = file;
        self.end = bytes.len() as u64;
        self.torn = false;
        Ok(())
    }

    pub fn size_bytes(&self) -> u64 {
        self.end
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn encode_frame(batch: &WalBatch) -> Result<Vec<u8>> {
    let raw = bincode::serialize(batch)
        .map_err(|e| HeapwatchError::storage(format!("failed to encode WAL batch: {e}")))?;
    let compressed = lz4_flex::compress_prepend_size(&raw);
    let len = u32::try_from(compressed.len())
        .map_err(|_| HeapwatchError::storage("WAL batch exceeds 4GiB"))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER + compressed.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&compressed);
    Ok(frame)
}

/// Decodes consecutive frames, stopping at the first damaged one.
/// Returns the batches and the byte length of the intact prefix.
fn decode_frames(bytes: &[u8]) -> (Vec<WalBatch>, usize) {
    let mut batches = Vec::new();
    let mut offset = 0;

    while bytes.len() - offset >= FRAME_HEADER {
        let mut header = [0u8; FRAME_HEADER];
        header.copy_from_slice(&bytes[offset..offset + FRAME_HEADER]);
        let len = u32::from_le_bytes(header) as usize;

        let start = offset + FRAME_HEADER;
        let Some(payload) = bytes.get(start..start + len) else {
            break;
        };
        let Ok(raw) = lz4_flex::decompress_size_prepended(payload) else {
            break;
        };
        let Ok(batch) = bincode::deserialize::<WalBatch>(&raw) else {
            break;
        };

        batches.push(batch);
        offset = start + len;
    }

    (batches, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn batch(ts: i64) -> WalBatch {
        WalBatch {
            series: vec![(
                Labels::new().with("metric_type", "alloc_bytes"),
                vec![Sample {
                    timestamp: ts,
                    value: ts as f64 * 2.0,
                }],
            )],
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");

        {
            let (mut wal, replayed) = Wal::open(&path, true).unwrap();
            assert!(replayed.is_empty());
            wal.append(&batch(1)).unwrap();
            wal.append(&batch(2)).unwrap();
        }

        let (_, replayed) = Wal::open(&path, false).unwrap();
        assert_eq!(replayed, vec![batch(1), batch(2)]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");

        {
            let (mut wal, _) = Wal::open(&path, false).unwrap();
            wal.append(&batch(1)).unwrap();
        }
        let intact = std::fs::metadata(&path).unwrap().len();

        // Half-written frame: header claims more bytes than exist.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&64u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let (mut wal, replayed) = Wal::open(&path, false).unwrap();
        assert_eq!(replayed, vec![batch(1)]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact);

        // The log stays appendable after repair.
        wal.append(&batch(2)).unwrap();
        drop(wal);
        let (_, replayed) = Wal::open(&path, false).unwrap();
        assert_eq!(replayed, vec![batch(1), batch(2)]);
    }

    #[test]
    fn test_failed_append_does_not_hide_later_batches() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");

        {
            let (mut wal, _) = Wal::open(&path, false).unwrap();
            wal.append(&batch(1)).unwrap();

            // What a write cut short by a full disk leaves behind.
            wal.file.write_all(&[200, 0, 0, 0, 9, 9]).unwrap();
            wal.torn = true;

            wal.append(&batch(2)).unwrap();
            wal.append(&batch(3)).unwrap();
            assert_eq!(std::fs::metadata(&path).unwrap().len(), wal.end);
        }

        let (_, replayed) = Wal::open(&path, false).unwrap();
        assert_eq!(replayed, vec![batch(1), batch(2), batch(3)]);
    }

    #[test]
    fn test_rewrite_replaces_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");

        {
            let (mut wal, _) = Wal::open(&path, false).unwrap();
            for ts in 1..=5 {
                wal.append(&batch(ts)).unwrap();
            }
            wal.rewrite(&batch(9)).unwrap();
            wal.append(&batch(10)).unwrap();
        }
        let (mut wal, replayed) = Wal::open(&path, false).unwrap();
        assert_eq!(replayed, vec![batch(9), batch(10)]);

        wal.rewrite(&WalBatch { series: Vec::new() }).unwrap();
        assert_eq!(wal.size_bytes(), 0);
        drop(wal);
        let (_, replayed) = Wal::open(&path, false).unwrap();
        assert!(replayed.is_empty());
        assert!(!path.with_extension("log.tmp").exists());
    }
}
