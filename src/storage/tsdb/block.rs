//! Immutable on-disk blocks of sealed series.
//!
//! A block file holds two frames, each a little-endian `u32` length followed by
//! an LZ4 compressed bincode payload: first the label sets, then the samples
//! in the same order. Opening the database reads only the label frame, so the
//! samples of sealed series stay on disk until a query needs them.

use super::{Labels, Sample, Series};
use crate::core::{HeapwatchError, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

const BLOCK_EXT: &str = "blk";
const TMP_EXT: &str = "tmp";

pub(crate) fn block_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:08}.{BLOCK_EXT}"))
}

/// Writes `series` as block `id`. The file appears under its final name only
/// once it is complete and synced.
pub(crate) fn write_block(dir: &Path, id: u64, series: &[Series]) -> Result<PathBuf> {
    let labels: Vec<&Labels> = series.iter().map(|s| &s.labels).collect();
    let samples: Vec<&Vec<Sample>> = series.iter().map(|s| &s.samples).collect();

    let mut bytes = encode_frame(&labels)?;
    bytes.extend_from_slice(&encode_frame(&samples)?);

    let path = block_path(dir, id);
    let tmp = path.with_extension(TMP_EXT);
    {
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Reads the label sets of a block without touching its samples.
pub(crate) fn read_labels(path: &Path) -> Result<Vec<Labels>> {
    let mut reader = BufReader::new(File::open(path)?);
    read_frame(&mut reader, path)
}

/// Reads every series of a block.
pub(crate) fn read_series(path: &Path) -> Result<Vec<Series>> {
    let mut reader = BufReader::new(File::open(path)?);
    let labels: Vec<Labels> = read_frame(&mut reader, path)?;
    let samples: Vec<Vec<Sample>> = read_frame(&mut reader, path)?;
    if labels.len() != samples.len() {
        return Err(HeapwatchError::integrity(format!(
            "block {} has {} label sets for {} series",
            path.display(),
            labels.len(),
            samples.len()
        )));
    }
    Ok(labels
        .into_iter()
        .zip(samples)
        .map(|(labels, samples)| Series { labels, samples })
        .collect())
}

/// Lists block ids present in `dir` and removes leftovers of interrupted writes.
pub(crate) fn scan(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some(BLOCK_EXT) => {
                if let Some(id) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse::<u64>().ok()) {
                    ids.push(id);
                }
            }
            Some(TMP_EXT) => {
                tracing::warn!("Removing incomplete block {}", path.display());
                std::fs::remove_file(&path)?;
            }
            _ => {}
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn encode_frame<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let raw = bincode::serialize(value)
        .map_err(|e| HeapwatchError::storage(format!("failed to encode block: {e}")))?;
    let compressed = lz4_flex::compress_prepend_size(&raw);
    let len = u32::try_from(compressed.len()).map_err(|_| HeapwatchError::storage("block frame exceeds 4GiB"))?;

    let mut frame = Vec::with_capacity(4 + compressed.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&compressed);
    Ok(frame)
}

fn read_frame<T: serde::de::DeserializeOwned>(reader: &mut impl Read, path: &Path) -> Result<T> {
    let corrupt = |what: String| HeapwatchError::integrity(format!("block {}: {}", path.display(), what));

    let mut header = [0u8; 4];
    reader
        .read_exact(&mut header)
        .map_err(|e| corrupt(format!("missing frame header: {e}")))?;
    let mut payload = vec![0u8; u32::from_le_bytes(header) as usize];
    reader
        .read_exact(&mut payload)
        .map_err(|e| corrupt(format!("short frame: {e}")))?;

    let raw = lz4_flex::decompress_size_prepended(&payload).map_err(|e| corrupt(e.to_string()))?;
    bincode::deserialize(&raw).map_err(|e| corrupt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn series(name: &str, n: i64) -> Series {
        Series {
            labels: Labels::new().with("session", name).with("metric_type", "alloc_bytes"),
            samples: (0..n).map(|t| Sample { timestamp: t, value: t as f64 }).collect(),
        }
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let input = vec![series("a", 3), series("b", 1)];

        let path = write_block(dir.path(), 7, &input).unwrap();
        assert_eq!(path, block_path(dir.path(), 7));

        let labels = read_labels(&path).unwrap();
        assert_eq!(labels, vec![input[0].labels.clone(), input[1].labels.clone()]);
        assert_eq!(read_series(&path).unwrap(), input);
    }

    #[test]
    fn test_scan_skips_incomplete_blocks() {
        let dir = TempDir::new().unwrap();
        write_block(dir.path(), 2, &[series("a", 1)]).unwrap();
        write_block(dir.path(), 1, &[series("b", 1)]).unwrap();
        let leftover = block_path(dir.path(), 3).with_extension(TMP_EXT);
        std::fs::write(&leftover, b"partial").unwrap();

        assert_eq!(scan(dir.path()).unwrap(), vec![1, 2]);
        assert!(!leftover.exists());
    }

    #[test]
    fn test_truncated_block_is_integrity_error() {
        let dir = TempDir::new().unwrap();
        let path = write_block(dir.path(), 1, &[series("a", 50)]).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        assert!(read_labels(&path).is_ok());
        assert!(matches!(read_series(&path), Err(HeapwatchError::Integrity(_))));
    }
}
