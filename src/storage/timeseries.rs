//! Time-series backend.
//!
//! Every location of a measurement is stored as four samples, one per
//! counter, in series labelled with the session, the call stack digest, the
//! serialized call stack and the counter name. Loading regroups the four
//! series of each call-site and merges all call-sites back into
//! measurements ordered by timestamp.
//!
//! Closing a saver seals the session's series into an on-disk block, so only
//! sessions still being recorded occupy memory.

use super::backend::{DataLoader, DataSaver, MeasurementStream, Storage};
use super::codec::{self, StoredMetric, LABEL_CALLSTACK_ID};
use super::lifecycle::{Lifecycle, LifecycleGuard};
use super::metadata::MetadataStorage;
use super::tsdb::{Sample, Series, TimeSeriesDb, TsdbOptions};
use crate::core::types::{from_unix_nanos, to_unix_nanos};
use crate::core::{
    CallStack, HeapwatchError, InstanceDescription, Location, Measurement, MemoryUsage, Result, SessionDescription,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct TimeseriesStorage {
    db: Arc<TimeSeriesDb>,
    metadata: Arc<dyn MetadataStorage>,
    lifecycle: Lifecycle,
}

impl TimeseriesStorage {
    pub fn open(dir: &Path, sync_write: bool, metadata: Arc<dyn MetadataStorage>) -> Result<Self> {
        let db = TimeSeriesDb::open(dir, TsdbOptions { sync_write })?;
        Ok(Self {
            db,
            metadata,
            lifecycle: Lifecycle::new(),
        })
    }
}

#[async_trait]
impl Storage for TimeseriesStorage {
    async fn new_data_saver(&self, instance: &InstanceDescription) -> Result<Box<dyn DataSaver>> {
        let guard = self.lifecycle.acquire()?;
        let session = self.metadata.start_session(instance).await?;

        Ok(Box::new(TimeseriesDataSaver {
            session,
            db: Arc::clone(&self.db),
            metadata: Arc::clone(&self.metadata),
            _guard: guard,
        }))
    }

    async fn new_data_loader(&self, session: &SessionDescription) -> Result<Box<dyn DataLoader>> {
        let guard = self.lifecycle.acquire()?;
        self.metadata.get_session_metadata(session).await?;

        Ok(Box::new(TimeseriesDataLoader {
            session: session.clone(),
            db: Arc::clone(&self.db),
            _guard: guard,
        }))
    }

    fn metadata(&self) -> Arc<dyn MetadataStorage> {
        Arc::clone(&self.metadata)
    }

    async fn quit(&self) {
        self.lifecycle.shutdown().await;
        if let Err(e) = self.db.close() {
            tracing::error!("Failed to close time-series database: {}", e);
        }
        tracing::info!("Time-series storage shut down");
    }
}

pub struct TimeseriesDataSaver {
    session: SessionDescription,
    db: Arc<TimeSeriesDb>,
    metadata: Arc<dyn MetadataStorage>,
    _guard: LifecycleGuard,
}

#[async_trait]
impl DataSaver for TimeseriesDataSaver {
    fn session(&self) -> &SessionDescription {
        &self.session
    }

    async fn save(&mut self, measurement: &Measurement) -> Result<()> {
        let timestamp = to_unix_nanos(measurement.observed_at)?;

        let mut appender = self.db.appender();
        for location in &measurement.locations {
            match codec::encode_location(&self.session, location) {
                Ok(encoded) => {
                    for (labels, value) in encoded {
                        appender.add(labels, timestamp, value);
                    }
                }
                Err(e) => {
                    appender.rollback();
                    return Err(e);
                }
            }
        }

        tokio::task::spawn_blocking(move || appender.commit()).await??;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let TimeseriesDataSaver {
            session,
            db,
            metadata,
            _guard,
        } = *self;

        let matcher = codec::session_matcher(&session);
        match tokio::task::spawn_blocking(move || db.seal(&[matcher])).await {
            Ok(Ok(sealed)) => tracing::debug!("Sealed {} series of session {}", sealed, session),
            // Samples stay in memory and in the WAL, so nothing is lost.
            Ok(Err(e)) => tracing::warn!("Failed to seal session {}: {}", session, e),
            Err(e) => tracing::warn!("Seal task of session {} failed: {}", session, e),
        }

        let stopped = metadata.stop_session(&session).await;
        drop(_guard);
        stopped
    }
}

pub struct TimeseriesDataLoader {
    session: SessionDescription,
    db: Arc<TimeSeriesDb>,
    _guard: LifecycleGuard,
}

#[async_trait]
impl DataLoader for TimeseriesDataLoader {
    fn session(&self) -> &SessionDescription {
        &self.session
    }

    fn load(&mut self, ctx: CancellationToken) -> MeasurementStream<'_> {
        let db = Arc::clone(&self.db);
        let matcher = codec::session_matcher(&self.session);
        // Sealed series are read from disk, so selection runs off the runtime.
        let selected = async move {
            match tokio::task::spawn_blocking(move || db.select(&[matcher])).await {
                Ok(selected) => selected,
                Err(e) => Err(HeapwatchError::from(e)),
            }
        };

        futures::stream::once(selected)
            .flat_map(move |selected| match selected.and_then(MeasurementIterator::new) {
                Ok(iter) => measurements(iter, ctx.clone()),
                Err(e) => futures::stream::once(async move { Err::<Measurement, _>(e) }).boxed(),
            })
            .boxed()
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn measurements(iter: MeasurementIterator, ctx: CancellationToken) -> MeasurementStream<'static> {
    futures::stream::unfold((iter, ctx, false), |(mut iter, ctx, done)| async move {
        if done {
            return None;
        }
        if ctx.is_cancelled() {
            return Some((Err(HeapwatchError::Cancelled), (iter, ctx, true)));
        }
        let item = iter.next()?;
        let failed = item.is_err();
        Some((item, (iter, ctx, failed)))
    })
    .boxed()
}

/// Walks the four counter series of one call-site in lockstep.
struct LocationIterator {
    call_stack: CallStack,
    callstack_id: String,
    // Indexed like StoredMetric::ALL.
    series: [Vec<Sample>; 4],
    pos: usize,
}

impl LocationIterator {
    /// Timestamp and usage at the current position, `None` once exhausted.
    fn current(&self) -> Result<Option<(i64, MemoryUsage)>> {
        let present = self.series.iter().filter(|s| self.pos < s.len()).count();
        if present == 0 {
            return Ok(None);
        }
        if present != self.series.len() {
            return Err(HeapwatchError::integrity(format!(
                "series of call stack {} end at different points",
                self.callstack_id
            )));
        }

        let timestamp = self.series[0][self.pos].timestamp;
        let mut usage = MemoryUsage::default();
        for (metric, samples) in StoredMetric::ALL.into_iter().zip(&self.series) {
            let sample = samples[self.pos];
            if sample.timestamp != timestamp {
                return Err(HeapwatchError::integrity(format!(
                    "timestamp mismatch in call stack {}: {} vs {}",
                    self.callstack_id, sample.timestamp, timestamp
                )));
            }
            metric.write(&mut usage, codec::decode_value(sample.value));
        }
        Ok(Some((timestamp, usage)))
    }

    fn advance(&mut self) {
        self.pos += 1;
    }
}

/// Merges call-site iterators into measurements by ascending timestamp.
struct MeasurementIterator {
    live: Vec<LocationIterator>,
}

impl MeasurementIterator {
    fn new(series: Vec<Series>) -> Result<Self> {
        let mut grouped: BTreeMap<String, (Option<CallStack>, [Option<Vec<Sample>>; 4])> = BTreeMap::new();

        for series in series {
            let id = series
                .labels
                .get(LABEL_CALLSTACK_ID)
                .ok_or_else(|| HeapwatchError::integrity("series without call stack id"))?
                .to_string();
            let metric = codec::decode_metric(&series.labels)?;
            let slot = StoredMetric::ALL
                .iter()
                .position(|m| *m == metric)
                .ok_or_else(|| HeapwatchError::integrity("unknown metric series"))?;

            let entry = grouped.entry(id).or_insert_with(|| (None, [None, None, None, None]));
            if entry.0.is_none() {
                entry.0 = Some(codec::decode_call_stack(&series.labels)?);
            }
            if entry.1[slot].replace(series.samples).is_some() {
                return Err(HeapwatchError::integrity(format!(
                    "duplicate {} series for one call stack",
                    metric.as_str()
                )));
            }
        }

        let mut live = Vec::with_capacity(grouped.len());
        for (callstack_id, (call_stack, slots)) in grouped {
            let [a, b, c, d] = slots;
            let (Some(call_stack), Some(a), Some(b), Some(c), Some(d)) = (call_stack, a, b, c, d) else {
                return Err(HeapwatchError::integrity(format!(
                    "call stack {callstack_id} is missing counter series"
                )));
            };
            live.push(LocationIterator {
                call_stack,
                callstack_id,
                series: [a, b, c, d],
                pos: 0,
            });
        }

        Ok(Self { live })
    }
}

impl Iterator for MeasurementIterator {
    type Item = Result<Measurement>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut heads = Vec::with_capacity(self.live.len());
        for (idx, location) in self.live.iter().enumerate() {
            match location.current() {
                Ok(Some((timestamp, usage))) => heads.push((idx, timestamp, usage)),
                Ok(None) => {}
                Err(e) => {
                    self.live.clear();
                    return Some(Err(e));
                }
            }
        }

        let min = heads.iter().map(|(_, timestamp, _)| *timestamp).min()?;
        let mut locations = Vec::new();
        for (idx, timestamp, usage) in heads {
            if timestamp == min {
                let location = &mut self.live[idx];
                locations.push(Location {
                    call_stack: location.call_stack.clone(),
                    memory_usage: usage,
                });
                location.advance();
            }
        }
        self.live.retain(|l| l.current().map_or(true, |c| c.is_some()));

        Some(Ok(Measurement {
            observed_at: from_unix_nanos(min),
            locations,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StackFrame;
    use crate::storage::codec::{LABEL_META, LABEL_METRIC_TYPE, LABEL_SESSION};
    use crate::storage::metadata::SqliteMetadataStorage;
    use crate::storage::tsdb::Labels;
    use chrono::{Duration, TimeZone, Utc};
    use futures::TryStreamExt;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> TimeseriesStorage {
        let metadata = Arc::new(SqliteMetadataStorage::open_in_memory().unwrap());
        TimeseriesStorage::open(dir.path(), false, metadata).unwrap()
    }

    fn location(name: &str, bytes: i64) -> Location {
        Location {
            call_stack: CallStack::new(vec![StackFrame::new(name, "heap.go", 7)]),
            memory_usage: MemoryUsage {
                alloc_objects: bytes / 8,
                alloc_bytes: bytes,
                free_objects: 1,
                free_bytes: 8,
            },
        }
    }

    fn at(step: i64) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + Duration::seconds(step)
    }

    fn sorted(mut m: Measurement) -> Measurement {
        m.locations.sort_by_key(|l| l.call_stack.id());
        m
    }

    #[tokio::test]
    async fn test_save_then_load_merges_by_timestamp() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);

        let input = vec![
            Measurement {
                observed_at: at(0),
                locations: vec![location("a", 64), location("b", 128)],
            },
            Measurement {
                observed_at: at(1),
                locations: vec![location("a", 96)],
            },
            Measurement {
                observed_at: at(2),
                locations: vec![location("b", 256), location("a", 160)],
            },
        ];

        let mut saver = storage.new_data_saver(&InstanceDescription::new("api", "api-1").unwrap()).await.unwrap();
        let session = saver.session().clone();
        for m in &input {
            saver.save(m).await.unwrap();
        }
        saver.close().await.unwrap();

        let mut loader = storage.new_data_loader(&session).await.unwrap();
        let loaded: Vec<Measurement> = loader.load(CancellationToken::new()).try_collect().await.unwrap();

        let expected: Vec<Measurement> = input.into_iter().map(sorted).collect();
        let loaded: Vec<Measurement> = loaded.into_iter().map(sorted).collect();
        assert_eq!(loaded, expected);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let instance = InstanceDescription::new("api", "api-1").unwrap();

        let mut first = storage.new_data_saver(&instance).await.unwrap();
        let mut second = storage.new_data_saver(&instance).await.unwrap();
        first
            .save(&Measurement {
                observed_at: at(0),
                locations: vec![location("a", 64)],
            })
            .await
            .unwrap();
        second
            .save(&Measurement {
                observed_at: at(0),
                locations: vec![location("z", 1)],
            })
            .await
            .unwrap();

        let session = first.session().clone();
        first.close().await.unwrap();
        second.close().await.unwrap();

        let mut loader = storage.new_data_loader(&session).await.unwrap();
        let loaded: Vec<Measurement> = loader.load(CancellationToken::new()).try_collect().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].locations, vec![location("a", 64)]);
    }

    #[tokio::test]
    async fn test_closed_sessions_leave_memory() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let instance = InstanceDescription::new("api", "api-1").unwrap();

        let mut done = storage.new_data_saver(&instance).await.unwrap();
        let mut running = storage.new_data_saver(&instance).await.unwrap();
        for step in 0..5 {
            let m = Measurement {
                observed_at: at(step),
                locations: vec![location("a", 64 * (step + 1))],
            };
            done.save(&m).await.unwrap();
            running.save(&m).await.unwrap();
        }
        let session = done.session().clone();
        done.close().await.unwrap();

        // Only the running session's four counters stay resident.
        assert_eq!(storage.db.head_series_count(), 4);
        assert_eq!(storage.db.series_count(), 8);

        let mut loader = storage.new_data_loader(&session).await.unwrap();
        let loaded: Vec<Measurement> = loader.load(CancellationToken::new()).try_collect().await.unwrap();
        assert_eq!(loaded.len(), 5);
        assert_eq!(loaded[4].locations, vec![location("a", 320)]);

        running.close().await.unwrap();
        assert_eq!(storage.db.head_series_count(), 0);
    }

    #[tokio::test]
    async fn test_inexact_counters_are_refused() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);

        let mut saver = storage.new_data_saver(&InstanceDescription::new("api", "api-1").unwrap()).await.unwrap();
        let mut huge = location("b", 8);
        huge.memory_usage.alloc_bytes = codec::MAX_EXACT_COUNTER + 1;
        let err = saver
            .save(&Measurement {
                observed_at: at(0),
                locations: vec![location("a", 64), huge],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HeapwatchError::Codec(_)));
        // The whole measurement was rolled back.
        assert_eq!(storage.db.series_count(), 0);
        saver.close().await.unwrap();
    }

    #[test]
    fn test_mismatched_timestamps_are_integrity_errors() {
        let call_stack = CallStack::new(vec![StackFrame::new("a", "heap.go", 7)]);
        let meta = serde_json::to_string(&call_stack).unwrap();
        let series = StoredMetric::ALL
            .into_iter()
            .enumerate()
            .map(|(i, metric)| Series {
                labels: Labels::new()
                    .with(LABEL_SESSION, "s")
                    .with(LABEL_CALLSTACK_ID, call_stack.id().as_str())
                    .with(LABEL_META, meta.clone())
                    .with(LABEL_METRIC_TYPE, metric.as_str()),
                samples: vec![Sample {
                    // The last counter is skewed.
                    timestamp: if i == 3 { 2 } else { 1 },
                    value: 1.0,
                }],
            })
            .collect();

        let mut iter = MeasurementIterator::new(series).unwrap();
        assert!(matches!(iter.next(), Some(Err(HeapwatchError::Integrity(_)))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_missing_counter_series_is_rejected() {
        let call_stack = CallStack::new(vec![StackFrame::new("a", "heap.go", 7)]);
        let series = vec![Series {
            labels: Labels::new()
                .with(LABEL_CALLSTACK_ID, call_stack.id().as_str())
                .with(LABEL_META, serde_json::to_string(&call_stack).unwrap())
                .with(LABEL_METRIC_TYPE, "alloc_bytes"),
            samples: vec![],
        }];
        assert!(MeasurementIterator::new(series).is_err());
    }
}
