//! Per-session metric state.
//!
//! A [`SessionData`] owns the rolling windows of every call-site seen in a
//! session and caches the last computed [`SessionMetrics`] until the next
//! measurement arrives.

use super::location::LocationData;
use super::regression::compute_rates;
use crate::core::{CallStackId, HeapwatchError, Measurement, MemoryUsage, Result, SessionDescription, SessionMetrics};
use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

struct SessionState {
    locations: AHashMap<CallStackId, LocationData>,
    cached: Option<Arc<SessionMetrics>>,
    stale: bool,
    measurements: u64,
    last_observed_at: Option<DateTime<Utc>>,
}

/// Rolling windows and cached rates of one session.
pub struct SessionData {
    session: SessionDescription,
    window: usize,
    state: Mutex<SessionState>,
}

impl SessionData {
    pub fn new(session: SessionDescription, window: usize) -> Self {
        Self {
            session,
            window,
            state: Mutex::new(SessionState {
                locations: AHashMap::new(),
                cached: None,
                stale: true,
                measurements: 0,
                last_observed_at: None,
            }),
        }
    }

    pub fn session(&self) -> &SessionDescription {
        &self.session
    }

    /// Folds one measurement into the windows.
    ///
    /// Call-sites known from earlier measurements but absent from this one
    /// receive a zero-usage point at the same timestamp, so every window
    /// advances in step. A measurement naming the same call stack twice is
    /// rejected without touching any window.
    pub fn register_measurement(&self, measurement: &Measurement) -> Result<()> {
        let mut ids = Vec::with_capacity(measurement.locations.len());
        let mut present = AHashSet::with_capacity(measurement.locations.len());
        for location in &measurement.locations {
            let id = location.call_stack.id();
            if !present.insert(id.clone()) {
                return Err(HeapwatchError::computation(format!(
                    "measurement at {} reports call stack {} twice",
                    measurement.observed_at, id
                )));
            }
            ids.push(id);
        }

        let mut state = self.state.lock();
        for (id, location) in ids.into_iter().zip(&measurement.locations) {
            state
                .locations
                .entry(id)
                .or_insert_with(|| LocationData::new(location.call_stack.clone(), self.window))
                .push(measurement.observed_at, location.memory_usage);
        }
        for (id, data) in state.locations.iter_mut() {
            if !present.contains(id) {
                data.push(measurement.observed_at, MemoryUsage::default());
            }
        }

        state.stale = true;
        state.measurements += 1;
        state.last_observed_at = Some(measurement.observed_at);
        Ok(())
    }

    /// Current rates, sorted by in-use bytes rate descending.
    ///
    /// Served from cache unless a measurement arrived since the last
    /// computation. The lock is held while computing, so concurrent callers
    /// wait for one computation instead of repeating it.
    pub fn get_session_metrics(&self) -> Result<Arc<SessionMetrics>> {
        let mut state = self.state.lock();
        if !state.stale {
            if let Some(cached) = &state.cached {
                return Ok(Arc::clone(cached));
            }
        }

        let locations: Vec<&LocationData> = state.locations.values().collect();
        let mut metrics = SessionMetrics {
            locations: compute_rates(&locations)?,
        };
        metrics.sort_by_in_use_bytes_rate();

        let metrics = Arc::new(metrics);
        state.cached = Some(Arc::clone(&metrics));
        state.stale = false;
        Ok(metrics)
    }

    /// Number of distinct call-sites seen
    pub fn location_count(&self) -> usize {
        self.state.lock().locations.len()
    }

    /// Number of measurements registered
    pub fn measurement_count(&self) -> u64 {
        self.state.lock().measurements
    }

    pub fn last_observed_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_observed_at
    }

    /// Window contents of one call-site, oldest first
    pub fn location_points(&self, id: &CallStackId) -> Option<Vec<(DateTime<Utc>, MemoryUsage)>> {
        let state = self.state.lock();
        state
            .locations
            .get(id)
            .map(|data| data.points().map(|(t, u)| (t, *u)).collect())
    }
}
