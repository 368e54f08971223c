//! Heap consumption rates by least squares.
//!
//! The rate of a counter is the slope of an ordinary least squares line
//! fitted through `(seconds since first point, value)`. Computation of a
//! whole session fans out over a fixed pool of worker threads.

use super::location::LocationData;
use crate::core::{HeapConsumptionRates, HeapwatchError, LocationMetrics, MemoryUsage, Result};
use crossbeam_channel::bounded;
use std::thread;

/// The six counters a rate is derived for, each paired with its accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapSeries {
    AllocObjects,
    AllocBytes,
    FreeObjects,
    FreeBytes,
    InUseObjects,
    InUseBytes,
}

impl HeapSeries {
    pub const ALL: [HeapSeries; 6] = [
        HeapSeries::AllocObjects,
        HeapSeries::AllocBytes,
        HeapSeries::FreeObjects,
        HeapSeries::FreeBytes,
        HeapSeries::InUseObjects,
        HeapSeries::InUseBytes,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HeapSeries::AllocObjects => "alloc_objects",
            HeapSeries::AllocBytes => "alloc_bytes",
            HeapSeries::FreeObjects => "free_objects",
            HeapSeries::FreeBytes => "free_bytes",
            HeapSeries::InUseObjects => "in_use_objects",
            HeapSeries::InUseBytes => "in_use_bytes",
        }
    }

    pub fn value(self, usage: &MemoryUsage) -> f64 {
        let v = match self {
            HeapSeries::AllocObjects => usage.alloc_objects,
            HeapSeries::AllocBytes => usage.alloc_bytes,
            HeapSeries::FreeObjects => usage.free_objects,
            HeapSeries::FreeBytes => usage.free_bytes,
            HeapSeries::InUseObjects => usage.in_use_objects(),
            HeapSeries::InUseBytes => usage.in_use_bytes(),
        };
        v as f64
    }

    fn rate_mut(self, rates: &mut HeapConsumptionRates) -> &mut f64 {
        match self {
            HeapSeries::AllocObjects => &mut rates.alloc_objects_rate,
            HeapSeries::AllocBytes => &mut rates.alloc_bytes_rate,
            HeapSeries::FreeObjects => &mut rates.free_objects_rate,
            HeapSeries::FreeBytes => &mut rates.free_bytes_rate,
            HeapSeries::InUseObjects => &mut rates.in_use_objects_rate,
            HeapSeries::InUseBytes => &mut rates.in_use_bytes_rate,
        }
    }
}

/// OLS slope of `ys` over `xs`.
///
/// Fewer than two points, zero variance in `xs` or a non-finite result all
/// yield `0.0`.
pub fn slope(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let (xs, ys) = (&xs[..n], &ys[..n]);

    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        sxy += dx * (y - mean_y);
        sxx += dx * dx;
    }

    if sxx == 0.0 {
        return 0.0;
    }
    let slope = sxy / sxx;
    if slope.is_finite() {
        slope
    } else {
        0.0
    }
}

/// Rates of every counter of one call-site.
pub fn location_rates(data: &LocationData) -> HeapConsumptionRates {
    let mut rates = HeapConsumptionRates::default();
    let Some(first) = data.timestamps().next() else {
        return rates;
    };

    let xs: Vec<f64> = data
        .timestamps()
        .map(|t| {
            let elapsed = t - first;
            elapsed
                .num_nanoseconds()
                .map_or_else(|| elapsed.num_milliseconds() as f64 / 1e3, |ns| ns as f64 / 1e9)
        })
        .collect();

    let mut ys = Vec::with_capacity(xs.len());
    for series in HeapSeries::ALL {
        ys.clear();
        ys.extend(data.usage().map(|u| series.value(u)));
        *series.rate_mut(&mut rates) = slope(&xs, &ys);
    }
    rates
}

/// Number of regression workers, one per available core.
pub fn pool_size() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

/// Computes the rates of all `locations` on a bounded worker pool.
///
/// Exactly one result is produced per location. Results come back in
/// completion order; callers sort them as needed.
pub fn compute_rates(locations: &[&LocationData]) -> Result<Vec<LocationMetrics>> {
    let total = locations.len();
    if total == 0 {
        return Ok(Vec::new());
    }
    let workers = pool_size().min(total);

    let (job_tx, job_rx) = bounded::<&LocationData>(workers);
    let (result_tx, result_rx) = bounded::<LocationMetrics>(workers);
    let mut results = Vec::with_capacity(total);

    thread::scope(|scope| {
        for _ in 0..workers {
            let jobs = job_rx.clone();
            let out = result_tx.clone();
            scope.spawn(move || {
                for data in jobs {
                    let metrics = LocationMetrics {
                        call_stack: data.call_stack().clone(),
                        rates: location_rates(data),
                    };
                    if out.send(metrics).is_err() {
                        break;
                    }
                }
            });
        }
        drop(job_rx);
        drop(result_tx);

        // Fed from its own thread so the bounded queues cannot deadlock
        // against the collector below.
        scope.spawn(move || {
            for data in locations {
                if job_tx.send(*data).is_err() {
                    break;
                }
            }
        });

        results.extend(result_rx.iter());
    });

    if results.len() != total {
        return Err(HeapwatchError::computation(format!(
            "expected {} location results, got {}",
            total,
            results.len()
        )));
    }
    Ok(results)
}
