//! Metric acquisition: observation types and the source trait.
//!
//! Production deployments implement [`MetricSource`] against their
//! metrics backend. The in-memory sources here back tests, replays,
//! and the synthetic demo mode.

use chrono::{DateTime, Duration, Timelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use mt_common::{Error, MetricKey, Result};

/// One observation of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl MetricPoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        MetricPoint { timestamp, value }
    }
}

/// A window of observations for one metric, ordered by timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSeries {
    pub key: MetricKey,
    pub points: Vec<MetricPoint>,
}

impl MetricSeries {
    pub fn new(key: MetricKey) -> Self {
        MetricSeries {
            key,
            points: Vec::new(),
        }
    }

    pub fn with_points(key: MetricKey, points: Vec<MetricPoint>) -> Self {
        MetricSeries { key, points }
    }

    pub fn push(&mut self, timestamp: DateTime<Utc>, value: f64) {
        self.points.push(MetricPoint { timestamp, value });
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Values in timestamp order.
    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    /// Whole days between the first and last observation.
    pub fn span_days(&self) -> i64 {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp).num_days(),
            _ => 0,
        }
    }

    pub fn latest(&self) -> Option<&MetricPoint> {
        self.points.last()
    }
}

/// Where metric observations come from.
pub trait MetricSource: Send + Sync {
    /// Metric keys this source can serve.
    fn keys(&self) -> Vec<MetricKey>;

    /// Fetch a history window for baseline learning.
    fn fetch_range(
        &self,
        key: &MetricKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MetricSeries>;

    /// Latest observation for a detection tick, if any.
    fn latest(&self, key: &MetricKey) -> Result<Option<MetricPoint>>;

    /// One tick's snapshot: the freshest value in the trailing minute
    /// for each key. Keys the source cannot serve right now are left
    /// out rather than failing the whole snapshot.
    fn fetch(
        &self,
        keys: &[MetricKey],
        now: DateTime<Utc>,
    ) -> Result<HashMap<MetricKey, f64>> {
        let mut snapshot = HashMap::new();
        for key in keys {
            let series = match self.fetch_range(key, now - Duration::minutes(1), now) {
                Ok(series) => series,
                Err(Error::BaselineMissing { .. }) => continue,
                Err(e) => return Err(e),
            };
            if let Some(point) = series.latest() {
                snapshot.insert(key.clone(), point.value);
            }
        }
        Ok(snapshot)
    }
}

/// Fixed in-memory source for tests and replays.
#[derive(Debug, Default)]
pub struct StaticSource {
    series: HashMap<String, MetricSeries>,
}

impl StaticSource {
    pub fn new() -> Self {
        StaticSource::default()
    }

    /// Insert or replace the series for its key.
    pub fn insert(&mut self, series: MetricSeries) {
        self.series.insert(series.key.canonical(), series);
    }
}

impl MetricSource for StaticSource {
    fn keys(&self) -> Vec<MetricKey> {
        self.series.values().map(|s| s.key.clone()).collect()
    }

    fn fetch_range(
        &self,
        key: &MetricKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MetricSeries> {
        let series = self
            .series
            .get(&key.canonical())
            .ok_or_else(|| Error::BaselineMissing {
                key: key.canonical(),
            })?;

        let points = series
            .points
            .iter()
            .filter(|p| p.timestamp >= start && p.timestamp <= end)
            .copied()
            .collect();

        Ok(MetricSeries::with_points(series.key.clone(), points))
    }

    fn latest(&self, key: &MetricKey) -> Result<Option<MetricPoint>> {
        Ok(self
            .series
            .get(&key.canonical())
            .and_then(|s| s.latest())
            .copied())
    }
}

/// Synthetic source with a daily sinusoidal load pattern.
///
/// Used by the demo tick mode so the engine can be exercised without a
/// metrics backend. Values follow
/// `base + amplitude * sin(hour) + noise`, with an optional spike window
/// to provoke detections.
pub struct SyntheticSource {
    key: MetricKey,
    base: f64,
    amplitude: f64,
    noise: f64,
    /// Inclusive start and exclusive end of the spike window, with the
    /// multiplier applied to the base value inside it.
    spike: Option<(DateTime<Utc>, DateTime<Utc>, f64)>,
}

impl SyntheticSource {
    pub fn new(key: MetricKey, base: f64, amplitude: f64, noise: f64) -> Self {
        SyntheticSource {
            key,
            base,
            amplitude,
            noise,
            spike: None,
        }
    }

    /// Multiply the base value by `factor` inside `[start, end)`.
    pub fn with_spike(mut self, start: DateTime<Utc>, end: DateTime<Utc>, factor: f64) -> Self {
        self.spike = Some((start, end, factor));
        self
    }

    fn value_at(&self, ts: DateTime<Utc>) -> f64 {
        let hour_angle = (ts.hour() as f64 + ts.minute() as f64 / 60.0) / 24.0
            * std::f64::consts::TAU;
        let mut value = self.base + self.amplitude * hour_angle.sin();

        if let Some((start, end, factor)) = self.spike {
            if ts >= start && ts < end {
                value *= factor;
            }
        }

        if self.noise > 0.0 {
            let jitter: f64 = rand::rng().random_range(-self.noise..self.noise);
            value += jitter;
        }

        value.max(0.0)
    }
}

impl MetricSource for SyntheticSource {
    fn keys(&self) -> Vec<MetricKey> {
        vec![self.key.clone()]
    }

    fn fetch_range(
        &self,
        key: &MetricKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MetricSeries> {
        if key.canonical() != self.key.canonical() {
            return Err(Error::BaselineMissing {
                key: key.canonical(),
            });
        }

        let mut series = MetricSeries::new(self.key.clone());
        let mut ts = start;
        while ts <= end {
            series.push(ts, self.value_at(ts));
            ts += Duration::minutes(1);
        }
        Ok(series)
    }

    fn latest(&self, key: &MetricKey) -> Result<Option<MetricPoint>> {
        if key.canonical() != self.key.canonical() {
            return Ok(None);
        }
        let now = Utc::now();
        Ok(Some(MetricPoint::new(now, self.value_at(now))))
    }
}
