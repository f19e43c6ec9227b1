//! Baseline models: per-metric statistical profiles of normal behavior.
//!
//! A baseline captures what a metric looks like when the system is
//! healthy: global summary statistics, per-hour-of-day refinements, and
//! day-of-week adjustment ratios. Detection compares live observations
//! against the expected value the baseline predicts for that moment.

pub mod store;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use mt_common::{Error, MetricKey, Result};
use mt_config::BaselineConfig;
use mt_math::{mad, mean, median, percentile, population_std, MAD_CONSISTENCY};

use crate::source::MetricSeries;

/// Modified z-score cutoff for outlier filtering before learning.
const OUTLIER_SIGMA: f64 = 4.0;

/// Minimum usable points after outlier filtering.
const MIN_LEARN_POINTS: usize = 24;

/// Statistical summary of a value window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineStats {
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub mad: f64,
    pub min: f64,
    pub max: f64,
    pub p5: f64,
    pub p25: f64,
    pub p75: f64,
    pub p95: f64,
    pub sample_count: usize,
}

impl BaselineStats {
    /// Compute summary statistics; `None` for an empty slice.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        Some(BaselineStats {
            mean: mean(values),
            std_dev: population_std(values),
            median: median(values),
            mad: mad(values),
            min,
            max,
            p5: percentile(values, 5.0),
            p25: percentile(values, 25.0),
            p75: percentile(values, 75.0),
            p95: percentile(values, 95.0),
            sample_count: values.len(),
        })
    }
}

/// Baseline statistics for a specific hour of day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyBaseline {
    /// Hour of day, 0-23.
    pub hour: u32,
    pub stats: BaselineStats,
    /// Ratio of day-of-week mean to hourly mean, keyed 0=Monday..6=Sunday.
    /// Only present for days with enough samples.
    #[serde(default)]
    pub dow_adjustments: BTreeMap<u8, f64>,
}

/// Complete baseline for a metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub key: MetricKey,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub data_start: DateTime<Utc>,
    pub data_end: DateTime<Utc>,
    pub sample_count: usize,

    /// Statistics over the whole learning window.
    pub global_stats: BaselineStats,

    /// Per-hour refinements; sparse, only hours with enough samples.
    #[serde(default)]
    pub hourly: Vec<HourlyBaseline>,

    /// Learning quality, 0-1, driven by sample density and coverage.
    pub quality_score: f64,
    pub coverage_days: i64,
}

impl Baseline {
    /// Expected value and standard deviation at a timestamp.
    ///
    /// Prefers the hour-of-day bucket with its day-of-week adjustment;
    /// falls back to the global statistics when the hour is uncovered.
    pub fn expected_value(&self, timestamp: DateTime<Utc>) -> (f64, f64) {
        let hour = timestamp.hour();
        if let Some(hourly) = self.hourly.iter().find(|h| h.hour == hour) {
            let dow = timestamp.weekday().num_days_from_monday() as u8;
            let adjustment = hourly.dow_adjustments.get(&dow).copied().unwrap_or(1.0);
            return (hourly.stats.mean * adjustment, hourly.stats.std_dev);
        }
        (self.global_stats.mean, self.global_stats.std_dev)
    }

    /// Lower and upper anomaly thresholds at a timestamp.
    pub fn threshold(&self, timestamp: DateTime<Utc>, sigma: f64) -> (f64, f64) {
        let (mean, std) = self.expected_value(timestamp);
        (mean - sigma * std, mean + sigma * std)
    }

    /// Full stats for the hour bucket covering `timestamp`, falling back
    /// to the global stats when the bucket is missing. Day-of-week
    /// adjustments apply to the mean only, so robust consumers (median,
    /// MAD) read the bucket as-is.
    pub fn stats_at(&self, timestamp: DateTime<Utc>) -> &BaselineStats {
        let hour = timestamp.hour();
        self.hourly
            .iter()
            .find(|h| h.hour == hour)
            .map(|h| &h.stats)
            .unwrap_or(&self.global_stats)
    }

    /// Whether the baseline is older than `max_age_hours`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age_hours: u64) -> bool {
        let age = now - self.updated_at;
        age.num_seconds() > max_age_hours as i64 * 3600
    }
}

/// Learn a baseline from a metric series.
///
/// Filters outliers with a modified z-score before computing statistics
/// so that past incidents do not contaminate the profile of normal.
pub fn learn_baseline(
    series: &MetricSeries,
    config: &BaselineConfig,
    now: DateTime<Utc>,
) -> Result<Baseline> {
    let key = series.key.canonical();

    if series.is_empty() {
        return Err(Error::EmptySeries { key });
    }

    let span_days = series.span_days();
    if span_days < config.min_history_days {
        return Err(Error::InsufficientHistory {
            key,
            days: span_days,
            required: config.min_history_days,
        });
    }

    let (values, timestamps) = filter_outliers(series);

    if values.len() < MIN_LEARN_POINTS {
        return Err(Error::Baseline(format!(
            "{}: only {} points remain after outlier filtering (need {})",
            key,
            values.len(),
            MIN_LEARN_POINTS
        )));
    }

    let global_stats = BaselineStats::from_values(&values).ok_or(Error::EmptySeries {
        key: key.clone(),
    })?;

    let hourly = hourly_baselines(&values, &timestamps, config);
    let quality_score = quality_score(values.len(), span_days, &global_stats, config);

    Ok(Baseline {
        key: series.key.clone(),
        created_at: now,
        updated_at: now,
        data_start: timestamps[0],
        data_end: timestamps[timestamps.len() - 1],
        sample_count: values.len(),
        global_stats,
        hourly,
        quality_score,
        coverage_days: span_days,
    })
}

/// Drop points whose modified z-score exceeds the cutoff.
///
/// Small windows and zero-MAD series pass through unchanged.
fn filter_outliers(series: &MetricSeries) -> (Vec<f64>, Vec<DateTime<Utc>>) {
    let values = series.values();
    let timestamps: Vec<DateTime<Utc>> = series.points.iter().map(|p| p.timestamp).collect();

    if values.len() < 10 {
        return (values, timestamps);
    }

    let med = median(&values);
    let dispersion = mad(&values);
    if dispersion == 0.0 {
        return (values, timestamps);
    }

    let mut kept_values = Vec::with_capacity(values.len());
    let mut kept_timestamps = Vec::with_capacity(timestamps.len());
    for (value, ts) in values.iter().zip(timestamps.iter()) {
        let modified_z = (value - med) / (MAD_CONSISTENCY * dispersion);
        if modified_z.abs() <= OUTLIER_SIGMA {
            kept_values.push(*value);
            kept_timestamps.push(*ts);
        }
    }

    (kept_values, kept_timestamps)
}

/// Per-hour statistics with day-of-week adjustment ratios.
fn hourly_baselines(
    values: &[f64],
    timestamps: &[DateTime<Utc>],
    config: &BaselineConfig,
) -> Vec<HourlyBaseline> {
    let mut by_hour: Vec<Vec<f64>> = vec![Vec::new(); 24];
    let mut by_hour_dow: Vec<Vec<Vec<f64>>> = vec![vec![Vec::new(); 7]; 24];

    for (value, ts) in values.iter().zip(timestamps.iter()) {
        let hour = ts.hour() as usize;
        let dow = ts.weekday().num_days_from_monday() as usize;
        by_hour[hour].push(*value);
        by_hour_dow[hour][dow].push(*value);
    }

    let mut baselines = Vec::new();
    for hour in 0..24 {
        if by_hour[hour].len() < config.min_hourly_samples {
            continue;
        }

        let stats = match BaselineStats::from_values(&by_hour[hour]) {
            Some(stats) => stats,
            None => continue,
        };

        let mut dow_adjustments = BTreeMap::new();
        for dow in 0..7 {
            let dow_values = &by_hour_dow[hour][dow];
            if dow_values.len() >= config.min_dow_samples && stats.mean != 0.0 {
                dow_adjustments.insert(dow as u8, mean(dow_values) / stats.mean);
            }
        }

        baselines.push(HourlyBaseline {
            hour: hour as u32,
            stats,
            dow_adjustments,
        });
    }

    baselines
}

/// Quality score, 0-1.
///
/// Sample density contributes up to 0.3 (relative to one sample per
/// minute for the optimal window), day coverage up to 0.4, and value
/// stability (low coefficient of variation) up to 0.3.
fn quality_score(
    sample_count: usize,
    coverage_days: i64,
    stats: &BaselineStats,
    config: &BaselineConfig,
) -> f64 {
    let expected_samples = (config.optimal_history_days as f64) * 24.0 * 60.0;
    let sample_factor = (sample_count as f64 / expected_samples).min(1.0) * 0.3;

    let coverage_factor =
        (coverage_days as f64 / config.optimal_history_days as f64).min(1.0) * 0.4;

    let stability_factor = if stats.mean != 0.0 {
        let cv = stats.std_dev / stats.mean.abs();
        (1.0 - cv).max(0.0) * 0.3
    } else {
        0.15
    };

    sample_factor + coverage_factor + stability_factor
}
