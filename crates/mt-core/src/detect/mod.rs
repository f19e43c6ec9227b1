//! Ensemble anomaly detection.
//!
//! Each tick scores the current value of every metric in the snapshot
//! against its learned baseline with the enabled algorithms (z-score,
//! scaled MAD). A tick is anomalous when at least `ensemble_min_votes`
//! algorithms fire; the ensemble score is the maximum normalized score
//! among them. Anomalies become active immediately but are surfaced to
//! the planner only after the minimum-duration gate, which filters
//! one-tick blips without losing their start time.

pub mod state;

pub use state::{
    Anomaly, AnomalyKind, AnomalyScore, AnomalyState, ScoreDetails, Severity,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use mt_common::{AnomalyId, MetricCategory, MetricKey, Result};
use mt_config::{DetectionConfig, ScoreAlgorithm};
use mt_math::MAD_CONSISTENCY;

use crate::baseline::store::BaselineStore;
use crate::baseline::{Baseline, BaselineStats};

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Z-score verdict for one value.
///
/// Zero or non-finite std means the algorithm abstains: score 0, no vote.
pub fn score_zscore(value: f64, mean: f64, std: f64, threshold: f64) -> AnomalyScore {
    if !std.is_finite() || std <= 0.0 {
        return abstain(ScoreAlgorithm::Zscore, threshold, mean);
    }
    let sigma = ((value - mean) / std).abs();
    AnomalyScore {
        algorithm: ScoreAlgorithm::Zscore,
        score: (sigma / (2.0 * threshold)).min(1.0),
        threshold,
        is_anomaly: sigma > threshold,
        details: ScoreDetails {
            sigma,
            center: mean,
            spread: std,
            abstained: false,
        },
    }
}

/// Scaled-MAD verdict for one value.
///
/// Zero or non-finite MAD means the algorithm abstains.
pub fn score_mad(value: f64, median: f64, mad: f64, threshold: f64) -> AnomalyScore {
    if !mad.is_finite() || mad <= 0.0 {
        return abstain(ScoreAlgorithm::Mad, threshold, median);
    }
    let spread = MAD_CONSISTENCY * mad;
    let sigma = ((value - median) / spread).abs();
    AnomalyScore {
        algorithm: ScoreAlgorithm::Mad,
        score: (sigma / (2.0 * threshold)).min(1.0),
        threshold,
        is_anomaly: sigma > threshold,
        details: ScoreDetails {
            sigma,
            center: median,
            spread,
            abstained: false,
        },
    }
}

fn abstain(algorithm: ScoreAlgorithm, threshold: f64, center: f64) -> AnomalyScore {
    AnomalyScore {
        algorithm,
        score: 0.0,
        threshold,
        is_anomaly: false,
        details: ScoreDetails {
            sigma: 0.0,
            center,
            spread: 0.0,
            abstained: true,
        },
    }
}

fn evaluate(
    config: &DetectionConfig,
    value: f64,
    baseline: &Baseline,
    now: DateTime<Utc>,
) -> Vec<AnomalyScore> {
    config
        .algorithms
        .iter()
        .map(|algorithm| match algorithm {
            ScoreAlgorithm::Zscore => {
                let (mean, std) = baseline.expected_value(now);
                score_zscore(value, mean, std, config.zscore_threshold)
            }
            ScoreAlgorithm::Mad => {
                let stats = baseline.stats_at(now);
                score_mad(value, stats.median, stats.mad, config.mad_threshold)
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Signed deviation in sigma units, preferring the z-score scale and
/// falling back to the robust scale when std is degenerate.
fn signed_deviation(value: f64, mean: f64, std: f64, robust: &BaselineStats) -> f64 {
    if std.is_finite() && std > 0.0 {
        (value - mean) / std
    } else if robust.mad.is_finite() && robust.mad > 0.0 {
        (value - robust.median) / (MAD_CONSISTENCY * robust.mad)
    } else {
        0.0
    }
}

fn deviation_percent(value: f64, expected: f64) -> f64 {
    if expected.abs() < f64::EPSILON {
        0.0
    } else {
        (value - expected) / expected * 100.0
    }
}

fn classify_severity(
    deviation: f64,
    category: MetricCategory,
    active_minutes: i64,
    escalation_minutes: i64,
) -> Severity {
    let weighted = deviation.abs() * category.severity_weight();
    let base = Severity::from_weighted_deviation(weighted);
    if active_minutes >= escalation_minutes {
        base.escalate()
    } else {
        base
    }
}

/// Shape of the deviation from the trailing value window.
///
/// Flatline: the window is constant while the baseline varies. Drift:
/// every consecutive delta shares one sign. Otherwise the sign of the
/// deviation decides spike vs drop.
fn classify_kind(window: &[f64], deviation: f64, baseline_std: f64) -> AnomalyKind {
    if window.len() >= 3 {
        let min = window.iter().copied().fold(f64::INFINITY, f64::min);
        let max = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if (max - min).abs() < 1e-9 && baseline_std > 0.0 {
            return AnomalyKind::Flatline;
        }
        let rising = window.windows(2).all(|w| w[1] > w[0]);
        let falling = window.windows(2).all(|w| w[1] < w[0]);
        if rising || falling {
            return AnomalyKind::Drift;
        }
    }
    if deviation >= 0.0 {
        AnomalyKind::Spike
    } else {
        AnomalyKind::Drop
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Outcome of one detection pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Keys scored against a baseline.
    pub evaluated: usize,
    /// Keys skipped for a missing or stale baseline.
    pub skipped: usize,
    pub opened: Vec<AnomalyId>,
    pub extended: Vec<AnomalyId>,
    pub resolved: Vec<AnomalyId>,
    /// Active anomalies past the duration gate as of this tick.
    pub surfaced: Vec<Anomaly>,
}

/// Single-writer detection loop state.
pub struct AnomalyDetector {
    config: DetectionConfig,
    state: AnomalyState,
    /// Trailing values per canonical key, bounded by `trend_window`.
    recent: HashMap<String, VecDeque<f64>>,
}

impl AnomalyDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self::with_state(config, AnomalyState::new())
    }

    /// Resume from a registry reloaded at restart.
    pub fn with_state(config: DetectionConfig, state: AnomalyState) -> Self {
        AnomalyDetector {
            config,
            state,
            recent: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn state(&self) -> &AnomalyState {
        &self.state
    }

    /// Active anomalies past the duration gate.
    pub fn surfaced(&self) -> Vec<&Anomaly> {
        self.state.surfaced(self.config.min_anomaly_duration_minutes)
    }

    pub fn acknowledge(&mut self, id: &str, by: &str, now: DateTime<Utc>) -> bool {
        self.state.acknowledge(id, by, now)
    }

    pub fn save_state(&self, path: &std::path::Path) -> Result<()> {
        self.state.save_to_file(path)
    }

    /// Score one snapshot of current values against the baseline store.
    ///
    /// Keys without a usable baseline are skipped and logged, never an
    /// error. Keys absent from the snapshot leave their anomalies
    /// untouched.
    pub fn process_tick(
        &mut self,
        snapshot: &HashMap<MetricKey, f64>,
        baselines: &BaselineStore,
        now: DateTime<Utc>,
    ) -> Result<TickReport> {
        let mut report = TickReport::default();

        // Deterministic walk order keeps logs and reports stable.
        let mut entries: Vec<(&MetricKey, f64)> =
            snapshot.iter().map(|(k, v)| (k, *v)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        for (key, value) in entries {
            let canonical = key.canonical();

            let window: Vec<f64> = {
                let recent = self.recent.entry(canonical.clone()).or_default();
                recent.push_back(value);
                while recent.len() > self.config.trend_window {
                    recent.pop_front();
                }
                recent.iter().copied().collect()
            };

            let Some(baseline) = baselines.get(key)? else {
                debug!(key = %canonical, "no baseline, skipping tick");
                report.skipped += 1;
                continue;
            };
            if baseline.is_stale(now, baselines.config().stale_after_hours) {
                debug!(key = %canonical, "stale baseline, skipping tick");
                report.skipped += 1;
                continue;
            }
            report.evaluated += 1;

            let scores = evaluate(&self.config, value, &baseline, now);
            let votes = scores.iter().filter(|s| s.is_anomaly).count();

            let (mean, std) = baseline.expected_value(now);
            let robust = baseline.stats_at(now);
            let deviation = signed_deviation(value, mean, std, robust);

            if votes >= self.config.ensemble_min_votes {
                let ensemble_score = scores
                    .iter()
                    .filter(|s| s.is_anomaly)
                    .map(|s| s.score)
                    .fold(0.0, f64::max);

                let active_minutes = self
                    .state
                    .active
                    .get(&canonical)
                    .map(|a| (now - a.started_at).num_minutes())
                    .unwrap_or(0);
                let severity = classify_severity(
                    deviation,
                    key.category(),
                    active_minutes,
                    self.config.severity_escalation_minutes,
                );
                let kind = classify_kind(&window, deviation, std);

                let candidate = Anomaly {
                    id: AnomalyId::new(),
                    key: key.clone(),
                    category: key.category(),
                    kind,
                    severity,
                    current_value: value,
                    baseline_value: mean,
                    deviation,
                    deviation_percent: deviation_percent(value, mean),
                    scores,
                    ensemble_score,
                    detected_at: now,
                    started_at: now,
                    duration_minutes: 0,
                    is_active: true,
                    acknowledged: false,
                    acknowledged_by: None,
                    resolved_at: None,
                };

                let (stored, opened) = self.state.upsert(candidate, now);
                if opened {
                    info!(
                        key = %canonical,
                        id = %stored.id,
                        severity = %stored.severity,
                        kind = %stored.kind,
                        value = stored.current_value,
                        expected = stored.baseline_value,
                        "anomaly opened"
                    );
                    report.opened.push(stored.id.clone());
                } else {
                    debug!(
                        key = %canonical,
                        id = %stored.id,
                        duration_minutes = stored.duration_minutes,
                        "anomaly extended"
                    );
                    report.extended.push(stored.id.clone());
                }
                if stored.duration_minutes >= self.config.min_anomaly_duration_minutes {
                    report.surfaced.push(stored);
                }
            } else if self.state.active.contains_key(&canonical) {
                // Resolution needs the tick clear of every enabled
                // algorithm at the scaled threshold, not just short of
                // the vote quorum.
                let clear = scores.iter().all(|s| {
                    s.details.abstained
                        || s.details.sigma <= s.threshold * self.config.resolution_factor
                });
                if clear {
                    if let Some(resolved) = self.state.resolve(&canonical, now) {
                        info!(
                            key = %canonical,
                            id = %resolved.id,
                            duration_minutes = resolved.duration_minutes,
                            "anomaly resolved"
                        );
                        report.resolved.push(resolved.id.clone());
                    }
                } else {
                    self.state.refresh_duration(&canonical, now);
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::store::BaselineSnapshot;
    use chrono::{Duration, TimeZone};
    use mt_common::SCHEMA_VERSION;
    use mt_config::BaselineConfig;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()
    }

    fn stats(mean: f64, std: f64, median: f64, mad: f64) -> BaselineStats {
        BaselineStats {
            mean,
            std_dev: std,
            median,
            mad,
            min: mean - 3.0 * std,
            max: mean + 3.0 * std,
            p5: mean - 2.0 * std,
            p25: mean - std,
            p75: mean + std,
            p95: mean + 2.0 * std,
            sample_count: 10_080,
        }
    }

    fn fixture_baseline(name: &str, mean: f64, std: f64, median: f64, mad: f64) -> Baseline {
        Baseline {
            key: MetricKey::bare(name),
            created_at: t0(),
            updated_at: t0(),
            data_start: t0() - Duration::days(7),
            data_end: t0(),
            sample_count: 10_080,
            global_stats: stats(mean, std, median, mad),
            hourly: Vec::new(),
            quality_score: 0.8,
            coverage_days: 7,
        }
    }

    fn store_with(baselines: Vec<Baseline>) -> BaselineStore {
        let store = BaselineStore::new(BaselineConfig::default());
        let snapshot = BaselineSnapshot {
            schema_version: SCHEMA_VERSION.to_string(),
            saved_at: t0(),
            baselines: baselines
                .into_iter()
                .map(|b| (b.key.canonical(), b))
                .collect(),
        };
        store.restore(snapshot).unwrap();
        store
    }

    fn zscore_only_config() -> DetectionConfig {
        DetectionConfig {
            algorithms: vec![ScoreAlgorithm::Zscore],
            ensemble_min_votes: 1,
            ..DetectionConfig::default()
        }
    }

    fn snapshot_of(name: &str, value: f64) -> HashMap<MetricKey, f64> {
        HashMap::from([(MetricKey::bare(name), value)])
    }

    #[test]
    fn test_zscore_fires_above_threshold() {
        let score = score_zscore(140.0, 100.0, 10.0, 3.0);
        assert!(score.is_anomaly);
        assert!((score.details.sigma - 4.0).abs() < 1e-9);
        assert!((score.score - 4.0 / 6.0).abs() < 1e-9);

        let quiet = score_zscore(120.0, 100.0, 10.0, 3.0);
        assert!(!quiet.is_anomaly);
    }

    #[test]
    fn test_zscore_abstains_on_zero_std() {
        let score = score_zscore(500.0, 100.0, 0.0, 3.0);
        assert!(!score.is_anomaly);
        assert!(score.details.abstained);
        assert_eq!(score.score, 0.0);
    }

    #[test]
    fn test_mad_scoring_and_abstention() {
        // sigma = 60 / (1.4826 * 10) = 4.047
        let score = score_mad(160.0, 100.0, 10.0, 3.5);
        assert!(score.is_anomaly);
        assert!((score.details.sigma - 4.0469).abs() < 1e-3);

        let quiet = score_mad(150.0, 100.0, 10.0, 3.5);
        assert!(!quiet.is_anomaly);

        let flat = score_mad(500.0, 100.0, 0.0, 3.5);
        assert!(flat.details.abstained);
        assert!(!flat.is_anomaly);
    }

    #[test]
    fn test_score_normalization_saturates() {
        let score = score_zscore(1000.0, 100.0, 10.0, 3.0);
        assert_eq!(score.score, 1.0);

        // Threshold maps to the middle of the scale
        let at_threshold = score_zscore(130.0, 100.0, 10.0, 3.0);
        assert!((at_threshold.score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_min_votes_blocks_single_fire() {
        // ZScore fires (sigma 4) but MAD stays quiet (sigma 0.9), so
        // two required votes never confirm.
        let config = DetectionConfig {
            algorithms: vec![ScoreAlgorithm::Zscore, ScoreAlgorithm::Mad],
            ensemble_min_votes: 2,
            ..DetectionConfig::default()
        };
        let store = store_with(vec![fixture_baseline("cpu_usage", 100.0, 10.0, 100.0, 30.0)]);
        let mut detector = AnomalyDetector::new(config);

        let report = detector
            .process_tick(&snapshot_of("cpu_usage", 140.0), &store, t0())
            .unwrap();

        assert_eq!(report.evaluated, 1);
        assert!(report.opened.is_empty());
        assert!(detector.state().active.is_empty());
    }

    #[test]
    fn test_lifecycle_duration_gate() {
        let store = store_with(vec![fixture_baseline("cpu_usage", 100.0, 10.0, 100.0, 7.0)]);
        let mut detector = AnomalyDetector::new(zscore_only_config());

        let values = [100.0, 100.0, 340.0, 340.0, 340.0];
        let mut reports = Vec::new();
        for (i, value) in values.iter().enumerate() {
            let now = t0() + Duration::minutes(i as i64);
            reports.push(
                detector
                    .process_tick(&snapshot_of("cpu_usage", *value), &store, now)
                    .unwrap(),
            );
        }

        // Quiet ticks open nothing
        assert!(reports[0].opened.is_empty() && reports[1].opened.is_empty());

        // Tick 3: opened immediately, suppressed by the gate
        assert_eq!(reports[2].opened.len(), 1);
        assert!(reports[2].surfaced.is_empty());

        // Tick 4: one minute active, still suppressed
        assert_eq!(reports[3].extended.len(), 1);
        assert!(reports[3].surfaced.is_empty());

        // Tick 5: two minutes active, surfaced with the original start
        assert_eq!(reports[4].surfaced.len(), 1);
        let surfaced = &reports[4].surfaced[0];
        assert_eq!(surfaced.started_at, t0() + Duration::minutes(2));
        assert_eq!(surfaced.duration_minutes, 2);
        assert_eq!(surfaced.kind, AnomalyKind::Spike);
        assert_eq!(detector.state().active.len(), 1);
    }

    #[test]
    fn test_redetection_replaces_score_keeps_severity() {
        let store = store_with(vec![fixture_baseline("cpu_usage", 100.0, 10.0, 100.0, 7.0)]);
        let mut detector = AnomalyDetector::new(zscore_only_config());

        detector
            .process_tick(&snapshot_of("cpu_usage", 340.0), &store, t0())
            .unwrap();
        let first = detector
            .state()
            .active_for(&MetricKey::bare("cpu_usage"))
            .unwrap()
            .clone();
        assert_eq!(first.severity, Severity::Critical);
        assert_eq!(first.ensemble_score, 1.0);

        // Milder re-detection: sigma 3.5, Medium on its own
        detector
            .process_tick(
                &snapshot_of("cpu_usage", 135.0),
                &store,
                t0() + Duration::minutes(1),
            )
            .unwrap();
        let second = detector
            .state()
            .active_for(&MetricKey::bare("cpu_usage"))
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.started_at, first.started_at);
        assert_eq!(second.severity, Severity::Critical);
        assert!((second.ensemble_score - 3.5 / 6.0).abs() < 1e-9);
        assert_eq!(detector.state().active.len(), 1);
    }

    #[test]
    fn test_resolution_requires_all_algorithms_clear() {
        let store = store_with(vec![fixture_baseline("cpu_usage", 100.0, 10.0, 100.0, 7.0)]);
        let config = DetectionConfig {
            resolution_factor: 0.5,
            ..zscore_only_config()
        };
        let mut detector = AnomalyDetector::new(config);

        detector
            .process_tick(&snapshot_of("cpu_usage", 340.0), &store, t0())
            .unwrap();
        assert_eq!(detector.state().active.len(), 1);

        // Sigma 2: below the fire threshold but above 3.0 * 0.5
        let report = detector
            .process_tick(
                &snapshot_of("cpu_usage", 120.0),
                &store,
                t0() + Duration::minutes(1),
            )
            .unwrap();
        assert!(report.resolved.is_empty());
        assert_eq!(detector.state().active.len(), 1);

        // Sigma 1: clear of the scaled threshold, resolves
        let report = detector
            .process_tick(
                &snapshot_of("cpu_usage", 110.0),
                &store,
                t0() + Duration::minutes(2),
            )
            .unwrap();
        assert_eq!(report.resolved.len(), 1);
        assert!(detector.state().active.is_empty());
        assert_eq!(detector.state().resolved.len(), 1);
    }

    #[test]
    fn test_absent_key_leaves_anomaly_active() {
        let store = store_with(vec![
            fixture_baseline("cpu_usage", 100.0, 10.0, 100.0, 7.0),
            fixture_baseline("api_latency", 200.0, 20.0, 200.0, 15.0),
        ]);
        let mut detector = AnomalyDetector::new(zscore_only_config());

        detector
            .process_tick(&snapshot_of("cpu_usage", 340.0), &store, t0())
            .unwrap();

        // Next tick only reports the other metric
        detector
            .process_tick(
                &snapshot_of("api_latency", 200.0),
                &store,
                t0() + Duration::minutes(1),
            )
            .unwrap();

        assert!(detector
            .state()
            .active_for(&MetricKey::bare("cpu_usage"))
            .is_some());
    }

    #[test]
    fn test_missing_and_stale_baselines_skip() {
        let mut stale = fixture_baseline("api_latency", 200.0, 20.0, 200.0, 15.0);
        stale.updated_at = t0() - Duration::hours(48);
        let store = store_with(vec![stale]);
        let mut detector = AnomalyDetector::new(zscore_only_config());

        let snapshot = HashMap::from([
            (MetricKey::bare("unknown_metric"), 1.0),
            (MetricKey::bare("api_latency"), 900.0),
        ]);
        let report = detector.process_tick(&snapshot, &store, t0()).unwrap();

        assert_eq!(report.evaluated, 0);
        assert_eq!(report.skipped, 2);
        assert!(report.opened.is_empty());
    }

    #[test]
    fn test_severity_weighting_and_escalation() {
        // Infrastructure weight 1.0
        assert_eq!(
            classify_severity(4.2, MetricCategory::Infrastructure, 0, 30),
            Severity::High
        );
        // Wallet weight 2.0 doubles the deviation
        assert_eq!(
            classify_severity(2.6, MetricCategory::Wallet, 0, 30),
            Severity::Critical
        );
        assert_eq!(
            classify_severity(1.0, MetricCategory::Business, 0, 30),
            Severity::Low
        );
        // Thirty active minutes escalate one level
        assert_eq!(
            classify_severity(3.2, MetricCategory::Infrastructure, 30, 30),
            Severity::High
        );
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            classify_kind(&[100.0, 105.0, 112.0, 118.0, 125.0], 3.5, 10.0),
            AnomalyKind::Drift
        );
        assert_eq!(
            classify_kind(&[130.0, 110.0, 104.0, 101.0], -3.2, 10.0),
            AnomalyKind::Drift
        );
        assert_eq!(
            classify_kind(&[50.0, 50.0, 50.0, 50.0], -5.0, 10.0),
            AnomalyKind::Flatline
        );
        // Constant window with a flat baseline is not a flatline signal
        assert_eq!(
            classify_kind(&[50.0, 50.0, 50.0], -5.0, 0.0),
            AnomalyKind::Drop
        );
        assert_eq!(
            classify_kind(&[100.0, 100.0, 340.0], 24.0, 10.0),
            AnomalyKind::Spike
        );
        assert_eq!(classify_kind(&[30.0], -7.0, 10.0), AnomalyKind::Drop);
    }

    #[test]
    fn test_acknowledge_through_detector() {
        let store = store_with(vec![fixture_baseline("cpu_usage", 100.0, 10.0, 100.0, 7.0)]);
        let mut detector = AnomalyDetector::new(zscore_only_config());
        let report = detector
            .process_tick(&snapshot_of("cpu_usage", 340.0), &store, t0())
            .unwrap();
        let id = report.opened[0].clone();

        assert!(detector.acknowledge(&id.0, "oncall", t0()));
        assert!(!detector.acknowledge("ano-000000000000", "oncall", t0()));
    }
}
