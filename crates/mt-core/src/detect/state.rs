//! Anomaly model and the active-anomaly registry.
//!
//! `AnomalyState` holds exactly one active anomaly per metric key.
//! Re-detections upsert in place: identity and start time survive,
//! scores are replaced with the latest tick's, severity only ever
//! rises. Resolved anomalies move to an append-only list. The whole
//! registry round-trips through JSON so a restart resumes mid-incident.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::BufWriter;
use std::path::Path;

use mt_common::{AnomalyId, Error, MetricCategory, MetricKey, Result, SCHEMA_VERSION};
use mt_config::ScoreAlgorithm;

/// Anomaly severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Band a category-weighted deviation into a severity.
    pub fn from_weighted_deviation(weighted: f64) -> Self {
        if weighted >= 5.0 {
            Severity::Critical
        } else if weighted >= 4.0 {
            Severity::High
        } else if weighted >= 3.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// One level up, saturating at Critical.
    pub fn escalate(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Shape of the deviation, refined as the anomaly evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Spike,
    Drop,
    Drift,
    Flatline,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnomalyKind::Spike => "spike",
            AnomalyKind::Drop => "drop",
            AnomalyKind::Drift => "drift",
            AnomalyKind::Flatline => "flatline",
        };
        write!(f, "{}", s)
    }
}

/// Inputs an algorithm used for one score, kept for the audit record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreDetails {
    /// Raw sigma-equivalent distance, before normalization.
    pub sigma: f64,
    /// Center the distance was measured from (mean or median).
    pub center: f64,
    /// Spread the distance was scaled by (std or scaled MAD).
    pub spread: f64,
    /// True when the algorithm could not vote (zero spread).
    #[serde(default)]
    pub abstained: bool,
}

/// One algorithm's verdict for one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyScore {
    pub algorithm: ScoreAlgorithm,
    /// Normalized to [0,1]; the configured threshold maps to 0.5.
    pub score: f64,
    pub threshold: f64,
    pub is_anomaly: bool,
    pub details: ScoreDetails,
}

/// A detected deviation on one metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: AnomalyId,
    pub key: MetricKey,
    pub category: MetricCategory,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub current_value: f64,
    /// Expected value at the latest tick.
    pub baseline_value: f64,
    /// Signed deviation in sigma units.
    pub deviation: f64,
    pub deviation_percent: f64,
    /// Latest tick's scores; replaced whole on every re-detection.
    pub scores: Vec<AnomalyScore>,
    /// Latest tick's ensemble score, never averaged across ticks.
    pub ensemble_score: f64,
    pub detected_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    /// Recomputed as now - started_at on every tick while active.
    pub duration_minutes: i64,
    pub is_active: bool,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

/// Registry of active and resolved anomalies, keyed by canonical metric key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyState {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    #[serde(default)]
    pub active: HashMap<String, Anomaly>,

    /// Append-only; resolution order.
    #[serde(default)]
    pub resolved: Vec<Anomaly>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for AnomalyState {
    fn default() -> Self {
        Self::new()
    }
}

impl AnomalyState {
    pub fn new() -> Self {
        AnomalyState {
            schema_version: SCHEMA_VERSION.to_string(),
            active: HashMap::new(),
            resolved: Vec::new(),
            last_updated: None,
        }
    }

    /// Insert or extend the active anomaly for the candidate's key.
    ///
    /// On extension the existing identity, start time, and acknowledgment
    /// survive; values and scores come from the candidate; severity is
    /// `max(previous, new)`. Returns the stored anomaly and whether it
    /// was newly opened.
    pub fn upsert(&mut self, candidate: Anomaly, now: DateTime<Utc>) -> (Anomaly, bool) {
        self.last_updated = Some(now);
        let canonical = candidate.key.canonical();

        match self.active.get_mut(&canonical) {
            Some(existing) => {
                existing.kind = candidate.kind;
                existing.severity = existing.severity.max(candidate.severity);
                existing.current_value = candidate.current_value;
                existing.baseline_value = candidate.baseline_value;
                existing.deviation = candidate.deviation;
                existing.deviation_percent = candidate.deviation_percent;
                existing.scores = candidate.scores;
                existing.ensemble_score = candidate.ensemble_score;
                existing.duration_minutes = (now - existing.started_at).num_minutes();
                (existing.clone(), false)
            }
            None => {
                self.active.insert(canonical.clone(), candidate);
                (self.active[&canonical].clone(), true)
            }
        }
    }

    /// Recompute the duration of an active anomaly without touching its
    /// scores. Used on ticks that neither extend nor resolve.
    pub fn refresh_duration(&mut self, canonical: &str, now: DateTime<Utc>) {
        if let Some(anomaly) = self.active.get_mut(canonical) {
            anomaly.duration_minutes = (now - anomaly.started_at).num_minutes();
            self.last_updated = Some(now);
        }
    }

    /// Close the active anomaly for a key and move it to the resolved
    /// list. Returns the resolved anomaly.
    pub fn resolve(&mut self, canonical: &str, now: DateTime<Utc>) -> Option<Anomaly> {
        let mut anomaly = self.active.remove(canonical)?;
        anomaly.is_active = false;
        anomaly.resolved_at = Some(now);
        anomaly.duration_minutes = (now - anomaly.started_at).num_minutes();
        self.last_updated = Some(now);
        self.resolved.push(anomaly.clone());
        Some(anomaly)
    }

    /// Mark an active anomaly acknowledged. Returns false when the id is
    /// unknown or already resolved.
    pub fn acknowledge(&mut self, id: &str, by: &str, now: DateTime<Utc>) -> bool {
        for anomaly in self.active.values_mut() {
            if anomaly.id.0 == id {
                anomaly.acknowledged = true;
                anomaly.acknowledged_by = Some(by.to_string());
                self.last_updated = Some(now);
                return true;
            }
        }
        false
    }

    /// Active anomalies ordered by start time, oldest first.
    pub fn active_anomalies(&self) -> Vec<&Anomaly> {
        let mut list: Vec<&Anomaly> = self.active.values().collect();
        list.sort_by_key(|a| (a.started_at, a.key.canonical()));
        list
    }

    /// Active anomalies at or above a severity floor.
    pub fn active_at_least(&self, floor: Severity) -> Vec<&Anomaly> {
        self.active_anomalies()
            .into_iter()
            .filter(|a| a.severity >= floor)
            .collect()
    }

    /// Active anomalies past the minimum-duration gate.
    pub fn surfaced(&self, min_duration_minutes: i64) -> Vec<&Anomaly> {
        self.active_anomalies()
            .into_iter()
            .filter(|a| a.duration_minutes >= min_duration_minutes)
            .collect()
    }

    /// Look an anomaly up by id, active first, then resolved.
    pub fn get(&self, id: &str) -> Option<&Anomaly> {
        self.active
            .values()
            .find(|a| a.id.0 == id)
            .or_else(|| self.resolved.iter().find(|a| a.id.0 == id))
    }

    /// The active anomaly for a metric key, if any.
    pub fn active_for(&self, key: &MetricKey) -> Option<&Anomaly> {
        self.active.get(&key.canonical())
    }

    /// Write the registry atomically (temp file + rename).
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        let file = fs::File::create(&temp_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Reload a registry saved by `save_to_file`.
    pub fn load_from_file(path: &Path) -> Result<AnomalyState> {
        let text = fs::read_to_string(path)?;
        let state: AnomalyState = serde_json::from_str(&text)?;
        if state.schema_version != SCHEMA_VERSION {
            return Err(Error::SchemaVersion {
                expected: SCHEMA_VERSION.to_string(),
                actual: state.schema_version,
            });
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()
    }

    fn fixture(name: &str, severity: Severity, now: DateTime<Utc>) -> Anomaly {
        Anomaly {
            id: AnomalyId::new(),
            key: MetricKey::bare(name),
            category: MetricKey::bare(name).category(),
            kind: AnomalyKind::Spike,
            severity,
            current_value: 340.0,
            baseline_value: 100.0,
            deviation: 24.0,
            deviation_percent: 240.0,
            scores: Vec::new(),
            ensemble_score: 1.0,
            detected_at: now,
            started_at: now,
            duration_minutes: 0,
            is_active: true,
            acknowledged: false,
            acknowledged_by: None,
            resolved_at: None,
        }
    }

    #[test]
    fn test_severity_banding_and_escalation() {
        assert_eq!(Severity::from_weighted_deviation(2.9), Severity::Low);
        assert_eq!(Severity::from_weighted_deviation(3.0), Severity::Medium);
        assert_eq!(Severity::from_weighted_deviation(4.5), Severity::High);
        assert_eq!(Severity::from_weighted_deviation(5.0), Severity::Critical);

        assert_eq!(Severity::Low.escalate(), Severity::Medium);
        assert_eq!(Severity::Critical.escalate(), Severity::Critical);
        assert!(Severity::Low < Severity::Critical);
    }

    #[test]
    fn test_upsert_opens_then_extends_in_place() {
        let mut state = AnomalyState::new();
        let (first, opened) = state.upsert(fixture("cpu_usage", Severity::Critical, t0()), t0());
        assert!(opened);
        assert_eq!(state.active.len(), 1);

        let later = t0() + Duration::minutes(3);
        let mut candidate = fixture("cpu_usage", Severity::Medium, later);
        candidate.ensemble_score = 0.58;
        candidate.current_value = 135.0;
        let (merged, opened) = state.upsert(candidate, later);

        assert!(!opened);
        assert_eq!(state.active.len(), 1);
        assert_eq!(merged.id, first.id);
        assert_eq!(merged.started_at, t0());
        assert_eq!(merged.duration_minutes, 3);
        // Latest score wins, severity never drops
        assert!((merged.ensemble_score - 0.58).abs() < 1e-9);
        assert_eq!(merged.severity, Severity::Critical);
        assert!((merged.current_value - 135.0).abs() < 1e-9);
    }

    #[test]
    fn test_resolve_moves_to_resolved_list() {
        let mut state = AnomalyState::new();
        state.upsert(fixture("cpu_usage", Severity::High, t0()), t0());

        let later = t0() + Duration::minutes(10);
        let resolved = state.resolve("cpu_usage", later).unwrap();
        assert!(!resolved.is_active);
        assert_eq!(resolved.resolved_at, Some(later));
        assert_eq!(resolved.duration_minutes, 10);
        assert!(state.active.is_empty());
        assert_eq!(state.resolved.len(), 1);

        assert!(state.resolve("cpu_usage", later).is_none());
    }

    #[test]
    fn test_acknowledge_only_touches_active() {
        let mut state = AnomalyState::new();
        let (anomaly, _) = state.upsert(fixture("cpu_usage", Severity::High, t0()), t0());

        assert!(state.acknowledge(&anomaly.id.0, "oncall", t0()));
        let stored = state.active_for(&MetricKey::bare("cpu_usage")).unwrap();
        assert!(stored.acknowledged);
        assert_eq!(stored.acknowledged_by.as_deref(), Some("oncall"));

        assert!(!state.acknowledge("ano-000000000000", "oncall", t0()));

        state.resolve("cpu_usage", t0() + Duration::minutes(1));
        assert!(!state.acknowledge(&anomaly.id.0, "oncall", t0()));
    }

    #[test]
    fn test_acknowledged_anomaly_still_resolves() {
        let mut state = AnomalyState::new();
        let (anomaly, _) = state.upsert(fixture("cpu_usage", Severity::High, t0()), t0());
        state.acknowledge(&anomaly.id.0, "oncall", t0());

        let resolved = state.resolve("cpu_usage", t0() + Duration::minutes(5)).unwrap();
        assert!(resolved.acknowledged);
        assert!(!resolved.is_active);
    }

    #[test]
    fn test_surfaced_respects_duration_gate() {
        let mut state = AnomalyState::new();
        state.upsert(fixture("cpu_usage", Severity::High, t0()), t0());
        let later = t0() + Duration::minutes(1);
        let mut other = fixture("api_latency", Severity::High, later);
        other.started_at = t0() - Duration::minutes(5);
        other.duration_minutes = 6;
        state.upsert(other, later);

        let surfaced = state.surfaced(2);
        assert_eq!(surfaced.len(), 1);
        assert_eq!(surfaced[0].key.canonical(), "api_latency");
    }

    #[test]
    fn test_active_sorted_and_severity_floor() {
        let mut state = AnomalyState::new();
        let mut late = fixture("api_latency", Severity::Low, t0());
        late.started_at = t0() + Duration::minutes(2);
        state.upsert(late, t0() + Duration::minutes(2));
        state.upsert(fixture("cpu_usage", Severity::Critical, t0()), t0());

        let active = state.active_anomalies();
        assert_eq!(active[0].key.canonical(), "cpu_usage");
        assert_eq!(active[1].key.canonical(), "api_latency");

        let severe = state.active_at_least(Severity::High);
        assert_eq!(severe.len(), 1);
        assert_eq!(severe[0].key.canonical(), "cpu_usage");
    }

    #[test]
    fn test_get_searches_active_then_resolved() {
        let mut state = AnomalyState::new();
        let (anomaly, _) = state.upsert(fixture("cpu_usage", Severity::High, t0()), t0());
        assert!(state.get(&anomaly.id.0).unwrap().is_active);

        state.resolve("cpu_usage", t0() + Duration::minutes(1));
        assert!(!state.get(&anomaly.id.0).unwrap().is_active);
        assert!(state.get("ano-ffffffffffff").is_none());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anomalies.json");

        let mut state = AnomalyState::new();
        state.upsert(fixture("cpu_usage", Severity::High, t0()), t0());
        state.upsert(fixture("api_latency", Severity::Low, t0()), t0());
        state.resolve("api_latency", t0() + Duration::minutes(4));
        state.save_to_file(&path).unwrap();

        let loaded = AnomalyState::load_from_file(&path).unwrap();
        assert_eq!(loaded.active.len(), 1);
        assert_eq!(loaded.resolved.len(), 1);
        assert_eq!(loaded.last_updated, state.last_updated);
        assert!(loaded.active.contains_key("cpu_usage"));
    }

    #[test]
    fn test_load_rejects_wrong_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anomalies.json");
        let mut state = AnomalyState::new();
        state.schema_version = "9.9.9".to_string();
        state.save_to_file(&path).unwrap();

        let err = AnomalyState::load_from_file(&path).unwrap_err();
        assert!(matches!(err, Error::SchemaVersion { .. }));
    }
}
