//! In-memory baseline store with JSON snapshot persistence.
//!
//! The store is keyed by the canonical metric key and shared between
//! the learning pass and the detection loop. Snapshots serialize every
//! baseline so an engine restart resumes from the profiles it had, not
//! from an empty slate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::BufWriter;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use mt_common::{Error, MetricKey, Result, SCHEMA_VERSION};
use mt_config::BaselineConfig;

use super::{learn_baseline, Baseline};
use crate::source::{MetricSeries, MetricSource};

/// Serialized form of the whole store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineSnapshot {
    pub schema_version: String,
    pub saved_at: DateTime<Utc>,
    pub baselines: HashMap<String, Baseline>,
}

/// Result of a bulk learning pass over a source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearnReport {
    /// Canonical keys that produced a baseline.
    pub learned: Vec<String>,
    /// Canonical keys skipped, with the reason.
    pub skipped: Vec<(String, String)>,
}

/// Concurrent baseline store.
pub struct BaselineStore {
    config: BaselineConfig,
    baselines: RwLock<HashMap<String, Arc<Baseline>>>,
}

impl BaselineStore {
    pub fn new(config: BaselineConfig) -> Self {
        BaselineStore {
            config,
            baselines: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BaselineConfig {
        &self.config
    }

    /// Learn a baseline from a series and store it.
    pub fn learn(&self, series: &MetricSeries, now: DateTime<Utc>) -> Result<Arc<Baseline>> {
        let baseline = Arc::new(learn_baseline(series, &self.config, now)?);
        let key = baseline.key.canonical();

        let mut guard = self.write_guard()?;
        guard.insert(key.clone(), Arc::clone(&baseline));

        info!(
            key = %key,
            samples = baseline.sample_count,
            quality = baseline.quality_score,
            days = baseline.coverage_days,
            "learned baseline"
        );
        Ok(baseline)
    }

    /// Learn baselines for every key a source serves.
    ///
    /// Per-key failures are recorded and skipped; one bad metric must
    /// not abort the learning pass.
    pub fn learn_from_source(
        &self,
        source: &dyn MetricSource,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> LearnReport {
        let mut report = LearnReport::default();

        for key in source.keys() {
            let canonical = key.canonical();
            let outcome = source
                .fetch_range(&key, start, end)
                .and_then(|series| self.learn(&series, now));

            match outcome {
                Ok(_) => report.learned.push(canonical),
                Err(err) => {
                    warn!(key = %canonical, error = %err, "skipping baseline");
                    report.skipped.push((canonical, err.to_string()));
                }
            }
        }

        report
    }

    /// Baseline for a metric, if one has been learned.
    pub fn get(&self, key: &MetricKey) -> Result<Option<Arc<Baseline>>> {
        let guard = self.read_guard()?;
        Ok(guard.get(&key.canonical()).cloned())
    }

    /// Expected (mean, std) at a timestamp, if a baseline exists.
    pub fn expected_value(
        &self,
        key: &MetricKey,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<(f64, f64)>> {
        Ok(self.get(key)?.map(|b| b.expected_value(timestamp)))
    }

    pub fn len(&self) -> usize {
        self.read_guard().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Canonical keys of every stored baseline, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        let guard = self.read_guard()?;
        let mut keys: Vec<String> = guard.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// Keys whose baseline has not been refreshed within the staleness
    /// window from config.
    pub fn stale_keys(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let guard = self.read_guard()?;
        let mut stale: Vec<String> = guard
            .iter()
            .filter(|(_, b)| b.is_stale(now, self.config.stale_after_hours))
            .map(|(k, _)| k.clone())
            .collect();
        stale.sort();
        Ok(stale)
    }

    /// Serialize the whole store.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Result<BaselineSnapshot> {
        let guard = self.read_guard()?;
        let baselines = guard
            .iter()
            .map(|(k, b)| (k.clone(), (**b).clone()))
            .collect();
        Ok(BaselineSnapshot {
            schema_version: SCHEMA_VERSION.to_string(),
            saved_at: now,
            baselines,
        })
    }

    /// Replace store contents from a snapshot. Returns the number of
    /// baselines restored.
    pub fn restore(&self, snapshot: BaselineSnapshot) -> Result<usize> {
        if snapshot.schema_version != SCHEMA_VERSION {
            return Err(Error::SchemaVersion {
                expected: SCHEMA_VERSION.to_string(),
                actual: snapshot.schema_version,
            });
        }

        let mut guard = self.write_guard()?;
        guard.clear();
        let count = snapshot.baselines.len();
        for (key, baseline) in snapshot.baselines {
            guard.insert(key, Arc::new(baseline));
        }
        Ok(count)
    }

    /// Write a snapshot atomically (temp file + rename).
    pub fn save_to_file(&self, path: &Path, now: DateTime<Utc>) -> Result<()> {
        let snapshot = self.snapshot(now)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        let file = fs::File::create(&temp_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &snapshot)?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Load a snapshot file into the store. Returns the number of
    /// baselines restored.
    pub fn load_from_file(&self, path: &Path) -> Result<usize> {
        let text = fs::read_to_string(path)?;
        let snapshot: BaselineSnapshot = serde_json::from_str(&text)?;
        self.restore(snapshot)
    }

    fn read_guard(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Baseline>>>> {
        self.baselines
            .read()
            .map_err(|e| Error::Baseline(format!("lock poisoned: {}", e)))
    }

    fn write_guard(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Baseline>>>> {
        self.baselines
            .write()
            .map_err(|e| Error::Baseline(format!("lock poisoned: {}", e)))
    }
}
