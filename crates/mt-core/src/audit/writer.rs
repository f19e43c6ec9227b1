//! Audit log writer with hash chaining and size-based rotation.

use super::entry::{status, AuditRecord};
use super::{resolve_audit_dir, AUDIT_LOG_FILENAME};
use chrono::{DateTime, Duration, Utc};
use mt_common::{AnomalyId, AuditId, PlanId, Result};
use mt_config::AuditConfig;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Hash that opens the chain in every fresh log file.
pub const GENESIS_HASH: &str = "genesis";

// ---------------------------------------------------------------------------
// In-memory trail
// ---------------------------------------------------------------------------

/// Queryable index over audit records.
///
/// The JSONL file remains the source of truth; the trail is rebuilt from it
/// at startup and extended in step with every append.
#[derive(Debug, Default)]
pub struct AuditTrail {
    records: Vec<AuditRecord>,
    by_plan: HashMap<String, Vec<usize>>,
    by_anomaly: HashMap<String, Vec<usize>>,
}

impl AuditTrail {
    pub fn push(&mut self, record: AuditRecord) {
        let idx = self.records.len();
        if let Some(plan_id) = &record.plan_id {
            self.by_plan.entry(plan_id.0.clone()).or_default().push(idx);
        }
        if let Some(anomaly_id) = &record.anomaly_id {
            self.by_anomaly
                .entry(anomaly_id.0.clone())
                .or_default()
                .push(idx);
        }
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.by_plan.clear();
        self.by_anomaly.clear();
    }

    /// Records for one plan, oldest first.
    pub fn by_plan(&self, plan_id: &PlanId) -> Vec<&AuditRecord> {
        self.by_plan
            .get(&plan_id.0)
            .map(|ids| ids.iter().map(|i| &self.records[*i]).collect())
            .unwrap_or_default()
    }

    /// Records for one anomaly, oldest first.
    pub fn by_anomaly(&self, anomaly_id: &AnomalyId) -> Vec<&AuditRecord> {
        self.by_anomaly
            .get(&anomaly_id.0)
            .map(|ids| ids.iter().map(|i| &self.records[*i]).collect())
            .unwrap_or_default()
    }

    /// Newest records first, optionally restricted to one action type.
    pub fn recent(&self, n: usize, action_type: Option<&str>) -> Vec<&AuditRecord> {
        self.records
            .iter()
            .rev()
            .filter(|r| action_type.is_none_or(|t| r.action_type == t))
            .take(n)
            .collect()
    }

    /// Newest failed or rolled-back records first.
    pub fn failures(&self, limit: usize) -> Vec<&AuditRecord> {
        self.records
            .iter()
            .rev()
            .filter(|r| r.status == status::FAILED || r.status == status::ROLLED_BACK)
            .take(limit)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

/// Appends hash-chained records to the JSONL file and mirrors them into the
/// in-memory trail.
///
/// Appends serialize on `&mut self`. File write failures are reported on
/// stderr and never surfaced to callers; the record stays queryable in
/// memory either way.
pub struct AuditLogger {
    dir: PathBuf,
    path: PathBuf,
    config: AuditConfig,
    last_hash: String,
    records_written: u64,
    writer: Option<BufWriter<File>>,
    trail: AuditTrail,
}

impl AuditLogger {
    /// Open the audit log under the configured directory, creating it on
    /// first use. Reopening resumes the hash chain from the last record.
    pub fn open(config: AuditConfig) -> Result<Self> {
        let dir = match &config.dir {
            Some(dir) => dir.clone(),
            None => resolve_audit_dir()?,
        };
        fs::create_dir_all(&dir)?;
        let path = dir.join(AUDIT_LOG_FILENAME);

        let (last_hash, records_written) = if path.exists() {
            read_chain_state(&path)?
        } else {
            (GENESIS_HASH.to_string(), 0)
        };

        Ok(AuditLogger {
            dir,
            path,
            config,
            last_hash,
            records_written,
            writer: None,
            trail: AuditTrail::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hash of the most recently written record.
    pub fn last_hash(&self) -> &str {
        &self.last_hash
    }

    /// Records written to the current file since its chain started.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn trail(&self) -> &AuditTrail {
        &self.trail
    }

    /// Append one record to the file and the trail, chaining its hash.
    pub fn log_action(&mut self, mut record: AuditRecord) -> AuditId {
        let id = record.id.clone();
        if !self.config.enabled {
            return id;
        }

        if let Err(e) = self.rotate_if_needed(record.ts) {
            eprintln!("audit: rotation failed for {}: {}", self.path.display(), e);
        }

        record.prev_hash = self.last_hash.clone();
        record.compute_hash();

        match self.append_line(&record) {
            Ok(()) => {
                self.last_hash = record.hash().to_string();
                self.records_written += 1;
            }
            Err(e) => {
                eprintln!("audit: failed to append record {}: {}", record.id, e);
            }
        }

        self.trail.push(record);
        id
    }

    /// Rebuild the trail from the live file, keeping records inside the
    /// trailing window. Malformed lines are skipped with a warning.
    pub fn load_from_file(&mut self, days: i64, now: DateTime<Utc>) -> Result<usize> {
        self.trail.clear();
        if !self.path.exists() {
            return Ok(0);
        }

        let cutoff = now - Duration::days(days);
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut loaded = 0usize;

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    warn!(line = idx + 1, error = %e, "skipping malformed audit record");
                    continue;
                }
            };
            if record.ts < cutoff {
                continue;
            }
            self.trail.push(record);
            loaded += 1;
        }

        Ok(loaded)
    }

    /// Rename the live file aside and start a fresh chain.
    pub fn rotate(&mut self, now: DateTime<Utc>) -> Result<PathBuf> {
        self.writer = None;
        let rotated = self
            .dir
            .join(format!("audit.{}.jsonl", now.format("%Y%m%d-%H%M%S")));
        fs::rename(&self.path, &rotated)?;
        info!(rotated = %rotated.display(), "rotated audit log");
        self.last_hash = GENESIS_HASH.to_string();
        self.records_written = 0;
        Ok(rotated)
    }

    // Query surface, delegated to the trail.

    pub fn by_plan(&self, plan_id: &PlanId) -> Vec<&AuditRecord> {
        self.trail.by_plan(plan_id)
    }

    pub fn by_anomaly(&self, anomaly_id: &AnomalyId) -> Vec<&AuditRecord> {
        self.trail.by_anomaly(anomaly_id)
    }

    pub fn recent(&self, n: usize, action_type: Option<&str>) -> Vec<&AuditRecord> {
        self.trail.recent(n, action_type)
    }

    pub fn failures(&self, limit: usize) -> Vec<&AuditRecord> {
        self.trail.failures(limit)
    }

    fn rotate_if_needed(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let size = fs::metadata(&self.path)?.len();
        if size >= self.config.max_file_bytes {
            self.rotate(now)?;
        }
        Ok(())
    }

    fn append_line(&mut self, record: &AuditRecord) -> Result<()> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{}", record.to_jsonl())?;
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

/// Resume point for an existing file: last good record hash and line count.
///
/// Malformed lines are skipped so a torn final write cannot brick startup;
/// `verify` still reports them.
fn read_chain_state(path: &Path) -> Result<(String, u64)> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut last_hash = GENESIS_HASH.to_string();
    let mut count = 0u64;

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditRecord>(&line) {
            Ok(record) => {
                if let Some(hash) = &record.entry_hash {
                    last_hash = hash.clone();
                }
                count += 1;
            }
            Err(e) => {
                warn!(line = idx + 1, error = %e, "skipping malformed audit record");
            }
        }
    }

    Ok((last_hash, count))
}
