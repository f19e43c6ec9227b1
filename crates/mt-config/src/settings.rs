//! Engine configuration types.
//!
//! Every field has a default, so an absent config file yields a fully
//! usable configuration. Defaults are conservative: two-algorithm
//! ensemble, two-minute confirmation gate, approval required above the
//! auto tier.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Detection algorithms available to the ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreAlgorithm {
    Zscore,
    Mad,
}

impl std::fmt::Display for ScoreAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScoreAlgorithm::Zscore => write!(f, "zscore"),
            ScoreAlgorithm::Mad => write!(f, "mad"),
        }
    }
}

impl std::str::FromStr for ScoreAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zscore" => Ok(ScoreAlgorithm::Zscore),
            "mad" => Ok(ScoreAlgorithm::Mad),
            other => Err(format!("unknown algorithm: {}", other)),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    #[serde(default)]
    pub baseline: BaselineConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub approval: ApprovalConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub audit: AuditConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            baseline: BaselineConfig::default(),
            detection: DetectionConfig::default(),
            risk: RiskConfig::default(),
            approval: ApprovalConfig::default(),
            execution: ExecutionConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

fn default_schema_version() -> String {
    crate::CONFIG_SCHEMA_VERSION.to_string()
}

/// Baseline learning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineConfig {
    /// Minimum days of history before a baseline may be learned.
    pub min_history_days: i64,

    /// History span at which the coverage quality factor saturates.
    pub optimal_history_days: i64,

    /// Relearn cadence for the external recompute job.
    pub learning_interval_hours: u64,

    /// Age past which a baseline is advisory-stale.
    pub stale_after_hours: u64,

    /// Minimum samples an hour bucket needs to get its own stats.
    pub min_hourly_samples: usize,

    /// Minimum samples an (hour, weekday) bucket needs for an adjustment.
    pub min_dow_samples: usize,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            min_history_days: 7,
            optimal_history_days: 30,
            learning_interval_hours: 24,
            stale_after_hours: 24,
            min_hourly_samples: 5,
            min_dow_samples: 3,
        }
    }
}

/// Anomaly detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Tick cadence for the detection loop.
    pub check_interval_seconds: u64,

    /// Enabled ensemble members, in vote order.
    pub algorithms: Vec<ScoreAlgorithm>,

    /// Sigma threshold for the z-score algorithm.
    pub zscore_threshold: f64,

    /// Scaled-MAD threshold for the MAD algorithm.
    pub mad_threshold: f64,

    /// Algorithms that must agree before a tick counts as anomalous.
    pub ensemble_min_votes: usize,

    /// Active minutes before an anomaly is surfaced downstream.
    pub min_anomaly_duration_minutes: i64,

    /// Resolution threshold multiplier; values below 1.0 add hysteresis.
    pub resolution_factor: f64,

    /// Recent-value window used to classify drift and flatline.
    pub trend_window: usize,

    /// Active minutes after which severity escalates one level.
    pub severity_escalation_minutes: i64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 60,
            algorithms: vec![ScoreAlgorithm::Zscore, ScoreAlgorithm::Mad],
            zscore_threshold: 3.0,
            mad_threshold: 3.5,
            ensemble_min_votes: 2,
            min_anomaly_duration_minutes: 2,
            resolution_factor: 1.0,
            trend_window: 5,
            severity_escalation_minutes: 30,
        }
    }
}

/// Risk assessment configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default)]
    pub weights: RiskWeights,

    #[serde(default)]
    pub thresholds: RiskThresholds,
}

/// Risk factor weights. Must sum to 1.0; validated at load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskWeights {
    pub severity: f64,
    pub urgency: f64,
    pub impact: f64,
    pub complexity: f64,
}

impl RiskWeights {
    pub fn sum(&self) -> f64 {
        self.severity + self.urgency + self.impact + self.complexity
    }
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            severity: 0.35,
            urgency: 0.25,
            impact: 0.25,
            complexity: 0.15,
        }
    }
}

/// Risk tier thresholds. Must be strictly ascending; validated at load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub auto: f64,
    pub semi_auto: f64,
    pub manual: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            auto: 0.4,
            semi_auto: 0.6,
            manual: 0.8,
        }
    }
}

/// Approval workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Minutes a plan may wait for approvals before expiring.
    pub timeout_minutes: i64,

    /// Distinct approvers required at the semi-auto tier.
    pub required_approvers_semi_auto: u32,

    /// Distinct approvers required at the manual tier.
    pub required_approvers_manual: u32,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 30,
            required_approvers_semi_auto: 1,
            required_approvers_manual: 2,
        }
    }
}

/// Remediation execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Master switch; disabled engines still detect and plan.
    pub enabled: bool,

    /// Walk plans without calling the executor.
    pub dry_run: bool,

    /// Plans allowed to execute at once.
    pub max_concurrent: usize,

    /// Per-target quiet period after any action.
    pub cooldown_minutes: i64,

    /// Roll back completed steps when a later step fails.
    pub rollback_on_failure: bool,

    #[serde(default)]
    pub blacklist: BlacklistConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run: false,
            max_concurrent: 3,
            cooldown_minutes: 5,
            rollback_on_failure: true,
            blacklist: BlacklistConfig::default(),
        }
    }
}

/// Targets the engine must never touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistConfig {
    /// Namespaces excluded from remediation.
    pub namespaces: Vec<String>,

    /// `key=value` labels excluded from remediation; matched against the
    /// anomalous metric's labels.
    pub labels: Vec<String>,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            namespaces: vec!["kube-system".to_string()],
            labels: vec!["do-not-remediate=true".to_string()],
        }
    }
}

/// Audit trail configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub enabled: bool,

    /// Days of records replayed into memory at startup.
    pub retention_days: i64,

    /// Audit directory override; defaults to the resolved data dir.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Rotate the live file past this size.
    pub max_file_bytes: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 90,
            dir: None,
            max_file_bytes: 64 * 1024 * 1024,
        }
    }
}
