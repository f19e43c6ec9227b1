//! Error types for Metric Triage.
//!
//! This module provides structured error handling with:
//! - Stable error codes for machine parsing
//! - Category classification for error grouping
//! - Recoverability hints for automation
//! - Remediation suggestions for humans
//! - Suggested actions for agents
//!
//! # Human-Facing Output
//!
//! Errors can be formatted for human consumption with headline, reason, and fix:
//! ```text
//! ✗ Invalid Risk Weights
//!   Reason: risk weights must sum to 1.0, got 1.25
//!   Fix: Adjust [risk.weights] so the four factors sum to 1.0, then re-run 'mt-core check'.
//! ```
//!
//! # Agent-Facing Output
//!
//! Errors serialize to structured JSON:
//! ```json
//! {
//!   "code": 11,
//!   "category": "config",
//!   "message": "risk weights must sum to 1.0, got 1.25",
//!   "recoverable": true,
//!   "suggested_action": "run_check",
//!   "context": { "sum": 1.25 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for Metric Triage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration errors (weights, thresholds, schema).
    Config,
    /// Baseline learning and lookup errors.
    Baseline,
    /// Anomaly detection errors.
    Detection,
    /// Plan lifecycle and approval errors.
    Plan,
    /// Remediation execution errors.
    Execution,
    /// Audit trail errors.
    Audit,
    /// File I/O and serialization errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Baseline => write!(f, "baseline"),
            ErrorCategory::Detection => write!(f, "detection"),
            ErrorCategory::Plan => write!(f, "plan"),
            ErrorCategory::Execution => write!(f, "execution"),
            ErrorCategory::Audit => write!(f, "audit"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Suggested actions for agents to take in response to errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    /// Retry the operation (possibly with backoff).
    Retry,
    /// Run validation/check command.
    RunCheck,
    /// Reset configuration to defaults.
    ResetConfig,
    /// Relearn baselines from fresh history.
    Relearn,
    /// Wait for a resource to become available.
    Wait,
    /// Skip this item and continue.
    Skip,
    /// Abort the operation.
    Abort,
    /// Manual intervention required.
    ManualIntervention,
    /// No action needed (informational).
    None,
}

impl std::fmt::Display for SuggestedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuggestedAction::Retry => write!(f, "retry"),
            SuggestedAction::RunCheck => write!(f, "run_check"),
            SuggestedAction::ResetConfig => write!(f, "reset_config"),
            SuggestedAction::Relearn => write!(f, "relearn"),
            SuggestedAction::Wait => write!(f, "wait"),
            SuggestedAction::Skip => write!(f, "skip"),
            SuggestedAction::Abort => write!(f, "abort"),
            SuggestedAction::ManualIntervention => write!(f, "manual_intervention"),
            SuggestedAction::None => write!(f, "none"),
        }
    }
}

/// Unified error type for Metric Triage.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("risk weights must sum to 1.0, got {sum}")]
    InvalidWeights { sum: f64 },

    #[error("invalid risk thresholds: {0}")]
    InvalidThresholds(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersion { expected: String, actual: String },

    // Baseline errors (20-29)
    #[error("baseline error: {0}")]
    Baseline(String),

    #[error("empty sample series for metric {key}")]
    EmptySeries { key: String },

    #[error("insufficient history for {key}: {days} days, need {required}")]
    InsufficientHistory { key: String, days: i64, required: i64 },

    #[error("no baseline for metric {key}")]
    BaselineMissing { key: String },

    // Detection errors (30-39)
    #[error("detection error: {0}")]
    Detection(String),

    #[error("anomaly not found: {id}")]
    AnomalyNotFound { id: String },

    // Plan errors (40-49)
    #[error("plan error: {0}")]
    Plan(String),

    #[error("plan not found: {plan_id}")]
    PlanNotFound { plan_id: String },

    #[error("plan {plan_id} cannot move from {from} to {to}")]
    InvalidTransition {
        plan_id: String,
        from: String,
        to: String,
    },

    // Execution errors (50-59)
    #[error("step {step_id} failed: {message}")]
    ExecutionFailed { step_id: String, message: String },

    #[error("target {target} is blacklisted")]
    TargetBlacklisted { target: String },

    #[error("target {target} is cooling down for {remaining_minutes}min")]
    TargetCoolingDown {
        target: String,
        remaining_minutes: i64,
    },

    #[error("concurrent execution limit reached ({limit})")]
    ConcurrencyLimit { limit: usize },

    // Audit errors (60-69)
    #[error("audit error: {0}")]
    Audit(String),

    #[error("malformed audit record at line {line}")]
    AuditParse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("audit chain broken at line {line}: {reason}")]
    ChainBroken { line: usize, reason: String },

    #[error("no writable data directory available")]
    DataDirUnavailable,

    // I/O errors (70-79)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Configuration errors
    /// - 20-29: Baseline errors
    /// - 30-39: Detection errors
    /// - 40-49: Plan errors
    /// - 50-59: Execution errors
    /// - 60-69: Audit errors
    /// - 70-79: I/O errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidWeights { .. } => 11,
            Error::InvalidThresholds(_) => 12,
            Error::SchemaVersion { .. } => 13,
            Error::Baseline(_) => 20,
            Error::EmptySeries { .. } => 21,
            Error::InsufficientHistory { .. } => 22,
            Error::BaselineMissing { .. } => 23,
            Error::Detection(_) => 30,
            Error::AnomalyNotFound { .. } => 31,
            Error::Plan(_) => 40,
            Error::PlanNotFound { .. } => 41,
            Error::InvalidTransition { .. } => 42,
            Error::ExecutionFailed { .. } => 50,
            Error::TargetBlacklisted { .. } => 51,
            Error::TargetCoolingDown { .. } => 52,
            Error::ConcurrencyLimit { .. } => 53,
            Error::Audit(_) => 60,
            Error::AuditParse { .. } => 61,
            Error::ChainBroken { .. } => 62,
            Error::DataDirUnavailable => 63,
            Error::Io(_) => 70,
            Error::Json(_) => 71,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_)
            | Error::InvalidWeights { .. }
            | Error::InvalidThresholds(_)
            | Error::SchemaVersion { .. } => ErrorCategory::Config,

            Error::Baseline(_)
            | Error::EmptySeries { .. }
            | Error::InsufficientHistory { .. }
            | Error::BaselineMissing { .. } => ErrorCategory::Baseline,

            Error::Detection(_) | Error::AnomalyNotFound { .. } => ErrorCategory::Detection,

            Error::Plan(_) | Error::PlanNotFound { .. } | Error::InvalidTransition { .. } => {
                ErrorCategory::Plan
            }

            Error::ExecutionFailed { .. }
            | Error::TargetBlacklisted { .. }
            | Error::TargetCoolingDown { .. }
            | Error::ConcurrencyLimit { .. } => ErrorCategory::Execution,

            Error::Audit(_)
            | Error::AuditParse { .. }
            | Error::ChainBroken { .. }
            | Error::DataDirUnavailable => ErrorCategory::Audit,

            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Returns whether this error is potentially recoverable.
    ///
    /// Recoverable errors may be resolved by:
    /// - Retrying with a delay
    /// - Relearning stale baselines
    /// - Fixing or resetting configuration
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Config errors: recoverable by fixing the file, fatal until then
            Error::Config(_) => true,
            Error::InvalidWeights { .. } => true,
            Error::InvalidThresholds(_) => true,
            Error::SchemaVersion { .. } => true,

            // Baseline: recoverable once enough history accrues
            Error::Baseline(_) => true,
            Error::EmptySeries { .. } => true,
            Error::InsufficientHistory { .. } => true,
            Error::BaselineMissing { .. } => true,

            // Detection
            Error::Detection(_) => true,
            Error::AnomalyNotFound { .. } => false, // Anomaly resolved or never existed

            // Plan
            Error::Plan(_) => true,
            Error::PlanNotFound { .. } => false,
            Error::InvalidTransition { .. } => false, // Terminal states are absorbing

            // Execution
            Error::ExecutionFailed { .. } => true, // Operator may retry via a new plan
            Error::TargetBlacklisted { .. } => false, // Blacklist is intentional
            Error::TargetCoolingDown { .. } => true, // Clears with time
            Error::ConcurrencyLimit { .. } => true, // Clears when executions drain

            // Audit
            Error::Audit(_) => true,
            Error::AuditParse { .. } => true, // Skip the line, keep loading
            Error::ChainBroken { .. } => false, // Tampering or corruption
            Error::DataDirUnavailable => true,

            // I/O: often transient
            Error::Io(_) => true,
            Error::Json(_) => true,
        }
    }

    /// Returns the suggested action for agents.
    pub fn suggested_action(&self) -> SuggestedAction {
        match self {
            Error::Config(_) => SuggestedAction::RunCheck,
            Error::InvalidWeights { .. } => SuggestedAction::RunCheck,
            Error::InvalidThresholds(_) => SuggestedAction::RunCheck,
            Error::SchemaVersion { .. } => SuggestedAction::ResetConfig,

            Error::Baseline(_) => SuggestedAction::Relearn,
            Error::EmptySeries { .. } => SuggestedAction::Skip,
            Error::InsufficientHistory { .. } => SuggestedAction::Wait,
            Error::BaselineMissing { .. } => SuggestedAction::Relearn,

            Error::Detection(_) => SuggestedAction::Retry,
            Error::AnomalyNotFound { .. } => SuggestedAction::Skip,

            Error::Plan(_) => SuggestedAction::Retry,
            Error::PlanNotFound { .. } => SuggestedAction::Skip,
            Error::InvalidTransition { .. } => SuggestedAction::Skip,

            Error::ExecutionFailed { .. } => SuggestedAction::ManualIntervention,
            Error::TargetBlacklisted { .. } => SuggestedAction::Skip,
            Error::TargetCoolingDown { .. } => SuggestedAction::Wait,
            Error::ConcurrencyLimit { .. } => SuggestedAction::Wait,

            Error::Audit(_) => SuggestedAction::Retry,
            Error::AuditParse { .. } => SuggestedAction::Skip,
            Error::ChainBroken { .. } => SuggestedAction::ManualIntervention,
            Error::DataDirUnavailable => SuggestedAction::ManualIntervention,

            Error::Io(_) => SuggestedAction::Retry,
            Error::Json(_) => SuggestedAction::ManualIntervention,
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Config(_) => {
                "Run 'mt-core check' to validate configuration, or check syntax in the config file."
            }
            Error::InvalidWeights { .. } => {
                "Adjust [risk.weights] so severity + urgency + impact + complexity sum to 1.0, then re-run 'mt-core check'."
            }
            Error::InvalidThresholds(_) => {
                "Risk tier thresholds must satisfy 0 < auto < semi_auto < manual <= 1. Fix [risk.thresholds] and re-run 'mt-core check'."
            }
            Error::SchemaVersion { .. } => {
                "The config file was written by an incompatible version. Regenerate defaults with 'mt-core check --print-defaults'."
            }

            Error::Baseline(_) => {
                "Relearn the baseline with 'mt-core baseline learn'. Check the sample series for gaps."
            }
            Error::EmptySeries { .. } => {
                "The metric source returned no samples for this key. Verify the query and retention window."
            }
            Error::InsufficientHistory { .. } => {
                "Wait for more history to accrue, or lower baseline.min_history_days if the metric is new."
            }
            Error::BaselineMissing { .. } => {
                "No baseline learned yet for this metric. Run 'mt-core baseline learn' or wait for the next learning cycle."
            }

            Error::Detection(_) => {
                "Retry the tick. If persistent, inspect the metric snapshot for non-finite values."
            }
            Error::AnomalyNotFound { .. } => {
                "The anomaly resolved or was never recorded. List active anomalies with 'mt-core tick'."
            }

            Error::Plan(_) => {
                "Inspect the plan with 'mt-core plans list' and retry the operation."
            }
            Error::PlanNotFound { .. } => {
                "The plan id is unknown to this process. Plans do not survive restarts; check 'mt-core audit tail' for its record."
            }
            Error::InvalidTransition { .. } => {
                "The plan already reached a terminal status. Create a new plan if remediation is still needed."
            }

            Error::ExecutionFailed { .. } => {
                "Inspect the step error and the audit trail, remediate by hand, then acknowledge the anomaly."
            }
            Error::TargetBlacklisted { .. } => {
                "The target matches [execution.blacklist]. Remove the entry if remediation should be allowed."
            }
            Error::TargetCoolingDown { .. } => {
                "A recent action touched this target. Wait out execution.cooldown_minutes or act manually."
            }
            Error::ConcurrencyLimit { .. } => {
                "Too many plans are executing. Wait for one to finish or raise execution.max_concurrent."
            }

            Error::Audit(_) => {
                "Check disk space and permissions on the audit directory, then retry."
            }
            Error::AuditParse { .. } => {
                "A line in the audit file is not valid JSON. It will be skipped on load; run 'mt-core audit verify' for details."
            }
            Error::ChainBroken { .. } => {
                "The audit hash chain does not verify. Treat the file as tampered and investigate before trusting it."
            }
            Error::DataDirUnavailable => {
                "Set METRIC_TRIAGE_DATA or XDG_DATA_HOME to a writable directory."
            }

            Error::Io(_) => {
                "Check disk space, permissions, and that data directories exist. Retry the operation."
            }
            Error::Json(_) => {
                "Invalid JSON in file. Check syntax with 'cat <file> | jq .' or restore from backup."
            }
        }
    }

    /// Returns a short headline for human-readable output.
    pub fn headline(&self) -> &'static str {
        match self {
            Error::Config(_) => "Configuration Error",
            Error::InvalidWeights { .. } => "Invalid Risk Weights",
            Error::InvalidThresholds(_) => "Invalid Risk Thresholds",
            Error::SchemaVersion { .. } => "Schema Version Mismatch",

            Error::Baseline(_) => "Baseline Error",
            Error::EmptySeries { .. } => "Empty Sample Series",
            Error::InsufficientHistory { .. } => "Insufficient History",
            Error::BaselineMissing { .. } => "Baseline Missing",

            Error::Detection(_) => "Detection Error",
            Error::AnomalyNotFound { .. } => "Anomaly Not Found",

            Error::Plan(_) => "Plan Error",
            Error::PlanNotFound { .. } => "Plan Not Found",
            Error::InvalidTransition { .. } => "Invalid Plan Transition",

            Error::ExecutionFailed { .. } => "Step Execution Failed",
            Error::TargetBlacklisted { .. } => "Target Blacklisted",
            Error::TargetCoolingDown { .. } => "Target Cooling Down",
            Error::ConcurrencyLimit { .. } => "Concurrency Limit Reached",

            Error::Audit(_) => "Audit Error",
            Error::AuditParse { .. } => "Malformed Audit Record",
            Error::ChainBroken { .. } => "Audit Chain Broken",
            Error::DataDirUnavailable => "Data Directory Unavailable",

            Error::Io(_) => "I/O Error",
            Error::Json(_) => "JSON Parse Error",
        }
    }
}

/// Structured error response for JSON output.
///
/// Used by robot mode for machine-parseable error reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Stable error code.
    pub code: u32,

    /// Error category for grouping.
    pub category: ErrorCategory,

    /// Human-readable error message.
    pub message: String,

    /// Whether the error is potentially recoverable.
    pub recoverable: bool,

    /// Suggested action for agents.
    pub suggested_action: SuggestedAction,

    /// Additional structured context (e.g., metric key, plan id).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        let mut context = HashMap::new();

        // Add error-specific context
        match err {
            Error::InvalidWeights { sum } => {
                context.insert("sum".to_string(), serde_json::json!(sum));
            }
            Error::EmptySeries { key }
            | Error::BaselineMissing { key } => {
                context.insert("metric_key".to_string(), serde_json::json!(key));
            }
            Error::InsufficientHistory { key, days, required } => {
                context.insert("metric_key".to_string(), serde_json::json!(key));
                context.insert("days".to_string(), serde_json::json!(days));
                context.insert("required_days".to_string(), serde_json::json!(required));
            }
            Error::AnomalyNotFound { id } => {
                context.insert("anomaly_id".to_string(), serde_json::json!(id));
            }
            Error::PlanNotFound { plan_id } => {
                context.insert("plan_id".to_string(), serde_json::json!(plan_id));
            }
            Error::InvalidTransition { plan_id, from, to } => {
                context.insert("plan_id".to_string(), serde_json::json!(plan_id));
                context.insert("from".to_string(), serde_json::json!(from));
                context.insert("to".to_string(), serde_json::json!(to));
            }
            Error::ExecutionFailed { step_id, .. } => {
                context.insert("step_id".to_string(), serde_json::json!(step_id));
            }
            Error::TargetBlacklisted { target } => {
                context.insert("target".to_string(), serde_json::json!(target));
            }
            Error::TargetCoolingDown { target, remaining_minutes } => {
                context.insert("target".to_string(), serde_json::json!(target));
                context.insert(
                    "remaining_minutes".to_string(),
                    serde_json::json!(remaining_minutes),
                );
            }
            Error::ConcurrencyLimit { limit } => {
                context.insert("limit".to_string(), serde_json::json!(limit));
            }
            Error::AuditParse { line, .. } | Error::ChainBroken { line, .. } => {
                context.insert("line".to_string(), serde_json::json!(line));
            }
            _ => {}
        }

        StructuredError {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            suggested_action: err.suggested_action(),
            context,
        }
    }
}

impl StructuredError {
    /// Add additional context to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"serialization_failed"}}"#, self.code)
        })
    }

    /// Serialize to pretty JSON string.
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| self.to_json())
    }
}

/// Format an error for human-readable stderr output.
///
/// Output format:
/// ```text
/// ✗ [Headline]
///   Reason: [Error message]
///   Fix: [Remediation hint]
/// ```
pub fn format_error_human(err: &Error, use_color: bool) -> String {
    let (red, cyan, reset) = if use_color {
        ("\x1b[31m", "\x1b[36m", "\x1b[0m")
    } else {
        ("", "", "")
    };

    format!(
        "{red}✗{reset} {headline}\n  Reason: {message}\n  {cyan}Fix:{reset} {remediation}",
        red = red,
        cyan = cyan,
        reset = reset,
        headline = err.headline(),
        message = err,
        remediation = err.remediation()
    )
}
