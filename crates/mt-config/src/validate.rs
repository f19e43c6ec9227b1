//! Configuration validation errors and semantic validation.
//!
//! Validation runs once at load. A config that fails here must prevent
//! the engine from starting; nothing downstream re-checks these
//! invariants per call.

use thiserror::Error;

use crate::settings::EngineConfig;

/// Validation result type.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Semantic validation failed: {0}")]
    SemanticError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
}

impl ValidationError {
    /// Error code for structured error reporting.
    pub fn code(&self) -> u32 {
        match self {
            ValidationError::IoError(_) => 60,
            ValidationError::ParseError(_) => 61,
            ValidationError::SemanticError(_) => 62,
            ValidationError::InvalidValue { .. } => 63,
            ValidationError::VersionMismatch { .. } => 64,
        }
    }
}

/// Validate an engine configuration semantically.
pub fn validate_engine_config(config: &EngineConfig) -> ValidationResult<()> {
    // Check schema version
    if config.schema_version != crate::CONFIG_SCHEMA_VERSION {
        return Err(ValidationError::VersionMismatch {
            expected: crate::CONFIG_SCHEMA_VERSION.to_string(),
            actual: config.schema_version.clone(),
        });
    }

    validate_baseline(config)?;
    validate_detection(config)?;
    validate_risk(config)?;
    validate_approval(config)?;
    validate_execution(config)?;
    validate_audit(config)?;

    Ok(())
}

fn validate_baseline(config: &EngineConfig) -> ValidationResult<()> {
    let b = &config.baseline;

    if b.min_history_days < 1 {
        return Err(ValidationError::InvalidValue {
            field: "baseline.min_history_days".to_string(),
            message: format!("Must be >= 1, got {}", b.min_history_days),
        });
    }

    if b.optimal_history_days < b.min_history_days {
        return Err(ValidationError::InvalidValue {
            field: "baseline.optimal_history_days".to_string(),
            message: format!(
                "Must be >= min_history_days ({}), got {}",
                b.min_history_days, b.optimal_history_days
            ),
        });
    }

    if b.learning_interval_hours == 0 || b.stale_after_hours == 0 {
        return Err(ValidationError::SemanticError(
            "baseline.learning_interval_hours and stale_after_hours must be nonzero".to_string(),
        ));
    }

    if b.min_hourly_samples == 0 {
        return Err(ValidationError::InvalidValue {
            field: "baseline.min_hourly_samples".to_string(),
            message: "Must be >= 1".to_string(),
        });
    }

    Ok(())
}

fn validate_detection(config: &EngineConfig) -> ValidationResult<()> {
    let d = &config.detection;

    if d.algorithms.is_empty() {
        return Err(ValidationError::SemanticError(
            "detection.algorithms must enable at least one algorithm".to_string(),
        ));
    }

    let mut seen = d.algorithms.clone();
    seen.sort_by_key(|a| format!("{}", a));
    seen.dedup();
    if seen.len() != d.algorithms.len() {
        return Err(ValidationError::SemanticError(
            "detection.algorithms contains duplicates".to_string(),
        ));
    }

    if d.ensemble_min_votes < 1 || d.ensemble_min_votes > d.algorithms.len() {
        return Err(ValidationError::InvalidValue {
            field: "detection.ensemble_min_votes".to_string(),
            message: format!(
                "Must be in [1, {}], got {}",
                d.algorithms.len(),
                d.ensemble_min_votes
            ),
        });
    }

    if d.zscore_threshold <= 0.0 || !d.zscore_threshold.is_finite() {
        return Err(ValidationError::InvalidValue {
            field: "detection.zscore_threshold".to_string(),
            message: format!("Must be a positive finite number, got {}", d.zscore_threshold),
        });
    }

    if d.mad_threshold <= 0.0 || !d.mad_threshold.is_finite() {
        return Err(ValidationError::InvalidValue {
            field: "detection.mad_threshold".to_string(),
            message: format!("Must be a positive finite number, got {}", d.mad_threshold),
        });
    }

    if d.resolution_factor <= 0.0 || d.resolution_factor > 1.0 {
        return Err(ValidationError::InvalidValue {
            field: "detection.resolution_factor".to_string(),
            message: format!("Must be in (0, 1], got {}", d.resolution_factor),
        });
    }

    if d.check_interval_seconds == 0 {
        return Err(ValidationError::InvalidValue {
            field: "detection.check_interval_seconds".to_string(),
            message: "Must be >= 1".to_string(),
        });
    }

    if d.min_anomaly_duration_minutes < 0 {
        return Err(ValidationError::InvalidValue {
            field: "detection.min_anomaly_duration_minutes".to_string(),
            message: format!("Must be >= 0, got {}", d.min_anomaly_duration_minutes),
        });
    }

    if d.trend_window < 2 {
        return Err(ValidationError::InvalidValue {
            field: "detection.trend_window".to_string(),
            message: format!("Must be >= 2, got {}", d.trend_window),
        });
    }

    Ok(())
}

fn validate_risk(config: &EngineConfig) -> ValidationResult<()> {
    let w = &config.risk.weights;
    let t = &config.risk.thresholds;

    for (name, value) in [
        ("severity", w.severity),
        ("urgency", w.urgency),
        ("impact", w.impact),
        ("complexity", w.complexity),
    ] {
        if !(0.0..=1.0).contains(&value) || !value.is_finite() {
            return Err(ValidationError::InvalidValue {
                field: format!("risk.weights.{}", name),
                message: format!("Must be in [0, 1], got {}", value),
            });
        }
    }

    // Weights must sum to 1.0 (within tolerance)
    let sum = w.sum();
    if (sum - 1.0).abs() > 0.01 {
        return Err(ValidationError::SemanticError(format!(
            "Risk weights must sum to 1.0, got {} (severity={}, urgency={}, impact={}, complexity={})",
            sum, w.severity, w.urgency, w.impact, w.complexity,
        )));
    }

    // Tiers must be strictly ascending within (0, 1]
    if !(t.auto > 0.0 && t.auto < t.semi_auto && t.semi_auto < t.manual && t.manual <= 1.0) {
        return Err(ValidationError::InvalidValue {
            field: "risk.thresholds".to_string(),
            message: format!(
                "Must satisfy 0 < auto < semi_auto < manual <= 1, got auto={}, semi_auto={}, manual={}",
                t.auto, t.semi_auto, t.manual
            ),
        });
    }

    Ok(())
}

fn validate_approval(config: &EngineConfig) -> ValidationResult<()> {
    let a = &config.approval;

    if a.timeout_minutes < 1 {
        return Err(ValidationError::InvalidValue {
            field: "approval.timeout_minutes".to_string(),
            message: format!("Must be >= 1, got {}", a.timeout_minutes),
        });
    }

    if a.required_approvers_semi_auto < 1 {
        return Err(ValidationError::InvalidValue {
            field: "approval.required_approvers_semi_auto".to_string(),
            message: "Must be >= 1".to_string(),
        });
    }

    if a.required_approvers_manual < a.required_approvers_semi_auto {
        return Err(ValidationError::InvalidValue {
            field: "approval.required_approvers_manual".to_string(),
            message: format!(
                "Must be >= required_approvers_semi_auto ({})",
                a.required_approvers_semi_auto
            ),
        });
    }

    Ok(())
}

fn validate_execution(config: &EngineConfig) -> ValidationResult<()> {
    let e = &config.execution;

    if e.max_concurrent < 1 {
        return Err(ValidationError::InvalidValue {
            field: "execution.max_concurrent".to_string(),
            message: "Must be >= 1".to_string(),
        });
    }

    if e.cooldown_minutes < 0 {
        return Err(ValidationError::InvalidValue {
            field: "execution.cooldown_minutes".to_string(),
            message: format!("Must be >= 0, got {}", e.cooldown_minutes),
        });
    }

    for label in &e.blacklist.labels {
        if !label.contains('=') {
            return Err(ValidationError::InvalidValue {
                field: "execution.blacklist.labels".to_string(),
                message: format!("Label must be key=value, got {:?}", label),
            });
        }
    }

    Ok(())
}

fn validate_audit(config: &EngineConfig) -> ValidationResult<()> {
    let a = &config.audit;

    if a.retention_days < 1 {
        return Err(ValidationError::InvalidValue {
            field: "audit.retention_days".to_string(),
            message: format!("Must be >= 1, got {}", a.retention_days),
        });
    }

    if a.max_file_bytes < 4096 {
        return Err(ValidationError::InvalidValue {
            field: "audit.max_file_bytes".to_string(),
            message: format!("Must be >= 4096, got {}", a.max_file_bytes),
        });
    }

    Ok(())
}
