//! Metric Triage configuration loading and validation.
//!
//! This crate provides:
//! - Typed Rust structs for the engine config file (JSON)
//! - Config resolution (CLI → env → XDG → system → defaults)
//! - Semantic validation (fatal at load, never at call time)

pub mod resolve;
pub mod settings;
pub mod validate;

pub use resolve::{load_config_file, resolve_config, ConfigSource, ResolvedConfig};
pub use settings::{
    ApprovalConfig, AuditConfig, BaselineConfig, BlacklistConfig, DetectionConfig, EngineConfig,
    ExecutionConfig, RiskConfig, RiskThresholds, RiskWeights, ScoreAlgorithm,
};
pub use validate::{validate_engine_config, ValidationError, ValidationResult};

/// Schema version for configuration files.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";
