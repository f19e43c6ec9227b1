//! Metric Triage common types, IDs, and errors.
//!
//! This crate provides foundational types shared across mt-core modules:
//! - Metric identity (name + sorted labels) with a canonical string form
//! - Anomaly, plan, step, and audit record identifiers
//! - Common error types with stable codes
//! - Output format selection shared by every subcommand

pub mod error;
pub mod id;
pub mod key;
pub mod output;

pub use error::{Error, ErrorCategory, Result, StructuredError, SuggestedAction};
pub use id::{AnomalyId, AuditId, PlanId, StepId};
pub use key::{MetricCategory, MetricKey};
pub use output::OutputFormat;

/// Wire schema version for audit records and baseline snapshots.
pub const SCHEMA_VERSION: &str = "1.0.0";
