//! Metric Triage Core Library
//!
//! This library provides the core functionality for metric triage:
//! - Baseline learning over historical metric samples
//! - Ensemble anomaly detection with lifecycle tracking
//! - Risk assessment and automation tier selection
//! - Remediation planning, approval workflow, and execution
//! - Tamper-evident audit logging
//!
//! The binary entry point is in `main.rs`.

pub mod audit;
pub mod baseline;
pub mod daemon;
pub mod detect;
pub mod exit_codes;
pub mod logging;
pub mod plan;
pub mod playbook;
pub mod risk;
pub mod source;
