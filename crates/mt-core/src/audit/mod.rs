//! Tamper-evident audit trail.
//!
//! Every plan transition, step outcome, and detection event is appended to
//! a JSONL file as a hash-chained [`AuditRecord`]. Each record hashes its
//! own content plus the hash of the record before it, so edits to the file
//! are detectable; [`verify`] re-walks a file checking both.
//!
//! File layout:
//! - `$METRIC_TRIAGE_DATA/audit/audit.jsonl` when the override is set
//! - `$XDG_DATA_HOME/metric_triage/audit/audit.jsonl` otherwise
//! - platform data dir fallback via `dirs`
//!
//! Rotated files are named `audit.YYYYMMDD-HHMMSS.jsonl`; each rotation
//! starts a fresh chain from `"genesis"`.

mod entry;
mod verify;
mod writer;

pub use entry::{action, status, ActorType, AuditContext, AuditRecord, AUDIT_SCHEMA_VERSION};
pub use verify::{verify, BreakKind, ChainBreak, VerifyReport};
pub use writer::{AuditLogger, AuditTrail, GENESIS_HASH};

use mt_common::{Error, Result};
use std::path::PathBuf;

pub(crate) const AUDIT_DIR_NAME: &str = "audit";

/// Live audit log filename.
pub const AUDIT_LOG_FILENAME: &str = "audit.jsonl";

/// Resolve the audit directory from the environment.
pub fn resolve_audit_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("METRIC_TRIAGE_DATA") {
        return Ok(PathBuf::from(dir).join(AUDIT_DIR_NAME));
    }

    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return Ok(PathBuf::from(xdg)
            .join("metric_triage")
            .join(AUDIT_DIR_NAME));
    }

    if let Some(base) = dirs::data_dir() {
        return Ok(base.join("metric_triage").join(AUDIT_DIR_NAME));
    }

    Err(Error::DataDirUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_audit_dir_with_env() {
        let orig = std::env::var("METRIC_TRIAGE_DATA").ok();

        std::env::set_var("METRIC_TRIAGE_DATA", "/tmp/mt-test-data");
        let dir = resolve_audit_dir().unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/mt-test-data/audit"));

        match orig {
            Some(v) => std::env::set_var("METRIC_TRIAGE_DATA", v),
            None => std::env::remove_var("METRIC_TRIAGE_DATA"),
        }
    }
}
