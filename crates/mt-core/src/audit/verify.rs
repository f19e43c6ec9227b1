//! Hash chain verification for audit files.

use super::entry::AuditRecord;
use super::writer::GENESIS_HASH;
use mt_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Outcome of walking one audit file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyReport {
    pub is_valid: bool,

    /// Records that verified before the walk stopped.
    pub records_checked: u64,

    /// First place the chain fails, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_break: Option<ChainBreak>,
}

impl VerifyReport {
    /// Convert to an error carrying the first break, for exit-code mapping.
    pub fn into_result(self) -> Result<u64> {
        match self.first_break {
            None => Ok(self.records_checked),
            Some(b) => Err(Error::ChainBroken {
                line: b.line,
                reason: b.describe(),
            }),
        }
    }
}

/// First detected break in a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainBreak {
    /// 1-indexed line number.
    pub line: usize,

    pub kind: BreakKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl ChainBreak {
    /// One-line human description.
    pub fn describe(&self) -> String {
        match self.kind {
            BreakKind::Unparseable => "record is not valid JSON".to_string(),
            BreakKind::TamperedRecord => {
                "record content does not match its stored hash".to_string()
            }
            BreakKind::BrokenLink => format!(
                "prev_hash {} does not match previous record hash {}",
                self.actual.as_deref().unwrap_or("?"),
                self.expected.as_deref().unwrap_or("?"),
            ),
            BreakKind::InvalidGenesis => format!(
                "first record opens with {} instead of {}",
                self.actual.as_deref().unwrap_or("?"),
                GENESIS_HASH,
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    /// Line is not a parseable audit record.
    Unparseable,
    /// Record content does not match its own stored hash.
    TamperedRecord,
    /// prev_hash does not match the previous record's hash.
    BrokenLink,
    /// First record does not open the chain with genesis.
    InvalidGenesis,
}

/// Walk an audit file checking every record hash and the prev-hash linkage.
///
/// A missing file verifies as an empty, valid chain. The walk stops at the
/// first break; nothing after it can be trusted.
pub fn verify(path: &Path) -> Result<VerifyReport> {
    if !path.exists() {
        return Ok(VerifyReport {
            is_valid: true,
            records_checked: 0,
            first_break: None,
        });
    }

    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut prev_hash = GENESIS_HASH.to_string();
    let mut checked = 0u64;

    for (idx, line) in reader.lines().enumerate() {
        let line_num = idx + 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let record: AuditRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(_) => {
                return Ok(broken(checked, line_num, BreakKind::Unparseable, None, None));
            }
        };

        if !record.verify_hash() {
            return Ok(broken(
                checked,
                line_num,
                BreakKind::TamperedRecord,
                None,
                Some(record.hash().to_string()),
            ));
        }

        if record.prev_hash != prev_hash {
            let kind = if checked == 0 {
                BreakKind::InvalidGenesis
            } else {
                BreakKind::BrokenLink
            };
            return Ok(broken(
                checked,
                line_num,
                kind,
                Some(prev_hash),
                Some(record.prev_hash.clone()),
            ));
        }

        prev_hash = record.hash().to_string();
        checked += 1;
    }

    Ok(VerifyReport {
        is_valid: true,
        records_checked: checked,
        first_break: None,
    })
}

fn broken(
    checked: u64,
    line: usize,
    kind: BreakKind,
    expected: Option<String>,
    actual: Option<String>,
) -> VerifyReport {
    VerifyReport {
        is_valid: false,
        records_checked: checked,
        first_break: Some(ChainBreak {
            line,
            kind,
            expected,
            actual,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{action, status, AuditContext};
    use crate::audit::writer::AuditLogger;
    use chrono::{DateTime, TimeZone, Utc};
    use mt_config::AuditConfig;

    fn test_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 23, 12, 0, 0).unwrap()
    }

    fn test_ctx() -> AuditContext {
        AuditContext::new("run-test", "host-test")
    }

    fn test_config(dir: &Path) -> AuditConfig {
        AuditConfig {
            enabled: true,
            retention_days: 90,
            dir: Some(dir.to_path_buf()),
            max_file_bytes: 1024 * 1024,
        }
    }

    fn record(target: &str) -> AuditRecord {
        AuditRecord::new(
            &test_ctx(),
            action::STEP_EXECUTED,
            target,
            status::SUCCESS,
            test_now(),
        )
    }

    #[test]
    fn test_missing_file_is_valid_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let report = verify(&tmp.path().join("absent.jsonl")).unwrap();

        assert!(report.is_valid);
        assert_eq!(report.records_checked, 0);
        assert!(report.first_break.is_none());
    }

    #[test]
    fn test_valid_chain_passes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut logger = AuditLogger::open(test_config(tmp.path())).unwrap();

        logger.log_action(record("payments-api"));
        logger.log_action(record("wallet-api"));
        logger.log_action(record("matching-engine"));

        let report = verify(logger.path()).unwrap();
        assert!(report.is_valid);
        assert_eq!(report.records_checked, 3);
        assert_eq!(report.into_result().unwrap(), 3);
    }

    #[test]
    fn test_tampered_record_is_reported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path;
        {
            let mut logger = AuditLogger::open(test_config(tmp.path())).unwrap();
            logger.log_action(record("payments-api"));
            logger.log_action(record("wallet-api"));
            path = logger.path().to_path_buf();
        }

        // Same-length swap keeps the line parseable but changes the content.
        let content = std::fs::read_to_string(&path).unwrap();
        let tampered = content.replace("wallet-api", "ghosts-api");
        std::fs::write(&path, tampered).unwrap();

        let report = verify(&path).unwrap();
        assert!(!report.is_valid);
        let first_break = report.first_break.unwrap();
        assert_eq!(first_break.line, 2);
        assert_eq!(first_break.kind, BreakKind::TamperedRecord);
    }

    #[test]
    fn test_broken_link_is_reported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("audit.jsonl");

        let mut r1 = record("payments-api");
        r1.prev_hash = GENESIS_HASH.to_string();
        r1.compute_hash();

        let mut r2 = record("wallet-api");
        r2.prev_hash = "bogus".to_string();
        r2.compute_hash();

        std::fs::write(&path, format!("{}\n{}\n", r1.to_jsonl(), r2.to_jsonl())).unwrap();

        let report = verify(&path).unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.records_checked, 1);

        let first_break = report.first_break.unwrap();
        assert_eq!(first_break.line, 2);
        assert_eq!(first_break.kind, BreakKind::BrokenLink);
        assert_eq!(first_break.expected.as_deref(), Some(r1.hash()));
        assert_eq!(first_break.actual.as_deref(), Some("bogus"));
    }

    #[test]
    fn test_invalid_genesis_is_reported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("audit.jsonl");

        let mut r1 = record("payments-api");
        r1.prev_hash = "not-genesis".to_string();
        r1.compute_hash();

        std::fs::write(&path, format!("{}\n", r1.to_jsonl())).unwrap();

        let report = verify(&path).unwrap();
        assert!(!report.is_valid);
        let first_break = report.first_break.unwrap();
        assert_eq!(first_break.line, 1);
        assert_eq!(first_break.kind, BreakKind::InvalidGenesis);
    }

    #[test]
    fn test_unparseable_line_is_reported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("audit.jsonl");
        std::fs::write(&path, "definitely not json\n").unwrap();

        let report = verify(&path).unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.first_break.unwrap().kind, BreakKind::Unparseable);
    }

    #[test]
    fn test_break_maps_to_chain_broken_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("audit.jsonl");
        std::fs::write(&path, "garbage\n").unwrap();

        let err = verify(&path).unwrap().into_result().unwrap_err();
        assert_eq!(err.code(), 62);
    }
}
