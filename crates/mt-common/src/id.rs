//! Identifier types for anomalies, plans, steps, and audit records.
//!
//! Anomaly and audit ids are random; plan and step ids are derived
//! deterministically from their inputs so replaying the same detection
//! produces the same ids.

use serde::{Deserialize, Serialize};
use std::fmt;

/// FNV-1a 64-bit hash for stable, deterministic identifiers.
fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn random_hex12() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

/// Anomaly identifier.
///
/// Format: `ano-XXXXXXXXXXXX` (12 lowercase hex chars).
/// Example: `ano-3f2a9c01d7b4`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnomalyId(pub String);

impl AnomalyId {
    /// Generate a new random anomaly id.
    pub fn new() -> Self {
        AnomalyId(format!("ano-{}", random_hex12()))
    }

    /// Parse and validate an anomaly id string.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("ano-")?;
        if rest.len() != 12 || !is_lower_hex(rest) {
            return None;
        }
        Some(AnomalyId(s.to_string()))
    }
}

impl Default for AnomalyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AnomalyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Plan identifier, derived from the anomaly and creation time.
///
/// Format: `plan-XXXXXXXXXXXXXXXX` (16 lowercase hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub String);

impl PlanId {
    /// Derive a deterministic plan id from its generating inputs.
    pub fn derive(anomaly_id: &str, metric_key: &str, created_unix: i64) -> Self {
        let seed = format!("{}|{}|{}", anomaly_id, metric_key, created_unix);
        PlanId(format!("plan-{:016x}", fnv1a64(seed.as_bytes())))
    }

    /// Parse and validate a plan id string.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("plan-")?;
        if rest.len() != 16 || !is_lower_hex(rest) {
            return None;
        }
        Some(PlanId(s.to_string()))
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Step identifier, derived from the owning plan and the step shape.
///
/// Format: `step-XXXXXXXXXXXXXXXX` (16 lowercase hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    /// Derive a deterministic step id within a plan.
    pub fn derive(plan_seed: &str, action: &str, target: &str, order: usize) -> Self {
        let seed = format!("{}|{}|{}|{}", plan_seed, action, target, order);
        StepId(format!("step-{:016x}", fnv1a64(seed.as_bytes())))
    }

    /// Parse and validate a step id string.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("step-")?;
        if rest.len() != 16 || !is_lower_hex(rest) {
            return None;
        }
        Some(StepId(s.to_string()))
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Audit record identifier.
///
/// Format: `adt-XXXXXXXXXXXX` (12 lowercase hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditId(pub String);

impl AuditId {
    /// Generate a new random audit id.
    pub fn new() -> Self {
        AuditId(format!("adt-{}", random_hex12()))
    }

    /// Parse and validate an audit id string.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("adt-")?;
        if rest.len() != 12 || !is_lower_hex(rest) {
            return None;
        }
        Some(AuditId(s.to_string()))
    }
}

impl Default for AuditId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AuditId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anomaly_id_format() {
        let id = AnomalyId::new();
        assert!(id.0.starts_with("ano-"));
        assert_eq!(id.0.len(), 16);
        assert!(AnomalyId::parse(&id.0).is_some());
    }

    #[test]
    fn test_anomaly_id_parse_rejects_bad_input() {
        assert!(AnomalyId::parse("ano-XYZ").is_none());
        assert!(AnomalyId::parse("ano-3F2A9C01D7B4").is_none()); // uppercase
        assert!(AnomalyId::parse("plan-3f2a9c01d7b4").is_none());
        assert!(AnomalyId::parse("").is_none());
    }

    #[test]
    fn test_plan_id_deterministic() {
        let a = PlanId::derive("ano-aaaaaaaaaaaa", "api_latency_p99", 1_700_000_000);
        let b = PlanId::derive("ano-aaaaaaaaaaaa", "api_latency_p99", 1_700_000_000);
        let c = PlanId::derive("ano-aaaaaaaaaaaa", "api_latency_p99", 1_700_000_060);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(PlanId::parse(&a.0).is_some());
    }

    #[test]
    fn test_step_id_varies_with_order() {
        let s0 = StepId::derive("plan-seed", "restart_workload", "api-gateway", 0);
        let s1 = StepId::derive("plan-seed", "restart_workload", "api-gateway", 1);
        assert_ne!(s0, s1);
        assert!(StepId::parse(&s0.0).is_some());
    }

    #[test]
    fn test_ids_serde_transparent() {
        let id = AuditId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
        let back: AuditId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
