//! Tamper-evident audit records.
//!
//! Every record carries a SHA-256 hash of its own content plus the hash of
//! the record before it, forming a verifiable chain within each log file.

use crate::plan::ParamMap;
use chrono::{DateTime, Utc};
use mt_common::{AnomalyId, AuditId, PlanId, StepId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Schema version stamped on every audit record.
pub const AUDIT_SCHEMA_VERSION: &str = "1.0.0";

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

/// Well-known `action_type` values.
///
/// Kept as plain strings so files written by other versions of the engine
/// still load; unknown action types pass through queries untouched.
pub mod action {
    pub const PLAN_CREATED: &str = "plan_created";
    pub const PLAN_APPROVAL: &str = "plan_approval";
    pub const PLAN_REJECTION: &str = "plan_rejection";
    pub const PLAN_EXPIRED: &str = "plan_expired";
    pub const PLAN_EXECUTION: &str = "plan_execution";
    pub const STEP_EXECUTED: &str = "step_executed";
    pub const STEP_ROLLBACK: &str = "step_rollback";
    pub const ANOMALY_DETECTED: &str = "anomaly_detected";
    pub const ANOMALY_RESOLVED: &str = "anomaly_resolved";
    pub const BASELINE_LEARNED: &str = "baseline_learned";
}

/// Well-known `status` values. Plan records also use the state machine's
/// own state names (`waiting_approval`, `approved`, `expired`, ...).
pub mod status {
    pub const STARTED: &str = "started";
    pub const SUCCESS: &str = "success";
    pub const FAILED: &str = "failed";
    pub const ROLLED_BACK: &str = "rolled_back";
    pub const REJECTED: &str = "rejected";
    pub const SKIPPED: &str = "skipped";
    pub const RECORDED: &str = "recorded";
}

/// Who initiated the recorded action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// The engine itself: detection loop, executor, expiry sweep.
    System,
    /// A human operator acting through the CLI.
    User,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::System => write!(f, "system"),
            ActorType::User => write!(f, "user"),
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Provenance stamped into every record's metadata.
#[derive(Debug, Clone)]
pub struct AuditContext {
    /// Identifier for this engine run, one per process start.
    pub run_id: String,
    /// Host the engine is running on.
    pub host_id: String,
}

impl AuditContext {
    pub fn new(run_id: impl Into<String>, host_id: impl Into<String>) -> Self {
        AuditContext {
            run_id: run_id.into(),
            host_id: host_id.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A single audit record, serialized as one JSONL line.
///
/// `entry_hash` is the SHA-256 of the record serialized with
/// `entry_hash = None`; `prev_hash` chains to the previous record in the
/// same file, with the literal `"genesis"` opening each file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub schema_version: String,

    pub id: AuditId,

    /// When the action happened.
    pub ts: DateTime<Utc>,

    /// What kind of action this records (see [`action`]).
    pub action_type: String,

    /// What the action was applied to: a step target, a metric key, a plan id.
    pub target: String,

    /// Outcome or state-machine event name (see [`status`]).
    pub status: String,

    pub actor_type: ActorType,

    /// Run id for system actors, operator name for users.
    pub actor_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<PlanId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly_id: Option<AnomalyId>,

    /// Wall time the action took, when it has a measurable duration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Action inputs.
    #[serde(default, skip_serializing_if = "ParamMap::is_empty")]
    pub parameters: ParamMap,

    /// Observed state before the action ran.
    #[serde(default, skip_serializing_if = "ParamMap::is_empty")]
    pub state_before: ParamMap,

    /// Observed state after the action ran.
    #[serde(default, skip_serializing_if = "ParamMap::is_empty")]
    pub state_after: ParamMap,

    /// Free-form context: run id, host id, risk numbers.
    #[serde(default, skip_serializing_if = "ParamMap::is_empty")]
    pub metadata: ParamMap,

    /// Hash of the previous record in this file, or `"genesis"`.
    #[serde(default)]
    pub prev_hash: String,

    /// SHA-256 of this record with the field itself cleared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_hash: Option<String>,
}

impl AuditRecord {
    /// Create a record attributed to the engine itself.
    ///
    /// `prev_hash` is left empty; the logger fills it from its chain state
    /// at append time.
    pub fn new(
        ctx: &AuditContext,
        action_type: impl Into<String>,
        target: impl Into<String>,
        status: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut metadata = ParamMap::new();
        metadata.insert("run_id".to_string(), serde_json::json!(ctx.run_id));
        metadata.insert("host_id".to_string(), serde_json::json!(ctx.host_id));

        AuditRecord {
            schema_version: AUDIT_SCHEMA_VERSION.to_string(),
            id: AuditId::new(),
            ts: now,
            action_type: action_type.into(),
            target: target.into(),
            status: status.into(),
            actor_type: ActorType::System,
            actor_id: ctx.run_id.clone(),
            plan_id: None,
            step_id: None,
            anomaly_id: None,
            duration_seconds: None,
            error: None,
            parameters: ParamMap::new(),
            state_before: ParamMap::new(),
            state_after: ParamMap::new(),
            metadata,
            prev_hash: String::new(),
            entry_hash: None,
        }
    }

    /// Attribute the record to a human operator instead of the engine.
    pub fn by_user(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_type = ActorType::User;
        self.actor_id = actor_id.into();
        self
    }

    pub fn for_plan(mut self, plan_id: &PlanId) -> Self {
        self.plan_id = Some(plan_id.clone());
        self
    }

    pub fn for_step(mut self, step_id: &StepId) -> Self {
        self.step_id = Some(step_id.clone());
        self
    }

    pub fn for_anomaly(mut self, anomaly_id: &AnomalyId) -> Self {
        self.anomaly_id = Some(anomaly_id.clone());
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_parameters(mut self, parameters: ParamMap) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_state_before(mut self, state: ParamMap) -> Self {
        self.state_before = state;
        self
    }

    pub fn with_state_after(mut self, state: ParamMap) -> Self {
        self.state_after = state;
        self
    }

    /// Merge extra metadata on top of the context fields.
    pub fn with_metadata(mut self, metadata: ParamMap) -> Self {
        for (key, value) in metadata {
            self.metadata.insert(key, value);
        }
        self
    }

    /// Compute and store this record's hash.
    ///
    /// The hash covers the record serialized with `entry_hash = None`, so
    /// verification can recompute it from the stored line.
    pub fn compute_hash(&mut self) {
        self.entry_hash = None;
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        self.entry_hash = Some(hex::encode(hasher.finalize()));
    }

    /// Recompute the hash and compare it against the stored one.
    pub fn verify_hash(&self) -> bool {
        match &self.entry_hash {
            Some(stored) => {
                let mut check = self.clone();
                check.entry_hash = None;
                let json = serde_json::to_string(&check).unwrap_or_default();
                let mut hasher = Sha256::new();
                hasher.update(json.as_bytes());
                hex::encode(hasher.finalize()) == *stored
            }
            None => false,
        }
    }

    /// The stored hash, or `"invalid"` if none has been computed.
    pub fn hash(&self) -> &str {
        self.entry_hash.as_deref().unwrap_or("invalid")
    }

    /// Serialize to a single JSONL line.
    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"schema_version":"{}","error":"failed to serialize audit record: {}"}}"#,
                AUDIT_SCHEMA_VERSION, e
            )
        })
    }
}
