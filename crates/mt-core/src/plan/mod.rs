//! Remediation plan model and history.
//!
//! A plan is an ordered list of action steps bound to one anomaly, with
//! an approval workflow sized by its risk tier. The in-process ledger is
//! authoritative; snapshots round-trip it across restarts and the audit
//! trail keeps the immutable record of every transition.

pub mod execute;
pub mod planner;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::BufWriter;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use mt_common::{AnomalyId, Error, MetricKey, PlanId, Result, StepId, SCHEMA_VERSION};

use crate::risk::RiskTier;

pub type ParamMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Remediation actions the engine knows how to order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RestartWorkload,
    ScaleReplicas,
    RollbackRelease,
    RollbackConfig,
    FlushCache,
    ShiftTraffic,
    FailoverDatabase,
    OpenBreaker,
    InvokeWebhook,
}

impl ActionKind {
    pub const ALL: [ActionKind; 9] = [
        ActionKind::RestartWorkload,
        ActionKind::ScaleReplicas,
        ActionKind::RollbackRelease,
        ActionKind::RollbackConfig,
        ActionKind::FlushCache,
        ActionKind::ShiftTraffic,
        ActionKind::FailoverDatabase,
        ActionKind::OpenBreaker,
        ActionKind::InvokeWebhook,
    ];

    /// Operational complexity, 0..1. Feeds the risk complexity factor.
    pub fn complexity_weight(&self) -> f64 {
        match self {
            ActionKind::RestartWorkload => 0.2,
            ActionKind::ScaleReplicas => 0.3,
            ActionKind::RollbackRelease => 0.7,
            ActionKind::RollbackConfig => 0.5,
            ActionKind::FlushCache => 0.2,
            ActionKind::ShiftTraffic => 0.6,
            ActionKind::FailoverDatabase => 0.9,
            ActionKind::OpenBreaker => 0.4,
            ActionKind::InvokeWebhook => 0.3,
        }
    }

    /// Blast radius, 0..1. Feeds the risk impact factor.
    pub fn blast_weight(&self) -> f64 {
        match self {
            ActionKind::RestartWorkload => 0.4,
            ActionKind::ScaleReplicas => 0.5,
            ActionKind::RollbackRelease => 0.8,
            ActionKind::RollbackConfig => 0.6,
            ActionKind::FlushCache => 0.3,
            ActionKind::ShiftTraffic => 0.7,
            ActionKind::FailoverDatabase => 1.0,
            ActionKind::OpenBreaker => 0.6,
            ActionKind::InvokeWebhook => 0.2,
        }
    }

    /// Whether this action can be undone once applied.
    pub fn reversible(&self) -> bool {
        match self {
            ActionKind::ScaleReplicas
            | ActionKind::RollbackConfig
            | ActionKind::ShiftTraffic
            | ActionKind::OpenBreaker => true,
            ActionKind::RestartWorkload
            | ActionKind::RollbackRelease
            | ActionKind::FlushCache
            | ActionKind::FailoverDatabase
            | ActionKind::InvokeWebhook => false,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::RestartWorkload => "restart_workload",
            ActionKind::ScaleReplicas => "scale_replicas",
            ActionKind::RollbackRelease => "rollback_release",
            ActionKind::RollbackConfig => "rollback_config",
            ActionKind::FlushCache => "flush_cache",
            ActionKind::ShiftTraffic => "shift_traffic",
            ActionKind::FailoverDatabase => "failover_database",
            ActionKind::OpenBreaker => "open_breaker",
            ActionKind::InvokeWebhook => "invoke_webhook",
        };
        write!(f, "{}", s)
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    RolledBack,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::RolledBack => "rolled_back",
            StepStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// One action within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStep {
    pub id: StepId,
    pub kind: ActionKind,
    pub target: String,
    pub namespace: String,
    #[serde(default)]
    pub parameters: ParamMap,
    pub order: usize,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Guardrail verdict taken before execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_check_passed: Option<bool>,
    /// Executor verification taken after execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_check_passed: Option<bool>,
    /// State captured during execution, consumed by rollback.
    #[serde(default)]
    pub rollback_data: ParamMap,
    pub can_rollback: bool,
}

impl ActionStep {
    /// Build a pending step. The id is derived from the plan seed so a
    /// replayed plan produces identical step ids.
    pub fn new(
        plan_seed: &str,
        kind: ActionKind,
        target: impl Into<String>,
        namespace: impl Into<String>,
        order: usize,
    ) -> Self {
        let target = target.into();
        let namespace = namespace.into();
        ActionStep {
            id: StepId::derive(plan_seed, &kind.to_string(), &target, order),
            kind,
            target,
            namespace,
            parameters: ParamMap::new(),
            order,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            error: None,
            pre_check_passed: None,
            post_check_passed: None,
            rollback_data: ParamMap::new(),
            can_rollback: kind.reversible(),
        }
    }

    pub fn with_parameters(mut self, parameters: ParamMap) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = StepStatus::Running;
        self.started_at = Some(now);
    }

    pub fn mark_success(&mut self, now: DateTime<Utc>) {
        self.status = StepStatus::Success;
        self.complete(now);
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.complete(now);
    }

    pub fn mark_rolled_back(&mut self) {
        self.status = StepStatus::RolledBack;
    }

    /// Guardrail rejection; the step never ran.
    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.status = StepStatus::Skipped;
        self.pre_check_passed = Some(false);
        self.error = Some(reason.into());
    }

    fn complete(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_seconds = Some((now - started).num_milliseconds() as f64 / 1000.0);
        }
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    WaitingApproval,
    Approved,
    Executing,
    Succeeded,
    Failed,
    Rejected,
    Expired,
}

impl PlanStatus {
    /// Terminal states absorb every event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Succeeded
                | PlanStatus::Failed
                | PlanStatus::Rejected
                | PlanStatus::Expired
        )
    }

    /// Legal state-machine moves.
    pub fn can_transition(&self, to: PlanStatus) -> bool {
        use PlanStatus::*;
        matches!(
            (self, to),
            (Pending, WaitingApproval)
                | (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Expired)
                | (WaitingApproval, Approved)
                | (WaitingApproval, Rejected)
                | (WaitingApproval, Expired)
                | (Approved, Executing)
                | (Approved, Rejected)
                | (Executing, Succeeded)
                | (Executing, Failed)
        )
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanStatus::Pending => "pending",
            PlanStatus::WaitingApproval => "waiting_approval",
            PlanStatus::Approved => "approved",
            PlanStatus::Executing => "executing",
            PlanStatus::Succeeded => "succeeded",
            PlanStatus::Failed => "failed",
            PlanStatus::Rejected => "rejected",
            PlanStatus::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

/// A remediation plan bound to one anomaly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPlan {
    pub id: PlanId,
    pub anomaly_id: AnomalyId,
    pub metric_key: MetricKey,
    pub reason: String,
    pub risk_score: f64,
    pub risk_tier: RiskTier,
    pub steps: Vec<ActionStep>,
    pub requires_approval: bool,
    pub approvals_required: u32,
    /// First-approval order, duplicates ignored.
    #[serde(default)]
    pub approvals_received: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_deadline: Option<DateTime<Utc>>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub current_step: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionPlan {
    /// Record an approval. Returns false for a duplicate approver.
    pub fn add_approval(&mut self, approver: &str) -> bool {
        if self.approvals_received.iter().any(|a| a == approver) {
            return false;
        }
        self.approvals_received.push(approver.to_string());
        true
    }

    pub fn approvals_met(&self) -> bool {
        self.approvals_received.len() as u32 >= self.approvals_required
    }

    /// Whether an approval deadline has passed on a waiting plan.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == PlanStatus::WaitingApproval
            && self
                .approval_deadline
                .map(|deadline| now > deadline)
                .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// On-disk snapshot of the plan ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub schema_version: String,
    pub saved_at: DateTime<Utc>,
    pub plans: Vec<ActionPlan>,
}

/// Append-only ledger of every plan this process knows, created here or
/// reloaded from a snapshot.
///
/// Plans are shared behind per-plan mutexes; approval, rejection,
/// expiry, and execution of one plan serialize on its lock.
#[derive(Default)]
pub struct PlanHistory {
    plans: Vec<Arc<Mutex<ActionPlan>>>,
    by_id: HashMap<String, Arc<Mutex<ActionPlan>>>,
}

/// Lock a shared plan, surfacing poisoning as a plan error.
pub(crate) fn lock_plan(plan: &Arc<Mutex<ActionPlan>>) -> Result<MutexGuard<'_, ActionPlan>> {
    plan.lock()
        .map_err(|e| Error::Plan(format!("lock poisoned: {}", e)))
}

impl PlanHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, plan: ActionPlan) -> Arc<Mutex<ActionPlan>> {
        let id = plan.id.0.clone();
        let shared = Arc::new(Mutex::new(plan));
        self.plans.push(Arc::clone(&shared));
        self.by_id.insert(id, Arc::clone(&shared));
        shared
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<ActionPlan>>> {
        self.by_id.get(id).cloned()
    }

    /// Clone of one plan's current state.
    pub fn snapshot(&self, id: &str) -> Result<Option<ActionPlan>> {
        match self.get(id) {
            Some(plan) => Ok(Some(lock_plan(&plan)?.clone())),
            None => Ok(None),
        }
    }

    /// Clones of every plan in creation order.
    pub fn all_snapshots(&self) -> Result<Vec<ActionPlan>> {
        self.plans
            .iter()
            .map(|p| Ok(lock_plan(p)?.clone()))
            .collect()
    }

    pub fn by_status(&self, status: PlanStatus) -> Result<Vec<ActionPlan>> {
        Ok(self
            .all_snapshots()?
            .into_iter()
            .filter(|p| p.status == status)
            .collect())
    }

    /// Newest plans first by creation time.
    pub fn recent(&self, limit: usize) -> Result<Vec<ActionPlan>> {
        let mut plans = self.all_snapshots()?;
        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        plans.truncate(limit);
        Ok(plans)
    }

    /// Share of completed plans that succeeded within the trailing
    /// window. None when nothing completed in the window.
    pub fn success_rate(&self, now: DateTime<Utc>, window_days: i64) -> Result<Option<f64>> {
        let cutoff = now - chrono::Duration::days(window_days);
        let mut completed = 0u32;
        let mut succeeded = 0u32;
        for plan in self.all_snapshots()? {
            let done = matches!(plan.status, PlanStatus::Succeeded | PlanStatus::Failed);
            let in_window = plan.completed_at.map(|t| t >= cutoff).unwrap_or(false);
            if done && in_window {
                completed += 1;
                if plan.status == PlanStatus::Succeeded {
                    succeeded += 1;
                }
            }
        }
        if completed == 0 {
            return Ok(None);
        }
        Ok(Some(f64::from(succeeded) / f64::from(completed)))
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Write the ledger atomically (temp file + rename).
    pub fn save_to_file(&self, path: &Path, now: DateTime<Utc>) -> Result<()> {
        let snapshot = PlanSnapshot {
            schema_version: SCHEMA_VERSION.to_string(),
            saved_at: now,
            plans: self.all_snapshots()?,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        let file = fs::File::create(&temp_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &snapshot)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Reload plans saved by `save_to_file`, in creation order.
    pub fn load_from_file(path: &Path) -> Result<Vec<ActionPlan>> {
        let text = fs::read_to_string(path)?;
        let snapshot: PlanSnapshot = serde_json::from_str(&text)?;
        if snapshot.schema_version != SCHEMA_VERSION {
            return Err(Error::SchemaVersion {
                expected: SCHEMA_VERSION.to_string(),
                actual: snapshot.schema_version,
            });
        }
        let mut plans = snapshot.plans;
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(plans)
    }

    /// Shared handles in creation order, for callers that need the locks.
    pub(crate) fn shared(&self) -> &[Arc<Mutex<ActionPlan>>] {
        &self.plans
    }
}
