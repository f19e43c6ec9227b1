//! Plan construction and the approval state machine.
//!
//! The planner turns a surfaced anomaly into an [`ActionPlan`] via the
//! first matching playbook, sizes its approval workflow from the risk
//! tier, and owns the approve / reject / expire transitions. Execution
//! lives in [`super::execute`].

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

use mt_common::{AnomalyId, Error, MetricKey, PlanId, Result};
use mt_config::{ApprovalConfig, ExecutionConfig, RiskConfig};

use crate::audit::{action, status as audit_status, AuditContext, AuditLogger, AuditRecord};
use crate::detect::Anomaly;
use crate::playbook::{PlaybookMatcher, SERVICE_PLACEHOLDER};
use crate::risk::{RiskAssessor, RiskTier, HOLD_APPROVALS};

use super::{lock_plan, ActionPlan, ActionStep, ParamMap, PlanHistory, PlanStatus};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What an approval attempt did.
///
/// Approvals against unknown plans or plans in other states are no-ops;
/// callers get an outcome instead of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    /// Approval recorded; more approvers still needed.
    Recorded { received: u32, required: u32 },
    /// Quorum reached; the plan moved to Approved.
    Approved,
    /// This approver had already approved the plan.
    Duplicate,
    /// The deadline had passed; the plan expired instead.
    Expired,
    /// Plan is not waiting for approval; nothing changed.
    NotApplicable { status: PlanStatus },
    /// No plan with that id.
    NotFound,
}

impl fmt::Display for ApprovalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalOutcome::Recorded { received, required } => {
                write!(f, "approval recorded ({}/{})", received, required)
            }
            ApprovalOutcome::Approved => write!(f, "plan approved"),
            ApprovalOutcome::Duplicate => write!(f, "already approved by this approver"),
            ApprovalOutcome::Expired => write!(f, "approval window expired"),
            ApprovalOutcome::NotApplicable { status } => {
                write!(f, "not applicable: plan is {}", status)
            }
            ApprovalOutcome::NotFound => write!(f, "plan not found"),
        }
    }
}

/// What a rejection attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectOutcome {
    Rejected,
    /// Plan already executing or terminal; nothing changed.
    NotApplicable { status: PlanStatus },
    NotFound,
}

impl fmt::Display for RejectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectOutcome::Rejected => write!(f, "plan rejected"),
            RejectOutcome::NotApplicable { status } => {
                write!(f, "not applicable: plan is {}", status)
            }
            RejectOutcome::NotFound => write!(f, "plan not found"),
        }
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Builds plans from playbooks and drives their approval lifecycle.
pub struct ActionPlanner {
    pub(super) approval: ApprovalConfig,
    pub(super) execution: ExecutionConfig,
    pub(super) assessor: RiskAssessor,
    pub(super) history: PlanHistory,
    /// Last action time per target, for the cooldown guardrail.
    pub(super) cooldowns: HashMap<String, DateTime<Utc>>,
    /// Latest plan per anomaly.
    pub(super) by_anomaly: HashMap<String, PlanId>,
}

impl ActionPlanner {
    pub fn new(risk: RiskConfig, approval: ApprovalConfig, execution: ExecutionConfig) -> Self {
        ActionPlanner {
            approval,
            execution,
            assessor: RiskAssessor::new(risk),
            history: PlanHistory::new(),
            cooldowns: HashMap::new(),
            by_anomaly: HashMap::new(),
        }
    }

    pub fn history(&self) -> &PlanHistory {
        &self.history
    }

    /// Seed the ledger from a snapshot, rebuilding the per-anomaly
    /// index. Expects a fresh planner; plans already present win over
    /// reloaded ones with the same id. Returns the number adopted.
    pub fn restore_plans(&mut self, plans: Vec<ActionPlan>) -> usize {
        let mut adopted = 0;
        for plan in plans {
            if self.history.get(&plan.id.0).is_some() {
                continue;
            }
            self.by_anomaly
                .insert(plan.anomaly_id.0.clone(), plan.id.clone());
            self.history.insert(plan);
            adopted += 1;
        }
        adopted
    }

    /// Snapshot of one plan's current state.
    pub fn get_plan(&self, plan_id: &str) -> Result<Option<ActionPlan>> {
        self.history.snapshot(plan_id)
    }

    /// Plans currently waiting for approvers, oldest first.
    pub fn get_pending_approvals(&self) -> Result<Vec<ActionPlan>> {
        let mut waiting = self.history.by_status(PlanStatus::WaitingApproval)?;
        waiting.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(waiting)
    }

    /// Latest plan built for an anomaly, if any.
    pub fn plan_for_anomaly(&self, anomaly_id: &AnomalyId) -> Result<Option<ActionPlan>> {
        match self.by_anomaly.get(&anomaly_id.0) {
            Some(plan_id) => self.history.snapshot(&plan_id.0),
            None => Ok(None),
        }
    }

    /// Build a plan for a surfaced anomaly from the first matching
    /// playbook.
    ///
    /// Auto-tier plans come out Approved and are picked up by the daemon
    /// in the same tick, unless a guardrail already rejects a step; those
    /// are demoted to the approval path. Returns `Ok(None)` when no
    /// playbook applies.
    pub fn build_plan(
        &mut self,
        anomaly: &Anomaly,
        matcher: &dyn PlaybookMatcher,
        previous_deviation: Option<f64>,
        now: DateTime<Utc>,
        ctx: &AuditContext,
        audit: &mut AuditLogger,
    ) -> Result<Option<ActionPlan>> {
        let playbook = match matcher.find(&anomaly.key.name, anomaly.kind) {
            Some(playbook) => playbook,
            None => {
                debug!(
                    metric = %anomaly.key.canonical(),
                    kind = %anomaly.kind,
                    "no playbook matches, skipping plan"
                );
                return Ok(None);
            }
        };
        if playbook.steps.is_empty() {
            return Err(Error::Plan(format!(
                "playbook '{}' has no steps",
                playbook.name
            )));
        }

        let plan_id = PlanId::derive(&anomaly.id.0, &anomaly.key.name, now.timestamp());
        let steps: Vec<ActionStep> = playbook
            .steps
            .iter()
            .enumerate()
            .map(|(order, template)| {
                ActionStep::new(
                    &plan_id.0,
                    template.kind,
                    resolve_target(&template.target, &anomaly.key),
                    &template.namespace,
                    order,
                )
                .with_parameters(template.parameters.clone())
            })
            .collect();

        let assessment = self.assessor.assess(anomaly, &steps, previous_deviation);

        let mut reason = format!(
            "{} {} on {}: value {:.2} vs baseline {:.2} ({:+.1}\u{3c3})",
            anomaly.severity,
            anomaly.kind,
            anomaly.key.canonical(),
            anomaly.current_value,
            anomaly.baseline_value,
            anomaly.deviation,
        );

        let demotion = steps
            .iter()
            .find_map(|step| self.blacklist_reason(step, &anomaly.key));

        let (plan_status, requires_approval, approvals_required, approval_deadline) =
            match assessment.tier {
                RiskTier::Auto => {
                    if let Some(blocked) = &demotion {
                        reason.push_str("; auto-execution blocked: ");
                        reason.push_str(blocked);
                        (
                            PlanStatus::WaitingApproval,
                            true,
                            self.approval.required_approvers_semi_auto,
                            Some(now + Duration::minutes(self.approval.timeout_minutes)),
                        )
                    } else {
                        (PlanStatus::Approved, false, 0, None)
                    }
                }
                RiskTier::SemiAuto | RiskTier::Manual => (
                    PlanStatus::WaitingApproval,
                    true,
                    assessment.tier.required_approvals(&self.approval),
                    Some(now + Duration::minutes(self.approval.timeout_minutes)),
                ),
                RiskTier::Hold => (PlanStatus::Pending, true, HOLD_APPROVALS, None),
            };

        let plan = ActionPlan {
            id: plan_id.clone(),
            anomaly_id: anomaly.id.clone(),
            metric_key: anomaly.key.clone(),
            reason,
            risk_score: assessment.score,
            risk_tier: assessment.tier,
            steps,
            requires_approval,
            approvals_required,
            approvals_received: Vec::new(),
            approval_deadline,
            status: plan_status,
            created_at: now,
            started_at: None,
            completed_at: None,
            current_step: 0,
            success: None,
            summary: None,
            error: None,
        };

        let mut parameters = ParamMap::new();
        parameters.insert("playbook".to_string(), serde_json::json!(playbook.name));
        parameters.insert("risk_score".to_string(), serde_json::json!(plan.risk_score));
        parameters.insert(
            "risk_tier".to_string(),
            serde_json::json!(plan.risk_tier.to_string()),
        );
        parameters.insert("steps".to_string(), serde_json::json!(plan.steps.len()));
        parameters.insert(
            "reasoning".to_string(),
            serde_json::json!(assessment.reasoning),
        );

        audit.log_action(
            AuditRecord::new(
                ctx,
                action::PLAN_CREATED,
                anomaly.key.canonical(),
                plan.status.to_string(),
                now,
            )
            .for_plan(&plan.id)
            .for_anomaly(&anomaly.id)
            .with_parameters(parameters),
        );

        info!(
            plan_id = %plan.id,
            metric = %anomaly.key.canonical(),
            tier = %plan.risk_tier,
            score = format_args!("{:.2}", plan.risk_score),
            status = %plan.status,
            "plan created"
        );

        let snapshot = plan.clone();
        self.history.insert(plan);
        self.by_anomaly.insert(anomaly.id.0.clone(), plan_id);
        Ok(Some(snapshot))
    }

    /// Record one approval on a waiting plan.
    ///
    /// Expired deadlines are applied lazily here, so an approval racing
    /// the expiry sweep can never revive a dead plan.
    pub fn approve(
        &self,
        plan_id: &str,
        approver: &str,
        now: DateTime<Utc>,
        ctx: &AuditContext,
        audit: &mut AuditLogger,
    ) -> Result<ApprovalOutcome> {
        let shared = match self.history.get(plan_id) {
            Some(shared) => shared,
            None => return Ok(ApprovalOutcome::NotFound),
        };
        let mut plan = lock_plan(&shared)?;

        if plan.is_expired(now) {
            expire_locked(&mut plan, now);
            audit.log_action(expiry_record(ctx, &plan, now));
            info!(plan_id = %plan.id, "plan expired before approval");
            return Ok(ApprovalOutcome::Expired);
        }

        if plan.status != PlanStatus::WaitingApproval {
            return Ok(ApprovalOutcome::NotApplicable {
                status: plan.status,
            });
        }

        if !plan.add_approval(approver) {
            return Ok(ApprovalOutcome::Duplicate);
        }

        let received = plan.approvals_received.len() as u32;
        let required = plan.approvals_required;
        let quorum = plan.approvals_met();
        if quorum {
            plan.status = PlanStatus::Approved;
        }

        let mut parameters = ParamMap::new();
        parameters.insert("received".to_string(), serde_json::json!(received));
        parameters.insert("required".to_string(), serde_json::json!(required));
        audit.log_action(
            AuditRecord::new(
                ctx,
                action::PLAN_APPROVAL,
                plan.id.0.clone(),
                if quorum {
                    PlanStatus::Approved.to_string()
                } else {
                    audit_status::RECORDED.to_string()
                },
                now,
            )
            .by_user(approver)
            .for_plan(&plan.id)
            .for_anomaly(&plan.anomaly_id)
            .with_parameters(parameters),
        );

        if quorum {
            info!(plan_id = %plan.id, approver, "plan approved");
            Ok(ApprovalOutcome::Approved)
        } else {
            info!(plan_id = %plan.id, approver, received, required, "approval recorded");
            Ok(ApprovalOutcome::Recorded { received, required })
        }
    }

    /// Reject a plan anywhere before execution starts.
    pub fn reject(
        &self,
        plan_id: &str,
        rejector: &str,
        reason: &str,
        now: DateTime<Utc>,
        ctx: &AuditContext,
        audit: &mut AuditLogger,
    ) -> Result<RejectOutcome> {
        let shared = match self.history.get(plan_id) {
            Some(shared) => shared,
            None => return Ok(RejectOutcome::NotFound),
        };
        let mut plan = lock_plan(&shared)?;

        match plan.status {
            PlanStatus::Pending | PlanStatus::WaitingApproval | PlanStatus::Approved => {
                let message = format!("Rejected by {}: {}", rejector, reason);
                plan.status = PlanStatus::Rejected;
                plan.completed_at = Some(now);
                plan.error = Some(message.clone());

                audit.log_action(
                    AuditRecord::new(
                        ctx,
                        action::PLAN_REJECTION,
                        plan.id.0.clone(),
                        audit_status::REJECTED,
                        now,
                    )
                    .by_user(rejector)
                    .for_plan(&plan.id)
                    .for_anomaly(&plan.anomaly_id)
                    .with_error(message),
                );

                info!(plan_id = %plan.id, rejector, "plan rejected");
                Ok(RejectOutcome::Rejected)
            }
            status => Ok(RejectOutcome::NotApplicable { status }),
        }
    }

    /// Expire every waiting plan whose deadline has passed.
    pub fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        ctx: &AuditContext,
        audit: &mut AuditLogger,
    ) -> Result<Vec<PlanId>> {
        let mut expired = Vec::new();
        for shared in self.history.shared() {
            let mut plan = lock_plan(shared)?;
            if plan.is_expired(now) {
                expire_locked(&mut plan, now);
                audit.log_action(expiry_record(ctx, &plan, now));
                warn!(plan_id = %plan.id, "plan expired without quorum");
                expired.push(plan.id.clone());
            }
        }
        Ok(expired)
    }

    /// First guardrail objection to a step, or None when it may run.
    pub(super) fn blacklist_reason(&self, step: &ActionStep, key: &MetricKey) -> Option<String> {
        let blacklist = &self.execution.blacklist;
        if blacklist.namespaces.iter().any(|ns| ns == &step.namespace) {
            return Some(format!("namespace {} is blacklisted", step.namespace));
        }
        for label in &blacklist.labels {
            if let Some((name, value)) = label.split_once('=') {
                if key.labels.get(name).map(|v| v == value).unwrap_or(false) {
                    return Some(format!("metric label {} is blacklisted", label));
                }
            }
        }
        None
    }
}

/// Substitute the `{service}` placeholder from the metric's labels,
/// falling back to the metric name.
fn resolve_target(template: &str, key: &MetricKey) -> String {
    if template.contains(SERVICE_PLACEHOLDER) {
        let service = key
            .labels
            .get("service")
            .cloned()
            .unwrap_or_else(|| key.name.clone());
        template.replace(SERVICE_PLACEHOLDER, &service)
    } else {
        template.to_string()
    }
}

fn expire_locked(plan: &mut ActionPlan, now: DateTime<Utc>) {
    plan.status = PlanStatus::Expired;
    plan.completed_at = Some(now);
    plan.error = Some("approval window expired".to_string());
}

fn expiry_record(ctx: &AuditContext, plan: &ActionPlan, now: DateTime<Utc>) -> AuditRecord {
    AuditRecord::new(
        ctx,
        action::PLAN_EXPIRED,
        plan.id.0.clone(),
        PlanStatus::Expired.to_string(),
        now,
    )
    .for_plan(&plan.id)
    .for_anomaly(&plan.anomaly_id)
    .with_error("approval window expired")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Anomaly, AnomalyKind, Severity};
    use crate::playbook::StaticPlaybooks;
    use chrono::TimeZone;
    use mt_common::MetricKey;
    use mt_config::AuditConfig;
    use std::path::Path;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 23, 12, 0, 0).unwrap()
    }

    fn test_ctx() -> AuditContext {
        AuditContext::new("run-test", "host-test")
    }

    fn test_audit(dir: &Path) -> AuditLogger {
        AuditLogger::open(AuditConfig {
            enabled: true,
            retention_days: 90,
            dir: Some(dir.to_path_buf()),
            max_file_bytes: 1024 * 1024,
        })
        .unwrap()
    }

    fn planner() -> ActionPlanner {
        ActionPlanner::new(
            RiskConfig::default(),
            ApprovalConfig::default(),
            ExecutionConfig::default(),
        )
    }

    fn anomaly(metric: &str, severity: Severity, deviation: f64) -> Anomaly {
        let key = MetricKey::bare(metric);
        Anomaly {
            id: AnomalyId::new(),
            category: key.category(),
            key,
            kind: AnomalyKind::Spike,
            severity,
            current_value: 340.0,
            baseline_value: 100.0,
            deviation,
            deviation_percent: 240.0,
            scores: Vec::new(),
            ensemble_score: 1.0,
            detected_at: t0(),
            started_at: t0(),
            duration_minutes: 1,
            is_active: true,
            acknowledged: false,
            acknowledged_by: None,
            resolved_at: None,
        }
    }

    #[test]
    fn test_build_plan_waits_for_approval() {
        let tmp = TempDir::new().unwrap();
        let mut audit = test_audit(tmp.path());
        let mut planner = planner();
        let playbooks = StaticPlaybooks::default_set();

        // api_latency spike, Medium: the irreversible cache flush in the
        // playbook keeps the score in the semi-auto band.
        let anomaly = anomaly("api_latency_p99", Severity::Medium, 2.8);
        let plan = planner
            .build_plan(&anomaly, &playbooks, None, t0(), &test_ctx(), &mut audit)
            .unwrap()
            .unwrap();

        assert_eq!(plan.status, PlanStatus::WaitingApproval);
        assert!(plan.requires_approval);
        assert_eq!(plan.approvals_required, 1);
        assert_eq!(
            plan.approval_deadline,
            Some(t0() + Duration::minutes(30))
        );
        assert_eq!(plan.steps.len(), 2);
        // api-latency playbook resolves {service} to the metric name for a
        // bare key.
        assert_eq!(plan.steps[0].target, "api_latency_p99");

        let records = audit.by_plan(&plan.id);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action_type, action::PLAN_CREATED);
        assert_eq!(records[0].status, "waiting_approval");
    }

    #[test]
    fn test_build_plan_resolves_service_label() {
        let tmp = TempDir::new().unwrap();
        let mut audit = test_audit(tmp.path());
        let mut planner = planner();
        let playbooks = StaticPlaybooks::default_set();

        let key = MetricKey::with_labels(
            "api_latency_p99",
            [("service".to_string(), "payments-api".to_string())],
        );
        let mut a = anomaly("api_latency_p99", Severity::High, 3.4);
        a.category = key.category();
        a.key = key;

        let plan = planner
            .build_plan(&a, &playbooks, None, t0(), &test_ctx(), &mut audit)
            .unwrap()
            .unwrap();
        assert_eq!(plan.steps[0].target, "payments-api");
    }

    #[test]
    fn test_low_risk_plan_is_auto_approved() {
        let tmp = TempDir::new().unwrap();
        let mut audit = test_audit(tmp.path());
        let mut planner = planner();
        let playbooks = StaticPlaybooks::default_set();

        // Low severity, short duration, and a single reversible scale
        // step keep the score just under the auto cutoff.
        let a = anomaly("queue_depth", Severity::Low, 1.2);
        let plan = planner
            .build_plan(&a, &playbooks, None, t0(), &test_ctx(), &mut audit)
            .unwrap()
            .unwrap();

        assert_eq!(plan.risk_tier, RiskTier::Auto);
        assert_eq!(plan.status, PlanStatus::Approved);
        assert!(!plan.requires_approval);
        assert_eq!(plan.approvals_required, 0);
        assert!(plan.approval_deadline.is_none());
    }

    #[test]
    fn test_blacklisted_label_demotes_auto_plan() {
        let tmp = TempDir::new().unwrap();
        let mut audit = test_audit(tmp.path());
        let mut planner = planner();
        let playbooks = StaticPlaybooks::default_set();

        let key = MetricKey::with_labels(
            "queue_depth",
            [("do-not-remediate".to_string(), "true".to_string())],
        );
        let mut a = anomaly("queue_depth", Severity::Low, 1.2);
        a.category = key.category();
        a.key = key;

        let plan = planner
            .build_plan(&a, &playbooks, None, t0(), &test_ctx(), &mut audit)
            .unwrap()
            .unwrap();

        assert_eq!(plan.risk_tier, RiskTier::Auto);
        assert_eq!(plan.status, PlanStatus::WaitingApproval);
        assert!(plan.requires_approval);
        assert_eq!(plan.approvals_required, 1);
        assert!(plan.reason.contains("auto-execution blocked"));
    }

    #[test]
    fn test_approval_quorum_and_dedup() {
        let tmp = TempDir::new().unwrap();
        let mut audit = test_audit(tmp.path());
        let mut planner = planner();
        let playbooks = StaticPlaybooks::default_set();

        // High severity lands the api-latency playbook in the manual
        // tier, which needs two approvers by default.
        let a = anomaly("api_latency_p99", Severity::High, 3.4);
        let built = planner
            .build_plan(&a, &playbooks, None, t0(), &test_ctx(), &mut audit)
            .unwrap()
            .unwrap();
        assert_eq!(built.status, PlanStatus::WaitingApproval);
        assert_eq!(built.approvals_required, 2);

        let outcome = planner
            .approve(&built.id.0, "alice", t0(), &test_ctx(), &mut audit)
            .unwrap();
        assert_eq!(
            outcome,
            ApprovalOutcome::Recorded {
                received: 1,
                required: 2
            }
        );

        let outcome = planner
            .approve(&built.id.0, "alice", t0(), &test_ctx(), &mut audit)
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::Duplicate);

        let outcome = planner
            .approve(&built.id.0, "bob", t0(), &test_ctx(), &mut audit)
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::Approved);

        let plan = planner.get_plan(&built.id.0).unwrap().unwrap();
        assert_eq!(plan.status, PlanStatus::Approved);
        assert_eq!(plan.approvals_received, vec!["alice", "bob"]);

        // Approving an approved plan is a no-op.
        let outcome = planner
            .approve(&built.id.0, "carol", t0(), &test_ctx(), &mut audit)
            .unwrap();
        assert_eq!(
            outcome,
            ApprovalOutcome::NotApplicable {
                status: PlanStatus::Approved
            }
        );
    }

    #[test]
    fn test_approve_unknown_plan_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let mut audit = test_audit(tmp.path());
        let planner = planner();

        let outcome = planner
            .approve("plan-ffffffffffffffff", "alice", t0(), &test_ctx(), &mut audit)
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::NotFound);
    }

    #[test]
    fn test_lazy_expiry_beats_late_approval() {
        let tmp = TempDir::new().unwrap();
        let mut audit = test_audit(tmp.path());
        let mut planner = planner();
        let playbooks = StaticPlaybooks::default_set();

        let a = anomaly("api_latency_p99", Severity::Medium, 2.8);
        let plan = planner
            .build_plan(&a, &playbooks, None, t0(), &test_ctx(), &mut audit)
            .unwrap()
            .unwrap();
        assert_eq!(plan.status, PlanStatus::WaitingApproval);

        let late = t0() + Duration::minutes(31);
        let outcome = planner
            .approve(&plan.id.0, "alice", late, &test_ctx(), &mut audit)
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::Expired);

        let snap = planner.get_plan(&plan.id.0).unwrap().unwrap();
        assert_eq!(snap.status, PlanStatus::Expired);
        assert!(snap.approvals_received.is_empty());
    }

    #[test]
    fn test_reject_before_execution() {
        let tmp = TempDir::new().unwrap();
        let mut audit = test_audit(tmp.path());
        let mut planner = planner();
        let playbooks = StaticPlaybooks::default_set();

        let a = anomaly("api_latency_p99", Severity::Medium, 2.8);
        let plan = planner
            .build_plan(&a, &playbooks, None, t0(), &test_ctx(), &mut audit)
            .unwrap()
            .unwrap();

        let outcome = planner
            .reject(
                &plan.id.0,
                "alice",
                "wrong playbook for this incident",
                t0(),
                &test_ctx(),
                &mut audit,
            )
            .unwrap();
        assert_eq!(outcome, RejectOutcome::Rejected);

        let snap = planner.get_plan(&plan.id.0).unwrap().unwrap();
        assert_eq!(snap.status, PlanStatus::Rejected);
        assert_eq!(
            snap.error.as_deref(),
            Some("Rejected by alice: wrong playbook for this incident")
        );

        // Rejecting a rejected plan changes nothing.
        let outcome = planner
            .reject(&plan.id.0, "bob", "me too", t0(), &test_ctx(), &mut audit)
            .unwrap();
        assert_eq!(
            outcome,
            RejectOutcome::NotApplicable {
                status: PlanStatus::Rejected
            }
        );
    }

    #[test]
    fn test_sweep_expires_overdue_plans() {
        let tmp = TempDir::new().unwrap();
        let mut audit = test_audit(tmp.path());
        let mut planner = planner();
        let playbooks = StaticPlaybooks::default_set();

        let first = planner
            .build_plan(
                &anomaly("api_latency_p99", Severity::Medium, 2.8),
                &playbooks,
                None,
                t0(),
                &test_ctx(),
                &mut audit,
            )
            .unwrap()
            .unwrap();
        let second = planner
            .build_plan(
                &anomaly("queue_depth", Severity::Critical, 6.0),
                &playbooks,
                None,
                t0() + Duration::minutes(20),
                &test_ctx(),
                &mut audit,
            )
            .unwrap()
            .unwrap();

        // 31 minutes in: only the first deadline has passed.
        let expired = planner
            .sweep_expired(t0() + Duration::minutes(31), &test_ctx(), &mut audit)
            .unwrap();
        assert_eq!(expired, vec![first.id.clone()]);

        assert_eq!(
            planner.get_plan(&first.id.0).unwrap().unwrap().status,
            PlanStatus::Expired
        );
        assert_eq!(
            planner.get_plan(&second.id.0).unwrap().unwrap().status,
            PlanStatus::WaitingApproval
        );

        // The sweep is idempotent.
        let again = planner
            .sweep_expired(t0() + Duration::minutes(32), &test_ctx(), &mut audit)
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_pending_approvals_oldest_first() {
        let tmp = TempDir::new().unwrap();
        let mut audit = test_audit(tmp.path());
        let mut planner = planner();
        let playbooks = StaticPlaybooks::default_set();

        planner
            .build_plan(
                &anomaly("queue_depth", Severity::Critical, 6.0),
                &playbooks,
                None,
                t0() + Duration::minutes(5),
                &test_ctx(),
                &mut audit,
            )
            .unwrap();
        planner
            .build_plan(
                &anomaly("api_latency_p99", Severity::Medium, 2.8),
                &playbooks,
                None,
                t0(),
                &test_ctx(),
                &mut audit,
            )
            .unwrap();

        let pending = planner.get_pending_approvals().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].created_at, t0());
        assert_eq!(pending[1].created_at, t0() + Duration::minutes(5));
    }

    #[test]
    fn test_plan_for_anomaly_tracks_latest() {
        let tmp = TempDir::new().unwrap();
        let mut audit = test_audit(tmp.path());
        let mut planner = planner();
        let playbooks = StaticPlaybooks::default_set();

        let a = anomaly("api_latency_p99", Severity::Medium, 2.8);
        assert!(planner.plan_for_anomaly(&a.id).unwrap().is_none());

        let plan = planner
            .build_plan(&a, &playbooks, None, t0(), &test_ctx(), &mut audit)
            .unwrap()
            .unwrap();
        let found = planner.plan_for_anomaly(&a.id).unwrap().unwrap();
        assert_eq!(found.id, plan.id);
    }

    #[test]
    fn test_restore_plans_resumes_approval() {
        let tmp = TempDir::new().unwrap();
        let mut audit = test_audit(tmp.path());
        let mut first = planner();
        let playbooks = StaticPlaybooks::default_set();

        let a = anomaly("api_latency_p99", Severity::Medium, 2.8);
        let plan = first
            .build_plan(&a, &playbooks, None, t0(), &test_ctx(), &mut audit)
            .unwrap()
            .unwrap();
        let saved = first.history().all_snapshots().unwrap();

        let mut second = planner();
        assert_eq!(second.restore_plans(saved.clone()), 1);
        // Replaying the same ledger adopts nothing new.
        assert_eq!(second.restore_plans(saved), 0);

        let found = second.plan_for_anomaly(&a.id).unwrap().unwrap();
        assert_eq!(found.id, plan.id);
        assert_eq!(found.status, PlanStatus::WaitingApproval);

        // The reloaded plan still runs its approval state machine.
        let outcome = second
            .approve(
                &plan.id.0,
                "alice",
                t0() + Duration::minutes(5),
                &test_ctx(),
                &mut audit,
            )
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::Approved);
    }

    #[test]
    fn test_empty_playbook_is_a_plan_error() {
        use crate::playbook::Playbook;

        struct EmptyPlaybook(Playbook);
        impl PlaybookMatcher for EmptyPlaybook {
            fn find(&self, _metric_name: &str, _kind: AnomalyKind) -> Option<&Playbook> {
                Some(&self.0)
            }
        }

        let tmp = TempDir::new().unwrap();
        let mut audit = test_audit(tmp.path());
        let mut planner = planner();
        let matcher = EmptyPlaybook(Playbook {
            name: "hollow".to_string(),
            metric_pattern: "*".to_string(),
            kinds: Vec::new(),
            steps: Vec::new(),
        });

        let err = planner
            .build_plan(
                &anomaly("api_latency_p99", Severity::High, 4.0),
                &matcher,
                None,
                t0(),
                &test_ctx(),
                &mut audit,
            )
            .unwrap_err();
        assert_eq!(err.code(), 40);
    }
}
