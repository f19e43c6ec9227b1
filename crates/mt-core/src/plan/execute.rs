//! Plan execution against an [`Executor`].
//!
//! Steps run sequentially under per-step guardrails (blacklist, target
//! cooldown). The first failure stops the walk and, when configured,
//! previously completed reversible steps are rolled back in reverse
//! order. Every transition lands in the audit trail.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use mt_common::{Error, MetricKey, Result};

use crate::audit::{action, status as audit_status, AuditContext, AuditLogger, AuditRecord};

use super::planner::ActionPlanner;
use super::{lock_plan, ActionPlan, ActionStep, ParamMap, PlanStatus, StepStatus};

// ---------------------------------------------------------------------------
// Executor seam
// ---------------------------------------------------------------------------

/// What one executor invocation did.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// State captured for a later rollback of this step.
    pub rollback_data: ParamMap,
    /// Observed state after the action, for the audit record.
    pub state_after: ParamMap,
    /// Executor's own verification of the applied action, if it ran one.
    pub post_check_passed: Option<bool>,
}

impl StepOutcome {
    pub fn ok() -> Self {
        StepOutcome {
            success: true,
            error: None,
            rollback_data: ParamMap::new(),
            state_after: ParamMap::new(),
            post_check_passed: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        StepOutcome {
            success: false,
            error: Some(error.into()),
            rollback_data: ParamMap::new(),
            state_after: ParamMap::new(),
            post_check_passed: None,
        }
    }

    pub fn with_rollback_data(mut self, data: ParamMap) -> Self {
        self.rollback_data = data;
        self
    }

    pub fn with_state_after(mut self, state: ParamMap) -> Self {
        self.state_after = state;
        self
    }

    pub fn with_post_check(mut self, passed: bool) -> Self {
        self.post_check_passed = Some(passed);
        self
    }
}

/// Applies remediation actions to the world.
///
/// Implementations report failure through the outcome instead of an
/// error; the engine records it on the step and owns rollback policy.
pub trait Executor: Send + Sync {
    fn execute(&self, step: &ActionStep) -> StepOutcome;

    /// Undo a previously executed step using its captured rollback data.
    fn rollback(&self, step: &ActionStep) -> StepOutcome;
}

/// Executor that records what it would do without touching anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunExecutor;

impl Executor for DryRunExecutor {
    fn execute(&self, step: &ActionStep) -> StepOutcome {
        let mut state = ParamMap::new();
        state.insert(
            "would_execute".to_string(),
            serde_json::json!(format!("{} {}", step.kind, step.target)),
        );
        StepOutcome::ok().with_state_after(state)
    }

    fn rollback(&self, step: &ActionStep) -> StepOutcome {
        let mut state = ParamMap::new();
        state.insert(
            "would_roll_back".to_string(),
            serde_json::json!(format!("{} {}", step.kind, step.target)),
        );
        StepOutcome::ok().with_state_after(state)
    }
}

/// Outcome substituted for every step when the engine runs dry.
fn dry_run_outcome() -> StepOutcome {
    let mut state = ParamMap::new();
    state.insert("dry_run".to_string(), serde_json::json!(true));
    StepOutcome::ok().with_state_after(state)
}

fn failure_message(error: Option<String>) -> String {
    error.unwrap_or_else(|| "executor reported failure".to_string())
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

impl ActionPlanner {
    /// Execute an approved plan to completion.
    ///
    /// Walks the steps in order; a step that fails or is blocked by a
    /// guardrail fails the plan and stops the walk. With
    /// `rollback_on_failure` set, completed reversible steps are then
    /// undone newest first; a rollback failure is recorded on the step
    /// and never re-thrown. Returns the plan's final snapshot.
    pub fn execute_plan(
        &mut self,
        plan_id: &str,
        executor: &dyn Executor,
        now: DateTime<Utc>,
        ctx: &AuditContext,
        audit: &mut AuditLogger,
    ) -> Result<ActionPlan> {
        if !self.execution.enabled {
            return Err(Error::Plan(
                "execution is disabled by configuration".to_string(),
            ));
        }

        // Count in-flight plans before taking the target's lock; the
        // snapshot walk acquires every plan lock in turn.
        let in_flight = self.history.by_status(PlanStatus::Executing)?.len();
        if in_flight >= self.execution.max_concurrent {
            return Err(Error::ConcurrencyLimit {
                limit: self.execution.max_concurrent,
            });
        }

        let shared = self
            .history
            .get(plan_id)
            .ok_or_else(|| Error::PlanNotFound {
                plan_id: plan_id.to_string(),
            })?;
        let mut guard = lock_plan(&shared)?;
        let plan: &mut ActionPlan = &mut guard;

        if plan.status != PlanStatus::Approved {
            return Err(Error::InvalidTransition {
                plan_id: plan.id.0.clone(),
                from: plan.status.to_string(),
                to: PlanStatus::Executing.to_string(),
            });
        }

        plan.status = PlanStatus::Executing;
        plan.started_at = Some(now);

        let dry_run = self.execution.dry_run;
        let total = plan.steps.len();
        let key = plan.metric_key.clone();

        let mut parameters = ParamMap::new();
        parameters.insert("steps".to_string(), serde_json::json!(total));
        parameters.insert("dry_run".to_string(), serde_json::json!(dry_run));
        audit.log_action(
            AuditRecord::new(
                ctx,
                action::PLAN_EXECUTION,
                key.canonical(),
                audit_status::STARTED,
                now,
            )
            .for_plan(&plan.id)
            .for_anomaly(&plan.anomaly_id)
            .with_parameters(parameters),
        );
        info!(plan_id = %plan.id, steps = total, dry_run, "plan execution started");

        let mut failed_idx: Option<usize> = None;
        let mut plan_error: Option<String> = None;

        for idx in 0..total {
            plan.current_step = idx;

            if let Some(reason) = self.step_guardrail(&plan.steps[idx], &key, now) {
                plan.steps[idx].mark_skipped(reason.clone());
                warn!(
                    plan_id = %plan.id,
                    step = idx,
                    target = %plan.steps[idx].target,
                    %reason,
                    "step blocked by guardrail"
                );
                audit.log_action(
                    AuditRecord::new(
                        ctx,
                        action::STEP_EXECUTED,
                        plan.steps[idx].target.clone(),
                        audit_status::SKIPPED,
                        now,
                    )
                    .for_plan(&plan.id)
                    .for_step(&plan.steps[idx].id)
                    .for_anomaly(&plan.anomaly_id)
                    .with_error(reason.clone()),
                );
                plan_error = Some(reason);
                failed_idx = Some(idx);
                break;
            }

            plan.steps[idx].pre_check_passed = Some(true);
            plan.steps[idx].mark_running(now);

            let outcome = if dry_run {
                dry_run_outcome()
            } else {
                executor.execute(&plan.steps[idx])
            };
            // Dry runs never touch the target, so they never start a
            // cooldown either.
            if !dry_run {
                self.cooldowns.insert(plan.steps[idx].target.clone(), now);
            }

            let StepOutcome {
                success,
                error,
                rollback_data,
                state_after,
                post_check_passed,
            } = outcome;
            plan.steps[idx].rollback_data = rollback_data;
            plan.steps[idx].post_check_passed = post_check_passed;

            if success {
                plan.steps[idx].mark_success(now);
                let duration = plan.steps[idx].duration_seconds.unwrap_or(0.0);
                audit.log_action(
                    AuditRecord::new(
                        ctx,
                        action::STEP_EXECUTED,
                        plan.steps[idx].target.clone(),
                        audit_status::SUCCESS,
                        now,
                    )
                    .for_plan(&plan.id)
                    .for_step(&plan.steps[idx].id)
                    .for_anomaly(&plan.anomaly_id)
                    .with_duration(duration)
                    .with_parameters(plan.steps[idx].parameters.clone())
                    .with_state_after(state_after),
                );
            } else {
                let message = failure_message(error);
                plan.steps[idx].mark_failed(now, message.clone());
                warn!(
                    plan_id = %plan.id,
                    step = idx,
                    target = %plan.steps[idx].target,
                    %message,
                    "step failed"
                );
                audit.log_action(
                    AuditRecord::new(
                        ctx,
                        action::STEP_EXECUTED,
                        plan.steps[idx].target.clone(),
                        audit_status::FAILED,
                        now,
                    )
                    .for_plan(&plan.id)
                    .for_step(&plan.steps[idx].id)
                    .for_anomaly(&plan.anomaly_id)
                    .with_error(message.clone())
                    .with_state_after(state_after),
                );
                plan_error = Some(format!(
                    "{} on {} failed: {}",
                    plan.steps[idx].kind, plan.steps[idx].target, message
                ));
                failed_idx = Some(idx);
                break;
            }
        }

        if let Some(fail_idx) = failed_idx {
            if self.execution.rollback_on_failure && !dry_run {
                for idx in (0..fail_idx).rev() {
                    if plan.steps[idx].status != StepStatus::Success
                        || !plan.steps[idx].can_rollback
                    {
                        continue;
                    }
                    let outcome = executor.rollback(&plan.steps[idx]);
                    if outcome.success {
                        plan.steps[idx].mark_rolled_back();
                        info!(
                            plan_id = %plan.id,
                            step = idx,
                            target = %plan.steps[idx].target,
                            "step rolled back"
                        );
                        audit.log_action(
                            AuditRecord::new(
                                ctx,
                                action::STEP_ROLLBACK,
                                plan.steps[idx].target.clone(),
                                audit_status::ROLLED_BACK,
                                now,
                            )
                            .for_plan(&plan.id)
                            .for_step(&plan.steps[idx].id)
                            .for_anomaly(&plan.anomaly_id)
                            .with_state_after(outcome.state_after),
                        );
                    } else {
                        let message = failure_message(outcome.error);
                        plan.steps[idx].error = Some(format!("rollback failed: {}", message));
                        warn!(
                            plan_id = %plan.id,
                            step = idx,
                            target = %plan.steps[idx].target,
                            %message,
                            "rollback failed, leaving step applied"
                        );
                        audit.log_action(
                            AuditRecord::new(
                                ctx,
                                action::STEP_ROLLBACK,
                                plan.steps[idx].target.clone(),
                                audit_status::FAILED,
                                now,
                            )
                            .for_plan(&plan.id)
                            .for_step(&plan.steps[idx].id)
                            .for_anomaly(&plan.anomaly_id)
                            .with_error(message),
                        );
                    }
                }
            }
        }

        let executed_ok = plan
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Success | StepStatus::RolledBack))
            .count();
        let failed = plan
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed | StepStatus::Skipped))
            .count();
        let rolled = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::RolledBack)
            .count();
        let summary = format!(
            "Executed {}/{} steps successfully. Failed: {}. Rolled back: {}.",
            executed_ok, total, failed, rolled
        );

        let succeeded = failed_idx.is_none();
        plan.status = if succeeded {
            PlanStatus::Succeeded
        } else {
            PlanStatus::Failed
        };
        plan.success = Some(succeeded);
        plan.completed_at = Some(now);
        plan.summary = Some(summary.clone());
        plan.error = plan_error;

        let duration = plan
            .started_at
            .map(|t| (now - t).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        let mut parameters = ParamMap::new();
        parameters.insert("summary".to_string(), serde_json::json!(summary));
        parameters.insert(
            "steps_succeeded".to_string(),
            serde_json::json!(executed_ok),
        );
        parameters.insert("steps_failed".to_string(), serde_json::json!(failed));
        parameters.insert("steps_rolled_back".to_string(), serde_json::json!(rolled));
        let mut record = AuditRecord::new(
            ctx,
            action::PLAN_EXECUTION,
            key.canonical(),
            if succeeded {
                audit_status::SUCCESS
            } else {
                audit_status::FAILED
            },
            now,
        )
        .for_plan(&plan.id)
        .for_anomaly(&plan.anomaly_id)
        .with_duration(duration)
        .with_parameters(parameters);
        if let Some(err) = &plan.error {
            record = record.with_error(err.clone());
        }
        audit.log_action(record);

        if succeeded {
            info!(plan_id = %plan.id, %summary, "plan execution succeeded");
        } else {
            warn!(
                plan_id = %plan.id,
                error = plan.error.as_deref().unwrap_or(""),
                "plan execution failed"
            );
        }

        Ok(plan.clone())
    }

    /// First guardrail objection to running a step now, or None.
    fn step_guardrail(
        &self,
        step: &ActionStep,
        key: &MetricKey,
        now: DateTime<Utc>,
    ) -> Option<String> {
        if let Some(reason) = self.blacklist_reason(step, key) {
            return Some(reason);
        }
        if let Some(last) = self.cooldowns.get(&step.target) {
            let window = Duration::minutes(self.execution.cooldown_minutes);
            let elapsed = now - *last;
            if elapsed < window {
                let remaining = (window - elapsed).num_minutes().max(1);
                return Some(format!(
                    "target {} is cooling down for {}min",
                    step.target, remaining
                ));
            }
        }
        None
    }
}
