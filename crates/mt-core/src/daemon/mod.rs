//! Engine orchestration: the detection-to-remediation tick loop.
//!
//! [`Engine`] wires the baseline store, detector, planner, and audit
//! trail into one synchronous [`Engine::process_tick`] pass:
//! snapshot the source, score it, cut plans for surfaced anomalies,
//! execute whatever is approved, then sweep expired approvals. The
//! binary owns scheduling and shutdown; everything here takes the
//! clock, source, and executor as parameters so tests drive the whole
//! loop without sleeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use mt_common::{Error, PlanId, Result};
use mt_config::EngineConfig;

use crate::audit::{action, status as audit_status, AuditContext, AuditLogger, AuditRecord};
use crate::baseline::store::{BaselineStore, LearnReport};
use crate::detect::{Anomaly, AnomalyDetector, AnomalyState, TickReport};
use crate::logging::{generate_run_id, get_host_id};
use crate::plan::execute::Executor;
use crate::plan::planner::{ActionPlanner, ApprovalOutcome, RejectOutcome};
use crate::plan::{ParamMap, PlanHistory, PlanStatus};
use crate::playbook::{PlaybookMatcher, StaticPlaybooks};
use crate::source::MetricSource;

/// Baseline snapshot filename under the state directory.
pub const BASELINE_SNAPSHOT_FILENAME: &str = "baselines.json";

/// Anomaly registry filename under the state directory.
pub const ANOMALY_STATE_FILENAME: &str = "anomalies.json";

/// Plan ledger filename under the state directory.
pub const PLAN_SNAPSHOT_FILENAME: &str = "plans.json";

const EVENT_RING_CAPACITY: usize = 100;

const STATE_DIR_NAME: &str = "state";

/// Resolve the engine state directory from the environment.
///
/// `$METRIC_TRIAGE_DATA/state` when the override is set, then the XDG
/// data dir, then the platform data dir via `dirs`.
pub fn resolve_state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("METRIC_TRIAGE_DATA") {
        return Ok(PathBuf::from(dir).join(STATE_DIR_NAME));
    }

    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return Ok(PathBuf::from(xdg)
            .join("metric_triage")
            .join(STATE_DIR_NAME));
    }

    if let Some(base) = dirs::data_dir() {
        return Ok(base.join("metric_triage").join(STATE_DIR_NAME));
    }

    Err(Error::DataDirUnavailable)
}

// ---------------------------------------------------------------------------
// Events and run state
// ---------------------------------------------------------------------------

/// One notable engine occurrence, kept in the in-memory ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub at: DateTime<Utc>,
    pub kind: EngineEventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineEventKind {
    AnomalyOpened,
    AnomalyResolved,
    PlanCreated,
    PlanExecuted,
    PlanFailed,
    PlanExpired,
    TickCompleted,
}

/// Counters and the event ring for one engine run.
///
/// Per-run only: a restart starts from zero while the durable pieces
/// (baselines, anomaly registry, plan ledger, audit trail) reload from
/// disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    pub started_at: DateTime<Utc>,
    pub tick_count: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub anomalies_opened: u64,
    pub anomalies_resolved: u64,
    pub plans_created: u64,
    pub plans_executed: u64,
    pub recent_events: VecDeque<EngineEvent>,
}

impl EngineState {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        EngineState {
            started_at,
            tick_count: 0,
            last_tick_at: None,
            anomalies_opened: 0,
            anomalies_resolved: 0,
            plans_created: 0,
            plans_executed: 0,
            recent_events: VecDeque::with_capacity(EVENT_RING_CAPACITY),
        }
    }

    fn push_event(&mut self, event: EngineEvent) {
        if self.recent_events.len() >= EVENT_RING_CAPACITY {
            self.recent_events.pop_front();
        }
        self.recent_events.push_back(event);
    }
}

// ---------------------------------------------------------------------------
// Tick outcome
// ---------------------------------------------------------------------------

/// A plan that finished execution during a tick.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutedPlan {
    pub plan_id: PlanId,
    pub status: PlanStatus,
    pub success: bool,
}

/// Outcome of one engine tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickOutcome {
    pub tick: u64,
    pub at: DateTime<Utc>,
    /// Detection pass results, including surfaced anomalies.
    pub report: TickReport,
    pub plans_created: Vec<PlanId>,
    pub plans_executed: Vec<ExecutedPlan>,
    pub plans_expired: Vec<PlanId>,
    /// Events raised by this tick, in order.
    pub events: Vec<EngineEvent>,
}

/// What a state reload found on disk.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub baselines: usize,
    pub active_anomalies: usize,
    pub plans: usize,
    pub audit_records: usize,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// One process's engine: the single writer over detection and planning.
pub struct Engine {
    config: EngineConfig,
    ctx: AuditContext,
    baselines: BaselineStore,
    detector: AnomalyDetector,
    planner: ActionPlanner,
    playbooks: Box<dyn PlaybookMatcher>,
    audit: AuditLogger,
    state: EngineState,
    /// Deviation each anomaly showed on its previous surfaced tick,
    /// for the worsening signal in risk urgency.
    last_deviation: HashMap<String, f64>,
}

impl Engine {
    pub fn new(config: EngineConfig, now: DateTime<Utc>) -> Result<Self> {
        let ctx = AuditContext::new(generate_run_id(), get_host_id());
        Self::with_context(config, ctx, now)
    }

    /// Build an engine with an explicit audit context; tests pin ids.
    pub fn with_context(
        config: EngineConfig,
        ctx: AuditContext,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let audit = AuditLogger::open(config.audit.clone())?;
        let baselines = BaselineStore::new(config.baseline.clone());
        let detector = AnomalyDetector::new(config.detection.clone());
        let planner = ActionPlanner::new(
            config.risk.clone(),
            config.approval.clone(),
            config.execution.clone(),
        );
        Ok(Engine {
            config,
            ctx,
            baselines,
            detector,
            planner,
            playbooks: Box::new(StaticPlaybooks::default_set()),
            audit,
            state: EngineState::new(now),
            last_deviation: HashMap::new(),
        })
    }

    /// Replace the builtin playbook table.
    pub fn with_playbooks(mut self, playbooks: Box<dyn PlaybookMatcher>) -> Self {
        self.playbooks = playbooks;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &AuditContext {
        &self.ctx
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    pub fn planner(&self) -> &ActionPlanner {
        &self.planner
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Record one approval on a waiting plan.
    pub fn approve(
        &mut self,
        plan_id: &str,
        approver: &str,
        now: DateTime<Utc>,
    ) -> Result<ApprovalOutcome> {
        self.planner
            .approve(plan_id, approver, now, &self.ctx, &mut self.audit)
    }

    /// Reject a plan anywhere before execution starts.
    pub fn reject(
        &mut self,
        plan_id: &str,
        rejector: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<RejectOutcome> {
        self.planner
            .reject(plan_id, rejector, reason, now, &self.ctx, &mut self.audit)
    }

    /// Mark an active anomaly as acknowledged by an operator.
    pub fn acknowledge(&mut self, anomaly_id: &str, by: &str, now: DateTime<Utc>) -> bool {
        self.detector.acknowledge(anomaly_id, by, now)
    }

    /// Learn baselines for every key a source serves, auditing each
    /// one that lands.
    pub fn learn_baselines(
        &mut self,
        source: &dyn MetricSource,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> LearnReport {
        let report = self.baselines.learn_from_source(source, start, end, now);
        for canonical in &report.learned {
            self.audit.log_action(AuditRecord::new(
                &self.ctx,
                action::BASELINE_LEARNED,
                canonical.clone(),
                audit_status::SUCCESS,
                now,
            ));
        }
        report
    }

    /// One pass of the engine loop: snapshot, detect, plan, execute,
    /// expire.
    ///
    /// Per-key and per-plan failures are logged and absorbed; only a
    /// source failure or a poisoned lock aborts the tick.
    pub fn process_tick(
        &mut self,
        source: &dyn MetricSource,
        executor: &dyn Executor,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        self.state.tick_count += 1;
        self.state.last_tick_at = Some(now);
        let tick = self.state.tick_count;
        let mut events = Vec::new();

        let snapshot = source.fetch(&source.keys(), now)?;
        let report = self.detector.process_tick(&snapshot, &self.baselines, now)?;

        self.record_anomaly_audit(&report, now, &mut events);
        let plans_created = self.plan_surfaced(&report, now, &mut events)?;
        let plans_executed = self.execute_approved(executor, now, &mut events)?;

        let plans_expired = self.planner.sweep_expired(now, &self.ctx, &mut self.audit)?;
        for plan_id in &plans_expired {
            self.note(
                EngineEventKind::PlanExpired,
                format!("plan {} expired without quorum", plan_id),
                now,
                &mut events,
            );
        }

        debug!(
            tick,
            evaluated = report.evaluated,
            skipped = report.skipped,
            opened = report.opened.len(),
            resolved = report.resolved.len(),
            surfaced = report.surfaced.len(),
            plans = plans_created.len(),
            executed = plans_executed.len(),
            "tick complete"
        );
        self.state.push_event(EngineEvent {
            at: now,
            kind: EngineEventKind::TickCompleted,
            detail: format!("tick {}", tick),
        });

        Ok(TickOutcome {
            tick,
            at: now,
            report,
            plans_created,
            plans_executed,
            plans_expired,
            events,
        })
    }

    /// Write baseline, anomaly, and plan snapshots under `dir`.
    pub fn save_state(&self, dir: &Path, now: DateTime<Utc>) -> Result<()> {
        self.baselines
            .save_to_file(&dir.join(BASELINE_SNAPSHOT_FILENAME), now)?;
        self.detector.save_state(&dir.join(ANOMALY_STATE_FILENAME))?;
        self.planner
            .history()
            .save_to_file(&dir.join(PLAN_SNAPSHOT_FILENAME), now)?;
        debug!(dir = %dir.display(), "state snapshots written");
        Ok(())
    }

    /// Reload whatever snapshots exist under `dir`, plus the audit
    /// trail's trailing window. Absent files are a cold start, not an
    /// error.
    pub fn restore_state(&mut self, dir: &Path, now: DateTime<Utc>) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();

        let baseline_path = dir.join(BASELINE_SNAPSHOT_FILENAME);
        if baseline_path.exists() {
            report.baselines = self.baselines.load_from_file(&baseline_path)?;
        }

        let state_path = dir.join(ANOMALY_STATE_FILENAME);
        if state_path.exists() {
            let state = AnomalyState::load_from_file(&state_path)?;
            report.active_anomalies = state.active.len();
            self.detector = AnomalyDetector::with_state(self.config.detection.clone(), state);
        }

        let plan_path = dir.join(PLAN_SNAPSHOT_FILENAME);
        if plan_path.exists() {
            let plans = PlanHistory::load_from_file(&plan_path)?;
            report.plans = self.planner.restore_plans(plans);
        }

        if self.config.audit.enabled {
            report.audit_records = self
                .audit
                .load_from_file(self.config.audit.retention_days, now)?;
        }

        info!(
            baselines = report.baselines,
            active_anomalies = report.active_anomalies,
            plans = report.plans,
            audit_records = report.audit_records,
            "state restored"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------
    // Tick phases
    // -----------------------------------------------------------------

    fn record_anomaly_audit(
        &mut self,
        report: &TickReport,
        now: DateTime<Utc>,
        events: &mut Vec<EngineEvent>,
    ) {
        for id in &report.opened {
            let Some((record, detail)) = self.opened_record(&id.0, now) else {
                continue;
            };
            self.audit.log_action(record);
            self.state.anomalies_opened += 1;
            self.note(EngineEventKind::AnomalyOpened, detail, now, events);
        }

        for id in &report.resolved {
            self.last_deviation.remove(&id.0);
            let Some((record, detail)) = self.resolved_record(&id.0, now) else {
                continue;
            };
            self.audit.log_action(record);
            self.state.anomalies_resolved += 1;
            self.note(EngineEventKind::AnomalyResolved, detail, now, events);
        }
    }

    fn opened_record(&self, id: &str, now: DateTime<Utc>) -> Option<(AuditRecord, String)> {
        let anomaly = self.detector.state().get(id)?;
        let mut parameters = ParamMap::new();
        parameters.insert(
            "severity".to_string(),
            serde_json::json!(anomaly.severity.to_string()),
        );
        parameters.insert(
            "kind".to_string(),
            serde_json::json!(anomaly.kind.to_string()),
        );
        parameters.insert(
            "value".to_string(),
            serde_json::json!(anomaly.current_value),
        );
        parameters.insert(
            "baseline".to_string(),
            serde_json::json!(anomaly.baseline_value),
        );
        parameters.insert("deviation".to_string(), serde_json::json!(anomaly.deviation));
        parameters.insert(
            "ensemble_score".to_string(),
            serde_json::json!(anomaly.ensemble_score),
        );
        let record = AuditRecord::new(
            &self.ctx,
            action::ANOMALY_DETECTED,
            anomaly.key.canonical(),
            audit_status::RECORDED,
            now,
        )
        .for_anomaly(&anomaly.id)
        .with_parameters(parameters);
        let detail = format!(
            "{} {} on {}",
            anomaly.severity,
            anomaly.kind,
            anomaly.key.canonical()
        );
        Some((record, detail))
    }

    fn resolved_record(&self, id: &str, now: DateTime<Utc>) -> Option<(AuditRecord, String)> {
        let anomaly = self.detector.state().get(id)?;
        let mut parameters = ParamMap::new();
        parameters.insert(
            "duration_minutes".to_string(),
            serde_json::json!(anomaly.duration_minutes),
        );
        let record = AuditRecord::new(
            &self.ctx,
            action::ANOMALY_RESOLVED,
            anomaly.key.canonical(),
            audit_status::RECORDED,
            now,
        )
        .for_anomaly(&anomaly.id)
        .with_parameters(parameters);
        let detail = format!(
            "{} resolved after {}min",
            anomaly.key.canonical(),
            anomaly.duration_minutes
        );
        Some((record, detail))
    }

    fn plan_surfaced(
        &mut self,
        report: &TickReport,
        now: DateTime<Utc>,
        events: &mut Vec<EngineEvent>,
    ) -> Result<Vec<PlanId>> {
        let mut created = Vec::new();
        for anomaly in &report.surfaced {
            let previous = self.last_deviation.get(&anomaly.id.0).copied();
            if self.should_plan(anomaly)? {
                if let Some(plan) = self.planner.build_plan(
                    anomaly,
                    self.playbooks.as_ref(),
                    previous,
                    now,
                    &self.ctx,
                    &mut self.audit,
                )? {
                    self.state.plans_created += 1;
                    let detail = format!(
                        "plan {} ({}) for {}",
                        plan.id,
                        plan.risk_tier,
                        plan.metric_key.canonical()
                    );
                    self.note(EngineEventKind::PlanCreated, detail, now, events);
                    created.push(plan.id);
                }
            }
            self.last_deviation
                .insert(anomaly.id.0.clone(), anomaly.deviation);
        }
        Ok(created)
    }

    /// One live plan per anomaly: a new plan is cut only when none
    /// exists yet, or when the previous one expired while the anomaly
    /// stayed active. Succeeded, Failed, and Rejected plans park the
    /// anomaly until an operator acts or it resolves.
    fn should_plan(&self, anomaly: &Anomaly) -> Result<bool> {
        match self.planner.plan_for_anomaly(&anomaly.id)? {
            None => Ok(true),
            Some(plan) => Ok(plan.status == PlanStatus::Expired),
        }
    }

    fn execute_approved(
        &mut self,
        executor: &dyn Executor,
        now: DateTime<Utc>,
        events: &mut Vec<EngineEvent>,
    ) -> Result<Vec<ExecutedPlan>> {
        let mut finished = Vec::new();
        if !self.config.execution.enabled {
            return Ok(finished);
        }

        let mut approved = self.planner.history().by_status(PlanStatus::Approved)?;
        approved.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        for plan in approved {
            match self
                .planner
                .execute_plan(&plan.id.0, executor, now, &self.ctx, &mut self.audit)
            {
                Ok(done) => {
                    self.state.plans_executed += 1;
                    let success = done.success == Some(true);
                    let kind = if success {
                        EngineEventKind::PlanExecuted
                    } else {
                        EngineEventKind::PlanFailed
                    };
                    self.note(kind, format!("plan {} {}", done.id, done.status), now, events);
                    finished.push(ExecutedPlan {
                        plan_id: done.id,
                        status: done.status,
                        success,
                    });
                }
                Err(err) => {
                    warn!(plan_id = %plan.id, error = %err, "plan execution error");
                    self.note(
                        EngineEventKind::PlanFailed,
                        format!("plan {}: {}", plan.id, err),
                        now,
                        events,
                    );
                }
            }
        }
        Ok(finished)
    }

    fn note(
        &mut self,
        kind: EngineEventKind,
        detail: String,
        at: DateTime<Utc>,
        events: &mut Vec<EngineEvent>,
    ) {
        let event = EngineEvent { at, kind, detail };
        self.state.push_event(event.clone());
        events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::store::BaselineSnapshot;
    use crate::baseline::{Baseline, BaselineStats};
    use crate::plan::execute::StepOutcome;
    use crate::plan::ActionStep;
    use crate::risk::RiskTier;
    use chrono::{Duration, TimeZone};
    use mt_common::{MetricKey, SCHEMA_VERSION};
    use mt_config::{AuditConfig, DetectionConfig, RiskThresholds, ScoreAlgorithm};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 20, 12, 0, 0).unwrap()
    }

    fn stats(mean: f64, std: f64) -> BaselineStats {
        BaselineStats {
            mean,
            std_dev: std,
            median: mean,
            mad: std * 0.7,
            min: mean - 3.0 * std,
            max: mean + 3.0 * std,
            p5: mean - 2.0 * std,
            p25: mean - std,
            p75: mean + std,
            p95: mean + 2.0 * std,
            sample_count: 10_080,
        }
    }

    fn fixture_baseline(name: &str, mean: f64, std: f64) -> Baseline {
        Baseline {
            key: MetricKey::bare(name),
            created_at: t0(),
            updated_at: t0(),
            data_start: t0() - Duration::days(7),
            data_end: t0(),
            sample_count: 10_080,
            global_stats: stats(mean, std),
            hourly: Vec::new(),
            quality_score: 0.8,
            coverage_days: 7,
        }
    }

    fn engine_config(dir: &TempDir) -> EngineConfig {
        EngineConfig {
            detection: DetectionConfig {
                algorithms: vec![ScoreAlgorithm::Zscore],
                ensemble_min_votes: 1,
                ..DetectionConfig::default()
            },
            audit: AuditConfig {
                dir: Some(dir.path().join("audit")),
                ..AuditConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    fn engine_with(config: EngineConfig, baselines: Vec<Baseline>) -> Engine {
        let engine =
            Engine::with_context(config, AuditContext::new("run-test", "host-test"), t0())
                .unwrap();
        let snapshot = BaselineSnapshot {
            schema_version: SCHEMA_VERSION.to_string(),
            saved_at: t0(),
            baselines: baselines
                .into_iter()
                .map(|b| (b.key.canonical(), b))
                .collect(),
        };
        engine.baselines().restore(snapshot).unwrap();
        engine
    }

    /// One point per minute from t0, so each tick reads its own value.
    fn source_with(name: &str, values: &[f64]) -> crate::source::StaticSource {
        let mut series = crate::source::MetricSeries::new(MetricKey::bare(name));
        for (i, value) in values.iter().enumerate() {
            series.push(t0() + Duration::minutes(i as i64), *value);
        }
        let mut source = crate::source::StaticSource::new();
        source.insert(series);
        source
    }

    struct OkExecutor {
        calls: Mutex<Vec<String>>,
    }

    impl OkExecutor {
        fn new() -> Self {
            OkExecutor {
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Executor for OkExecutor {
        fn execute(&self, step: &ActionStep) -> StepOutcome {
            self.calls
                .lock()
                .unwrap()
                .push(format!("execute:{}", step.target));
            StepOutcome::ok()
        }

        fn rollback(&self, step: &ActionStep) -> StepOutcome {
            self.calls
                .lock()
                .unwrap()
                .push(format!("rollback:{}", step.target));
            StepOutcome::ok()
        }
    }

    fn run_ticks(
        engine: &mut Engine,
        source: &dyn MetricSource,
        executor: &dyn Executor,
        count: usize,
    ) -> Vec<TickOutcome> {
        (0..count)
            .map(|i| {
                engine
                    .process_tick(source, executor, t0() + Duration::minutes(i as i64))
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_quiet_ticks_produce_nothing() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(
            engine_config(&dir),
            vec![fixture_baseline("cpu_usage", 100.0, 10.0)],
        );
        let source = source_with("cpu_usage", &[100.0, 101.0]);
        let executor = OkExecutor::new();

        let outcomes = run_ticks(&mut engine, &source, &executor, 2);

        assert_eq!(outcomes[0].tick, 1);
        assert_eq!(outcomes[0].report.evaluated, 1);
        assert!(outcomes[0].report.opened.is_empty());
        assert!(outcomes[1].plans_created.is_empty());
        assert!(outcomes[1].plans_executed.is_empty());
        assert_eq!(engine.state().tick_count, 2);
        assert!(executor.calls().is_empty());
        assert!(engine
            .state()
            .recent_events
            .iter()
            .all(|e| e.kind == EngineEventKind::TickCompleted));
    }

    #[test]
    fn test_spike_surfaces_into_waiting_plan() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(
            engine_config(&dir),
            vec![fixture_baseline("queue_depth", 100.0, 10.0)],
        );
        let source = source_with(
            "queue_depth",
            &[100.0, 100.0, 340.0, 340.0, 340.0, 340.0],
        );
        let executor = OkExecutor::new();

        let outcomes = run_ticks(&mut engine, &source, &executor, 6);

        // Tick 3 opens the anomaly; the duration gate holds the plan back.
        assert_eq!(outcomes[2].report.opened.len(), 1);
        assert!(outcomes[2].plans_created.is_empty());
        assert!(outcomes[3].plans_created.is_empty());

        // Tick 5 surfaces it and a plan lands in the approval queue.
        assert_eq!(outcomes[4].report.surfaced.len(), 1);
        assert_eq!(outcomes[4].plans_created.len(), 1);

        let plan = engine
            .planner()
            .get_plan(&outcomes[4].plans_created[0].0)
            .unwrap()
            .unwrap();
        assert_eq!(plan.status, PlanStatus::WaitingApproval);
        assert_eq!(plan.risk_tier, RiskTier::Manual);
        assert_eq!(plan.approvals_required, 2);
        assert!((plan.risk_score - 0.7025).abs() < 1e-9);
        assert_eq!(engine.planner().get_pending_approvals().unwrap().len(), 1);

        // The waiting plan parks the anomaly: no duplicate on tick 6.
        assert!(outcomes[5].plans_created.is_empty());

        let trail = engine.audit().trail();
        assert_eq!(trail.recent(10, Some(action::ANOMALY_DETECTED)).len(), 1);
        assert_eq!(trail.recent(10, Some(action::PLAN_CREATED)).len(), 1);
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn test_approval_unblocks_execution_on_next_tick() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(
            engine_config(&dir),
            vec![fixture_baseline("queue_depth", 100.0, 10.0)],
        );
        let source = source_with(
            "queue_depth",
            &[100.0, 100.0, 340.0, 340.0, 340.0, 340.0],
        );
        let executor = OkExecutor::new();

        let outcomes = run_ticks(&mut engine, &source, &executor, 5);
        let plan_id = outcomes[4].plans_created[0].0.clone();

        let first = engine.approve(&plan_id, "alice", t0() + Duration::minutes(4)).unwrap();
        assert_eq!(
            first,
            ApprovalOutcome::Recorded {
                received: 1,
                required: 2
            }
        );
        let second = engine.approve(&plan_id, "bob", t0() + Duration::minutes(4)).unwrap();
        assert_eq!(second, ApprovalOutcome::Approved);

        let outcome = engine
            .process_tick(&source, &executor, t0() + Duration::minutes(5))
            .unwrap();

        assert_eq!(outcome.plans_executed.len(), 1);
        assert!(outcome.plans_executed[0].success);
        assert_eq!(outcome.plans_executed[0].status, PlanStatus::Succeeded);
        assert!(outcome.plans_created.is_empty());
        assert_eq!(executor.calls(), vec!["execute:queue_depth".to_string()]);
        assert_eq!(engine.state().plans_executed, 1);

        let plan = engine.planner().get_plan(&plan_id).unwrap().unwrap();
        assert_eq!(plan.status, PlanStatus::Succeeded);
    }

    #[test]
    fn test_auto_tier_executes_on_the_same_tick() {
        let dir = TempDir::new().unwrap();
        let mut config = engine_config(&dir);
        // Raise the auto cutoff so the queue playbook's score clears it.
        config.risk.thresholds = RiskThresholds {
            auto: 0.75,
            semi_auto: 0.8,
            manual: 0.9,
        };
        let mut engine = engine_with(config, vec![fixture_baseline("queue_depth", 100.0, 10.0)]);
        let source = source_with("queue_depth", &[100.0, 100.0, 340.0, 340.0, 340.0]);
        let executor = OkExecutor::new();

        let outcomes = run_ticks(&mut engine, &source, &executor, 5);

        assert_eq!(outcomes[4].plans_created.len(), 1);
        assert_eq!(outcomes[4].plans_executed.len(), 1);
        assert!(outcomes[4].plans_executed[0].success);
        assert_eq!(executor.calls().len(), 1);

        let plan = engine
            .planner()
            .get_plan(&outcomes[4].plans_created[0].0)
            .unwrap()
            .unwrap();
        assert_eq!(plan.risk_tier, RiskTier::Auto);
        assert!(!plan.requires_approval);
        assert_eq!(plan.status, PlanStatus::Succeeded);
    }

    #[test]
    fn test_resolution_is_audited() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(
            engine_config(&dir),
            vec![fixture_baseline("queue_depth", 100.0, 10.0)],
        );
        let source = source_with(
            "queue_depth",
            &[100.0, 100.0, 340.0, 340.0, 340.0, 100.0, 100.0],
        );
        let executor = OkExecutor::new();

        let outcomes = run_ticks(&mut engine, &source, &executor, 7);

        assert_eq!(outcomes[5].report.resolved.len(), 1);
        assert_eq!(engine.state().anomalies_resolved, 1);
        assert_eq!(
            engine
                .audit()
                .trail()
                .recent(10, Some(action::ANOMALY_RESOLVED))
                .len(),
            1
        );
        assert!(outcomes[5]
            .events
            .iter()
            .any(|e| e.kind == EngineEventKind::AnomalyResolved));
    }

    #[test]
    fn test_expired_plan_is_rebuilt_as_hold() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(
            engine_config(&dir),
            vec![fixture_baseline("queue_depth", 100.0, 10.0)],
        );
        let mut values = vec![100.0, 100.0];
        values.extend(std::iter::repeat(340.0).take(36));
        let source = source_with("queue_depth", &values);
        let executor = OkExecutor::new();

        let outcomes = run_ticks(&mut engine, &source, &executor, 38);

        // Plan from tick 5 has a 30 minute window; it expires on the
        // sweep after the deadline passes.
        let first_id = outcomes[4].plans_created[0].clone();
        assert!(outcomes[35].plans_created.is_empty());
        assert_eq!(outcomes[35].plans_expired, vec![first_id.clone()]);

        let first = engine.planner().get_plan(&first_id.0).unwrap().unwrap();
        assert_eq!(first.status, PlanStatus::Expired);

        // The still-active anomaly gets a replacement plan on the next
        // tick; half an hour of runtime pushes it into the hold tier.
        assert_eq!(outcomes[36].plans_created.len(), 1);
        let second_id = &outcomes[36].plans_created[0];
        let second = engine.planner().get_plan(&second_id.0).unwrap().unwrap();
        assert_eq!(second.risk_tier, RiskTier::Hold);
        assert_eq!(second.status, PlanStatus::Pending);
        assert!(second.approval_deadline.is_none());

        // Held plans never expire, so no further churn.
        assert!(outcomes[37].plans_created.is_empty());
        assert!(outcomes[37].plans_expired.is_empty());
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn test_disabled_execution_leaves_approved_plans() {
        let dir = TempDir::new().unwrap();
        let mut config = engine_config(&dir);
        config.execution.enabled = false;
        let mut engine = engine_with(config, vec![fixture_baseline("queue_depth", 100.0, 10.0)]);
        let source = source_with(
            "queue_depth",
            &[100.0, 100.0, 340.0, 340.0, 340.0, 340.0],
        );
        let executor = OkExecutor::new();

        let outcomes = run_ticks(&mut engine, &source, &executor, 5);
        let plan_id = outcomes[4].plans_created[0].0.clone();
        engine.approve(&plan_id, "alice", t0() + Duration::minutes(4)).unwrap();
        engine.approve(&plan_id, "bob", t0() + Duration::minutes(4)).unwrap();

        let outcome = engine
            .process_tick(&source, &executor, t0() + Duration::minutes(5))
            .unwrap();

        assert!(outcome.plans_executed.is_empty());
        assert!(executor.calls().is_empty());
        let plan = engine.planner().get_plan(&plan_id).unwrap().unwrap();
        assert_eq!(plan.status, PlanStatus::Approved);
    }

    #[test]
    fn test_restart_restores_durable_state() {
        let dir = TempDir::new().unwrap();
        let state_dir = dir.path().join("state");
        let source = source_with(
            "queue_depth",
            &[100.0, 100.0, 340.0, 340.0, 340.0, 340.0, 340.0],
        );
        let executor = OkExecutor::new();

        let mut engine = engine_with(
            engine_config(&dir),
            vec![fixture_baseline("queue_depth", 100.0, 10.0)],
        );
        let outcomes = run_ticks(&mut engine, &source, &executor, 5);
        let plan_id = outcomes[4].plans_created[0].0.clone();
        engine
            .save_state(&state_dir, t0() + Duration::minutes(4))
            .unwrap();
        drop(engine);

        let mut restarted = Engine::with_context(
            engine_config(&dir),
            AuditContext::new("run-2", "host-test"),
            t0() + Duration::minutes(5),
        )
        .unwrap();
        let report = restarted
            .restore_state(&state_dir, t0() + Duration::minutes(5))
            .unwrap();

        assert_eq!(report.baselines, 1);
        assert_eq!(report.active_anomalies, 1);
        assert_eq!(report.plans, 1);
        // Detection open plus plan creation from the first run.
        assert_eq!(report.audit_records, 2);

        // The reloaded registry extends the anomaly instead of
        // reopening it, and the reloaded waiting plan suppresses a
        // duplicate.
        let outcome = restarted
            .process_tick(&source, &executor, t0() + Duration::minutes(5))
            .unwrap();
        assert!(outcome.report.opened.is_empty());
        assert_eq!(outcome.report.extended.len(), 1);
        assert!(outcome.plans_created.is_empty());

        // Approvals recorded after the restart drive the same plan
        // through to execution.
        restarted
            .approve(&plan_id, "alice", t0() + Duration::minutes(5))
            .unwrap();
        restarted
            .approve(&plan_id, "bob", t0() + Duration::minutes(5))
            .unwrap();
        let outcome = restarted
            .process_tick(&source, &executor, t0() + Duration::minutes(6))
            .unwrap();
        assert_eq!(outcome.plans_executed.len(), 1);
        assert!(outcome.plans_executed[0].success);
        assert_eq!(executor.calls(), vec!["execute:queue_depth".to_string()]);

        // The chain written across both processes verifies end to end:
        // open + creation, two approvals, then the execution records.
        let verified = crate::audit::verify(restarted.audit().path())
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(verified, 7);
    }

    #[test]
    fn test_learn_baselines_audits_each_key() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(engine_config(&dir), Vec::new());

        let start = t0() - Duration::days(8);
        let mut series = crate::source::MetricSeries::new(MetricKey::bare("api_latency_p99"));
        for i in 0..(8 * 24 * 60) {
            series.push(start + Duration::minutes(i), 120.0);
        }
        let mut source = crate::source::StaticSource::new();
        source.insert(series);

        let report = engine.learn_baselines(&source, start, t0(), t0());

        assert_eq!(report.learned, vec!["api_latency_p99".to_string()]);
        assert_eq!(
            engine
                .audit()
                .trail()
                .recent(5, Some(action::BASELINE_LEARNED))
                .len(),
            1
        );
        assert_eq!(engine.baselines().len(), 1);
    }

    #[test]
    fn test_event_ring_is_bounded() {
        let mut state = EngineState::new(t0());
        for i in 0..150 {
            state.push_event(EngineEvent {
                at: t0(),
                kind: EngineEventKind::TickCompleted,
                detail: format!("tick {}", i),
            });
        }
        assert_eq!(state.recent_events.len(), 100);
        assert_eq!(state.recent_events.front().unwrap().detail, "tick 50");
    }
}
