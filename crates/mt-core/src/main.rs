//! Metric Triage Core - Detection and Remediation Engine
//!
//! The main entry point for mt-core, handling:
//! - Baseline learning over metric history
//! - Statistical anomaly detection ticks
//! - Risk-scored remediation planning and approval
//! - Guardrailed execution with rollback
//! - Tamper-evident audit trail queries

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use chrono::{DateTime, Utc};
use mt_common::{Error, MetricKey, OutputFormat, SCHEMA_VERSION};
use mt_config::{resolve_config, EngineConfig, ResolvedConfig};
use mt_core::audit::{self, AuditLogger, AUDIT_LOG_FILENAME};
use mt_core::baseline::store::BaselineStore;
use mt_core::daemon::{
    resolve_state_dir, Engine, TickOutcome, ANOMALY_STATE_FILENAME, BASELINE_SNAPSHOT_FILENAME,
    PLAN_SNAPSHOT_FILENAME,
};
use mt_core::exit_codes::ExitCode;
use mt_core::logging::{
    generate_run_id, init_logging, LogConfig, LogFormat, LogLevel,
};
use mt_core::plan::execute::DryRunExecutor;
use mt_core::plan::PlanStatus;
use mt_core::source::SyntheticSource;

/// Metric Triage Core - Statistical anomaly triage and remediation
#[derive(Parser)]
#[command(name = "mt-core")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Path to a configuration file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// State directory for baseline/anomaly/plan snapshots
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "json")]
    format: OutputFormat,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode; machine-readable logs on stderr
    #[arg(long, global = true)]
    robot: bool,

    /// Never touch the world; every step reports success unexecuted
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the detection and remediation loop
    Run(RunArgs),

    /// One detection pass: fetch, score, plan, execute, snapshot
    Tick(TickArgs),

    /// Baseline management
    Baseline(BaselineArgs),

    /// Plan ledger queries and approvals
    Plans(PlansArgs),

    /// Audit trail queries and chain verification
    Audit(AuditArgs),

    /// Validate configuration and environment
    Check,

    /// Print version information
    Version,
}

// ============================================================================
// Command argument structs
// ============================================================================

/// Shape of the built-in demo metric feed.
///
/// Real deployments implement `MetricSource` against their metrics
/// backend; the synthetic feed keeps the engine demonstrable without one.
#[derive(Args, Debug)]
struct DemoSourceArgs {
    /// Demo metric name (must match a learned baseline)
    #[arg(long, default_value = "api_latency_p99")]
    metric: String,

    /// Demo feed base value
    #[arg(long, default_value_t = 120.0)]
    base: f64,

    /// Demo feed daily swing
    #[arg(long, default_value_t = 30.0)]
    amplitude: f64,

    /// Demo feed jitter
    #[arg(long, default_value_t = 5.0)]
    noise: f64,

    /// Multiply the metric by this factor from now on, to provoke a detection
    #[arg(long)]
    spike: Option<f64>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Stop after this many ticks (runs until killed otherwise)
    #[arg(long)]
    ticks: Option<u64>,

    /// Seconds between ticks (overrides the configured interval)
    #[arg(long)]
    interval_seconds: Option<u64>,

    #[command(flatten)]
    source: DemoSourceArgs,
}

#[derive(Args, Debug)]
struct TickArgs {
    #[command(flatten)]
    source: DemoSourceArgs,
}

#[derive(Args, Debug)]
struct BaselineArgs {
    #[command(subcommand)]
    command: BaselineCommands,
}

#[derive(Subcommand, Debug)]
enum BaselineCommands {
    /// Learn baselines from the demo feed's history
    Learn {
        /// Days of history to learn from
        #[arg(long, default_value_t = 30)]
        days: i64,

        #[command(flatten)]
        source: DemoSourceArgs,
    },
    /// List learned baselines from the state snapshot
    Show {
        /// Only this canonical metric key
        #[arg(long)]
        key: Option<String>,
    },
}

#[derive(Args, Debug)]
struct PlansArgs {
    #[command(subcommand)]
    command: PlansCommands,
}

#[derive(Subcommand, Debug)]
enum PlansCommands {
    /// List plans from the ledger
    List {
        /// Only plans in this status (e.g. waiting_approval, failed)
        #[arg(long)]
        status: Option<String>,

        /// Newest N plans
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Record one approval on a waiting plan
    Approve {
        plan_id: String,

        /// Approver identity
        #[arg(long)]
        by: String,
    },
    /// Reject a plan before it executes
    Reject {
        plan_id: String,

        /// Rejector identity
        #[arg(long)]
        by: String,

        /// Reason recorded on the plan and in the audit trail
        #[arg(long, default_value = "rejected via cli")]
        reason: String,
    },
}

#[derive(Args, Debug)]
struct AuditArgs {
    #[command(subcommand)]
    command: AuditCommands,
}

#[derive(Subcommand, Debug)]
enum AuditCommands {
    /// Re-walk an audit file checking entry hashes and chain linkage
    Verify {
        /// Audit file (defaults to the live log)
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Show recent audit records, newest first
    Tail {
        /// Number of records
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,

        /// Only records with this action type
        #[arg(long)]
        action: Option<String>,

        /// Only failed or rolled-back records
        #[arg(long)]
        failures: bool,
    },
}

// ============================================================================
// Entry point
// ============================================================================

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.global.quiet {
        LogLevel::Error
    } else {
        match cli.global.verbose {
            0 => LogLevel::Info,
            1 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    };

    // stdout carries command payloads; logs go to stderr. Machine
    // formats (and robot mode) get JSONL logs so agents can parse both
    // streams.
    let log_format = if cli.global.robot || cli.global.format.is_machine() {
        LogFormat::Jsonl
    } else {
        LogFormat::Human
    };
    init_logging(&LogConfig::from_env(Some(log_level), Some(log_format)));

    let exit_code = match &cli.command {
        None => run_check(&cli.global),
        Some(Commands::Run(args)) => run_loop(&cli.global, args),
        Some(Commands::Tick(args)) => run_tick(&cli.global, args),
        Some(Commands::Baseline(args)) => run_baseline(&cli.global, args),
        Some(Commands::Plans(args)) => run_plans(&cli.global, args),
        Some(Commands::Audit(args)) => run_audit(&cli.global, args),
        Some(Commands::Check) => run_check(&cli.global),
        Some(Commands::Version) => {
            print_version(&cli.global);
            ExitCode::Clean
        }
    };

    std::process::exit(exit_code.as_i32());
}

// ============================================================================
// Shared plumbing
// ============================================================================

/// Map an engine error onto the exit-code contract.
fn exit_for(err: &Error) -> ExitCode {
    match err.code() {
        10..=19 => ExitCode::ConfigError,
        20..=29 => ExitCode::BaselineError,
        31 | 41 => ExitCode::NotFoundError,
        51 | 52 => ExitCode::PolicyBlocked,
        50 | 53 => ExitCode::PartialFail,
        62 => ExitCode::IntegrityFail,
        70..=79 => ExitCode::IoError,
        _ => ExitCode::InternalError,
    }
}

fn load_config(global: &GlobalOpts) -> Result<ResolvedConfig, ExitCode> {
    match resolve_config(global.config.as_deref()) {
        Ok(mut resolved) => {
            if global.dry_run {
                resolved.config.execution.dry_run = true;
            }
            Ok(resolved)
        }
        Err(err) => {
            eprintln!("configuration error: {}", err);
            Err(ExitCode::ConfigError)
        }
    }
}

fn state_dir(global: &GlobalOpts) -> Result<PathBuf, ExitCode> {
    if let Some(dir) = &global.state_dir {
        return Ok(dir.clone());
    }
    resolve_state_dir().map_err(|err| {
        eprintln!("cannot resolve state directory: {}", err);
        ExitCode::IoError
    })
}

/// Build an engine and reload whatever state the directory holds.
fn build_engine(
    config: EngineConfig,
    state: &Path,
    now: DateTime<Utc>,
) -> Result<Engine, ExitCode> {
    let mut engine = Engine::new(config, now).map_err(|err| {
        eprintln!("engine startup failed: {}", err);
        exit_for(&err)
    })?;
    engine.restore_state(state, now).map_err(|err| {
        eprintln!("state reload failed: {}", err);
        exit_for(&err)
    })?;
    Ok(engine)
}

fn demo_source(args: &DemoSourceArgs, now: DateTime<Utc>) -> SyntheticSource {
    let source = SyntheticSource::new(
        MetricKey::bare(&args.metric),
        args.base,
        args.amplitude,
        args.noise,
    );
    match args.spike {
        Some(factor) => source.with_spike(now, now + chrono::Duration::hours(1), factor),
        None => source,
    }
}

fn audit_log_path(config: &EngineConfig) -> Result<PathBuf, ExitCode> {
    match &config.audit.dir {
        Some(dir) => Ok(dir.join(AUDIT_LOG_FILENAME)),
        None => audit::resolve_audit_dir()
            .map(|dir| dir.join(AUDIT_LOG_FILENAME))
            .map_err(|err| {
                eprintln!("cannot resolve audit directory: {}", err);
                ExitCode::IoError
            }),
    }
}

fn parse_status(s: &str) -> Option<PlanStatus> {
    match s {
        "pending" => Some(PlanStatus::Pending),
        "waiting_approval" | "waiting" => Some(PlanStatus::WaitingApproval),
        "approved" => Some(PlanStatus::Approved),
        "executing" => Some(PlanStatus::Executing),
        "succeeded" => Some(PlanStatus::Succeeded),
        "failed" => Some(PlanStatus::Failed),
        "rejected" => Some(PlanStatus::Rejected),
        "expired" => Some(PlanStatus::Expired),
        _ => None,
    }
}

/// Exit code summarizing what a tick did.
fn tick_exit_code(engine: &Engine, outcome: &TickOutcome) -> ExitCode {
    if outcome.plans_executed.iter().any(|p| !p.success) {
        return ExitCode::PartialFail;
    }
    if !outcome.plans_executed.is_empty() {
        return ExitCode::ActionsOk;
    }
    let waiting = engine
        .planner()
        .get_pending_approvals()
        .map(|v| v.len())
        .unwrap_or(0);
    if waiting > 0 {
        return ExitCode::PlanReady;
    }
    ExitCode::Clean
}

// ============================================================================
// run / tick
// ============================================================================

fn run_loop(global: &GlobalOpts, args: &RunArgs) -> ExitCode {
    let resolved = match load_config(global) {
        Ok(r) => r,
        Err(code) => return code,
    };
    let state = match state_dir(global) {
        Ok(d) => d,
        Err(code) => return code,
    };

    let started = Utc::now();
    let mut engine = match build_engine(resolved.config.clone(), &state, started) {
        Ok(e) => e,
        Err(code) => return code,
    };

    if engine.baselines().len() == 0 {
        warn!("no baselines loaded; every metric is skipped until `mt-core baseline learn` runs");
    }

    let source = demo_source(&args.source, started);
    let executor = DryRunExecutor;
    let interval = std::time::Duration::from_secs(
        args.interval_seconds
            .unwrap_or(resolved.config.detection.check_interval_seconds),
    );

    info!(
        run_id = %engine.context().run_id,
        interval_seconds = interval.as_secs(),
        ticks = ?args.ticks,
        metric = %args.source.metric,
        "engine loop starting"
    );

    let mut completed: u64 = 0;
    let mut any_failed = false;
    loop {
        let tick_at = Utc::now();
        match engine.process_tick(&source, &executor, tick_at) {
            Ok(outcome) => {
                any_failed |= outcome.plans_executed.iter().any(|p| !p.success);
                emit_tick(global, engine.context().run_id.as_str(), &outcome, false);
            }
            // A failed fetch skips the tick, never the loop.
            Err(err) => error!(error = %err, "tick failed"),
        }
        if let Err(err) = engine.save_state(&state, tick_at) {
            error!(error = %err, "state snapshot failed");
        }

        completed += 1;
        if let Some(limit) = args.ticks {
            if completed >= limit {
                break;
            }
        }
        std::thread::sleep(interval);
    }

    let waiting = engine
        .planner()
        .get_pending_approvals()
        .map(|v| v.len())
        .unwrap_or(0);
    let code = if any_failed {
        ExitCode::PartialFail
    } else if waiting > 0 {
        ExitCode::PlanReady
    } else if engine.state().plans_executed > 0 {
        ExitCode::ActionsOk
    } else {
        ExitCode::Clean
    };
    info!(
        ticks = completed,
        anomalies_opened = engine.state().anomalies_opened,
        plans_created = engine.state().plans_created,
        plans_executed = engine.state().plans_executed,
        waiting_approval = waiting,
        outcome = %code,
        "engine loop finished"
    );
    code
}

fn run_tick(global: &GlobalOpts, args: &TickArgs) -> ExitCode {
    let resolved = match load_config(global) {
        Ok(r) => r,
        Err(code) => return code,
    };
    let state = match state_dir(global) {
        Ok(d) => d,
        Err(code) => return code,
    };

    let now = Utc::now();
    let mut engine = match build_engine(resolved.config, &state, now) {
        Ok(e) => e,
        Err(code) => return code,
    };
    let source = demo_source(&args.source, now);
    let executor = DryRunExecutor;

    let outcome = match engine.process_tick(&source, &executor, now) {
        Ok(outcome) => outcome,
        Err(err) => {
            eprintln!("tick failed: {}", err);
            return exit_for(&err);
        }
    };
    if let Err(err) = engine.save_state(&state, now) {
        eprintln!("state snapshot failed: {}", err);
        return ExitCode::IoError;
    }

    emit_tick(global, engine.context().run_id.as_str(), &outcome, true);
    tick_exit_code(&engine, &outcome)
}

/// Print one tick outcome; `detailed` selects the pretty single-shot
/// rendering over the one-line loop rendering.
fn emit_tick(global: &GlobalOpts, run_id: &str, outcome: &TickOutcome, detailed: bool) {
    let response = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "run_id": run_id,
        "generated_at": Utc::now().to_rfc3339(),
        "tick_outcome": outcome,
    });

    match global.format {
        OutputFormat::Json => {
            if detailed {
                println!("{}", serde_json::to_string_pretty(&response).unwrap());
            } else {
                println!("{}", response);
            }
        }
        OutputFormat::Jsonl => println!("{}", response),
        OutputFormat::Summary => {
            println!(
                "[{}] tick {}: {} evaluated, {} opened, {} resolved, {} plans, {} executed",
                run_id,
                outcome.tick,
                outcome.report.evaluated,
                outcome.report.opened.len(),
                outcome.report.resolved.len(),
                outcome.plans_created.len(),
                outcome.plans_executed.len(),
            );
        }
        OutputFormat::Md => {
            if detailed {
                println!("# mt-core tick {}", outcome.tick);
                println!();
                println!(
                    "- evaluated: {} (skipped {})",
                    outcome.report.evaluated, outcome.report.skipped
                );
                println!(
                    "- anomalies: {} opened, {} extended, {} resolved, {} surfaced",
                    outcome.report.opened.len(),
                    outcome.report.extended.len(),
                    outcome.report.resolved.len(),
                    outcome.report.surfaced.len(),
                );
                println!(
                    "- plans: {} created, {} executed, {} expired",
                    outcome.plans_created.len(),
                    outcome.plans_executed.len(),
                    outcome.plans_expired.len(),
                );
                for event in &outcome.events {
                    println!("  - {}", event.detail);
                }
                println!();
                println!("Run: {}", run_id);
            } else {
                let mut line = format!(
                    "tick {}: {} evaluated, {} plans",
                    outcome.tick,
                    outcome.report.evaluated,
                    outcome.plans_created.len()
                );
                for event in &outcome.events {
                    line.push_str("; ");
                    line.push_str(&event.detail);
                }
                println!("{}", line);
            }
        }
    }
}

// ============================================================================
// baseline
// ============================================================================

fn run_baseline(global: &GlobalOpts, args: &BaselineArgs) -> ExitCode {
    match &args.command {
        BaselineCommands::Learn { days, source } => run_baseline_learn(global, *days, source),
        BaselineCommands::Show { key } => run_baseline_show(global, key.as_deref()),
    }
}

fn run_baseline_learn(global: &GlobalOpts, days: i64, source_args: &DemoSourceArgs) -> ExitCode {
    let resolved = match load_config(global) {
        Ok(r) => r,
        Err(code) => return code,
    };
    let state = match state_dir(global) {
        Ok(d) => d,
        Err(code) => return code,
    };

    let now = Utc::now();
    let mut engine = match build_engine(resolved.config, &state, now) {
        Ok(e) => e,
        Err(code) => return code,
    };
    let source = demo_source(source_args, now);

    let report = engine.learn_baselines(&source, now - chrono::Duration::days(days), now, now);
    if let Err(err) = engine.save_state(&state, now) {
        eprintln!("state snapshot failed: {}", err);
        return ExitCode::IoError;
    }

    let run_id = engine.context().run_id.clone();
    let response = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "run_id": run_id,
        "generated_at": now.to_rfc3339(),
        "days": days,
        "learned": report.learned,
        "skipped": report
            .skipped
            .iter()
            .map(|(key, reason)| serde_json::json!({"key": key, "reason": reason}))
            .collect::<Vec<_>>(),
    });

    match global.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response).unwrap()),
        OutputFormat::Jsonl => println!("{}", response),
        OutputFormat::Summary => {
            println!(
                "[{}] baseline learn: {} learned, {} skipped",
                run_id,
                report.learned.len(),
                report.skipped.len()
            );
        }
        OutputFormat::Md => {
            println!("# mt-core baseline learn");
            println!();
            for key in &report.learned {
                println!("learned {}", key);
            }
            for (key, reason) in &report.skipped {
                println!("skipped {}: {}", key, reason);
            }
            println!();
            println!("Run: {}", run_id);
        }
    }

    if report.learned.is_empty() && !report.skipped.is_empty() {
        ExitCode::BaselineError
    } else {
        ExitCode::Clean
    }
}

fn run_baseline_show(global: &GlobalOpts, key_filter: Option<&str>) -> ExitCode {
    let resolved = match load_config(global) {
        Ok(r) => r,
        Err(code) => return code,
    };
    let state = match state_dir(global) {
        Ok(d) => d,
        Err(code) => return code,
    };

    let now = Utc::now();
    let run_id = generate_run_id();
    let store = BaselineStore::new(resolved.config.baseline.clone());

    let path = state.join(BASELINE_SNAPSHOT_FILENAME);
    if path.exists() {
        if let Err(err) = store.load_from_file(&path) {
            eprintln!("baseline snapshot load failed: {}", err);
            return exit_for(&err);
        }
    }

    let snapshot = match store.snapshot(now) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("baseline store read failed: {}", err);
            return exit_for(&err);
        }
    };
    let stale = store.stale_keys(now).unwrap_or_default();

    let mut keys: Vec<&String> = snapshot.baselines.keys().collect();
    keys.sort();
    if let Some(filter) = key_filter {
        if !snapshot.baselines.contains_key(filter) {
            eprintln!("no baseline for key: {}", filter);
            return ExitCode::NotFoundError;
        }
        keys.retain(|k| k.as_str() == filter);
    }

    let rows: Vec<serde_json::Value> = keys
        .iter()
        .map(|k| {
            let b = &snapshot.baselines[k.as_str()];
            serde_json::json!({
                "key": k,
                "mean": b.global_stats.mean,
                "std_dev": b.global_stats.std_dev,
                "samples": b.sample_count,
                "hourly_buckets": b.hourly.len(),
                "quality_score": b.quality_score,
                "coverage_days": b.coverage_days,
                "updated_at": b.updated_at.to_rfc3339(),
                "stale": stale.contains(*k),
            })
        })
        .collect();

    let response = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "run_id": run_id,
        "generated_at": now.to_rfc3339(),
        "count": rows.len(),
        "baselines": rows,
    });

    match global.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response).unwrap()),
        OutputFormat::Jsonl => println!("{}", response),
        OutputFormat::Summary => {
            println!(
                "[{}] baseline show: {} baselines, {} stale",
                run_id,
                snapshot.baselines.len(),
                stale.len()
            );
        }
        OutputFormat::Md => {
            println!("# mt-core baselines");
            println!();
            if keys.is_empty() {
                println!("none learned yet");
            }
            for k in &keys {
                let b = &snapshot.baselines[k.as_str()];
                println!(
                    "{}  mean {:.2}  std {:.2}  quality {:.2}  {} days{}",
                    k,
                    b.global_stats.mean,
                    b.global_stats.std_dev,
                    b.quality_score,
                    b.coverage_days,
                    if stale.contains(*k) { "  STALE" } else { "" },
                );
            }
            println!();
            println!("Run: {}", run_id);
        }
    }

    ExitCode::Clean
}

// ============================================================================
// plans
// ============================================================================

fn run_plans(global: &GlobalOpts, args: &PlansArgs) -> ExitCode {
    match &args.command {
        PlansCommands::List { status, limit } => run_plans_list(global, status.as_deref(), *limit),
        PlansCommands::Approve { plan_id, by } => run_plans_approve(global, plan_id, by),
        PlansCommands::Reject {
            plan_id,
            by,
            reason,
        } => run_plans_reject(global, plan_id, by, reason),
    }
}

fn plan_row(plan: &mt_core::plan::ActionPlan) -> serde_json::Value {
    serde_json::json!({
        "id": plan.id,
        "status": plan.status,
        "risk_tier": plan.risk_tier,
        "risk_score": plan.risk_score,
        "metric": plan.metric_key.canonical(),
        "steps": plan.steps.len(),
        "approvals": format!("{}/{}", plan.approvals_received.len(), plan.approvals_required),
        "approval_deadline": plan.approval_deadline.map(|t| t.to_rfc3339()),
        "created_at": plan.created_at.to_rfc3339(),
        "reason": plan.reason,
    })
}

fn run_plans_list(global: &GlobalOpts, status: Option<&str>, limit: usize) -> ExitCode {
    let resolved = match load_config(global) {
        Ok(r) => r,
        Err(code) => return code,
    };
    let state = match state_dir(global) {
        Ok(d) => d,
        Err(code) => return code,
    };

    let now = Utc::now();
    let engine = match build_engine(resolved.config, &state, now) {
        Ok(e) => e,
        Err(code) => return code,
    };

    let plans = match status {
        Some(s) => match parse_status(s) {
            Some(wanted) => match engine.planner().history().by_status(wanted) {
                Ok(mut plans) => {
                    plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                    plans.truncate(limit);
                    plans
                }
                Err(err) => {
                    eprintln!("plan ledger read failed: {}", err);
                    return exit_for(&err);
                }
            },
            None => {
                eprintln!("unknown plan status: {}", s);
                return ExitCode::ArgsError;
            }
        },
        None => match engine.planner().history().recent(limit) {
            Ok(plans) => plans,
            Err(err) => {
                eprintln!("plan ledger read failed: {}", err);
                return exit_for(&err);
            }
        },
    };

    let run_id = engine.context().run_id.clone();
    let response = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "run_id": run_id,
        "generated_at": now.to_rfc3339(),
        "count": plans.len(),
        "plans": plans.iter().map(plan_row).collect::<Vec<_>>(),
    });

    match global.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response).unwrap()),
        OutputFormat::Jsonl => {
            for plan in &plans {
                println!("{}", plan_row(plan));
            }
        }
        OutputFormat::Summary => {
            println!("[{}] plans list: {} plans", run_id, plans.len());
        }
        OutputFormat::Md => {
            println!("# mt-core plans");
            println!();
            if plans.is_empty() {
                println!("ledger is empty");
            }
            for plan in &plans {
                println!(
                    "{}  {}  {}  score {:.2}  approvals {}/{}  {}",
                    plan.id,
                    plan.status,
                    plan.risk_tier,
                    plan.risk_score,
                    plan.approvals_received.len(),
                    plan.approvals_required,
                    plan.metric_key.canonical(),
                );
            }
            println!();
            println!("Run: {}", run_id);
        }
    }

    ExitCode::Clean
}

fn run_plans_approve(global: &GlobalOpts, plan_id: &str, by: &str) -> ExitCode {
    let resolved = match load_config(global) {
        Ok(r) => r,
        Err(code) => return code,
    };
    let state = match state_dir(global) {
        Ok(d) => d,
        Err(code) => return code,
    };

    let now = Utc::now();
    let mut engine = match build_engine(resolved.config, &state, now) {
        Ok(e) => e,
        Err(code) => return code,
    };

    let outcome = match engine.approve(plan_id, by, now) {
        Ok(outcome) => outcome,
        Err(err) => {
            eprintln!("approval failed: {}", err);
            return exit_for(&err);
        }
    };
    if let Err(err) = engine.save_state(&state, now) {
        eprintln!("state snapshot failed: {}", err);
        return ExitCode::IoError;
    }

    let run_id = engine.context().run_id.clone();
    let response = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "run_id": run_id,
        "generated_at": now.to_rfc3339(),
        "plan_id": plan_id,
        "approver": by,
        "outcome": outcome,
        "note": "approved plans execute on the engine's next tick",
    });

    match global.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response).unwrap()),
        OutputFormat::Jsonl => println!("{}", response),
        OutputFormat::Summary | OutputFormat::Md => {
            println!("[{}] approve {}: {}", run_id, plan_id, outcome);
        }
    }

    match outcome {
        mt_core::plan::planner::ApprovalOutcome::NotFound => ExitCode::NotFoundError,
        _ => ExitCode::Clean,
    }
}

fn run_plans_reject(global: &GlobalOpts, plan_id: &str, by: &str, reason: &str) -> ExitCode {
    let resolved = match load_config(global) {
        Ok(r) => r,
        Err(code) => return code,
    };
    let state = match state_dir(global) {
        Ok(d) => d,
        Err(code) => return code,
    };

    let now = Utc::now();
    let mut engine = match build_engine(resolved.config, &state, now) {
        Ok(e) => e,
        Err(code) => return code,
    };

    let outcome = match engine.reject(plan_id, by, reason, now) {
        Ok(outcome) => outcome,
        Err(err) => {
            eprintln!("rejection failed: {}", err);
            return exit_for(&err);
        }
    };
    if let Err(err) = engine.save_state(&state, now) {
        eprintln!("state snapshot failed: {}", err);
        return ExitCode::IoError;
    }

    let run_id = engine.context().run_id.clone();
    let response = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "run_id": run_id,
        "generated_at": now.to_rfc3339(),
        "plan_id": plan_id,
        "rejector": by,
        "reason": reason,
        "outcome": outcome,
    });

    match global.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response).unwrap()),
        OutputFormat::Jsonl => println!("{}", response),
        OutputFormat::Summary | OutputFormat::Md => {
            println!("[{}] reject {}: {}", run_id, plan_id, outcome);
        }
    }

    match outcome {
        mt_core::plan::planner::RejectOutcome::NotFound => ExitCode::NotFoundError,
        _ => ExitCode::Clean,
    }
}

// ============================================================================
// audit
// ============================================================================

fn run_audit(global: &GlobalOpts, args: &AuditArgs) -> ExitCode {
    match &args.command {
        AuditCommands::Verify { file } => run_audit_verify(global, file.as_deref()),
        AuditCommands::Tail {
            count,
            action,
            failures,
        } => run_audit_tail(global, *count, action.as_deref(), *failures),
    }
}

fn run_audit_verify(global: &GlobalOpts, file: Option<&Path>) -> ExitCode {
    let resolved = match load_config(global) {
        Ok(r) => r,
        Err(code) => return code,
    };

    let path = match file {
        Some(f) => f.to_path_buf(),
        None => match audit_log_path(&resolved.config) {
            Ok(p) => p,
            Err(code) => return code,
        },
    };
    if !path.exists() {
        eprintln!("no audit log at {}", path.display());
        return ExitCode::NotFoundError;
    }

    let report = match audit::verify(&path) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("audit verification failed: {}", err);
            return exit_for(&err);
        }
    };

    let run_id = generate_run_id();
    let response = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "run_id": run_id,
        "generated_at": Utc::now().to_rfc3339(),
        "file": path.display().to_string(),
        "report": report,
    });

    match global.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response).unwrap()),
        OutputFormat::Jsonl => println!("{}", response),
        OutputFormat::Summary => {
            println!(
                "[{}] audit verify: {} ({} records)",
                run_id,
                if report.is_valid { "OK" } else { "BROKEN" },
                report.records_checked,
            );
        }
        OutputFormat::Md => {
            println!("# mt-core audit verify");
            println!();
            println!("file: {}", path.display());
            println!("records checked: {}", report.records_checked);
            match &report.first_break {
                None => println!("chain: intact"),
                Some(b) => println!("chain: BROKEN at line {}", b.line),
            }
            println!();
            println!("Run: {}", run_id);
        }
    }

    if report.is_valid {
        ExitCode::Clean
    } else {
        ExitCode::IntegrityFail
    }
}

fn run_audit_tail(
    global: &GlobalOpts,
    count: usize,
    action: Option<&str>,
    failures: bool,
) -> ExitCode {
    let resolved = match load_config(global) {
        Ok(r) => r,
        Err(code) => return code,
    };

    let now = Utc::now();
    let mut logger = match AuditLogger::open(resolved.config.audit.clone()) {
        Ok(logger) => logger,
        Err(err) => {
            eprintln!("audit log open failed: {}", err);
            return exit_for(&err);
        }
    };
    let loaded = match logger.load_from_file(resolved.config.audit.retention_days, now) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("audit log read failed: {}", err);
            return exit_for(&err);
        }
    };

    let records = if failures {
        logger.trail().failures(count)
    } else {
        logger.trail().recent(count, action)
    };

    let run_id = generate_run_id();
    let response = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "run_id": run_id,
        "generated_at": now.to_rfc3339(),
        "loaded": loaded,
        "count": records.len(),
        "records": records,
    });

    match global.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response).unwrap()),
        OutputFormat::Jsonl => {
            for record in &records {
                println!("{}", serde_json::json!(record));
            }
        }
        OutputFormat::Summary => {
            println!(
                "[{}] audit tail: {} of {} records",
                run_id,
                records.len(),
                loaded
            );
        }
        OutputFormat::Md => {
            println!("# mt-core audit tail");
            println!();
            if records.is_empty() {
                println!("no matching records");
            }
            for record in &records {
                println!(
                    "{}  {}  {}  {}",
                    record.ts.to_rfc3339(),
                    record.action_type,
                    record.target,
                    record.status,
                );
            }
            println!();
            println!("Run: {}", run_id);
        }
    }

    ExitCode::Clean
}

// ============================================================================
// check / version
// ============================================================================

fn run_check(global: &GlobalOpts) -> ExitCode {
    let run_id = generate_run_id();
    let mut all_ok = true;
    let mut results = Vec::new();

    // Config resolution and validation
    let config = match resolve_config(global.config.as_deref()) {
        Ok(resolved) => {
            results.push(serde_json::json!({
                "check": "config",
                "status": "ok",
                "source": resolved.source.to_string(),
                "path": resolved.path.as_ref().map(|p| p.display().to_string()),
            }));
            Some(resolved.config)
        }
        Err(err) => {
            all_ok = false;
            results.push(serde_json::json!({
                "check": "config",
                "status": "error",
                "error": err.to_string(),
            }));
            None
        }
    };

    // State directory and snapshots
    match global
        .state_dir
        .clone()
        .map(Ok)
        .unwrap_or_else(resolve_state_dir)
    {
        Ok(dir) => {
            let snapshots: Vec<&str> = [
                BASELINE_SNAPSHOT_FILENAME,
                ANOMALY_STATE_FILENAME,
                PLAN_SNAPSHOT_FILENAME,
            ]
            .into_iter()
            .filter(|f| dir.join(f).exists())
            .collect();
            results.push(serde_json::json!({
                "check": "state_dir",
                "status": "ok",
                "path": dir.display().to_string(),
                "snapshots": snapshots,
            }));
        }
        Err(err) => {
            all_ok = false;
            results.push(serde_json::json!({
                "check": "state_dir",
                "status": "error",
                "error": err.to_string(),
            }));
        }
    }

    // Audit log presence (verification is `mt-core audit verify`)
    if let Some(config) = &config {
        match audit_log_path(config) {
            Ok(path) => {
                let size = std::fs::metadata(&path).map(|m| m.len()).ok();
                results.push(serde_json::json!({
                    "check": "audit_log",
                    "status": "ok",
                    "path": path.display().to_string(),
                    "exists": path.exists(),
                    "bytes": size,
                }));
            }
            Err(_) => {
                all_ok = false;
                results.push(serde_json::json!({
                    "check": "audit_log",
                    "status": "error",
                    "error": "audit directory is not resolvable",
                }));
            }
        }
    }

    let response = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "run_id": run_id,
        "generated_at": Utc::now().to_rfc3339(),
        "status": if all_ok { "ok" } else { "error" },
        "checks": results,
    });

    match global.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response).unwrap()),
        OutputFormat::Jsonl => println!("{}", response),
        OutputFormat::Summary => {
            println!(
                "[{}] check: {}",
                run_id,
                if all_ok { "OK" } else { "FAILED" }
            );
        }
        OutputFormat::Md => {
            println!("# mt-core check");
            println!();
            for result in &results {
                let check = result.get("check").and_then(|v| v.as_str()).unwrap_or("?");
                let status = result.get("status").and_then(|v| v.as_str()).unwrap_or("?");
                let symbol = if status == "ok" { "ok " } else { "ERR" };
                println!("{} {}", symbol, check);
                if let Some(path) = result.get("path").and_then(|v| v.as_str()) {
                    println!("    {}", path);
                }
                if let Some(error) = result.get("error").and_then(|v| v.as_str()) {
                    println!("    {}", error);
                }
            }
            println!();
            println!("Run: {}", run_id);
        }
    }

    if all_ok {
        ExitCode::Clean
    } else {
        ExitCode::ConfigError
    }
}

fn print_version(global: &GlobalOpts) {
    let version_info = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "mt_core_version": env!("CARGO_PKG_VERSION"),
        "rust_version": env!("CARGO_PKG_RUST_VERSION"),
    });

    match global.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&version_info).unwrap());
        }
        OutputFormat::Jsonl => println!("{}", version_info),
        _ => {
            println!("mt-core {}", env!("CARGO_PKG_VERSION"));
            println!("schema version: {}", SCHEMA_VERSION);
        }
    }
}
