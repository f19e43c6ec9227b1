//! Risk assessment for remediation plans.
//!
//! A pure function of the anomaly and the plan shape: four factors
//! (severity, urgency, impact, complexity) are blended with the
//! configured weights into a [0,1] score, then mapped against the
//! ascending tier thresholds. The factor breakdown and reasoning lines
//! ride along for the audit record.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use mt_common::MetricCategory;
use mt_config::{ApprovalConfig, RiskConfig};

use crate::detect::{Anomaly, Severity};
use crate::plan::ActionStep;

/// Approvals demanded by a Hold plan; high enough to never be met.
pub const HOLD_APPROVALS: u32 = 999;

/// Automation tier, decided by the risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// Executes without approval.
    Auto,
    /// One approval by default.
    SemiAuto,
    /// Two approvals by default.
    Manual,
    /// Never auto-executed; approvals saturated.
    Hold,
}

impl RiskTier {
    pub fn required_approvals(&self, config: &ApprovalConfig) -> u32 {
        match self {
            RiskTier::Auto => 0,
            RiskTier::SemiAuto => config.required_approvers_semi_auto,
            RiskTier::Manual => config.required_approvers_manual,
            RiskTier::Hold => HOLD_APPROVALS,
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskTier::Auto => "auto",
            RiskTier::SemiAuto => "semi_auto",
            RiskTier::Manual => "manual",
            RiskTier::Hold => "hold",
        };
        write!(f, "{}", s)
    }
}

/// Factor breakdown behind a score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFactors {
    pub severity: f64,
    pub urgency: f64,
    pub impact: f64,
    pub complexity: f64,
}

/// Scored plan risk with its audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub tier: RiskTier,
    pub factors: RiskFactors,
    pub reasoning: Vec<String>,
}

// ---------------------------------------------------------------------------
// Factors
// ---------------------------------------------------------------------------

fn severity_factor(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 0.25,
        Severity::Medium => 0.5,
        Severity::High => 0.75,
        Severity::Critical => 1.0,
    }
}

/// Duration buckets plus a small bump while the deviation still grows.
fn urgency_factor(duration_minutes: i64, worsening: bool) -> f64 {
    let base: f64 = if duration_minutes < 2 {
        0.3
    } else if duration_minutes < 5 {
        0.5
    } else if duration_minutes < 15 {
        0.7
    } else if duration_minutes < 30 {
        0.85
    } else {
        0.95
    };
    if worsening {
        (base + 0.05).min(1.0)
    } else {
        base
    }
}

fn namespace_weight(namespace: &str) -> f64 {
    match namespace {
        "production" | "prod" => 1.0,
        "staging" => 0.6,
        "development" | "dev" => 0.3,
        _ => 0.7,
    }
}

/// Widest namespace the plan touches, by weight.
fn widest_namespace(steps: &[ActionStep]) -> (String, f64) {
    steps
        .iter()
        .map(|s| (s.namespace.clone(), namespace_weight(&s.namespace)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap_or_else(|| ("default".to_string(), namespace_weight("default")))
}

/// Largest blast radius among the plan's actions, widened a notch per
/// extra distinct target.
fn action_scope(steps: &[ActionStep]) -> f64 {
    let max_blast = steps
        .iter()
        .map(|s| s.kind.blast_weight())
        .fold(0.0, f64::max);
    let targets: HashSet<&str> = steps.iter().map(|s| s.target.as_str()).collect();
    let extra = targets.len().saturating_sub(1) as f64;
    (max_blast + 0.05 * extra).min(1.0)
}

/// Category impact, namespace, and action scope blended 40/30/30.
fn impact_factor(category: MetricCategory, steps: &[ActionStep]) -> f64 {
    let (_, ns_weight) = widest_namespace(steps);
    0.4 * category.impact_weight() + 0.3 * ns_weight + 0.3 * action_scope(steps)
}

/// Mean action complexity, a notch per extra step, and a fixed penalty
/// when any step cannot be undone.
fn complexity_factor(steps: &[ActionStep]) -> f64 {
    if steps.is_empty() {
        return 0.0;
    }
    let mean = steps
        .iter()
        .map(|s| s.kind.complexity_weight())
        .sum::<f64>()
        / steps.len() as f64;
    let extra = (0.05 * (steps.len() - 1) as f64).min(0.25);
    let irreversible = if steps.iter().any(|s| !s.can_rollback) {
        0.4
    } else {
        0.0
    };
    (mean + extra + irreversible).min(1.0)
}

// ---------------------------------------------------------------------------
// Assessor
// ---------------------------------------------------------------------------

pub struct RiskAssessor {
    config: RiskConfig,
}

impl RiskAssessor {
    pub fn new(config: RiskConfig) -> Self {
        RiskAssessor { config }
    }

    /// Map a score against the ascending tier thresholds.
    pub fn tier_for(&self, score: f64) -> RiskTier {
        let t = &self.config.thresholds;
        if score < t.auto {
            RiskTier::Auto
        } else if score < t.semi_auto {
            RiskTier::SemiAuto
        } else if score < t.manual {
            RiskTier::Manual
        } else {
            RiskTier::Hold
        }
    }

    /// Score a plan shape for an anomaly.
    ///
    /// `previous_deviation` is the anomaly's deviation one tick earlier,
    /// when the caller has it; a growing magnitude bumps urgency.
    pub fn assess(
        &self,
        anomaly: &Anomaly,
        steps: &[ActionStep],
        previous_deviation: Option<f64>,
    ) -> RiskAssessment {
        let worsening = previous_deviation
            .map(|prev| anomaly.deviation.abs() > prev.abs() + 1e-9)
            .unwrap_or(false);

        let factors = RiskFactors {
            severity: severity_factor(anomaly.severity),
            urgency: urgency_factor(anomaly.duration_minutes, worsening),
            impact: impact_factor(anomaly.category, steps),
            complexity: complexity_factor(steps),
        };

        let w = &self.config.weights;
        let score = w.severity * factors.severity
            + w.urgency * factors.urgency
            + w.impact * factors.impact
            + w.complexity * factors.complexity;
        let tier = self.tier_for(score);

        let (ns_name, ns_weight) = widest_namespace(steps);
        let irreversible = steps.iter().filter(|s| !s.can_rollback).count();
        let reasoning = vec![
            format!("severity {} -> {:.2}", anomaly.severity, factors.severity),
            format!(
                "active {} min{} -> urgency {:.2}",
                anomaly.duration_minutes,
                if worsening { ", worsening" } else { "" },
                factors.urgency
            ),
            format!(
                "impact {:.2}: category {} ({:.2}), namespace {} ({:.2}), scope {:.2}",
                factors.impact,
                anomaly.category,
                anomaly.category.impact_weight(),
                ns_name,
                ns_weight,
                action_scope(steps)
            ),
            format!(
                "complexity {:.2}: {} step(s), {} irreversible",
                factors.complexity,
                steps.len(),
                irreversible
            ),
            format!("risk {:.2} -> tier {}", score, tier),
        ];

        RiskAssessment {
            score,
            tier,
            factors,
            reasoning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::AnomalyKind;
    use crate::plan::ActionKind;
    use chrono::{TimeZone, Utc};
    use mt_common::{AnomalyId, MetricKey};
    use mt_config::RiskThresholds;

    fn fixture_anomaly(name: &str, severity: Severity, duration_minutes: i64) -> Anomaly {
        let key = MetricKey::bare(name);
        let now = Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap();
        Anomaly {
            id: AnomalyId::new(),
            category: key.category(),
            key,
            kind: AnomalyKind::Spike,
            severity,
            current_value: 140.0,
            baseline_value: 100.0,
            deviation: 4.0,
            deviation_percent: 40.0,
            scores: Vec::new(),
            ensemble_score: 0.66,
            detected_at: now,
            started_at: now,
            duration_minutes,
            is_active: true,
            acknowledged: false,
            acknowledged_by: None,
            resolved_at: None,
        }
    }

    fn step(kind: ActionKind, target: &str, namespace: &str, order: usize) -> ActionStep {
        ActionStep::new("risk-test", kind, target, namespace, order)
    }

    #[test]
    fn test_severity_factor_mapping() {
        assert_eq!(severity_factor(Severity::Low), 0.25);
        assert_eq!(severity_factor(Severity::Medium), 0.5);
        assert_eq!(severity_factor(Severity::High), 0.75);
        assert_eq!(severity_factor(Severity::Critical), 1.0);
    }

    #[test]
    fn test_urgency_buckets_and_worsening_cap() {
        assert_eq!(urgency_factor(0, false), 0.3);
        assert_eq!(urgency_factor(2, false), 0.5);
        assert_eq!(urgency_factor(14, false), 0.7);
        assert_eq!(urgency_factor(15, false), 0.85);
        assert_eq!(urgency_factor(30, false), 0.95);
        assert!((urgency_factor(0, true) - 0.35).abs() < 1e-9);
        assert_eq!(urgency_factor(45, true), 1.0);
    }

    #[test]
    fn test_namespace_weights() {
        assert_eq!(namespace_weight("production"), 1.0);
        assert_eq!(namespace_weight("prod"), 1.0);
        assert_eq!(namespace_weight("staging"), 0.6);
        assert_eq!(namespace_weight("dev"), 0.3);
        assert_eq!(namespace_weight("default"), 0.7);
        assert_eq!(namespace_weight("payments"), 0.7);
    }

    #[test]
    fn test_impact_blend() {
        // 0.4*0.6 + 0.3*0.6 + 0.3*0.4 = 0.54
        let steps = vec![step(ActionKind::RestartWorkload, "api", "staging", 0)];
        let impact = impact_factor(MetricCategory::Infrastructure, &steps);
        assert!((impact - 0.54).abs() < 1e-9);
    }

    #[test]
    fn test_action_scope_widens_per_target() {
        let one = vec![step(ActionKind::RestartWorkload, "api", "prod", 0)];
        assert!((action_scope(&one) - 0.4).abs() < 1e-9);

        let two = vec![
            step(ActionKind::RestartWorkload, "api", "prod", 0),
            step(ActionKind::RestartWorkload, "worker", "prod", 1),
        ];
        assert!((action_scope(&two) - 0.45).abs() < 1e-9);

        // Same target twice does not widen
        let same = vec![
            step(ActionKind::RestartWorkload, "api", "prod", 0),
            step(ActionKind::FlushCache, "api", "prod", 1),
        ];
        assert!((action_scope(&same) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_complexity_penalties() {
        // Irreversible restart: 0.2 + 0.4
        let restart = vec![step(ActionKind::RestartWorkload, "api", "prod", 0)];
        assert!((complexity_factor(&restart) - 0.6).abs() < 1e-9);

        // Three reversible steps: mean 0.4 + 0.10 extra
        let reversible = vec![
            step(ActionKind::ScaleReplicas, "api", "prod", 0),
            step(ActionKind::RollbackConfig, "api", "prod", 1),
            step(ActionKind::OpenBreaker, "api", "prod", 2),
        ];
        assert!((complexity_factor(&reversible) - 0.5).abs() < 1e-9);

        // Extra-step bump caps at 0.25
        let many: Vec<ActionStep> = (0..7)
            .map(|i| step(ActionKind::ScaleReplicas, "api", "prod", i))
            .collect();
        assert!((complexity_factor(&many) - (0.3 + 0.25)).abs() < 1e-9);
    }

    #[test]
    fn test_assess_known_score_lands_semi_auto() {
        // 0.35*0.5 + 0.25*0.7 + 0.25*0.54 + 0.15*0.6 = 0.575
        let assessor = RiskAssessor::new(RiskConfig::default());
        let anomaly = fixture_anomaly("cpu_usage", Severity::Medium, 10);
        let steps = vec![step(ActionKind::RestartWorkload, "api", "staging", 0)];

        let assessment = assessor.assess(&anomaly, &steps, None);
        assert!((assessment.score - 0.575).abs() < 1e-9);
        assert_eq!(assessment.tier, RiskTier::SemiAuto);
        assert_eq!(
            assessment.tier.required_approvals(&ApprovalConfig::default()),
            1
        );
        assert_eq!(assessment.reasoning.len(), 5);
    }

    #[test]
    fn test_worsening_bumps_urgency() {
        let assessor = RiskAssessor::new(RiskConfig::default());
        let anomaly = fixture_anomaly("cpu_usage", Severity::Medium, 10);
        let steps = vec![step(ActionKind::RestartWorkload, "api", "staging", 0)];

        let flat = assessor.assess(&anomaly, &steps, Some(4.0));
        assert!((flat.factors.urgency - 0.7).abs() < 1e-9);

        let growing = assessor.assess(&anomaly, &steps, Some(2.5));
        assert!((growing.factors.urgency - 0.75).abs() < 1e-9);
        assert!(growing.score > flat.score);
    }

    #[test]
    fn test_tier_thresholds() {
        let assessor = RiskAssessor::new(RiskConfig {
            thresholds: RiskThresholds {
                auto: 0.4,
                semi_auto: 0.7,
                manual: 0.9,
            },
            ..RiskConfig::default()
        });
        assert_eq!(assessor.tier_for(0.39), RiskTier::Auto);
        assert_eq!(assessor.tier_for(0.4), RiskTier::SemiAuto);
        assert_eq!(assessor.tier_for(0.5), RiskTier::SemiAuto);
        assert_eq!(assessor.tier_for(0.89), RiskTier::Manual);
        assert_eq!(assessor.tier_for(0.9), RiskTier::Hold);
    }

    #[test]
    fn test_maximal_plan_lands_hold() {
        let assessor = RiskAssessor::new(RiskConfig::default());
        let mut anomaly = fixture_anomaly("wallet_balance_drift", Severity::Critical, 45);
        anomaly.deviation = 8.0;
        let steps = vec![step(ActionKind::FailoverDatabase, "wallet-db", "production", 0)];

        let assessment = assessor.assess(&anomaly, &steps, Some(6.0));
        assert!((assessment.score - 1.0).abs() < 1e-9);
        assert_eq!(assessment.tier, RiskTier::Hold);
        assert_eq!(
            assessment.tier.required_approvals(&ApprovalConfig::default()),
            HOLD_APPROVALS
        );
    }
}
