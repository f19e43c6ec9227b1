//! Remediation playbooks.
//!
//! A playbook names the steps to run when a metric matching its pattern
//! misbehaves. Matching sits behind a trait so deployments can swap the
//! lookup; the in-tree implementation is a static first-match table.

use serde::{Deserialize, Serialize};

use crate::detect::AnomalyKind;
use crate::plan::{ActionKind, ParamMap};

/// Target placeholder replaced with the metric's `service` label
/// (falling back to the metric name) when a plan is built.
pub const SERVICE_PLACEHOLDER: &str = "{service}";

/// Step template within a playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookStep {
    pub kind: ActionKind,
    pub target: String,
    pub namespace: String,
    #[serde(default)]
    pub parameters: ParamMap,
}

impl PlaybookStep {
    pub fn new(kind: ActionKind, target: impl Into<String>, namespace: impl Into<String>) -> Self {
        PlaybookStep {
            kind,
            target: target.into(),
            namespace: namespace.into(),
            parameters: ParamMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: &str, value: serde_json::Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }
}

/// A named remediation recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub name: String,
    /// Metric name pattern: exact, `prefix*`, or the catch-all `*`.
    pub metric_pattern: String,
    /// Anomaly kinds this recipe applies to; empty means all.
    #[serde(default)]
    pub kinds: Vec<AnomalyKind>,
    pub steps: Vec<PlaybookStep>,
}

impl Playbook {
    pub fn matches(&self, metric_name: &str, kind: AnomalyKind) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&kind) {
            return false;
        }
        matches_pattern(&self.metric_pattern, metric_name)
    }
}

fn matches_pattern(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => name == pattern,
    }
}

/// Playbook lookup for the planner.
pub trait PlaybookMatcher: Send + Sync {
    /// First playbook applying to the metric and anomaly kind.
    fn find(&self, metric_name: &str, kind: AnomalyKind) -> Option<&Playbook>;
}

/// In-memory table; first match wins, so order entries most specific
/// first.
pub struct StaticPlaybooks {
    playbooks: Vec<Playbook>,
}

impl StaticPlaybooks {
    pub fn new(playbooks: Vec<Playbook>) -> Self {
        StaticPlaybooks { playbooks }
    }

    pub fn playbooks(&self) -> &[Playbook] {
        &self.playbooks
    }

    /// Builtin recipes for the common incident shapes, ending in a
    /// catch-all that pages the incident bridge.
    pub fn default_set() -> Self {
        use ActionKind::*;
        use AnomalyKind::*;

        let playbooks = vec![
            Playbook {
                name: "api-latency".to_string(),
                metric_pattern: "api_latency*".to_string(),
                kinds: vec![Spike, Drift],
                steps: vec![
                    PlaybookStep::new(ScaleReplicas, SERVICE_PLACEHOLDER, "production")
                        .with_parameter("replicas_delta", serde_json::json!(2)),
                    PlaybookStep::new(FlushCache, "edge-cache", "production"),
                ],
            },
            Playbook {
                name: "api-errors".to_string(),
                metric_pattern: "api_error*".to_string(),
                kinds: vec![Spike],
                steps: vec![
                    PlaybookStep::new(OpenBreaker, SERVICE_PLACEHOLDER, "production"),
                    PlaybookStep::new(RollbackRelease, SERVICE_PLACEHOLDER, "production"),
                ],
            },
            Playbook {
                name: "queue-backlog".to_string(),
                metric_pattern: "queue_*".to_string(),
                kinds: Vec::new(),
                steps: vec![PlaybookStep::new(
                    ScaleReplicas,
                    SERVICE_PLACEHOLDER,
                    "production",
                )
                .with_parameter("replicas_delta", serde_json::json!(3))],
            },
            Playbook {
                name: "db-degraded".to_string(),
                metric_pattern: "db_*".to_string(),
                kinds: Vec::new(),
                steps: vec![PlaybookStep::new(
                    FailoverDatabase,
                    SERVICE_PLACEHOLDER,
                    "production",
                )],
            },
            Playbook {
                name: "node-pressure".to_string(),
                metric_pattern: "cpu_*".to_string(),
                kinds: vec![Spike, Drift],
                steps: vec![PlaybookStep::new(
                    RestartWorkload,
                    SERVICE_PLACEHOLDER,
                    "production",
                )],
            },
            Playbook {
                name: "wallet-stuck".to_string(),
                metric_pattern: "wallet_*".to_string(),
                kinds: vec![Flatline, Drop],
                steps: vec![
                    PlaybookStep::new(RollbackConfig, SERVICE_PLACEHOLDER, "production"),
                    PlaybookStep::new(InvokeWebhook, "oncall-pager", "production")
                        .with_parameter("channel", serde_json::json!("payments-oncall")),
                ],
            },
            Playbook {
                name: "region-latency".to_string(),
                metric_pattern: "network_*".to_string(),
                kinds: Vec::new(),
                steps: vec![PlaybookStep::new(
                    ShiftTraffic,
                    SERVICE_PLACEHOLDER,
                    "production",
                )
                .with_parameter("to_region", serde_json::json!("secondary"))],
            },
            Playbook {
                name: "page-incident-bridge".to_string(),
                metric_pattern: "*".to_string(),
                kinds: Vec::new(),
                steps: vec![PlaybookStep::new(
                    InvokeWebhook,
                    "incident-bridge",
                    "production",
                )],
            },
        ];
        StaticPlaybooks::new(playbooks)
    }
}

impl PlaybookMatcher for StaticPlaybooks {
    fn find(&self, metric_name: &str, kind: AnomalyKind) -> Option<&Playbook> {
        self.playbooks.iter().find(|p| p.matches(metric_name, kind))
    }
}
