//! Metric identity types.
//!
//! A metric is uniquely identified by its name plus a sorted label set.
//! The canonical string form is the map key everywhere: bare `name` when
//! there are no labels, otherwise `name{k1=v1,k2=v2}` with pairs sorted
//! by label key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Metric key: name plus sorted labels.
///
/// BTreeMap keeps label iteration order stable, so the canonical form is
/// deterministic for any insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricKey {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl MetricKey {
    /// Create a key with no labels.
    pub fn bare(name: impl Into<String>) -> Self {
        MetricKey {
            name: name.into(),
            labels: BTreeMap::new(),
        }
    }

    /// Create a key with labels.
    pub fn with_labels<I, K, V>(name: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        MetricKey {
            name: name.into(),
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Canonical string form: `name` or `name{k1=v1,k2=v2}`.
    pub fn canonical(&self) -> String {
        if self.labels.is_empty() {
            return self.name.clone();
        }
        let pairs: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("{}{{{}}}", self.name, pairs.join(","))
    }

    /// Parse a canonical string form back into a key.
    ///
    /// Returns `None` for empty names, unbalanced braces, or label pairs
    /// without `=`.
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() {
            return None;
        }
        let Some(brace) = s.find('{') else {
            if s.contains('}') {
                return None;
            }
            return Some(MetricKey::bare(s));
        };
        if brace == 0 || !s.ends_with('}') {
            return None;
        }
        let name = &s[..brace];
        let body = &s[brace + 1..s.len() - 1];
        let mut labels = BTreeMap::new();
        if !body.is_empty() {
            for pair in body.split(',') {
                let (k, v) = pair.split_once('=')?;
                if k.is_empty() {
                    return None;
                }
                labels.insert(k.to_string(), v.to_string());
            }
        }
        Some(MetricKey {
            name: name.to_string(),
            labels,
        })
    }

    /// Category for severity and impact weighting, derived from the name.
    pub fn category(&self) -> MetricCategory {
        MetricCategory::from_metric_name(&self.name)
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Business category of a metric, used to weight severity and impact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricCategory {
    Trading,
    Matching,
    Risk,
    Wallet,
    Api,
    Infrastructure,
    Database,
    Queue,
    Business,
}

impl MetricCategory {
    pub const ALL: [MetricCategory; 9] = [
        MetricCategory::Trading,
        MetricCategory::Matching,
        MetricCategory::Risk,
        MetricCategory::Wallet,
        MetricCategory::Api,
        MetricCategory::Infrastructure,
        MetricCategory::Database,
        MetricCategory::Queue,
        MetricCategory::Business,
    ];

    /// Derive the category from a metric name prefix.
    ///
    /// Names follow the `<domain>_<measure>` convention; unknown domains
    /// fall back to `Business` (severity weight 1.0).
    pub fn from_metric_name(name: &str) -> Self {
        let prefix = name.split('_').next().unwrap_or(name);
        match prefix {
            "trading" | "order" | "orders" => MetricCategory::Trading,
            "matching" | "engine" => MetricCategory::Matching,
            "risk" | "margin" => MetricCategory::Risk,
            "wallet" | "withdrawal" | "deposit" => MetricCategory::Wallet,
            "api" | "http" | "grpc" => MetricCategory::Api,
            "infra" | "node" | "cpu" | "memory" | "disk" | "network" => {
                MetricCategory::Infrastructure
            }
            "db" | "database" | "postgres" | "mysql" | "redis" => MetricCategory::Database,
            "queue" | "kafka" | "rabbitmq" | "mq" => MetricCategory::Queue,
            _ => MetricCategory::Business,
        }
    }

    /// Severity multiplier applied to the raw deviation.
    pub fn severity_weight(&self) -> f64 {
        match self {
            MetricCategory::Trading => 1.5,
            MetricCategory::Matching => 1.5,
            MetricCategory::Risk => 2.0,
            MetricCategory::Wallet => 2.0,
            MetricCategory::Api => 1.2,
            MetricCategory::Infrastructure => 1.0,
            MetricCategory::Database => 1.3,
            MetricCategory::Queue => 1.2,
            MetricCategory::Business => 1.0,
        }
    }

    /// Impact contribution for risk assessment, 0..1.
    pub fn impact_weight(&self) -> f64 {
        match self {
            MetricCategory::Trading => 0.9,
            MetricCategory::Matching => 0.9,
            MetricCategory::Risk => 1.0,
            MetricCategory::Wallet => 1.0,
            MetricCategory::Api => 0.7,
            MetricCategory::Infrastructure => 0.6,
            MetricCategory::Database => 0.8,
            MetricCategory::Queue => 0.7,
            MetricCategory::Business => 0.5,
        }
    }
}

impl fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricCategory::Trading => "trading",
            MetricCategory::Matching => "matching",
            MetricCategory::Risk => "risk",
            MetricCategory::Wallet => "wallet",
            MetricCategory::Api => "api",
            MetricCategory::Infrastructure => "infrastructure",
            MetricCategory::Database => "database",
            MetricCategory::Queue => "queue",
            MetricCategory::Business => "business",
        };
        write!(f, "{}", s)
    }
}
