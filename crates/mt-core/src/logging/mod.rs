//! Logging setup and correlation identifiers.
//!
//! All log output goes to stderr, either as terminal text or as JSONL
//! when another program is reading it; stdout stays reserved for
//! command payloads. Run and host ids minted here thread through log
//! lines and audit records so one incident can be traced across a
//! fleet from aggregated streams.

pub mod config;

pub use config::{LogConfig, LogFormat, LogLevel};

use sha2::{Digest, Sha256};
use std::io::IsTerminal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber. Call once, before any log
/// statement. A `RUST_LOG` in the environment overrides the resolved
/// level wholesale.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mt_core={}", config.level)));
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Jsonl => {
            let layer = fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(false)
                .with_span_list(false);
            registry.with(layer).init();
        }
        LogFormat::Human => {
            let layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(std::io::stderr().is_terminal());
            if config.timestamps {
                registry.with(layer).init();
            } else {
                registry.with(layer.without_time()).init();
            }
        }
    }
}

/// Random id tying one invocation's log lines and audit records
/// together. Shape: `run-` plus 12 hex chars.
pub fn generate_run_id() -> String {
    format!("run-{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

/// Stable identifier for the host this engine runs on.
///
/// Prefers `/etc/machine-id`, falls back to a hash of `$HOSTNAME`, and
/// as a last resort mints a random id for this process.
pub fn get_host_id() -> String {
    machine_host_id()
        .or_else(hostname_host_id)
        .unwrap_or_else(|| format!("host-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]))
}

fn machine_host_id() -> Option<String> {
    let raw = std::fs::read_to_string("/etc/machine-id").ok()?;
    let id = raw.trim();
    (id.len() >= 8).then(|| format!("host-{}", &id[..8]))
}

fn hostname_host_id() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .map(|name| hashed_host_id(&name))
}

/// `host-` plus the first 8 hex chars of the name's sha256. Stable
/// across runs and Rust versions, unlike the stdlib hasher.
fn hashed_host_id(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    format!("host-{}", &hex::encode(digest)[..8])
}
