//! Rendering formats for CLI payloads.
//!
//! Every subcommand writes exactly one payload to stdout in one of these
//! formats. Logs never share stdout; they go to stderr.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How a command renders its stdout payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Pretty-printed JSON envelope, the default for automation.
    #[default]
    Json,

    /// Compact JSON, one object per line, for tick loops and pipes.
    Jsonl,

    /// Single status line for cron mails and shell prompts.
    Summary,

    /// Markdown block for humans and chat bridges.
    Md,
}

impl OutputFormat {
    /// Machine formats expect JSONL logs on stderr so both streams parse.
    pub fn is_machine(self) -> bool {
        matches!(self, OutputFormat::Json | OutputFormat::Jsonl)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Jsonl => "jsonl",
            OutputFormat::Summary => "summary",
            OutputFormat::Md => "md",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_formats() {
        assert!(OutputFormat::Json.is_machine());
        assert!(OutputFormat::Jsonl.is_machine());
        assert!(!OutputFormat::Summary.is_machine());
        assert!(!OutputFormat::Md.is_machine());
    }

    #[test]
    fn test_display_matches_serde_names() {
        for format in [
            OutputFormat::Json,
            OutputFormat::Jsonl,
            OutputFormat::Summary,
            OutputFormat::Md,
        ] {
            let serialized = serde_json::to_string(&format).unwrap();
            assert_eq!(serialized, format!("\"{}\"", format));
        }
    }
}
