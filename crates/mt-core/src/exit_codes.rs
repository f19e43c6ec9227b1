//! Process exit codes for the mt-core binary.
//!
//! Wrappers branch on the code instead of parsing stdout. Codes below
//! 10 describe what a healthy run did: 0 clean, 1 plans parked in the
//! approval queue, 2 remediation applied, and so on. 10-19 are
//! operator-fixable input or environment problems. 20 and up are bugs
//! or I/O failures worth a ticket.
//!
//! Values are a stable contract; renumbering is a breaking change.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// No anomalies, nothing pending.
    Clean = 0,

    /// Plans were created or still wait for approval.
    PlanReady = 1,

    /// At least one approved plan executed and every step succeeded.
    ActionsOk = 2,

    /// One or more remediation steps failed.
    PartialFail = 3,

    /// A guardrail refused execution: blacklist, cooldown, or the
    /// execution switch is off.
    PolicyBlocked = 4,

    /// The audit chain failed verification.
    IntegrityFail = 5,

    /// Bad command line input.
    ArgsError = 10,

    /// Configuration missing or failed validation.
    ConfigError = 11,

    /// Not enough baseline history for the request.
    BaselineError = 13,

    /// The referenced plan, metric, or file does not exist.
    NotFoundError = 14,

    /// A bug in mt-core.
    InternalError = 20,

    /// Filesystem trouble reading or writing state.
    IoError = 21,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// The outcome band automation treats as a healthy run.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ExitCode::Clean | ExitCode::PlanReady | ExitCode::ActionsOk
        )
    }

    /// Stable name for JSON envelopes and log lines.
    pub fn code_name(self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::PlanReady => "OK_PLANS",
            ExitCode::ActionsOk => "OK_APPLIED",
            ExitCode::PartialFail => "ERR_PARTIAL",
            ExitCode::PolicyBlocked => "ERR_BLOCKED",
            ExitCode::IntegrityFail => "ERR_INTEGRITY",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::BaselineError => "ERR_BASELINE",
            ExitCode::NotFoundError => "ERR_NOT_FOUND",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}
