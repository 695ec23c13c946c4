/// Core types and structures for the seqbox harness
use crate::core::types::{OperationId, RawSignal};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Exit code reported by a successful run.
pub const EXIT_SUCCESS: i32 = 66;

/// Uniform error taxonomy - STABLE (closed set)
///
/// Every native return value is mapped onto exactly one of these kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AllocationFailure,
    InvalidArgument,
    TypeMismatch,
    NotFound,
    ParseFailure,
    Unsupported,
    Timeout,
    DoubleFree,
    Leak,
    DanglingReference,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 11] = [
        ErrorKind::AllocationFailure,
        ErrorKind::InvalidArgument,
        ErrorKind::TypeMismatch,
        ErrorKind::NotFound,
        ErrorKind::ParseFailure,
        ErrorKind::Unsupported,
        ErrorKind::Timeout,
        ErrorKind::DoubleFree,
        ErrorKind::Leak,
        ErrorKind::DanglingReference,
        ErrorKind::Unknown,
    ];

    /// Kinds that always fail the run, whatever the operation's contract says.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::DoubleFree | ErrorKind::Leak | ErrorKind::DanglingReference
        )
    }

    /// Kinds a script may tolerate without naming them explicitly.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::NotFound | ErrorKind::ParseFailure | ErrorKind::Unsupported
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AllocationFailure => "allocation_failure",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::TypeMismatch => "type_mismatch",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ParseFailure => "parse_failure",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Timeout => "timeout",
            ErrorKind::DoubleFree => "double_free",
            ErrorKind::Leak => "leak",
            ErrorKind::DanglingReference => "dangling_reference",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Convert classified failures to process exit codes.
/// Each kind has its own code; none collides with [`EXIT_SUCCESS`].
impl From<ErrorKind> for i32 {
    fn from(kind: ErrorKind) -> i32 {
        match kind {
            ErrorKind::AllocationFailure => 70,
            ErrorKind::InvalidArgument => 71,
            ErrorKind::TypeMismatch => 72,
            ErrorKind::NotFound => 73,
            ErrorKind::ParseFailure => 74,
            ErrorKind::Unsupported => 75,
            ErrorKind::Timeout => 76,
            ErrorKind::DoubleFree => 77,
            ErrorKind::Leak => 78,
            ErrorKind::DanglingReference => 79,
            ErrorKind::Unknown => 80,
        }
    }
}

/// Ownership state of a tracked handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipState {
    /// The run holds the release obligation (directly or through a parent)
    Owned,
    /// Non-owning alias of another handle
    Reference,
    /// Previously owned, temporarily un-parented, still owned by the run
    Detached,
    /// Released (terminal)
    Freed,
    /// Still live after cleanup (terminal, error)
    Leaked,
}

impl OwnershipState {
    /// Owned or Detached: the handle still needs exactly one release.
    pub fn is_live(self) -> bool {
        matches!(self, OwnershipState::Owned | OwnershipState::Detached)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OwnershipState::Freed | OwnershipState::Leaked)
    }
}

/// The five scripted phases, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initialize,
    Configure,
    Operate,
    Validate,
    Cleanup,
}

impl Phase {
    pub const ORDER: [Phase; 5] = [
        Phase::Initialize,
        Phase::Configure,
        Phase::Operate,
        Phase::Validate,
        Phase::Cleanup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Initialize => "initialize",
            Phase::Configure => "configure",
            Phase::Operate => "operate",
            Phase::Validate => "validate",
            Phase::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failure,
}

/// Runtime mirror of the executor's state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Idle,
    Initializing,
    Configuring,
    Operating,
    Validating,
    CleaningUp,
    Terminal(RunOutcome),
}

impl PhaseState {
    /// State entered to run the given scripted phase.
    pub fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::Initialize => PhaseState::Initializing,
            Phase::Configure => PhaseState::Configuring,
            Phase::Operate => PhaseState::Operating,
            Phase::Validate => PhaseState::Validating,
            Phase::Cleanup => PhaseState::CleaningUp,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PhaseState::Terminal(_))
    }
}

/// A classified failure of one run, attributed to an operation when possible.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    /// Originating operation, if the failure came from one
    pub operation: Option<OperationId>,
    /// Native function name of the originating operation
    pub function: Option<String>,
    pub phase: Option<Phase>,
    /// Raw native signal that produced the failure
    pub raw: Option<RawSignal>,
    pub diagnostic: String,
}

impl RunError {
    pub fn new(kind: ErrorKind, diagnostic: impl Into<String>) -> Self {
        Self {
            kind,
            operation: None,
            function: None,
            phase: None,
            raw: None,
            diagnostic: diagnostic.into(),
        }
    }

    pub fn with_operation(mut self, id: OperationId, function: impl Into<String>) -> Self {
        self.operation = Some(id);
        self.function = Some(function.into());
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_raw(mut self, raw: RawSignal) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.into()
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let (Some(op), Some(function)) = (self.operation, &self.function) {
            write!(f, " at {} {}", op, function)?;
        }
        if let Some(phase) = self.phase {
            write!(f, " during {}", phase)?;
        }
        write!(f, ": {}", self.diagnostic)
    }
}

/// Custom error types for seqbox infrastructure
///
/// These cover the harness itself (config, scripts, workspace). Failures of the
/// library under test are never raised this way; they become [`RunError`]s.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Audit log error: {0}")]
    Audit(String),

    #[error("Ownership violation: {0}")]
    Ownership(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes: HashSet<i32> = ErrorKind::ALL.iter().map(|k| i32::from(*k)).collect();
        assert_eq!(codes.len(), ErrorKind::ALL.len());
        assert!(!codes.contains(&EXIT_SUCCESS));
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_fatal_and_recoverable_sets() {
        for kind in ErrorKind::ALL {
            assert!(!(kind.is_fatal() && kind.is_recoverable()), "{kind}");
        }
        assert!(ErrorKind::Leak.is_fatal());
        assert!(ErrorKind::ParseFailure.is_recoverable());
        assert!(!ErrorKind::Timeout.is_recoverable());
    }

    #[test]
    fn test_error_kind_serde_names() {
        let json = serde_json::to_string(&ErrorKind::DanglingReference).unwrap();
        assert_eq!(json, "\"dangling_reference\"");
        let kind: ErrorKind = serde_json::from_str("\"parse_failure\"").unwrap();
        assert_eq!(kind, ErrorKind::ParseFailure);
    }

    #[test]
    fn test_run_error_display() {
        let err = RunError::new(ErrorKind::NotFound, "key missing")
            .with_operation(OperationId(4), "cJSON_GetObjectItem")
            .with_phase(Phase::Operate);
        assert_eq!(
            err.to_string(),
            "not_found at op#4 cJSON_GetObjectItem during operate: key missing"
        );
        assert_eq!(err.exit_code(), 73);
    }
}
