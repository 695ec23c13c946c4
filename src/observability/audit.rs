/// Structured audit trail for scripted runs
///
/// JSON-lines events carrying per-run correlation ids:
/// - Event types: run start/end, phase enter, operation invoked, error
///   classified, ownership transition, cleanup start/release, leak
/// - Every event is mirrored to the `log` facade at a level derived from
///   its severity; the file trail is optional
use crate::config::types::{ErrorKind, HarnessError, Phase, Result, RunOutcome};
use crate::core::types::{HandleId, OperationId};
use crate::ownership::tracker::{Transition, TransitionAction};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Audit event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Critical,
    High,
    Medium,
    Low,
    Trace,
}

/// Types of run events we track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    RunStart,
    RunEnd,
    PhaseEnter,
    OperationInvoked,
    ErrorClassified,
    OwnershipTransition,
    DoubleFreeBlocked,
    CleanupStart,
    CleanupRelease,
    HandleLeaked,
}

impl RunEventType {
    /// Get the default severity for this event type
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            RunEventType::RunStart | RunEventType::RunEnd => AuditSeverity::Low,
            RunEventType::PhaseEnter | RunEventType::CleanupStart => AuditSeverity::Low,
            RunEventType::OperationInvoked
            | RunEventType::OwnershipTransition
            | RunEventType::CleanupRelease => AuditSeverity::Trace,
            RunEventType::ErrorClassified => AuditSeverity::Medium,
            RunEventType::DoubleFreeBlocked => AuditSeverity::High,
            RunEventType::HandleLeaked => AuditSeverity::Critical,
        }
    }
}

/// Correlation identifiers shared by every event of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationIds {
    pub run_id: String,
    pub script: String,
    pub library: String,
}

impl CorrelationIds {
    pub fn new(run_id: Uuid, script: &str, library: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            script: script.to_string(),
            library: library.to_string(),
        }
    }
}

/// One audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_type: RunEventType,
    pub severity: AuditSeverity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    pub correlation: Option<CorrelationIds>,
    pub phase: Option<Phase>,
    pub operation: Option<OperationId>,
    pub handle: Option<HandleId>,
    pub error_kind: Option<ErrorKind>,
}

impl RunEvent {
    pub fn new(event_type: RunEventType, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: Utc::now(),
            details: details.into(),
            correlation: None,
            phase: None,
            operation: None,
            handle: None,
            error_kind: None,
        }
    }

    pub fn with_correlation(mut self, correlation: CorrelationIds) -> Self {
        self.correlation = Some(correlation);
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_operation(mut self, operation: OperationId) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_handle(mut self, handle: HandleId) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn with_error_kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// JSON-lines form of the event
    pub fn to_log_entry(&self) -> serde_json::Value {
        let mut log_entry = serde_json::json!({
            "timestamp": self.timestamp.to_rfc3339(),
            "event_type": self.event_type,
            "severity": self.severity,
            "details": self.details,
            "process_id": std::process::id(),
        });
        if let Some(correlation) = &self.correlation {
            log_entry["correlation"] = serde_json::json!({
                "run_id": correlation.run_id,
                "script": correlation.script,
                "library": correlation.library,
            });
        }
        if let Some(phase) = self.phase {
            log_entry["phase"] = serde_json::json!(phase);
        }
        if let Some(operation) = self.operation {
            log_entry["operation"] = serde_json::json!(operation);
        }
        if let Some(handle) = self.handle {
            log_entry["handle"] = serde_json::json!(handle);
        }
        if let Some(kind) = self.error_kind {
            log_entry["error_kind"] = serde_json::json!(kind);
        }
        log_entry
    }
}

fn mirror_to_log(event: &RunEvent) {
    match event.severity {
        AuditSeverity::Critical | AuditSeverity::High => {
            error!("AUDIT {:?}: {}", event.event_type, event.details)
        }
        AuditSeverity::Medium => warn!("AUDIT {:?}: {}", event.event_type, event.details),
        AuditSeverity::Low => info!("AUDIT {:?}: {}", event.event_type, event.details),
        AuditSeverity::Trace => debug!("AUDIT {:?}: {}", event.event_type, event.details),
    }
}

/// File-backed audit writer
#[derive(Debug)]
pub struct AuditLogger {
    audit_file: Arc<Mutex<File>>,
    audit_path: PathBuf,
}

impl AuditLogger {
    /// Open (append) the audit file, creating parent directories.
    pub fn open(audit_path: &Path) -> Result<Self> {
        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                HarnessError::Audit(format!("Failed to create audit log directory: {}", e))
            })?;
        }
        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(audit_path)
            .map_err(|e| {
                HarnessError::Audit(format!(
                    "Failed to open audit log {}: {}",
                    audit_path.display(),
                    e
                ))
            })?;
        Ok(Self {
            audit_file: Arc::new(Mutex::new(audit_file)),
            audit_path: audit_path.to_path_buf(),
        })
    }

    pub fn log_event(&self, event: &RunEvent) {
        mirror_to_log(event);
        let log_entry = event.to_log_entry();
        match self.audit_file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", log_entry) {
                    error!("Failed to write to audit log: {}", e);
                }
                if let Err(e) = file.flush() {
                    error!("Failed to flush audit log: {}", e);
                }
            }
            Err(_) => error!("Failed to acquire lock on audit file"),
        }
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }
}

/// Audit sink for one run
///
/// Stamps every event with the run's correlation ids and writes it to the
/// run's logger when one is configured, to the `log` facade otherwise.
#[derive(Debug, Clone)]
pub struct RunAudit {
    correlation: CorrelationIds,
    logger: Option<Arc<AuditLogger>>,
}

impl RunAudit {
    pub fn new(correlation: CorrelationIds, logger: Option<Arc<AuditLogger>>) -> Self {
        Self {
            correlation,
            logger,
        }
    }

    pub fn correlation(&self) -> &CorrelationIds {
        &self.correlation
    }

    pub fn emit(&self, event: RunEvent) {
        let event = event.with_correlation(self.correlation.clone());
        match &self.logger {
            Some(logger) => logger.log_event(&event),
            None => mirror_to_log(&event),
        }
    }

    pub fn run_start(&self, operations: usize) {
        self.emit(RunEvent::new(
            RunEventType::RunStart,
            format!(
                "run {} started: {} operations against {}",
                self.correlation.run_id, operations, self.correlation.library
            ),
        ));
    }

    pub fn run_end(&self, outcome: RunOutcome, exit_code: i32, first_error: Option<ErrorKind>) {
        let mut event = RunEvent::new(
            RunEventType::RunEnd,
            format!("run finished: {:?} (exit {})", outcome, exit_code),
        );
        if let Some(kind) = first_error {
            event = event.with_error_kind(kind);
        }
        self.emit(event);
    }

    pub fn phase_enter(&self, phase: Phase) {
        self.emit(RunEvent::new(RunEventType::PhaseEnter, format!("entering {}", phase)).with_phase(phase));
    }

    pub fn operation(&self, phase: Phase, operation: OperationId, function: &str) {
        self.emit(
            RunEvent::new(RunEventType::OperationInvoked, function.to_string())
                .with_phase(phase)
                .with_operation(operation),
        );
    }

    pub fn error_classified(
        &self,
        phase: Option<Phase>,
        operation: Option<OperationId>,
        kind: ErrorKind,
        accepted: bool,
        diagnostic: &str,
    ) {
        let mut event = RunEvent::new(
            RunEventType::ErrorClassified,
            format!(
                "{}{}",
                diagnostic,
                if accepted { " (accepted by contract)" } else { "" }
            ),
        )
        .with_error_kind(kind);
        if accepted {
            event = event.with_severity(AuditSeverity::Low);
        }
        if let Some(phase) = phase {
            event = event.with_phase(phase);
        }
        if let Some(operation) = operation {
            event = event.with_operation(operation);
        }
        self.emit(event);
    }

    /// Emit one event per journal entry
    pub fn transitions(&self, journal: &[Transition]) {
        for transition in journal {
            let event_type = match transition.action {
                TransitionAction::DoubleFreeBlocked => RunEventType::DoubleFreeBlocked,
                TransitionAction::Leak => RunEventType::HandleLeaked,
                _ => RunEventType::OwnershipTransition,
            };
            let mut event = RunEvent::new(
                event_type,
                format!(
                    "#{} {:?}: {:?} -> {:?}",
                    transition.seq, transition.action, transition.before, transition.after
                ),
            )
            .with_handle(transition.handle);
            if let Some(operation) = transition.operation {
                event = event.with_operation(operation);
            }
            self.emit(event);
        }
    }

    pub fn cleanup_start(&self, live: usize) {
        self.emit(
            RunEvent::new(
                RunEventType::CleanupStart,
                format!("draining {} live handles", live),
            )
            .with_phase(Phase::Cleanup),
        );
    }

    pub fn cleanup_release(&self, handle: HandleId, function: &str, freed: usize) {
        self.emit(
            RunEvent::new(
                RunEventType::CleanupRelease,
                format!("{} released {} handle(s)", function, freed),
            )
            .with_phase(Phase::Cleanup)
            .with_handle(handle),
        );
    }

    pub fn leaked(&self, handle: HandleId) {
        self.emit(
            RunEvent::new(RunEventType::HandleLeaked, format!("{} still live after cleanup", handle))
                .with_phase(Phase::Cleanup)
                .with_handle(handle)
                .with_error_kind(ErrorKind::Leak),
        );
    }
}
