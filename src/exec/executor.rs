/// Phase executor: drives one scripted run against a target library
///
/// Each run owns a private tracker, guarantor, aggregator and workspace, so a
/// `PhaseExecutor` can run several scripts in parallel. The forward phase
/// chain comes from the type-state in [`crate::exec::phase`]; this module
/// supplies what happens inside each phase.
use crate::config::config::HarnessConfig;
use crate::config::presets::CodeTable;
use crate::config::types::{
    ErrorKind, HarnessError, Phase, Result, RunError, RunOutcome,
};
use crate::config::validator::{validate_config, validate_script};
use crate::core::library::{invoke, Arg, NativeCall, TargetLibrary};
use crate::core::script::{Effect, ErrorContract, Input, Operation, OutputShape, Script};
use crate::core::types::{HandleId, HandleKind, NativeHandle, RawSignal, Value};
use crate::exec::phase::{PhaseBody, PhaseResult, Run};
use crate::exec::watchdog::Watchdog;
use crate::observability::audit::{AuditLogger, CorrelationIds, RunAudit};
use crate::observability::metrics::{get_metrics, MetricsRegistry};
use crate::ownership::graph::{HandleEntry, Owner};
use crate::ownership::tracker::{OwnershipTracker, OwnershipViolation, Transition, TrackerResult};
use crate::safety::cleanup::{CleanupGuarantor, TeardownReport};
use crate::safety::workspace::Workspace;
use crate::verdict::classifier::{Classification, ErrorClassifier, ExpectedShape};
use crate::verdict::record::{Aggregator, ValidationRecord};
use crate::verdict::verdict::{RunEvidence, Verdict, VerdictCause, VerdictClassifier};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Shared cancellation flag, checked between phases
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wall time spent in one phase
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub duration_ms: u64,
    /// Scripted operations attempted in the phase
    pub operations: usize,
}

/// Everything a finished run leaves behind
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub script: String,
    pub library: String,
    pub verdict: Verdict,
    /// Every recorded error, first one first
    pub errors: Vec<RunError>,
    pub record: ValidationRecord,
    /// SHA-256 of the record's canonical encoding
    pub record_digest: String,
    /// Ownership journal (empty when `keep_journal` is off)
    pub journal: Vec<Transition>,
    pub handles: Vec<HandleEntry>,
    pub leaked: Vec<HandleId>,
    pub teardown: TeardownReport,
    pub phases: Vec<PhaseTiming>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn outcome(&self) -> RunOutcome {
        self.verdict.outcome
    }

    /// First classified error, if the run failed
    pub fn error(&self) -> Option<&RunError> {
        self.verdict.error.as_ref()
    }

    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }

    pub fn is_success(&self) -> bool {
        self.verdict.is_success()
    }
}

/// Runs scripts through the five phases
pub struct PhaseExecutor {
    config: HarnessConfig,
    cancel: CancelToken,
    logger: Option<Arc<AuditLogger>>,
}

impl PhaseExecutor {
    /// Create an executor. The config is validated first; strict mode fails
    /// fast on errors.
    pub fn new(config: HarnessConfig) -> Result<Self> {
        let validation = validate_config(&config)?;
        for warning in &validation.warnings {
            warn!("Configuration warning: {}", warning);
        }

        let logger = match &config.audit_log {
            Some(path) => match AuditLogger::open(path) {
                Ok(logger) => Some(Arc::new(logger)),
                Err(e) => {
                    warn!(
                        "Audit log {} unavailable, falling back to the process log: {}",
                        path.display(),
                        e
                    );
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            config,
            cancel: CancelToken::new(),
            logger,
        })
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run `script` against `library` to a terminal state.
    ///
    /// `Err` is reserved for harness failures (invalid script in strict mode,
    /// workspace creation). Anything the library does ends up in the report.
    pub fn execute(&self, script: &Script, library: Box<dyn TargetLibrary>) -> Result<RunReport> {
        let validation = validate_script(script, self.config.strict_mode)?;
        for warning in &validation.warnings {
            warn!("Script '{}': {}", script.name, warning);
        }
        if !validation.is_valid() {
            warn!(
                "Script '{}' has {} validation error(s); running anyway",
                script.name,
                validation.errors.len()
            );
        }
        if library.name() != script.library {
            warn!(
                "Script '{}' targets '{}' but runs against '{}'",
                script.name,
                script.library,
                library.name()
            );
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let library_name = library.name().to_string();
        let workspace = Workspace::new(&self.config.workspace_root, run_id)?;
        let audit = RunAudit::new(
            CorrelationIds::new(run_id, &script.name, &library_name),
            self.logger.clone(),
        );
        let metrics = get_metrics();
        metrics.active_runs.inc();
        audit.run_start(script.operations.len());
        info!(
            "Run {} of '{}' against {} ({} operations)",
            run_id,
            script.name,
            library_name,
            script.operations.len()
        );

        let context = RunContext {
            script,
            config: &self.config,
            table: self.config.code_table(&library_name),
            library,
            tracker: OwnershipTracker::new(),
            guarantor: CleanupGuarantor::new(),
            aggregator: Aggregator::new(script.aggregation),
            bindings: HashMap::new(),
            errors: Vec::new(),
            workspace,
            audit,
            metrics: Arc::clone(&metrics),
            cancel: self.cancel.clone(),
            deadline: self.config.run_timeout().map(|limit| started + limit),
            timings: Vec::new(),
            teardown: TeardownReport::default(),
            journal_cursor: 0,
            verdict: None,
        };

        let done = Run::new(context)
            .begin()
            .initialize()
            .and_then(Run::configure)
            .and_then(Run::operate)
            .and_then(Run::validate)
            .into_cleanup()
            .finish();
        let outcome = done.outcome();
        let mut context = done.into_body();

        if let Err(e) = context.workspace.cleanup() {
            warn!("Run {}: workspace cleanup failed: {}", run_id, e);
        }

        let duration = started.elapsed();
        metrics.record_run(outcome, duration);
        metrics.record_ownership(context.tracker.journal());
        metrics.active_runs.dec();

        let verdict = context.verdict.take().unwrap_or(Verdict {
            outcome,
            cause: VerdictCause::Interrupted,
            error: context.errors.first().cloned(),
        });
        context
            .audit
            .run_end(outcome, verdict.exit_code(), verdict.error.as_ref().map(|e| e.kind));
        info!(
            "Run {} finished: {:?} ({:?}, exit {}) in {}ms",
            run_id,
            outcome,
            verdict.cause,
            verdict.exit_code(),
            duration.as_millis()
        );

        let RunContext {
            tracker,
            aggregator,
            errors,
            teardown,
            timings,
            ..
        } = context;
        let record = aggregator.finish();
        let record_digest = record.digest();
        let journal = if self.config.keep_journal {
            tracker.journal().to_vec()
        } else {
            Vec::new()
        };

        Ok(RunReport {
            run_id,
            script: script.name.clone(),
            library: library_name,
            verdict,
            errors,
            record,
            record_digest,
            journal,
            handles: tracker.entries().cloned().collect(),
            leaked: tracker.leaked(),
            teardown,
            phases: timings,
            started_at,
            duration_ms: duration.as_millis() as u64,
        })
    }

    /// Run entry point returning the process exit code: 66 on success, the
    /// classified code of the first error otherwise.
    pub fn run_entry(&self, script: &Script, library: Box<dyn TargetLibrary>) -> i32 {
        match self.execute(script, library) {
            Ok(report) => report.exit_code(),
            Err(e @ (HarnessError::Script(_) | HarnessError::Config(_))) => {
                warn!("Run of '{}' rejected: {}", script.name, e);
                i32::from(ErrorKind::InvalidArgument)
            }
            Err(e) => {
                warn!("Run of '{}' could not start: {}", script.name, e);
                i32::from(ErrorKind::Unknown)
            }
        }
    }
}

/// What a script binding names
#[derive(Clone, Debug)]
enum Binding {
    Handle(HandleId),
    Scalar(Value),
}

fn op_error(op: &Operation, kind: ErrorKind, diagnostic: impl Into<String>) -> RunError {
    RunError::new(kind, diagnostic)
        .with_operation(op.id(), op.name.as_str())
        .with_phase(op.phase)
}

fn invalid(detail: String) -> OwnershipViolation {
    OwnershipViolation {
        kind: ErrorKind::InvalidArgument,
        handle: None,
        detail,
    }
}

/// Per-run state carried through the phases
struct RunContext<'a> {
    script: &'a Script,
    config: &'a HarnessConfig,
    table: CodeTable,
    library: Box<dyn TargetLibrary>,
    tracker: OwnershipTracker,
    guarantor: CleanupGuarantor,
    aggregator: Aggregator,
    bindings: HashMap<String, Binding>,
    errors: Vec<RunError>,
    workspace: Workspace,
    audit: RunAudit,
    metrics: Arc<MetricsRegistry>,
    cancel: CancelToken,
    deadline: Option<Instant>,
    timings: Vec<PhaseTiming>,
    teardown: TeardownReport,
    journal_cursor: usize,
    verdict: Option<Verdict>,
}

impl<'a> RunContext<'a> {
    fn push_error(&mut self, error: RunError) {
        warn!("{}", error);
        self.metrics.record_error(error.kind);
        self.audit.error_classified(
            error.phase,
            error.operation,
            error.kind,
            false,
            &error.diagnostic,
        );
        self.errors.push(error);
    }

    /// Forward new journal entries to the audit trail.
    fn flush_journal(&mut self) {
        let journal = self.tracker.journal();
        if self.journal_cursor < journal.len() {
            self.audit.transitions(&journal[self.journal_cursor..]);
            self.journal_cursor = journal.len();
        }
    }

    fn bound_handle(&self, name: &str) -> TrackerResult<HandleId> {
        match self.bindings.get(name) {
            Some(Binding::Handle(id)) => Ok(*id),
            Some(Binding::Scalar(_)) => Err(invalid(format!(
                "'{}' is a scalar binding where a handle is required",
                name
            ))),
            None => Err(invalid(format!("handle binding '{}' is not bound", name))),
        }
    }

    /// Entry that can own things: live and not a reference.
    fn require_owner(&self, name: &str) -> TrackerResult<HandleId> {
        let id = self.bound_handle(name)?;
        let entry = self.tracker.resolve(id)?;
        if entry.is_reference() {
            return Err(OwnershipViolation {
                kind: ErrorKind::InvalidArgument,
                handle: Some(id),
                detail: format!("'{}' ({}) is a reference and cannot own handles", name, id),
            });
        }
        Ok(id)
    }

    /// First non-reference entry on a reference chain.
    fn owning_entry(&self, id: HandleId) -> HandleId {
        let mut cursor = id;
        for _ in 0..=self.tracker.len() {
            match self.tracker.get(cursor) {
                Some(entry) if entry.is_reference() => match entry.referent {
                    Some(next) => cursor = next,
                    None => break,
                },
                _ => break,
            }
        }
        cursor
    }

    fn resolve_inputs(&mut self, op: &Operation) -> TrackerResult<Vec<Arg>> {
        let mut args = Vec::with_capacity(op.inputs.len());
        for input in &op.inputs {
            let arg = match input {
                Input::Handle(name) => {
                    let id = self.bound_handle(name)?;
                    Arg::Handle(self.tracker.resolve(id)?.native)
                }
                Input::Literal(value) => Arg::Value(value.clone()),
                Input::Scalar(name) => match self.bindings.get(name) {
                    Some(Binding::Scalar(value)) => Arg::Value(value.clone()),
                    Some(Binding::Handle(_)) => {
                        return Err(invalid(format!(
                            "'{}' is a handle binding where a scalar is required",
                            name
                        )))
                    }
                    None => return Err(invalid(format!("scalar binding '{}' is not bound", name))),
                },
                Input::WorkspacePath(file) => {
                    let path = self
                        .workspace
                        .path_for(file)
                        .map_err(|e| invalid(e.to_string()))?;
                    Arg::Value(Value::Text(path.display().to_string()))
                }
            };
            args.push(arg);
        }
        Ok(args)
    }

    /// Validate the declared effect before the native call is made.
    fn precheck(&self, op: &Operation) -> TrackerResult<()> {
        match &op.effect {
            Effect::None => Ok(()),
            Effect::Produce { owner } => {
                if let Some(owner) = owner {
                    self.require_owner(owner)?;
                }
                Ok(())
            }
            Effect::ProduceReference { target, holder } => {
                self.tracker.resolve(self.bound_handle(target)?)?;
                if let Some(holder) = holder {
                    self.require_owner(holder)?;
                }
                Ok(())
            }
            Effect::Attach { child, parent } => {
                let child = self.bound_handle(child)?;
                let parent = self.bound_handle(parent)?;
                self.tracker.check_reparent(child, Some(Owner::Handle(parent)))
            }
            Effect::AttachReference { target, parent } => {
                self.tracker.resolve(self.bound_handle(target)?)?;
                self.require_owner(parent)?;
                Ok(())
            }
            Effect::Detach { child } => {
                let child = self.bound_handle(child)?;
                self.tracker.check_reparent(child, None)
            }
            Effect::DetachOutput { parent } => {
                self.tracker.resolve(self.bound_handle(parent)?)?;
                Ok(())
            }
            Effect::Replace {
                parent,
                replaced,
                replacement,
            } => {
                let parent = self.bound_handle(parent)?;
                let replacement = self.bound_handle(replacement)?;
                self.tracker
                    .check_reparent(replacement, Some(Owner::Handle(parent)))?;
                if let Some(replaced) = replaced {
                    let old = self.bound_handle(replaced)?;
                    let entry = self.tracker.resolve(old)?;
                    if entry.parent() != Some(parent) {
                        return Err(OwnershipViolation {
                            kind: ErrorKind::InvalidArgument,
                            handle: Some(old),
                            detail: format!("{} is not a child of {}", old, parent),
                        });
                    }
                }
                Ok(())
            }
            Effect::Release { handle, cascade } => {
                let id = self.bound_handle(handle)?;
                self.tracker.check_release(id, *cascade)
            }
            Effect::DropReference { handle } => {
                let id = self.bound_handle(handle)?;
                self.tracker.check_drop_reference(id)
            }
        }
    }

    /// Journal a refused second release through the tracker.
    fn block_double_free(&mut self, op: &Operation) {
        let blocked = match &op.effect {
            Effect::Release { handle, cascade } => self
                .bound_handle(handle)
                .map(|id| self.tracker.release(id, *cascade, Some(op.id())).map(|_| ())),
            Effect::DropReference { handle } => self
                .bound_handle(handle)
                .map(|id| self.tracker.drop_reference(id, Some(op.id()))),
            _ => return,
        };
        debug!("{} {}: release refused ({:?})", op.id(), op.name, blocked.is_err());
    }

    /// A failure of `op`: accepted by its contract (and recorded), or fatal.
    fn reject(
        &mut self,
        op: &Operation,
        kind: ErrorKind,
        diagnostic: String,
        raw: Option<RawSignal>,
    ) -> std::result::Result<(), RunError> {
        if op.contract.accepts(kind) {
            debug!("{} {}: {} accepted ({})", op.id(), op.name, kind, diagnostic);
            self.metrics.record_error(kind);
            self.audit
                .error_classified(Some(op.phase), Some(op.id()), kind, true, &diagnostic);
            if op.is_observed() {
                let predicate = match op.contract {
                    ErrorContract::ExpectFailure { .. } | ErrorContract::Discard => None,
                    _ => op.expect.clone(),
                };
                self.aggregator
                    .combine_error(op.id(), kind, diagnostic, predicate);
            }
            return Ok(());
        }
        if op.is_observed() {
            self.aggregator
                .combine_error(op.id(), kind, diagnostic.clone(), op.expect.clone());
        }
        let mut error = op_error(op, kind, diagnostic);
        if let Some(raw) = raw {
            error = error.with_raw(raw);
        }
        Err(error)
    }

    fn invoke_native(&mut self, op: &Operation, args: Vec<Arg>) -> RawSignal {
        let call = NativeCall::new(&op.name, op.capability, args);
        let timeout = self.config.op_timeout(op.timeout_ms);
        let started = Instant::now();
        let mut raw = match self.library.offload(&call) {
            Some(work) => Watchdog::new(&op.name).run(work, timeout),
            None => {
                let raw = invoke(self.library.as_mut(), &call);
                if started.elapsed() > timeout {
                    // Inline calls are not abandoned; a produced handle must
                    // still be tracked.
                    warn!(
                        "{} {} took {}ms (limit {}ms)",
                        op.id(),
                        op.name,
                        started.elapsed().as_millis(),
                        timeout.as_millis()
                    );
                }
                raw
            }
        };
        self.metrics.record_operation(started.elapsed());
        if matches!(raw, RawSignal::TimedOut { .. }) {
            self.metrics.watchdog_timeouts.inc();
        }
        if let RawSignal::Handle { native, kind } = &mut raw {
            if kind.is_none() && !native.is_null() {
                *kind = self.library.kind_of(*native);
            }
        }
        debug!("{} {} -> {}", op.id(), op.name, raw);
        raw
    }

    fn output_kind(&self, op: &Operation, raw: &RawSignal) -> HandleKind {
        match raw {
            RawSignal::Handle { kind: Some(kind), .. } => kind.clone(),
            _ => op
                .expected_kind()
                .cloned()
                .unwrap_or_else(|| HandleKind::new(format!("{}.handle", self.library.name()))),
        }
    }

    fn produced_native(op: &Operation, raw: &RawSignal) -> TrackerResult<NativeHandle> {
        raw.native_handle()
            .ok_or_else(|| invalid(format!("{} returned no handle to track", op.name)))
    }

    fn guard(&mut self, id: HandleId, owner: Option<HandleId>) -> TrackerResult<()> {
        let guard = self.guarantor.acquire(&self.tracker, id)?;
        self.guarantor.hold(guard, owner);
        Ok(())
    }

    /// Apply the ownership effect of a successful call. Returns the handle the
    /// effect produced, if any.
    fn apply_effect(&mut self, op: &Operation, raw: &RawSignal) -> TrackerResult<Option<HandleId>> {
        let op_id = Some(op.id());
        match &op.effect {
            Effect::None => Ok(None),
            Effect::Produce { owner } => {
                let native = Self::produced_native(op, raw)?;
                let kind = self.output_kind(op, raw);
                let parent = match owner {
                    Some(name) => Some(self.bound_handle(name)?),
                    None => None,
                };
                let owner = parent.map(Owner::Handle).unwrap_or(Owner::Root);
                let id = self.tracker.register(native, kind, owner, op_id)?;
                self.guard(id, parent)?;
                Ok(Some(id))
            }
            Effect::ProduceReference { target, holder } => {
                let native = Self::produced_native(op, raw)?;
                let kind = self.output_kind(op, raw);
                let target = self.bound_handle(target)?;
                let holder = match holder {
                    Some(name) => Some(self.bound_handle(name)?),
                    None => None,
                };
                let id = self.tracker.mark_reference(native, kind, target, holder, op_id)?;
                Ok(Some(id))
            }
            Effect::Attach { child, parent } => {
                let child = self.bound_handle(child)?;
                let parent = self.bound_handle(parent)?;
                self.tracker
                    .reparent(child, Some(Owner::Handle(parent)), op_id)?;
                self.guarantor.transfer(child, Some(parent));
                Ok(None)
            }
            Effect::AttachReference { target, parent } => {
                let target = self.bound_handle(target)?;
                let parent = self.bound_handle(parent)?;
                let entry = self.tracker.resolve(target)?;
                let (native, kind) = match raw.native_handle() {
                    Some(native) => (native, self.output_kind(op, raw)),
                    None => (entry.native, entry.kind.clone()),
                };
                let id = self
                    .tracker
                    .mark_reference(native, kind, target, Some(parent), op_id)?;
                Ok(Some(id))
            }
            Effect::Detach { child } => {
                let child = self.bound_handle(child)?;
                self.tracker.reparent(child, None, op_id)?;
                self.guarantor.transfer(child, None);
                Ok(None)
            }
            Effect::DetachOutput { parent } => {
                let native = Self::produced_native(op, raw)?;
                let parent = self.bound_handle(parent)?;
                let id = match self.tracker.lookup_native(native) {
                    Some(id) => id,
                    None => {
                        let kind = self.output_kind(op, raw);
                        let id =
                            self.tracker
                                .register(native, kind, Owner::Handle(parent), op_id)?;
                        self.guard(id, Some(parent))?;
                        id
                    }
                };
                self.tracker.reparent(id, None, op_id)?;
                self.guarantor.transfer(id, None);
                Ok(Some(id))
            }
            Effect::Replace {
                parent,
                replaced,
                replacement,
            } => {
                let parent = self.bound_handle(parent)?;
                let replacement = self.bound_handle(replacement)?;
                if let Some(replaced) = replaced {
                    let old = self.bound_handle(replaced)?;
                    self.tracker.reparent(old, None, op_id)?;
                    let freed = self.tracker.release(old, true, op_id)?;
                    self.guarantor.release(old);
                    debug!("{} replaced {} ({} freed)", op.name, old, freed.len());
                }
                self.tracker
                    .reparent(replacement, Some(Owner::Handle(parent)), op_id)?;
                self.guarantor.transfer(replacement, Some(parent));
                Ok(None)
            }
            Effect::Release { handle, cascade } => {
                let id = self.bound_handle(handle)?;
                let freed = self.tracker.release(id, *cascade, op_id)?;
                let disarmed = self.guarantor.release(id);
                debug!(
                    "{} released {} ({} freed, {} guards discharged)",
                    op.name,
                    id,
                    freed.len(),
                    disarmed
                );
                Ok(None)
            }
            Effect::DropReference { handle } => {
                let id = self.bound_handle(handle)?;
                self.tracker.drop_reference(id, op_id)?;
                Ok(None)
            }
        }
    }

    /// Handle output of a call with no producing effect: an existing owned
    /// entry, or a borrowed alias of the first handle input.
    fn adopt_output(&mut self, op: &Operation, raw: &RawSignal) -> TrackerResult<Option<HandleId>> {
        let native = match raw.native_handle() {
            Some(native) => native,
            None => return Ok(None),
        };
        if let Some(id) = self.tracker.lookup_native(native) {
            return Ok(Some(id));
        }
        let source = op.inputs.iter().find_map(|input| match input {
            Input::Handle(name) => Some(name.as_str()),
            _ => None,
        });
        let source = match source {
            Some(source) => self.bound_handle(source)?,
            None => {
                return Err(invalid(format!(
                    "{} returned untracked handle {} and has no handle input to borrow from",
                    op.name, native
                )))
            }
        };
        let holder = self.owning_entry(source);
        let kind = self.output_kind(op, raw);
        let id = self
            .tracker
            .mark_reference(native, kind, source, Some(holder), Some(op.id()))?;
        debug!("{} {}: {} borrowed from {}", op.id(), op.name, id, source);
        Ok(Some(id))
    }

    fn bind_output(&mut self, op: &Operation, raw: &RawSignal, produced: Option<HandleId>) -> TrackerResult<()> {
        let output = match &op.output {
            Some(output) => output,
            None => return Ok(()),
        };
        match output.shape {
            OutputShape::Handle { .. } => {
                let id = match produced {
                    Some(id) => Some(id),
                    None => self.adopt_output(op, raw)?,
                };
                match id {
                    Some(id) => {
                        self.bindings.insert(output.bind.clone(), Binding::Handle(id));
                    }
                    None => debug!("{} {}: no handle to bind as '{}'", op.id(), op.name, output.bind),
                }
            }
            OutputShape::Scalar { .. } => {
                self.bindings
                    .insert(output.bind.clone(), Binding::Scalar(raw.as_value()));
            }
        }
        Ok(())
    }

    fn run_operation(&mut self, phase: Phase, op: &Operation) -> std::result::Result<(), RunError> {
        self.audit.operation(phase, op.id(), &op.name);

        if let Err(v) = self.precheck(op) {
            if v.kind == ErrorKind::DoubleFree {
                self.block_double_free(op);
            }
            debug!("{} {}: refused before the call: {}", op.id(), op.name, v);
            return self.reject(op, v.kind, v.detail, None);
        }

        let args = match self.resolve_inputs(op) {
            Ok(args) => args,
            Err(v) => return self.reject(op, v.kind, v.detail, None),
        };

        let raw = self.invoke_native(op, args);
        let classification = {
            let shape = ExpectedShape::new(op.capability, &op.name, &self.table)
                .with_handle_kind(op.expected_kind())
                .with_value_type(op.expected_value_type())
                .absent_ok(op.may_be_absent);
            ErrorClassifier::classify(&raw, &shape)
        };

        if let Classification::Failure { kind, diagnostic } = classification {
            return self.reject(op, kind, diagnostic, Some(raw));
        }

        let produced = self
            .apply_effect(op, &raw)
            .map_err(|v| op_error(op, v.kind, v.detail).with_raw(raw.clone()))?;
        self.bind_output(op, &raw, produced)
            .map_err(|v| op_error(op, v.kind, v.detail).with_raw(raw.clone()))?;

        if op.is_observed() {
            let value = raw.as_value();
            let predicate = match op.contract {
                ErrorContract::Discard => None,
                _ => op.expect.clone(),
            };
            if !self
                .aggregator
                .combine(op.id(), value.clone(), predicate.clone())
            {
                let kind = match predicate.as_ref().and_then(|p| p.value_type()) {
                    Some(expected) if !expected.admits(value.value_type()) => {
                        ErrorKind::TypeMismatch
                    }
                    _ => ErrorKind::Unknown,
                };
                return Err(op_error(
                    op,
                    kind,
                    format!("{} returned {}, which fails {:?}", op.name, value, predicate),
                )
                .with_raw(raw));
            }
        }

        if op.contract.expects_failure() {
            return Err(op_error(
                op,
                ErrorKind::Unknown,
                format!("contract violated: {} was expected to fail but succeeded", op.name),
            )
            .with_raw(raw));
        }
        Ok(())
    }

    fn record_timing(&mut self, phase: Phase, started: Instant, operations: usize) {
        self.timings.push(PhaseTiming {
            phase,
            duration_ms: started.elapsed().as_millis() as u64,
            operations,
        });
    }
}

impl<'a> PhaseBody for RunContext<'a> {
    fn at_boundary(&mut self, next: Phase) -> PhaseResult {
        if self.cancel.is_cancelled() {
            self.push_error(
                RunError::new(ErrorKind::Unknown, format!("cancelled before {}", next))
                    .with_phase(next),
            );
            return PhaseResult::Abort;
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                let limit = self.config.run_timeout().unwrap_or(Duration::ZERO);
                self.push_error(
                    RunError::new(
                        ErrorKind::Timeout,
                        format!(
                            "run deadline of {}ms passed before {}",
                            limit.as_millis(),
                            next
                        ),
                    )
                    .with_phase(next),
                );
                return PhaseResult::Abort;
            }
        }
        self.audit.phase_enter(next);
        PhaseResult::Completed
    }

    fn run_phase(&mut self, phase: Phase) -> PhaseResult {
        let started = Instant::now();
        let script = self.script;
        let mut attempted = 0;
        let mut result = PhaseResult::Completed;

        for op in script.operations_in(phase) {
            attempted += 1;
            let outcome = self.run_operation(phase, op);
            self.flush_journal();
            if let Err(error) = outcome {
                self.push_error(error);
                result = PhaseResult::Abort;
                break;
            }
        }

        if result == PhaseResult::Completed && phase == Phase::Validate {
            let record = self.aggregator.snapshot();
            if let Some(error) =
                VerdictClassifier::check_signature(&record, script.expected_signature)
            {
                self.push_error(error);
                result = PhaseResult::Abort;
            }
        }

        self.record_timing(phase, started, attempted);
        result
    }

    fn run_cleanup(&mut self, aborted: bool) -> RunOutcome {
        let started = Instant::now();
        self.audit.phase_enter(Phase::Cleanup);
        let script = self.script;
        let mut attempted = 0;

        if aborted {
            info!("Skipping scripted cleanup after an aborted phase");
        } else {
            // Best effort: every scripted cleanup op runs.
            for op in script.operations_in(Phase::Cleanup) {
                attempted += 1;
                let outcome = self.run_operation(Phase::Cleanup, op);
                self.flush_journal();
                if let Err(error) = outcome {
                    self.push_error(error);
                }
            }
        }

        self.audit.cleanup_start(self.tracker.finalize().len());
        let report = self
            .guarantor
            .drain(&mut self.tracker, self.library.as_mut(), &self.table);
        for step in &report.steps {
            self.audit
                .cleanup_release(step.handle, &step.function, step.freed.len());
        }
        for survivor in self.tracker.finalize() {
            if self.tracker.mark_leaked(survivor, None) {
                self.audit.leaked(survivor);
            }
        }
        self.flush_journal();

        let leaked = self.tracker.leaked();
        let kinds: Vec<HandleKind> = leaked
            .iter()
            .filter_map(|id| self.tracker.get(*id).map(|e| e.kind.clone()))
            .collect();
        if let Some(error) = VerdictClassifier::leak_error(&leaked, &kinds) {
            self.push_error(error);
        }

        self.teardown = report;
        self.metrics.cleanup_duration.observe(started.elapsed());
        self.record_timing(Phase::Cleanup, started, attempted);

        let record = self.aggregator.snapshot();
        let verdict = VerdictClassifier::classify(&RunEvidence {
            errors: &self.errors,
            leaked: &leaked,
            record: &record,
        });
        let outcome = verdict.outcome;
        self.verdict = Some(verdict);
        outcome
    }
}
