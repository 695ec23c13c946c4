/// Run verdict derivation
///
/// The final outcome is a pure function of the run's evidence: the errors
/// recorded in order, the handles left Leaked after the drain and the
/// validation record. verdict = f(evidence); nothing else is consulted.
use crate::config::types::{ErrorKind, Phase, RunError, RunOutcome, EXIT_SUCCESS};
use crate::core::types::{HandleId, HandleKind};
use crate::verdict::record::ValidationRecord;
use serde::{Deserialize, Serialize};

/// Why the run ended the way it did
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictCause {
    Completed,
    /// A native result violated its operation's contract
    OperationFailed,
    /// Ownership rules were broken (double free, dangling reference)
    OwnershipViolation,
    /// A predicate or the expected signature did not hold
    ValidationFailed,
    /// Handles survived the cleanup drain
    Leaked,
    /// Cancellation or run deadline, raised at a phase boundary
    Interrupted,
}

/// Evidence collected by one run
#[derive(Debug, Clone, Copy)]
pub struct RunEvidence<'a> {
    pub errors: &'a [RunError],
    pub leaked: &'a [HandleId],
    pub record: &'a ValidationRecord,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub outcome: RunOutcome,
    pub cause: VerdictCause,
    /// First classified error, the one reported to the user
    pub error: Option<RunError>,
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    pub fn exit_code(&self) -> i32 {
        match (&self.error, self.outcome) {
            (Some(error), _) => error.exit_code(),
            (None, RunOutcome::Success) => EXIT_SUCCESS,
            (None, RunOutcome::Failure) => ErrorKind::Unknown.into(),
        }
    }
}

/// Verdict classifier - pure function over run evidence
pub struct VerdictClassifier;

impl VerdictClassifier {
    pub fn classify(evidence: &RunEvidence<'_>) -> Verdict {
        if let Some(first) = evidence.errors.first() {
            return Verdict {
                outcome: RunOutcome::Failure,
                cause: Self::cause_of(first),
                error: Some(first.clone()),
            };
        }

        if !evidence.leaked.is_empty() {
            return Verdict {
                outcome: RunOutcome::Failure,
                cause: VerdictCause::Leaked,
                error: Self::leak_error(evidence.leaked, &[]),
            };
        }

        // A failed check always fails the run, even if nothing raised it.
        if let Some(failed) = evidence.record.failed_checks().next() {
            return Verdict {
                outcome: RunOutcome::Failure,
                cause: VerdictCause::ValidationFailed,
                error: Some(
                    RunError::new(
                        ErrorKind::Unknown,
                        format!("check #{} on {} failed", failed.index, failed.operation),
                    )
                    .with_phase(Phase::Validate),
                ),
            };
        }

        Verdict {
            outcome: RunOutcome::Success,
            cause: VerdictCause::Completed,
            error: None,
        }
    }

    fn cause_of(error: &RunError) -> VerdictCause {
        match error.kind {
            ErrorKind::Leak => VerdictCause::Leaked,
            ErrorKind::DoubleFree | ErrorKind::DanglingReference => {
                VerdictCause::OwnershipViolation
            }
            _ if error.operation.is_some() => VerdictCause::OperationFailed,
            _ if error.phase == Some(Phase::Validate) => VerdictCause::ValidationFailed,
            _ => VerdictCause::Interrupted,
        }
    }

    /// Leak error naming every handle that survived the drain.
    pub fn leak_error(leaked: &[HandleId], kinds: &[HandleKind]) -> Option<RunError> {
        if leaked.is_empty() {
            return None;
        }
        let names: Vec<String> = leaked
            .iter()
            .enumerate()
            .map(|(i, id)| match kinds.get(i) {
                Some(kind) => format!("{} ({})", id, kind),
                None => id.to_string(),
            })
            .collect();
        Some(
            RunError::new(
                ErrorKind::Leak,
                format!(
                    "{} handle(s) still live after cleanup: {}",
                    leaked.len(),
                    names.join(", ")
                ),
            )
            .with_phase(Phase::Cleanup),
        )
    }

    /// Compare the folded signature against the script's expectation.
    pub fn check_signature(record: &ValidationRecord, expected: Option<u64>) -> Option<RunError> {
        let expected = expected?;
        match record.signature {
            Some(actual) if actual == expected => None,
            Some(actual) => Some(
                RunError::new(
                    ErrorKind::Unknown,
                    format!(
                        "signature mismatch: expected {:#x}, got {:#x}",
                        expected, actual
                    ),
                )
                .with_phase(Phase::Validate),
            ),
            None => Some(
                RunError::new(
                    ErrorKind::Unknown,
                    "expected signature declared but the run does not fold observations",
                )
                .with_phase(Phase::Validate),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::Predicate;
    use crate::core::types::{OperationId, RawSignal, Value};
    use crate::verdict::record::{AggregationMode, Aggregator, FoldOp, FoldWidth};

    fn empty_record() -> ValidationRecord {
        Aggregator::new(AggregationMode::OrderedRecord).finish()
    }

    #[test]
    fn test_clean_run_is_success() {
        let record = empty_record();
        let verdict = VerdictClassifier::classify(&RunEvidence {
            errors: &[],
            leaked: &[],
            record: &record,
        });
        assert!(verdict.is_success());
        assert_eq!(verdict.exit_code(), EXIT_SUCCESS);
        assert_eq!(verdict.cause, VerdictCause::Completed);
    }

    #[test]
    fn test_first_error_is_reported() {
        let record = empty_record();
        let errors = vec![
            RunError::new(ErrorKind::ParseFailure, "bad input")
                .with_operation(OperationId(2), "cJSON_Parse")
                .with_raw(RawSignal::ParseError {
                    offset: 3,
                    message: "eof".to_string(),
                }),
            RunError::new(ErrorKind::Leak, "later"),
        ];
        let verdict = VerdictClassifier::classify(&RunEvidence {
            errors: &errors,
            leaked: &[],
            record: &record,
        });
        assert_eq!(verdict.outcome, RunOutcome::Failure);
        assert_eq!(verdict.cause, VerdictCause::OperationFailed);
        assert_eq!(verdict.exit_code(), 74);
    }

    #[test]
    fn test_leaked_handles_fail_the_run() {
        let record = empty_record();
        let leaked = [HandleId(3)];
        let verdict = VerdictClassifier::classify(&RunEvidence {
            errors: &[],
            leaked: &leaked,
            record: &record,
        });
        assert_eq!(verdict.cause, VerdictCause::Leaked);
        assert_eq!(verdict.error.unwrap().kind, ErrorKind::Leak);
    }

    #[test]
    fn test_failed_check_without_error_still_fails() {
        let mut agg = Aggregator::new(AggregationMode::OrderedRecord);
        agg.combine(OperationId(1), Value::Int(1), Some(Predicate::Equals(Value::Int(2))));
        let record = agg.finish();
        let verdict = VerdictClassifier::classify(&RunEvidence {
            errors: &[],
            leaked: &[],
            record: &record,
        });
        assert_eq!(verdict.cause, VerdictCause::ValidationFailed);
    }

    #[test]
    fn test_signature_check() {
        let mut agg = Aggregator::new(AggregationMode::FoldedChecksum {
            op: FoldOp::Xor,
            width: FoldWidth::W32,
        });
        agg.combine(OperationId(1), Value::Int(0x0f), None);
        let record = agg.finish();
        assert!(VerdictClassifier::check_signature(&record, Some(0x0f)).is_none());
        assert!(VerdictClassifier::check_signature(&record, None).is_none());
        let err = VerdictClassifier::check_signature(&record, Some(1)).unwrap();
        assert!(err.diagnostic.contains("0xf"));
    }
}
