/// Validation record and checksum aggregation
///
/// Two modes:
/// - ordered record: every observation is appended with its index; identical
///   inputs reproduce a byte-identical record (same digest).
/// - folded checksum: observations reduce to one fixed-width word with XOR or
///   wrapping addition. Both operators are commutative and associative, so the
///   signature depends only on the multiset of observations, not their order.
///
/// `combine` never fails. A value that could not be computed is stored as a
/// classified error entry and contributes nothing to the fold.
use crate::config::types::ErrorKind;
use crate::core::script::Predicate;
use crate::core::types::{OperationId, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fold operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoldOp {
    Xor,
    Add,
}

/// Fold width in bits
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FoldWidth {
    #[serde(rename = "32")]
    W32,
    #[serde(rename = "64")]
    W64,
}

impl FoldWidth {
    fn mask(self) -> u64 {
        match self {
            FoldWidth::W32 => u32::MAX as u64,
            FoldWidth::W64 => u64::MAX,
        }
    }
}

/// Aggregation mode of a run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AggregationMode {
    #[default]
    OrderedRecord,
    FoldedChecksum { op: FoldOp, width: FoldWidth },
}

/// What was observed for one operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Observed {
    Value(Value),
    Error { kind: ErrorKind, diagnostic: String },
}

/// One record entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub index: usize,
    pub operation: OperationId,
    pub observed: Observed,
    pub predicate: Option<Predicate>,
    /// None when there was no predicate to check
    pub passed: Option<bool>,
}

/// Per-run validation record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub mode: AggregationMode,
    pub entries: Vec<Observation>,
    /// Folded signature (folded mode only)
    pub signature: Option<u64>,
}

impl ValidationRecord {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries whose predicate failed
    pub fn failed_checks(&self) -> impl Iterator<Item = &Observation> {
        self.entries.iter().filter(|e| e.passed == Some(false))
    }

    /// Entries that hold a classified error instead of a value
    pub fn error_entries(&self) -> impl Iterator<Item = &Observation> {
        self.entries
            .iter()
            .filter(|e| matches!(e.observed, Observed::Error { .. }))
    }

    pub fn passed(&self) -> bool {
        self.failed_checks().next().is_none()
    }

    /// Canonical byte encoding of the record
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// SHA-256 of the canonical encoding
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Fold word of a value: bool 0/1, integers two's complement, floats
/// truncated toward zero, text and bytes by the first 8 bytes of their SHA-256.
pub fn fold_word(value: &Value) -> u64 {
    match value {
        Value::Null => 0,
        Value::Bool(b) => *b as u64,
        Value::Int(v) => *v as u64,
        Value::Float(v) => {
            if v.is_finite() {
                v.trunc() as i64 as u64
            } else {
                0
            }
        }
        Value::Text(s) => digest_word(s.as_bytes()),
        Value::Bytes(b) => digest_word(b),
    }
}

fn digest_word(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(word)
}

/// Accumulates observations for one run
#[derive(Debug)]
pub struct Aggregator {
    mode: AggregationMode,
    entries: Vec<Observation>,
    accumulator: u64,
}

impl Aggregator {
    pub fn new(mode: AggregationMode) -> Self {
        Self {
            mode,
            entries: Vec::new(),
            accumulator: 0,
        }
    }

    pub fn mode(&self) -> AggregationMode {
        self.mode
    }

    /// Combine an observed value. Returns whether the predicate (if any) passed.
    pub fn combine(
        &mut self,
        operation: OperationId,
        value: Value,
        predicate: Option<Predicate>,
    ) -> bool {
        let passed = predicate.as_ref().map(|p| p.evaluate(&value));
        if let AggregationMode::FoldedChecksum { op, width } = self.mode {
            let word = fold_word(&value) & width.mask();
            self.accumulator = match op {
                FoldOp::Xor => self.accumulator ^ word,
                FoldOp::Add => self.accumulator.wrapping_add(word),
            } & width.mask();
        }
        self.push(operation, Observed::Value(value), predicate, passed);
        passed.unwrap_or(true)
    }

    /// Record a value that could not be computed.
    pub fn combine_error(
        &mut self,
        operation: OperationId,
        kind: ErrorKind,
        diagnostic: impl Into<String>,
        predicate: Option<Predicate>,
    ) {
        let passed = predicate.as_ref().map(|_| false);
        self.push(
            operation,
            Observed::Error {
                kind,
                diagnostic: diagnostic.into(),
            },
            predicate,
            passed,
        );
    }

    fn push(
        &mut self,
        operation: OperationId,
        observed: Observed,
        predicate: Option<Predicate>,
        passed: Option<bool>,
    ) {
        let index = self.entries.len();
        self.entries.push(Observation {
            index,
            operation,
            observed,
            predicate,
            passed,
        });
    }

    /// Current signature (folded mode only)
    pub fn signature(&self) -> Option<u64> {
        match self.mode {
            AggregationMode::OrderedRecord => None,
            AggregationMode::FoldedChecksum { .. } => Some(self.accumulator),
        }
    }

    /// Snapshot of the record so far
    pub fn snapshot(&self) -> ValidationRecord {
        ValidationRecord {
            mode: self.mode,
            entries: self.entries.clone(),
            signature: self.signature(),
        }
    }

    pub fn finish(self) -> ValidationRecord {
        let signature = self.signature();
        ValidationRecord {
            mode: self.mode,
            entries: self.entries,
            signature,
        }
    }
}
