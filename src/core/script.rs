/// Scripted call sequences
///
/// A script is plain data: an ordered list of operations against one target
/// library, each tagged with its phase, its ownership effect and the error
/// contract its result must satisfy. Scripts load from JSON or are built in
/// code through the builder methods on [`Script`] and [`Operation`].
use crate::config::types::{ErrorKind, HarnessError, Phase, Result};
use crate::core::types::{HandleKind, OperationId, Value, ValueType};
use crate::verdict::record::AggregationMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Capability class of a native call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Create,
    Mutate,
    Query,
    Destroy,
}

/// One positional argument of an operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Input {
    /// A handle bound by an earlier operation
    Handle(String),
    /// A literal value
    Literal(Value),
    /// A scalar bound by an earlier operation
    Scalar(String),
    /// A file name resolved inside the run-scoped workspace
    WorkspacePath(String),
}

/// Expected shape of an operation's result
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    Handle {
        kind: HandleKind,
    },
    Scalar {
        #[serde(default)]
        value_type: Option<ValueType>,
    },
}

/// Named binding for an operation's result
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub bind: String,
    pub shape: OutputShape,
}

fn default_cascade() -> bool {
    true
}

/// Ownership effect of a successful operation
///
/// Binding names refer to handle bindings; `owner: None` means the run root.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    #[default]
    None,
    /// The output is a new owned handle.
    Produce {
        #[serde(default)]
        owner: Option<String>,
    },
    /// The output is a non-owning alias of `target`.
    ProduceReference {
        target: String,
        #[serde(default)]
        holder: Option<String>,
    },
    /// `child` becomes owned by `parent`.
    Attach { child: String, parent: String },
    /// `parent` gains a non-owning alias of `target`.
    AttachReference { target: String, parent: String },
    /// `child` is taken out of its parent.
    Detach { child: String },
    /// The output is a child detached from `parent`.
    DetachOutput { parent: String },
    /// `replacement` takes the place of `replaced` (freed natively) in `parent`.
    Replace {
        parent: String,
        #[serde(default)]
        replaced: Option<String>,
        replacement: String,
    },
    /// `handle` is destroyed, with its owned subtree when `cascade` is set.
    Release {
        handle: String,
        #[serde(default = "default_cascade")]
        cascade: bool,
    },
    /// A reference handle is dropped; its referent is untouched.
    DropReference { handle: String },
}

impl Effect {
    pub fn produce() -> Self {
        Effect::Produce { owner: None }
    }

    pub fn produce_under(owner: &str) -> Self {
        Effect::Produce {
            owner: Some(owner.to_string()),
        }
    }

    pub fn reference_to(target: &str) -> Self {
        Effect::ProduceReference {
            target: target.to_string(),
            holder: None,
        }
    }

    pub fn attach(child: &str, parent: &str) -> Self {
        Effect::Attach {
            child: child.to_string(),
            parent: parent.to_string(),
        }
    }

    pub fn attach_reference(target: &str, parent: &str) -> Self {
        Effect::AttachReference {
            target: target.to_string(),
            parent: parent.to_string(),
        }
    }

    pub fn detach(child: &str) -> Self {
        Effect::Detach {
            child: child.to_string(),
        }
    }

    pub fn detach_output(parent: &str) -> Self {
        Effect::DetachOutput {
            parent: parent.to_string(),
        }
    }

    pub fn release(handle: &str) -> Self {
        Effect::Release {
            handle: handle.to_string(),
            cascade: true,
        }
    }

    pub fn drop_reference(handle: &str) -> Self {
        Effect::DropReference {
            handle: handle.to_string(),
        }
    }

    /// Handle bindings the effect reads (not the ones it creates).
    pub fn referenced_bindings(&self) -> Vec<&str> {
        match self {
            Effect::None => vec![],
            Effect::Produce { owner } => owner.iter().map(String::as_str).collect(),
            Effect::ProduceReference { target, holder } => {
                let mut names = vec![target.as_str()];
                names.extend(holder.iter().map(String::as_str));
                names
            }
            Effect::Attach { child, parent } => vec![child.as_str(), parent.as_str()],
            Effect::AttachReference { target, parent } => vec![target.as_str(), parent.as_str()],
            Effect::Detach { child } => vec![child.as_str()],
            Effect::DetachOutput { parent } => vec![parent.as_str()],
            Effect::Replace {
                parent,
                replaced,
                replacement,
            } => {
                let mut names = vec![parent.as_str(), replacement.as_str()];
                names.extend(replaced.iter().map(String::as_str));
                names
            }
            Effect::Release { handle, .. } | Effect::DropReference { handle } => {
                vec![handle.as_str()]
            }
        }
    }

    /// Whether the effect needs the operation to return a handle.
    pub fn needs_handle_output(&self) -> bool {
        matches!(
            self,
            Effect::Produce { .. } | Effect::ProduceReference { .. } | Effect::DetachOutput { .. }
        )
    }
}

/// Declared error contract of an operation
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorContract {
    /// Any classified failure fails the run.
    #[default]
    Required,
    /// Listed kinds are recorded and the run continues. An empty list means
    /// the recoverable set (not found, parse failure, unsupported).
    Tolerate {
        #[serde(default)]
        kinds: Vec<ErrorKind>,
    },
    /// The operation must fail with one of the listed kinds (any non-fatal
    /// kind when empty). Success is a contract violation.
    ExpectFailure {
        #[serde(default)]
        kinds: Vec<ErrorKind>,
    },
    /// The result is accepted as benign whatever it is, and still recorded.
    Discard,
}

impl ErrorContract {
    pub fn tolerate(kinds: &[ErrorKind]) -> Self {
        ErrorContract::Tolerate {
            kinds: kinds.to_vec(),
        }
    }

    pub fn expect_failure(kinds: &[ErrorKind]) -> Self {
        ErrorContract::ExpectFailure {
            kinds: kinds.to_vec(),
        }
    }

    /// Whether a failure of `kind` is an accepted outcome under this contract.
    /// Fatal kinds are never accepted.
    pub fn accepts(&self, kind: ErrorKind) -> bool {
        if kind.is_fatal() {
            return false;
        }
        match self {
            ErrorContract::Required => false,
            ErrorContract::Tolerate { kinds } if kinds.is_empty() => kind.is_recoverable(),
            ErrorContract::Tolerate { kinds } => kinds.contains(&kind),
            ErrorContract::ExpectFailure { kinds } if kinds.is_empty() => true,
            ErrorContract::ExpectFailure { kinds } => kinds.contains(&kind),
            ErrorContract::Discard => true,
        }
    }

    pub fn expects_failure(&self) -> bool {
        matches!(self, ErrorContract::ExpectFailure { .. })
    }

    /// Kinds named explicitly by the contract.
    pub fn listed_kinds(&self) -> &[ErrorKind] {
        match self {
            ErrorContract::Tolerate { kinds } | ErrorContract::ExpectFailure { kinds } => kinds,
            _ => &[],
        }
    }
}

/// Expected predicate over an observed value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Equals(Value),
    NotEquals(Value),
    NonNull,
    Truthy,
    Falsy,
    InRange { min: f64, max: f64 },
}

impl Predicate {
    pub fn evaluate(&self, observed: &Value) -> bool {
        match self {
            Predicate::Equals(expected) => observed.loosely_equals(expected),
            Predicate::NotEquals(expected) => !observed.loosely_equals(expected),
            Predicate::NonNull => !matches!(observed, Value::Null),
            Predicate::Truthy => observed.is_truthy(),
            Predicate::Falsy => !observed.is_truthy(),
            Predicate::InRange { min, max } => observed
                .as_f64()
                .map(|v| v >= *min && v <= *max)
                .unwrap_or(false),
        }
    }

    /// Value type the predicate compares against, if it pins one.
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Predicate::Equals(v) | Predicate::NotEquals(v) => match v.value_type() {
                ValueType::Int | ValueType::Float => Some(ValueType::Number),
                other => Some(other),
            },
            Predicate::InRange { .. } => Some(ValueType::Number),
            _ => None,
        }
    }
}

/// A single scripted native call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub id: Option<OperationId>,
    /// Native function name
    pub name: String,
    pub phase: Phase,
    pub capability: Capability,
    #[serde(default)]
    pub inputs: Vec<Input>,
    #[serde(default)]
    pub output: Option<Output>,
    #[serde(default)]
    pub effect: Effect,
    #[serde(default)]
    pub contract: ErrorContract,
    #[serde(default)]
    pub expect: Option<Predicate>,
    /// Record the result as an observation even without a predicate
    #[serde(default)]
    pub record: bool,
    /// A NULL result is a legitimate "absent" answer
    #[serde(default)]
    pub may_be_absent: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Operation {
    pub fn new(phase: Phase, capability: Capability, name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            phase,
            capability,
            inputs: Vec::new(),
            output: None,
            effect: Effect::None,
            contract: ErrorContract::Required,
            expect: None,
            record: false,
            may_be_absent: false,
            timeout_ms: None,
        }
    }

    pub fn create(phase: Phase, name: &str) -> Self {
        Self::new(phase, Capability::Create, name)
    }

    pub fn mutate(phase: Phase, name: &str) -> Self {
        Self::new(phase, Capability::Mutate, name)
    }

    pub fn query(phase: Phase, name: &str) -> Self {
        Self::new(phase, Capability::Query, name)
    }

    pub fn destroy(phase: Phase, name: &str) -> Self {
        Self::new(phase, Capability::Destroy, name)
    }

    /// Operation id; zero until the owning script numbers it.
    pub fn id(&self) -> OperationId {
        self.id.unwrap_or(OperationId(0))
    }

    pub fn handle(mut self, binding: &str) -> Self {
        self.inputs.push(Input::Handle(binding.to_string()));
        self
    }

    pub fn literal(mut self, value: impl Into<Value>) -> Self {
        self.inputs.push(Input::Literal(value.into()));
        self
    }

    pub fn scalar(mut self, binding: &str) -> Self {
        self.inputs.push(Input::Scalar(binding.to_string()));
        self
    }

    pub fn workspace_path(mut self, file: &str) -> Self {
        self.inputs.push(Input::WorkspacePath(file.to_string()));
        self
    }

    pub fn bind_handle(mut self, name: &str, kind: &str) -> Self {
        self.output = Some(Output {
            bind: name.to_string(),
            shape: OutputShape::Handle {
                kind: HandleKind::new(kind),
            },
        });
        self
    }

    pub fn bind_scalar(mut self, name: &str, value_type: Option<ValueType>) -> Self {
        self.output = Some(Output {
            bind: name.to_string(),
            shape: OutputShape::Scalar { value_type },
        });
        self
    }

    pub fn effect(mut self, effect: Effect) -> Self {
        self.effect = effect;
        self
    }

    /// Shorthand for a root-owned handle output.
    pub fn owned(self) -> Self {
        self.effect(Effect::produce())
    }

    pub fn contract(mut self, contract: ErrorContract) -> Self {
        self.contract = contract;
        self
    }

    pub fn discard(self) -> Self {
        self.contract(ErrorContract::Discard)
    }

    pub fn expect(mut self, predicate: Predicate) -> Self {
        self.expect = Some(predicate);
        self
    }

    pub fn record(mut self) -> Self {
        self.record = true;
        self
    }

    pub fn may_be_absent(mut self) -> Self {
        self.may_be_absent = true;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Expected handle kind of the output, if the output is a handle.
    pub fn expected_kind(&self) -> Option<&HandleKind> {
        match &self.output {
            Some(Output {
                shape: OutputShape::Handle { kind },
                ..
            }) => Some(kind),
            _ => None,
        }
    }

    /// Expected scalar type of the output, if pinned.
    pub fn expected_value_type(&self) -> Option<ValueType> {
        match &self.output {
            Some(Output {
                shape: OutputShape::Scalar { value_type },
                ..
            }) => *value_type,
            _ => None,
        }
    }

    /// Whether the result goes into the validation record.
    pub fn is_observed(&self) -> bool {
        self.record
            || self.expect.is_some()
            || matches!(self.contract, ErrorContract::Discard)
            || self.capability == Capability::Query
    }

    /// Handle and scalar bindings this operation reads as inputs.
    pub fn input_bindings(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(|input| match input {
            Input::Handle(name) | Input::Scalar(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

/// A scripted run against one target library
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub name: String,
    /// Registered target library name
    pub library: String,
    #[serde(default)]
    pub aggregation: AggregationMode,
    /// Expected folded signature (folded aggregation only)
    #[serde(default)]
    pub expected_signature: Option<u64>,
    pub operations: Vec<Operation>,
}

impl Script {
    pub fn new(name: &str, library: &str) -> Self {
        Self {
            name: name.to_string(),
            library: library.to_string(),
            aggregation: AggregationMode::default(),
            expected_signature: None,
            operations: Vec::new(),
        }
    }

    pub fn with_aggregation(mut self, mode: AggregationMode) -> Self {
        self.aggregation = mode;
        self
    }

    pub fn with_expected_signature(mut self, signature: u64) -> Self {
        self.expected_signature = Some(signature);
        self
    }

    /// Append an operation, numbering it by position when it has no id.
    pub fn op(mut self, mut operation: Operation) -> Self {
        if operation.id.is_none() {
            operation.id = Some(OperationId(self.operations.len() as u32 + 1));
        }
        self.operations.push(operation);
        self
    }

    /// Number every unnumbered operation by its 1-based position.
    pub fn normalized(mut self) -> Self {
        for (idx, operation) in self.operations.iter_mut().enumerate() {
            if operation.id.is_none() {
                operation.id = Some(OperationId(idx as u32 + 1));
            }
        }
        self
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let script: Script = serde_json::from_str(text)
            .map_err(|e| HarnessError::Script(format!("Failed to parse script: {}", e)))?;
        Ok(script.normalized())
    }

    /// Load a script from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Script(format!("Failed to read script {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Operations of one phase, in script order.
    pub fn operations_in(&self, phase: Phase) -> impl Iterator<Item = &Operation> {
        self.operations.iter().filter(move |op| op.phase == phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_never_accepts_fatal_kinds() {
        let contracts = [
            ErrorContract::Required,
            ErrorContract::tolerate(&[]),
            ErrorContract::tolerate(&[ErrorKind::DoubleFree]),
            ErrorContract::expect_failure(&[]),
            ErrorContract::Discard,
        ];
        for contract in &contracts {
            assert!(!contract.accepts(ErrorKind::DoubleFree));
            assert!(!contract.accepts(ErrorKind::Leak));
            assert!(!contract.accepts(ErrorKind::DanglingReference));
        }
    }

    #[test]
    fn test_default_tolerance_is_recoverable_set() {
        let contract = ErrorContract::tolerate(&[]);
        assert!(contract.accepts(ErrorKind::NotFound));
        assert!(contract.accepts(ErrorKind::ParseFailure));
        assert!(contract.accepts(ErrorKind::Unsupported));
        assert!(!contract.accepts(ErrorKind::InvalidArgument));
        assert!(!ErrorContract::Required.accepts(ErrorKind::NotFound));
    }

    #[test]
    fn test_script_builder_numbers_operations() {
        let script = Script::new("demo", "cjson")
            .op(Operation::create(Phase::Configure, "cJSON_CreateObject")
                .bind_handle("root", "json.object")
                .owned())
            .op(Operation::destroy(Phase::Cleanup, "cJSON_Delete")
                .handle("root")
                .effect(Effect::release("root")));
        assert_eq!(script.operations[0].id(), OperationId(1));
        assert_eq!(script.operations[1].id(), OperationId(2));
        assert_eq!(script.operations_in(Phase::Cleanup).count(), 1);
    }

    #[test]
    fn test_script_json_shape() {
        let text = r#"{
            "name": "parse",
            "library": "cjson",
            "operations": [
                {"name": "cJSON_Parse", "phase": "configure", "capability": "create",
                 "inputs": [{"literal": "{\"a\": 1}"}],
                 "output": {"bind": "doc", "shape": {"handle": {"kind": "json"}}},
                 "effect": {"produce": {}}},
                {"name": "cJSON_GetObjectItem", "phase": "operate", "capability": "query",
                 "inputs": [{"handle": "doc"}, {"literal": "b"}],
                 "contract": {"tolerate": {}}, "may_be_absent": true},
                {"name": "cJSON_Delete", "phase": "cleanup", "capability": "destroy",
                 "inputs": [{"handle": "doc"}], "effect": {"release": {"handle": "doc"}}}
            ]
        }"#;
        let script = Script::from_json(text).unwrap();
        assert_eq!(script.operations.len(), 3);
        assert_eq!(script.operations[0].effect, Effect::Produce { owner: None });
        assert_eq!(script.operations[1].contract, ErrorContract::tolerate(&[]));
        assert_eq!(
            script.operations[2].effect,
            Effect::Release {
                handle: "doc".to_string(),
                cascade: true
            }
        );
        assert_eq!(script.operations[2].id(), OperationId(3));
        assert_eq!(script.aggregation, AggregationMode::OrderedRecord);
    }

    #[test]
    fn test_predicate_evaluation() {
        assert!(Predicate::Equals(Value::Int(3)).evaluate(&Value::Float(3.0)));
        assert!(Predicate::NonNull.evaluate(&Value::Int(0)));
        assert!(!Predicate::NonNull.evaluate(&Value::Null));
        assert!(Predicate::InRange { min: 1.0, max: 2.0 }.evaluate(&Value::Float(1.5)));
        assert!(!Predicate::Truthy.evaluate(&Value::Bool(false)));
    }
}
