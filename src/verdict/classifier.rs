/// Error classification
///
/// Maps every raw native signal onto the closed error taxonomy. The classifier
/// is a pure function of (signal, expected shape, code table): no state, no
/// panics, and the raw value is always preserved in the diagnostic.
use crate::config::presets::CodeTable;
use crate::config::types::ErrorKind;
use crate::core::script::Capability;
use crate::core::types::{HandleKind, RawSignal, ValueType};
use serde::{Deserialize, Serialize};

/// What the calling operation expects back
#[derive(Debug, Clone, Copy)]
pub struct ExpectedShape<'a> {
    pub capability: Capability,
    pub function: &'a str,
    /// Expected kind when the operation binds a handle
    pub handle_kind: Option<&'a HandleKind>,
    /// Expected scalar type when the operation binds a value
    pub value_type: Option<ValueType>,
    /// NULL is a legitimate "absent" answer
    pub may_be_absent: bool,
    pub table: &'a CodeTable,
}

impl<'a> ExpectedShape<'a> {
    pub fn new(capability: Capability, function: &'a str, table: &'a CodeTable) -> Self {
        Self {
            capability,
            function,
            handle_kind: None,
            value_type: None,
            may_be_absent: false,
            table,
        }
    }

    pub fn with_handle_kind(mut self, kind: Option<&'a HandleKind>) -> Self {
        self.handle_kind = kind;
        self
    }

    pub fn with_value_type(mut self, value_type: Option<ValueType>) -> Self {
        self.value_type = value_type;
        self
    }

    pub fn absent_ok(mut self, may_be_absent: bool) -> Self {
        self.may_be_absent = may_be_absent;
        self
    }
}

/// Outcome of classifying one signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Success,
    Failure { kind: ErrorKind, diagnostic: String },
}

impl Classification {
    fn failure(kind: ErrorKind, diagnostic: String) -> Self {
        Classification::Failure { kind, diagnostic }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Classification::Success => None,
            Classification::Failure { kind, .. } => Some(*kind),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Classification::Success)
    }

    /// `(kind, diagnostic)` for failures.
    pub fn as_failure(&self) -> Option<(ErrorKind, &str)> {
        match self {
            Classification::Success => None,
            Classification::Failure { kind, diagnostic } => Some((*kind, diagnostic.as_str())),
        }
    }
}

/// Error classifier - pure function over a raw signal
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify a raw native signal against the shape the operation expects
    pub fn classify(raw: &RawSignal, shape: &ExpectedShape<'_>) -> Classification {
        match raw {
            RawSignal::Code(code) => Self::classify_code(*code, shape),
            RawSignal::Handle { native, kind } => {
                if native.is_null() {
                    Self::classify_null(shape)
                } else {
                    Self::classify_handle(kind.as_ref(), shape, raw)
                }
            }
            RawSignal::Bool(value) => Self::classify_bool(*value, shape),
            RawSignal::Value(value) => {
                if shape.handle_kind.is_some() {
                    return Classification::failure(
                        ErrorKind::TypeMismatch,
                        format!(
                            "{} returned value {} where a handle was expected",
                            shape.function, value
                        ),
                    );
                }
                Self::check_value_type(value.value_type(), shape, raw)
            }
            RawSignal::Void => {
                if shape.handle_kind.is_some() || shape.value_type.is_some() {
                    return Classification::failure(
                        ErrorKind::TypeMismatch,
                        format!("{} returned nothing where a result was expected", shape.function),
                    );
                }
                Classification::Success
            }
            RawSignal::ParseError { offset, message } => Classification::failure(
                ErrorKind::ParseFailure,
                format!(
                    "{} failed to parse at offset {}: {}",
                    shape.function, offset, message
                ),
            ),
            RawSignal::Unsupported { detail } => Classification::failure(
                ErrorKind::Unsupported,
                format!("{} unsupported: {}", shape.function, detail),
            ),
            RawSignal::TimedOut { after_ms } => Classification::failure(
                ErrorKind::Timeout,
                format!("{} did not return within {}ms", shape.function, after_ms),
            ),
            RawSignal::Crashed { detail } => Classification::failure(
                ErrorKind::Unknown,
                format!("{} aborted: {}", shape.function, detail),
            ),
        }
    }

    fn classify_code(code: i64, shape: &ExpectedShape<'_>) -> Classification {
        let table = shape.table;
        if table.success.is_success(code) {
            if shape.handle_kind.is_some() {
                return Classification::failure(
                    ErrorKind::TypeMismatch,
                    format!(
                        "{} returned status {} where a handle was expected",
                        shape.function,
                        table.describe(code)
                    ),
                );
            }
            return Self::check_value_type(ValueType::Int, shape, &RawSignal::Code(code));
        }

        match table.lookup(code) {
            Some(kind) => Classification::failure(
                kind,
                format!(
                    "{} returned {} [{}]",
                    shape.function,
                    table.describe(code),
                    table.id
                ),
            ),
            None => Classification::failure(
                ErrorKind::Unknown,
                format!(
                    "{} returned unmapped {} [{}]",
                    shape.function,
                    table.describe(code),
                    table.id
                ),
            ),
        }
    }

    fn classify_null(shape: &ExpectedShape<'_>) -> Classification {
        match shape.capability {
            Capability::Create => Classification::failure(
                ErrorKind::AllocationFailure,
                format!("{} returned NULL", shape.function),
            ),
            Capability::Query | Capability::Mutate => {
                let detail = if shape.may_be_absent {
                    "absent"
                } else {
                    "NULL"
                };
                Classification::failure(
                    ErrorKind::NotFound,
                    format!("{} returned {}", shape.function, detail),
                )
            }
            Capability::Destroy => Classification::failure(
                ErrorKind::Unknown,
                format!("{} returned a NULL handle", shape.function),
            ),
        }
    }

    fn classify_handle(
        actual: Option<&HandleKind>,
        shape: &ExpectedShape<'_>,
        raw: &RawSignal,
    ) -> Classification {
        if let Some(expected_type) = shape.value_type {
            if !expected_type.admits(ValueType::Int) {
                return Classification::failure(
                    ErrorKind::TypeMismatch,
                    format!(
                        "{} returned {} where a {:?} value was expected",
                        shape.function, raw, expected_type
                    ),
                );
            }
        }
        match (shape.handle_kind, actual) {
            (Some(expected), Some(actual)) if !expected.admits(actual) => {
                Classification::failure(
                    ErrorKind::TypeMismatch,
                    format!(
                        "{} returned a {} handle where {} was expected",
                        shape.function, actual, expected
                    ),
                )
            }
            _ => Classification::Success,
        }
    }

    fn classify_bool(value: bool, shape: &ExpectedShape<'_>) -> Classification {
        if value {
            if shape.handle_kind.is_some() {
                return Classification::failure(
                    ErrorKind::TypeMismatch,
                    format!("{} returned a boolean where a handle was expected", shape.function),
                );
            }
            return Self::check_value_type(ValueType::Bool, shape, &RawSignal::Bool(true));
        }
        match shape.table.bool_false {
            Some(kind) => Classification::failure(
                kind,
                format!("{} returned false [{}]", shape.function, shape.table.id),
            ),
            None => Classification::failure(
                ErrorKind::Unknown,
                format!(
                    "{} returned false and [{}] does not classify booleans",
                    shape.function, shape.table.id
                ),
            ),
        }
    }

    fn check_value_type(
        actual: ValueType,
        shape: &ExpectedShape<'_>,
        raw: &RawSignal,
    ) -> Classification {
        match shape.value_type {
            Some(expected) if !expected.admits(actual) => Classification::failure(
                ErrorKind::TypeMismatch,
                format!(
                    "{} returned {} where a {:?} value was expected",
                    shape.function, raw, expected
                ),
            ),
            _ => Classification::Success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::presets;
    use crate::core::types::{NativeHandle, Value};

    fn shape<'a>(capability: Capability, table: &'a CodeTable) -> ExpectedShape<'a> {
        ExpectedShape::new(capability, "fn_under_test", table)
    }

    #[test]
    fn test_code_table_mapping() {
        let table = presets::zlib();
        let shape = shape(Capability::Mutate, &table);

        assert_eq!(
            ErrorClassifier::classify(&RawSignal::Code(0), &shape),
            Classification::Success
        );
        assert_eq!(
            ErrorClassifier::classify(&RawSignal::Code(1), &shape),
            Classification::Success
        );
        let result = ErrorClassifier::classify(&RawSignal::Code(-2), &shape);
        assert_eq!(result.kind(), Some(ErrorKind::InvalidArgument));
        assert!(result.as_failure().unwrap().1.contains("Z_STREAM_ERROR"));
        assert_eq!(
            ErrorClassifier::classify(&RawSignal::Code(-6), &shape).kind(),
            Some(ErrorKind::Unsupported)
        );
    }

    #[test]
    fn test_unmapped_code_is_unknown_with_raw_preserved() {
        let table = presets::zlib();
        let result = ErrorClassifier::classify(&RawSignal::Code(-99), &shape(Capability::Mutate, &table));
        let (kind, diagnostic) = result.as_failure().unwrap();
        assert_eq!(kind, ErrorKind::Unknown);
        assert!(diagnostic.contains("-99"));
    }

    #[test]
    fn test_null_depends_on_capability() {
        let table = presets::cjson();
        assert_eq!(
            ErrorClassifier::classify(&RawSignal::null(), &shape(Capability::Create, &table)).kind(),
            Some(ErrorKind::AllocationFailure)
        );
        let query = shape(Capability::Query, &table).absent_ok(true);
        assert_eq!(
            ErrorClassifier::classify(&RawSignal::null(), &query).kind(),
            Some(ErrorKind::NotFound)
        );
    }

    #[test]
    fn test_wrong_handle_kind_is_type_mismatch() {
        let table = presets::cjson();
        let expected = HandleKind::new("json.array");
        let shape = shape(Capability::Query, &table).with_handle_kind(Some(&expected));
        let raw = RawSignal::handle(NativeHandle(0x40), "json.string");
        assert_eq!(
            ErrorClassifier::classify(&raw, &shape).kind(),
            Some(ErrorKind::TypeMismatch)
        );
        let raw = RawSignal::handle(NativeHandle(0x40), "json.array");
        assert!(ErrorClassifier::classify(&raw, &shape).is_success());
    }

    #[test]
    fn test_value_type_mismatch() {
        let table = presets::cjson();
        let shape = shape(Capability::Query, &table).with_value_type(Some(ValueType::Text));
        let raw = RawSignal::Value(Value::Float(1.0));
        assert_eq!(
            ErrorClassifier::classify(&raw, &shape).kind(),
            Some(ErrorKind::TypeMismatch)
        );
    }

    #[test]
    fn test_parse_unsupported_timeout() {
        let table = presets::cjson();
        let shape = shape(Capability::Create, &table);
        let parse = RawSignal::ParseError {
            offset: 7,
            message: "expected value".to_string(),
        };
        let result = ErrorClassifier::classify(&parse, &shape);
        assert_eq!(result.kind(), Some(ErrorKind::ParseFailure));
        assert!(result.as_failure().unwrap().1.contains("offset 7"));
        assert_eq!(
            ErrorClassifier::classify(&RawSignal::unsupported("x"), &shape).kind(),
            Some(ErrorKind::Unsupported)
        );
        assert_eq!(
            ErrorClassifier::classify(&RawSignal::TimedOut { after_ms: 5 }, &shape).kind(),
            Some(ErrorKind::Timeout)
        );
    }

    #[test]
    fn test_boolean_false_uses_table() {
        let cjson = presets::cjson();
        assert_eq!(
            ErrorClassifier::classify(&RawSignal::Bool(false), &shape(Capability::Mutate, &cjson))
                .kind(),
            Some(ErrorKind::InvalidArgument)
        );
        let zlib = presets::zlib();
        assert_eq!(
            ErrorClassifier::classify(&RawSignal::Bool(false), &shape(Capability::Mutate, &zlib))
                .kind(),
            Some(ErrorKind::Unknown)
        );
    }
}
