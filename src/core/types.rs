/// Core value and identity types shared by the tracker, classifier and executor
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier the ownership tracker assigns to every registered handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Identifier of a scripted operation (1-based position unless the script sets one).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u32);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Opaque token returned by a target library. Zero is the NULL handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NativeHandle(pub u64);

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "NULL")
        } else {
            write!(f, "0x{:x}", self.0)
        }
    }
}

/// Dotted kind tag of a handle, e.g. `json.array` or `z.stream`.
///
/// An expected kind matches an actual kind when they are equal or when the
/// expected kind is a dotted prefix of the actual one (`json` matches `json.array`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleKind(String);

impl HandleKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `actual` satisfies this (expected) kind.
    pub fn admits(&self, actual: &HandleKind) -> bool {
        if self.0 == actual.0 {
            return true;
        }
        actual
            .0
            .strip_prefix(self.0.as_str())
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false)
    }

    /// Top-level family (`json` for `json.array`).
    pub fn family(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandleKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

/// Scalar values passed to and returned from native calls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Type tag of a [`Value`], used for shape checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Null,
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    /// Int or Float
    Number,
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Text(_) => ValueType::Text,
            Value::Bytes(_) => ValueType::Bytes,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.is_finite() => Some(v.trunc() as i64),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Byte view of text or byte values.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Text(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// C-style truthiness: zero, false, null and empty are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
        }
    }

    /// Equality that treats Int and Float as one numeric domain.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Text(a), Value::Bytes(b)) | (Value::Bytes(b), Value::Text(a)) => {
                a.as_bytes() == b.as_slice()
            }
            _ => self == other,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl ValueType {
    pub fn admits(self, actual: ValueType) -> bool {
        match self {
            ValueType::Number => matches!(actual, ValueType::Int | ValueType::Float),
            expected => expected == actual,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// Raw signal produced by a native call, before classification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawSignal {
    /// Pointer-like return; `kind` is what the library says the handle is.
    Handle {
        native: NativeHandle,
        kind: Option<HandleKind>,
    },
    /// Integer status code.
    Code(i64),
    /// Boolean status.
    Bool(bool),
    /// Scalar result.
    Value(Value),
    /// Nothing returned.
    Void,
    /// Parse or compile error with a location.
    ParseError { offset: usize, message: String },
    /// Library reports the operation as not supported.
    Unsupported { detail: String },
    /// Watchdog expired before the call returned.
    TimedOut { after_ms: u64 },
    /// The call aborted without returning (worker panicked).
    Crashed { detail: String },
}

impl RawSignal {
    pub fn handle(native: NativeHandle, kind: impl Into<HandleKind>) -> Self {
        RawSignal::Handle {
            native,
            kind: Some(kind.into()),
        }
    }

    pub fn null() -> Self {
        RawSignal::Handle {
            native: NativeHandle::NULL,
            kind: None,
        }
    }

    pub fn unsupported(detail: impl Into<String>) -> Self {
        RawSignal::Unsupported {
            detail: detail.into(),
        }
    }

    /// Native handle carried by this signal, if any and non-null.
    pub fn native_handle(&self) -> Option<NativeHandle> {
        match self {
            RawSignal::Handle { native, .. } if !native.is_null() => Some(*native),
            _ => None,
        }
    }

    /// Scalar view of the signal, used when an operation binds or records a value.
    pub fn as_value(&self) -> Value {
        match self {
            RawSignal::Handle { native, .. } if native.is_null() => Value::Null,
            RawSignal::Handle { native, .. } => Value::Int(native.0 as i64),
            RawSignal::Code(c) => Value::Int(*c),
            RawSignal::Bool(b) => Value::Bool(*b),
            RawSignal::Value(v) => v.clone(),
            RawSignal::Void => Value::Null,
            RawSignal::ParseError { .. }
            | RawSignal::Unsupported { .. }
            | RawSignal::TimedOut { .. }
            | RawSignal::Crashed { .. } => Value::Null,
        }
    }
}

impl fmt::Display for RawSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawSignal::Handle { native, kind } => match kind {
                Some(kind) => write!(f, "handle {} ({})", native, kind),
                None => write!(f, "handle {}", native),
            },
            RawSignal::Code(c) => write!(f, "code {}", c),
            RawSignal::Bool(b) => write!(f, "bool {}", b),
            RawSignal::Value(v) => write!(f, "value {}", v),
            RawSignal::Void => write!(f, "void"),
            RawSignal::ParseError { offset, message } => {
                write!(f, "parse error at offset {}: {}", offset, message)
            }
            RawSignal::Unsupported { detail } => write!(f, "unsupported: {}", detail),
            RawSignal::TimedOut { after_ms } => write!(f, "timed out after {}ms", after_ms),
            RawSignal::Crashed { detail } => write!(f, "crashed: {}", detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_prefix_matching() {
        let family = HandleKind::new("json");
        assert!(family.admits(&HandleKind::new("json.array")));
        assert!(family.admits(&HandleKind::new("json")));
        assert!(!family.admits(&HandleKind::new("jsonx.array")));
        assert!(!HandleKind::new("json.array").admits(&HandleKind::new("json.object")));
        assert_eq!(HandleKind::new("z.stream").family(), "z");
    }

    #[test]
    fn test_untagged_value_deserialization() {
        let values: Vec<Value> = serde_json::from_str(r#"[null, true, 3, 3.5, "x", [1, 2]]"#).unwrap();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Bool(true),
                Value::Int(3),
                Value::Float(3.5),
                Value::Text("x".to_string()),
                Value::Bytes(vec![1, 2]),
            ]
        );
    }

    #[test]
    fn test_loose_numeric_equality() {
        assert!(Value::Int(2).loosely_equals(&Value::Float(2.0)));
        assert!(!Value::Int(2).loosely_equals(&Value::Float(2.5)));
        assert!(Value::Text("ab".into()).loosely_equals(&Value::Bytes(b"ab".to_vec())));
    }

    #[test]
    fn test_null_handle_signal() {
        assert_eq!(RawSignal::null().native_handle(), None);
        assert_eq!(
            RawSignal::handle(NativeHandle(7), "json.array").native_handle(),
            Some(NativeHandle(7))
        );
        assert_eq!(NativeHandle::NULL.to_string(), "NULL");
    }
}
