use crate::core::script::Capability;
use crate::core::types::{HandleKind, NativeHandle, RawSignal, Value};

/// Positional argument of a native call after bindings are resolved
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Handle(NativeHandle),
    Value(Value),
}

/// A resolved native call, ready to hand to a target library
#[derive(Clone, Debug, PartialEq)]
pub struct NativeCall {
    pub function: String,
    pub capability: Capability,
    pub args: Vec<Arg>,
}

impl NativeCall {
    pub fn new(function: &str, capability: Capability, args: Vec<Arg>) -> Self {
        Self {
            function: function.to_string(),
            capability,
            args,
        }
    }

    pub fn handle_at(&self, idx: usize) -> Option<NativeHandle> {
        match self.args.get(idx) {
            Some(Arg::Handle(h)) => Some(*h),
            _ => None,
        }
    }

    pub fn value_at(&self, idx: usize) -> Option<&Value> {
        match self.args.get(idx) {
            Some(Arg::Value(v)) => Some(v),
            _ => None,
        }
    }

    pub fn int_at(&self, idx: usize) -> Option<i64> {
        self.value_at(idx).and_then(Value::as_i64)
    }

    pub fn float_at(&self, idx: usize) -> Option<f64> {
        self.value_at(idx).and_then(Value::as_f64)
    }

    pub fn bool_at(&self, idx: usize) -> Option<bool> {
        self.value_at(idx).and_then(Value::as_bool)
    }

    pub fn text_at(&self, idx: usize) -> Option<&str> {
        self.value_at(idx).and_then(Value::as_str)
    }

    pub fn bytes_at(&self, idx: usize) -> Option<&[u8]> {
        self.value_at(idx).and_then(Value::as_bytes)
    }
}

/// Work item a library hands to the watchdog for calls that may block.
pub type BlockingCall = Box<dyn FnOnce() -> RawSignal + Send + 'static>;

/// A native library driven by the harness
///
/// The harness never looks inside handles. A library exposes four capability
/// entry points plus the canonical destructor for each handle kind, which the
/// cleanup drain uses when the script did not release a handle itself.
pub trait TargetLibrary: Send {
    /// Registry name (also selects the built-in code table)
    fn name(&self) -> &str;

    /// Handle kinds this library produces
    fn kinds(&self) -> Vec<HandleKind>;

    fn create(&mut self, call: &NativeCall) -> RawSignal;

    fn mutate(&mut self, call: &NativeCall) -> RawSignal;

    fn query(&mut self, call: &NativeCall) -> RawSignal;

    fn destroy(&mut self, call: &NativeCall) -> RawSignal;

    /// Canonical destroy function for a kind
    fn destructor(&self, kind: &HandleKind) -> Option<&'static str>;

    /// Kind of a live native handle, when the library can tell.
    fn kind_of(&self, _native: NativeHandle) -> Option<HandleKind> {
        None
    }

    /// Unlink `child` from `parent` without freeing either.
    fn detach(&mut self, _parent: NativeHandle, _child: NativeHandle) -> RawSignal {
        RawSignal::unsupported("native detach")
    }

    /// Move a call that may block onto the watchdog. `None` runs it inline.
    fn offload(&mut self, _call: &NativeCall) -> Option<BlockingCall> {
        None
    }
}

/// Dispatch a call to the capability entry point it names.
pub fn invoke(library: &mut dyn TargetLibrary, call: &NativeCall) -> RawSignal {
    match call.capability {
        Capability::Create => library.create(call),
        Capability::Mutate => library.mutate(call),
        Capability::Query => library.query(call),
        Capability::Destroy => library.destroy(call),
    }
}
