/// JSON tree target (cJSON-shaped)
///
/// An in-process node arena exposing the cJSON call surface. Every node is a
/// handle; containers own their items and free them with themselves, while
/// reference nodes alias another node and never free what they point at.
/// Native frees are counted per node in [`JsonStats`] so tests can prove
/// exactly-once release from the library's side.
use crate::core::library::{NativeCall, TargetLibrary};
use crate::core::types::{HandleKind, NativeHandle, RawSignal, Value};
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

pub const LIBRARY_NAME: &str = "cjson";
pub const VERSION: &str = "1.7.18";

const KIND_OBJECT: &str = "json.object";
const KIND_ARRAY: &str = "json.array";
const KIND_NUMBER: &str = "json.number";
const KIND_STRING: &str = "json.string";
const KIND_BOOL: &str = "json.bool";
const KIND_NULL: &str = "json.null";

/// First node address and spacing between nodes
const BASE_ADDRESS: u64 = 0x1000;
const NODE_STRIDE: u64 = 0x40;
const MAX_REFERENCE_DEPTH: usize = 64;
/// cJSON's `CJSON_NESTING_LIMIT`
const NESTING_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
enum Item {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<u64>),
    Object(Vec<(String, u64)>),
    /// Non-owning alias of another node
    Reference(u64),
}

#[derive(Debug)]
struct Node {
    item: Item,
    parent: Option<u64>,
}

/// Library-side allocation accounting
#[derive(Debug, Default, Clone)]
pub struct JsonStats {
    pub allocated: u64,
    pub freed: u64,
    /// Native frees per node address
    pub free_counts: BTreeMap<u64, u32>,
    /// Calls that named a node that does not exist (freed or never allocated)
    pub invalid_accesses: u64,
}

impl JsonStats {
    /// Nodes allocated and not yet freed
    pub fn live(&self) -> u64 {
        self.allocated.saturating_sub(self.freed)
    }

    pub fn frees_of(&self, native: NativeHandle) -> u32 {
        self.free_counts.get(&native.0).copied().unwrap_or(0)
    }

    /// Highest free count of any node; 1 when every free was exactly-once.
    pub fn max_frees(&self) -> u32 {
        self.free_counts.values().copied().max().unwrap_or(0)
    }
}

pub struct JsonTree {
    nodes: BTreeMap<u64, Node>,
    next: u64,
    stats: Arc<Mutex<JsonStats>>,
}

impl Default for JsonTree {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonTree {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            next: BASE_ADDRESS,
            stats: Arc::new(Mutex::new(JsonStats::default())),
        }
    }

    /// Shared view of the allocation counters
    pub fn stats_handle(&self) -> Arc<Mutex<JsonStats>> {
        Arc::clone(&self.stats)
    }

    pub fn stats(&self) -> JsonStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(_) => JsonStats::default(),
        }
    }

    fn with_stats(&self, update: impl FnOnce(&mut JsonStats)) {
        match self.stats.lock() {
            Ok(mut stats) => update(&mut stats),
            Err(_) => warn!("json stats lock poisoned"),
        }
    }

    // ---- arena ----

    fn alloc(&mut self, item: Item) -> u64 {
        let id = self.next;
        self.next += NODE_STRIDE;
        self.nodes.insert(id, Node { item, parent: None });
        self.with_stats(|s| s.allocated += 1);
        id
    }

    fn node_id(&self, handle: Option<NativeHandle>) -> Option<u64> {
        let handle = handle?;
        if handle.is_null() {
            return None;
        }
        if self.nodes.contains_key(&handle.0) {
            Some(handle.0)
        } else {
            self.with_stats(|s| s.invalid_accesses += 1);
            warn!("cjson: access to unknown node {}", handle);
            None
        }
    }

    /// Follow reference nodes to the node holding the value.
    fn resolve(&self, id: u64) -> Option<u64> {
        let mut cursor = id;
        for _ in 0..MAX_REFERENCE_DEPTH {
            match &self.nodes.get(&cursor)?.item {
                Item::Reference(target) => cursor = *target,
                _ => return Some(cursor),
            }
        }
        None
    }

    fn item(&self, id: u64) -> Option<&Item> {
        let target = self.resolve(id)?;
        self.nodes.get(&target).map(|n| &n.item)
    }

    fn kind_of_id(&self, id: u64) -> Option<HandleKind> {
        let kind = match self.item(id)? {
            Item::Null => KIND_NULL,
            Item::Bool(_) => KIND_BOOL,
            Item::Number(_) => KIND_NUMBER,
            Item::Str(_) => KIND_STRING,
            Item::Array(_) => KIND_ARRAY,
            Item::Object(_) => KIND_OBJECT,
            Item::Reference(_) => return None,
        };
        Some(HandleKind::new(kind))
    }

    fn handle_signal(&self, id: u64) -> RawSignal {
        RawSignal::Handle {
            native: NativeHandle(id),
            kind: self.kind_of_id(id),
        }
    }

    /// Free a node and every item it owns. Reference targets are untouched.
    fn free_tree(&mut self, id: u64) {
        let node = match self.nodes.remove(&id) {
            Some(node) => node,
            None => {
                self.with_stats(|s| {
                    *s.free_counts.entry(id).or_insert(0) += 1;
                    s.invalid_accesses += 1;
                });
                warn!("cjson: free of unknown node 0x{:x}", id);
                return;
            }
        };
        if let Some(parent) = node.parent {
            self.unlink(parent, id);
        }
        let children: Vec<u64> = match &node.item {
            Item::Array(items) => items.clone(),
            Item::Object(members) => members.iter().map(|(_, v)| *v).collect(),
            _ => Vec::new(),
        };
        for child in children {
            if let Some(child_node) = self.nodes.get_mut(&child) {
                child_node.parent = None;
            }
            self.free_tree(child);
        }
        self.with_stats(|s| {
            s.freed += 1;
            *s.free_counts.entry(id).or_insert(0) += 1;
        });
    }

    /// Remove `child` from `parent`'s items. Returns whether it was there.
    fn unlink(&mut self, parent: u64, child: u64) -> bool {
        let removed = match self.nodes.get_mut(&parent).map(|n| &mut n.item) {
            Some(Item::Array(items)) => match items.iter().position(|i| *i == child) {
                Some(pos) => {
                    items.remove(pos);
                    true
                }
                None => false,
            },
            Some(Item::Object(members)) => match members.iter().position(|(_, v)| *v == child) {
                Some(pos) => {
                    members.remove(pos);
                    true
                }
                None => false,
            },
            _ => false,
        };
        if removed {
            if let Some(node) = self.nodes.get_mut(&child) {
                node.parent = None;
            }
        }
        removed
    }

    fn is_container(&self, id: u64, array: bool) -> bool {
        matches!(
            (self.nodes.get(&id).map(|n| &n.item), array),
            (Some(Item::Array(_)), true) | (Some(Item::Object(_)), false)
        )
    }

    /// Whether `id` may be linked under a container.
    fn is_free_item(&self, container: u64, id: u64) -> bool {
        container != id
            && self
                .nodes
                .get(&id)
                .map(|n| n.parent.is_none())
                .unwrap_or(false)
            && !self.reaches(id, container)
    }

    /// Whether `to` is `from` or reachable below it, following references.
    fn reaches(&self, from: u64, to: u64) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            let id = match self.resolve(id) {
                Some(id) => id,
                None => continue,
            };
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            match self.nodes.get(&id).map(|n| &n.item) {
                Some(Item::Array(items)) => stack.extend(items.iter().copied()),
                Some(Item::Object(members)) => stack.extend(members.iter().map(|(_, v)| *v)),
                _ => {}
            }
        }
        false
    }

    fn append(&mut self, container: u64, key: Option<&str>, item: u64) -> bool {
        let linked = match (self.nodes.get_mut(&container).map(|n| &mut n.item), key) {
            (Some(Item::Array(items)), None) => {
                items.push(item);
                true
            }
            (Some(Item::Object(members)), Some(key)) => {
                members.push((key.to_string(), item));
                true
            }
            _ => false,
        };
        if linked {
            if let Some(node) = self.nodes.get_mut(&item) {
                node.parent = Some(container);
            }
        }
        linked
    }

    fn object_member(&self, object: u64, key: &str, case_sensitive: bool) -> Option<u64> {
        match self.item(object)? {
            Item::Object(members) => members
                .iter()
                .find(|(k, _)| {
                    if case_sensitive {
                        k == key
                    } else {
                        k.eq_ignore_ascii_case(key)
                    }
                })
                .map(|(_, v)| *v),
            _ => None,
        }
    }

    fn array_item(&self, array: u64, index: i64) -> Option<u64> {
        if index < 0 {
            return None;
        }
        match self.item(array)? {
            Item::Array(items) => items.get(index as usize).copied(),
            _ => None,
        }
    }

    // ---- construction ----

    fn build(&mut self, value: &serde_json::Value) -> u64 {
        match value {
            serde_json::Value::Null => self.alloc(Item::Null),
            serde_json::Value::Bool(b) => self.alloc(Item::Bool(*b)),
            serde_json::Value::Number(n) => self.alloc(Item::Number(n.as_f64().unwrap_or(0.0))),
            serde_json::Value::String(s) => self.alloc(Item::Str(s.clone())),
            serde_json::Value::Array(values) => {
                let array = self.alloc(Item::Array(Vec::new()));
                for value in values {
                    let child = self.build(value);
                    self.append(array, None, child);
                }
                array
            }
            serde_json::Value::Object(map) => {
                let object = self.alloc(Item::Object(Vec::new()));
                for (key, value) in map {
                    let child = self.build(value);
                    self.append(object, Some(key), child);
                }
                object
            }
        }
    }

    fn parse(&mut self, text: &str) -> RawSignal {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => {
                let root = self.build(&value);
                self.handle_signal(root)
            }
            Err(e) => RawSignal::ParseError {
                offset: byte_offset(text, e.line(), e.column()),
                message: e.to_string(),
            },
        }
    }

    fn duplicate(&mut self, id: u64, recurse: bool) -> Option<u64> {
        let item = self.item(id)?.clone();
        let copy = match item {
            Item::Array(items) => {
                let array = self.alloc(Item::Array(Vec::new()));
                if recurse {
                    for child in items {
                        if let Some(dup) = self.duplicate(child, true) {
                            self.append(array, None, dup);
                        }
                    }
                }
                array
            }
            Item::Object(members) => {
                let object = self.alloc(Item::Object(Vec::new()));
                if recurse {
                    for (key, child) in members {
                        if let Some(dup) = self.duplicate(child, true) {
                            self.append(object, Some(&key), dup);
                        }
                    }
                }
                object
            }
            scalar => self.alloc(scalar),
        };
        Some(copy)
    }

    fn create_reference(&mut self, target: Option<u64>, array: bool) -> RawSignal {
        match target {
            Some(target) if self.is_container(target, array) => {
                let id = self.alloc(Item::Reference(target));
                self.handle_signal(id)
            }
            _ => RawSignal::null(),
        }
    }

    // ---- printing and comparison ----

    fn print(&self, id: u64, formatted: bool, depth: usize, out: &mut String) -> bool {
        if depth > NESTING_LIMIT {
            return false;
        }
        let item = match self.item(id) {
            Some(item) => item,
            None => return false,
        };
        match item {
            Item::Null => out.push_str("null"),
            Item::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Item::Number(v) => out.push_str(&format_number(*v)),
            Item::Str(s) => out.push_str(&quote(s)),
            Item::Array(items) => {
                out.push('[');
                for (i, child) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(if formatted { ", " } else { "," });
                    }
                    if !self.print(*child, formatted, depth + 1, out) {
                        return false;
                    }
                }
                out.push(']');
            }
            Item::Object(members) => {
                out.push('{');
                if formatted && !members.is_empty() {
                    out.push('\n');
                }
                for (i, (key, child)) in members.iter().enumerate() {
                    if formatted {
                        out.push_str(&"\t".repeat(depth + 1));
                    }
                    out.push_str(&quote(key));
                    out.push(':');
                    if formatted {
                        out.push('\t');
                    }
                    if !self.print(*child, formatted, depth + 1, out) {
                        return false;
                    }
                    if i + 1 < members.len() {
                        out.push(',');
                    }
                    if formatted {
                        out.push('\n');
                    }
                }
                if formatted && !members.is_empty() {
                    out.push_str(&"\t".repeat(depth));
                }
                out.push('}');
            }
            Item::Reference(target) => return self.print(*target, formatted, depth, out),
        }
        true
    }

    fn compare(&self, a: u64, b: u64, case_sensitive: bool, depth: usize) -> bool {
        if depth > NESTING_LIMIT {
            return false;
        }
        let (left, right) = match (self.item(a), self.item(b)) {
            (Some(left), Some(right)) => (left, right),
            _ => return false,
        };
        match (left, right) {
            (Item::Null, Item::Null) => true,
            (Item::Bool(x), Item::Bool(y)) => x == y,
            (Item::Number(x), Item::Number(y)) => {
                (x - y).abs() <= f64::EPSILON * x.abs().max(y.abs()).max(1.0)
            }
            (Item::Str(x), Item::Str(y)) => x == y,
            (Item::Array(xs), Item::Array(ys)) => {
                xs.len() == ys.len()
                    && xs
                        .iter()
                        .zip(ys)
                        .all(|(x, y)| self.compare(*x, *y, case_sensitive, depth + 1))
            }
            (Item::Object(xs), Item::Object(ys)) => {
                xs.len() == ys.len()
                    && xs.iter().all(|(key, x)| {
                        self.object_member(b, key, case_sensitive)
                            .map(|y| self.compare(*x, y, case_sensitive, depth + 1))
                            .unwrap_or(false)
                    })
            }
            _ => false,
        }
    }

    // ---- entry points ----

    fn bool_signal(ok: bool) -> RawSignal {
        RawSignal::Bool(ok)
    }

    fn type_check(&self, call: &NativeCall, check: impl Fn(&Item) -> bool) -> RawSignal {
        let result = self
            .node_id(call.handle_at(0))
            .and_then(|id| self.item(id))
            .map(check)
            .unwrap_or(false);
        RawSignal::Value(Value::Bool(result))
    }

    fn add_item(&mut self, call: &NativeCall, keyed: bool, by_reference: bool) -> RawSignal {
        let container = self.node_id(call.handle_at(0));
        let (key, item_idx) = if keyed {
            (call.text_at(1).map(str::to_string), 2)
        } else {
            (None, 1)
        };
        let item = self.node_id(call.handle_at(item_idx));
        let (container, item) = match (container, item) {
            (Some(c), Some(i)) if self.is_container(c, !keyed) => (c, i),
            _ => return Self::bool_signal(false),
        };
        if keyed && key.is_none() {
            return Self::bool_signal(false);
        }
        let linked = if by_reference {
            if self.reaches(item, container) {
                return Self::bool_signal(false);
            }
            let alias = self.alloc(Item::Reference(item));
            self.append(container, key.as_deref(), alias)
        } else {
            if !self.is_free_item(container, item) {
                return Self::bool_signal(false);
            }
            self.append(container, key.as_deref(), item)
        };
        Self::bool_signal(linked)
    }

    fn insert_item(&mut self, call: &NativeCall) -> RawSignal {
        let array = self.node_id(call.handle_at(0));
        let index = call.int_at(1);
        let item = self.node_id(call.handle_at(2));
        let (array, index, item) = match (array, index, item) {
            (Some(a), Some(i), Some(it)) if i >= 0 && self.is_free_item(a, it) => (a, i as usize, it),
            _ => return Self::bool_signal(false),
        };
        let inserted = match self.nodes.get_mut(&array).map(|n| &mut n.item) {
            Some(Item::Array(items)) => {
                let at = index.min(items.len());
                items.insert(at, item);
                true
            }
            _ => false,
        };
        if inserted {
            if let Some(node) = self.nodes.get_mut(&item) {
                node.parent = Some(array);
            }
        }
        Self::bool_signal(inserted)
    }

    fn detach_item(&mut self, parent: Option<u64>, child: Option<u64>) -> RawSignal {
        match (parent, child) {
            (Some(parent), Some(child)) if self.unlink(parent, child) => self.handle_signal(child),
            _ => RawSignal::null(),
        }
    }

    fn replace_item(&mut self, call: &NativeCall, keyed: bool) -> RawSignal {
        let container = self.node_id(call.handle_at(0));
        let replacement = self.node_id(call.handle_at(2));
        let (container, replacement) = match (container, replacement) {
            (Some(c), Some(r)) if self.is_free_item(c, r) => (c, r),
            _ => return Self::bool_signal(false),
        };
        let old = if keyed {
            call.text_at(1)
                .and_then(|key| self.object_member(container, key, false))
        } else {
            call.int_at(1).and_then(|idx| self.array_item(container, idx))
        };
        let old = match old {
            Some(old) => old,
            None => return Self::bool_signal(false),
        };
        let replaced = match self.nodes.get_mut(&container).map(|n| &mut n.item) {
            Some(Item::Array(items)) => match items.iter_mut().find(|i| **i == old) {
                Some(slot) => {
                    *slot = replacement;
                    true
                }
                None => false,
            },
            Some(Item::Object(members)) => match members.iter_mut().find(|(_, v)| *v == old) {
                Some(slot) => {
                    slot.1 = replacement;
                    true
                }
                None => false,
            },
            _ => false,
        };
        if !replaced {
            return Self::bool_signal(false);
        }
        if let Some(node) = self.nodes.get_mut(&replacement) {
            node.parent = Some(container);
        }
        if let Some(node) = self.nodes.get_mut(&old) {
            node.parent = None;
        }
        self.free_tree(old);
        Self::bool_signal(true)
    }

    fn print_call(&self, call: &NativeCall, formatted: bool) -> RawSignal {
        let id = match self.node_id(call.handle_at(0)) {
            Some(id) => id,
            None => return RawSignal::null(),
        };
        let mut out = String::new();
        if self.print(id, formatted, 0, &mut out) {
            RawSignal::Value(Value::Text(out))
        } else {
            RawSignal::null()
        }
    }
}

/// Byte offset of a 1-based (line, column) position.
fn byte_offset(text: &str, line: usize, column: usize) -> usize {
    let mut offset = 0;
    for (idx, content) in text.split('\n').enumerate() {
        if idx + 1 == line {
            return (offset + column.saturating_sub(1)).min(text.len());
        }
        offset += content.len() + 1;
    }
    text.len()
}

fn format_number(value: f64) -> String {
    if !value.is_finite() {
        "null".to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

fn quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| format!("\"{}\"", text))
}

impl TargetLibrary for JsonTree {
    fn name(&self) -> &str {
        LIBRARY_NAME
    }

    fn kinds(&self) -> Vec<HandleKind> {
        [KIND_OBJECT, KIND_ARRAY, KIND_NUMBER, KIND_STRING, KIND_BOOL, KIND_NULL]
            .iter()
            .map(|k| HandleKind::new(*k))
            .collect()
    }

    fn create(&mut self, call: &NativeCall) -> RawSignal {
        let id = match call.function.as_str() {
            "cJSON_CreateObject" => self.alloc(Item::Object(Vec::new())),
            "cJSON_CreateArray" => self.alloc(Item::Array(Vec::new())),
            "cJSON_CreateNull" => self.alloc(Item::Null),
            "cJSON_CreateTrue" => self.alloc(Item::Bool(true)),
            "cJSON_CreateFalse" => self.alloc(Item::Bool(false)),
            "cJSON_CreateBool" => self.alloc(Item::Bool(call.bool_at(0).unwrap_or(false))),
            "cJSON_CreateNumber" => match call.float_at(0) {
                Some(v) => self.alloc(Item::Number(v)),
                None => return RawSignal::null(),
            },
            "cJSON_CreateString" => match call.text_at(0) {
                Some(s) => self.alloc(Item::Str(s.to_string())),
                None => return RawSignal::null(),
            },
            "cJSON_Parse" => {
                return match call.text_at(0) {
                    Some(text) => {
                        let text = text.to_string();
                        self.parse(&text)
                    }
                    None => RawSignal::null(),
                }
            }
            "cJSON_Duplicate" => {
                let recurse = call.bool_at(1).unwrap_or(true);
                match self
                    .node_id(call.handle_at(0))
                    .and_then(|id| self.duplicate(id, recurse))
                {
                    Some(id) => id,
                    None => return RawSignal::null(),
                }
            }
            "cJSON_CreateArrayReference" => {
                let target = self.node_id(call.handle_at(0));
                return self.create_reference(target, true);
            }
            "cJSON_CreateObjectReference" => {
                let target = self.node_id(call.handle_at(0));
                return self.create_reference(target, false);
            }
            other => return RawSignal::unsupported(format!("{} is not a cJSON constructor", other)),
        };
        debug!("{} -> 0x{:x}", call.function, id);
        self.handle_signal(id)
    }

    fn mutate(&mut self, call: &NativeCall) -> RawSignal {
        match call.function.as_str() {
            "cJSON_AddItemToArray" => self.add_item(call, false, false),
            "cJSON_AddItemToObject" | "cJSON_AddItemToObjectCS" => self.add_item(call, true, false),
            "cJSON_AddItemReferenceToArray" => self.add_item(call, false, true),
            "cJSON_AddItemReferenceToObject" => self.add_item(call, true, true),
            "cJSON_InsertItemInArray" => self.insert_item(call),
            "cJSON_DetachItemFromArray" => {
                let array = self.node_id(call.handle_at(0));
                let child = array.and_then(|a| self.array_item(a, call.int_at(1).unwrap_or(-1)));
                self.detach_item(array, child)
            }
            "cJSON_DetachItemFromObject" | "cJSON_DetachItemFromObjectCaseSensitive" => {
                let case_sensitive = call.function.ends_with("CaseSensitive");
                let object = self.node_id(call.handle_at(0));
                let child = match (object, call.text_at(1)) {
                    (Some(o), Some(key)) => self.object_member(o, key, case_sensitive),
                    _ => None,
                };
                self.detach_item(object, child)
            }
            "cJSON_DetachItemViaPointer" => {
                let parent = self.node_id(call.handle_at(0));
                let child = self.node_id(call.handle_at(1));
                self.detach_item(parent, child)
            }
            "cJSON_ReplaceItemInArray" => self.replace_item(call, false),
            "cJSON_ReplaceItemInObject" => self.replace_item(call, true),
            "cJSON_SetNumberHelper" | "cJSON_SetNumberValue" => {
                let id = self.node_id(call.handle_at(0)).and_then(|id| self.resolve(id));
                match (id, call.float_at(1)) {
                    (Some(id), Some(v)) => match self.nodes.get_mut(&id).map(|n| &mut n.item) {
                        Some(item @ Item::Number(_)) => {
                            *item = Item::Number(v);
                            RawSignal::Value(Value::Float(v))
                        }
                        _ => RawSignal::Value(Value::Float(f64::NAN)),
                    },
                    _ => RawSignal::Value(Value::Float(f64::NAN)),
                }
            }
            "cJSON_SetValuestring" => {
                let id = self.node_id(call.handle_at(0)).and_then(|id| self.resolve(id));
                match (id, call.text_at(1).map(str::to_string)) {
                    (Some(id), Some(text)) => match self.nodes.get_mut(&id).map(|n| &mut n.item) {
                        Some(item @ Item::Str(_)) => {
                            *item = Item::Str(text.clone());
                            RawSignal::Value(Value::Text(text))
                        }
                        _ => RawSignal::null(),
                    },
                    _ => RawSignal::null(),
                }
            }
            other => RawSignal::unsupported(format!("{} is not a cJSON mutator", other)),
        }
    }

    fn query(&mut self, call: &NativeCall) -> RawSignal {
        match call.function.as_str() {
            "cJSON_GetArraySize" => {
                let size = match self.node_id(call.handle_at(0)).and_then(|id| self.item(id)) {
                    Some(Item::Array(items)) => items.len(),
                    Some(Item::Object(members)) => members.len(),
                    _ => 0,
                };
                RawSignal::Value(Value::Int(size as i64))
            }
            "cJSON_GetArrayItem" => {
                let item = self
                    .node_id(call.handle_at(0))
                    .and_then(|a| self.array_item(a, call.int_at(1).unwrap_or(-1)));
                match item {
                    Some(id) => self.handle_signal(id),
                    None => RawSignal::null(),
                }
            }
            "cJSON_GetObjectItem" | "cJSON_GetObjectItemCaseSensitive" => {
                let case_sensitive = call.function.ends_with("CaseSensitive");
                let item = match (self.node_id(call.handle_at(0)), call.text_at(1)) {
                    (Some(o), Some(key)) => self.object_member(o, key, case_sensitive),
                    _ => None,
                };
                match item {
                    Some(id) => self.handle_signal(id),
                    None => RawSignal::null(),
                }
            }
            "cJSON_HasObjectItem" => {
                let found = match (self.node_id(call.handle_at(0)), call.text_at(1)) {
                    (Some(o), Some(key)) => self.object_member(o, key, false).is_some(),
                    _ => false,
                };
                RawSignal::Value(Value::Bool(found))
            }
            "cJSON_IsObject" => self.type_check(call, |i| matches!(i, Item::Object(_))),
            "cJSON_IsArray" => self.type_check(call, |i| matches!(i, Item::Array(_))),
            "cJSON_IsNumber" => self.type_check(call, |i| matches!(i, Item::Number(_))),
            "cJSON_IsString" => self.type_check(call, |i| matches!(i, Item::Str(_))),
            "cJSON_IsBool" => self.type_check(call, |i| matches!(i, Item::Bool(_))),
            "cJSON_IsTrue" => self.type_check(call, |i| matches!(i, Item::Bool(true))),
            "cJSON_IsFalse" => self.type_check(call, |i| matches!(i, Item::Bool(false))),
            "cJSON_IsNull" => self.type_check(call, |i| matches!(i, Item::Null)),
            "cJSON_IsInvalid" => {
                let invalid = self.node_id(call.handle_at(0)).and_then(|id| self.item(id)).is_none();
                RawSignal::Value(Value::Bool(invalid))
            }
            "cJSON_IsReference" => {
                let is_ref = self
                    .node_id(call.handle_at(0))
                    .and_then(|id| self.nodes.get(&id))
                    .map(|n| matches!(n.item, Item::Reference(_)))
                    .unwrap_or(false);
                RawSignal::Value(Value::Bool(is_ref))
            }
            "cJSON_GetNumberValue" => {
                match self.node_id(call.handle_at(0)).and_then(|id| self.item(id)) {
                    Some(Item::Number(v)) => RawSignal::Value(Value::Float(*v)),
                    _ => RawSignal::Value(Value::Float(f64::NAN)),
                }
            }
            "cJSON_GetStringValue" => {
                match self.node_id(call.handle_at(0)).and_then(|id| self.item(id)) {
                    Some(Item::Str(s)) => RawSignal::Value(Value::Text(s.clone())),
                    _ => RawSignal::null(),
                }
            }
            "cJSON_Print" => self.print_call(call, true),
            "cJSON_PrintUnformatted" => self.print_call(call, false),
            "cJSON_Compare" => {
                let a = self.node_id(call.handle_at(0));
                let b = self.node_id(call.handle_at(1));
                let case_sensitive = call.bool_at(2).unwrap_or(true);
                let equal = match (a, b) {
                    (Some(a), Some(b)) => self.compare(a, b, case_sensitive, 0),
                    _ => false,
                };
                RawSignal::Value(Value::Bool(equal))
            }
            "cJSON_Version" => RawSignal::Value(Value::Text(VERSION.to_string())),
            other => RawSignal::unsupported(format!("{} is not a cJSON query", other)),
        }
    }

    fn destroy(&mut self, call: &NativeCall) -> RawSignal {
        match call.function.as_str() {
            "cJSON_Delete" => {
                match call.handle_at(0) {
                    Some(handle) if !handle.is_null() => {
                        debug!("cJSON_Delete({})", handle);
                        self.free_tree(handle.0);
                    }
                    // cJSON_Delete(NULL) is a no-op
                    _ => {}
                }
                RawSignal::Void
            }
            other => RawSignal::unsupported(format!("{} is not a cJSON destructor", other)),
        }
    }

    fn destructor(&self, kind: &HandleKind) -> Option<&'static str> {
        match kind.family() {
            "json" => Some("cJSON_Delete"),
            _ => None,
        }
    }

    fn kind_of(&self, native: NativeHandle) -> Option<HandleKind> {
        self.kind_of_id(native.0)
    }

    fn detach(&mut self, parent: NativeHandle, child: NativeHandle) -> RawSignal {
        let parent = self.node_id(Some(parent));
        let child = self.node_id(Some(child));
        self.detach_item(parent, child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::library::Arg;
    use crate::core::script::Capability;

    fn call(function: &str, capability: Capability, args: Vec<Arg>) -> NativeCall {
        NativeCall::new(function, capability, args)
    }

    fn h(native: NativeHandle) -> Arg {
        Arg::Handle(native)
    }

    fn v(value: impl Into<Value>) -> Arg {
        Arg::Value(value.into())
    }

    fn create(tree: &mut JsonTree, function: &str, args: Vec<Arg>) -> NativeHandle {
        tree.create(&call(function, Capability::Create, args))
            .native_handle()
            .unwrap()
    }

    #[test]
    fn test_container_delete_frees_items_once() {
        let mut tree = JsonTree::new();
        let root = create(&mut tree, "cJSON_CreateObject", vec![]);
        let list = create(&mut tree, "cJSON_CreateArray", vec![]);
        let number = create(&mut tree, "cJSON_CreateNumber", vec![v(4.0)]);

        let add = |tree: &mut JsonTree, args| tree.mutate(&call("cJSON_AddItemToArray", Capability::Mutate, args));
        assert_eq!(add(&mut tree, vec![h(list), h(number)]), RawSignal::Bool(true));
        assert_eq!(
            tree.mutate(&call(
                "cJSON_AddItemToObject",
                Capability::Mutate,
                vec![h(root), v("list"), h(list)]
            )),
            RawSignal::Bool(true)
        );

        tree.destroy(&call("cJSON_Delete", Capability::Destroy, vec![h(root)]));
        let stats = tree.stats();
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.live(), 0);
        assert_eq!(stats.max_frees(), 1);
    }

    #[test]
    fn test_item_cannot_be_added_twice_by_value() {
        let mut tree = JsonTree::new();
        let a = create(&mut tree, "cJSON_CreateArray", vec![]);
        let b = create(&mut tree, "cJSON_CreateArray", vec![]);
        let item = create(&mut tree, "cJSON_CreateTrue", vec![]);
        let add = |tree: &mut JsonTree, list| {
            tree.mutate(&call("cJSON_AddItemToArray", Capability::Mutate, vec![h(list), h(item)]))
        };
        assert_eq!(add(&mut tree, a), RawSignal::Bool(true));
        assert_eq!(add(&mut tree, b), RawSignal::Bool(false));
    }

    #[test]
    fn test_reference_survives_holder_delete() {
        let mut tree = JsonTree::new();
        let x = create(&mut tree, "cJSON_CreateArray", vec![]);
        let y = create(&mut tree, "cJSON_CreateArray", vec![]);
        let number = create(&mut tree, "cJSON_CreateNumber", vec![v(7.0)]);
        tree.mutate(&call("cJSON_AddItemToArray", Capability::Mutate, vec![h(x), h(number)]));
        tree.mutate(&call(
            "cJSON_AddItemReferenceToArray",
            Capability::Mutate,
            vec![h(y), h(number)],
        ));

        tree.destroy(&call("cJSON_Delete", Capability::Destroy, vec![h(y)]));
        assert_eq!(tree.stats().frees_of(number), 0);
        assert_eq!(
            tree.query(&call("cJSON_GetNumberValue", Capability::Query, vec![h(number)])),
            RawSignal::Value(Value::Float(7.0))
        );

        tree.destroy(&call("cJSON_Delete", Capability::Destroy, vec![h(x)]));
        assert_eq!(tree.stats().frees_of(number), 1);
        assert_eq!(tree.stats().live(), 0);
    }

    #[test]
    fn test_parse_error_reports_offset() {
        let mut tree = JsonTree::new();
        let signal = tree.create(&call("cJSON_Parse", Capability::Create, vec![v("{\"a\": [1, 2,, 3]}")]));
        match signal {
            RawSignal::ParseError { offset, .. } => assert_eq!(offset, 12),
            other => panic!("expected parse error, got {other:?}"),
        }
        assert_eq!(tree.stats().allocated, 0);
    }

    #[test]
    fn test_print_parse_round_trip_compares_equal() {
        let mut tree = JsonTree::new();
        let doc = create(
            &mut tree,
            "cJSON_Parse",
            vec![v(r#"{"name": "seqbox", "sizes": [1, 2.5, -3], "ok": true, "none": null}"#)],
        );
        let printed = match tree.query(&call("cJSON_PrintUnformatted", Capability::Query, vec![h(doc)])) {
            RawSignal::Value(Value::Text(text)) => text,
            other => panic!("unexpected {other:?}"),
        };
        let reparsed = create(&mut tree, "cJSON_Parse", vec![v(printed.as_str())]);
        assert_eq!(
            tree.query(&call(
                "cJSON_Compare",
                Capability::Query,
                vec![h(doc), h(reparsed), v(true)]
            )),
            RawSignal::Value(Value::Bool(true))
        );
    }

    #[test]
    fn test_detach_and_kind_of() {
        let mut tree = JsonTree::new();
        let root = create(&mut tree, "cJSON_CreateObject", vec![]);
        let text = create(&mut tree, "cJSON_CreateString", vec![v("hi")]);
        tree.mutate(&call(
            "cJSON_AddItemToObject",
            Capability::Mutate,
            vec![h(root), v("greeting"), h(text)],
        ));
        assert_eq!(tree.kind_of(text), Some(HandleKind::new("json.string")));

        let detached = tree.detach(root, text);
        assert_eq!(detached.native_handle(), Some(text));
        assert_eq!(
            tree.query(&call("cJSON_GetArraySize", Capability::Query, vec![h(root)])),
            RawSignal::Value(Value::Int(0))
        );
        assert_eq!(tree.detach(root, text), RawSignal::null());
    }

    #[test]
    fn test_replace_frees_old_item() {
        let mut tree = JsonTree::new();
        let list = create(&mut tree, "cJSON_CreateArray", vec![]);
        let old = create(&mut tree, "cJSON_CreateNumber", vec![v(1.0)]);
        let new = create(&mut tree, "cJSON_CreateNumber", vec![v(2.0)]);
        tree.mutate(&call("cJSON_AddItemToArray", Capability::Mutate, vec![h(list), h(old)]));
        assert_eq!(
            tree.mutate(&call(
                "cJSON_ReplaceItemInArray",
                Capability::Mutate,
                vec![h(list), v(0), h(new)]
            )),
            RawSignal::Bool(true)
        );
        assert_eq!(tree.stats().frees_of(old), 1);
        assert_eq!(
            tree.query(&call("cJSON_GetArrayItem", Capability::Query, vec![h(list), v(0)]))
                .native_handle(),
            Some(new)
        );
    }

    #[test]
    fn test_double_delete_is_visible_in_stats() {
        let mut tree = JsonTree::new();
        let node = create(&mut tree, "cJSON_CreateNull", vec![]);
        tree.destroy(&call("cJSON_Delete", Capability::Destroy, vec![h(node)]));
        tree.destroy(&call("cJSON_Delete", Capability::Destroy, vec![h(node)]));
        assert_eq!(tree.stats().frees_of(node), 2);
        assert_eq!(tree.stats().invalid_accesses, 1);
    }

    #[test]
    fn test_cyclic_links_are_refused() {
        let mut tree = JsonTree::new();
        let outer = create(&mut tree, "cJSON_CreateArray", vec![]);
        let inner = create(&mut tree, "cJSON_CreateObject", vec![]);
        let link = |tree: &mut JsonTree, function: &str, args| {
            tree.mutate(&call(function, Capability::Mutate, args))
        };

        assert_eq!(
            link(&mut tree, "cJSON_AddItemReferenceToArray", vec![h(outer), h(outer)]),
            RawSignal::Bool(false)
        );
        assert_eq!(
            link(&mut tree, "cJSON_AddItemToArray", vec![h(outer), h(inner)]),
            RawSignal::Bool(true)
        );
        assert_eq!(
            link(&mut tree, "cJSON_AddItemReferenceToObject", vec![h(inner), v("up"), h(outer)]),
            RawSignal::Bool(false)
        );
        let alias = create(&mut tree, "cJSON_CreateArrayReference", vec![h(outer)]);
        assert_eq!(
            link(&mut tree, "cJSON_AddItemToObject", vec![h(inner), v("up"), h(alias)]),
            RawSignal::Bool(false)
        );

        assert_eq!(
            tree.query(&call("cJSON_PrintUnformatted", Capability::Query, vec![h(outer)])),
            RawSignal::Value(Value::Text("[{}]".to_string()))
        );
        tree.destroy(&call("cJSON_Delete", Capability::Destroy, vec![h(alias)]));
        tree.destroy(&call("cJSON_Delete", Capability::Destroy, vec![h(outer)]));
        assert_eq!(tree.stats().live(), 0);
    }

    #[test]
    fn test_print_past_nesting_limit_fails() {
        let mut tree = JsonTree::new();
        let root = create(&mut tree, "cJSON_CreateArray", vec![]);
        let mut parent = root;
        for _ in 0..NESTING_LIMIT + 5 {
            let child = create(&mut tree, "cJSON_CreateArray", vec![]);
            tree.mutate(&call("cJSON_AddItemToArray", Capability::Mutate, vec![h(parent), h(child)]));
            parent = child;
        }

        assert_eq!(
            tree.query(&call("cJSON_PrintUnformatted", Capability::Query, vec![h(root)])),
            RawSignal::null()
        );
        assert_eq!(
            tree.query(&call("cJSON_Compare", Capability::Query, vec![h(root), h(root)])),
            RawSignal::Value(Value::Bool(false))
        );
        tree.destroy(&call("cJSON_Delete", Capability::Destroy, vec![h(root)]));
        assert_eq!(tree.stats().live(), 0);
    }
}
