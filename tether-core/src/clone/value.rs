//! Dynamic Values
//!
//! [`Value`] is a dynamically shaped payload for cells whose contents are not
//! known at compile time (configuration trees, decoded JSON, script state).
//! Its [`DeepClone`] impl applies the cloning rules in order:
//!
//! 1. Scalars (`Null`, `Bool`, `Int`, `Float`, `Str`) are copied.
//! 2. `Array` is cloned element-wise.
//! 3. `Map` and `Set` are rebuilt with cloned keys and values.
//! 4. `Instant`, `Pattern`, `Bytes` and `Error` are reconstructed as new
//!    instances with the same observable fields.
//! 5. `Function` is shared: callables are immutable and cannot be copied.
//! 6. `Object` asks the object for a clone via [`Opaque::clone_object`]. If it
//!    has none, the object is shared and a warning is logged, unless
//!    [`Opaque::share_quietly`] says the sharing is expected.
//! 7. `Record` is cloned field by field.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use regex::Regex;

use super::DeepClone;

/// A dynamically typed value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Absence of a value.
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// An ordered sequence.
    Array(Vec<Value>),
    /// A keyed container with arbitrary keys, in insertion order.
    Map(Vec<(Value, Value)>),
    /// An unordered collection of distinct values, kept in insertion order.
    Set(Vec<Value>),
    /// A point in time.
    Instant(SystemTime),
    /// A compiled pattern matcher.
    Pattern(Regex),
    /// A fixed-size binary buffer.
    Bytes(Box<[u8]>),
    /// An error object.
    Error(ErrorValue),
    /// A callable. Shared, never cloned.
    Function(Callable),
    /// An instance of a user-defined type.
    Object(Arc<dyn Opaque>),
    /// A plain keyed record.
    Record(IndexMap<String, Value>),
}

/// The observable fields of an error object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// A shared function value.
#[derive(Clone)]
pub struct Callable(Arc<dyn Fn(Value) -> Value + Send + Sync>);

impl Callable {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Invoke the function.
    pub fn call(&self, arg: Value) -> Value {
        (self.0)(arg)
    }

    /// Whether both callables are the same function instance.
    pub fn ptr_eq(&self, other: &Callable) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callable(..)")
    }
}

/// A user-defined type stored inside a [`Value`].
///
/// Objects are opaque to the cloning rules. An object that knows how to copy
/// itself implements [`clone_object`](Opaque::clone_object); otherwise it is
/// shared between the cell and its readers.
pub trait Opaque: Any + fmt::Debug + Send + Sync {
    /// Produce an independent copy, or `None` if the object cannot be copied.
    fn clone_object(&self) -> Option<Arc<dyn Opaque>> {
        None
    }

    /// Marker: sharing this object by reference is expected, do not warn.
    fn share_quietly(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
}

impl DeepClone for Value {
    fn deep_clone(&self) -> Self {
        match self {
            Value::Null => Value::Null,
            Value::Bool(b) => Value::Bool(*b),
            Value::Int(n) => Value::Int(*n),
            Value::Float(n) => Value::Float(*n),
            Value::Str(s) => Value::Str(s.clone()),
            Value::Array(items) => Value::Array(items.iter().map(Value::deep_clone).collect()),
            Value::Map(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.deep_clone(), v.deep_clone()))
                    .collect(),
            ),
            Value::Set(items) => Value::Set(items.iter().map(Value::deep_clone).collect()),
            Value::Instant(at) => Value::Instant(*at),
            Value::Pattern(re) => Value::Pattern(rebuild_pattern(re)),
            Value::Bytes(bytes) => Value::Bytes(bytes.to_vec().into_boxed_slice()),
            Value::Error(err) => Value::Error(err.clone()),
            Value::Function(f) => Value::Function(f.clone()),
            Value::Object(object) => Value::Object(clone_object(object)),
            Value::Record(fields) => Value::Record(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_clone()))
                    .collect(),
            ),
        }
    }
}

fn rebuild_pattern(re: &Regex) -> Regex {
    // The source already compiled, so recompiling cannot fail in practice.
    Regex::new(re.as_str()).unwrap_or_else(|_| re.clone())
}

fn clone_object(object: &Arc<dyn Opaque>) -> Arc<dyn Opaque> {
    match catch_unwind(AssertUnwindSafe(|| object.clone_object())) {
        Ok(Some(copy)) => return copy,
        Ok(None) => {}
        Err(_) => {
            tracing::warn!(
                target: "tether_core::clone",
                object = ?object,
                "clone_object panicked; sharing the object by reference"
            );
            return Arc::clone(object);
        }
    }

    if !object.share_quietly() {
        tracing::warn!(
            target: "tether_core::clone",
            object = ?object,
            "object cannot be cloned; sharing it by reference"
        );
    }
    Arc::clone(object)
}

impl Value {
    /// Look up a field of a `Record`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) => fields.get(key),
            _ => None,
        }
    }

    /// Mutable access to a field of a `Record`.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        match self {
            Value::Record(fields) => fields.get_mut(key),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert to JSON.
    ///
    /// Lossy for variants JSON cannot express: instants become milliseconds
    /// since the Unix epoch, patterns their source text, maps an array of
    /// `[key, value]` pairs, and functions and objects `null`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Value::Null | Value::Function(_) | Value::Object(_) => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::from(*n),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::Array(items) | Value::Set(items) => {
                Json::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(entries) => Json::Array(
                entries
                    .iter()
                    .map(|(k, v)| Json::Array(vec![k.to_json(), v.to_json()]))
                    .collect(),
            ),
            Value::Instant(at) => {
                let millis = at
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                Json::from(millis)
            }
            Value::Pattern(re) => Json::String(re.as_str().to_owned()),
            Value::Bytes(bytes) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
            Value::Error(err) => serde_json::json!({ "name": err.name, "message": err.message }),
            Value::Record(fields) => Json::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::Str(s),
            Json::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Json::Object(fields) => Value::Record(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) | (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Instant(a), Value::Instant(b)) => a == b,
            (Value::Pattern(a), Value::Pattern(b)) => a.as_str() == b.as_str(),
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Record(a), Value::Record(b)) => a == b,
            _ => false,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_subscriber::layer::{Context, SubscriberExt as _};
    use tracing_subscriber::util::SubscriberInitExt as _;

    #[derive(Debug)]
    struct Socket {
        fd: i32,
    }

    impl Opaque for Socket {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug)]
    struct Counter {
        count: i64,
    }

    impl Opaque for Counter {
        fn clone_object(&self) -> Option<Arc<dyn Opaque>> {
            Some(Arc::new(Counter { count: self.count }))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn record_mutation_does_not_leak() {
        let original = Value::from(json!({ "a": 1, "nested": { "b": 2 } }));
        let mut copy = original.deep_clone();

        *copy.get_mut("nested").and_then(|n| n.get_mut("b")).unwrap() = Value::Int(99);

        assert_eq!(
            original.get("nested").and_then(|n| n.get("b")),
            Some(&Value::Int(2))
        );
    }

    #[test]
    fn functions_are_shared() {
        let f = Callable::new(|v| v);
        let value = Value::Array(vec![Value::Function(f.clone())]);

        let Value::Array(items) = value.deep_clone() else {
            panic!("expected array");
        };
        let Value::Function(copied) = &items[0] else {
            panic!("expected function");
        };
        assert!(copied.ptr_eq(&f));
    }

    #[test]
    fn uncloneable_objects_are_shared() {
        let socket: Arc<dyn Opaque> = Arc::new(Socket { fd: 3 });
        let value = Value::Object(socket.clone());

        let Value::Object(copied) = value.deep_clone() else {
            panic!("expected object");
        };
        assert!(Arc::ptr_eq(&copied, &socket));
        assert_eq!(copied.as_any().downcast_ref::<Socket>().map(|s| s.fd), Some(3));
    }

    #[derive(Debug)]
    struct Lease {
        slot: u32,
    }

    impl Opaque for Lease {
        fn share_quietly(&self) -> bool {
            true
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug)]
    struct Brittle;

    impl Opaque for Brittle {
        fn clone_object(&self) -> Option<Arc<dyn Opaque>> {
            panic!("cannot copy");
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Counts warnings emitted under the clone target.
    struct CloneWarnings {
        count: Arc<AtomicUsize>,
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for CloneWarnings {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let meta = event.metadata();
            if *meta.level() == tracing::Level::WARN && meta.target() == "tether_core::clone" {
                self.count.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn clone_warnings(value: &Value) -> usize {
        let count = Arc::new(AtomicUsize::new(0));
        let layer = CloneWarnings {
            count: count.clone(),
        };
        let _guard = tracing_subscriber::registry().with(layer).set_default();

        let _copy = value.deep_clone();
        count.load(Ordering::SeqCst)
    }

    #[test]
    fn sharing_an_uncloneable_object_warns_once() {
        let value = Value::Array(vec![Value::Object(Arc::new(Socket { fd: 3 }))]);
        assert_eq!(clone_warnings(&value), 1);
    }

    #[test]
    fn quiet_objects_are_shared_without_warning() {
        let value = Value::Object(Arc::new(Lease { slot: 1 }));
        assert_eq!(clone_warnings(&value), 0);

        let Value::Object(copied) = value.deep_clone() else {
            panic!("expected object");
        };
        assert_eq!(copied.as_any().downcast_ref::<Lease>().map(|l| l.slot), Some(1));
    }

    #[test]
    fn panicking_clone_is_shared_with_warning() {
        let value = Value::Object(Arc::new(Brittle));
        assert_eq!(clone_warnings(&value), 1);
    }

    #[test]
    fn cloneable_objects_do_not_warn() {
        let value = Value::Object(Arc::new(Counter { count: 7 }));
        assert_eq!(clone_warnings(&value), 0);
    }

    #[test]
    fn cloneable_objects_use_their_clone() {
        let counter: Arc<dyn Opaque> = Arc::new(Counter { count: 7 });
        let value = Value::Object(counter.clone());

        let Value::Object(copied) = value.deep_clone() else {
            panic!("expected object");
        };
        assert!(!Arc::ptr_eq(&copied, &counter));
        assert_eq!(
            copied.as_any().downcast_ref::<Counter>().map(|c| c.count),
            Some(7)
        );
    }

    #[test]
    fn special_values_are_rebuilt() {
        let value = Value::Array(vec![
            Value::Pattern(Regex::new("^a+$").unwrap()),
            Value::Bytes(vec![1, 2, 3].into_boxed_slice()),
            Value::Error(ErrorValue::new("TypeError", "bad")),
            Value::Map(vec![(Value::Int(1), Value::from("one"))]),
        ]);

        assert_eq!(value.deep_clone(), value);
    }

    #[test]
    fn json_round_trip_for_plain_data() {
        let json = json!({ "name": "tether", "tags": ["a", "b"], "n": 3 });
        assert_eq!(Value::from(json.clone()).to_json(), json);
    }
}
