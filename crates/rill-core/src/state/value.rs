//! Runtime values bound in a namespace.
//!
//! Containers (`List`, `Map`, `Object`) have reference semantics: cloning a
//! [`Value`] aliases the underlying storage, the same way two names bound to
//! one object do in a dynamic language. Only the
//! [`DuplicationRegistry`](super::DuplicationRegistry) produces independent
//! copies.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use super::DEFAULT_MAX_DEPTH;
use crate::execute::CellError;

/// Shared, mutable storage behind container values.
pub type Shared<T> = Arc<RwLock<T>>;

/// Opaque host data carried by [`Value::Object`].
pub type ObjectData = Box<dyn Any + Send + Sync>;

type NativeFn = dyn Fn(&[Value]) -> std::result::Result<Value, CellError> + Send + Sync;

pub(crate) fn read<T: ?Sized>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T: ?Sized>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

thread_local! {
    /// Containers on the current recursive walk, outermost first.
    static VISITING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// A container's place on the current walk; popped on drop.
struct Visit;

impl Visit {
    /// `None` if `storage` is already being walked (a container that reaches
    /// itself) or the walk is deeper than [`DEFAULT_MAX_DEPTH`].
    fn enter<T>(storage: &Shared<T>) -> Option<Visit> {
        let key = Arc::as_ptr(storage).cast::<()>() as usize;
        VISITING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.len() >= DEFAULT_MAX_DEPTH || stack.contains(&key) {
                return None;
            }
            stack.push(key);
            Some(Visit)
        })
    }
}

impl Drop for Visit {
    fn drop(&mut self) {
        VISITING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Kind of a value, used to pick a duplicator and to decide whether a
/// value can be passed to a cell without copying.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    None,
    Bool,
    Int,
    Float,
    Str,
    List,
    Map,
    Function,
    Module,
    /// Host object, keyed by its kind tag.
    Object(Arc<str>),
}

impl ValueKind {
    /// Values of this kind cannot be observed to change, so sharing them
    /// between cells is indistinguishable from copying them.
    pub fn is_safe(&self) -> bool {
        matches!(
            self,
            ValueKind::None
                | ValueKind::Bool
                | ValueKind::Int
                | ValueKind::Float
                | ValueKind::Str
                | ValueKind::Function
                | ValueKind::Module
        )
    }

    /// Primitive immutable scalar.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            ValueKind::None | ValueKind::Bool | ValueKind::Int | ValueKind::Float | ValueKind::Str
        )
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::None => write!(f, "none"),
            ValueKind::Bool => write!(f, "bool"),
            ValueKind::Int => write!(f, "int"),
            ValueKind::Float => write!(f, "float"),
            ValueKind::Str => write!(f, "str"),
            ValueKind::List => write!(f, "list"),
            ValueKind::Map => write!(f, "map"),
            ValueKind::Function => write!(f, "function"),
            ValueKind::Module => write!(f, "module"),
            ValueKind::Object(kind) => write!(f, "object<{kind}>"),
        }
    }
}

/// A pure function value.
#[derive(Clone)]
pub struct Function {
    name: Arc<str>,
    call: Arc<NativeFn>,
}

impl Function {
    pub fn new(
        name: impl Into<Arc<str>>,
        call: impl Fn(&[Value]) -> std::result::Result<Value, CellError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            call: Arc::new(call),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &[Value]) -> std::result::Result<Value, CellError> {
        (self.call)(args)
    }
}

/// Opaque host object with a kind tag.
#[derive(Clone)]
pub struct Object {
    kind: Arc<str>,
    data: Shared<ObjectData>,
}

impl Object {
    pub fn new<T: Any + Send + Sync>(kind: impl Into<Arc<str>>, data: T) -> Self {
        Self::from_boxed(kind, Box::new(data))
    }

    pub(crate) fn from_boxed(kind: impl Into<Arc<str>>, data: ObjectData) -> Self {
        Self {
            kind: kind.into(),
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub fn kind(&self) -> &Arc<str> {
        &self.kind
    }

    /// Read the object as `T`. Returns `None` if it holds another type.
    pub fn with<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = read(&self.data);
        guard.downcast_ref::<T>().map(f)
    }

    /// Mutate the object in place as `T`.
    pub fn with_mut<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = write(&self.data);
        guard.downcast_mut::<T>().map(f)
    }
}

/// A value bound to a name.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Shared<Vec<Value>>),
    Map(Shared<BTreeMap<String, Value>>),
    Function(Function),
    Module(Arc<str>),
    Object(Object),
    /// Never duplicated by isolated execution; mutations are visible to every cell.
    NoCopy(Box<Value>),
    /// Duplicated one level deep by isolated execution.
    ShallowCopy(Box<Value>),
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(Arc::new(RwLock::new(items.into_iter().collect())))
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Map(Arc::new(RwLock::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )))
    }

    pub fn function(
        name: impl Into<Arc<str>>,
        call: impl Fn(&[Value]) -> std::result::Result<Value, CellError> + Send + Sync + 'static,
    ) -> Self {
        Value::Function(Function::new(name, call))
    }

    pub fn module(name: impl Into<Arc<str>>) -> Self {
        Value::Module(name.into())
    }

    pub fn object<T: Any + Send + Sync>(kind: impl Into<Arc<str>>, data: T) -> Self {
        Value::Object(Object::new(kind, data))
    }

    /// Mark this value as shared across cells even under isolated execution.
    pub fn no_copy(self) -> Self {
        Value::NoCopy(Box::new(self.into_unmarked()))
    }

    /// Mark this value for a one-level copy under isolated execution.
    pub fn shallow_copy(self) -> Self {
        Value::ShallowCopy(Box::new(self.into_unmarked()))
    }

    /// The value with any copy marker removed.
    pub fn unmarked(&self) -> &Value {
        match self {
            Value::NoCopy(inner) | Value::ShallowCopy(inner) => inner.unmarked(),
            other => other,
        }
    }

    fn into_unmarked(self) -> Value {
        match self {
            Value::NoCopy(inner) | Value::ShallowCopy(inner) => inner.into_unmarked(),
            other => other,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self.unmarked() {
            Value::None => ValueKind::None,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
            Value::Function(_) => ValueKind::Function,
            Value::Module(_) => ValueKind::Module,
            Value::Object(o) => ValueKind::Object(o.kind.clone()),
            Value::NoCopy(inner) | Value::ShallowCopy(inner) => inner.kind(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.unmarked() {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.unmarked() {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self.unmarked() {
            Value::Float(x) => Some(*x),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.unmarked() {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self.unmarked() {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Snapshot of a list's items (aliasing nested containers).
    pub fn items(&self) -> Option<Vec<Value>> {
        match self.unmarked() {
            Value::List(items) => Some(read(items).clone()),
            _ => None,
        }
    }

    /// Number of items in a list or entries in a map.
    pub fn len(&self) -> Option<usize> {
        match self.unmarked() {
            Value::List(items) => Some(read(items).len()),
            Value::Map(entries) => Some(read(entries).len()),
            Value::Str(s) => Some(s.chars().count()),
            _ => None,
        }
    }

    /// Append to a list in place. Every alias observes the change.
    pub fn push(&self, item: Value) -> std::result::Result<(), CellError> {
        match self.unmarked() {
            Value::List(items) => {
                write(items).push(item);
                Ok(())
            }
            other => Err(CellError::raised(format!(
                "cannot push onto a value of kind {}",
                other.kind()
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        match self.unmarked() {
            Value::Map(entries) => read(entries).get(key).cloned(),
            _ => None,
        }
    }

    /// Insert into a map in place. Every alias observes the change.
    pub fn insert(&self, key: impl Into<String>, value: Value) -> std::result::Result<(), CellError> {
        match self.unmarked() {
            Value::Map(entries) => {
                write(entries).insert(key.into(), value);
                Ok(())
            }
            other => Err(CellError::raised(format!(
                "cannot insert into a value of kind {}",
                other.kind()
            ))),
        }
    }

    /// Call a function value.
    pub fn call(&self, args: &[Value]) -> std::result::Result<Value, CellError> {
        match self.unmarked() {
            Value::Function(f) => f.call(args),
            other => Err(CellError::raised(format!(
                "value of kind {} is not callable",
                other.kind()
            ))),
        }
    }

    /// Whether both values refer to the same underlying container.
    pub fn same_storage(&self, other: &Value) -> bool {
        match (self.unmarked(), other.unmarked()) {
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(&a.data, &b.data),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(&a.call, &b.call),
            _ => false,
        }
    }

    /// JSON view of the value for presentation.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self.unmarked(), other.unmarked()) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                Arc::ptr_eq(a, b) || Visit::enter(a).is_some_and(|_visit| *read(a) == *read(b))
            }
            (Value::Map(a), Value::Map(b)) => {
                Arc::ptr_eq(a, b) || Visit::enter(a).is_some_and(|_visit| *read(a) == *read(b))
            }
            (a, b) => a.same_storage(b),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => match Visit::enter(items) {
                Some(_visit) => f.debug_list().entries(read(items).iter()).finish(),
                None => write!(f, "[...]"),
            },
            Value::Map(entries) => match Visit::enter(entries) {
                Some(_visit) => f.debug_map().entries(read(entries).iter()).finish(),
                None => write!(f, "{{...}}"),
            },
            Value::Function(func) => write!(f, "<function {}>", func.name),
            Value::Module(name) => write!(f, "<module {name}>"),
            Value::Object(o) => write!(f, "<{}>", o.kind),
            Value::NoCopy(inner) => write!(f, "NoCopy({inner:?})"),
            Value::ShallowCopy(inner) => write!(f, "ShallowCopy({inner:?})"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.unmarked() {
            Value::None => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::Str(s) => serializer.serialize_str(s),
            Value::List(items) => {
                let Some(_visit) = Visit::enter(items) else {
                    return serializer.serialize_str("[...]");
                };
                let items = read(items);
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items.iter() {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let Some(_visit) = Visit::enter(entries) else {
                    return serializer.serialize_str("{...}");
                };
                let entries = read(entries);
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries.iter() {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            other => serializer.serialize_str(&format!("{other:?}")),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_aliases_containers() {
        let a = Value::list([Value::Int(1)]);
        let b = a.clone();
        b.push(Value::Int(2)).unwrap();
        assert_eq!(a.len(), Some(2));
        assert!(a.same_storage(&b));
    }

    #[test]
    fn test_markers_are_transparent() {
        let v = Value::list([Value::Int(1)]).no_copy();
        assert_eq!(v.kind(), ValueKind::List);
        assert_eq!(v.len(), Some(1));
        // Re-marking replaces the marker rather than nesting it
        assert!(matches!(v.clone().shallow_copy(), Value::ShallowCopy(inner) if matches!(*inner, Value::List(_))));
    }

    #[test]
    fn test_structural_equality() {
        assert_eq!(Value::list([Value::Int(1)]), Value::list([Value::Int(1)]));
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::str("a"), Value::str("b"));
    }

    #[test]
    fn test_object_access() {
        let obj = Value::object("counter", 5_i64);
        let o = obj.as_object().unwrap();
        o.with_mut::<i64, _>(|n| *n += 1);
        assert_eq!(o.with::<i64, _>(|n| *n), Some(6));
        assert_eq!(o.with::<String, _>(|s| s.len()), None);
    }

    #[test]
    fn test_self_containing_list() {
        let xs = Value::list([]);
        xs.push(xs.clone()).unwrap();
        assert_eq!(format!("{xs:?}"), "[[...]]");
        assert_eq!(xs.to_json(), serde_json::json!(["[...]"]));
        assert_eq!(xs, xs.clone());

        let ys = Value::list([]);
        ys.push(ys.clone()).unwrap();
        assert_ne!(xs, ys);
    }

    #[test]
    fn test_self_containing_map() {
        let m = Value::map([("n", Value::Int(1))]);
        m.insert("me", m.clone()).unwrap();
        assert_eq!(m.to_json(), serde_json::json!({"me": "{...}", "n": 1}));
        assert!(format!("{m:?}").contains("{...}"));
    }

    #[test]
    fn test_to_json() {
        let v = Value::map([("xs", Value::list([Value::Int(1), Value::Bool(true)]))]);
        assert_eq!(v.to_json(), serde_json::json!({"xs": [1, true]}));
        let f = Value::function("double", |args| Ok(args[0].clone()));
        assert_eq!(f.to_json(), serde_json::json!("<function double>"));
    }

    #[test]
    fn test_call_function() {
        let double = Value::function("double", |args| {
            let n = args.first().and_then(Value::as_int).unwrap_or_default();
            Ok(Value::Int(n * 2))
        });
        assert_eq!(double.call(&[Value::Int(21)]).unwrap(), Value::Int(42));
        assert!(Value::Int(1).call(&[]).is_err());
    }
}
