//! Deep duplication of values for isolated execution.
//!
//! Each value kind is handled by a [`Duplicator`] looked up in a
//! [`DuplicationRegistry`]. Built-in containers are registered by default;
//! host objects must be registered by their kind tag, otherwise duplicating
//! them fails.

use std::any::Any;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use thiserror::Error;

use super::value::{Object, ObjectData, Value, ValueKind, read};

/// Containers nested deeper than this are assumed to be self-referential.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Why a value could not be duplicated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DuplicationError {
    #[error("no duplicator registered for {0}")]
    Unregistered(String),

    #[error("duplicator for {kind} rejected the value")]
    Rejected { kind: String },

    #[error("value nested deeper than {0} levels (self-referential container?)")]
    TooDeep(usize),
}

/// Capability to copy values of one kind.
pub trait Duplicator: Send + Sync {
    /// Whether this particular value can be duplicated.
    fn is_duplicable(&self, value: &Value, registry: &DuplicationRegistry) -> bool;

    /// Produce an independent copy. Nested values go back through `registry`.
    fn duplicate(
        &self,
        value: &Value,
        registry: &DuplicationRegistry,
        depth: usize,
    ) -> Result<Value, DuplicationError>;
}

/// Immutable values are returned as-is.
struct Immutable;

impl Duplicator for Immutable {
    fn is_duplicable(&self, _: &Value, _: &DuplicationRegistry) -> bool {
        true
    }

    fn duplicate(&self, value: &Value, _: &DuplicationRegistry, _: usize) -> Result<Value, DuplicationError> {
        Ok(value.clone())
    }
}

struct ListDuplicator;

impl Duplicator for ListDuplicator {
    fn is_duplicable(&self, value: &Value, registry: &DuplicationRegistry) -> bool {
        value
            .items()
            .is_some_and(|items| items.iter().all(|item| registry.handles(item)))
    }

    fn duplicate(
        &self,
        value: &Value,
        registry: &DuplicationRegistry,
        depth: usize,
    ) -> Result<Value, DuplicationError> {
        let Value::List(items) = value.unmarked() else {
            return Err(DuplicationError::Rejected { kind: value.kind().to_string() });
        };
        let snapshot = read(items).clone();
        let copied = snapshot
            .iter()
            .map(|item| registry.duplicate_at(item, depth + 1))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::List(Arc::new(RwLock::new(copied))))
    }
}

struct MapDuplicator;

impl Duplicator for MapDuplicator {
    fn is_duplicable(&self, value: &Value, registry: &DuplicationRegistry) -> bool {
        match value.unmarked() {
            Value::Map(entries) => read(entries).values().all(|v| registry.handles(v)),
            _ => false,
        }
    }

    fn duplicate(
        &self,
        value: &Value,
        registry: &DuplicationRegistry,
        depth: usize,
    ) -> Result<Value, DuplicationError> {
        let Value::Map(entries) = value.unmarked() else {
            return Err(DuplicationError::Rejected { kind: value.kind().to_string() });
        };
        let snapshot = read(entries).clone();
        let mut copied = BTreeMap::new();
        for (k, v) in &snapshot {
            copied.insert(k.clone(), registry.duplicate_at(v, depth + 1)?);
        }
        Ok(Value::Map(Arc::new(RwLock::new(copied))))
    }
}

/// Duplicates host objects of type `T` through `Clone`.
struct CloneDuplicator<T>(PhantomData<fn() -> T>);

impl<T: Any + Clone + Send + Sync> Duplicator for CloneDuplicator<T> {
    fn is_duplicable(&self, value: &Value, _: &DuplicationRegistry) -> bool {
        value.as_object().is_some_and(|o| o.with::<T, _>(|_| ()).is_some())
    }

    fn duplicate(&self, value: &Value, _: &DuplicationRegistry, _: usize) -> Result<Value, DuplicationError> {
        let object = value
            .as_object()
            .ok_or_else(|| DuplicationError::Rejected { kind: value.kind().to_string() })?;
        let copy: ObjectData = object
            .with::<T, _>(|data| Box::new(data.clone()) as ObjectData)
            .ok_or_else(|| DuplicationError::Rejected { kind: value.kind().to_string() })?;
        Ok(Value::Object(Object::from_boxed(object.kind().clone(), copy)))
    }
}

/// Registry of duplicators keyed by value kind.
#[derive(Clone)]
pub struct DuplicationRegistry {
    duplicators: FxHashMap<ValueKind, Arc<dyn Duplicator>>,
    max_depth: usize,
}

impl DuplicationRegistry {
    /// Registry with duplicators for every built-in kind.
    pub fn new() -> Self {
        let mut registry = Self {
            duplicators: FxHashMap::default(),
            max_depth: DEFAULT_MAX_DEPTH,
        };
        let immutable: Arc<dyn Duplicator> = Arc::new(Immutable);
        for kind in [
            ValueKind::None,
            ValueKind::Bool,
            ValueKind::Int,
            ValueKind::Float,
            ValueKind::Str,
            ValueKind::Function,
            ValueKind::Module,
        ] {
            registry.duplicators.insert(kind, immutable.clone());
        }
        registry.duplicators.insert(ValueKind::List, Arc::new(ListDuplicator));
        registry.duplicators.insert(ValueKind::Map, Arc::new(MapDuplicator));
        registry
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Register host objects of kind `kind` holding a `T`, copied with `Clone`.
    pub fn register_clone<T: Any + Clone + Send + Sync>(&mut self, kind: impl Into<Arc<str>>) {
        self.register(
            ValueKind::Object(kind.into()),
            CloneDuplicator::<T>(PhantomData),
        );
    }

    /// Register a custom duplicator for a kind, replacing any existing one.
    pub fn register(&mut self, kind: ValueKind, duplicator: impl Duplicator + 'static) {
        self.duplicators.insert(kind, Arc::new(duplicator));
    }

    /// Whether a duplicator exists for the value's kind. Does not look inside containers.
    fn handles(&self, value: &Value) -> bool {
        matches!(value, Value::NoCopy(_)) || self.duplicators.contains_key(&value.kind())
    }

    /// Whether `value` can be duplicated. Containers are checked one level deep.
    pub fn is_duplicable(&self, value: &Value) -> bool {
        match value {
            Value::NoCopy(_) => true,
            Value::ShallowCopy(inner) => self.is_duplicable(inner),
            _ => self
                .duplicators
                .get(&value.kind())
                .is_some_and(|d| d.is_duplicable(value, self)),
        }
    }

    /// Deep-copy a value, honouring `NoCopy` and `ShallowCopy` markers.
    pub fn duplicate(&self, value: &Value) -> Result<Value, DuplicationError> {
        self.duplicate_at(value, 0)
    }

    fn duplicate_at(&self, value: &Value, depth: usize) -> Result<Value, DuplicationError> {
        if depth > self.max_depth {
            return Err(DuplicationError::TooDeep(self.max_depth));
        }
        match value {
            Value::NoCopy(_) => Ok(value.clone()),
            Value::ShallowCopy(inner) => Ok(Value::ShallowCopy(Box::new(shallow(inner)))),
            _ => {
                let kind = value.kind();
                let duplicator = self
                    .duplicators
                    .get(&kind)
                    .ok_or_else(|| DuplicationError::Unregistered(kind.to_string()))?;
                duplicator.duplicate(value, self, depth)
            }
        }
    }
}

impl Default for DuplicationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One-level copy: a fresh container whose items alias the original items.
fn shallow(value: &Value) -> Value {
    match value.unmarked() {
        Value::List(items) => Value::List(Arc::new(RwLock::new(read(items).clone()))),
        Value::Map(entries) => Value::Map(Arc::new(RwLock::new(read(entries).clone()))),
        other => other.clone(),
    }
}
