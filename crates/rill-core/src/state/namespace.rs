//! The shared evaluation namespace.

use rustc_hash::FxHashMap;

use super::value::Value;

/// Mapping from name to value shared by every cell of one engine instance.
///
/// The namespace is owned by whoever drives execution (a controller, a
/// runner) and passed explicitly to each execution call.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    values: FxHashMap<String, Value>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Bind a name, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    /// Unbind every name in `names`.
    pub fn remove_all<'a>(&mut self, names: impl IntoIterator<Item = &'a String>) {
        for name in names {
            self.values.remove(name);
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Namespace {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl<K: Into<String>> Extend<(K, Value)> for Namespace {
    fn extend<I: IntoIterator<Item = (K, Value)>>(&mut self, iter: I) {
        self.values
            .extend(iter.into_iter().map(|(k, v)| (k.into(), v)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_remove() {
        let mut ns = Namespace::new();
        assert!(ns.insert("x", Value::Int(1)).is_none());
        assert_eq!(ns.insert("x", Value::Int(2)), Some(Value::Int(1)));
        assert_eq!(ns.get("x"), Some(&Value::Int(2)));
        assert_eq!(ns.remove("x"), Some(Value::Int(2)));
        assert!(ns.is_empty());
    }

    #[test]
    fn test_remove_all() {
        let mut ns: Namespace = [("a", Value::Int(1)), ("b", Value::Int(2)), ("c", Value::Int(3))]
            .into_iter()
            .collect();
        let names = vec!["a".to_string(), "c".to_string()];
        ns.remove_all(&names);
        assert_eq!(ns.names().collect::<Vec<_>>(), vec!["b"]);
    }
}
