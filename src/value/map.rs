//! The ordered map behind [`Value::Map`](crate::value::Value) values.
//!
//! Insertion order is preserved and duplicate keys overwrite the value
//! without changing position. Lookups by borrowed string go through
//! [`KeyRef`] and never allocate.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use indexmap::map::Entry;
use indexmap::{Equivalent, IndexMap};

use crate::value::Value;

/// A map key: either an interned string (the common case) or an
/// arbitrary value.
///
/// String-valued [`Value`] keys are normalized into the string form on
/// insertion so that a later lookup by `&str` finds them.
#[derive(Debug, Clone)]
pub enum Key {
    Str(Arc<str>),
    Value(Value),
}

impl Key {
    /// Normalizing constructor: string values become string keys.
    pub fn from_value(value: Value) -> Key {
        match value.as_str() {
            Some(s) => Key::Str(Arc::from(s)),
            None => Key::Value(value),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::Str(s) => Some(s),
            Key::Value(_) => None,
        }
    }

    /// The key as a value, for enumeration.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Str(s) => Value::from(&**s),
            Key::Value(v) => v.clone(),
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Key::Str(a), Key::Str(b)) => a == b,
            (Key::Value(a), Key::Value(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Key::Str(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            Key::Value(v) => {
                1u8.hash(state);
                v.hash(state);
            }
        }
    }
}

/// Borrowed form of [`Key`] for allocation-free lookups.
#[derive(Debug, Clone, Copy)]
pub enum KeyRef<'a> {
    Str(&'a str),
    Value(&'a Value),
}

impl<'a> KeyRef<'a> {
    /// Normalizing constructor mirroring [`Key::from_value`].
    pub fn from_value(value: &'a Value) -> KeyRef<'a> {
        match value.as_str() {
            Some(s) => KeyRef::Str(s),
            None => KeyRef::Value(value),
        }
    }
}

impl Hash for KeyRef<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Must mirror `Key::hash` exactly.
        match self {
            KeyRef::Str(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            KeyRef::Value(v) => {
                1u8.hash(state);
                v.hash(state);
            }
        }
    }
}

impl Equivalent<Key> for KeyRef<'_> {
    fn equivalent(&self, key: &Key) -> bool {
        match (self, key) {
            (KeyRef::Str(a), Key::Str(b)) => *a == &**b,
            (KeyRef::Value(a), Key::Value(b)) => *a == b,
            _ => false,
        }
    }
}

/// An insertion-ordered map from [`Key`] to [`Value`].
///
/// Thin wrapper over [`IndexMap`] that exposes only the operations the
/// engine needs: insert-or-update, lookup, delete in expected O(1) and
/// ordered enumeration in O(n).
#[derive(Clone, Default)]
pub struct ValueMap {
    inner: IndexMap<Key, Value>,
}

impl ValueMap {
    pub fn new() -> ValueMap {
        ValueMap::default()
    }

    pub fn with_capacity(n: usize) -> ValueMap {
        ValueMap {
            inner: IndexMap::with_capacity(n),
        }
    }

    /// Insert or update. An existing key keeps its position.
    pub fn insert(&mut self, key: Key, value: Value) {
        match self.inner.entry(key) {
            Entry::Occupied(mut slot) => {
                slot.insert(value);
            }
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
    }

    pub fn get(&self, key: &KeyRef<'_>) -> Option<&Value> {
        self.inner.get(key)
    }

    pub fn get_str(&self, name: &str) -> Option<&Value> {
        self.inner.get(&KeyRef::Str(name))
    }

    /// Remove a key, preserving the order of the remaining entries.
    pub fn remove(&mut self, key: &KeyRef<'_>) -> Option<Value> {
        self.inner.shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key(&self, key: &KeyRef<'_>) -> bool {
        self.inner.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.inner.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.inner.keys()
    }

    pub fn get_index(&self, idx: usize) -> Option<(&Key, &Value)> {
        self.inner.get_index(idx)
    }
}

impl fmt::Debug for ValueMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in self.iter() {
            match key {
                Key::Str(s) => map.key(&&**s),
                Key::Value(v) => map.key(v),
            };
            map.value(value);
        }
        map.finish()
    }
}

impl PartialEq for ValueMap {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl FromIterator<(Key, Value)> for ValueMap {
    fn from_iter<T: IntoIterator<Item = (Key, Value)>>(iter: T) -> Self {
        let mut map = ValueMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_preserved() {
        let mut map = ValueMap::new();
        map.insert(Key::Str("b".into()), Value::from(1));
        map.insert(Key::Str("a".into()), Value::from(2));
        map.insert(Key::Str("c".into()), Value::from(3));
        let keys: Vec<_> = map.keys().filter_map(|k| k.as_str()).collect();
        assert_eq!(keys, ["b", "a", "c"]);
    }

    #[test]
    fn test_overwrite_keeps_position() {
        let mut map = ValueMap::new();
        map.insert(Key::Str("x".into()), Value::from(1));
        map.insert(Key::Str("y".into()), Value::from(2));
        map.insert(Key::Str("x".into()), Value::from(99));
        let entries: Vec<_> = map
            .iter()
            .map(|(k, v)| (k.as_str().unwrap().to_string(), v.clone()))
            .collect();
        assert_eq!(entries[0], ("x".to_string(), Value::from(99)));
        assert_eq!(entries[1], ("y".to_string(), Value::from(2)));
    }

    #[test]
    fn test_string_value_key_normalized() {
        let mut map = ValueMap::new();
        map.insert(Key::from_value(Value::from("name")), Value::from("Alice"));
        assert_eq!(map.get_str("name"), Some(&Value::from("Alice")));
    }

    #[test]
    fn test_non_string_keys() {
        let mut map = ValueMap::new();
        map.insert(Key::from_value(Value::from(42)), Value::from("answer"));
        let key = Value::from(42);
        assert_eq!(
            map.get(&KeyRef::from_value(&key)),
            Some(&Value::from("answer"))
        );
    }
}
