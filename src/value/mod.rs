//! The runtime value model.
//!
//! Expressions produce [`Value`]s during rendering. When a value
//! reaches emit position it is formatted through the active escape
//! mode; internally types are preserved so conditions, arithmetic, and
//! comparisons operate on the real data.
//!
//! Values are cheap to clone: scalars copy, strings and containers
//! share their storage behind `Arc` and copy on write.
//!
//! Conversion from common Rust types is provided via `From` impls:
//!
//! ```rust
//! use loomtex::Value;
//!
//! let s: Value = "hello".into();
//! let n: Value = 42i64.into();
//! let b: Value = true.into();
//! let a: Value = vec!["a", "b"].into();
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{Error, ErrorKind};

pub(crate) mod iter;
pub(crate) mod map;
pub(crate) mod object;
pub(crate) mod ops;

pub use iter::ValueIter;
pub use map::{Key, KeyRef, ValueMap};
pub use object::{Object, ObjectKind, SeqObject, StructObject};

/// Marks whether a string value bypasses auto-escaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StringKind {
    Normal,
    Safe,
}

/// Distinguishes plain maps from keyword-argument maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MapKind {
    Normal,
    Kwargs,
}

/// The internal tagged representation of a value.
#[derive(Clone)]
pub(crate) enum ValueRepr {
    Undefined,
    None,
    Bool(bool),
    I64(i64),
    U64(u64),
    I128(i128),
    U128(u128),
    F64(f64),
    String(Arc<str>, StringKind),
    Bytes(Arc<Vec<u8>>),
    Seq(Arc<Vec<Value>>),
    Map(Arc<ValueMap>, MapKind),
    Dynamic(Arc<dyn object::Object>),
    Invalid(Arc<str>),
}

/// A template runtime value.
///
/// The empty default is [`Value::UNDEFINED`].
#[derive(Clone)]
pub struct Value(pub(crate) ValueRepr);

/// Coarse classification of a value, also used as the cross-kind
/// ordering rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueKind {
    Undefined,
    None,
    Bool,
    Number,
    String,
    Bytes,
    Seq,
    Map,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Undefined => "undefined",
            ValueKind::None => "none",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Bytes => "bytes",
            ValueKind::Seq => "sequence",
            ValueKind::Map => "map",
        };
        f.write_str(name)
    }
}

impl Default for Value {
    fn default() -> Value {
        Value::UNDEFINED
    }
}

impl Value {
    /// The singleton for "not present".
    pub const UNDEFINED: Value = Value(ValueRepr::Undefined);

    /// The singleton for an explicit null.
    pub const NONE: Value = Value(ValueRepr::None);

    /// Create a string value that bypasses auto-escaping.
    pub fn from_safe_string(s: String) -> Value {
        Value(ValueRepr::String(Arc::from(s), StringKind::Safe))
    }

    /// Wrap a dynamic object.
    pub fn from_object<T: object::Object + 'static>(object: T) -> Value {
        Value(ValueRepr::Dynamic(Arc::new(object)))
    }

    pub(crate) fn from_object_arc(object: Arc<dyn object::Object>) -> Value {
        Value(ValueRepr::Dynamic(object))
    }

    /// Create a byte-string value.
    pub fn from_bytes(bytes: Vec<u8>) -> Value {
        Value(ValueRepr::Bytes(Arc::new(bytes)))
    }

    /// Create a map value flagged as keyword arguments.
    pub(crate) fn from_kwargs(map: ValueMap) -> Value {
        Value(ValueRepr::Map(Arc::new(map), MapKind::Kwargs))
    }

    /// A placeholder produced when a value could not be represented;
    /// operations on it fail with the recorded detail.
    pub(crate) fn invalid(detail: impl Into<String>) -> Value {
        Value(ValueRepr::Invalid(Arc::from(detail.into())))
    }

    pub fn kind(&self) -> ValueKind {
        match &self.0 {
            ValueRepr::Undefined => ValueKind::Undefined,
            ValueRepr::None => ValueKind::None,
            ValueRepr::Bool(_) => ValueKind::Bool,
            ValueRepr::I64(_)
            | ValueRepr::U64(_)
            | ValueRepr::I128(_)
            | ValueRepr::U128(_)
            | ValueRepr::F64(_) => ValueKind::Number,
            ValueRepr::String(..) => ValueKind::String,
            ValueRepr::Bytes(_) => ValueKind::Bytes,
            ValueRepr::Seq(_) => ValueKind::Seq,
            ValueRepr::Map(..) => ValueKind::Map,
            ValueRepr::Dynamic(obj) => match obj.kind() {
                ObjectKind::Plain => ValueKind::Map,
                ObjectKind::Seq(_) => ValueKind::Seq,
                ObjectKind::Struct(_) => ValueKind::Map,
            },
            // surfaces as an error on use; rank with maps for ordering
            ValueRepr::Invalid(_) => ValueKind::Map,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.0, ValueRepr::Undefined)
    }

    pub fn is_none(&self) -> bool {
        matches!(self.0, ValueRepr::None)
    }

    /// True for strings carrying the safety bit.
    pub fn is_safe(&self) -> bool {
        matches!(self.0, ValueRepr::String(_, StringKind::Safe))
    }

    pub(crate) fn is_kwargs(&self) -> bool {
        matches!(self.0, ValueRepr::Map(_, MapKind::Kwargs))
    }

    /// Truthiness, used by `{% if %}` and the short-circuit operators.
    ///
    /// Falsy values: `undefined`, `none`, `false`, numeric zero, empty
    /// string/bytes/sequence/map. Everything else is truthy.
    pub fn is_true(&self) -> bool {
        match &self.0 {
            ValueRepr::Undefined | ValueRepr::None => false,
            ValueRepr::Bool(b) => *b,
            ValueRepr::I64(n) => *n != 0,
            ValueRepr::U64(n) => *n != 0,
            ValueRepr::I128(n) => *n != 0,
            ValueRepr::U128(n) => *n != 0,
            ValueRepr::F64(n) => *n != 0.0,
            ValueRepr::String(s, _) => !s.is_empty(),
            ValueRepr::Bytes(b) => !b.is_empty(),
            ValueRepr::Seq(s) => !s.is_empty(),
            ValueRepr::Map(m, _) => !m.is_empty(),
            ValueRepr::Dynamic(obj) => match obj.kind() {
                ObjectKind::Plain => true,
                ObjectKind::Seq(s) => s.item_count() != 0,
                ObjectKind::Struct(s) => s.field_count() != 0,
            },
            ValueRepr::Invalid(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.0 {
            ValueRepr::String(s, _) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.0 {
            ValueRepr::Bytes(b) => Some(b),
            ValueRepr::String(s, _) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub(crate) fn as_object(&self) -> Option<&Arc<dyn object::Object>> {
        match &self.0 {
            ValueRepr::Dynamic(obj) => Some(obj),
            _ => None,
        }
    }

    /// Number of elements, if the value has a length: code points for
    /// strings, elements for sequences, entries for maps.
    pub fn len(&self) -> Option<usize> {
        match &self.0 {
            ValueRepr::String(s, _) => Some(s.chars().count()),
            ValueRepr::Bytes(b) => Some(b.len()),
            ValueRepr::Seq(s) => Some(s.len()),
            ValueRepr::Map(m, _) => Some(m.len()),
            ValueRepr::Dynamic(obj) => match obj.kind() {
                ObjectKind::Plain => None,
                ObjectKind::Seq(s) => Some(s.item_count()),
                ObjectKind::Struct(s) => Some(s.field_count()),
            },
            _ => None,
        }
    }

    /// Fetch an attribute by name.
    ///
    /// Missing attributes resolve to `undefined`; the renderer applies
    /// the active undefined-behavior policy on top.
    pub fn get_attr(&self, name: &str) -> Result<Value, Error> {
        match &self.0 {
            ValueRepr::Map(m, _) => Ok(m.get_str(name).cloned().unwrap_or(Value::UNDEFINED)),
            ValueRepr::Dynamic(obj) => match obj.kind() {
                ObjectKind::Struct(s) => Ok(s.get_field(name).unwrap_or(Value::UNDEFINED)),
                _ => Ok(Value::UNDEFINED),
            },
            ValueRepr::Invalid(detail) => Err(Error::new(
                ErrorKind::BadSerialization,
                detail.to_string(),
            )),
            _ => Ok(Value::UNDEFINED),
        }
    }

    /// Fetch an element by key or index.
    ///
    /// Sequences and strings accept integer indexes (negative counts
    /// from the end); maps accept any key. Missing entries resolve to
    /// `undefined`.
    pub fn get_item(&self, key: &Value) -> Result<Value, Error> {
        if let ValueRepr::Invalid(detail) = &self.0 {
            return Err(Error::new(
                ErrorKind::BadSerialization,
                detail.to_string(),
            ));
        }
        if let Some(idx) = key.as_i64_lossless() {
            if let Some(rv) = self.get_index(idx) {
                return Ok(rv);
            }
        }
        match &self.0 {
            ValueRepr::Map(m, _) => Ok(m
                .get(&KeyRef::from_value(key))
                .cloned()
                .unwrap_or(Value::UNDEFINED)),
            ValueRepr::Dynamic(obj) => match obj.kind() {
                ObjectKind::Struct(s) => Ok(key
                    .as_str()
                    .and_then(|name| s.get_field(name))
                    .unwrap_or(Value::UNDEFINED)),
                _ => Ok(Value::UNDEFINED),
            },
            _ => Ok(Value::UNDEFINED),
        }
    }

    /// Index into a sequence or string, counting from the end for
    /// negative indexes.
    fn get_index(&self, idx: i64) -> Option<Value> {
        let len = match &self.0 {
            ValueRepr::Seq(s) => s.len(),
            ValueRepr::String(s, _) => s.chars().count(),
            ValueRepr::Dynamic(obj) => match obj.kind() {
                ObjectKind::Seq(s) => s.item_count(),
                _ => return None,
            },
            _ => return None,
        };
        let idx = if idx < 0 {
            idx.checked_add(len as i64).filter(|n| *n >= 0)? as usize
        } else {
            idx as usize
        };
        if idx >= len {
            return None;
        }
        match &self.0 {
            ValueRepr::Seq(s) => s.get(idx).cloned(),
            ValueRepr::String(s, _) => {
                s.chars().nth(idx).map(|c| Value::from(c.to_string()))
            }
            ValueRepr::Dynamic(obj) => match obj.kind() {
                ObjectKind::Seq(s) => s.get_item(idx),
                _ => None,
            },
            _ => None,
        }
    }

    /// The value as `i64` if it is an integer (or integral float,
    /// or bool) that fits; used for indexing and slice bounds.
    pub(crate) fn as_i64_lossless(&self) -> Option<i64> {
        match &self.0 {
            ValueRepr::Bool(b) => Some(*b as i64),
            ValueRepr::I64(n) => Some(*n),
            ValueRepr::U64(n) => i64::try_from(*n).ok(),
            ValueRepr::I128(n) => i64::try_from(*n).ok(),
            ValueRepr::U128(n) => i64::try_from(*n).ok(),
            ValueRepr::F64(n) if *n == n.trunc() && n.is_finite() => {
                if *n >= i64::MIN as f64 && *n <= i64::MAX as f64 {
                    Some(*n as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Widen any integer (or bool, or integral float) to `i128`.
    /// `u128` values above `i128::MAX` are reinterpreted as
    /// two's-complement for signed arithmetic.
    pub(crate) fn as_i128_widened(&self) -> Option<i128> {
        match &self.0 {
            ValueRepr::Bool(b) => Some(*b as i128),
            ValueRepr::I64(n) => Some(*n as i128),
            ValueRepr::U64(n) => Some(*n as i128),
            ValueRepr::I128(n) => Some(*n),
            ValueRepr::U128(n) => Some(*n as i128),
            ValueRepr::F64(n) if *n == n.trunc() && n.is_finite() => {
                const MAX: f64 = i128::MAX as f64;
                const MIN: f64 = i128::MIN as f64;
                if (MIN..=MAX).contains(n) {
                    Some(*n as i128)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub(crate) fn as_f64(&self) -> Option<f64> {
        match &self.0 {
            ValueRepr::Bool(b) => Some(*b as u8 as f64),
            ValueRepr::I64(n) => Some(*n as f64),
            ValueRepr::U64(n) => Some(*n as f64),
            ValueRepr::I128(n) => Some(*n as f64),
            ValueRepr::U128(n) => Some(*n as f64),
            ValueRepr::F64(n) => Some(*n),
            _ => None,
        }
    }

    /// Narrow a 128-bit result to the smallest fitting variant.
    pub(crate) fn from_i128_narrowed(n: i128) -> Value {
        if let Ok(v) = i64::try_from(n) {
            Value(ValueRepr::I64(v))
        } else if let Ok(v) = u64::try_from(n) {
            Value(ValueRepr::U64(v))
        } else {
            Value(ValueRepr::I128(n))
        }
    }

    /// Iterate the value per the iterator protocol: strings by code
    /// point, sequences by element, maps by key, dynamic objects by
    /// item or field name.
    pub fn try_iter(&self) -> Result<ValueIter, Error> {
        iter::value_iter(self)
    }

    /// Type name for diagnostic messages
    pub(crate) fn type_name(&self) -> &'static str {
        match &self.0 {
            ValueRepr::Undefined => "undefined",
            ValueRepr::None => "none",
            ValueRepr::Bool(_) => "bool",
            ValueRepr::I64(_) | ValueRepr::I128(_) => "integer",
            ValueRepr::U64(_) | ValueRepr::U128(_) => "unsigned integer",
            ValueRepr::F64(_) => "float",
            ValueRepr::String(..) => "string",
            ValueRepr::Bytes(_) => "bytes",
            ValueRepr::Seq(_) => "sequence",
            ValueRepr::Map(..) => "map",
            ValueRepr::Dynamic(_) => "object",
            ValueRepr::Invalid(_) => "invalid value",
        }
    }
}

// ── Formatting ──────────────────────────────────────────────────────────

fn fmt_f64(f: &mut fmt::Formatter<'_>, val: f64) -> fmt::Result {
    if val.is_nan() {
        f.write_str("NaN")
    } else if val.is_infinite() {
        f.write_str(if val < 0.0 { "-inf" } else { "inf" })
    } else {
        let mut num = val.to_string();
        if !num.contains('.') && !num.contains('e') && !num.contains('E') {
            num.push_str(".0");
        }
        f.write_str(&num)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            ValueRepr::Undefined => Ok(()),
            ValueRepr::None => f.write_str("none"),
            ValueRepr::Bool(b) => f.write_str(if *b { "true" } else { "false" }),
            ValueRepr::I64(n) => write!(f, "{n}"),
            ValueRepr::U64(n) => write!(f, "{n}"),
            ValueRepr::I128(n) => write!(f, "{n}"),
            ValueRepr::U128(n) => write!(f, "{n}"),
            ValueRepr::F64(n) => fmt_f64(f, *n),
            ValueRepr::String(s, _) => f.write_str(s),
            ValueRepr::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            ValueRepr::Seq(_) | ValueRepr::Map(..) => fmt::Debug::fmt(self, f),
            ValueRepr::Dynamic(obj) => object::fmt_object(&**obj, f),
            ValueRepr::Invalid(detail) => write!(f, "<invalid value: {detail}>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            ValueRepr::Undefined => f.write_str("undefined"),
            // strings are quoted in element-debug position
            ValueRepr::String(s, _) => write!(f, "{s:?}"),
            ValueRepr::Bytes(b) => write!(f, "{b:?}"),
            ValueRepr::Seq(items) => f.debug_list().entries(items.iter()).finish(),
            ValueRepr::Map(m, _) => fmt::Debug::fmt(m, f),
            ValueRepr::Dynamic(obj) => object::fmt_object(&**obj, f),
            _ => fmt::Display::fmt(self, f),
        }
    }
}

// ── Equality, ordering, hashing ─────────────────────────────────────────

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        ops::total_cmp(self, other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(ops::total_cmp(self, other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        ops::total_cmp(self, other)
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            ValueRepr::Undefined | ValueRepr::None => 0u8.hash(state),
            ValueRepr::Bool(b) => b.hash(state),
            // numbers hash by canonical integral value so that 1, 1u64
            // and 1.0 land in the same bucket, matching equality
            ValueRepr::I64(_)
            | ValueRepr::U64(_)
            | ValueRepr::I128(_)
            | ValueRepr::U128(_)
            | ValueRepr::F64(_) => match self.as_i128_widened() {
                Some(n) => n.hash(state),
                None => {
                    if let ValueRepr::F64(n) = &self.0 {
                        n.to_bits().hash(state);
                    }
                }
            },
            ValueRepr::String(s, _) => s.hash(state),
            ValueRepr::Bytes(b) => b.hash(state),
            ValueRepr::Seq(items) => {
                for item in items.iter() {
                    item.hash(state);
                }
            }
            ValueRepr::Map(m, _) => {
                for (key, value) in m.iter() {
                    key.hash(state);
                    value.hash(state);
                }
            }
            ValueRepr::Dynamic(obj) => {
                (Arc::as_ptr(obj) as *const () as usize).hash(state)
            }
            ValueRepr::Invalid(detail) => detail.hash(state),
        }
    }
}

// ── Conversions ─────────────────────────────────────────────────────────

macro_rules! int_from {
    ($ty:ty, $variant:ident as $target:ty) => {
        impl From<$ty> for Value {
            fn from(n: $ty) -> Value {
                Value(ValueRepr::$variant(n as $target))
            }
        }
    };
}

int_from!(i8, I64 as i64);
int_from!(i16, I64 as i64);
int_from!(i32, I64 as i64);
int_from!(i64, I64 as i64);
int_from!(u8, I64 as i64);
int_from!(u16, I64 as i64);
int_from!(u32, I64 as i64);
int_from!(u64, U64 as u64);
int_from!(i128, I128 as i128);
int_from!(u128, U128 as u128);

impl From<usize> for Value {
    fn from(n: usize) -> Value {
        Value(ValueRepr::U64(n as u64))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        Value(ValueRepr::F64(n))
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Value {
        Value(ValueRepr::F64(n as f64))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value(ValueRepr::Bool(b))
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Value {
        Value::NONE
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value(ValueRepr::String(Arc::from(s), StringKind::Normal))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value(ValueRepr::String(Arc::from(s), StringKind::Normal))
    }
}

impl From<char> for Value {
    fn from(c: char) -> Value {
        Value::from(c.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Value {
        Value(ValueRepr::Seq(Arc::new(
            v.into_iter().map(Into::into).collect(),
        )))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Value {
        match v {
            Some(v) => v.into(),
            None => Value::NONE,
        }
    }
}

impl From<ValueMap> for Value {
    fn from(m: ValueMap) -> Value {
        Value(ValueRepr::Map(Arc::new(m), MapKind::Normal))
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Value {
        Value(ValueRepr::Seq(Arc::new(iter.into_iter().collect())))
    }
}

impl<K: Into<Key>, V: Into<Value>> FromIterator<(K, V)> for Value {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Value {
        let map: ValueMap = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        map.into()
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Key {
        Key::Str(Arc::from(s))
    }
}

impl From<String> for Key {
    fn from(s: String) -> Key {
        Key::Str(Arc::from(s))
    }
}

impl From<Value> for Key {
    fn from(v: Value) -> Key {
        Key::from_value(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_rule() {
        assert_eq!(Value::UNDEFINED.to_string(), "");
        assert_eq!(Value::NONE.to_string(), "none");
        assert_eq!(Value::from(true).to_string(), "true");
        assert_eq!(Value::from(42).to_string(), "42");
        assert_eq!(Value::from(1.0).to_string(), "1.0");
        assert_eq!(Value::from(1.5).to_string(), "1.5");
        assert_eq!(Value::from(f64::NAN).to_string(), "NaN");
        assert_eq!(Value::from(f64::INFINITY).to_string(), "inf");
        assert_eq!(Value::from(f64::NEG_INFINITY).to_string(), "-inf");
    }

    #[test]
    fn test_seq_display_quotes_strings() {
        let v = Value::from(vec![Value::from(1), Value::from("a")]);
        assert_eq!(v.to_string(), "[1, \"a\"]");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::UNDEFINED.is_true());
        assert!(!Value::NONE.is_true());
        assert!(!Value::from(0).is_true());
        assert!(!Value::from("").is_true());
        assert!(Value::from("x").is_true());
        assert!(Value::from(0.1).is_true());
        assert!(!Value::from(Vec::<Value>::new()).is_true());
    }

    #[test]
    fn test_negative_index() {
        let v = Value::from(vec!["John", "Paul", "George", "Ringo"]);
        let item = v.get_item(&Value::from(-1)).unwrap();
        assert_eq!(item, Value::from("Ringo"));
    }

    #[test]
    fn test_string_index_by_code_point() {
        let v = Value::from("héllo");
        assert_eq!(v.get_item(&Value::from(1)).unwrap(), Value::from("é"));
        assert_eq!(v.len(), Some(5));
    }

    #[test]
    fn test_narrowing() {
        assert!(matches!(
            Value::from_i128_narrowed(1).0,
            ValueRepr::I64(1)
        ));
        assert!(matches!(
            Value::from_i128_narrowed(i64::MAX as i128 + 1).0,
            ValueRepr::U64(_)
        ));
        assert!(matches!(
            Value::from_i128_narrowed(u64::MAX as i128 + 1).0,
            ValueRepr::I128(_)
        ));
    }

    #[test]
    fn test_cross_width_equality() {
        assert_eq!(Value::from(1i64), Value::from(1u64));
        assert_eq!(Value::from(1i64), Value::from(1.0));
        assert_ne!(Value::from(1i64), Value::from("1"));
    }
}
