//! The iterator protocol over values.
//!
//! A [`ValueIter`] yields owned values and advertises how many items
//! remain. Strings iterate by code point, sequences by element, maps
//! by key, and dynamic objects by item or static field name. Iterators
//! compose: they can be chained and, since all state is owned, cloned
//! mid-iteration to fork the remaining elements.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, ErrorKind};
use crate::value::{ObjectKind, Value, ValueMap, ValueRepr};

/// An iterator over a value's elements.
#[derive(Clone)]
pub struct ValueIter {
    imp: ValueIterImpl,
}

#[derive(Clone)]
enum ValueIterImpl {
    Empty,
    Chars {
        s: Arc<str>,
        offset: usize,
    },
    Seq {
        items: Arc<Vec<Value>>,
        idx: usize,
    },
    MapKeys {
        map: Arc<ValueMap>,
        idx: usize,
    },
    DynSeq {
        obj: Arc<dyn crate::value::Object>,
        idx: usize,
        len: usize,
    },
    Fields {
        names: Vec<Arc<str>>,
        idx: usize,
    },
    Chained(Box<ValueIter>, Box<ValueIter>),
}

impl ValueIter {
    pub(crate) fn empty() -> ValueIter {
        ValueIter {
            imp: ValueIterImpl::Empty,
        }
    }

    /// Chain another iterator after this one.
    pub fn chain(self, other: ValueIter) -> ValueIter {
        ValueIter {
            imp: ValueIterImpl::Chained(Box::new(self), Box::new(other)),
        }
    }

    /// Advisory count of remaining items.
    pub fn len(&self) -> usize {
        match &self.imp {
            ValueIterImpl::Empty => 0,
            ValueIterImpl::Chars { s, offset } => s[*offset..].chars().count(),
            ValueIterImpl::Seq { items, idx } => items.len().saturating_sub(*idx),
            ValueIterImpl::MapKeys { map, idx } => map.len().saturating_sub(*idx),
            ValueIterImpl::DynSeq { idx, len, .. } => len.saturating_sub(*idx),
            ValueIterImpl::Fields { names, idx } => names.len().saturating_sub(*idx),
            ValueIterImpl::Chained(a, b) => a.len() + b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match &mut self.imp {
            ValueIterImpl::Empty => None,
            ValueIterImpl::Chars { s, offset } => {
                let c = s[*offset..].chars().next()?;
                *offset += c.len_utf8();
                Some(Value::from(c))
            }
            ValueIterImpl::Seq { items, idx } => {
                let rv = items.get(*idx).cloned()?;
                *idx += 1;
                Some(rv)
            }
            ValueIterImpl::MapKeys { map, idx } => {
                let (key, _) = map.get_index(*idx)?;
                *idx += 1;
                Some(key.to_value())
            }
            ValueIterImpl::DynSeq { obj, idx, len } => {
                if idx >= len {
                    return None;
                }
                let rv = match obj.kind() {
                    ObjectKind::Seq(seq) => seq.get_item(*idx),
                    _ => None,
                };
                *idx += 1;
                rv
            }
            ValueIterImpl::Fields { names, idx } => {
                let name = names.get(*idx)?;
                let rv = Value::from(&**name);
                *idx += 1;
                Some(rv)
            }
            ValueIterImpl::Chained(a, b) => a.next().or_else(|| b.next()),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.len();
        (len, Some(len))
    }
}

impl fmt::Debug for ValueIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueIter").field("len", &self.len()).finish()
    }
}

/// Build an iterator for a value, or fail if the value is not
/// iterable. `none` and `undefined` iterate as empty here; the
/// renderer applies the strict-mode check before calling.
pub(crate) fn value_iter(value: &Value) -> Result<ValueIter, Error> {
    let imp = match &value.0 {
        ValueRepr::Undefined | ValueRepr::None => ValueIterImpl::Empty,
        ValueRepr::String(s, _) => ValueIterImpl::Chars {
            s: s.clone(),
            offset: 0,
        },
        ValueRepr::Seq(items) => ValueIterImpl::Seq {
            items: items.clone(),
            idx: 0,
        },
        ValueRepr::Map(map, _) => ValueIterImpl::MapKeys {
            map: map.clone(),
            idx: 0,
        },
        ValueRepr::Dynamic(obj) => match obj.kind() {
            ObjectKind::Seq(seq) => {
                let len = seq.item_count();
                ValueIterImpl::DynSeq {
                    obj: obj.clone(),
                    idx: 0,
                    len,
                }
            }
            ObjectKind::Struct(st) => ValueIterImpl::Fields {
                names: st.fields(),
                idx: 0,
            },
            ObjectKind::Plain => {
                return Err(Error::new(
                    ErrorKind::InvalidOperation,
                    "object is not iterable",
                ))
            }
        },
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("value of type {} is not iterable", value.type_name()),
            ))
        }
    };
    Ok(ValueIter { imp })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Key, ValueMap};

    #[test]
    fn test_string_iterates_code_points() {
        let v = Value::from("héllo");
        let items: Vec<_> = v.try_iter().unwrap().collect();
        assert_eq!(items.len(), 5);
        assert_eq!(items[1], Value::from("é"));
    }

    #[test]
    fn test_map_iterates_keys_in_order() {
        let mut map = ValueMap::new();
        map.insert(Key::from("b"), Value::from(1));
        map.insert(Key::from("a"), Value::from(2));
        let v = Value::from(map);
        let keys: Vec<_> = v.try_iter().unwrap().collect();
        assert_eq!(keys, vec![Value::from("b"), Value::from("a")]);
    }

    #[test]
    fn test_len_advisory() {
        let v = Value::from(vec![1, 2, 3]);
        let mut it = v.try_iter().unwrap();
        assert_eq!(it.len(), 3);
        it.next();
        assert_eq!(it.len(), 2);
    }

    #[test]
    fn test_chain_and_fork() {
        let a = Value::from(vec![1, 2]).try_iter().unwrap();
        let b = Value::from(vec![3]).try_iter().unwrap();
        let mut chained = a.chain(b);
        assert_eq!(chained.len(), 3);
        assert_eq!(chained.next(), Some(Value::from(1)));

        // cloning forks the remaining items
        let forked: Vec<_> = chained.clone().collect();
        assert_eq!(forked, vec![Value::from(2), Value::from(3)]);
        assert_eq!(chained.count(), 2);
    }

    #[test]
    fn test_int_not_iterable() {
        assert!(Value::from(42).try_iter().is_err());
    }
}
