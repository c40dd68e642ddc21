//! Dynamic runtime objects.
//!
//! Host applications (and the engine itself, for loop state and
//! macros) can expose structured data and callable behavior to
//! templates by implementing [`Object`] and handing an `Arc` of it to
//! [`Value::from_object`](crate::value::Value::from_object).

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, ErrorKind};
use crate::eval::State;
use crate::value::Value;

/// A dynamic value with optional structure and callable behavior.
///
/// The default implementations make an object opaque: no attributes,
/// not callable, no methods. Override [`kind`](Object::kind) to expose
/// sequence or struct semantics.
pub trait Object: fmt::Debug + Send + Sync {
    /// How this object presents itself to the value model.
    fn kind(&self) -> ObjectKind<'_> {
        ObjectKind::Plain
    }

    /// Invoke the object as a function: `obj(args)`.
    fn call(&self, state: &State, args: &[Value]) -> Result<Value, Error> {
        let _ = (state, args);
        Err(Error::new(
            ErrorKind::InvalidOperation,
            "object is not callable",
        ))
    }

    /// Invoke a method on the object: `obj.name(args)`.
    fn call_method(&self, state: &State, name: &str, args: &[Value]) -> Result<Value, Error> {
        let _ = (state, args);
        Err(Error::new(
            ErrorKind::UnknownMethod,
            format!("object has no method named {name}"),
        ))
    }
}

/// The structural flavor of a dynamic object.
#[non_exhaustive]
pub enum ObjectKind<'a> {
    /// No exposed structure.
    Plain,
    /// Behaves like a sequence: indexable, iterable by element.
    Seq(&'a dyn SeqObject),
    /// Behaves like a struct: named fields, iterable by field name.
    Struct(&'a dyn StructObject),
}

/// Sequence behavior for dynamic objects.
pub trait SeqObject: Send + Sync {
    /// Look up an element by position.
    fn get_item(&self, idx: usize) -> Option<Value>;

    /// Number of elements.
    fn item_count(&self) -> usize;
}

impl<T: SeqObject + ?Sized> SeqObject for &T {
    fn get_item(&self, idx: usize) -> Option<Value> {
        (**self).get_item(idx)
    }

    fn item_count(&self) -> usize {
        (**self).item_count()
    }
}

impl SeqObject for Vec<Value> {
    fn get_item(&self, idx: usize) -> Option<Value> {
        self.get(idx).cloned()
    }

    fn item_count(&self) -> usize {
        self.len()
    }
}

/// Struct behavior for dynamic objects.
pub trait StructObject: Send + Sync {
    /// Look up a field by name.
    fn get_field(&self, name: &str) -> Option<Value>;

    /// The static field names, in enumeration order.
    fn fields(&self) -> Vec<Arc<str>> {
        Vec::new()
    }

    /// Number of fields.
    fn field_count(&self) -> usize {
        self.fields().len()
    }
}

/// Format an object the way its kind suggests: sequences like lists,
/// structs like maps, plain objects via their `Debug`.
pub(crate) fn fmt_object(
    object: &dyn Object,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    match object.kind() {
        ObjectKind::Plain => write!(f, "{object:?}"),
        ObjectKind::Seq(seq) => {
            let mut list = f.debug_list();
            for idx in 0..seq.item_count() {
                if let Some(item) = seq.get_item(idx) {
                    list.entry(&item);
                }
            }
            list.finish()
        }
        ObjectKind::Struct(st) => {
            let mut map = f.debug_map();
            for field in st.fields() {
                if let Some(value) = st.get_field(&field) {
                    map.key(&&*field).value(&value);
                }
            }
            map.finish()
        }
    }
}
