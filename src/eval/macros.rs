//! The runtime representation of `{% macro %}` declarations.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::compiler::Instructions;
use crate::error::Error;
use crate::eval::State;
use crate::value::{Key, Object, ObjectKind, StructObject, Value, ValueMap};

/// The shared capture environment of macros declared in a frame.
///
/// Held by identity: the declaring frame keeps writing into the same
/// closure after the macro value is built, so a macro observes later
/// assignments in its frame (including a binding of itself, which is
/// what makes self-recursive macros work).
#[derive(Clone, Default)]
pub(crate) struct Closure {
    values: Arc<Mutex<ValueMap>>,
}

impl Closure {
    pub fn new() -> Closure {
        Closure::default()
    }

    pub fn store(&self, name: &str, value: Value) {
        self.lock().insert(Key::from(name), value);
    }

    /// Snapshot the captured values for use as a call-time root scope.
    pub fn clone_values(&self) -> ValueMap {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ValueMap> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.lock(), f)
    }
}

/// A callable macro value.
pub(crate) struct Macro {
    pub name: String,
    pub arg_names: Vec<String>,
    /// Default values for the trailing parameters, already evaluated.
    pub defaults: Vec<Value>,
    pub closure: Closure,
    pub body: Arc<Instructions>,
    pub caller_reference: bool,
}

impl fmt::Debug for Macro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<macro {}>", self.name)
    }
}

impl Object for Macro {
    fn kind(&self) -> ObjectKind<'_> {
        ObjectKind::Struct(self)
    }

    fn call(&self, state: &State, args: &[Value]) -> Result<Value, Error> {
        crate::eval::call_macro(self, state, args)
    }
}

impl StructObject for Macro {
    fn get_field(&self, name: &str) -> Option<Value> {
        match name {
            "name" => Some(Value::from(self.name.as_str())),
            "arguments" => Some(Value::from(
                self.arg_names
                    .iter()
                    .map(|name| Value::from(name.as_str()))
                    .collect::<Vec<_>>(),
            )),
            "caller" => Some(Value::from(self.caller_reference)),
            _ => None,
        }
    }

    fn fields(&self) -> Vec<Arc<str>> {
        ["name", "arguments", "caller"]
            .into_iter()
            .map(Arc::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_is_shared_by_identity() {
        let closure = Closure::new();
        let alias = closure.clone();
        closure.store("x", Value::from(1));
        alias.store("y", Value::from(2));
        let snapshot = closure.clone_values();
        assert_eq!(snapshot.len(), 2);

        // snapshots are independent of later writes
        closure.store("z", Value::from(3));
        assert_eq!(snapshot.len(), 2);
    }
}
