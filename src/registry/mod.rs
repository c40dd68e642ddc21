//! The filter and test registry.
//!
//! Filters transform a value (`{{ name | upper }}`); tests classify
//! one (`{% if x is defined %}`). Both receive the render [`State`]
//! and their arguments as a slice, with the input value first. Plain
//! closures of the right shape implement the traits directly:
//!
//! ```rust
//! use loomtex::{Environment, Error, State, Value};
//!
//! let mut env = Environment::new();
//! env.add_filter("repeat", |_state: &State, args: &[Value]| -> Result<Value, Error> {
//!     let s = args[0].to_string();
//!     Ok(Value::from(s.repeat(2)))
//! });
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Error;
use crate::eval::State;
use crate::utils::{write_escaped, AutoEscape};
use crate::value::Value;

/// A template filter.
pub trait Filter: Send + Sync {
    /// Apply the filter. `args[0]` is the piped-in value; the rest are
    /// the explicit arguments, with keyword arguments aggregated into
    /// a trailing map.
    fn apply(&self, state: &State, args: &[Value]) -> Result<Value, Error>;
}

impl<F> Filter for F
where
    F: Fn(&State, &[Value]) -> Result<Value, Error> + Send + Sync,
{
    fn apply(&self, state: &State, args: &[Value]) -> Result<Value, Error> {
        self(state, args)
    }
}

/// A template test.
pub trait Test: Send + Sync {
    /// Perform the test. `args[0]` is the tested value.
    fn perform(&self, state: &State, args: &[Value]) -> Result<bool, Error>;
}

impl<F> Test for F
where
    F: Fn(&State, &[Value]) -> Result<bool, Error> + Send + Sync,
{
    fn perform(&self, state: &State, args: &[Value]) -> Result<bool, Error> {
        self(state, args)
    }
}

/// The named filters and tests available to templates.
pub struct Registry {
    filters: BTreeMap<String, Arc<dyn Filter>>,
    tests: BTreeMap<String, Arc<dyn Test>>,
}

impl Registry {
    /// An empty registry with no filters or tests at all.
    pub fn empty() -> Registry {
        Registry {
            filters: BTreeMap::new(),
            tests: BTreeMap::new(),
        }
    }

    /// A registry preloaded with the built-in filters (`safe`,
    /// `escape`) and tests (`defined`, `undefined`, `none`).
    pub fn with_builtins() -> Registry {
        let mut registry = Registry::empty();
        registry.add_filter("safe", filter_safe);
        registry.add_filter("escape", filter_escape);
        registry.add_test("defined", test_defined);
        registry.add_test("undefined", test_undefined);
        registry.add_test("none", test_none);
        registry
    }

    pub fn add_filter(&mut self, name: impl Into<String>, filter: impl Filter + 'static) {
        self.filters.insert(name.into(), Arc::new(filter));
    }

    pub fn add_test(&mut self, name: impl Into<String>, test: impl Test + 'static) {
        self.tests.insert(name.into(), Arc::new(test));
    }

    pub fn get_filter(&self, name: &str) -> Option<Arc<dyn Filter>> {
        self.filters.get(name).cloned()
    }

    pub fn get_test(&self, name: &str) -> Option<Arc<dyn Test>> {
        self.tests.get(name).cloned()
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::with_builtins()
    }
}

// ── built-ins ───────────────────────────────────────────────────────

fn input(args: &[Value]) -> Result<&Value, Error> {
    args.first().ok_or_else(|| Error::missing_argument("value"))
}

/// Mark a value as safe so the active escape mode passes it through.
fn filter_safe(_state: &State, args: &[Value]) -> Result<Value, Error> {
    let value = input(args)?;
    if value.is_safe() {
        Ok(value.clone())
    } else {
        Ok(Value::from_safe_string(value.to_string()))
    }
}

/// Escape a value through the escape mode in effect, defaulting to
/// HTML when rendering without one. Already-safe input is returned
/// unchanged, which makes double application a no-op.
fn filter_escape(state: &State, args: &[Value]) -> Result<Value, Error> {
    let value = input(args)?;
    if value.is_safe() {
        return Ok(value.clone());
    }
    let mode = match state.auto_escape() {
        AutoEscape::None => AutoEscape::Html,
        mode => mode,
    };
    let mut buf = String::new();
    write_escaped(&mut buf, mode, value)?;
    Ok(Value::from_safe_string(buf))
}

fn test_defined(_state: &State, args: &[Value]) -> Result<bool, Error> {
    Ok(!input(args)?.is_undefined())
}

fn test_undefined(_state: &State, args: &[Value]) -> Result<bool, Error> {
    Ok(input(args)?.is_undefined())
}

fn test_none(_state: &State, args: &[Value]) -> Result<bool, Error> {
    Ok(input(args)?.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_registered() {
        let registry = Registry::with_builtins();
        assert!(registry.get_filter("safe").is_some());
        assert!(registry.get_filter("escape").is_some());
        assert!(registry.get_test("defined").is_some());
        assert!(registry.get_filter("upper").is_none());
    }

    #[test]
    fn test_registration_overrides() {
        let mut registry = Registry::with_builtins();
        registry.add_filter("safe", |_: &State, _: &[Value]| -> Result<Value, Error> {
            Ok(Value::from("x"))
        });
        assert!(registry.get_filter("safe").is_some());
    }
}
