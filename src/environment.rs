//! The environment: templates, globals, filters, and settings.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use crate::compiler::{self, CompiledTemplate, Instructions};
use crate::error::{Error, ErrorKind};
use crate::eval::output::{Output, WriteAdapter};
use crate::eval::{UndefinedBehavior, Vm};
use crate::parser;
use crate::registry::{Filter, Registry, Test};
use crate::utils::AutoEscape;
use crate::value::{Key, Value, ValueMap};

struct TemplateEntry {
    compiled: CompiledTemplate,
    initial_auto_escape: AutoEscape,
}

/// The central registry of templates and everything they can reach.
///
/// An environment holds compiled templates, globals, filters, tests,
/// and the undefined-value policy. Once populated it is read-only to
/// renders, so one environment can serve concurrent renders as long
/// as no thread is mutating it at the same time.
///
/// ```rust
/// use loomtex::{context, Environment};
///
/// let mut env = Environment::new();
/// env.add_template("hello.txt", "Hello {{ name }}!").unwrap();
/// let tmpl = env.get_template("hello.txt").unwrap();
/// let rv = tmpl.render(context! { name => "World" }).unwrap();
/// assert_eq!(rv, "Hello World!");
/// ```
pub struct Environment {
    templates: BTreeMap<String, TemplateEntry>,
    registry: Registry,
    globals: ValueMap,
    undefined_behavior: UndefinedBehavior,
}

impl Default for Environment {
    fn default() -> Environment {
        Environment::new()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("templates", &self.templates.keys().collect::<Vec<_>>())
            .field("undefined_behavior", &self.undefined_behavior)
            .finish()
    }
}

impl Environment {
    /// Create an environment with the built-in filters and tests.
    pub fn new() -> Environment {
        Environment {
            templates: BTreeMap::new(),
            registry: Registry::with_builtins(),
            globals: ValueMap::new(),
            undefined_behavior: UndefinedBehavior::default(),
        }
    }

    /// Parse and compile a template under the given name.
    ///
    /// Compilation is eager: syntax errors surface here, not at
    /// render time. The name's extension selects the initial escape
    /// mode (`.html` and friends escape HTML, `.json` and friends
    /// emit JSON, everything else renders raw).
    pub fn add_template(&mut self, name: &str, source: &str) -> Result<(), Error> {
        let compiled = compile_named(name, source)?;
        self.templates.insert(
            name.to_string(),
            TemplateEntry {
                compiled,
                initial_auto_escape: AutoEscape::from_template_name(name),
            },
        );
        Ok(())
    }

    pub fn remove_template(&mut self, name: &str) {
        self.templates.remove(name);
    }

    /// Fetch a previously added template.
    pub fn get_template(&self, name: &str) -> Result<Template<'_>, Error> {
        match self.templates.get_key_value(name) {
            Some((name, entry)) => Ok(Template {
                env: self,
                name: name.as_str(),
                entry,
            }),
            None => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("template {name:?} does not exist"),
            )),
        }
    }

    /// Parse, compile, and render a template in one step, without
    /// storing it.
    pub fn render_str(&self, source: &str, root: Value) -> Result<String, Error> {
        let name = "<string>";
        let compiled = compile_named(name, source)?;
        let mut buf = String::new();
        let mut out = Output::new(&mut buf);
        Vm::new(self).eval(
            &compiled.instructions,
            &compiled.blocks,
            root,
            &mut out,
            AutoEscape::None,
            name,
        )?;
        Ok(buf)
    }

    /// Compile a bare expression for repeated evaluation.
    ///
    /// ```rust
    /// use loomtex::{context, Environment};
    ///
    /// let env = Environment::new();
    /// let expr = env.compile_expression("n > 10 and n < 20").unwrap();
    /// assert!(expr.eval(context! { n => 15 }).unwrap().is_true());
    /// ```
    pub fn compile_expression(&self, source: &str) -> Result<CompiledExpression<'_>, Error> {
        let expr = parser::parse_expr(source)?;
        Ok(CompiledExpression {
            env: self,
            instructions: compiler::compile_expression(&expr)?,
        })
    }

    pub fn add_filter(&mut self, name: impl Into<String>, filter: impl Filter + 'static) {
        self.registry.add_filter(name, filter);
    }

    pub fn add_test(&mut self, name: impl Into<String>, test: impl Test + 'static) {
        self.registry.add_test(name, test);
    }

    /// Bind a value every template of this environment can see.
    pub fn add_global(&mut self, name: &str, value: impl Into<Value>) {
        self.globals.insert(Key::from(name), value.into());
    }

    /// Change how undefined values behave; see [`UndefinedBehavior`].
    pub fn set_undefined_behavior(&mut self, behavior: UndefinedBehavior) {
        self.undefined_behavior = behavior;
    }

    pub fn undefined_behavior(&self) -> UndefinedBehavior {
        self.undefined_behavior
    }

    pub(crate) fn get_filter(&self, name: &str) -> Option<Arc<dyn Filter>> {
        self.registry.get_filter(name)
    }

    pub(crate) fn get_test(&self, name: &str) -> Option<Arc<dyn Test>> {
        self.registry.get_test(name)
    }

    pub(crate) fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get_str(name).cloned()
    }
}

fn compile_named(name: &str, source: &str) -> Result<CompiledTemplate, Error> {
    parser::parse(source)
        .and_then(|root| compiler::compile(&root))
        .map_err(|mut err| {
            if err.name.is_none() {
                err.name = Some(name.to_string());
            }
            err
        })
}

/// A handle to a stored template, borrowed from its [`Environment`].
pub struct Template<'env> {
    env: &'env Environment,
    name: &'env str,
    entry: &'env TemplateEntry,
}

impl fmt::Debug for Template<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template").field("name", &self.name).finish()
    }
}

impl Template<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    /// Render with the given root context value.
    pub fn render(&self, root: Value) -> Result<String, Error> {
        let mut buf = String::new();
        let mut out = Output::new(&mut buf);
        self.eval(root, &mut out)?;
        Ok(buf)
    }

    /// Render straight into an [`io::Write`] sink.
    pub fn render_to_write(&self, root: Value, w: impl io::Write) -> Result<(), Error> {
        let mut adapter = WriteAdapter::new(w);
        let mut out = Output::new(&mut adapter);
        match self.eval(root, &mut out) {
            Ok(()) => Ok(()),
            Err(err) => Err(match adapter.err.take() {
                Some(io_err) => Error::new(
                    ErrorKind::InvalidOperation,
                    "could not write rendered output",
                )
                .with_source(io_err),
                None => err,
            }),
        }
    }

    fn eval(&self, root: Value, out: &mut Output<'_>) -> Result<(), Error> {
        Vm::new(self.env)
            .eval(
                &self.entry.compiled.instructions,
                &self.entry.compiled.blocks,
                root,
                out,
                self.entry.initial_auto_escape,
                self.name,
            )
            .map(|_| ())
    }
}

/// A compiled bare expression; see
/// [`Environment::compile_expression`].
pub struct CompiledExpression<'env> {
    env: &'env Environment,
    instructions: Instructions,
}

impl fmt::Debug for CompiledExpression<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledExpression")
            .field("instructions", &self.instructions)
            .finish()
    }
}

impl CompiledExpression<'_> {
    /// Evaluate against a root context value.
    pub fn eval(&self, root: Value) -> Result<Value, Error> {
        let mut sink = String::new();
        let mut out = Output::new(&mut sink);
        let rv = Vm::new(self.env).eval(
            &self.instructions,
            &BTreeMap::new(),
            root,
            &mut out,
            AutoEscape::None,
            "<expression>",
        )?;
        Ok(rv.unwrap_or(Value::UNDEFINED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_lifecycle() {
        let mut env = Environment::new();
        env.add_template("greet.txt", "Hello {{ name }}!").unwrap();
        assert!(env.get_template("greet.txt").is_ok());
        env.remove_template("greet.txt");
        assert!(env.get_template("greet.txt").is_err());
    }

    #[test]
    fn test_add_template_reports_syntax_errors_eagerly() {
        let mut env = Environment::new();
        let err = env.add_template("broken.txt", "{% if %}").unwrap_err();
        assert_eq!(err.name.as_deref(), Some("broken.txt"));
    }

    #[test]
    fn test_globals_are_visible() {
        let mut env = Environment::new();
        env.add_global("version", "1.2.3");
        let rv = env.render_str("v{{ version }}", Value::UNDEFINED).unwrap();
        assert_eq!(rv, "v1.2.3");
    }

    #[test]
    fn test_html_extension_escapes() {
        let mut env = Environment::new();
        env.add_template("page.html", "{{ body }}").unwrap();
        let root = Value::from_iter([("body", Value::from("<script>"))]);
        let rv = env.get_template("page.html").unwrap().render(root).unwrap();
        assert_eq!(rv, "&lt;script&gt;");
    }

    #[test]
    fn test_compiled_expression() {
        let env = Environment::new();
        let expr = env.compile_expression("value * 2").unwrap();
        let rv = expr.eval(Value::from_iter([("value", 21)])).unwrap();
        assert_eq!(rv, Value::from(42));
    }

    #[test]
    fn test_render_to_write() {
        let mut env = Environment::new();
        env.add_template("x.txt", "ab{{ 1 + 1 }}").unwrap();
        let mut buf = Vec::new();
        env.get_template("x.txt")
            .unwrap()
            .render_to_write(Value::UNDEFINED, &mut buf)
            .unwrap();
        assert_eq!(buf, b"ab2");
    }
}
