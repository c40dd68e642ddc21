use indoc::indoc;
use loomtex::{context, Environment, Error, ErrorKind, State, UndefinedBehavior, Value};
use pretty_assertions::assert_eq;

fn render(source: &str, root: Value) -> String {
    match Environment::new().render_str(source, root) {
        Ok(rv) => rv,
        Err(err) => panic!("render failed: {err}"),
    }
}

fn render_err(source: &str, root: Value) -> Error {
    Environment::new()
        .render_str(source, root)
        .expect_err("render unexpectedly succeeded")
}

// ── Interpolation and expressions ───────────────────────────────────────

#[test]
fn test_basic_interpolation() {
    let rv = render("Hello {{ name }}!", context! { name => "World" });
    assert_eq!(rv, "Hello World!");
}

#[test]
fn test_arithmetic() {
    let rv = render(
        "{{ 1 + 2 * 3 }} {{ 7 // 2 }} {{ 7 % 3 }} {{ 2 ** 3 }} {{ -4 }}",
        Value::UNDEFINED,
    );
    assert_eq!(rv, "7 3 1 8 -4");
}

#[test]
fn test_int_div_negative_divisor_floors() {
    let rv = render("{{ 7 // -2 }} {{ -7 // 2 }} {{ -7 // -2 }}", Value::UNDEFINED);
    assert_eq!(rv, "-4 -4 3");
}

#[test]
fn test_true_division_produces_floats() {
    assert_eq!(render("{{ 1 / 2 }}", Value::UNDEFINED), "0.5");
}

#[test]
fn test_string_concat() {
    let rv = render("{{ 'id-' ~ 42 }}", Value::UNDEFINED);
    assert_eq!(rv, "id-42");
}

#[test]
fn test_comparisons_and_logic() {
    let rv = render(
        "{{ 1 < 2 }} {{ 2 in [1, 2] }} {{ 'el' in 'hello' }} {{ not false and true }}",
        Value::UNDEFINED,
    );
    assert_eq!(rv, "true true true true");
}

#[test]
fn test_indexing_and_slicing() {
    let rv = render(
        "{{ 'hello'[1] }} {{ [1, 2, 3][-1] }} {{ 'hello'[1:4] }} {{ [1, 2, 3, 4][::2] }}",
        Value::UNDEFINED,
    );
    assert_eq!(rv, "e 3 ell [1, 3]");
}

#[test]
fn test_attr_and_item_lookup_agree() {
    let root = context! { user => context! { name => "Peter" } };
    let rv = render("{{ user.name }}/{{ user['name'] }}", root);
    assert_eq!(rv, "Peter/Peter");
}

#[test]
fn test_inline_if_expression() {
    let rv = render("{{ 'yes' if cond else 'no' }}", context! { cond => false });
    assert_eq!(rv, "no");
}

// ── Control flow ────────────────────────────────────────────────────────

#[test]
fn test_if_elif_else() {
    let tmpl = "{% if n > 10 %}big{% elif n > 5 %}mid{% else %}small{% endif %}";
    assert_eq!(render(tmpl, context! { n => 20 }), "big");
    assert_eq!(render(tmpl, context! { n => 7 }), "mid");
    assert_eq!(render(tmpl, context! { n => 1 }), "small");
}

#[test]
fn test_for_loop_variables() {
    let tmpl = "{% for x in items %}{{ loop.index }}:{{ x }}{% if not loop.last %},{% endif %}{% endfor %}";
    let rv = render(tmpl, context! { items => vec!["a", "b", "c"] });
    assert_eq!(rv, "1:a,2:b,3:c");
}

#[test]
fn test_for_else() {
    let tmpl = "{% for x in items %}{{ x }}{% else %}empty{% endfor %}";
    assert_eq!(render(tmpl, context! { items => vec![1, 2] }), "12");
    assert_eq!(render(tmpl, context! { items => Vec::<i64>::new() }), "empty");
}

#[test]
fn test_for_unpacking() {
    let pairs = vec![
        Value::from(vec!["a", "1"]),
        Value::from(vec!["b", "2"]),
    ];
    let rv = render(
        "{% for k, v in pairs %}{{ k }}={{ v }};{% endfor %}",
        context! { pairs => pairs },
    );
    assert_eq!(rv, "a=1;b=2;");
}

#[test]
fn test_for_inline_filter() {
    let rv = render(
        "{% for x in [1, 2, 3, 4] if x % 2 == 0 %}{{ x }}{% endfor %}",
        Value::UNDEFINED,
    );
    assert_eq!(rv, "24");
}

#[test]
fn test_loop_cycle() {
    let rv = render(
        "{% for x in [1, 2, 3, 4] %}{{ loop.cycle('a', 'b') }}{% endfor %}",
        Value::UNDEFINED,
    );
    assert_eq!(rv, "abab");
}

#[test]
fn test_loop_changed() {
    let rv = render(
        "{% for x in [1, 1, 2] %}{{ loop.changed(x) }} {% endfor %}",
        Value::UNDEFINED,
    );
    assert_eq!(rv, "true false true ");
}

#[test]
fn test_recursive_loop() {
    let leaf = context! { name => "b", children => Vec::<Value>::new() };
    let tree = vec![context! { name => "a", children => vec![leaf] }];
    let rv = render(
        "{% for item in tree recursive %}<{{ item.name }}{{ loop.depth0 }}{{ loop(item.children) }}>{% endfor %}",
        context! { tree => tree },
    );
    assert_eq!(rv, "<a0<b1>>");
}

#[test]
fn test_map_iteration_yields_keys_in_order() {
    let root = context! { m => context! { b => 1, a => 2 } };
    let rv = render("{% for k in m %}{{ k }}{% endfor %}", root);
    assert_eq!(rv, "ba");
}

#[test]
fn test_with_block_scoping() {
    let rv = render("{% with a = 1 %}{{ a }}{% endwith %}{{ a }}", Value::UNDEFINED);
    assert_eq!(rv, "1");
}

#[test]
fn test_do_discards_its_value() {
    assert_eq!(render("{% do 1 + 1 %}ok", Value::UNDEFINED), "ok");
}

// ── Assignment ──────────────────────────────────────────────────────────

#[test]
fn test_set_and_set_block() {
    let rv = render(
        "{% set a = 1 %}{% set b %}x{{ a }}{% endset %}{{ b }}",
        Value::UNDEFINED,
    );
    assert_eq!(rv, "x1");
}

#[test]
fn test_set_block_with_filter() {
    let mut env = Environment::new();
    env.add_filter("upper", |_: &State, args: &[Value]| -> Result<Value, Error> {
        Ok(Value::from(args[0].to_string().to_uppercase()))
    });
    let rv = env
        .render_str("{% set b | upper %}ab{% endset %}{{ b }}", Value::UNDEFINED)
        .unwrap();
    assert_eq!(rv, "AB");
}

// ── Macros ──────────────────────────────────────────────────────────────

#[test]
fn test_macro_defaults_and_kwargs() {
    let tmpl = indoc! {"
        {% macro input(name, type='text') %}{{ name }}:{{ type }}{% endmacro %}
        {{ input('a') }} {{ input('b', type='num') }}"};
    assert_eq!(render(tmpl, Value::UNDEFINED), "\na:text b:num");
}

#[test]
fn test_macro_captures_enclosing_scope() {
    let rv = render(
        "{% set greeting = 'hi' %}{% macro g(n) %}{{ greeting }} {{ n }}{% endmacro %}{{ g('x') }}",
        Value::UNDEFINED,
    );
    assert_eq!(rv, "hi x");
}

#[test]
fn test_macro_too_many_arguments() {
    let err = render_err(
        "{% macro m(a) %}{{ a }}{% endmacro %}{{ m(1, 2) }}",
        Value::UNDEFINED,
    );
    assert_eq!(err.kind, ErrorKind::TooManyArguments);
}

#[test]
fn test_call_block() {
    let rv = render(
        "{% macro wrap() %}[{{ caller() }}]{% endmacro %}{% call wrap() %}body{% endcall %}",
        Value::UNDEFINED,
    );
    assert_eq!(rv, "[body]");
}

#[test]
fn test_call_block_requires_caller_reference() {
    let err = render_err(
        "{% macro plain() %}x{% endmacro %}{% call plain() %}body{% endcall %}",
        Value::UNDEFINED,
    );
    assert_eq!(err.kind, ErrorKind::TooManyArguments);
}

#[test]
fn test_call_block_with_arguments() {
    let tmpl = "{% macro each(items) %}{% for i in items %}{{ caller(i) }}{% endfor %}{% endmacro %}{% call(x) each([1, 2]) %}<{{ x }}>{% endcall %}";
    assert_eq!(render(tmpl, Value::UNDEFINED), "<1><2>");
}

// ── Escaping ────────────────────────────────────────────────────────────

#[test]
fn test_autoescape_block() {
    let root = context! { v => "<x>" };
    let rv = render(
        "{% autoescape 'html' %}{{ v }}{% endautoescape %}{{ v }}",
        root,
    );
    assert_eq!(rv, "&lt;x&gt;<x>");
}

#[test]
fn test_escape_filter_is_idempotent() {
    let root = context! { v => "a<b" };
    let rv = render("{{ v | escape }}|{{ v | escape | escape }}", root);
    assert_eq!(rv, "a&lt;b|a&lt;b");
}

#[test]
fn test_safe_disables_escaping() {
    let mut env = Environment::new();
    env.add_template("t.html", "{{ v }}|{{ v | safe }}").unwrap();
    let rv = env
        .get_template("t.html")
        .unwrap()
        .render(context! { v => "<b>" })
        .unwrap();
    assert_eq!(rv, "&lt;b&gt;|<b>");
}

#[test]
fn test_json_escaping() {
    let mut env = Environment::new();
    env.add_template("t.json", r#"{"k": {{ v }}}"#).unwrap();
    let rv = env
        .get_template("t.json")
        .unwrap()
        .render(context! { v => "a\"b" })
        .unwrap();
    assert_eq!(rv, r#"{"k": "a\"b"}"#);
}

// ── Undefined behavior ──────────────────────────────────────────────────

#[test]
fn test_lenient_prints_nothing_for_undefined() {
    assert_eq!(render("[{{ missing }}]", Value::UNDEFINED), "[]");
}

#[test]
fn test_lenient_rejects_attr_of_undefined() {
    let err = render_err("{{ missing.attr }}", Value::UNDEFINED);
    assert_eq!(err.kind, ErrorKind::UndefinedError);
}

#[test]
fn test_chainable_allows_deep_chains() {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    let rv = env
        .render_str("[{{ missing.attr.deep }}]", Value::UNDEFINED)
        .unwrap();
    assert_eq!(rv, "[]");
}

#[test]
fn test_strict_rejects_undefined_prints() {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    let err = env
        .render_str("{{ missing }}", Value::UNDEFINED)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::UndefinedError);
}

// ── Filters and tests ───────────────────────────────────────────────────

#[test]
fn test_builtin_tests() {
    let root = context! { x => 1, z => Value::NONE };
    let rv = render(
        "{{ x is defined }} {{ y is not defined }} {{ z is none }}",
        root,
    );
    assert_eq!(rv, "true true true");
}

#[test]
fn test_custom_test() {
    let mut env = Environment::new();
    env.add_test("odd", |_: &State, args: &[Value]| -> Result<bool, Error> {
        Ok(args[0].to_string().parse::<i64>().unwrap_or(0) % 2 != 0)
    });
    let rv = env
        .render_str("{% if 3 is odd %}y{% endif %}", Value::UNDEFINED)
        .unwrap();
    assert_eq!(rv, "y");
}

#[test]
fn test_unknown_filter_reported() {
    let err = render_err("{{ 1 | nope }}", Value::UNDEFINED);
    assert_eq!(err.kind, ErrorKind::UnknownFilter);
}

// ── Structure ───────────────────────────────────────────────────────────

#[test]
fn test_block_renders_in_place() {
    let rv = render("a{% block x %}b{% endblock %}c", Value::UNDEFINED);
    assert_eq!(rv, "abc");
}

#[test]
fn test_raw_block() {
    let rv = render("{% raw %}{{ not parsed }}{% endraw %}", Value::UNDEFINED);
    assert_eq!(rv, "{{ not parsed }}");
}

#[test]
fn test_comments_are_dropped() {
    assert_eq!(render("a{# hidden #}b", Value::UNDEFINED), "ab");
}

#[test]
fn test_include_rejected_at_compile_time() {
    let mut env = Environment::new();
    let err = env.add_template("x.txt", "{% include 'y' %}").unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidOperation);
}

#[test]
fn test_errors_carry_template_location() {
    let err = render_err("line one\n{{ missing.attr }}", Value::UNDEFINED);
    assert_eq!(err.name.as_deref(), Some("<string>"));
    assert_eq!(err.line, Some(2));
}

#[test]
fn test_larger_template() {
    let tmpl = indoc! {"
        {% macro row(item) %}<li>{{ item.label }}</li>{% endmacro %}
        <ul>
        {% for item in items %}{{ row(item) }}
        {% endfor %}</ul>"};
    let root = context! {
        items => vec![
            context! { label => "one" },
            context! { label => "two" },
        ],
    };
    let rv = render(tmpl, root);
    let expected = indoc! {"

        <ul>
        <li>one</li>
        <li>two</li>
        </ul>"};
    assert_eq!(rv, expected);
}
