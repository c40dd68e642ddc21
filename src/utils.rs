//! Escaping helpers shared by the renderer and the built-in filters.

use std::fmt::{self, Write};

use crate::error::{Error, ErrorKind};
use crate::value::{Value, ValueKind};

/// The active escaping mode of the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoEscape {
    /// Values are emitted as-is.
    #[default]
    None,
    /// Values are HTML-entity escaped unless marked safe.
    Html,
    /// Values are emitted as JSON literals unless marked safe.
    Json,
}

impl AutoEscape {
    pub fn is_none(self) -> bool {
        matches!(self, AutoEscape::None)
    }

    /// The default mode for a template, derived from its file
    /// extension the way web frameworks conventionally do.
    pub fn from_template_name(name: &str) -> AutoEscape {
        let extension = name.rsplit('.').next().unwrap_or("");
        match extension {
            "html" | "htm" | "xml" => AutoEscape::Html,
            "json" | "json5" | "js" | "yaml" | "yml" => AutoEscape::Json,
            _ => AutoEscape::None,
        }
    }
}

/// Write `s` with the five HTML-special characters entity-escaped.
pub fn write_html_escaped(out: &mut dyn fmt::Write, s: &str) -> fmt::Result {
    let mut rest = s;
    while let Some(idx) = rest.find(['<', '>', '&', '"', '\'']) {
        out.write_str(&rest[..idx])?;
        out.write_str(match rest.as_bytes()[idx] {
            b'<' => "&lt;",
            b'>' => "&gt;",
            b'&' => "&amp;",
            b'"' => "&quot;",
            _ => "&#x27;",
        })?;
        rest = &rest[idx + 1..];
    }
    out.write_str(rest)
}

/// Write `s` as a JSON string literal, quotes included.
pub fn write_json_str(out: &mut dyn fmt::Write, s: &str) -> fmt::Result {
    out.write_char('"')?;
    for c in s.chars() {
        match c {
            '"' => out.write_str("\\\"")?,
            '\\' => out.write_str("\\\\")?,
            '\n' => out.write_str("\\n")?,
            '\r' => out.write_str("\\r")?,
            '\t' => out.write_str("\\t")?,
            '\u{0008}' => out.write_str("\\b")?,
            '\u{000C}' => out.write_str("\\f")?,
            c if (c as u32) < 0x20 => write!(out, "\\u{:04x}", c as u32)?,
            c => out.write_char(c)?,
        }
    }
    out.write_char('"')
}

/// Write a value as a JSON document.
///
/// `undefined` and `none` serialize to `null`; bytes and non-finite
/// floats have no JSON form and fail with
/// [`BadSerialization`](ErrorKind::BadSerialization).
pub fn write_json(out: &mut dyn fmt::Write, value: &Value) -> Result<(), Error> {
    let unserializable = |what: &str| {
        Error::new(
            ErrorKind::BadSerialization,
            format!("cannot serialize {what} to JSON"),
        )
    };
    match value.kind() {
        ValueKind::Undefined | ValueKind::None => out.write_str("null")?,
        ValueKind::Bool => out.write_str(if value.is_true() { "true" } else { "false" })?,
        ValueKind::Number => {
            let repr = value.to_string();
            if repr == "NaN" || repr.ends_with("inf") {
                return Err(unserializable("a non-finite float"));
            }
            out.write_str(&repr)?;
        }
        ValueKind::String => {
            // as_str is always present for string-kinded values
            write_json_str(out, value.as_str().unwrap_or(""))?;
        }
        ValueKind::Bytes => return Err(unserializable("bytes")),
        ValueKind::Seq => {
            out.write_char('[')?;
            for (idx, item) in value.try_iter()?.enumerate() {
                if idx > 0 {
                    out.write_char(',')?;
                }
                write_json(out, &item)?;
            }
            out.write_char(']')?;
        }
        ValueKind::Map => {
            out.write_char('{')?;
            for (idx, key) in value.try_iter()?.enumerate() {
                if idx > 0 {
                    out.write_char(',')?;
                }
                match key.kind() {
                    ValueKind::String => write_json_str(out, key.as_str().unwrap_or(""))?,
                    _ => return Err(unserializable("a map with non-string keys")),
                }
                write_json(out, &value.get_item(&key)?)?;
            }
            out.write_char('}')?;
        }
    }
    Ok(())
}

/// Write a value through the given escape mode. Safe strings bypass
/// escaping in every mode.
pub fn write_escaped(
    out: &mut dyn fmt::Write,
    escape: AutoEscape,
    value: &Value,
) -> Result<(), Error> {
    if value.is_safe() || escape.is_none() {
        write!(out, "{value}")?;
        return Ok(());
    }
    match escape {
        AutoEscape::Html => match value.as_str() {
            Some(s) => write_html_escaped(out, s)?,
            None => write_html_escaped(out, &value.to_string())?,
        },
        AutoEscape::Json => write_json(out, value)?,
        AutoEscape::None => unreachable!(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html(s: &str) -> String {
        let mut out = String::new();
        write_html_escaped(&mut out, s).unwrap();
        out
    }

    #[test]
    fn test_html_escaping() {
        assert_eq!(html("<b>\"a\" & 'b'</b>"), "&lt;b&gt;&quot;a&quot; &amp; &#x27;b&#x27;&lt;/b&gt;");
        assert_eq!(html("plain"), "plain");
    }

    #[test]
    fn test_json_string() {
        let mut out = String::new();
        write_json_str(&mut out, "a\"b\n\u{0001}").unwrap();
        assert_eq!(out, "\"a\\\"b\\n\\u0001\"");
    }

    #[test]
    fn test_json_document() {
        let value = Value::from_iter([
            ("name", Value::from("Peter")),
            ("active", Value::from(true)),
            ("logins", Value::from(vec![1i64, 2, 3])),
        ]);
        let mut out = String::new();
        write_json(&mut out, &value).unwrap();
        assert_eq!(out, "{\"name\":\"Peter\",\"active\":true,\"logins\":[1,2,3]}");
    }

    #[test]
    fn test_bytes_do_not_serialize() {
        let mut out = String::new();
        let err = write_json(&mut out, &Value::from_bytes(b"x".to_vec())).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadSerialization);
    }

    #[test]
    fn test_escape_mode_from_name() {
        assert_eq!(AutoEscape::from_template_name("index.html"), AutoEscape::Html);
        assert_eq!(AutoEscape::from_template_name("data.json"), AutoEscape::Json);
        assert_eq!(AutoEscape::from_template_name("mail.txt"), AutoEscape::None);
    }

    #[test]
    fn test_safe_string_bypasses_escaping() {
        let mut out = String::new();
        let value = Value::from_safe_string("<b>".to_string());
        write_escaped(&mut out, AutoEscape::Html, &value).unwrap();
        assert_eq!(out, "<b>");
    }
}
