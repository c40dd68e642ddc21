//! Binary and unary operations over values.
//!
//! Numeric operands are coerced in a fixed order: strings stay strings
//! (concat and comparison only), any float converts both sides to
//! `f64`, everything else widens to 128-bit signed integers. Integer
//! results are narrowed back to the smallest fitting variant.

use std::cmp::Ordering;

use crate::error::{Error, ErrorKind};
use crate::value::{KeyRef, ObjectKind, Value, ValueKind, ValueRepr};

enum CoerceResult {
    I128(i128, i128),
    F64(f64, f64),
    Str(String, String),
}

fn coerce(left: &Value, right: &Value) -> Option<CoerceResult> {
    match (&left.0, &right.0) {
        (ValueRepr::String(a, _), ValueRepr::String(b, _)) => {
            Some(CoerceResult::Str(a.to_string(), b.to_string()))
        }
        (ValueRepr::F64(a), _) => Some(CoerceResult::F64(*a, right.as_f64()?)),
        (_, ValueRepr::F64(b)) => Some(CoerceResult::F64(left.as_f64()?, *b)),
        _ => Some(CoerceResult::I128(
            left.as_i128_widened()?,
            right.as_i128_widened()?,
        )),
    }
}

fn impossible_op(op: &str, lhs: &Value, rhs: &Value) -> Error {
    Error::new(
        ErrorKind::InvalidOperation,
        format!(
            "tried to use {op} operator on unsupported types {} and {}",
            lhs.type_name(),
            rhs.type_name()
        ),
    )
}

fn int_overflow(op: &str) -> Error {
    Error::new(
        ErrorKind::InvalidOperation,
        format!("{op} operation overflowed the 128-bit integer range"),
    )
}

// ── Arithmetic ──────────────────────────────────────────────────────────

pub fn add(lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    match coerce(lhs, rhs) {
        // wrapping at the 128-bit boundary, per the numeric coercion law
        Some(CoerceResult::I128(a, b)) => Ok(Value::from_i128_narrowed(a.wrapping_add(b))),
        Some(CoerceResult::F64(a, b)) => Ok(Value::from(a + b)),
        Some(CoerceResult::Str(a, b)) => Ok(Value::from(format!("{a}{b}"))),
        None => Err(impossible_op("+", lhs, rhs)),
    }
}

pub fn sub(lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    match coerce(lhs, rhs) {
        Some(CoerceResult::I128(a, b)) => a
            .checked_sub(b)
            .map(Value::from_i128_narrowed)
            .ok_or_else(|| int_overflow("-")),
        Some(CoerceResult::F64(a, b)) => Ok(Value::from(a - b)),
        _ => Err(impossible_op("-", lhs, rhs)),
    }
}

pub fn mul(lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    match coerce(lhs, rhs) {
        Some(CoerceResult::I128(a, b)) => a
            .checked_mul(b)
            .map(Value::from_i128_narrowed)
            .ok_or_else(|| int_overflow("*")),
        Some(CoerceResult::F64(a, b)) => Ok(Value::from(a * b)),
        _ => Err(impossible_op("*", lhs, rhs)),
    }
}

/// True division always produces a float.
pub fn div(lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => Ok(Value::from(a / b)),
        _ => Err(impossible_op("/", lhs, rhs)),
    }
}

/// Integer division; floors toward negative infinity.
pub fn int_div(lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    match coerce(lhs, rhs) {
        Some(CoerceResult::I128(a, b)) => {
            if b == 0 {
                return Err(Error::new(
                    ErrorKind::InvalidOperation,
                    "division by zero",
                ));
            }
            let q = a.checked_div(b).ok_or_else(|| int_overflow("//"))?;
            // truncating division rounds toward zero; correct it when
            // the operands have opposite signs and the division is inexact
            let q = if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q };
            Ok(Value::from_i128_narrowed(q))
        }
        Some(CoerceResult::F64(a, b)) => Ok(Value::from((a / b).floor())),
        _ => Err(impossible_op("//", lhs, rhs)),
    }
}

/// Remainder; IEEE-like for floats.
pub fn rem(lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    match coerce(lhs, rhs) {
        Some(CoerceResult::I128(a, b)) => {
            if b == 0 {
                return Err(Error::new(
                    ErrorKind::InvalidOperation,
                    "division by zero",
                ));
            }
            a.checked_rem(b)
                .map(Value::from_i128_narrowed)
                .ok_or_else(|| int_overflow("%"))
        }
        Some(CoerceResult::F64(a, b)) => Ok(Value::from(a % b)),
        _ => Err(impossible_op("%", lhs, rhs)),
    }
}

pub fn pow(lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    match coerce(lhs, rhs) {
        Some(CoerceResult::I128(a, b)) => {
            if b < 0 {
                // negative exponents leave the integers
                return Ok(Value::from((a as f64).powf(b as f64)));
            }
            let exp = u32::try_from(b).map_err(|_| int_overflow("**"))?;
            a.checked_pow(exp)
                .map(Value::from_i128_narrowed)
                .ok_or_else(|| int_overflow("**"))
        }
        Some(CoerceResult::F64(a, b)) => Ok(Value::from(a.powf(b))),
        _ => Err(impossible_op("**", lhs, rhs)),
    }
}

pub fn neg(val: &Value) -> Result<Value, Error> {
    match &val.0 {
        ValueRepr::F64(n) => Ok(Value::from(-n)),
        _ => match val.as_i128_widened() {
            Some(n) => n
                .checked_neg()
                .map(Value::from_i128_narrowed)
                .ok_or_else(|| int_overflow("-")),
            None => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("tried to negate a value of type {}", val.type_name()),
            )),
        },
    }
}

/// The `~` operator: format both sides and join.
pub fn string_concat(lhs: &Value, rhs: &Value) -> Value {
    Value::from(format!("{lhs}{rhs}"))
}

/// The `in` operator: substring for strings, elementwise equality for
/// sequences, key presence for maps.
pub fn contains(container: &Value, value: &Value) -> Result<Value, Error> {
    let rv = match &container.0 {
        ValueRepr::String(haystack, _) => match &value.0 {
            ValueRepr::String(needle, _) => haystack.contains(&**needle),
            _ => haystack.contains(&value.to_string()),
        },
        ValueRepr::Seq(items) => items.iter().any(|item| item == value),
        ValueRepr::Map(m, _) => m.contains_key(&KeyRef::from_value(value)),
        ValueRepr::Dynamic(obj) => match obj.kind() {
            ObjectKind::Seq(seq) => {
                (0..seq.item_count()).any(|idx| seq.get_item(idx).as_ref() == Some(value))
            }
            ObjectKind::Struct(st) => value
                .as_str()
                .map(|name| st.get_field(name).is_some())
                .unwrap_or(false),
            ObjectKind::Plain => {
                return Err(Error::new(
                    ErrorKind::InvalidOperation,
                    "cannot perform a containment check on this value",
                ))
            }
        },
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                "cannot perform a containment check on this value",
            ))
        }
    };
    Ok(Value::from(rv))
}

// ── Ordering ────────────────────────────────────────────────────────────

/// Total order over all values: same-kind natural order, cross-kind
/// fallback by kind rank. Floats compare by IEEE total bit-order.
pub fn total_cmp(left: &Value, right: &Value) -> Ordering {
    fn f64_total_cmp(a: f64, b: f64) -> Ordering {
        a.total_cmp(&b)
    }

    let (lk, rk) = (left.kind(), right.kind());
    if lk == ValueKind::Number && rk == ValueKind::Number {
        return match coerce(left, right) {
            Some(CoerceResult::I128(a, b)) => a.cmp(&b),
            Some(CoerceResult::F64(a, b)) => f64_total_cmp(a, b),
            // integral floats outside the 128-bit range
            _ => f64_total_cmp(
                left.as_f64().unwrap_or(f64::NAN),
                right.as_f64().unwrap_or(f64::NAN),
            ),
        };
    }
    lk.cmp(&rk).then_with(|| match (&left.0, &right.0) {
        (ValueRepr::Bool(a), ValueRepr::Bool(b)) => a.cmp(b),
        (ValueRepr::String(a, _), ValueRepr::String(b, _)) => a.cmp(b),
        (ValueRepr::Bytes(a), ValueRepr::Bytes(b)) => a.cmp(b),
        (ValueRepr::Seq(a), ValueRepr::Seq(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let ord = total_cmp(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        (ValueRepr::Map(a, _), ValueRepr::Map(b, _)) => {
            for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                let ord = total_cmp(&ka.to_value(), &kb.to_value());
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = total_cmp(va, vb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => Ordering::Equal,
    })
}

// ── Slicing ─────────────────────────────────────────────────────────────

/// `value[start:stop:step]` over strings (by code point), sequences,
/// and dynamic sequence objects. `none`/`undefined` slice to an empty
/// sequence.
pub fn slice(
    value: &Value,
    start: Value,
    stop: Value,
    step: Value,
) -> Result<Value, Error> {
    let start = match start.is_none() | start.is_undefined() {
        true => 0,
        false => start.as_i64_lossless().ok_or_else(|| {
            Error::new(ErrorKind::InvalidOperation, "slice bounds must be integers")
        })?,
    };
    let stop = match stop.is_none() | stop.is_undefined() {
        true => None,
        false => Some(stop.as_i64_lossless().ok_or_else(|| {
            Error::new(ErrorKind::InvalidOperation, "slice bounds must be integers")
        })?),
    };
    let step = match step.is_none() | step.is_undefined() {
        true => 1,
        false => step.as_i64_lossless().ok_or_else(|| {
            Error::new(ErrorKind::InvalidOperation, "slice step must be an integer")
        })?,
    };
    if step <= 0 {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            "cannot slice by a step of 0 or less",
        ));
    }
    let step = step as usize;

    // resolve an index against a known length, counting negative
    // values from the end and clamping at 0
    fn resolve(idx: i64, len: usize) -> usize {
        if idx < 0 {
            len.saturating_sub(idx.unsigned_abs() as usize)
        } else {
            (idx as usize).min(len)
        }
    }

    match &value.0 {
        ValueRepr::Undefined | ValueRepr::None => {
            Ok(Value::from(Vec::<Value>::new()))
        }
        ValueRepr::String(s, _) => {
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len();
            let lo = resolve(start, len);
            let hi = resolve(stop.unwrap_or(len as i64), len);
            let sliced: String = if lo < hi {
                chars[lo..hi].iter().step_by(step).collect()
            } else {
                String::new()
            };
            Ok(Value::from(sliced))
        }
        ValueRepr::Seq(items) => {
            let len = items.len();
            let lo = resolve(start, len);
            let hi = resolve(stop.unwrap_or(len as i64), len);
            let sliced: Vec<Value> = if lo < hi {
                items[lo..hi].iter().step_by(step).cloned().collect()
            } else {
                Vec::new()
            };
            Ok(Value::from(sliced))
        }
        ValueRepr::Dynamic(obj) => match obj.kind() {
            ObjectKind::Seq(seq) => {
                let len = seq.item_count();
                let lo = resolve(start, len);
                let hi = resolve(stop.unwrap_or(len as i64), len);
                let mut sliced = Vec::new();
                let mut idx = lo;
                while idx < hi {
                    if let Some(item) = seq.get_item(idx) {
                        sliced.push(item);
                    }
                    idx += step;
                }
                Ok(Value::from(sliced))
            }
            _ => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("value of type {} cannot be sliced", value.type_name()),
            )),
        },
        _ => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("value of type {} cannot be sliced", value.type_name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_wraps_at_i128() {
        let a = Value::from(i128::MAX);
        let b = Value::from(1);
        let rv = add(&a, &b).unwrap();
        assert_eq!(rv, Value::from(i128::MIN));
    }

    #[test]
    fn test_mul_overflow_fails() {
        let a = Value::from(i128::MAX);
        let b = Value::from(2);
        assert!(mul(&a, &b).is_err());
    }

    #[test]
    fn test_div_always_float() {
        assert_eq!(div(&Value::from(4), &Value::from(2)).unwrap(), Value::from(2.0));
        assert_eq!(
            div(&Value::from(4), &Value::from(2)).unwrap().to_string(),
            "2.0"
        );
    }

    #[test]
    fn test_int_div_floors() {
        assert_eq!(
            int_div(&Value::from(-7), &Value::from(2)).unwrap(),
            Value::from(-4)
        );
        assert_eq!(
            int_div(&Value::from(7), &Value::from(-2)).unwrap(),
            Value::from(-4)
        );
        assert_eq!(
            int_div(&Value::from(-7), &Value::from(-2)).unwrap(),
            Value::from(3)
        );
        assert_eq!(
            int_div(&Value::from(6), &Value::from(-2)).unwrap(),
            Value::from(-3)
        );
        assert_eq!(
            int_div(&Value::from(7.0), &Value::from(2.0)).unwrap(),
            Value::from(3.0)
        );
        assert_eq!(
            int_div(&Value::from(7.0), &Value::from(-2.0)).unwrap(),
            Value::from(-4.0)
        );
    }

    #[test]
    fn test_pow() {
        assert_eq!(pow(&Value::from(2), &Value::from(3)).unwrap(), Value::from(8));
        assert_eq!(
            pow(&Value::from(2), &Value::from(-1)).unwrap(),
            Value::from(0.5)
        );
    }

    #[test]
    fn test_string_add_is_concat() {
        assert_eq!(
            add(&Value::from("foo"), &Value::from("bar")).unwrap(),
            Value::from("foobar")
        );
    }

    #[test]
    fn test_arith_on_strings_fails() {
        assert!(sub(&Value::from("foo"), &Value::from("bar")).is_err());
    }

    #[test]
    fn test_concat_formats_both_sides() {
        assert_eq!(
            string_concat(&Value::from("n = "), &Value::from(3)),
            Value::from("n = 3")
        );
    }

    #[test]
    fn test_contains() {
        assert_eq!(
            contains(&Value::from("Johnson"), &Value::from("John")).unwrap(),
            Value::from(true)
        );
        let seq = Value::from(vec![1, 2, 3]);
        assert_eq!(contains(&seq, &Value::from(2)).unwrap(), Value::from(true));
        assert_eq!(contains(&seq, &Value::from(9)).unwrap(), Value::from(false));
    }

    #[test]
    fn test_slice_string_by_code_points() {
        let v = Value::from("Johnson");
        let rv = slice(&v, Value::NONE, Value::from(4), Value::NONE).unwrap();
        assert_eq!(rv, Value::from("John"));
    }

    #[test]
    fn test_slice_negative_and_clamped() {
        let v = Value::from(vec![1, 2, 3, 4]);
        let rv = slice(&v, Value::from(-2), Value::NONE, Value::NONE).unwrap();
        assert_eq!(rv, Value::from(vec![3, 4]));
        let rv = slice(&v, Value::from(-100), Value::from(2), Value::NONE).unwrap();
        assert_eq!(rv, Value::from(vec![1, 2]));
    }

    #[test]
    fn test_slice_step_zero_fails() {
        let v = Value::from(vec![1, 2, 3]);
        assert!(slice(&v, Value::NONE, Value::NONE, Value::from(0)).is_err());
    }

    #[test]
    fn test_slice_none_is_empty_seq() {
        let rv = slice(&Value::NONE, Value::NONE, Value::NONE, Value::NONE).unwrap();
        assert_eq!(rv, Value::from(Vec::<Value>::new()));
    }

    #[test]
    fn test_cross_kind_ordering() {
        assert!(Value::NONE < Value::from(false));
        assert!(Value::from(true) < Value::from(0));
        assert!(Value::from(99) < Value::from("a"));
        assert!(Value::UNDEFINED < Value::NONE);
    }
}
