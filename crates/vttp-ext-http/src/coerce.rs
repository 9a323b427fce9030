//! JSON value → `SqliteValue` coercion under a column affinity.
//!
//! [`coerce`] is total: every JSON kind under every affinity has a defined
//! result, so a column read can never fail because of what the remote
//! resource sent.
//!
//! | JSON \ affinity | Integer | Real | Text | Any / Blob |
//! |---|---|---|---|---|
//! | null / absent | default or NULL | default or NULL | default or NULL | default or NULL |
//! | bool | 1 / 0 | 1.0 / 0.0 | `"true"` / `"false"` | 1 / 0 |
//! | number | int if integral, else real | real | decimal text | int if JSON integer, else real |
//! | string | numeric parse, else text | real parse, else text | text | text |
//! | array / object | compact JSON text | compact JSON text | compact JSON text | compact JSON text |

use serde_json::{Number, Value};
use vttp_types::{SqliteValue, TypeAffinity, try_coerce_text_to_numeric};

/// Coerce one decoded field into the storage class its column asks for.
///
/// `value` is `None` when the record has no such field. `default` is the
/// column's declared default, already coerced through `affinity`.
#[must_use]
pub fn coerce(
    affinity: TypeAffinity,
    value: Option<&Value>,
    default: Option<&SqliteValue>,
) -> SqliteValue {
    match value {
        None | Some(Value::Null) => default.cloned().unwrap_or(SqliteValue::Null),
        Some(Value::Bool(b)) => coerce_bool(affinity, *b),
        Some(Value::Number(n)) => coerce_number(affinity, n),
        Some(Value::String(s)) => coerce_string(affinity, s),
        // Display on Value is the compact serializer.
        Some(nested @ (Value::Array(_) | Value::Object(_))) => SqliteValue::Text(nested.to_string()),
    }
}

/// Coerce a declared default literal through the column affinity, so a
/// default reads back exactly like a remote value of the same kind would.
#[must_use]
pub fn coerce_default(affinity: TypeAffinity, literal: SqliteValue) -> SqliteValue {
    match (affinity, literal) {
        (TypeAffinity::Integer | TypeAffinity::Real, SqliteValue::Text(s)) => {
            coerce_string(affinity, &s)
        }
        (TypeAffinity::Real, SqliteValue::Integer(i)) => SqliteValue::Float(i_to_f(i)),
        (TypeAffinity::Integer, SqliteValue::Float(f)) => {
            integral_f64(f).map_or(SqliteValue::Float(f), SqliteValue::Integer)
        }
        (TypeAffinity::Text, SqliteValue::Integer(i)) => SqliteValue::Text(i.to_string()),
        (TypeAffinity::Text, SqliteValue::Float(f)) => SqliteValue::Text(render_decimal(f)),
        (_, other) => other,
    }
}

fn coerce_bool(affinity: TypeAffinity, b: bool) -> SqliteValue {
    match affinity {
        TypeAffinity::Text => SqliteValue::Text(if b { "true" } else { "false" }.to_owned()),
        TypeAffinity::Real => SqliteValue::Float(if b { 1.0 } else { 0.0 }),
        TypeAffinity::Integer | TypeAffinity::Any | TypeAffinity::Blob => {
            SqliteValue::Integer(i64::from(b))
        }
    }
}

fn coerce_number(affinity: TypeAffinity, n: &Number) -> SqliteValue {
    match affinity {
        TypeAffinity::Text => SqliteValue::Text(render_number(n)),
        TypeAffinity::Real => SqliteValue::Float(number_f64(n)),
        TypeAffinity::Integer => {
            let integral = n
                .as_i64()
                .or_else(|| n.as_f64().and_then(integral_f64));
            integral.map_or_else(|| SqliteValue::Float(number_f64(n)), SqliteValue::Integer)
        }
        TypeAffinity::Any | TypeAffinity::Blob => n
            .as_i64()
            .map_or_else(|| SqliteValue::Float(number_f64(n)), SqliteValue::Integer),
    }
}

fn coerce_string(affinity: TypeAffinity, s: &str) -> SqliteValue {
    match affinity {
        TypeAffinity::Integer => {
            try_coerce_text_to_numeric(s).unwrap_or_else(|| SqliteValue::Text(s.to_owned()))
        }
        TypeAffinity::Real => match try_coerce_text_to_numeric(s) {
            Some(SqliteValue::Integer(i)) => SqliteValue::Float(i_to_f(i)),
            Some(float @ SqliteValue::Float(_)) => float,
            _ => SqliteValue::Text(s.to_owned()),
        },
        TypeAffinity::Text | TypeAffinity::Any | TypeAffinity::Blob => {
            SqliteValue::Text(s.to_owned())
        }
    }
}

// Without arbitrary_precision every Number has an f64 view.
fn number_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(f64::NAN)
}

#[allow(clippy::cast_precision_loss)]
fn i_to_f(i: i64) -> f64 {
    i as f64
}

/// The value of `f` as an `i64` when it is whole and in range.
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn integral_f64(f: f64) -> Option<i64> {
    if !f.is_finite() || f.fract() != 0.0 {
        return None;
    }
    // Bounds check prevents saturation for values >= 2^63.
    if (-9_223_372_036_854_775_808.0..9_223_372_036_854_775_808.0).contains(&f) {
        Some(f as i64)
    } else {
        None
    }
}

fn render_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        i.to_string()
    } else if let Some(u) = n.as_u64() {
        u.to_string()
    } else {
        render_decimal(number_f64(n))
    }
}

/// Plain decimal text for a float; whole values keep a `.0` suffix.
fn render_decimal(f: f64) -> String {
    let text = f.to_string();
    if f.is_finite() && !text.contains('.') {
        format!("{text}.0")
    } else {
        text
    }
}
