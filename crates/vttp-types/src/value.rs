use std::fmt;

use crate::StorageClass;

/// One cell as handed back to the host: exactly one of SQLite's five
/// storage classes.
#[derive(Clone, Debug)]
pub enum SqliteValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqliteValue {
    pub const fn storage_class(&self) -> StorageClass {
        match self {
            Self::Null => StorageClass::Null,
            Self::Integer(_) => StorageClass::Integer,
            Self::Float(_) => StorageClass::Real,
            Self::Text(_) => StorageClass::Text,
            Self::Blob(_) => StorageClass::Blob,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        if let Self::Text(s) = self {
            Some(s)
        } else {
            None
        }
    }
}

/// Shell-style rendering: text is single-quoted, blobs are `X'..'` literals.
impl fmt::Display for SqliteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => f.write_str(&format_sqlite_float(*v)),
            Self::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Blob(bytes) => {
                f.write_str("X'")?;
                bytes.iter().try_for_each(|b| write!(f, "{b:02X}"))?;
                f.write_str("'")
            }
        }
    }
}

/// Equal only within the same storage class; `Integer(1) != Float(1.0)`.
impl PartialEq for SqliteValue {
    #[allow(clippy::float_cmp)]
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Blob(a), Self::Blob(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i64> for SqliteValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for SqliteValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<String> for SqliteValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for SqliteValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

/// Parse `s` as a SQL numeric literal, the way SQLite applies NUMERIC
/// affinity to text.
///
/// Surrounding whitespace is ignored. An integer literal, or a real literal
/// holding an exact in-range integer (`"4.0"`), becomes `Integer`; other
/// reals become `Float`. `inf`/`nan` spellings are not literals.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::float_cmp
)]
pub fn try_coerce_text_to_numeric(s: &str) -> Option<SqliteValue> {
    let literal = s.trim();
    if literal.is_empty() {
        return None;
    }
    if let Ok(i) = literal.parse::<i64>() {
        return Some(SqliteValue::Integer(i));
    }
    let f = literal.parse::<f64>().ok()?;
    if !f.is_finite() && literal.bytes().any(|b| matches!(b, b'i' | b'I' | b'n' | b'N')) {
        return None;
    }
    // 2^63 itself does not fit, so the upper bound is exclusive.
    if (-9_223_372_036_854_775_808.0..9_223_372_036_854_775_808.0).contains(&f) && f.fract() == 0.0 {
        return Some(SqliteValue::Integer(f as i64));
    }
    Some(SqliteValue::Float(f))
}

/// Render a REAL the way SQLite's `%!.15g` does: 15 significant digits and
/// always a decimal point (`120.0`, `1.0e+20`).
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn format_sqlite_float(f: f64) -> String {
    if f.is_nan() {
        return "NaN".to_owned();
    }
    if f.is_infinite() {
        return (if f > 0.0 { "Inf" } else { "-Inf" }).to_owned();
    }
    if f == 0.0 {
        return "0.0".to_owned();
    }

    let exp = f.abs().log10().floor() as i32;
    if (-4..15).contains(&exp) {
        #[allow(clippy::cast_sign_loss)]
        let places = (14 - exp).max(0) as usize;
        return keep_point(format!("{f:.places$}"));
    }

    let sci = format!("{f:.14e}");
    let Some((mantissa, exponent)) = sci.split_once('e') else {
        return sci;
    };
    let mantissa = keep_point(mantissa.to_owned());
    let (sign, digits) = exponent
        .strip_prefix('-')
        .map_or(("+", exponent), |rest| ("-", rest));
    let digits: u32 = digits.parse().unwrap_or(0);
    format!("{mantissa}e{sign}{digits:02}")
}

/// Trim trailing fractional zeros but leave at least one digit after `.`.
fn keep_point(mut s: String) -> String {
    if !s.contains('.') {
        s.push_str(".0");
        return s;
    }
    let trimmed = s.trim_end_matches('0').len();
    s.truncate(trimmed);
    if s.ends_with('.') {
        s.push('0');
    }
    s
}
