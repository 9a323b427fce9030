//! Table declaration parsing.
//!
//! The module arguments of
//! `CREATE VIRTUAL TABLE t USING vttp(arg, arg, ...)` are either options
//! (`key = value`) or column declarations:
//!
//! ```text
//! name [type-words] [DEFAULT literal] [GENERATED ALWAYS AS (path)] [HIDDEN]
//! ```
//!
//! The source URL comes from a `url = '...'` option, or else from the
//! `DEFAULT` of the column named `url`, which is then hidden from `SELECT *`
//! and reads back the URL.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use serde_json::Value;
use tracing::debug;
use vttp_error::{Result, VttpError};
use vttp_types::{SqliteValue, TypeAffinity};

use crate::coerce::{coerce, coerce_default};
use crate::config::TableOptions;

/// Name of the column whose default supplies the source URL.
pub const URL_COLUMN: &str = "url";

/// One declared column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    /// Name as written (quotes removed, case preserved).
    pub name: String,
    pub affinity: TypeAffinity,
    /// Declared type words, e.g. `"varchar(20)"`. Empty when untyped.
    pub decl_type: String,
    /// Default value, already coerced through `affinity`.
    pub default: Option<SqliteValue>,
    /// Keys from the record root to the field this column reads.
    pub path: Vec<String>,
    /// Declared `HIDDEN` to the host.
    pub hidden: bool,
}

impl ColumnSpec {
    /// Look up this column's field in a decoded record.
    ///
    /// Object steps match keys exactly; array steps take a decimal index.
    #[must_use]
    pub fn resolve<'a>(&self, record: &'a Value) -> Option<&'a Value> {
        self.path.iter().try_fold(record, |node, step| match node {
            Value::Object(map) => map.get(step),
            Value::Array(items) => step.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

/// Immutable description of one `vttp` table.
#[derive(Debug, Clone)]
pub struct TableSchema {
    table_name: String,
    columns: Vec<ColumnSpec>,
    source: String,
    source_ordinal: Option<usize>,
    options: TableOptions,
    by_name: HashMap<String, usize>,
}

impl TableSchema {
    /// Parse host arguments (`module, database, table, arg...`) with
    /// built-in option defaults.
    pub fn parse(args: &[&str]) -> Result<Self> {
        Self::parse_with_defaults(args, &TableOptions::default())
    }

    /// Parse host arguments, starting from `defaults` before applying any
    /// per-table options.
    pub fn parse_with_defaults(args: &[&str], defaults: &TableOptions) -> Result<Self> {
        let [_module, _database, table_name, rest @ ..] = args else {
            return Err(VttpError::config(
                "expected module, database and table name arguments",
            ));
        };

        let mut options = defaults.clone();
        let mut columns = Vec::new();
        for raw in rest {
            let arg = raw.trim();
            if arg.is_empty() {
                return Err(VttpError::config("empty column declaration"));
            }
            if let Some((key, value)) = split_option(arg) {
                options.apply(key, &value)?;
            } else {
                columns.push(parse_column(arg)?);
            }
        }
        options.validate()?;

        if columns.is_empty() {
            return Err(VttpError::config(format!(
                "table {table_name} declares no columns"
            )));
        }

        let source_ordinal = columns
            .iter()
            .rposition(|col| col.name.eq_ignore_ascii_case(URL_COLUMN));
        let column_source = match source_ordinal {
            Some(ordinal) => {
                let col = &mut columns[ordinal];
                if !matches!(col.affinity, TypeAffinity::Text | TypeAffinity::Any) {
                    return Err(VttpError::config(format!(
                        "column {} must be declared text",
                        col.name
                    )));
                }
                col.hidden = true;
                col.default
                    .as_ref()
                    .and_then(SqliteValue::as_text)
                    .map(str::to_owned)
            }
            None => None,
        };
        let source = options
            .url
            .clone()
            .or(column_source)
            .ok_or_else(|| VttpError::config("no data source configured"))?;
        validate_url(&source)?;

        let by_name = columns
            .iter()
            .enumerate()
            .map(|(i, col)| (col.name.to_ascii_lowercase(), i))
            .collect();

        debug!(
            table = %table_name,
            columns = columns.len(),
            source = %source,
            "parsed vttp table declaration"
        );

        Ok(Self {
            table_name: (*table_name).to_owned(),
            columns,
            source,
            source_ordinal,
            options,
            by_name,
        })
    }

    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    #[must_use]
    pub fn column(&self, ordinal: usize) -> Option<&ColumnSpec> {
        self.columns.get(ordinal)
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Ordinal of the column called `name` (case-insensitive). When a name
    /// is declared more than once the last declaration wins.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(&name.to_ascii_lowercase()).copied()
    }

    /// The URL rows are fetched from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Ordinal of the hidden column that reads back the URL, if declared.
    #[must_use]
    pub fn source_ordinal(&self) -> Option<usize> {
        self.source_ordinal
    }

    #[must_use]
    pub fn options(&self) -> &TableOptions {
        &self.options
    }

    /// The `CREATE TABLE` statement declaring these columns to the host.
    ///
    /// Affinities are rendered in canonical spelling. Repeated names get the
    /// smallest `:N` suffix that is neither declared nor already emitted,
    /// since the host rejects duplicate columns; ordinals are unchanged.
    #[must_use]
    pub fn declare_sql(&self) -> String {
        let declared: HashSet<String> = self
            .columns
            .iter()
            .map(|col| col.name.to_ascii_lowercase())
            .collect();
        let mut emitted: HashSet<String> = HashSet::new();
        let mut sql = String::from("CREATE TABLE x(");
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            let mut name = col.name.clone();
            let mut n = 0_usize;
            while emitted.contains(&name.to_ascii_lowercase())
                || (n > 0 && declared.contains(&name.to_ascii_lowercase()))
            {
                n += 1;
                name = format!("{}:{n}", col.name);
            }
            emitted.insert(name.to_ascii_lowercase());
            let _ = write!(sql, "\"{}\"", name.replace('"', "\"\""));
            let ty = col.affinity.as_sql();
            if !ty.is_empty() {
                sql.push(' ');
                sql.push_str(ty);
            }
            if col.hidden {
                sql.push_str(" HIDDEN");
            }
        }
        sql.push(')');
        sql
    }
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|err| VttpError::config(format!("invalid url '{url}': {err}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(VttpError::config(format!(
            "unsupported url scheme '{other}' (expected http or https)"
        ))),
    }
}

/// Split `key = value` when the left side is a single bare word.
fn split_option(arg: &str) -> Option<(&str, String)> {
    let (key, value) = arg.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key, unquote(value.trim())))
}

fn unquote(value: &str) -> String {
    for quote in ['\'', '"'] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            let doubled: String = [quote, quote].iter().collect();
            return value[1..value.len() - 1].replace(&doubled, &quote.to_string());
        }
    }
    value.to_owned()
}

// ---------------------------------------------------------------------------
// Column declaration grammar
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Bare identifier or keyword.
    Word(String),
    /// `"x"`, `` `x` `` or `[x]`.
    Quoted(String),
    /// `'x'`.
    Str(String),
    Number(String),
    Blob(Vec<u8>),
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    /// `->` or `->>`.
    Arrow,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Word(w) | Self::Number(w) => f.write_str(w),
            Self::Quoted(q) => write!(f, "\"{q}\""),
            Self::Str(s) => write!(f, "'{s}'"),
            Self::Blob(_) => f.write_str("blob literal"),
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
            Self::Comma => f.write_str(","),
            Self::Plus => f.write_str("+"),
            Self::Minus => f.write_str("-"),
            Self::Arrow => f.write_str("->"),
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;
    while let Some(&ch) = chars.get(pos) {
        match ch {
            c if c.is_whitespace() => pos += 1,
            '(' | ')' | ',' | '+' => {
                tokens.push(match ch {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    _ => Token::Plus,
                });
                pos += 1;
            }
            '-' => {
                if chars.get(pos + 1) == Some(&'>') {
                    pos += 2;
                    if chars.get(pos) == Some(&'>') {
                        pos += 1;
                    }
                    tokens.push(Token::Arrow);
                } else {
                    tokens.push(Token::Minus);
                    pos += 1;
                }
            }
            '\'' => tokens.push(Token::Str(read_quoted(&chars, &mut pos, '\'')?)),
            '"' => tokens.push(Token::Quoted(read_quoted(&chars, &mut pos, '"')?)),
            '`' => tokens.push(Token::Quoted(read_quoted(&chars, &mut pos, '`')?)),
            '[' => tokens.push(Token::Quoted(read_quoted(&chars, &mut pos, ']')?)),
            c if c.is_ascii_digit() || c == '.' => {
                let start = pos;
                while let Some(&d) = chars.get(pos) {
                    let exponent_sign = (d == '+' || d == '-')
                        && matches!(chars.get(pos.wrapping_sub(1)), Some('e' | 'E'));
                    if d.is_ascii_alphanumeric() || d == '.' || exponent_sign {
                        pos += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Number(chars[start..pos].iter().collect()));
            }
            c if is_word_char(c) => {
                let start = pos;
                while chars.get(pos).is_some_and(|&d| is_word_char(d)) {
                    pos += 1;
                }
                let word: String = chars[start..pos].iter().collect();
                if word.eq_ignore_ascii_case("x") && chars.get(pos) == Some(&'\'') {
                    let hex = read_quoted(&chars, &mut pos, '\'')?;
                    tokens.push(Token::Blob(decode_hex(&hex)?));
                } else {
                    tokens.push(Token::Word(word));
                }
            }
            other => {
                return Err(VttpError::config(format!(
                    "unexpected character '{other}' in \"{text}\""
                )));
            }
        }
    }
    Ok(tokens)
}

/// Read a quoted run starting at `chars[*pos]`. A doubled closing quote is
/// an escaped quote (except for `[...]`).
fn read_quoted(chars: &[char], pos: &mut usize, close: char) -> Result<String> {
    let escapable = close != ']';
    let mut out = String::new();
    *pos += 1;
    loop {
        let Some(&c) = chars.get(*pos) else {
            return Err(VttpError::config(format!("unterminated {close} quote")));
        };
        *pos += 1;
        if c == close {
            if escapable && chars.get(*pos) == Some(&close) {
                out.push(close);
                *pos += 1;
                continue;
            }
            return Ok(out);
        }
        out.push(c);
    }
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(VttpError::config(format!("malformed blob literal X'{hex}'")));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| VttpError::config(format!("malformed blob literal X'{hex}'")))
        })
        .collect()
}

/// Words that end a type name. None of them is accepted afterwards.
const UNSUPPORTED_CONSTRAINTS: [&str; 8] = [
    "CONSTRAINT",
    "NOT",
    "NULL",
    "PRIMARY",
    "UNIQUE",
    "CHECK",
    "REFERENCES",
    "COLLATE",
];

/// A `DEFAULT` literal before affinity coercion.
enum Literal {
    Value(SqliteValue),
    Bool(bool),
}

struct ColumnParser<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> ColumnParser<'a> {
    fn new(text: &'a str) -> Result<Self> {
        Ok(Self {
            text,
            tokens: tokenize(text)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, what: &str) -> VttpError {
        VttpError::config(format!("{what} in column declaration \"{}\"", self.text))
    }

    fn peek_keyword(&self) -> Option<&'static str> {
        let Some(Token::Word(word)) = self.peek() else {
            return None;
        };
        ["DEFAULT", "GENERATED", "AS", "HIDDEN"]
            .into_iter()
            .find(|kw| word.eq_ignore_ascii_case(kw))
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        match self.advance() {
            Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword) => Ok(()),
            _ => Err(self.error(&format!("expected {keyword}"))),
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.advance() {
            Some(ref tok) if tok == expected => Ok(()),
            _ => Err(self.error(&format!("expected '{expected}'"))),
        }
    }

    fn parse(mut self) -> Result<ColumnSpec> {
        let name = match self.advance() {
            Some(Token::Word(w) | Token::Quoted(w) | Token::Str(w)) if !w.is_empty() => w,
            _ => return Err(self.error("expected column name")),
        };

        let decl_type = self.parse_type()?;
        let affinity = TypeAffinity::from_type_name(&decl_type);

        let mut spec = ColumnSpec {
            path: vec![name.clone()],
            name,
            affinity,
            decl_type,
            default: None,
            hidden: false,
        };

        while let Some(tok) = self.peek().cloned() {
            match self.peek_keyword() {
                Some("DEFAULT") => {
                    self.pos += 1;
                    spec.default = match self.parse_literal()? {
                        Literal::Value(SqliteValue::Null) => None,
                        Literal::Value(v) => Some(coerce_default(affinity, v)),
                        Literal::Bool(b) => Some(coerce(affinity, Some(&Value::Bool(b)), None)),
                    };
                }
                Some("GENERATED") => {
                    self.pos += 1;
                    self.expect_keyword("ALWAYS")?;
                    self.expect_keyword("AS")?;
                    spec.path = self.parse_path()?;
                }
                Some("AS") => {
                    self.pos += 1;
                    spec.path = self.parse_path()?;
                }
                Some("HIDDEN") => {
                    self.pos += 1;
                    spec.hidden = true;
                }
                _ => return Err(self.error(&format!("unexpected '{tok}'"))),
            }
        }
        Ok(spec)
    }

    /// Type words up to the first constraint keyword, with an optional
    /// parenthesized size such as `(10, 2)`.
    fn parse_type(&mut self) -> Result<String> {
        let mut words = Vec::new();
        while self.peek_keyword().is_none() {
            let Some(Token::Word(word)) = self.peek() else {
                break;
            };
            if UNSUPPORTED_CONSTRAINTS
                .iter()
                .any(|kw| word.eq_ignore_ascii_case(kw))
            {
                break;
            }
            words.push(word.clone());
            self.pos += 1;
        }
        let mut decl = words.join(" ");
        if !words.is_empty() && self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            decl.push('(');
            loop {
                match self.advance() {
                    Some(Token::RParen) => break,
                    Some(Token::Number(n)) => decl.push_str(&n),
                    Some(Token::Comma) => decl.push_str(", "),
                    Some(Token::Plus) => decl.push('+'),
                    Some(Token::Minus) => decl.push('-'),
                    _ => return Err(self.error("malformed type size")),
                }
            }
            decl.push(')');
        }
        Ok(decl)
    }

    fn parse_literal(&mut self) -> Result<Literal> {
        match self.advance() {
            Some(Token::Str(s) | Token::Quoted(s)) => Ok(Literal::Value(SqliteValue::Text(s))),
            Some(Token::Blob(b)) => Ok(Literal::Value(SqliteValue::Blob(b))),
            Some(Token::Number(n)) => self.number(&n, false),
            Some(Token::Plus) => match self.advance() {
                Some(Token::Number(n)) => self.number(&n, false),
                _ => Err(self.error("expected number after '+'")),
            },
            Some(Token::Minus) => match self.advance() {
                Some(Token::Number(n)) => self.number(&n, true),
                _ => Err(self.error("expected number after '-'")),
            },
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("NULL") => {
                Ok(Literal::Value(SqliteValue::Null))
            }
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("TRUE") => Ok(Literal::Bool(true)),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("FALSE") => Ok(Literal::Bool(false)),
            Some(Token::LParen) => {
                let inner = self.parse_literal()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            _ => Err(self.error("expected literal after DEFAULT")),
        }
    }

    fn number(&self, digits: &str, negative: bool) -> Result<Literal> {
        let signed = if negative {
            format!("-{digits}")
        } else {
            digits.to_owned()
        };
        if let Ok(i) = signed.parse::<i64>() {
            return Ok(Literal::Value(SqliteValue::Integer(i)));
        }
        signed
            .parse::<f64>()
            .map(|f| Literal::Value(SqliteValue::Float(f)))
            .map_err(|_| self.error(&format!("malformed number '{digits}'")))
    }

    /// `( step -> step -> ... )`
    fn parse_path(&mut self) -> Result<Vec<String>> {
        self.expect(&Token::LParen)?;
        let mut path = Vec::new();
        loop {
            match self.advance() {
                Some(Token::Word(s) | Token::Quoted(s) | Token::Str(s) | Token::Number(s)) => {
                    path.push(s);
                }
                _ => return Err(self.error("expected json key in path")),
            }
            match self.advance() {
                Some(Token::Arrow) => {}
                Some(Token::RParen) => return Ok(path),
                _ => return Err(self.error("expected '->' or ')' in path")),
            }
        }
    }
}

fn parse_column(text: &str) -> Result<ColumnSpec> {
    ColumnParser::new(text)?.parse()
}
