//! Core value and metadata types shared by the vttp crates.

pub mod cx;
pub mod value;

pub use value::{SqliteValue, format_sqlite_float, try_coerce_text_to_numeric};

/// Declared type affinity of a virtual-table column.
///
/// Advisory only: it picks the storage class a remote JSON field is coerced
/// into and never rejects a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeAffinity {
    Integer,
    Text,
    Real,
    Blob,
    /// No recognized keyword, including no type at all.
    Any,
}

impl TypeAffinity {
    /// SQLite's substring rules, checked in order: `INT`, then
    /// `CHAR`/`CLOB`/`TEXT`, then `BLOB`, then `REAL`/`FLOA`/`DOUB`.
    /// Anything else (NUMERIC, BOOLEAN, DATETIME, empty) is [`Self::Any`].
    pub fn from_type_name(type_name: &str) -> Self {
        let upper = type_name.to_ascii_uppercase();

        if upper.contains("INT") {
            Self::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Self::Text
        } else if upper.contains("BLOB") {
            Self::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Self::Real
        } else {
            Self::Any
        }
    }

    /// Canonical SQL spelling, used when echoing a declaration back to the host.
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Text => "TEXT",
            Self::Real => "REAL",
            Self::Blob => "BLOB",
            Self::Any => "",
        }
    }
}

/// Runtime storage class of a [`SqliteValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageClass {
    Null,
    Integer,
    Real,
    Text,
    Blob,
}
