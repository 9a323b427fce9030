//! Remote JSON HTTP resources as virtual tables.
//!
//! ```sql
//! CREATE VIRTUAL TABLE todos USING vttp(
//!     id int,
//!     userId int,
//!     title text,
//!     completed text,
//!     url text default 'https://jsonplaceholder.typicode.com/todos'
//! );
//! SELECT title FROM todos WHERE completed = 'true';
//! ```
//!
//! Each table fetches its resource once, on the first scan, and projects
//! every record onto the declared columns. Field values are coerced into
//! the storage class the column's declared type asks for (see [`coerce`]).
//!
//! Pipeline:
//! - [`schema`]: parses the declaration into a [`TableSchema`]
//! - [`fetch`]: retrieves bytes through a [`ResourceFetcher`]
//! - [`cache`]: decodes and freezes them into a shared [`RecordSet`]
//! - [`table`]: [`HttpJsonTable`] / [`HttpJsonCursor`] drive the scan

pub mod cache;
pub mod coerce;
pub mod config;
pub mod fetch;
pub mod schema;
pub mod table;

pub use cache::{RecordCache, RecordSet};
pub use config::{FetchConfig, PayloadFormat, TableOptions};
pub use fetch::{HttpFetcher, ResourceFetcher};
pub use schema::{ColumnSpec, TableSchema};
pub use table::{HttpJsonCursor, HttpJsonTable};

/// Name the module is registered under (`USING vttp(...)`).
pub const MODULE_NAME: &str = "vttp";

#[must_use]
pub const fn extension_name() -> &'static str {
    "http"
}
