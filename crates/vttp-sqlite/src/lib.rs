//! SQLite binding for the `vttp` virtual table module.
//!
//! Adapts [`HttpJsonTable`]/[`HttpJsonCursor`] onto the real virtual table
//! ABI through `rusqlite::vtab`. The module is registered read-only: SQLite
//! itself rejects INSERT/UPDATE/DELETE against a `vttp` table.
//!
//! Failures reach the host with the result code of their
//! [`vttp_error::ErrorCode`], so a cancelled fetch reports `SQLITE_INTERRUPT`
//! and a bad column ordinal `SQLITE_RANGE`.
//!
//! ```no_run
//! let conn = rusqlite::Connection::open_in_memory()?;
//! vttp_sqlite::register_module(&conn)?;
//! conn.execute_batch(
//!     "CREATE VIRTUAL TABLE todos USING vttp(
//!          id int, title text, completed int,
//!          url text default 'https://jsonplaceholder.typicode.com/todos')",
//! )?;
//! # Ok::<(), rusqlite::Error>(())
//! ```

use std::marker::PhantomData;
use std::os::raw::c_int;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, ffi};
use rusqlite::vtab::{
    Context, CreateVTab, Filters, IndexConstraintOp, IndexInfo as SqliteIndexInfo, VTab,
    VTabConnection, VTabCursor, VTabKind, read_only_module, sqlite3_vtab, sqlite3_vtab_cursor,
};
use tracing::{debug, info};
use vttp_error::VttpError;
use vttp_ext_http::{
    HttpFetcher, HttpJsonCursor, HttpJsonTable, MODULE_NAME, ResourceFetcher, TableOptions,
};
use vttp_types::SqliteValue;
use vttp_types::cx::Cx;
use vttp_vtab::{
    ColumnContext, ConstraintOp, IndexConstraint, IndexInfo, IndexOrderBy, VirtualTable,
    VirtualTableCursor,
};

/// Register `vttp` on `conn`, fetching over HTTP with default options.
pub fn register_module(conn: &Connection) -> rusqlite::Result<InterruptHandle> {
    register_module_with_config(conn, TableOptions::default())
}

/// Register `vttp` on `conn`, fetching over HTTP. `defaults` seeds every
/// table's options before its own `key = value` arguments apply.
pub fn register_module_with_config(
    conn: &Connection,
    defaults: TableOptions,
) -> rusqlite::Result<InterruptHandle> {
    let fetcher = HttpFetcher::new().map_err(module_error)?;
    register_module_with_fetcher(conn, Arc::new(fetcher), defaults)
}

/// Register `vttp` on `conn` with a caller-supplied fetcher.
///
/// The returned handle interrupts fetches made by this connection's `vttp`
/// tables; it may be used from any thread.
pub fn register_module_with_fetcher(
    conn: &Connection,
    fetcher: Arc<dyn ResourceFetcher>,
    defaults: TableOptions,
) -> rusqlite::Result<InterruptHandle> {
    let interrupt = InterruptHandle::default();
    conn.create_module(
        MODULE_NAME,
        read_only_module::<VttpTab>(),
        Some(ModuleContext {
            fetcher,
            defaults,
            interrupt: interrupt.clone(),
        }),
    )?;
    info!(module = MODULE_NAME, "registered virtual table module");
    Ok(interrupt)
}

/// Cancels in-flight `vttp` fetches on the connection it was returned for.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    current: Arc<Mutex<Cx>>,
}

impl InterruptHandle {
    /// Interrupt every open `vttp` cursor: a pending or later fetch on them
    /// fails with `SQLITE_INTERRUPT`. Cursors opened afterwards are unaffected.
    pub fn interrupt(&self) {
        let mut current = self.current.lock();
        current.cancel();
        *current = Cx::new();
        info!(module = MODULE_NAME, "interrupt requested");
    }

    fn context(&self) -> Cx {
        self.current.lock().clone()
    }
}

/// Per-connection state handed to every table the module creates.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    fetcher: Arc<dyn ResourceFetcher>,
    defaults: TableOptions,
    interrupt: InterruptHandle,
}

fn module_error(err: VttpError) -> rusqlite::Error {
    let code = err.error_code();
    debug!(code = ?code, hint = err.suggestion(), "vttp: callback failed");
    rusqlite::Error::SqliteFailure(ffi::Error::new(code as c_int), Some(err.to_string()))
}

/// Host-side table object. `base` must stay the first field.
#[repr(C)]
pub struct VttpTab {
    base: sqlite3_vtab,
    table: HttpJsonTable,
    interrupt: InterruptHandle,
}

unsafe impl<'vtab> VTab<'vtab> for VttpTab {
    type Aux = ModuleContext;
    type Cursor = VttpCursor<'vtab>;

    fn connect(
        _db: &mut VTabConnection,
        aux: Option<&Self::Aux>,
        args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let context = aux.ok_or_else(|| {
            module_error(VttpError::internal("module registered without context"))
        })?;
        let args = args
            .iter()
            .map(|arg| {
                std::str::from_utf8(arg).map_err(|_| {
                    module_error(VttpError::config("module arguments must be valid UTF-8"))
                })
            })
            .collect::<rusqlite::Result<Vec<&str>>>()?;

        let table = HttpJsonTable::with_fetcher(&args, Arc::clone(&context.fetcher), &context.defaults)
            .map_err(module_error)?;
        let sql = table.declaration();
        debug!(sql = %sql, "vttp: declaring table");
        Ok((
            sql,
            Self {
                base: sqlite3_vtab::default(),
                table,
                interrupt: context.interrupt.clone(),
            },
        ))
    }

    fn best_index(&self, info: &mut SqliteIndexInfo) -> rusqlite::Result<()> {
        let constraints = info
            .constraints()
            .map(|c| IndexConstraint {
                column: c.column(),
                op: constraint_op(c.operator()),
                usable: c.is_usable(),
            })
            .collect();
        let order_by = info
            .order_bys()
            .map(|o| IndexOrderBy {
                column: o.column(),
                desc: o.is_order_by_desc(),
            })
            .collect();
        let mut plan = IndexInfo::new(constraints, order_by);
        self.table.best_index(&mut plan).map_err(module_error)?;

        for (i, usage) in plan.constraint_usage.iter().enumerate() {
            if usage.argv_index > 0 {
                let mut target = info.constraint_usage(i);
                target.set_argv_index(usage.argv_index);
                target.set_omit(usage.omit);
            }
        }
        info.set_idx_num(plan.idx_num);
        info.set_order_by_consumed(plan.order_by_consumed);
        info.set_estimated_cost(plan.estimated_cost);
        info.set_estimated_rows(plan.estimated_rows);
        Ok(())
    }

    fn open(&'vtab mut self) -> rusqlite::Result<VttpCursor<'vtab>> {
        let cx = self.interrupt.context();
        let cursor = self.table.open(&cx).map_err(module_error)?;
        Ok(VttpCursor {
            base: sqlite3_vtab_cursor::default(),
            cursor,
            cx,
            phantom: PhantomData,
        })
    }
}

impl CreateVTab<'_> for VttpTab {
    const KIND: VTabKind = VTabKind::Default;
}

/// Host-side cursor object. `base` must stay the first field.
#[repr(C)]
pub struct VttpCursor<'vtab> {
    base: sqlite3_vtab_cursor,
    cursor: HttpJsonCursor,
    cx: Cx,
    phantom: PhantomData<&'vtab VttpTab>,
}

unsafe impl VTabCursor for VttpCursor<'_> {
    fn filter(
        &mut self,
        idx_num: c_int,
        idx_str: Option<&str>,
        args: &Filters<'_>,
    ) -> rusqlite::Result<()> {
        let args = (0..args.len())
            .map(|i| args.get::<Value>(i).map(from_sql_value))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        self.cursor
            .filter(&self.cx, idx_num, idx_str, &args)
            .map_err(module_error)
    }

    fn next(&mut self) -> rusqlite::Result<()> {
        self.cursor.next(&self.cx).map_err(module_error)
    }

    fn eof(&self) -> bool {
        self.cursor.eof()
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> rusqlite::Result<()> {
        let mut out = ColumnContext::new();
        self.cursor.column(&mut out, i).map_err(module_error)?;
        ctx.set_result(&to_sql_value(out.take_value().unwrap_or(SqliteValue::Null)))
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        self.cursor.rowid().map_err(module_error)
    }
}

fn constraint_op(op: IndexConstraintOp) -> ConstraintOp {
    match op {
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ => ConstraintOp::Eq,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GT => ConstraintOp::Gt,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LE => ConstraintOp::Le,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LT => ConstraintOp::Lt,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GE => ConstraintOp::Ge,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_MATCH => ConstraintOp::Match,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LIKE => ConstraintOp::Like,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GLOB => ConstraintOp::Glob,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_REGEXP => ConstraintOp::Regexp,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_NE => ConstraintOp::Ne,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_ISNOT => ConstraintOp::IsNot,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_ISNOTNULL => ConstraintOp::IsNotNull,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_ISNULL => ConstraintOp::IsNull,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_IS => ConstraintOp::Is,
        _ => ConstraintOp::Other,
    }
}

fn to_sql_value(value: SqliteValue) -> Value {
    match value {
        SqliteValue::Null => Value::Null,
        SqliteValue::Integer(i) => Value::Integer(i),
        SqliteValue::Float(f) => Value::Real(f),
        SqliteValue::Text(s) => Value::Text(s),
        SqliteValue::Blob(b) => Value::Blob(b),
    }
}

fn from_sql_value(value: Value) -> SqliteValue {
    match value {
        Value::Null => SqliteValue::Null,
        Value::Integer(i) => SqliteValue::Integer(i),
        Value::Real(f) => SqliteValue::Float(f),
        Value::Text(s) => SqliteValue::Text(s),
        Value::Blob(b) => SqliteValue::Blob(b),
    }
}
