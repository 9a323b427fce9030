//! Host-independent virtual table protocol.
//!
//! [`VirtualTable`] and [`VirtualTableCursor`] carry one method per SQLite
//! virtual-table callback (xConnect, xBestIndex, xOpen, xFilter, xNext,
//! xEof, xColumn, xRowid, xUpdate). A module written against them can be
//! driven directly in tests; `vttp-sqlite` binds them to a live connection.
//!
//! Calls that may block on the network take a [`Cx`]. Per-row accessors do
//! not: they only read data the cursor already holds.
//!
//! There are no close, disconnect or destroy callbacks. Dropping the cursor
//! or table releases it.

use vttp_error::{Result, VttpError};
use vttp_types::SqliteValue;
use vttp_types::cx::Cx;

/// Operator of a WHERE-clause term offered to [`VirtualTable::best_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintOp {
    Eq,
    Gt,
    Le,
    Lt,
    Ge,
    Match,
    Like,
    Glob,
    Regexp,
    Ne,
    IsNot,
    IsNotNull,
    IsNull,
    Is,
    /// LIMIT, OFFSET and function constraints.
    Other,
}

#[derive(Debug, Clone)]
pub struct IndexConstraint {
    /// Column ordinal, `-1` for the rowid.
    pub column: i32,
    pub op: ConstraintOp,
    pub usable: bool,
}

#[derive(Debug, Clone)]
pub struct IndexOrderBy {
    pub column: i32,
    pub desc: bool,
}

/// What the module does with one offered constraint.
#[derive(Debug, Clone, Default)]
pub struct IndexConstraintUsage {
    /// 1-based position of the constraint's value in `filter` args; 0 leaves
    /// the constraint to the host.
    pub argv_index: i32,
    /// The host may skip re-checking the constraint.
    pub omit: bool,
}

/// Planner negotiation record.
///
/// The host fills `constraints` and `order_by`; the module answers through
/// the remaining fields.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub constraints: Vec<IndexConstraint>,
    pub order_by: Vec<IndexOrderBy>,
    /// Parallel to `constraints`.
    pub constraint_usage: Vec<IndexConstraintUsage>,
    pub idx_num: i32,
    pub idx_str: Option<String>,
    pub order_by_consumed: bool,
    pub estimated_cost: f64,
    pub estimated_rows: i64,
}

impl IndexInfo {
    #[must_use]
    pub fn new(constraints: Vec<IndexConstraint>, order_by: Vec<IndexOrderBy>) -> Self {
        let constraint_usage = vec![IndexConstraintUsage::default(); constraints.len()];
        Self {
            constraints,
            order_by,
            constraint_usage,
            idx_num: 0,
            idx_str: None,
            order_by_consumed: false,
            estimated_cost: 1_000_000.0,
            estimated_rows: 1_000_000,
        }
    }
}

/// Slot a cursor writes one column value into (`sqlite3_result_*`).
#[derive(Debug, Default)]
pub struct ColumnContext {
    value: Option<SqliteValue>,
}

impl ColumnContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&mut self, val: SqliteValue) {
        self.value = Some(val);
    }

    pub fn take_value(&mut self) -> Option<SqliteValue> {
        self.value.take()
    }
}

#[allow(clippy::missing_errors_doc)]
pub trait VirtualTable: Send + Sync {
    type Cursor: VirtualTableCursor;

    /// `CREATE VIRTUAL TABLE`. `args` is module name, database name, table
    /// name, then the module arguments.
    fn create(cx: &Cx, args: &[&str]) -> Result<Self>
    where
        Self: Sized,
    {
        Self::connect(cx, args)
    }

    /// Re-attach to a table declared earlier; same `args` as [`Self::create`].
    fn connect(cx: &Cx, args: &[&str]) -> Result<Self>
    where
        Self: Sized;

    /// `CREATE TABLE` text passed to `sqlite3_declare_vtab`.
    fn declaration(&self) -> String;

    fn best_index(&self, info: &mut IndexInfo) -> Result<()>;

    fn open(&self, cx: &Cx) -> Result<Self::Cursor>;

    /// INSERT, UPDATE or DELETE. Tables are read-only unless they override
    /// this.
    fn update(&mut self, _cx: &Cx, _args: &[SqliteValue]) -> Result<Option<i64>> {
        Err(VttpError::ReadOnly)
    }
}

/// One scan over a table. Used from a single thread at a time.
///
/// The host calls [`filter`](Self::filter) first, then loops on
/// [`eof`](Self::eof), reading [`column`](Self::column) and
/// [`rowid`](Self::rowid) before each [`next`](Self::next).
#[allow(clippy::missing_errors_doc)]
pub trait VirtualTableCursor: Send {
    fn filter(
        &mut self,
        cx: &Cx,
        idx_num: i32,
        idx_str: Option<&str>,
        args: &[SqliteValue],
    ) -> Result<()>;

    fn next(&mut self, cx: &Cx) -> Result<()>;

    fn eof(&self) -> bool;

    fn column(&self, ctx: &mut ColumnContext, col: i32) -> Result<()>;

    fn rowid(&self) -> Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `series(n)`: a single `value` column counting 1..=n. An `=` constraint
    /// on `value` narrows the scan to that one row.
    struct Series {
        len: i64,
    }

    struct SeriesCursor {
        len: i64,
        current: i64,
        last: i64,
    }

    impl VirtualTable for Series {
        type Cursor = SeriesCursor;

        fn connect(_cx: &Cx, args: &[&str]) -> Result<Self> {
            let len = args
                .get(3)
                .and_then(|arg| arg.trim().parse().ok())
                .ok_or_else(|| VttpError::config("series needs a length"))?;
            Ok(Self { len })
        }

        fn declaration(&self) -> String {
            "CREATE TABLE x(value INTEGER)".to_owned()
        }

        fn best_index(&self, info: &mut IndexInfo) -> Result<()> {
            let point = info
                .constraints
                .iter()
                .position(|c| c.usable && c.column == 0 && c.op == ConstraintOp::Eq);
            if let Some(i) = point {
                info.constraint_usage[i].argv_index = 1;
                info.constraint_usage[i].omit = true;
                info.idx_num = 1;
                info.estimated_rows = 1;
            } else {
                info.estimated_rows = self.len;
            }
            #[allow(clippy::cast_precision_loss)]
            let cost = info.estimated_rows as f64;
            info.estimated_cost = cost;
            Ok(())
        }

        fn open(&self, _cx: &Cx) -> Result<SeriesCursor> {
            Ok(SeriesCursor {
                len: self.len,
                current: 1,
                last: 0,
            })
        }
    }

    impl VirtualTableCursor for SeriesCursor {
        fn filter(
            &mut self,
            cx: &Cx,
            idx_num: i32,
            _idx_str: Option<&str>,
            args: &[SqliteValue],
        ) -> Result<()> {
            cx.checkpoint()?;
            (self.current, self.last) = match (idx_num, args) {
                (1, [SqliteValue::Integer(v)]) if (1..=self.len).contains(v) => (*v, *v),
                (1, _) => (1, 0),
                _ => (1, self.len),
            };
            Ok(())
        }

        fn next(&mut self, _cx: &Cx) -> Result<()> {
            self.current += 1;
            Ok(())
        }

        fn eof(&self) -> bool {
            self.current > self.last
        }

        fn column(&self, ctx: &mut ColumnContext, col: i32) -> Result<()> {
            if col != 0 {
                return Err(VttpError::ColumnOutOfRange {
                    ordinal: col,
                    count: 1,
                });
            }
            ctx.set_value(SqliteValue::Integer(self.current));
            Ok(())
        }

        fn rowid(&self) -> Result<i64> {
            Ok(self.current)
        }
    }

    fn scan(cursor: &mut SeriesCursor, cx: &Cx) -> Vec<i64> {
        let mut out = Vec::new();
        while !cursor.eof() {
            let mut ctx = ColumnContext::new();
            cursor.column(&mut ctx, 0).unwrap();
            match ctx.take_value() {
                Some(SqliteValue::Integer(v)) => out.push(v),
                other => panic!("unexpected column value {other:?}"),
            }
            cursor.next(cx).unwrap();
        }
        out
    }

    #[test]
    fn test_create_defaults_to_connect() {
        let cx = Cx::new();
        let table = Series::create(&cx, &["series", "main", "s", "4"]).unwrap();
        assert_eq!(table.len, 4);
        assert!(Series::create(&cx, &["series", "main", "s"]).is_err());
    }

    #[test]
    fn test_full_scan() {
        let cx = Cx::new();
        let table = Series::connect(&cx, &["series", "main", "s", "3"]).unwrap();
        let mut info = IndexInfo::new(vec![], vec![]);
        table.best_index(&mut info).unwrap();
        assert_eq!(info.idx_num, 0);
        assert_eq!(info.estimated_rows, 3);

        let mut cursor = table.open(&cx).unwrap();
        cursor.filter(&cx, info.idx_num, None, &[]).unwrap();
        assert_eq!(scan(&mut cursor, &cx), vec![1, 2, 3]);
    }

    #[test]
    fn test_point_lookup_consumes_constraint() {
        let cx = Cx::new();
        let table = Series::connect(&cx, &["series", "main", "s", "10"]).unwrap();
        let mut info = IndexInfo::new(
            vec![
                IndexConstraint {
                    column: 0,
                    op: ConstraintOp::Gt,
                    usable: true,
                },
                IndexConstraint {
                    column: 0,
                    op: ConstraintOp::Eq,
                    usable: true,
                },
            ],
            vec![IndexOrderBy {
                column: 0,
                desc: false,
            }],
        );
        table.best_index(&mut info).unwrap();
        assert_eq!(info.idx_num, 1);
        assert_eq!(info.constraint_usage[0].argv_index, 0);
        assert_eq!(info.constraint_usage[1].argv_index, 1);
        assert!(info.constraint_usage[1].omit);
        assert!(!info.order_by_consumed);

        let mut cursor = table.open(&cx).unwrap();
        cursor
            .filter(&cx, 1, None, &[SqliteValue::Integer(7)])
            .unwrap();
        assert_eq!(scan(&mut cursor, &cx), vec![7]);
        cursor
            .filter(&cx, 1, None, &[SqliteValue::Integer(11)])
            .unwrap();
        assert!(cursor.eof());
    }

    #[test]
    fn test_column_out_of_range() {
        let cx = Cx::new();
        let table = Series::connect(&cx, &["series", "main", "s", "1"]).unwrap();
        let mut cursor = table.open(&cx).unwrap();
        cursor.filter(&cx, 0, None, &[]).unwrap();
        let err = cursor.column(&mut ColumnContext::new(), 1).unwrap_err();
        assert!(matches!(err, VttpError::ColumnOutOfRange { ordinal: 1, .. }));
    }

    #[test]
    fn test_update_is_read_only_by_default() {
        let cx = Cx::new();
        let mut table = Series::connect(&cx, &["series", "main", "s", "1"]).unwrap();
        let err = table.update(&cx, &[SqliteValue::Null]).unwrap_err();
        assert!(matches!(err, VttpError::ReadOnly));
    }

    #[test]
    fn test_cancelled_filter_is_interrupted() {
        let cx = Cx::new();
        let table = Series::connect(&cx, &["series", "main", "s", "2"]).unwrap();
        let mut cursor = table.open(&cx).unwrap();
        cx.cancel();
        let err = cursor.filter(&cx, 0, None, &[]).unwrap_err();
        assert!(matches!(err, VttpError::Interrupted));
    }

    #[test]
    fn test_column_context_take_clears() {
        let mut ctx = ColumnContext::new();
        assert!(ctx.take_value().is_none());
        ctx.set_value(SqliteValue::Integer(42));
        assert_eq!(ctx.take_value(), Some(SqliteValue::Integer(42)));
        assert!(ctx.take_value().is_none());
    }
}
