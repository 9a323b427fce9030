//! The `vttp` virtual table and its scan cursor.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use vttp_error::{Result, VttpError};
use vttp_types::SqliteValue;
use vttp_types::cx::Cx;
use vttp_vtab::{ColumnContext, IndexConstraintUsage, IndexInfo, VirtualTable, VirtualTableCursor};

use crate::cache::{RecordCache, RecordSet};
use crate::coerce::coerce;
use crate::config::TableOptions;
use crate::fetch::{HttpFetcher, ResourceFetcher};
use crate::schema::TableSchema;

/// Row estimate reported to the planner before the first fetch.
pub const UNFETCHED_ROW_ESTIMATE: i64 = 1000;

/// A table whose rows are the records of a remote JSON resource.
///
/// Connecting parses the declaration only; the resource is fetched by the
/// first [`open`](VirtualTable::open) and shared by every later cursor.
#[derive(Debug)]
pub struct HttpJsonTable {
    schema: Arc<TableSchema>,
    cache: Arc<RecordCache>,
    fetcher: Arc<dyn ResourceFetcher>,
}

impl HttpJsonTable {
    /// Build a table from host arguments using the given fetcher and option
    /// defaults.
    pub fn with_fetcher(
        args: &[&str],
        fetcher: Arc<dyn ResourceFetcher>,
        defaults: &TableOptions,
    ) -> Result<Self> {
        let schema = TableSchema::parse_with_defaults(args, defaults)?;
        let cache = RecordCache::new(schema.source(), schema.options().clone());
        Ok(Self {
            schema: Arc::new(schema),
            cache: Arc::new(cache),
            fetcher,
        })
    }

    #[must_use]
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    #[must_use]
    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }
}

impl VirtualTable for HttpJsonTable {
    type Cursor = HttpJsonCursor;

    fn connect(_cx: &Cx, args: &[&str]) -> Result<Self> {
        let fetcher: Arc<dyn ResourceFetcher> = Arc::new(HttpFetcher::new()?);
        Self::with_fetcher(args, fetcher, &TableOptions::default())
    }

    fn declaration(&self) -> String {
        self.schema.declare_sql()
    }

    fn best_index(&self, info: &mut IndexInfo) -> Result<()> {
        // Always a full scan; the host evaluates every constraint itself.
        info.constraint_usage.fill(IndexConstraintUsage::default());
        info.idx_num = 0;
        info.idx_str = None;
        info.order_by_consumed = false;
        let rows = self.cache.cached().map_or(UNFETCHED_ROW_ESTIMATE, |records| {
            i64::try_from(records.len()).unwrap_or(i64::MAX)
        });
        #[allow(clippy::cast_precision_loss)]
        let cost = rows.max(1) as f64;
        info.estimated_rows = rows;
        info.estimated_cost = cost;
        Ok(())
    }

    fn open(&self, cx: &Cx) -> Result<HttpJsonCursor> {
        let records = self.cache.get_or_fetch(cx, self.fetcher.as_ref())?;
        debug!(
            table = self.schema.table_name(),
            records = records.len(),
            "vttp: opened cursor"
        );
        Ok(HttpJsonCursor {
            schema: Arc::clone(&self.schema),
            records,
            phase: CursorPhase::Unopened,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorPhase {
    /// Opened but not yet filtered.
    Unopened,
    /// At record `i`; exhausted once `i >= len`.
    Positioned(usize),
}

/// Scan over one table's cached records. Rowid is the record index.
#[derive(Debug)]
pub struct HttpJsonCursor {
    schema: Arc<TableSchema>,
    records: Arc<RecordSet>,
    phase: CursorPhase,
}

impl HttpJsonCursor {
    fn current(&self) -> Result<(usize, &Value)> {
        match self.phase {
            CursorPhase::Unopened => Err(VttpError::misuse("cursor read before filter")),
            CursorPhase::Positioned(i) => self
                .records
                .get(i)
                .map(|record| (i, record))
                .ok_or_else(|| VttpError::misuse("cursor read past end of scan")),
        }
    }
}

impl VirtualTableCursor for HttpJsonCursor {
    fn filter(
        &mut self,
        _cx: &Cx,
        _idx_num: i32,
        _idx_str: Option<&str>,
        _args: &[SqliteValue],
    ) -> Result<()> {
        self.phase = CursorPhase::Positioned(0);
        Ok(())
    }

    fn next(&mut self, _cx: &Cx) -> Result<()> {
        if let CursorPhase::Positioned(i) = self.phase
            && i < self.records.len()
        {
            self.phase = CursorPhase::Positioned(i + 1);
        }
        Ok(())
    }

    fn eof(&self) -> bool {
        match self.phase {
            CursorPhase::Unopened => true,
            CursorPhase::Positioned(i) => i >= self.records.len(),
        }
    }

    fn column(&self, ctx: &mut ColumnContext, col: i32) -> Result<()> {
        let out_of_range = || VttpError::ColumnOutOfRange {
            ordinal: col,
            count: self.schema.column_count(),
        };
        let ordinal = usize::try_from(col).map_err(|_| out_of_range())?;
        let spec = self.schema.column(ordinal).ok_or_else(out_of_range)?;
        let (_, record) = self.current()?;

        let value = if self.schema.source_ordinal() == Some(ordinal) {
            SqliteValue::Text(self.schema.source().to_owned())
        } else {
            coerce(spec.affinity, spec.resolve(record), spec.default.as_ref())
        };
        ctx.set_value(value);
        Ok(())
    }

    fn rowid(&self) -> Result<i64> {
        let (i, _) = self.current()?;
        i64::try_from(i).map_err(|_| VttpError::internal("record index exceeds rowid range"))
    }
}
