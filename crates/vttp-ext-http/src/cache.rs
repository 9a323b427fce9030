//! Fetch-once record storage shared by every cursor of a table.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};
use vttp_error::{Result, VttpError};
use vttp_types::cx::Cx;

use crate::config::{PayloadFormat, TableOptions};
use crate::fetch::ResourceFetcher;

/// Decoded records in fetch order. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    records: Vec<Value>,
}

impl RecordSet {
    #[must_use]
    pub fn new(records: Vec<Value>) -> Self {
        Self { records }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.records.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.records.iter()
    }

    /// Decode a response body.
    ///
    /// JSON payloads yield one record per element of a top-level array, or a
    /// single record for a top-level object. NDJSON payloads yield one record
    /// per non-blank line.
    pub fn decode(bytes: &[u8], format: PayloadFormat, pointer: Option<&str>) -> Result<Self> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        match format {
            PayloadFormat::Json => decode_document(bytes, pointer),
            PayloadFormat::Ndjson => decode_lines(bytes),
        }
    }
}

fn decode_document(bytes: &[u8], pointer: Option<&str>) -> Result<RecordSet> {
    let mut root: Value =
        serde_json::from_slice(bytes).map_err(|err| VttpError::decode(err.to_string()))?;
    let selected = match pointer {
        Some(pointer) => root
            .pointer_mut(pointer)
            .map(Value::take)
            .ok_or_else(|| VttpError::decode(format!("records pointer {pointer} not found")))?,
        None => root,
    };
    match selected {
        Value::Array(records) => Ok(RecordSet::new(records)),
        object @ Value::Object(_) => Ok(RecordSet::new(vec![object])),
        other => Err(VttpError::decode(format!(
            "top-level {} is not an array or object",
            kind(&other)
        ))),
    }
}

fn decode_lines(bytes: &[u8]) -> Result<RecordSet> {
    let text = std::str::from_utf8(bytes).map_err(|err| VttpError::decode(err.to_string()))?;
    let records = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|err| VttpError::decode(format!("line {}: {err}", i + 1)))
        })
        .collect::<Result<Vec<Value>>>()?;
    Ok(RecordSet::new(records))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Lazily populated [`RecordSet`] for one table.
///
/// The first [`get_or_fetch`](Self::get_or_fetch) fetches and decodes; every
/// later call returns the same `Arc`. A failed population stores nothing, so
/// the next scan tries again.
#[derive(Debug)]
pub struct RecordCache {
    source: String,
    options: TableOptions,
    records: OnceLock<Arc<RecordSet>>,
    populate_gate: Mutex<()>,
}

impl RecordCache {
    #[must_use]
    pub fn new(source: impl Into<String>, options: TableOptions) -> Self {
        Self {
            source: source.into(),
            options,
            records: OnceLock::new(),
            populate_gate: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The record set, if a fetch has already succeeded.
    #[must_use]
    pub fn cached(&self) -> Option<Arc<RecordSet>> {
        self.records.get().cloned()
    }

    /// Return the cached records, fetching them first if necessary.
    pub fn get_or_fetch(&self, cx: &Cx, fetcher: &dyn ResourceFetcher) -> Result<Arc<RecordSet>> {
        if let Some(records) = self.records.get() {
            return Ok(Arc::clone(records));
        }

        let _gate = self.populate_gate.lock();
        // Another cursor may have populated while we waited.
        if let Some(records) = self.records.get() {
            return Ok(Arc::clone(records));
        }

        let started = Instant::now();
        let records = fetcher
            .fetch(cx, &self.source, &self.options.fetch)
            .and_then(|body| {
                debug!(url = %self.source, bytes = body.len(), "decoding payload");
                RecordSet::decode(
                    &body,
                    self.options.format,
                    self.options.records_pointer.as_deref(),
                )
            })
            .inspect_err(|err| {
                warn!(
                    url = %self.source,
                    error = %err,
                    retryable = err.is_transient(),
                    "record cache population failed"
                );
            })?;

        let records = Arc::new(records);
        info!(
            url = %self.source,
            records = records.len(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "record cache populated"
        );
        // The gate is held, so the cell is still empty.
        let _ = self.records.set(Arc::clone(&records));
        Ok(records)
    }
}
