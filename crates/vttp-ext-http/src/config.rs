//! Per-table options parsed from `key = value` module arguments.

use std::time::Duration;

use vttp_error::{Result, VttpError};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on the response body size (64 MiB).
pub const DEFAULT_MAX_BYTES: usize = 64 * 1024 * 1024;

/// Default `User-Agent` header.
pub const DEFAULT_USER_AGENT: &str = concat!("vttp/", env!("CARGO_PKG_VERSION"));

/// Transport settings for one table's fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// How the response body is split into records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    /// One JSON document: an array of records or a single object.
    #[default]
    Json,
    /// Newline-delimited JSON, one record per non-blank line.
    Ndjson,
}

impl PayloadFormat {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "ndjson" | "jsonl" => Ok(Self::Ndjson),
            other => Err(VttpError::config(format!(
                "unknown format '{other}' (expected json or ndjson)"
            ))),
        }
    }
}

/// Everything about a table that is not a column.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableOptions {
    /// Explicit source URL; wins over a `url` column default.
    pub url: Option<String>,
    pub format: PayloadFormat,
    /// RFC 6901 pointer to the records inside the document.
    pub records_pointer: Option<String>,
    pub fetch: FetchConfig,
}

impl TableOptions {
    /// Apply one `key = value` argument. Keys are case-insensitive.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key.to_ascii_lowercase().as_str() {
            "url" => self.url = Some(value.to_owned()),
            "format" => self.format = PayloadFormat::parse(value)?,
            "records" => {
                if !value.is_empty() && !value.starts_with('/') {
                    return Err(VttpError::config(format!(
                        "records pointer '{value}' must be empty or start with '/'"
                    )));
                }
                self.records_pointer = Some(value.to_owned());
            }
            "timeout_ms" => {
                let millis = parse_positive(key, value)?;
                self.fetch.timeout = Duration::from_millis(millis);
            }
            "max_bytes" => {
                let bytes = parse_positive(key, value)?;
                self.fetch.max_bytes = usize::try_from(bytes).map_err(|_| {
                    VttpError::config(format!("max_bytes {bytes} exceeds the address space"))
                })?;
            }
            "user_agent" => self.fetch.user_agent = value.to_owned(),
            _ => {
                return Err(VttpError::config(format!("unknown table option '{key}'")));
            }
        }
        Ok(())
    }

    /// Reject option combinations that cannot work together.
    pub fn validate(&self) -> Result<()> {
        if self.format == PayloadFormat::Ndjson && self.records_pointer.is_some() {
            return Err(VttpError::config(
                "the records option requires format = json",
            ));
        }
        Ok(())
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u64> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(VttpError::config(format!(
            "option {key} expects a positive integer, got '{value}'"
        ))),
    }
}
