use thiserror::Error;

/// Primary error type for the vttp virtual table extension.
///
/// Every variant is reported to the host through its standard virtual-table
/// error channel: a result code from [`VttpError::error_code`] plus the
/// `Display` text as the human-readable message.
#[derive(Error, Debug)]
pub enum VttpError {
    // === Declaration Errors ===
    /// The `CREATE VIRTUAL TABLE` arguments could not be turned into a schema.
    #[error("vttp: {detail}")]
    Configuration { detail: String },

    // === Data Source Errors ===
    /// The remote resource could not be retrieved.
    #[error("vttp: {0}")]
    Fetch(#[from] FetchError),

    /// The remote payload is not valid JSON or not array/object shaped.
    #[error("vttp: invalid json payload: {detail}")]
    Decode { detail: String },

    // === Protocol Errors ===
    /// The host asked for a column ordinal the table never declared.
    #[error("vttp: column index {ordinal} out of range (table has {count} columns)")]
    ColumnOutOfRange { ordinal: i32, count: usize },

    /// A callback was invoked out of protocol order.
    #[error("vttp: library routine called out of sequence: {0}")]
    Misuse(String),

    /// Attempt to write through a read-only virtual table.
    #[error("vttp: table is read-only")]
    ReadOnly,

    /// The operation was cancelled through its capability context.
    #[error("vttp: interrupted")]
    Interrupted,

    // === Internal Errors ===
    /// A broken invariant inside the extension.
    #[error("vttp: internal error: {0}")]
    Internal(String),
}

/// Transport-level failure while retrieving a remote resource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Connection, DNS, or TLS failure.
    #[error("unable to reach {url}: {detail}")]
    Unreachable { url: String, detail: String },

    /// The server answered with a non-2xx status.
    #[error("{url} responded with HTTP status {status}")]
    HttpStatus { url: String, status: u16 },

    /// The request did not complete within its deadline.
    #[error("request to {url} timed out")]
    Timeout { url: String },

    /// The response body exceeded the configured size limit.
    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
}

impl FetchError {
    /// The URL the failed request was addressed to.
    pub fn url(&self) -> &str {
        match self {
            Self::Unreachable { url, .. }
            | Self::HttpStatus { url, .. }
            | Self::Timeout { url }
            | Self::TooLarge { url, .. } => url,
        }
    }
}

/// SQLite primary result codes (`sqlite3.h` values) a [`VttpError`] maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Error = 1,
    Internal = 2,
    ReadOnly = 8,
    Interrupt = 9,
    Misuse = 21,
    Range = 25,
}

impl VttpError {
    /// Result code reported to the host alongside the message.
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Configuration { .. } | Self::Fetch(_) | Self::Decode { .. } => ErrorCode::Error,
            Self::ColumnOutOfRange { .. } => ErrorCode::Range,
            Self::Misuse(_) => ErrorCode::Misuse,
            Self::ReadOnly => ErrorCode::ReadOnly,
            Self::Interrupted => ErrorCode::Interrupt,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether a later scan against the same table could plausibly succeed.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Fetch(FetchError::Timeout { .. } | FetchError::Unreachable { .. }) => true,
            Self::Fetch(FetchError::HttpStatus { status, .. }) => *status >= 500,
            _ => false,
        }
    }

    /// What a user can change in the table declaration to avoid this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Configuration { .. } => Some(
                "Declare a `url text default '<endpoint>'` column or pass `url = '<endpoint>'`",
            ),
            Self::Fetch(FetchError::Timeout { .. }) => {
                Some("Raise the table's `timeout_ms` option or retry later")
            }
            Self::Fetch(FetchError::TooLarge { .. }) => {
                Some("Raise the table's `max_bytes` option")
            }
            Self::Decode { .. } => {
                Some("Check that the endpoint returns a JSON array or object (or use format = ndjson)")
            }
            Self::ReadOnly => Some("vttp tables only support SELECT"),
            _ => None,
        }
    }

    /// Create a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Configuration {
            detail: detail.into(),
        }
    }

    /// Create a decode error.
    pub fn decode(detail: impl Into<String>) -> Self {
        Self::Decode {
            detail: detail.into(),
        }
    }

    pub fn misuse(msg: impl Into<String>) -> Self {
        Self::Misuse(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using `VttpError`.
pub type Result<T> = std::result::Result<T, VttpError>;
