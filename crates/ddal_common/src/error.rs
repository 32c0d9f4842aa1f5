use thiserror::Error;

/// Convenience alias for `Result<T, DdalError>`.
pub type DdalResult<T> = Result<T, DdalError>;

/// Error classification for caller-side retry decisions.
///
/// - `UserError`   — malformed row, unroutable key, unknown table (never retried)
/// - `Transient`   — shard failure, timeout, cancellation; caller MAY retry
/// - `InternalBug` — should never happen; pool thread panic, lost completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Transient,
    InternalBug,
}

/// Top-level error type of the execution layer.
#[derive(Error, Debug)]
pub enum DdalError {
    /// A value of a logical row failed to convert to its column's type.
    /// `row` is 1-based; `sql` is the source text of that row's value list.
    #[error("{source} [row {row}: {sql}]")]
    RowConversion {
        row: usize,
        sql: String,
        #[source]
        source: ConversionError,
    },

    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// A shard-bound worker's remote call failed.
    #[error("Remote execution failed on shard {shard}: {source} (sql: {sql})")]
    RemoteExecution {
        shard: String,
        sql: String,
        #[source]
        source: ShardError,
    },

    /// The dispatcher's deadline elapsed with workers still outstanding.
    #[error("Statement timeout after {timeout_ms}ms: {pending} worker(s) pending on [{}]", .shards.join(", "))]
    Timeout {
        timeout_ms: u64,
        pending: usize,
        shards: Vec<String>,
    },

    #[error("Statement cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Internal bug — should never occur in production.
    #[error("InternalBug [{error_code}]: {message} | context: {debug_context}")]
    InternalBug {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

/// Value conversion failures raised while building logical rows.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("Type mismatch for column {column}: expected {expected}, got {got}")]
    TypeMismatch {
        column: String,
        expected: String,
        got: String,
    },

    #[error("NULL not allowed for column {0}")]
    NullNotAllowed(String),

    #[error("Numeric value out of range for column {column}: {value}")]
    Overflow { column: String, value: String },

    #[error("Invalid {target} literal for column {column}: '{value}'")]
    InvalidLiteral {
        column: String,
        target: String,
        value: String,
    },

    #[error("Parameter ?{0} not bound")]
    ParameterMissing(usize),

    #[error("Column count mismatch: expected {expected} value(s), got {got}")]
    ColumnCountMismatch { expected: usize, got: usize },
}

/// Sharding rule violations. These are data errors and are never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    #[error("No sharding rule for table {0}")]
    NoRule(String),

    #[error("Table {table}: shard key column {column} has no value in row {row}")]
    MissingShardKey {
        table: String,
        column: String,
        row: String,
    },

    #[error("Table {table}: rule has no physical nodes")]
    NoNodes { table: String },

    #[error("Table {table}: sharding column {column} cannot be updated")]
    ShardKeyUpdate { table: String, column: String },
}

/// Catalog lookups that failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetadataError {
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },
}

/// Failures reported by a shard connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShardError {
    #[error("Connection to shard {0} refused")]
    ConnectionRefused(String),

    #[error("Table {table} does not exist on shard {shard}")]
    TableMissing { shard: String, table: String },

    #[error("Remote call failed: {0}")]
    Remote(String),

    #[error("Remote call cancelled")]
    Cancelled,

    #[error("Worker panicked: {0}")]
    Panicked(String),
}

// ── DdalError classification & helpers ──────────────────────────────────────

impl DdalError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DdalError::RowConversion { .. }
            | DdalError::Conversion(_)
            | DdalError::Routing(_)
            | DdalError::Metadata(_)
            | DdalError::Config(_) => ErrorKind::UserError,

            DdalError::RemoteExecution {
                source: ShardError::Panicked(_),
                ..
            } => ErrorKind::InternalBug,
            DdalError::RemoteExecution { .. } | DdalError::Timeout { .. } | DdalError::Cancelled => {
                ErrorKind::Transient
            }

            DdalError::Internal(_) | DdalError::InternalBug { .. } => ErrorKind::InternalBug,
        }
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Timeouts propagate as remote failures but stay distinguishable.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DdalError::Timeout { .. })
    }

    /// True for remote-execution failures, timeouts included.
    pub fn is_remote(&self) -> bool {
        matches!(self, DdalError::RemoteExecution { .. } | DdalError::Timeout { .. })
    }

    /// 1-based row number this error is attributed to, if any.
    pub fn row_number(&self) -> Option<usize> {
        match self {
            DdalError::RowConversion { row, .. } => Some(*row),
            _ => None,
        }
    }

    /// Attach row attribution to a conversion failure.
    ///
    /// Errors that already carry a row, and errors that are not conversion
    /// failures, are returned unchanged.
    pub fn with_row(self, row: usize, sql: impl Into<String>) -> Self {
        match self {
            DdalError::Conversion(source) => DdalError::RowConversion {
                row,
                sql: sql.into(),
                source,
            },
            other => other,
        }
    }

    /// Wrap a shard failure as this layer's remote-execution error.
    pub fn remote(shard: impl Into<String>, sql: impl Into<String>, source: ShardError) -> Self {
        DdalError::RemoteExecution {
            shard: shard.into(),
            sql: sql.into(),
            source,
        }
    }

    /// The shard-level cause behind a remote failure, if any.
    pub fn root_cause(&self) -> Option<&ShardError> {
        match self {
            DdalError::RemoteExecution { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Create an `InternalBug` error with a unique error code and debug context.
    pub fn internal_bug(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        DdalError::InternalBug {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
