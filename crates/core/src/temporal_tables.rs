//! temporal-tables — system-period versioning for row stores.
//!
//! A versioned table carries a *system period* column: a `[lower, upper)`
//! interval of instants during which a row version was the live one. The
//! [`VersioningEngine`] is called once per affected row, before the mutation
//! is applied, and:
//!
//! - on **insert** stamps the new row with `[now, )`;
//! - on **update** archives the superseded version into the history table
//!   with `[lower, now)` and restamps the new version with `[now, )`;
//! - on **delete** archives the removed version with `[lower, now)`.
//!
//! "now" is the effective system time of the current transaction: the
//! transaction start instant, unless overridden with
//! [`VersioningEngine::set_system_time`]. Overrides follow transaction
//! nesting: they survive a commit and are discarded by an abort.
//!
//! The engine owns no storage. The host supplies table metadata, the
//! transaction state, and a statement backend through the traits in
//! [`catalog`].
//!
//! # Quick start
//!
//! ```rust,ignore
//! use temporal_tables::{TriggerCall, TriggerEvent, TriggerOperation, VersioningEngine};
//!
//! let mut engine = VersioningEngine::new();
//! let args = vec![
//!     Some("sys_period".to_string()),
//!     Some("employees_history".to_string()),
//!     Some("true".to_string()),
//! ];
//! let call = TriggerCall::insert(&relation, new_row, &args);
//! let outcome = engine.handle(&mut host, call)?;
//! // write `outcome.row` to the table
//! ```

pub mod catalog;
pub mod period;
pub mod relation_cache;
pub mod time_context;
pub mod time_util;
pub mod versioning;

pub use catalog::{
    Attribute, Catalog, DataType, InsertStatement, QualifiedName, Relation, RelationId, Row,
    StatementBackend, SubTransactionId, TransactionId, TransactionState, TupleLayout, Value,
};
pub use period::{Period, Timestamp};
pub use relation_cache::{CacheEntry, CacheState, RelationCache, SharedColumn};
pub use time_context::{SystemTimeMode, TemporalContext, TimeContextStack};
pub use time_util::{next_float_instant, next_instant};
pub use versioning::{
    ConcurrencyWarning, TriggerCall, TriggerEvent, TriggerLevel, TriggerOperation,
    TriggerOutcome, TriggerTiming, VersioningConfig, VersioningEngine,
};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failures raised while versioning a row.
///
/// None of these leave partial state behind: every check runs before the
/// single archive write, and the host rolls the triggering statement back
/// when a call fails.
#[derive(Debug, thiserror::Error)]
pub enum VersioningError {
    /// Bad trigger arguments or a missing / wrong-shaped period column.
    #[error("configuration error: {message}")]
    Configuration { code: &'static str, message: String },
    /// The main and history tables disagree on a shared column.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    /// Malformed period on an existing row, or an unresolved write-order
    /// inversion with adjustment disabled.
    #[error("data error: {message}")]
    Data { code: &'static str, message: String },
    /// The catalog or statement backend reported a failure.
    #[error("execution error: {0}")]
    Execution(String),
}

impl VersioningError {
    pub(crate) fn invalid_parameter(message: impl Into<String>) -> Self {
        VersioningError::Configuration {
            code: sqlstate::INVALID_PARAMETER_VALUE,
            message: message.into(),
        }
    }

    pub(crate) fn undefined_column(message: impl Into<String>) -> Self {
        VersioningError::Configuration {
            code: sqlstate::UNDEFINED_COLUMN,
            message: message.into(),
        }
    }

    pub(crate) fn datatype_mismatch(message: impl Into<String>) -> Self {
        VersioningError::Configuration {
            code: sqlstate::DATATYPE_MISMATCH,
            message: message.into(),
        }
    }

    /// The SQLSTATE a SQL host should report for this error.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            VersioningError::Configuration { code, .. } | VersioningError::Data { code, .. } => code,
            VersioningError::SchemaMismatch(_) => sqlstate::DATATYPE_MISMATCH,
            VersioningError::Execution(_) => sqlstate::INTERNAL_ERROR,
        }
    }
}

/// SQLSTATE codes used by the engine.
pub mod sqlstate {
    pub const INVALID_PARAMETER_VALUE: &str = "22023";
    pub const UNDEFINED_COLUMN: &str = "42703";
    pub const DATATYPE_MISMATCH: &str = "42804";
    pub const DATA_EXCEPTION: &str = "22000";
    pub const NULL_VALUE_NOT_ALLOWED: &str = "22004";
    pub const DATETIME_FIELD_OVERFLOW: &str = "22008";
    pub const INTERNAL_ERROR: &str = "XX000";
    /// Warning class: the system period of a row was adjusted.
    pub const SYSTEM_PERIOD_ADJUSTED: &str = "01X01";
}

pub type Result<T> = std::result::Result<T, VersioningError>;
