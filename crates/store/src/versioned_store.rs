//! temporal-tables-store — an embedded row store hosting the
//! [`temporal_tables`] versioning engine.
//!
//! The store plays every part a SQL server plays for the engine: it keeps
//! the catalog, stores rows together with the transaction that wrote them,
//! runs transactions with savepoints, dispatches BEFORE ROW events for
//! versioned tables, and executes the engine's archive inserts. Storage is
//! a single [redb](https://docs.rs/redb) database, on disk or in memory.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use temporal_tables::{Attribute, DataType, Value};
//! use temporal_tables_store::Database;
//!
//! let db = Database::open_in_memory().unwrap();
//! let mut session = db.session();
//! let columns = || {
//!     vec![
//!         Attribute::new("name", DataType::Text),
//!         Attribute::new("salary", DataType::Integer),
//!         Attribute::new("sys_period", DataType::tstzrange()),
//!     ]
//! };
//! session.create_table("employees", columns()).unwrap();
//! session.create_table("employees_history", columns()).unwrap();
//! session
//!     .enable_versioning("employees", &[Some("sys_period"), Some("employees_history"), Some("true")])
//!     .unwrap();
//!
//! session
//!     .insert("employees", &[("name", "Bernard Marx".into()), ("salary", 10_000_i64.into())])
//!     .unwrap();
//! session
//!     .update(
//!         "employees",
//!         |row| row.get("name") == Some(&Value::from("Bernard Marx")),
//!         &[("salary", 11_200_i64.into())],
//!     )
//!     .unwrap();
//! assert_eq!(session.scan("employees_history").unwrap().len(), 1);
//! ```

mod database;
mod host;
mod session;
mod storage;

pub use database::Database;
pub use host::ArchivePlan;
pub use session::{Session, TransactionStatus};
pub use storage::{normalize, resolve_name, Record, RowId, TableDef, DEFAULT_SCHEMA};

pub use temporal_tables;

use temporal_tables::VersioningError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Versioning(#[from] VersioningError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("transaction error: {0}")]
    Transaction(String),
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        StoreError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        StoreError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::Storage(e.to_string())
    }
}

impl StoreError {
    /// The engine error behind this one, if any.
    pub fn versioning(&self) -> Option<&VersioningError> {
        match self {
            StoreError::Versioning(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
