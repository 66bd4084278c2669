use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use redb::{ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;

use crate::session::Session;
use crate::storage::{Snapshot, META, NEXT_TRANSACTION_ID, RELATIONS, RELATION_NAMES, ROWS};
use crate::{Result, StoreError};

/// An embedded row store with system-period versioning.
///
/// Catalog, rows and id counters live in a redb database. All reads and
/// writes go through a [`Session`]; any number of sessions may be open, but
/// only one of them can hold uncommitted writes at a time.
///
/// # Example
///
/// ```rust,no_run
/// use temporal_tables::{Attribute, DataType};
/// use temporal_tables_store::Database;
///
/// let db = Database::open("payroll.redb").unwrap();
/// let mut session = db.session();
/// session
///     .create_table(
///         "employees",
///         vec![
///             Attribute::new("name", DataType::Text),
///             Attribute::new("sys_period", DataType::tstzrange()),
///         ],
///     )
///     .unwrap();
/// ```
pub struct Database {
    db: redb::Database,
    /// Session currently holding the redb write transaction.
    writer: Mutex<Option<u64>>,
    next_session: AtomicU64,
    next_transaction: AtomicU64,
}

impl Database {
    /// Open or create a database file at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let db = redb::Database::create(path)?;
        Self::init(db)
    }

    /// Create an in-memory database. Data is lost when it is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = redb::Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: redb::Database) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(RELATIONS)?;
            write_txn.open_table(RELATION_NAMES)?;
            write_txn.open_table(ROWS)?;
            write_txn.open_table(META)?;
            write_txn.commit()?;
        }
        let next_transaction = {
            let read_txn = db.begin_read()?;
            let meta = read_txn.open_table(META)?;
            let next = meta.get(NEXT_TRANSACTION_ID)?.map(|g| g.value());
            next.unwrap_or(1)
        };
        debug!(next_transaction, "opened database");
        Ok(Self {
            db,
            writer: Mutex::new(None),
            next_session: AtomicU64::new(1),
            next_transaction: AtomicU64::new(next_transaction),
        })
    }

    /// Open a new session. Each session owns its own versioning engine.
    pub fn session(&self) -> Session<'_> {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        Session::new(self, id)
    }

    pub(crate) fn allocate_transaction_id(&self) -> u64 {
        self.next_transaction.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn read_snapshot(&self) -> Result<Snapshot<'static>> {
        Ok(Snapshot::Read(self.db.begin_read()?))
    }

    /// Begin the redb write transaction on behalf of `session`.
    ///
    /// Fails instead of blocking when another session holds uncommitted
    /// writes.
    pub(crate) fn begin_write(&self, session: u64) -> Result<WriteTransaction> {
        {
            let mut writer = self
                .writer
                .lock()
                .map_err(|_| StoreError::Transaction("writer lock poisoned".into()))?;
            match *writer {
                Some(holder) if holder != session => {
                    return Err(StoreError::Transaction(format!(
                        "could not obtain write access: session {holder} has uncommitted changes"
                    )));
                }
                _ => *writer = Some(session),
            }
        }
        match self.db.begin_write() {
            Ok(txn) => Ok(txn),
            Err(e) => {
                self.end_write(session);
                Err(e.into())
            }
        }
    }

    /// Persist the transaction id counter and commit.
    pub(crate) fn commit_write(&self, session: u64, txn: WriteTransaction) -> Result<()> {
        let result = (|| -> Result<()> {
            {
                let mut meta = txn.open_table(META)?;
                let stored = meta
                    .get(NEXT_TRANSACTION_ID)?
                    .map(|g| g.value())
                    .unwrap_or(1);
                let next = stored.max(self.next_transaction.load(Ordering::Relaxed));
                meta.insert(NEXT_TRANSACTION_ID, next)?;
            }
            txn.commit()?;
            Ok(())
        })();
        self.end_write(session);
        result
    }

    pub(crate) fn abort_write(&self, session: u64, txn: WriteTransaction) -> Result<()> {
        let result = txn.abort().map_err(StoreError::from);
        self.end_write(session);
        result
    }

    fn end_write(&self, session: u64) {
        if let Ok(mut writer) = self.writer.lock() {
            if *writer == Some(session) {
                *writer = None;
            }
        }
    }
}
