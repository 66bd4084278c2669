//! Sessions: transactions, savepoints, DDL and versioned DML.
//!
//! A session owns one [`VersioningEngine`] and at most one open
//! transaction. Statements issued outside [`Session::begin`] /
//! [`Session::commit`] run in their own implicit transaction. A failing
//! statement inside an explicit transaction puts it into the failed state:
//! everything but [`Session::rollback`] and [`Session::rollback_to_savepoint`]
//! is refused until then.
//!
//! Lifecycle events reach the engine innermost level first: releasing or
//! committing walks open savepoints from the top of the stack down before
//! the top-level event fires.

use redb::WriteTransaction;
use temporal_tables::{
    Attribute, ConcurrencyWarning, DataType, Relation, RelationId, Row, SubTransactionId,
    Timestamp, TransactionId, TriggerCall, Value, VersioningEngine,
};
use tracing::{debug, warn};

use crate::database::Database;
use crate::host::{ArchivePlan, PlanLedger, TxnHost};
use crate::storage::{
    apply_undo, resolve_name, Record, RowId, Snapshot, TableDef, UndoEntry, Writer,
    NEXT_RELATION_ID, NEXT_ROW_ID,
};
use crate::{Result, StoreError};

/// Nesting level id of every transaction's top level. Savepoints get
/// fresh ids above it.
const TOP_LEVEL: SubTransactionId = SubTransactionId(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// No explicit transaction open.
    Idle,
    InTransaction,
    /// A statement failed; only rollback is accepted.
    Failed,
}

struct Savepoint {
    name: String,
    level: SubTransactionId,
    /// Undo log length when the savepoint was established.
    undo_mark: usize,
}

struct OpenTransaction {
    xid: TransactionId,
    start: Timestamp,
    explicit: bool,
    /// Acquired on the first write.
    write: Option<WriteTransaction>,
    undo: Vec<UndoEntry>,
    savepoints: Vec<Savepoint>,
    next_level: u32,
    failed: bool,
}

impl OpenTransaction {
    fn level(&self) -> SubTransactionId {
        self.savepoints.last().map_or(TOP_LEVEL, |sp| sp.level)
    }

    fn find_savepoint(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|sp| sp.name == name)
            .ok_or_else(|| StoreError::Transaction(format!("savepoint \"{name}\" does not exist")))
    }
}

fn aborted() -> StoreError {
    StoreError::Transaction(
        "current transaction is aborted, commands ignored until end of transaction block".into(),
    )
}

/// The open explicit transaction, or an error naming `operation`.
fn explicit<'a>(
    txn: &'a mut Option<OpenTransaction>,
    operation: &str,
) -> Result<&'a mut OpenTransaction> {
    match txn {
        Some(txn) if txn.explicit => Ok(txn),
        _ => Err(StoreError::Transaction(format!(
            "{operation} can only be used in transaction blocks"
        ))),
    }
}

/// One connection to a [`Database`].
pub struct Session<'db> {
    db: &'db Database,
    id: u64,
    engine: VersioningEngine<ArchivePlan>,
    plans: PlanLedger,
    txn: Option<OpenTransaction>,
    warnings: Vec<ConcurrencyWarning>,
}

/// Borrowed pieces of a session needed to run one write statement.
struct Parts<'s> {
    engine: &'s mut VersioningEngine<ArchivePlan>,
    host: TxnHost<'s>,
    warnings: &'s mut Vec<ConcurrencyWarning>,
}

impl<'s> Parts<'s> {
    fn snapshot(&self) -> Snapshot<'s> {
        self.host.writer.snapshot()
    }

    /// Run the versioning engine for one row and return the row to write.
    fn fire(&mut self, call: TriggerCall<'_>) -> Result<Row> {
        let outcome = self.engine.handle(&mut self.host, call)?;
        if let Some(warning) = outcome.warning {
            self.warnings.push(warning);
        }
        Ok(outcome.row)
    }

    fn writer(&mut self) -> &mut Writer<'s> {
        &mut self.host.writer
    }
}

impl<'db> Session<'db> {
    pub(crate) fn new(db: &'db Database, id: u64) -> Self {
        Self {
            db,
            id,
            engine: VersioningEngine::new(),
            plans: PlanLedger::default(),
            txn: None,
            warnings: Vec::new(),
        }
    }

    // ----- Transactions -----

    pub fn status(&self) -> TransactionStatus {
        match &self.txn {
            Some(txn) if txn.explicit && txn.failed => TransactionStatus::Failed,
            Some(txn) if txn.explicit => TransactionStatus::InTransaction,
            _ => TransactionStatus::Idle,
        }
    }

    /// Id of the open transaction, if any.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.txn.as_ref().map(|txn| txn.xid)
    }

    /// Begin an explicit transaction starting now.
    pub fn begin(&mut self) -> Result<()> {
        self.begin_at(Timestamp::now())
    }

    /// Begin an explicit transaction whose start instant is `at`.
    pub fn begin_at(&mut self, at: impl Into<Timestamp>) -> Result<()> {
        if self.txn.is_some() {
            return Err(StoreError::Transaction(
                "there is already a transaction in progress".into(),
            ));
        }
        self.start_transaction(at.into(), true);
        Ok(())
    }

    /// Commit the explicit transaction. A failed transaction is rolled
    /// back instead and reported as an error.
    pub fn commit(&mut self) -> Result<()> {
        match self.status() {
            TransactionStatus::Failed => {
                self.finish_rollback()?;
                Err(StoreError::Transaction(
                    "current transaction was aborted; changes rolled back".into(),
                ))
            }
            TransactionStatus::InTransaction => self.finish_commit(),
            TransactionStatus::Idle => Err(StoreError::Transaction(
                "there is no transaction in progress".into(),
            )),
        }
    }

    pub fn rollback(&mut self) -> Result<()> {
        match self.status() {
            TransactionStatus::Idle => Err(StoreError::Transaction(
                "there is no transaction in progress".into(),
            )),
            _ => self.finish_rollback(),
        }
    }

    pub fn savepoint(&mut self, name: &str) -> Result<()> {
        let txn = explicit(&mut self.txn, "SAVEPOINT")?;
        if txn.failed {
            return Err(aborted());
        }
        txn.next_level += 1;
        let level = SubTransactionId(txn.next_level);
        txn.savepoints.push(Savepoint {
            name: name.to_string(),
            level,
            undo_mark: txn.undo.len(),
        });
        debug!(session = self.id, savepoint = name, level = level.0, "savepoint");
        Ok(())
    }

    /// Release `name` and every savepoint established after it, keeping
    /// their changes.
    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let txn = explicit(&mut self.txn, "RELEASE SAVEPOINT")?;
        if txn.failed {
            return Err(aborted());
        }
        let index = txn.find_savepoint(name)?;
        while txn.savepoints.len() > index {
            if let Some(sp) = txn.savepoints.pop() {
                let parent = txn.level();
                self.engine.on_subtransaction_commit(sp.level, parent);
            }
        }
        debug!(session = self.id, savepoint = name, "released savepoint");
        Ok(())
    }

    /// Undo everything since `name` was established. The savepoint stays
    /// in place, and a failed transaction becomes usable again.
    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let txn = explicit(&mut self.txn, "ROLLBACK TO SAVEPOINT")?;
        let index = txn.find_savepoint(name)?;
        while txn.savepoints.len() > index + 1 {
            if let Some(sp) = txn.savepoints.pop() {
                self.engine.on_subtransaction_abort(sp.level);
            }
        }

        let target = &txn.savepoints[index];
        self.engine.on_subtransaction_abort(target.level);
        let undo = txn.undo.split_off(target.undo_mark);
        if let Some(write) = &txn.write {
            if let Err(e) = apply_undo(write, undo) {
                txn.failed = true;
                return Err(e);
            }
        }

        txn.next_level += 1;
        txn.savepoints[index].level = SubTransactionId(txn.next_level);
        txn.failed = false;
        debug!(session = self.id, savepoint = name, "rolled back to savepoint");
        Ok(())
    }

    fn start_transaction(&mut self, start: Timestamp, explicit: bool) {
        let xid = TransactionId(self.db.allocate_transaction_id());
        debug!(session = self.id, xid = xid.0, %start, explicit, "begin transaction");
        self.txn = Some(OpenTransaction {
            xid,
            start,
            explicit,
            write: None,
            undo: Vec::new(),
            savepoints: Vec::new(),
            next_level: TOP_LEVEL.0,
            failed: false,
        });
    }

    fn finish_commit(&mut self) -> Result<()> {
        let Some(mut txn) = self.txn.take() else {
            return Ok(());
        };
        while let Some(sp) = txn.savepoints.pop() {
            let parent = txn.level();
            self.engine.on_subtransaction_commit(sp.level, parent);
        }
        if let Some(write) = txn.write.take() {
            if let Err(e) = self.db.commit_write(self.id, write) {
                self.engine.on_transaction_abort();
                return Err(e);
            }
        }
        self.engine.on_transaction_commit();
        debug!(session = self.id, xid = txn.xid.0, "commit");
        Ok(())
    }

    fn finish_rollback(&mut self) -> Result<()> {
        let Some(mut txn) = self.txn.take() else {
            return Ok(());
        };
        while let Some(sp) = txn.savepoints.pop() {
            self.engine.on_subtransaction_abort(sp.level);
        }
        self.engine.on_transaction_abort();
        debug!(session = self.id, xid = txn.xid.0, "rollback");
        match txn.write.take() {
            Some(write) => self.db.abort_write(self.id, write),
            None => Ok(()),
        }
    }

    /// Run `f` as one statement.
    fn statement<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        match self.txn.as_ref().map(|txn| txn.failed) {
            Some(true) => Err(aborted()),
            Some(false) => {
                let result = f(self);
                if let (Err(e), Some(txn)) = (&result, self.txn.as_mut()) {
                    debug!(session = self.id, error = %e, "statement failed; transaction aborted");
                    txn.failed = true;
                }
                result
            }
            None => {
                self.start_transaction(Timestamp::now(), false);
                match f(self) {
                    Ok(value) => {
                        self.finish_commit()?;
                        Ok(value)
                    }
                    Err(e) => {
                        if let Err(rollback) = self.finish_rollback() {
                            warn!(session = self.id, error = %rollback, "implicit rollback failed");
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    /// Split the session for a write statement, acquiring the redb write
    /// transaction on first use.
    fn parts(&mut self) -> Result<Parts<'_>> {
        let Some(txn) = self.txn.as_mut() else {
            return Err(StoreError::Transaction("no transaction in progress".into()));
        };
        if txn.write.is_none() {
            txn.write = Some(self.db.begin_write(self.id)?);
            debug!(session = self.id, xid = txn.xid.0, "acquired write transaction");
        }
        let level = txn.level();
        let write = txn
            .write
            .as_ref()
            .ok_or_else(|| StoreError::Transaction("write transaction missing".into()))?;
        Ok(Parts {
            engine: &mut self.engine,
            host: TxnHost {
                writer: Writer::new(write, &mut txn.undo),
                plans: &mut self.plans,
                xid: txn.xid,
                level,
                start: txn.start,
            },
            warnings: &mut self.warnings,
        })
    }

    fn snapshot(&self) -> Result<Snapshot<'_>> {
        match self.txn.as_ref().and_then(|txn| txn.write.as_ref()) {
            Some(write) => Ok(Snapshot::Write(write)),
            None => self.db.read_snapshot(),
        }
    }

    // ----- System time -----

    /// Override the system time used for versioning, or with `None` go back
    /// to the transaction start. Follows transaction nesting: the setting
    /// survives commit and is undone by rollback.
    pub fn set_system_time(&mut self, at: Option<Timestamp>) -> Result<()> {
        match self.txn.as_mut() {
            Some(txn) if txn.failed => Err(aborted()),
            Some(txn) => {
                self.engine.set_system_time(txn.level(), at);
                Ok(())
            }
            None => {
                self.start_transaction(Timestamp::now(), false);
                self.engine.set_system_time(TOP_LEVEL, at);
                self.finish_commit()
            }
        }
    }

    /// The instant versioning would use right now.
    pub fn system_time(&self) -> Timestamp {
        let start = self
            .txn
            .as_ref()
            .map_or_else(Timestamp::now, |txn| txn.start);
        self.engine.system_time(start)
    }

    /// Drain the adjustment warnings collected so far.
    pub fn take_warnings(&mut self) -> Vec<ConcurrencyWarning> {
        std::mem::take(&mut self.warnings)
    }

    /// Archive plans currently held by this session's relation cache.
    pub fn live_plans(&self) -> usize {
        self.plans.live()
    }

    /// Roll back any open transaction and release cached plans.
    pub fn close(mut self) -> Result<()> {
        self.finish_rollback()?;
        self.engine.shutdown(&mut self.plans)?;
        Ok(())
    }

    // ----- DDL -----

    pub fn create_table(&mut self, name: &str, columns: Vec<Attribute>) -> Result<RelationId> {
        let name = resolve_name(name)?;
        self.statement(|s| {
            let mut p = s.parts()?;
            if p.snapshot().lookup(&name)?.is_some() {
                return Err(StoreError::Schema(format!("relation \"{name}\" already exists")));
            }
            for (i, attr) in columns.iter().enumerate() {
                if columns[..i].iter().any(|other| other.name == attr.name) {
                    return Err(StoreError::Schema(format!(
                        "column \"{}\" specified more than once",
                        attr.name
                    )));
                }
            }
            let id = RelationId(p.writer().next_id(NEXT_RELATION_ID)?);
            let def = TableDef {
                relation: Relation {
                    id,
                    name: name.clone(),
                    layout: temporal_tables::TupleLayout::new(columns),
                },
                versioning: None,
            };
            p.writer().put_table_def(&def)?;
            p.writer().put_name(&name, id)?;
            debug!(relation = %name, id = id.0, "created table");
            Ok(id)
        })
    }

    /// Current catalog entry of `table`.
    pub fn table(&mut self, table: &str) -> Result<TableDef> {
        let name = resolve_name(table)?;
        self.statement(|s| s.snapshot()?.require(&name))
    }

    pub fn add_column(&mut self, table: &str, column: Attribute) -> Result<()> {
        self.alter_table(table, |def| {
            if def.relation.layout.position(&column.name).is_some() {
                return Err(StoreError::Schema(format!(
                    "column \"{}\" of relation \"{}\" already exists",
                    column.name, def.relation.name
                )));
            }
            def.relation.layout.attributes_mut().push(column);
            Ok(())
        })
    }

    /// Mark a column dropped. Its position stays taken and stored values
    /// are ignored from now on.
    pub fn drop_column(&mut self, table: &str, column: &str) -> Result<()> {
        self.alter_table(table, |def| {
            let pos = column_position(def, column)?;
            def.relation.layout.attributes_mut()[pos].dropped = true;
            Ok(())
        })
    }

    /// Change a column's type, casting every stored value.
    pub fn alter_column_type(&mut self, table: &str, column: &str, to: DataType) -> Result<()> {
        let name = resolve_name(table)?;
        self.statement(|s| {
            let mut p = s.parts()?;
            let mut def = p.snapshot().require(&name)?;
            let pos = column_position(&def, column)?;
            for (row_id, mut row) in p.snapshot().rows(def.relation.id)? {
                let value = row.get(pos);
                let cast = cast_value(value, &to).ok_or_else(|| {
                    StoreError::Schema(format!(
                        "column \"{column}\" cannot be cast automatically to type {to}: \
                         value {value} is not valid"
                    ))
                })?;
                row.set(pos, cast);
                p.writer().put_row(def.relation.id, row_id, &row)?;
            }
            let attr = &mut def.relation.layout.attributes_mut()[pos];
            attr.data_type = to;
            attr.modifier = None;
            p.writer().put_table_def(&def)?;
            debug!(relation = %name, column, "altered column type");
            Ok(())
        })
    }

    pub fn rename_table(&mut self, from: &str, to: &str) -> Result<()> {
        let from = resolve_name(from)?;
        let to = resolve_name(to)?;
        self.statement(|s| {
            let mut p = s.parts()?;
            let mut def = p.snapshot().require(&from)?;
            if p.snapshot().lookup(&to)?.is_some() {
                return Err(StoreError::Schema(format!("relation \"{to}\" already exists")));
            }
            p.writer().remove_name(&from)?;
            p.writer().put_name(&to, def.relation.id)?;
            def.relation.name = to.clone();
            p.writer().put_table_def(&def)?;
            debug!(from = %from, to = %to, "renamed table");
            Ok(())
        })
    }

    /// Install the versioning trigger on `table` with its three arguments:
    /// period column, history table, adjust flag. Arguments are validated
    /// when the trigger fires, not here.
    pub fn enable_versioning(&mut self, table: &str, args: &[Option<&str>]) -> Result<()> {
        let args: Vec<Option<String>> = args.iter().map(|a| a.map(str::to_string)).collect();
        self.alter_table(table, |def| {
            def.versioning = Some(args);
            Ok(())
        })
    }

    pub fn disable_versioning(&mut self, table: &str) -> Result<()> {
        self.alter_table(table, |def| {
            def.versioning = None;
            Ok(())
        })
    }

    fn alter_table(
        &mut self,
        table: &str,
        change: impl FnOnce(&mut TableDef) -> Result<()>,
    ) -> Result<()> {
        let name = resolve_name(table)?;
        self.statement(|s| {
            let mut p = s.parts()?;
            let mut def = p.snapshot().require(&name)?;
            change(&mut def)?;
            p.writer().put_table_def(&def)?;
            debug!(relation = %name, "altered table");
            Ok(())
        })
    }

    // ----- DML -----

    /// Insert one row. Unnamed columns are null.
    pub fn insert(&mut self, table: &str, values: &[(&str, Value)]) -> Result<RowId> {
        let name = resolve_name(table)?;
        self.statement(|s| {
            let mut p = s.parts()?;
            let def = p.snapshot().require(&name)?;
            let mut row = Row::new(
                vec![Value::Null; def.relation.layout.len()],
                p.host.xid,
            );
            assign(&def, &mut row, values)?;
            let row = match def.versioning.as_deref() {
                Some(args) => p.fire(TriggerCall::insert(&def.relation, row, args))?,
                None => row,
            };
            let id = RowId(p.writer().next_id(NEXT_ROW_ID)?);
            p.writer().put_row(def.relation.id, id, &row)?;
            Ok(id)
        })
    }

    /// Apply `changes` to every row matching `filter`. Returns the number
    /// of rows updated.
    pub fn update(
        &mut self,
        table: &str,
        filter: impl Fn(&Record) -> bool,
        changes: &[(&str, Value)],
    ) -> Result<usize> {
        let name = resolve_name(table)?;
        self.statement(|s| {
            let mut p = s.parts()?;
            let def = p.snapshot().require(&name)?;
            let targets = matching_rows(&p.snapshot(), &def, &filter)?;
            for (row_id, old) in &targets {
                let mut new = old.clone();
                new.origin = p.host.xid;
                assign(&def, &mut new, changes)?;
                let row = match def.versioning.as_deref() {
                    Some(args) => {
                        p.fire(TriggerCall::update(&def.relation, old.clone(), new, args))?
                    }
                    None => new,
                };
                p.writer().put_row(def.relation.id, *row_id, &row)?;
            }
            Ok(targets.len())
        })
    }

    /// Delete every row matching `filter`. Returns the number of rows
    /// deleted.
    pub fn delete(&mut self, table: &str, filter: impl Fn(&Record) -> bool) -> Result<usize> {
        let name = resolve_name(table)?;
        self.statement(|s| {
            let mut p = s.parts()?;
            let def = p.snapshot().require(&name)?;
            let targets = matching_rows(&p.snapshot(), &def, &filter)?;
            for (row_id, old) in &targets {
                if let Some(args) = def.versioning.as_deref() {
                    p.fire(TriggerCall::delete(&def.relation, old.clone(), args))?;
                }
                p.writer().remove_row(def.relation.id, *row_id)?;
            }
            Ok(targets.len())
        })
    }

    /// Every row of `table`, in row id order.
    pub fn scan(&mut self, table: &str) -> Result<Vec<Record>> {
        let name = resolve_name(table)?;
        self.statement(|s| {
            let snapshot = s.snapshot()?;
            let def = snapshot.require(&name)?;
            Ok(snapshot
                .rows(def.relation.id)?
                .iter()
                .map(|(id, row)| Record::from_row(&def, *id, row))
                .collect())
        })
    }

    pub fn get(&mut self, table: &str, id: RowId) -> Result<Option<Record>> {
        let name = resolve_name(table)?;
        self.statement(|s| {
            let snapshot = s.snapshot()?;
            let def = snapshot.require(&name)?;
            Ok(snapshot
                .row(def.relation.id, id)?
                .map(|row| Record::from_row(&def, id, &row)))
        })
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish_rollback() {
            warn!(session = self.id, error = %e, "rollback on session drop failed");
        }
        if let Err(e) = self.engine.shutdown(&mut self.plans) {
            warn!(session = self.id, error = %e, "releasing archive plans failed");
        }
    }
}

// ----- Helpers -----

fn column_position(def: &TableDef, column: &str) -> Result<usize> {
    def.relation.layout.position(column).ok_or_else(|| {
        StoreError::Schema(format!(
            "column \"{column}\" of relation \"{}\" does not exist",
            def.relation.name
        ))
    })
}

fn matching_rows(
    snapshot: &Snapshot<'_>,
    def: &TableDef,
    filter: &impl Fn(&Record) -> bool,
) -> Result<Vec<(RowId, Row)>> {
    Ok(snapshot
        .rows(def.relation.id)?
        .into_iter()
        .filter(|(id, row)| filter(&Record::from_row(def, *id, row)))
        .collect())
}

fn assign(def: &TableDef, row: &mut Row, values: &[(&str, Value)]) -> Result<()> {
    for (column, value) in values {
        let pos = column_position(def, column)?;
        let attr = &def.relation.layout.attributes()[pos];
        if matches!(value, Value::Double(f) if !f.is_finite()) {
            return Err(StoreError::Schema(format!(
                "column \"{column}\" cannot store non-finite value {value}"
            )));
        }
        if !value_fits(attr, value) {
            return Err(StoreError::Schema(format!(
                "column \"{column}\" is of type {} but value {value} is not",
                attr.type_display()
            )));
        }
        row.set(pos, value.clone());
    }
    Ok(())
}

fn value_fits(attr: &Attribute, value: &Value) -> bool {
    if attr.dimensions > 0 {
        return true;
    }
    match (&attr.data_type, value) {
        (_, Value::Null) => true,
        (DataType::Boolean, Value::Boolean(_)) => true,
        (DataType::Integer | DataType::BigInt, Value::Integer(_)) => true,
        (DataType::Double | DataType::Numeric, Value::Integer(_) | Value::Double(_)) => true,
        (DataType::Text | DataType::Varchar, Value::Text(_)) => true,
        (DataType::Timestamp | DataType::Timestamptz | DataType::Date, Value::Timestamp(_)) => {
            true
        }
        (DataType::Range(_), Value::Period(_)) => true,
        _ => false,
    }
}

/// Convert a stored value for `alter_column_type`. `None` when there is no
/// sensible conversion.
fn cast_value(value: &Value, to: &DataType) -> Option<Value> {
    match (value, to) {
        (Value::Null, _) => Some(Value::Null),
        (_, DataType::Text | DataType::Varchar) => Some(Value::Text(value.to_string())),
        (Value::Integer(n), DataType::Integer | DataType::BigInt) => Some(Value::Integer(*n)),
        (Value::Double(f), DataType::Integer | DataType::BigInt) => {
            let rounded = f.round();
            // 2^63 is the first double past i64::MAX.
            let in_range = rounded >= i64::MIN as f64 && rounded < i64::MAX as f64;
            in_range.then(|| Value::Integer(rounded as i64))
        }
        (Value::Boolean(b), DataType::Integer | DataType::BigInt) => {
            Some(Value::Integer(i64::from(*b)))
        }
        (Value::Text(s), DataType::Integer | DataType::BigInt) => {
            s.trim().parse().ok().map(Value::Integer)
        }
        (Value::Integer(n), DataType::Double | DataType::Numeric) => Some(Value::Double(*n as f64)),
        (Value::Double(f), DataType::Double | DataType::Numeric) => {
            f.is_finite().then_some(Value::Double(*f))
        }
        (Value::Text(s), DataType::Double | DataType::Numeric) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(Value::Double),
        (Value::Boolean(b), DataType::Boolean) => Some(Value::Boolean(*b)),
        (Value::Integer(n), DataType::Boolean) => Some(Value::Boolean(*n != 0)),
        (Value::Text(s), DataType::Boolean) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "on" | "1" => Some(Value::Boolean(true)),
            "false" | "f" | "no" | "off" | "0" => Some(Value::Boolean(false)),
            _ => None,
        },
        (Value::Timestamp(t), DataType::Timestamp | DataType::Timestamptz | DataType::Date) => {
            Some(Value::Timestamp(*t))
        }
        (Value::Text(s), DataType::Timestamp | DataType::Timestamptz | DataType::Date) => {
            s.trim().parse().ok().map(Value::Timestamp)
        }
        (Value::Period(p), DataType::Range(_)) => Some(Value::Period(*p)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(micros: i64) -> Timestamp {
        Timestamp::from_micros(micros)
    }

    fn setup(db: &Database) {
        let mut s = db.session();
        s.create_table(
            "items",
            vec![
                Attribute::new("name", DataType::Text),
                Attribute::new("qty", DataType::Integer),
            ],
        )
        .unwrap();
    }

    #[test]
    fn autocommit_statements_are_visible_to_other_sessions() {
        let db = Database::open_in_memory().unwrap();
        setup(&db);
        let mut a = db.session();
        a.insert("items", &[("name", "bolt".into()), ("qty", 3_i64.into())])
            .unwrap();

        let mut b = db.session();
        let rows = b.scan("items").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("qty"), Some(&Value::Integer(3)));
        assert_eq!(a.status(), TransactionStatus::Idle);
    }

    #[test]
    fn uncommitted_writes_are_private_until_commit() {
        let db = Database::open_in_memory().unwrap();
        setup(&db);
        let mut a = db.session();
        a.begin_at(ts(10)).unwrap();
        a.insert("items", &[("name", "nut".into())]).unwrap();
        assert_eq!(a.scan("items").unwrap().len(), 1, "own writes are visible");

        let mut b = db.session();
        assert!(b.scan("items").unwrap().is_empty());
        let err = b.insert("items", &[("name", "washer".into())]).unwrap_err();
        assert!(matches!(err, StoreError::Transaction(_)), "{err}");

        a.commit().unwrap();
        assert_eq!(b.scan("items").unwrap().len(), 1);
    }

    #[test]
    fn failed_statement_aborts_transaction_until_rollback() {
        let db = Database::open_in_memory().unwrap();
        setup(&db);
        let mut s = db.session();
        s.begin().unwrap();
        s.insert("items", &[("name", "nut".into())]).unwrap();
        assert!(s.insert("items", &[("nope", 1_i64.into())]).is_err());
        assert_eq!(s.status(), TransactionStatus::Failed);
        assert!(s.scan("items").is_err(), "statements refused while failed");

        let err = s.commit().unwrap_err();
        assert!(err.to_string().contains("rolled back"));
        assert_eq!(s.status(), TransactionStatus::Idle);
        assert!(s.scan("items").unwrap().is_empty());
    }

    #[test]
    fn rollback_to_savepoint_undoes_rows_and_catalog() {
        let db = Database::open_in_memory().unwrap();
        setup(&db);
        let mut s = db.session();
        s.begin().unwrap();
        s.insert("items", &[("name", "a".into())]).unwrap();
        s.savepoint("sp").unwrap();
        s.insert("items", &[("name", "b".into())]).unwrap();
        s.add_column("items", Attribute::new("note", DataType::Text))
            .unwrap();
        s.update("items", |_| true, &[("qty", 9_i64.into())]).unwrap();

        s.rollback_to_savepoint("sp").unwrap();
        let rows = s.scan("items").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("qty"), Some(&Value::Null));
        assert_eq!(rows[0].get("note"), None, "added column rolled back");

        // The savepoint survives and can be used again.
        s.insert("items", &[("name", "c".into())]).unwrap();
        s.rollback_to_savepoint("sp").unwrap();
        s.commit().unwrap();
        assert_eq!(s.scan("items").unwrap().len(), 1);
    }

    #[test]
    fn rollback_to_savepoint_recovers_failed_transaction() {
        let db = Database::open_in_memory().unwrap();
        setup(&db);
        let mut s = db.session();
        s.begin().unwrap();
        s.savepoint("sp").unwrap();
        assert!(s.insert("missing", &[]).is_err());
        assert_eq!(s.status(), TransactionStatus::Failed);
        s.rollback_to_savepoint("sp").unwrap();
        assert_eq!(s.status(), TransactionStatus::InTransaction);
        s.insert("items", &[("name", "ok".into())]).unwrap();
        s.commit().unwrap();
        assert_eq!(s.scan("items").unwrap().len(), 1);
    }

    #[test]
    fn savepoint_misuse_is_reported() {
        let db = Database::open_in_memory().unwrap();
        let mut s = db.session();
        assert!(s.savepoint("x").is_err(), "outside a transaction block");
        assert!(s.commit().is_err());
        assert!(s.rollback().is_err());
        s.begin().unwrap();
        assert!(s.begin().is_err());
        let err = s.release_savepoint("x").unwrap_err();
        assert!(err.to_string().contains("savepoint \"x\" does not exist"));
    }

    #[test]
    fn ddl_errors() {
        let db = Database::open_in_memory().unwrap();
        setup(&db);
        let mut s = db.session();
        assert!(matches!(
            s.create_table("items", vec![]),
            Err(StoreError::Schema(_))
        ));
        assert!(s
            .create_table(
                "dup",
                vec![
                    Attribute::new("a", DataType::Text),
                    Attribute::new("a", DataType::Text)
                ]
            )
            .is_err());
        assert!(s.drop_column("items", "missing").is_err());
        assert!(s
            .add_column("items", Attribute::new("qty", DataType::Text))
            .is_err());
        assert!(matches!(s.scan("nowhere"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn alter_column_type_casts_values() {
        let db = Database::open_in_memory().unwrap();
        setup(&db);
        let mut s = db.session();
        s.insert("items", &[("name", "a".into()), ("qty", 4_i64.into())])
            .unwrap();
        s.alter_column_type("items", "qty", DataType::Text).unwrap();
        assert_eq!(s.scan("items").unwrap()[0].get("qty"), Some(&Value::from("4")));

        s.alter_column_type("items", "qty", DataType::Double).unwrap();
        assert_eq!(s.scan("items").unwrap()[0].get("qty"), Some(&Value::Double(4.0)));

        s.insert("items", &[("name", "b".into())]).unwrap();
        s.alter_column_type("items", "name", DataType::Integer)
            .unwrap_err();
        assert_eq!(
            s.table("items").unwrap().relation.layout.attributes()[0].data_type,
            DataType::Text,
            "failed cast leaves the column untouched"
        );
    }

    #[test]
    fn drop_column_hides_values_and_keeps_positions() {
        let db = Database::open_in_memory().unwrap();
        setup(&db);
        let mut s = db.session();
        s.insert("items", &[("name", "a".into()), ("qty", 1_i64.into())])
            .unwrap();
        s.drop_column("items", "name").unwrap();
        s.add_column("items", Attribute::new("name", DataType::Integer))
            .unwrap();
        let def = s.table("items").unwrap();
        assert_eq!(def.relation.layout.len(), 3);
        assert_eq!(def.relation.layout.position("name"), Some(2));
        let rows = s.scan("items").unwrap();
        assert_eq!(rows[0].get("name"), Some(&Value::Null));
    }

    #[test]
    fn rename_table_moves_name() {
        let db = Database::open_in_memory().unwrap();
        setup(&db);
        let mut s = db.session();
        let id = s.table("items").unwrap().relation.id;
        s.rename_table("items", "stock").unwrap();
        assert!(s.table("items").is_err());
        assert_eq!(s.table("stock").unwrap().relation.id, id);
    }

    #[test]
    fn cast_rules() {
        assert_eq!(
            cast_value(&Value::Text(" 12 ".into()), &DataType::Integer),
            Some(Value::Integer(12))
        );
        assert_eq!(
            cast_value(&Value::Double(2.6), &DataType::BigInt),
            Some(Value::Integer(3))
        );
        assert_eq!(cast_value(&Value::Text("x".into()), &DataType::Double), None);
        assert_eq!(cast_value(&Value::Text("NaN".into()), &DataType::Double), None);
        assert_eq!(
            cast_value(&Value::Text("inf".into()), &DataType::Numeric),
            None
        );
        assert_eq!(cast_value(&Value::Null, &DataType::Boolean), Some(Value::Null));
        assert_eq!(
            cast_value(&Value::Integer(1), &DataType::tstzrange()),
            None
        );
    }

    #[test]
    fn non_finite_doubles_are_rejected_and_table_stays_readable() {
        let db = Database::open_in_memory().unwrap();
        let mut s = db.session();
        s.create_table("m", vec![Attribute::new("x", DataType::Double)])
            .unwrap();
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = s.insert("m", &[("x", Value::Double(bad))]).unwrap_err();
            assert!(matches!(err, StoreError::Schema(_)), "{err}");
        }
        s.insert("m", &[("x", Value::Double(1.5))]).unwrap();
        let err = s
            .update("m", |_| true, &[("x", Value::Double(f64::NAN))])
            .unwrap_err();
        assert!(matches!(err, StoreError::Schema(_)), "{err}");

        let rows = s.scan("m").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("x"), Some(&Value::Double(1.5)));
    }

    #[test]
    fn double_to_integer_cast_rejects_unrepresentable_values() {
        for f in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1e19, -1e19, 9.3e18] {
            assert_eq!(cast_value(&Value::Double(f), &DataType::Integer), None, "{f}");
        }
        assert_eq!(
            cast_value(&Value::Double(-9.2e18), &DataType::BigInt),
            Some(Value::Integer(-9_200_000_000_000_000_000))
        );
    }
}
