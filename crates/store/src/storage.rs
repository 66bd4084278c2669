//! On-disk layout and the undo-logged write path.
//!
//! Four redb tables hold everything:
//!
//! - `relations`: relation id → JSON [`TableDef`] (name, layout, versioning
//!   trigger arguments);
//! - `relation_names`: quoted qualified name → relation id;
//! - `rows`: `(relation id, row id)` → JSON [`Row`] (values plus origin);
//! - `meta`: id counters.
//!
//! Every catalog and row write made inside a session transaction goes
//! through a [`Writer`], which records the previous value of the key in the
//! transaction's undo log. Savepoint rollback replays that log backwards.
//! Counter bumps are not logged: a rolled-back id is simply never reused.

use redb::{ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use temporal_tables::{QualifiedName, Relation, RelationId, Row, Value};

use crate::{Result, StoreError};

pub(crate) const RELATIONS: TableDefinition<u64, &str> = TableDefinition::new("relations");
pub(crate) const RELATION_NAMES: TableDefinition<&str, u64> =
    TableDefinition::new("relation_names");
pub(crate) const ROWS: TableDefinition<(u64, u64), &str> = TableDefinition::new("rows");
pub(crate) const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub(crate) const NEXT_RELATION_ID: &str = "next_relation_id";
pub(crate) const NEXT_ROW_ID: &str = "next_row_id";
pub(crate) const NEXT_TRANSACTION_ID: &str = "next_transaction_id";

/// Schema assumed for unqualified names.
pub const DEFAULT_SCHEMA: &str = "public";

/// Identity of a stored row within its table. Stable across updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Catalog entry for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub relation: Relation,
    /// The versioning trigger's argument triple, when enabled.
    pub versioning: Option<Vec<Option<String>>>,
}

/// A row as returned to callers: live columns by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: RowId,
    pub columns: Vec<(String, Value)>,
}

impl Record {
    pub(crate) fn from_row(def: &TableDef, id: RowId, row: &Row) -> Self {
        let columns = def
            .relation
            .layout
            .attributes()
            .iter()
            .enumerate()
            .filter(|(_, attr)| !attr.dropped)
            .map(|(pos, attr)| (attr.name.clone(), row.get(pos).clone()))
            .collect();
        Self { id, columns }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// Fill in [`DEFAULT_SCHEMA`] for unqualified names.
pub fn normalize(name: &QualifiedName) -> QualifiedName {
    QualifiedName {
        schema: Some(name.schema.clone().unwrap_or_else(|| DEFAULT_SCHEMA.to_string())),
        name: name.name.clone(),
    }
}

/// Parse and normalize a user-supplied table name.
pub fn resolve_name(input: &str) -> Result<QualifiedName> {
    QualifiedName::parse(input)
        .map(|name| normalize(&name))
        .ok_or_else(|| StoreError::Schema(format!("invalid relation name \"{input}\"")))
}

fn name_key(name: &QualifiedName) -> String {
    normalize(name).quoted()
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

fn read_table_def(
    table: &impl ReadableTable<u64, &'static str>,
    id: RelationId,
) -> Result<Option<TableDef>> {
    match table.get(id.0)? {
        Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
        None => Ok(None),
    }
}

fn read_name(
    table: &impl ReadableTable<&'static str, u64>,
    name: &QualifiedName,
) -> Result<Option<RelationId>> {
    let key = name_key(name);
    Ok(table.get(key.as_str())?.map(|guard| RelationId(guard.value())))
}

fn read_rows(
    table: &impl ReadableTable<(u64, u64), &'static str>,
    relation: RelationId,
) -> Result<Vec<(RowId, Row)>> {
    let mut rows = Vec::new();
    for entry in table.range((relation.0, 0)..=(relation.0, u64::MAX))? {
        let (key, value) = entry?;
        let (_, row_id) = key.value();
        rows.push((RowId(row_id), serde_json::from_str(value.value())?));
    }
    Ok(rows)
}

fn read_row(
    table: &impl ReadableTable<(u64, u64), &'static str>,
    relation: RelationId,
    row: RowId,
) -> Result<Option<Row>> {
    match table.get((relation.0, row.0))? {
        Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
        None => Ok(None),
    }
}

/// A consistent view: the session's open write transaction (seeing its own
/// uncommitted writes) or a fresh read snapshot of committed state.
pub(crate) enum Snapshot<'a> {
    Write(&'a WriteTransaction),
    Read(ReadTransaction),
}

impl Snapshot<'_> {
    pub fn table_def(&self, id: RelationId) -> Result<Option<TableDef>> {
        match self {
            Snapshot::Write(txn) => read_table_def(&txn.open_table(RELATIONS)?, id),
            Snapshot::Read(txn) => read_table_def(&txn.open_table(RELATIONS)?, id),
        }
    }

    pub fn lookup(&self, name: &QualifiedName) -> Result<Option<TableDef>> {
        let id = match self {
            Snapshot::Write(txn) => read_name(&txn.open_table(RELATION_NAMES)?, name)?,
            Snapshot::Read(txn) => read_name(&txn.open_table(RELATION_NAMES)?, name)?,
        };
        match id {
            Some(id) => self.table_def(id),
            None => Ok(None),
        }
    }

    /// Like [`Snapshot::lookup`], but a missing table is an error.
    pub fn require(&self, name: &QualifiedName) -> Result<TableDef> {
        self.lookup(name)?
            .ok_or_else(|| StoreError::NotFound(format!("relation \"{name}\"")))
    }

    pub fn rows(&self, relation: RelationId) -> Result<Vec<(RowId, Row)>> {
        match self {
            Snapshot::Write(txn) => read_rows(&txn.open_table(ROWS)?, relation),
            Snapshot::Read(txn) => read_rows(&txn.open_table(ROWS)?, relation),
        }
    }

    pub fn row(&self, relation: RelationId, row: RowId) -> Result<Option<Row>> {
        match self {
            Snapshot::Write(txn) => read_row(&txn.open_table(ROWS)?, relation, row),
            Snapshot::Read(txn) => read_row(&txn.open_table(ROWS)?, relation, row),
        }
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Previous state of one key, restored on rollback.
#[derive(Debug)]
pub(crate) enum UndoEntry {
    Row {
        key: (u64, u64),
        before: Option<String>,
    },
    Relation {
        id: u64,
        before: Option<String>,
    },
    Name {
        key: String,
        before: Option<u64>,
    },
}

/// Undo-logged writes inside one redb write transaction.
pub(crate) struct Writer<'t> {
    txn: &'t WriteTransaction,
    undo: &'t mut Vec<UndoEntry>,
}

impl<'t> Writer<'t> {
    pub fn new(txn: &'t WriteTransaction, undo: &'t mut Vec<UndoEntry>) -> Self {
        Self { txn, undo }
    }

    pub fn snapshot(&self) -> Snapshot<'t> {
        Snapshot::Write(self.txn)
    }

    pub fn put_row(&mut self, relation: RelationId, id: RowId, row: &Row) -> Result<()> {
        let json = serde_json::to_string(row)?;
        let key = (relation.0, id.0);
        let mut table = self.txn.open_table(ROWS)?;
        let before = table
            .insert(key, json.as_str())?
            .map(|guard| guard.value().to_string());
        self.undo.push(UndoEntry::Row { key, before });
        Ok(())
    }

    pub fn remove_row(&mut self, relation: RelationId, id: RowId) -> Result<()> {
        let key = (relation.0, id.0);
        let mut table = self.txn.open_table(ROWS)?;
        let before = table.remove(key)?.map(|guard| guard.value().to_string());
        self.undo.push(UndoEntry::Row { key, before });
        Ok(())
    }

    pub fn put_table_def(&mut self, def: &TableDef) -> Result<()> {
        let json = serde_json::to_string(def)?;
        let id = def.relation.id.0;
        let mut table = self.txn.open_table(RELATIONS)?;
        let before = table
            .insert(id, json.as_str())?
            .map(|guard| guard.value().to_string());
        self.undo.push(UndoEntry::Relation { id, before });
        Ok(())
    }

    pub fn put_name(&mut self, name: &QualifiedName, id: RelationId) -> Result<()> {
        let key = name_key(name);
        let mut table = self.txn.open_table(RELATION_NAMES)?;
        let before = table.insert(key.as_str(), id.0)?.map(|guard| guard.value());
        self.undo.push(UndoEntry::Name { key, before });
        Ok(())
    }

    pub fn remove_name(&mut self, name: &QualifiedName) -> Result<()> {
        let key = name_key(name);
        let mut table = self.txn.open_table(RELATION_NAMES)?;
        let before = table.remove(key.as_str())?.map(|guard| guard.value());
        self.undo.push(UndoEntry::Name { key, before });
        Ok(())
    }

    /// Take the next value of a `meta` counter. Ids start at 1.
    pub fn next_id(&mut self, counter: &str) -> Result<u64> {
        next_id(self.txn, counter)
    }
}

pub(crate) fn next_id(txn: &WriteTransaction, counter: &str) -> Result<u64> {
    let mut table = txn.open_table(META)?;
    let id = table.get(counter)?.map(|guard| guard.value()).unwrap_or(1);
    table.insert(counter, id + 1)?;
    Ok(id)
}

/// Restore the keys recorded in `entries`, newest first.
pub(crate) fn apply_undo(txn: &WriteTransaction, entries: Vec<UndoEntry>) -> Result<()> {
    for entry in entries.into_iter().rev() {
        match entry {
            UndoEntry::Row { key, before } => {
                let mut table = txn.open_table(ROWS)?;
                match before {
                    Some(json) => {
                        table.insert(key, json.as_str())?;
                    }
                    None => {
                        table.remove(key)?;
                    }
                }
            }
            UndoEntry::Relation { id, before } => {
                let mut table = txn.open_table(RELATIONS)?;
                match before {
                    Some(json) => {
                        table.insert(id, json.as_str())?;
                    }
                    None => {
                        table.remove(id)?;
                    }
                }
            }
            UndoEntry::Name { key, before } => {
                let mut table = txn.open_table(RELATION_NAMES)?;
                match before {
                    Some(id) => {
                        table.insert(key.as_str(), id)?;
                    }
                    None => {
                        table.remove(key.as_str())?;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb::backends::InMemoryBackend;
    use redb::Database;
    use temporal_tables::{Attribute, DataType, TransactionId, TupleLayout};

    fn memory_db() -> Database {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .unwrap();
        let txn = db.begin_write().unwrap();
        txn.open_table(RELATIONS).unwrap();
        txn.open_table(RELATION_NAMES).unwrap();
        txn.open_table(ROWS).unwrap();
        txn.open_table(META).unwrap();
        txn.commit().unwrap();
        db
    }

    fn def(id: u64, name: &str) -> TableDef {
        TableDef {
            relation: Relation {
                id: RelationId(id),
                name: resolve_name(name).unwrap(),
                layout: TupleLayout::new(vec![Attribute::new("a", DataType::Integer)]),
            },
            versioning: None,
        }
    }

    #[test]
    fn unqualified_names_land_in_default_schema() {
        assert_eq!(
            resolve_name("Employees").unwrap(),
            QualifiedName::new(Some("public"), "employees")
        );
        assert_eq!(
            resolve_name("hr.staff").unwrap(),
            QualifiedName::new(Some("hr"), "staff")
        );
        assert!(resolve_name("a.b.c").is_err());
    }

    #[test]
    fn undo_log_restores_previous_state() {
        let db = memory_db();
        let txn = db.begin_write().unwrap();
        let mut undo = Vec::new();
        let rel = RelationId(1);
        let row = |n: i64| Row::new(vec![Value::Integer(n)], TransactionId(1));
        {
            let mut w = Writer::new(&txn, &mut undo);
            w.put_table_def(&def(1, "t")).unwrap();
            w.put_name(&resolve_name("t").unwrap(), rel).unwrap();
            w.put_row(rel, RowId(1), &row(1)).unwrap();
        }
        let mark = undo.len();
        {
            let mut w = Writer::new(&txn, &mut undo);
            w.put_row(rel, RowId(1), &row(2)).unwrap();
            w.put_row(rel, RowId(2), &row(3)).unwrap();
            w.remove_name(&resolve_name("t").unwrap()).unwrap();
        }

        let tail = undo.split_off(mark);
        apply_undo(&txn, tail).unwrap();

        let snap = Snapshot::Write(&txn);
        assert_eq!(snap.rows(rel).unwrap(), vec![(RowId(1), row(1))]);
        assert!(snap.lookup(&resolve_name("t").unwrap()).unwrap().is_some());

        apply_undo(&txn, std::mem::take(&mut undo)).unwrap();
        assert!(snap.rows(rel).unwrap().is_empty());
        assert!(snap.table_def(rel).unwrap().is_none());
    }

    #[test]
    fn rows_are_scoped_to_their_relation() {
        let db = memory_db();
        let txn = db.begin_write().unwrap();
        let mut undo = Vec::new();
        let mut w = Writer::new(&txn, &mut undo);
        let row = Row::new(vec![Value::Integer(7)], TransactionId(1));
        w.put_row(RelationId(1), RowId(5), &row).unwrap();
        w.put_row(RelationId(2), RowId(6), &row).unwrap();
        let snap = w.snapshot();
        assert_eq!(snap.rows(RelationId(1)).unwrap().len(), 1);
        assert_eq!(snap.row(RelationId(2), RowId(6)).unwrap(), Some(row));
        assert_eq!(snap.row(RelationId(2), RowId(5)).unwrap(), None);
    }

    #[test]
    fn counters_start_at_one() {
        let db = memory_db();
        let txn = db.begin_write().unwrap();
        assert_eq!(next_id(&txn, NEXT_ROW_ID).unwrap(), 1);
        assert_eq!(next_id(&txn, NEXT_ROW_ID).unwrap(), 2);
        assert_eq!(next_id(&txn, NEXT_RELATION_ID).unwrap(), 1);
    }
}
