//! The engine's view of an open store transaction.
//!
//! [`TxnHost`] answers the engine's catalog and transaction-state questions
//! from the session's redb write transaction and executes archive plans by
//! writing history rows directly: history tables carry no trigger of their
//! own, so no dispatch happens for them.

use temporal_tables::{
    Catalog, InsertStatement, QualifiedName, Relation, RelationId, Result as EngineResult, Row,
    StatementBackend, SubTransactionId, Timestamp, TransactionId, TransactionState, Value,
    VersioningError,
};
use tracing::debug;

use crate::storage::{RowId, Writer, NEXT_ROW_ID};
use crate::StoreError;

/// A prepared archive insert: target table and the position of each
/// statement parameter in the target's layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePlan {
    target: RelationId,
    positions: Vec<usize>,
    width: usize,
}

impl ArchivePlan {
    pub fn target(&self) -> RelationId {
        self.target
    }
}

/// Counts plans handed out and not yet released.
#[derive(Debug, Default)]
pub(crate) struct PlanLedger {
    live: usize,
}

impl PlanLedger {
    pub fn live(&self) -> usize {
        self.live
    }
}

/// Outside a transaction the ledger can still take plans back, which is
/// all a session needs when it shuts its engine down.
impl StatementBackend for PlanLedger {
    type Plan = ArchivePlan;

    fn prepare(&mut self, _statement: &InsertStatement) -> EngineResult<ArchivePlan> {
        Err(VersioningError::Execution("no open transaction".into()))
    }

    fn execute(&mut self, _plan: &ArchivePlan, _args: &[Value]) -> EngineResult<()> {
        Err(VersioningError::Execution("no open transaction".into()))
    }

    fn release(&mut self, plan: ArchivePlan) -> EngineResult<()> {
        self.live = self.live.saturating_sub(1);
        debug!(target_relation = %plan.target, live = self.live, "released archive plan");
        Ok(())
    }
}

pub(crate) struct TxnHost<'t> {
    pub writer: Writer<'t>,
    pub plans: &'t mut PlanLedger,
    pub xid: TransactionId,
    pub level: SubTransactionId,
    pub start: Timestamp,
}

fn execution(e: StoreError) -> VersioningError {
    match e {
        StoreError::Versioning(inner) => inner,
        other => VersioningError::Execution(other.to_string()),
    }
}

impl Catalog for TxnHost<'_> {
    fn relation_by_name(&self, name: &QualifiedName) -> EngineResult<Option<Relation>> {
        let def = self.writer.snapshot().lookup(name).map_err(execution)?;
        Ok(def.map(|def| def.relation))
    }
}

impl TransactionState for TxnHost<'_> {
    fn current_transaction(&self) -> TransactionId {
        self.xid
    }

    fn current_subtransaction(&self) -> SubTransactionId {
        self.level
    }

    fn transaction_start(&self) -> Timestamp {
        self.start
    }
}

impl StatementBackend for TxnHost<'_> {
    type Plan = ArchivePlan;

    fn prepare(&mut self, statement: &InsertStatement) -> EngineResult<ArchivePlan> {
        let def = self
            .writer
            .snapshot()
            .table_def(statement.target)
            .map_err(execution)?
            .ok_or_else(|| {
                VersioningError::Execution(format!(
                    "relation \"{}\" does not exist",
                    statement.target_name
                ))
            })?;
        let layout = &def.relation.layout;
        let positions = statement
            .columns
            .iter()
            .map(|(name, _)| {
                layout.position(name).ok_or_else(|| {
                    VersioningError::Execution(format!(
                        "column \"{name}\" of relation \"{}\" does not exist",
                        statement.target_name
                    ))
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        self.plans.live += 1;
        debug!(sql = %statement.sql(), live = self.plans.live, "prepared archive plan");
        Ok(ArchivePlan {
            target: statement.target,
            positions,
            width: layout.len(),
        })
    }

    fn execute(&mut self, plan: &ArchivePlan, args: &[Value]) -> EngineResult<()> {
        if args.len() != plan.positions.len() {
            return Err(VersioningError::Execution(format!(
                "archive plan expects {} values but got {}",
                plan.positions.len(),
                args.len()
            )));
        }
        let mut row = Row::new(vec![Value::Null; plan.width], self.xid);
        for (&pos, value) in plan.positions.iter().zip(args) {
            row.set(pos, value.clone());
        }
        let id = RowId(self.writer.next_id(NEXT_ROW_ID).map_err(execution)?);
        self.writer
            .put_row(plan.target, id, &row)
            .map_err(execution)
    }

    fn release(&mut self, plan: ArchivePlan) -> EngineResult<()> {
        self.plans.release(plan)
    }
}
