//! The per-row versioning decision: insert / update / delete.
//!
//! A host calls [`VersioningEngine::handle`] for every row a statement
//! touches, BEFORE applying the change, with three trigger arguments:
//!
//! 1. the system period column name;
//! 2. the history table name (`None` disables archiving);
//! 3. the adjust policy, `"true"` or `"false"` (`None` means false).
//!
//! The returned row is the one the host must write. For deletes it is the
//! unmodified old row, signalling that the delete may proceed.

use tracing::{debug, warn};

use crate::relation_cache::RelationCache;
use crate::time_context::TimeContextStack;
use crate::time_util::next_instant;
use crate::{
    sqlstate, Catalog, Period, QualifiedName, Relation, Result, Row, StatementBackend,
    SubTransactionId, Timestamp, TransactionState, Value, VersioningError, DataType,
};

const UNDEFINED_TABLE: &str = "42P01";
const TRIGGER_PROTOCOL_VIOLATED: &str = "39P01";

// ---------------------------------------------------------------------------
// Trigger protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerTiming {
    Before,
    After,
    InsteadOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerLevel {
    Row,
    Statement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOperation {
    Insert,
    Update,
    Delete,
    Truncate,
}

/// When, how often, and for what a trigger fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerEvent {
    pub timing: TriggerTiming,
    pub level: TriggerLevel,
    pub operation: TriggerOperation,
}

impl TriggerEvent {
    pub const fn before_row(operation: TriggerOperation) -> Self {
        Self {
            timing: TriggerTiming::Before,
            level: TriggerLevel::Row,
            operation,
        }
    }
}

/// One row-level invocation.
#[derive(Debug, Clone)]
pub struct TriggerCall<'a> {
    pub event: TriggerEvent,
    pub relation: &'a Relation,
    /// The existing row, for UPDATE and DELETE.
    pub old_row: Option<Row>,
    /// The proposed row, for INSERT and UPDATE.
    pub new_row: Option<Row>,
    pub args: &'a [Option<String>],
}

impl<'a> TriggerCall<'a> {
    pub fn insert(relation: &'a Relation, new_row: Row, args: &'a [Option<String>]) -> Self {
        Self {
            event: TriggerEvent::before_row(TriggerOperation::Insert),
            relation,
            old_row: None,
            new_row: Some(new_row),
            args,
        }
    }

    pub fn update(
        relation: &'a Relation,
        old_row: Row,
        new_row: Row,
        args: &'a [Option<String>],
    ) -> Self {
        Self {
            event: TriggerEvent::before_row(TriggerOperation::Update),
            relation,
            old_row: Some(old_row),
            new_row: Some(new_row),
            args,
        }
    }

    pub fn delete(relation: &'a Relation, old_row: Row, args: &'a [Option<String>]) -> Self {
        Self {
            event: TriggerEvent::before_row(TriggerOperation::Delete),
            relation,
            old_row: Some(old_row),
            new_row: None,
            args,
        }
    }
}

/// Non-fatal notice: a write-order inversion was resolved by moving the
/// archived upper bound just past the existing lower bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyWarning {
    pub relation: QualifiedName,
    /// Lower bound of the row's existing period.
    pub period_start: Timestamp,
    /// The system time of the current transaction.
    pub system_time: Timestamp,
    /// The upper bound actually used.
    pub adjusted_to: Timestamp,
}

impl ConcurrencyWarning {
    pub fn sqlstate(&self) -> &'static str {
        sqlstate::SYSTEM_PERIOD_ADJUSTED
    }
}

impl std::fmt::Display for ConcurrencyWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "system period value of relation \"{}\" was adjusted",
            self.relation
        )
    }
}

/// What the host should do with the row.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerOutcome {
    /// The row to write (insert/update) or the row allowed to be removed
    /// (delete).
    pub row: Row,
    /// Whether a history row was written.
    pub archived: bool,
    pub warning: Option<ConcurrencyWarning>,
}

impl TriggerOutcome {
    fn pass_through(row: Row) -> Self {
        Self {
            row,
            archived: false,
            warning: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// The parsed trigger arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersioningConfig {
    pub period_column: String,
    pub history_table: Option<QualifiedName>,
    pub adjust: bool,
}

impl VersioningConfig {
    pub fn from_args(args: &[Option<String>]) -> Result<Self> {
        let [period, history, adjust] = args else {
            return Err(VersioningError::invalid_parameter(format!(
                "wrong number of parameters for function \"versioning\": \
                 expected 3 parameters but got {}",
                args.len()
            )));
        };
        let Some(period_column) = period.clone() else {
            return Err(VersioningError::invalid_parameter(
                "system period column name must not be null",
            ));
        };
        let history_table = match history {
            Some(name) => Some(QualifiedName::parse(name).ok_or_else(|| {
                VersioningError::invalid_parameter(format!(
                    "invalid history relation name \"{name}\""
                ))
            })?),
            None => None,
        };
        let adjust = match adjust {
            Some(arg) => parse_adjust_argument(arg)?,
            None => false,
        };
        Ok(Self {
            period_column,
            history_table,
            adjust,
        })
    }
}

fn parse_adjust_argument(arg: &str) -> Result<bool> {
    if arg.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if arg.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(VersioningError::invalid_parameter(format!(
            "invalid value \"{arg}\" for \"adjust\" parameter: valid values are \"true\", \"false\""
        )))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowEvent {
    Insert,
    Update,
    Delete,
}

/// Per-session versioning state: the system-time context stack and the
/// relation cache. `P` is the host's prepared-plan handle.
pub struct VersioningEngine<P> {
    contexts: TimeContextStack,
    cache: RelationCache<P>,
}

impl<P> Default for VersioningEngine<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> VersioningEngine<P> {
    pub fn new() -> Self {
        Self {
            contexts: TimeContextStack::new(),
            cache: RelationCache::new(),
        }
    }

    pub fn contexts(&self) -> &TimeContextStack {
        &self.contexts
    }

    pub fn cache(&self) -> &RelationCache<P> {
        &self.cache
    }

    /// Effective system time for a transaction that started at
    /// `transaction_start`.
    pub fn system_time(&self, transaction_start: Timestamp) -> Timestamp {
        self.contexts.system_time(transaction_start)
    }

    /// Set (or with `None`, clear) the system time override at `level`.
    pub fn set_system_time(&mut self, level: SubTransactionId, at: Option<Timestamp>) {
        self.contexts.set_system_time(level, at);
    }

    pub fn on_subtransaction_commit(&mut self, level: SubTransactionId, parent: SubTransactionId) {
        self.contexts.on_subtransaction_commit(level, parent);
    }

    pub fn on_subtransaction_abort(&mut self, level: SubTransactionId) {
        self.contexts.on_subtransaction_abort(level);
    }

    pub fn on_transaction_commit(&mut self) {
        self.contexts.on_transaction_commit();
    }

    pub fn on_transaction_abort(&mut self) {
        self.contexts.on_transaction_abort();
    }

    /// Release every cached plan. Call before dropping the engine.
    pub fn shutdown<B>(&mut self, backend: &mut B) -> Result<()>
    where
        B: StatementBackend<Plan = P>,
    {
        self.cache.clear(backend)
    }

    /// Version one row.
    ///
    /// # Errors
    ///
    /// - [`VersioningError::Configuration`] for protocol or argument
    ///   problems and a missing or wrong-typed period column;
    /// - [`VersioningError::SchemaMismatch`] when the history table is
    ///   incompatible;
    /// - [`VersioningError::Data`] for a malformed existing period or an
    ///   unresolved write-order inversion;
    /// - [`VersioningError::Execution`] when the host fails.
    ///
    /// Nothing has been written when any of the first three is returned.
    pub fn handle<H>(&mut self, host: &mut H, call: TriggerCall<'_>) -> Result<TriggerOutcome>
    where
        H: Catalog + TransactionState + StatementBackend<Plan = P>,
    {
        let event = check_protocol(&call.event)?;
        let config = VersioningConfig::from_args(call.args)?;
        let relation = call.relation;
        let period = period_column(relation, &config.period_column)?;

        match event {
            RowEvent::Insert => {
                let new_row = required_row(call.new_row, "INSERT", "new")?;
                self.versioning_insert(host, new_row, period)
            }
            RowEvent::Update => {
                let old_row = required_row(call.old_row, "UPDATE", "old")?;
                let new_row = required_row(call.new_row, "UPDATE", "new")?;
                self.versioning_update(host, relation, &config, old_row, new_row, period)
            }
            RowEvent::Delete => {
                let old_row = required_row(call.old_row, "DELETE", "old")?;
                self.versioning_delete(host, relation, &config, old_row, period)
            }
        }
    }

    fn versioning_insert<H>(&self, host: &H, new_row: Row, period: usize) -> Result<TriggerOutcome>
    where
        H: TransactionState,
    {
        let now = self.system_time(host.transaction_start());
        let row = new_row.with_value(period, Period::current_from(now).into());
        Ok(TriggerOutcome::pass_through(row))
    }

    fn versioning_update<H>(
        &mut self,
        host: &mut H,
        relation: &Relation,
        config: &VersioningConfig,
        old_row: Row,
        new_row: Row,
        period: usize,
    ) -> Result<TriggerOutcome>
    where
        H: Catalog + TransactionState + StatementBackend<Plan = P>,
    {
        // One history row per row per transaction.
        if host.is_current_transaction(old_row.origin) {
            debug!(relation = %relation.name, "row already versioned in this transaction");
            return Ok(TriggerOutcome::pass_through(new_row));
        }

        let (archived, upper, warning) =
            self.archive_old_version(host, relation, config, &old_row, period)?;
        let row = new_row.with_value(period, Period::current_from(upper).into());
        Ok(TriggerOutcome {
            row,
            archived,
            warning,
        })
    }

    fn versioning_delete<H>(
        &mut self,
        host: &mut H,
        relation: &Relation,
        config: &VersioningConfig,
        old_row: Row,
        period: usize,
    ) -> Result<TriggerOutcome>
    where
        H: Catalog + TransactionState + StatementBackend<Plan = P>,
    {
        if host.is_current_transaction(old_row.origin) {
            debug!(relation = %relation.name, "row already versioned in this transaction");
            return Ok(TriggerOutcome::pass_through(old_row));
        }

        let (archived, _, warning) =
            self.archive_old_version(host, relation, config, &old_row, period)?;
        Ok(TriggerOutcome {
            row: old_row,
            archived,
            warning,
        })
    }

    /// Close the old version's period at the current system time (adjusted
    /// if needed) and archive it. Returns the upper bound used.
    fn archive_old_version<H>(
        &mut self,
        host: &mut H,
        relation: &Relation,
        config: &VersioningConfig,
        old_row: &Row,
        period: usize,
    ) -> Result<(bool, Timestamp, Option<ConcurrencyWarning>)>
    where
        H: Catalog + TransactionState + StatementBackend<Plan = P>,
    {
        let lower = deserialize_system_period(old_row, relation, period, &config.period_column)?;
        let now = self.system_time(host.transaction_start());
        let (upper, warning) = adjust_system_period(lower, now, config.adjust, relation)?;

        let history_row = old_row.with_value(period, Period::new(lower, Some(upper)).into());
        let archived = self.insert_history_row(host, relation, config, &history_row)?;
        Ok((archived, upper, warning))
    }

    fn insert_history_row<H>(
        &mut self,
        host: &mut H,
        relation: &Relation,
        config: &VersioningConfig,
        history_row: &Row,
    ) -> Result<bool>
    where
        H: Catalog + StatementBackend<Plan = P>,
    {
        let Some(history_name) = &config.history_table else {
            debug!(relation = %relation.name, "no history relation configured");
            return Ok(false);
        };
        let history = host.relation_by_name(history_name)?.ok_or_else(|| {
            VersioningError::Configuration {
                code: UNDEFINED_TABLE,
                message: format!("relation \"{history_name}\" does not exist"),
            }
        })?;

        let entry = self
            .cache
            .get_or_build(host, relation, &history, &config.period_column)?;
        let Some(plan) = entry.archive_plan() else {
            return Ok(false);
        };
        let args: Vec<Value> = entry
            .shared_columns()
            .iter()
            .map(|column| history_row.get(column.main).clone())
            .collect();
        host.execute(plan, &args)?;
        Ok(true)
    }
}

fn check_protocol(event: &TriggerEvent) -> Result<RowEvent> {
    if event.timing != TriggerTiming::Before || event.level != TriggerLevel::Row {
        return Err(protocol_violation(
            "function \"versioning\" must be fired BEFORE ROW",
        ));
    }
    match event.operation {
        TriggerOperation::Insert => Ok(RowEvent::Insert),
        TriggerOperation::Update => Ok(RowEvent::Update),
        TriggerOperation::Delete => Ok(RowEvent::Delete),
        TriggerOperation::Truncate => Err(protocol_violation(
            "function \"versioning\" must be fired for INSERT or UPDATE or DELETE",
        )),
    }
}

fn protocol_violation(message: &str) -> VersioningError {
    VersioningError::Configuration {
        code: TRIGGER_PROTOCOL_VIOLATED,
        message: message.to_string(),
    }
}

fn required_row(row: Option<Row>, operation: &str, which: &str) -> Result<Row> {
    row.ok_or_else(|| protocol_violation(&format!("{operation} event fired without the {which} row")))
}

/// Position of the period column, checked to be a live, scalar `tstzrange`.
fn period_column(relation: &Relation, name: &str) -> Result<usize> {
    let Some(position) = relation.layout.position(name) else {
        return Err(VersioningError::undefined_column(format!(
            "column \"{name}\" of relation \"{}\" does not exist",
            relation.name
        )));
    };
    let attr = &relation.layout.attributes()[position];
    if attr.dimensions != 0 {
        return Err(VersioningError::datatype_mismatch(format!(
            "system period column \"{name}\" of relation \"{}\" is not a range but an array",
            relation.name
        )));
    }
    match attr.data_type.range_subtype() {
        None => Err(VersioningError::datatype_mismatch(format!(
            "system period column \"{name}\" of relation \"{}\" is not a range but type {}",
            relation.name,
            attr.type_display()
        ))),
        Some(DataType::Timestamptz) => Ok(position),
        Some(subtype) => Err(VersioningError::datatype_mismatch(format!(
            "system period column \"{name}\" of relation \"{}\" is not a range of timestamp \
             with timezone but of type {subtype}",
            relation.name
        ))),
    }
}

/// Lower bound of an existing row's period. The period must be non-null,
/// non-empty, and unbounded above.
fn deserialize_system_period(
    row: &Row,
    relation: &Relation,
    period: usize,
    name: &str,
) -> Result<Option<Timestamp>> {
    let invalid = || VersioningError::Data {
        code: sqlstate::DATA_EXCEPTION,
        message: format!(
            "system period column \"{name}\" of relation \"{}\" contains invalid value \
             (valid ranges must be non-empty and unbounded on the high side)",
            relation.name
        ),
    };
    match row.get(period) {
        Value::Null => Err(VersioningError::Data {
            code: sqlstate::NULL_VALUE_NOT_ALLOWED,
            message: format!(
                "system period column \"{name}\" of relation \"{}\" must not be null",
                relation.name
            ),
        }),
        Value::Period(p) if p.is_current() => Ok(p.lower()),
        _ => Err(invalid()),
    }
}

/// Resolve `lower >= upper`: fail, or move `upper` just past `lower`.
fn adjust_system_period(
    lower: Option<Timestamp>,
    upper: Timestamp,
    adjust: bool,
    relation: &Relation,
) -> Result<(Timestamp, Option<ConcurrencyWarning>)> {
    let Some(lower) = lower.filter(|l| *l >= upper) else {
        return Ok((upper, None));
    };
    if !adjust {
        return Err(VersioningError::Data {
            code: sqlstate::DATA_EXCEPTION,
            message: format!(
                "system period value of relation \"{}\" cannot be set to a valid period because \
                 a row that is attempted to modify was also modified by another transaction \
                 (the start time of system period is {lower} but the start time of the current \
                 transaction is {upper}); retry the statement or set \"adjust\" parameter of \
                 \"versioning\" function to true",
                relation.name
            ),
        });
    }

    let adjusted = next_instant(lower).ok_or_else(|| VersioningError::Data {
        code: sqlstate::DATETIME_FIELD_OVERFLOW,
        message: format!(
            "timestamp out of range: system period value of relation \"{}\" cannot be \
             adjusted past {lower}",
            relation.name
        ),
    })?;
    warn!(
        relation = %relation.name,
        period_start = %lower,
        system_time = %upper,
        adjusted_to = %adjusted,
        "system period value was adjusted"
    );
    Ok((
        adjusted,
        Some(ConcurrencyWarning {
            relation: relation.name.clone(),
            period_start: lower,
            system_time: upper,
            adjusted_to: adjusted,
        }),
    ))
}
