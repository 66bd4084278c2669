//! Per-session cache of main-table → history-table archive plans.
//!
//! An entry records which columns the two tables share and owns the
//! prepared insert over those columns. It also captures both tables'
//! layouts at build time: on every use the current layouts are compared
//! structurally against the captured ones, together with the identity of
//! the configured history table. Any difference releases the old plan and
//! rebuilds the entry within the same call, so schema changes are picked up
//! lazily and never through stale column positions.

use std::collections::HashMap;

use tracing::debug;

use crate::{
    InsertStatement, Relation, RelationId, Result, StatementBackend, TupleLayout, VersioningError,
};

/// A column present in both tables: zero-based positions on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedColumn {
    pub main: usize,
    pub history: usize,
}

/// A validated archive plan for one main table.
#[derive(Debug)]
pub struct CacheEntry<P> {
    main_table: RelationId,
    history_table: RelationId,
    main_layout: TupleLayout,
    history_layout: TupleLayout,
    shared: Vec<SharedColumn>,
    /// `None` only when the tables share no columns.
    archive: Option<P>,
}

impl<P> CacheEntry<P> {
    pub fn main_table(&self) -> RelationId {
        self.main_table
    }

    pub fn history_table(&self) -> RelationId {
        self.history_table
    }

    pub fn shared_columns(&self) -> &[SharedColumn] {
        &self.shared
    }

    pub fn archive_plan(&self) -> Option<&P> {
        self.archive.as_ref()
    }

    fn is_current(&self, main: &Relation, history: &Relation) -> bool {
        self.history_table == history.id
            && self.main_layout == main.layout
            && self.history_layout == history.layout
    }

    fn stale_reason(&self, main: &Relation, history: &Relation) -> &'static str {
        if self.history_table != history.id {
            "history table changed"
        } else if self.main_layout != main.layout {
            "main table layout changed"
        } else {
            "history table layout changed"
        }
    }
}

/// Observable state of a cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Never referenced.
    Unbuilt,
    Invalid,
    Valid,
}

/// Map from main-table identity to its archive plan.
///
/// A slot holding `None` is invalid: its last build or revalidation failed
/// and it holds no resources.
pub struct RelationCache<P> {
    slots: HashMap<RelationId, Option<CacheEntry<P>>>,
}

impl<P> Default for RelationCache<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> RelationCache<P> {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    pub fn state(&self, main_table: RelationId) -> CacheState {
        match self.slots.get(&main_table) {
            None => CacheState::Unbuilt,
            Some(None) => CacheState::Invalid,
            Some(Some(_)) => CacheState::Valid,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Return a valid entry for `main` archiving into `history`, building
    /// or rebuilding it first when needed.
    ///
    /// # Errors
    ///
    /// [`VersioningError::SchemaMismatch`] if `history` lacks the period
    /// column or a shared column differs in type, dimensions or modifier.
    /// The slot is left invalid so the next call validates from scratch.
    pub fn get_or_build<B>(
        &mut self,
        backend: &mut B,
        main: &Relation,
        history: &Relation,
        period_column: &str,
    ) -> Result<&CacheEntry<P>>
    where
        B: StatementBackend<Plan = P>,
    {
        let slot = self.slots.entry(main.id).or_insert(None);
        match slot.take() {
            Some(entry) if entry.is_current(main, history) => return Ok(&*slot.insert(entry)),
            Some(stale) => {
                debug!(
                    relation = %main.name,
                    reason = stale.stale_reason(main, history),
                    "relation cache entry is stale"
                );
                release_entry(backend, stale)?;
            }
            None => {}
        }

        // The slot stays invalid if the build fails.
        let entry = build_entry(backend, main, history, period_column)?;
        Ok(&*slot.insert(entry))
    }

    /// Mark the entry for `main_table` invalid, releasing its plan.
    pub fn invalidate<B>(&mut self, backend: &mut B, main_table: RelationId) -> Result<()>
    where
        B: StatementBackend<Plan = P>,
    {
        let Some(slot) = self.slots.get_mut(&main_table) else {
            return Ok(());
        };
        if let Some(entry) = slot.take() {
            release_entry(backend, entry)?;
        }
        Ok(())
    }

    /// Release every plan and forget all entries.
    pub fn clear<B>(&mut self, backend: &mut B) -> Result<()>
    where
        B: StatementBackend<Plan = P>,
    {
        for entry in self.slots.drain().filter_map(|(_, slot)| slot) {
            release_entry(backend, entry)?;
        }
        Ok(())
    }
}

fn release_entry<B: StatementBackend>(backend: &mut B, entry: CacheEntry<B::Plan>) -> Result<()> {
    if let Some(plan) = entry.archive {
        debug!(relation = %entry.main_table, "releasing archive plan");
        backend.release(plan)?;
    }
    Ok(())
}

fn build_entry<B: StatementBackend>(
    backend: &mut B,
    main: &Relation,
    history: &Relation,
    period_column: &str,
) -> Result<CacheEntry<B::Plan>> {
    if history.layout.position(period_column).is_none() {
        return Err(VersioningError::SchemaMismatch(format!(
            "history relation \"{}\" does not contain system period column \"{}\" \
             (history relation must contain system period column with the same name \
             and data type as the versioned one)",
            history.name, period_column
        )));
    }

    let mut shared = Vec::new();
    let mut columns = Vec::new();
    for (main_pos, attr) in main.layout.attributes().iter().enumerate() {
        if attr.dropped {
            continue;
        }
        let Some(history_pos) = history.layout.position(&attr.name) else {
            continue;
        };
        let history_attr = &history.layout.attributes()[history_pos];
        if !attr.same_type_as(history_attr) {
            return Err(VersioningError::SchemaMismatch(format!(
                "column \"{}\" of relation \"{}\" is of type {} but column \"{}\" of history \
                 relation \"{}\" is of type {}",
                attr.name,
                main.name,
                attr.type_display(),
                history_attr.name,
                history.name,
                history_attr.type_display()
            )));
        }
        shared.push(SharedColumn {
            main: main_pos,
            history: history_pos,
        });
        columns.push((attr.name.clone(), history_attr.data_type.clone()));
    }

    let archive = if columns.is_empty() {
        None
    } else {
        let statement = InsertStatement {
            target: history.id,
            target_name: history.name.clone(),
            columns,
        };
        debug!(relation = %main.name, sql = %statement.sql(), "preparing archive plan");
        Some(backend.prepare(&statement)?)
    };

    Ok(CacheEntry {
        main_table: main.id,
        history_table: history.id,
        main_layout: main.layout.clone(),
        history_layout: history.layout.clone(),
        shared,
        archive,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Attribute, DataType, QualifiedName, Value};

    /// Backend that hands out numbered plans and tracks which are live.
    #[derive(Default)]
    struct CountingBackend {
        next: u32,
        live: Vec<u32>,
        prepared: Vec<String>,
    }

    impl StatementBackend for CountingBackend {
        type Plan = u32;

        fn prepare(&mut self, statement: &InsertStatement) -> Result<u32> {
            self.next += 1;
            self.live.push(self.next);
            self.prepared.push(statement.sql());
            Ok(self.next)
        }

        fn execute(&mut self, _plan: &u32, _args: &[Value]) -> Result<()> {
            Ok(())
        }

        fn release(&mut self, plan: u32) -> Result<()> {
            self.live.retain(|p| *p != plan);
            Ok(())
        }
    }

    fn relation(id: u64, name: &str, attrs: Vec<Attribute>) -> Relation {
        Relation {
            id: RelationId(id),
            name: QualifiedName::new(None, name),
            layout: TupleLayout::new(attrs),
        }
    }

    fn employees() -> Relation {
        relation(
            1,
            "employees",
            vec![
                Attribute::new("name", DataType::Text),
                Attribute::new("salary", DataType::Integer),
                Attribute::new("sys_period", DataType::tstzrange()),
            ],
        )
    }

    fn employees_history() -> Relation {
        relation(
            2,
            "employees_history",
            vec![
                Attribute::new("name", DataType::Text),
                Attribute::new("salary", DataType::Integer),
                Attribute::new("sys_period", DataType::tstzrange()),
                Attribute::new("archived_by", DataType::Text),
            ],
        )
    }

    #[test]
    fn builds_shared_columns_in_main_table_order() {
        let mut backend = CountingBackend::default();
        let mut cache = RelationCache::new();
        let entry = cache
            .get_or_build(&mut backend, &employees(), &employees_history(), "sys_period")
            .unwrap();

        let positions: Vec<(usize, usize)> = entry
            .shared_columns()
            .iter()
            .map(|c| (c.main, c.history))
            .collect();
        assert_eq!(positions, vec![(0, 0), (1, 1), (2, 2)]);
        assert_eq!(entry.archive_plan(), Some(&1));
        assert_eq!(
            backend.prepared,
            vec!["INSERT INTO employees_history (name, salary, sys_period) VALUES ($1, $2, $3)"]
        );
    }

    #[test]
    fn reuses_entry_while_layouts_are_unchanged() {
        let mut backend = CountingBackend::default();
        let mut cache = RelationCache::new();
        let (main, history) = (employees(), employees_history());
        cache.get_or_build(&mut backend, &main, &history, "sys_period").unwrap();
        cache.get_or_build(&mut backend, &main, &history, "sys_period").unwrap();
        assert_eq!(backend.prepared.len(), 1, "second lookup must hit the cache");
    }

    #[test]
    fn layout_change_releases_and_rebuilds() {
        let mut backend = CountingBackend::default();
        let mut cache = RelationCache::new();
        let history = employees_history();
        cache
            .get_or_build(&mut backend, &employees(), &history, "sys_period")
            .unwrap();

        let mut main = employees();
        main.layout
            .attributes_mut()
            .push(Attribute::new("archived_by", DataType::Text));
        let entry = cache
            .get_or_build(&mut backend, &main, &history, "sys_period")
            .unwrap();

        assert_eq!(entry.shared_columns().len(), 4);
        assert_eq!(backend.live, vec![2], "old plan released, new plan live");
    }

    #[test]
    fn history_identity_change_rebuilds() {
        let mut backend = CountingBackend::default();
        let mut cache = RelationCache::new();
        let main = employees();
        cache
            .get_or_build(&mut backend, &main, &employees_history(), "sys_period")
            .unwrap();

        let mut replacement = employees_history();
        replacement.id = RelationId(9);
        let entry = cache
            .get_or_build(&mut backend, &main, &replacement, "sys_period")
            .unwrap();
        assert_eq!(entry.history_table(), RelationId(9));
        assert_eq!(backend.live, vec![2]);
    }

    #[test]
    fn type_mismatch_fails_and_leaves_slot_invalid() {
        let mut backend = CountingBackend::default();
        let mut cache = RelationCache::new();
        let main = employees();
        cache
            .get_or_build(&mut backend, &main, &employees_history(), "sys_period")
            .unwrap();

        let mut history = employees_history();
        history.layout.attributes_mut()[1] = Attribute::new("salary", DataType::BigInt);
        let err = cache
            .get_or_build(&mut backend, &main, &history, "sys_period")
            .unwrap_err();
        assert!(matches!(err, VersioningError::SchemaMismatch(_)));
        assert!(err.to_string().contains("is of type integer but column \"salary\""));
        assert_eq!(cache.state(main.id), CacheState::Invalid);
        assert!(backend.live.is_empty(), "failed rebuild must not leak the old plan");
    }

    #[test]
    fn invalid_slot_is_rebuilt_on_next_use() {
        let mut backend = CountingBackend::default();
        let mut cache = RelationCache::new();
        let main = employees();
        assert_eq!(cache.state(main.id), CacheState::Unbuilt);

        let mut broken = employees_history();
        broken.layout.attributes_mut().remove(2);
        assert!(cache
            .get_or_build(&mut backend, &main, &broken, "sys_period")
            .is_err());
        assert_eq!(cache.state(main.id), CacheState::Invalid);

        let entry = cache
            .get_or_build(&mut backend, &main, &employees_history(), "sys_period")
            .unwrap();
        assert_eq!(entry.main_table(), main.id);
        assert_eq!(cache.state(main.id), CacheState::Valid);
        assert_eq!(backend.live, vec![1]);
    }

    #[test]
    fn modifier_and_dimensions_must_match() {
        let mut backend = CountingBackend::default();
        let mut cache: RelationCache<u32> = RelationCache::new();
        let mut main = employees();
        main.layout.attributes_mut()[0] = Attribute::new("name", DataType::Varchar).with_modifier(20);
        let mut history = employees_history();
        history.layout.attributes_mut()[0] = Attribute::new("name", DataType::Varchar).with_modifier(40);
        assert!(cache
            .get_or_build(&mut backend, &main, &history, "sys_period")
            .is_err());

        history.layout.attributes_mut()[0] = Attribute::new("name", DataType::Varchar)
            .with_modifier(20)
            .with_dimensions(1);
        assert!(cache
            .get_or_build(&mut backend, &main, &history, "sys_period")
            .is_err());
    }

    #[test]
    fn history_without_period_column_is_schema_mismatch() {
        let mut backend = CountingBackend::default();
        let mut cache: RelationCache<u32> = RelationCache::new();
        let history = relation(2, "h", vec![Attribute::new("name", DataType::Text)]);
        let err = cache
            .get_or_build(&mut backend, &employees(), &history, "sys_period")
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("does not contain system period column \"sys_period\""));
        assert_eq!(cache.state(RelationId(1)), CacheState::Invalid);
    }

    #[test]
    fn dropped_and_unshared_columns_are_skipped() {
        let mut backend = CountingBackend::default();
        let mut cache = RelationCache::new();
        let mut main = employees();
        main.layout.attributes_mut()[1].dropped = true;
        main.layout
            .attributes_mut()
            .insert(0, Attribute::new("internal_note", DataType::Text));
        let entry = cache
            .get_or_build(&mut backend, &main, &employees_history(), "sys_period")
            .unwrap();
        let positions: Vec<(usize, usize)> = entry
            .shared_columns()
            .iter()
            .map(|c| (c.main, c.history))
            .collect();
        assert_eq!(positions, vec![(1, 0), (3, 2)]);
    }

    #[test]
    fn clear_releases_every_plan() {
        let mut backend = CountingBackend::default();
        let mut cache = RelationCache::new();
        cache
            .get_or_build(&mut backend, &employees(), &employees_history(), "sys_period")
            .unwrap();
        let mut other = employees();
        other.id = RelationId(5);
        cache
            .get_or_build(&mut backend, &other, &employees_history(), "sys_period")
            .unwrap();
        assert_eq!(backend.live.len(), 2);

        cache.clear(&mut backend).unwrap();
        assert!(backend.live.is_empty());
        assert!(cache.is_empty());
        assert_eq!(cache.state(RelationId(1)), CacheState::Unbuilt);
    }
}
