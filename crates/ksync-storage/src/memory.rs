//! In-process [`SyncStore`] with the same width/type checks as the database.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ksync_core::{
    CanonicalEntity, ColumnKind, ColumnSpec, ConnectorSpec, MappingOrigin, MappingType, NewSource,
    Resolution, SchemaChangeset, SourceDefinition, SourceFieldBinding, SyncLogEntry, SyncLogRecord,
    SyncedRow, ValueMapping,
};
use tokio::sync::Mutex;

use crate::{
    check_identifier, MappingStats, RowWrite, StoreError, StoreResult, SyncStore, ValueGroup,
    WriteOutcome,
};

#[derive(Debug, Clone)]
struct MemoryRow {
    row: SyncedRow,
    values: HashMap<String, Option<String>>,
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<ColumnSpec>,
    rows: BTreeMap<String, MemoryRow>,
}

#[derive(Debug, Default)]
struct MemoryState {
    sources: BTreeMap<i64, SourceDefinition>,
    tables: HashMap<String, MemoryTable>,
    bindings: BTreeMap<(i64, MappingType), SourceFieldBinding>,
    entities: BTreeMap<(MappingType, String), CanonicalEntity>,
    mappings: Vec<ValueMapping>,
    logs: Vec<SyncLogEntry>,
    ddl_log: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_ddl: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following DDL statement fail (permission errors and the like).
    pub fn set_fail_ddl(&self, fail: bool) {
        self.fail_ddl.store(fail, Ordering::SeqCst);
    }

    /// DDL statements applied so far, oldest first.
    pub async fn ddl_log(&self) -> Vec<String> {
        self.state.lock().await.ddl_log.clone()
    }

    /// Raw value of a user column for one row.
    pub async fn column_value(&self, table: &str, natural_id: &str, column: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)?
            .rows
            .get(natural_id)?
            .values
            .get(column)
            .cloned()
            .flatten()
    }

    fn check_ddl(&self, table: &str) -> StoreResult<()> {
        if self.fail_ddl.load(Ordering::SeqCst) {
            return Err(StoreError::Ddl {
                table: table.to_string(),
                message: "permission denied".to_string(),
            });
        }
        Ok(())
    }
}

fn table_mut<'a>(state: &'a mut MemoryState, table: &str) -> StoreResult<&'a mut MemoryTable> {
    state
        .tables
        .get_mut(table)
        .ok_or_else(|| StoreError::TableMissing(table.to_string()))
}

fn resolution_slot(row: &mut SyncedRow, mapping_type: MappingType) -> &mut Option<Resolution> {
    match mapping_type {
        MappingType::Store => &mut row.store,
        MappingType::Person => &mut row.person,
    }
}

fn trimmed_value(row: &MemoryRow, column: &str) -> Option<String> {
    row.values
        .get(column)
        .cloned()
        .flatten()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn migrate(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn list_sources(&self, active_only: bool) -> StoreResult<Vec<SourceDefinition>> {
        let state = self.state.lock().await;
        Ok(state
            .sources
            .values()
            .filter(|s| !active_only || s.active)
            .cloned()
            .collect())
    }

    async fn get_source(&self, source_id: i64) -> StoreResult<Option<SourceDefinition>> {
        Ok(self.state.lock().await.sources.get(&source_id).cloned())
    }

    async fn upsert_source(&self, source: NewSource) -> StoreResult<SourceDefinition> {
        let mut state = self.state.lock().await;
        let id = match source.id {
            Some(id) => id,
            None => state.sources.keys().next_back().copied().unwrap_or(0) + 1,
        };
        let existing = state.sources.get(&id).cloned();
        let def = SourceDefinition {
            id,
            alias: source.alias,
            connector: source.connector,
            credentials_ref: source.credentials_ref,
            owner: source.owner,
            table_name: existing.as_ref().and_then(|e| e.table_name.clone()),
            active: source.active,
            last_synced_at: existing.as_ref().and_then(|e| e.last_synced_at),
            created_at: existing.map(|e| e.created_at).unwrap_or_else(Utc::now),
        };
        state.sources.insert(id, def.clone());
        Ok(def)
    }

    async fn repoint_source(&self, source_id: i64, connector: ConnectorSpec) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let source = state
            .sources
            .get_mut(&source_id)
            .ok_or(StoreError::SourceNotFound(source_id))?;
        source.connector = connector;
        Ok(())
    }

    async fn set_source_active(&self, source_id: i64, active: bool) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let source = state
            .sources
            .get_mut(&source_id)
            .ok_or(StoreError::SourceNotFound(source_id))?;
        source.active = active;
        Ok(())
    }

    async fn assign_table_name(&self, source_id: i64, table: &str) -> StoreResult<()> {
        check_identifier(table)?;
        let mut state = self.state.lock().await;
        let source = state
            .sources
            .get_mut(&source_id)
            .ok_or(StoreError::SourceNotFound(source_id))?;
        match &source.table_name {
            Some(existing) if existing != table => Err(StoreError::TableNameConflict {
                source_id,
                existing: existing.clone(),
            }),
            _ => {
                source.table_name = Some(table.to_string());
                Ok(())
            }
        }
    }

    async fn mark_source_synced(&self, source_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let source = state
            .sources
            .get_mut(&source_id)
            .ok_or(StoreError::SourceNotFound(source_id))?;
        source.last_synced_at = Some(at);
        Ok(())
    }

    async fn table_columns(&self, table: &str) -> StoreResult<Option<Vec<ColumnSpec>>> {
        check_identifier(table)?;
        let state = self.state.lock().await;
        Ok(state.tables.get(table).map(|t| t.columns.clone()))
    }

    async fn create_table(&self, table: &str, columns: &[ColumnSpec]) -> StoreResult<()> {
        check_identifier(table)?;
        for column in columns {
            check_identifier(&column.name)?;
        }
        self.check_ddl(table)?;
        let mut state = self.state.lock().await;
        if state.tables.contains_key(table) {
            return Err(StoreError::Ddl {
                table: table.to_string(),
                message: "table already exists".to_string(),
            });
        }
        state.tables.insert(
            table.to_string(),
            MemoryTable {
                columns: columns.to_vec(),
                rows: BTreeMap::new(),
            },
        );
        state.ddl_log.push(format!("CREATE TABLE {table}"));
        Ok(())
    }

    async fn apply_changeset(&self, table: &str, changeset: &SchemaChangeset) -> StoreResult<()> {
        check_identifier(table)?;
        for column in &changeset.columns_to_add {
            check_identifier(&column.name)?;
        }
        self.check_ddl(table)?;
        let mut state = self.state.lock().await;
        let mut statements = Vec::new();
        let mut next = table_mut(&mut state, table)?.columns.clone();

        for column in &changeset.columns_to_add {
            if next.iter().any(|c| c.name.eq_ignore_ascii_case(&column.name)) {
                continue;
            }
            next.push(column.clone());
            statements.push(format!("ALTER TABLE {table} ADD {} {}", column.name, column.kind));
        }
        for widening in &changeset.columns_to_widen {
            let Some(existing) = next.iter_mut().find(|c| c.name == widening.column) else {
                return Err(StoreError::Ddl {
                    table: table.to_string(),
                    message: format!("column {} does not exist", widening.column),
                });
            };
            if !widening.to.covers(&existing.kind) {
                return Err(StoreError::Ddl {
                    table: table.to_string(),
                    message: format!("refusing to narrow {} to {}", widening.column, widening.to),
                });
            }
            existing.kind = widening.to;
            statements.push(format!(
                "ALTER TABLE {table} ALTER {} TYPE {}",
                widening.column, widening.to
            ));
        }

        table_mut(&mut state, table)?.columns = next;
        state.ddl_log.extend(statements);
        Ok(())
    }

    async fn write_row(&self, table: &str, row: &RowWrite) -> StoreResult<WriteOutcome> {
        check_identifier(table)?;
        let mut state = self.state.lock().await;
        let target = table_mut(&mut state, table)?;

        let mut values = HashMap::new();
        for (spec, value) in &row.values {
            let Some(current) = target.columns.iter().find(|c| c.name == spec.name) else {
                return Err(StoreError::Other(format!("column {} missing in {table}", spec.name)));
            };
            if let Some(v) = value {
                if !current.kind.accepts(v) {
                    return Err(match current.kind {
                        ColumnKind::Text(_) => StoreError::ValueTooLong {
                            column: Some(spec.name.clone()),
                        },
                        _ => StoreError::InvalidValue {
                            column: Some(spec.name.clone()),
                            message: format!("{v:?} is not a valid {}", current.kind),
                        },
                    });
                }
            }
            values.insert(spec.name.clone(), value.clone());
        }

        let now = Utc::now();
        match target.rows.get_mut(&row.natural_id) {
            Some(existing) if existing.row.payload_hash == row.payload_hash => {
                Ok(WriteOutcome::Unchanged)
            }
            Some(existing) => {
                existing.row.metadata = row.metadata.clone();
                existing.row.payload = row.payload.clone();
                existing.row.payload_hash = row.payload_hash.clone();
                existing.row.synced_at = now;
                existing.row.store = None;
                existing.row.person = None;
                existing.values = values;
                Ok(WriteOutcome::Updated)
            }
            None => {
                target.rows.insert(
                    row.natural_id.clone(),
                    MemoryRow {
                        row: SyncedRow {
                            natural_id: row.natural_id.clone(),
                            metadata: row.metadata.clone(),
                            synced_at: now,
                            payload: row.payload.clone(),
                            payload_hash: row.payload_hash.clone(),
                            store: None,
                            person: None,
                        },
                        values,
                    },
                );
                Ok(WriteOutcome::Inserted)
            }
        }
    }

    async fn get_row(&self, table: &str, natural_id: &str) -> StoreResult<Option<SyncedRow>> {
        let state = self.state.lock().await;
        let target = state
            .tables
            .get(table)
            .ok_or_else(|| StoreError::TableMissing(table.to_string()))?;
        Ok(target.rows.get(natural_id).map(|r| r.row.clone()))
    }

    async fn list_rows(&self, table: &str, limit: usize) -> StoreResult<Vec<SyncedRow>> {
        let state = self.state.lock().await;
        let target = state
            .tables
            .get(table)
            .ok_or_else(|| StoreError::TableMissing(table.to_string()))?;
        Ok(target.rows.values().take(limit).map(|r| r.row.clone()).collect())
    }

    async fn count_rows(&self, table: &str) -> StoreResult<u64> {
        let state = self.state.lock().await;
        let target = state
            .tables
            .get(table)
            .ok_or_else(|| StoreError::TableMissing(table.to_string()))?;
        Ok(target.rows.len() as u64)
    }

    async fn field_bindings(&self, source_id: i64) -> StoreResult<Vec<SourceFieldBinding>> {
        let state = self.state.lock().await;
        Ok(state
            .bindings
            .values()
            .filter(|b| b.source_id == source_id)
            .cloned()
            .collect())
    }

    async fn set_field_binding(&self, binding: &SourceFieldBinding) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .bindings
            .insert((binding.source_id, binding.mapping_type), binding.clone());
        Ok(())
    }

    async fn delete_field_binding(&self, source_id: i64, mapping_type: MappingType) -> StoreResult<()> {
        self.state.lock().await.bindings.remove(&(source_id, mapping_type));
        Ok(())
    }

    async fn canonical_entities(&self, mapping_type: MappingType) -> StoreResult<Vec<CanonicalEntity>> {
        let state = self.state.lock().await;
        Ok(state
            .entities
            .values()
            .filter(|e| e.mapping_type == mapping_type)
            .cloned()
            .collect())
    }

    async fn upsert_canonical_entity(&self, entity: &CanonicalEntity) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.entities.insert(
            (entity.mapping_type, entity.canonical_id.clone()),
            entity.clone(),
        );
        Ok(())
    }

    async fn active_value_mapping(
        &self,
        mapping_type: MappingType,
        source_value: &str,
    ) -> StoreResult<Option<ValueMapping>> {
        let state = self.state.lock().await;
        Ok(state
            .mappings
            .iter()
            .find(|m| m.active && m.mapping_type == mapping_type && m.source_value == source_value)
            .cloned())
    }

    async fn value_mappings(&self, mapping_type: Option<MappingType>) -> StoreResult<Vec<ValueMapping>> {
        let state = self.state.lock().await;
        Ok(state
            .mappings
            .iter()
            .filter(|m| mapping_type.is_none() || mapping_type == Some(m.mapping_type))
            .cloned()
            .collect())
    }

    async fn save_value_mapping(
        &self,
        mapping_type: MappingType,
        source_value: &str,
        canonical_id: &str,
        origin: MappingOrigin,
        created_by: &str,
    ) -> StoreResult<ValueMapping> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .mappings
            .iter_mut()
            .find(|m| m.active && m.mapping_type == mapping_type && m.source_value == source_value)
        {
            if existing.origin == MappingOrigin::Manual && origin == MappingOrigin::Auto {
                return Ok(existing.clone());
            }
            if existing.origin == origin && existing.canonical_id == canonical_id {
                return Ok(existing.clone());
            }
            existing.active = false;
        }
        let id = state.mappings.len() as i64 + 1;
        let mapping = ValueMapping {
            id,
            mapping_type,
            source_value: source_value.to_string(),
            canonical_id: canonical_id.to_string(),
            origin,
            usage_count: 0,
            active: true,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
        };
        state.mappings.push(mapping.clone());
        Ok(mapping)
    }

    async fn deactivate_value_mapping(&self, mapping_id: i64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(m) = state.mappings.iter_mut().find(|m| m.id == mapping_id) {
            m.active = false;
        }
        Ok(())
    }

    async fn bump_mapping_usage(&self, mapping_id: i64, by: u64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(m) = state.mappings.iter_mut().find(|m| m.id == mapping_id) {
            m.usage_count += by as i64;
        }
        Ok(())
    }

    async fn value_groups(
        &self,
        table: &str,
        column: &str,
        mapping_type: MappingType,
    ) -> StoreResult<Vec<ValueGroup>> {
        check_identifier(column)?;
        let state = self.state.lock().await;
        let target = state
            .tables
            .get(table)
            .ok_or_else(|| StoreError::TableMissing(table.to_string()))?;

        let mut groups: Vec<ValueGroup> = Vec::new();
        for row in target.rows.values() {
            let Some(value) = trimmed_value(row, column) else {
                continue;
            };
            let resolution = row.row.resolution(mapping_type).cloned();
            match groups
                .iter_mut()
                .find(|g| g.source_value == value && g.resolution == resolution)
            {
                Some(group) => group.rows += 1,
                None => groups.push(ValueGroup {
                    source_value: value,
                    resolution,
                    rows: 1,
                }),
            }
        }
        groups.sort_by(|a, b| b.rows.cmp(&a.rows).then_with(|| a.source_value.cmp(&b.source_value)));
        Ok(groups)
    }

    async fn set_row_resolution(
        &self,
        table: &str,
        column: &str,
        mapping_type: MappingType,
        source_value: &str,
        resolution: &Resolution,
    ) -> StoreResult<u64> {
        check_identifier(column)?;
        let mut state = self.state.lock().await;
        let target = table_mut(&mut state, table)?;
        let mut touched = 0;
        for row in target.rows.values_mut() {
            if trimmed_value(row, column).as_deref() != Some(source_value) {
                continue;
            }
            let slot = resolution_slot(&mut row.row, mapping_type);
            let is_manual = slot.as_ref().map(|r| r.origin) == Some(MappingOrigin::Manual);
            if is_manual && resolution.origin == MappingOrigin::Auto {
                continue;
            }
            *slot = Some(resolution.clone());
            touched += 1;
        }
        Ok(touched)
    }

    async fn clear_row_resolution(
        &self,
        table: &str,
        column: &str,
        mapping_type: MappingType,
        source_value: &str,
    ) -> StoreResult<u64> {
        check_identifier(column)?;
        let mut state = self.state.lock().await;
        let target = table_mut(&mut state, table)?;
        let mut touched = 0;
        for row in target.rows.values_mut() {
            if trimmed_value(row, column).as_deref() != Some(source_value) {
                continue;
            }
            let slot = resolution_slot(&mut row.row, mapping_type);
            if slot.take().is_some() {
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn mapping_stats(&self, table: &str) -> StoreResult<MappingStats> {
        let state = self.state.lock().await;
        let target = state
            .tables
            .get(table)
            .ok_or_else(|| StoreError::TableMissing(table.to_string()))?;
        Ok(MappingStats {
            total: target.rows.len() as u64,
            with_store: target.rows.values().filter(|r| r.row.store.is_some()).count() as u64,
            with_person: target.rows.values().filter(|r| r.row.person.is_some()).count() as u64,
        })
    }

    async fn append_sync_log(&self, record: &SyncLogRecord) -> StoreResult<i64> {
        let mut state = self.state.lock().await;
        let id = state.logs.len() as i64 + 1;
        state.logs.push(SyncLogEntry {
            id,
            record: record.clone(),
        });
        Ok(id)
    }

    async fn recent_sync_logs(&self, source_id: Option<i64>, limit: usize) -> StoreResult<Vec<SyncLogEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .logs
            .iter()
            .rev()
            .filter(|e| source_id.is_none() || e.record.source_id == source_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use ksync_core::{RowMetadata, TextWidth};

    fn row(id: &str, value: &str) -> RowWrite {
        let mut payload = IndexMap::new();
        payload.insert("Local".to_string(), Some(value.to_string()));
        RowWrite {
            natural_id: id.to_string(),
            metadata: RowMetadata::default(),
            payload_hash: crate::row_payload_hash(&RowMetadata::default(), &payload),
            payload,
            values: vec![(
                ColumnSpec::new("Local", ColumnKind::Text(TextWidth::Bounded(5))),
                Some(value.to_string()),
            )],
        }
    }

    #[tokio::test]
    async fn bounded_text_rejects_overflow_until_widened() {
        let store = MemoryStore::new();
        store
            .create_table("t", &[ColumnSpec::new("Local", ColumnKind::Text(TextWidth::Bounded(5)))])
            .await
            .expect("create");

        let err = store.write_row("t", &row("a", "too long")).await.unwrap_err();
        assert!(matches!(err, StoreError::ValueTooLong { column: Some(ref c) } if c == "Local"));

        store
            .apply_changeset(
                "t",
                &SchemaChangeset {
                    columns_to_add: vec![],
                    columns_to_widen: vec![ksync_core::ColumnWidening {
                        column: "Local".into(),
                        from: ColumnKind::Text(TextWidth::Bounded(5)),
                        to: ColumnKind::UNBOUNDED_TEXT,
                    }],
                },
            )
            .await
            .expect("widen");
        assert_eq!(
            store.write_row("t", &row("a", "too long")).await.expect("write"),
            WriteOutcome::Inserted
        );
        assert_eq!(
            store.write_row("t", &row("a", "too long")).await.expect("write"),
            WriteOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn changesets_never_narrow_columns() {
        let store = MemoryStore::new();
        store
            .create_table("t", &[ColumnSpec::new("Local", ColumnKind::UNBOUNDED_TEXT)])
            .await
            .expect("create");
        let err = store
            .apply_changeset(
                "t",
                &SchemaChangeset {
                    columns_to_add: vec![],
                    columns_to_widen: vec![ksync_core::ColumnWidening {
                        column: "Local".into(),
                        from: ColumnKind::UNBOUNDED_TEXT,
                        to: ColumnKind::Text(TextWidth::Bounded(10)),
                    }],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Ddl { .. }));
    }

    #[tokio::test]
    async fn auto_mappings_never_replace_manual_ones() {
        let store = MemoryStore::new();
        let manual = store
            .save_value_mapping(MappingType::Store, "Escazu", "S01", MappingOrigin::Manual, "ana")
            .await
            .expect("manual");
        let auto = store
            .save_value_mapping(MappingType::Store, "Escazu", "S99", MappingOrigin::Auto, "SYSTEM")
            .await
            .expect("auto");
        assert_eq!(auto.id, manual.id);
        assert_eq!(auto.canonical_id, "S01");

        let active = store.value_mappings(Some(MappingType::Store)).await.expect("list");
        assert_eq!(active.iter().filter(|m| m.active).count(), 1);
    }

    #[tokio::test]
    async fn table_names_are_assigned_once() {
        let store = MemoryStore::new();
        let src = store
            .upsert_source(NewSource {
                id: None,
                alias: "Visitas".into(),
                connector: ConnectorSpec::Fixture { path: "rows.json".into() },
                credentials_ref: None,
                owner: None,
                active: true,
            })
            .await
            .expect("source");
        store.assign_table_name(src.id, "src_1_Visitas").await.expect("assign");
        store.assign_table_name(src.id, "src_1_Visitas").await.expect("same name is fine");
        assert!(matches!(
            store.assign_table_name(src.id, "src_1_Other").await,
            Err(StoreError::TableNameConflict { .. })
        ));
    }
}
