//! Row upserts into a materialized destination table.

use std::collections::HashMap;

use ksync_core::{
    ColumnKind, ColumnSpec, ColumnWidening, DetectedColumn, RowFields, RowMetadata,
    SchemaChangeset, TextWidth, UpsertOutcome,
};
use ksync_storage::{row_payload_hash, RowWrite, StoreError, SyncStore, WriteOutcome};
use tracing::{debug, info};

use crate::SyncError;

fn outcome_of(outcome: WriteOutcome) -> UpsertOutcome {
    match outcome {
        WriteOutcome::Inserted => UpsertOutcome::Inserted,
        WriteOutcome::Updated => UpsertOutcome::Updated,
        WriteOutcome::Unchanged => UpsertOutcome::Unchanged,
    }
}

/// Writes rows of one sync into one table, widening text columns on overflow.
pub struct UpsertEngine<'a> {
    store: &'a dyn SyncStore,
    table: String,
    columns: Vec<ColumnSpec>,
    /// Remote field name -> destination column.
    key_columns: HashMap<String, String>,
}

impl<'a> UpsertEngine<'a> {
    pub fn new(
        store: &'a dyn SyncStore,
        table: impl Into<String>,
        columns: Vec<ColumnSpec>,
        detected: &[DetectedColumn],
    ) -> Self {
        let key_columns = detected
            .iter()
            .filter_map(|d| {
                columns
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(&d.name))
                    .map(|c| (d.source_key.clone(), c.name.clone()))
            })
            .collect();
        Self {
            store,
            table: table.into(),
            columns,
            key_columns,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    fn row_write(&self, natural_id: &str, metadata: &RowMetadata, payload: &RowFields) -> RowWrite {
        let mut by_column: HashMap<&str, &str> = HashMap::new();
        for (key, value) in payload {
            let (Some(column), Some(value)) = (self.key_columns.get(key), value.as_deref()) else {
                continue;
            };
            if !value.trim().is_empty() {
                by_column.entry(column.as_str()).or_insert(value);
            }
        }
        // Every known column is written: absent values overwrite with NULL.
        let values = self
            .columns
            .iter()
            .map(|c| (c.clone(), by_column.get(c.name.as_str()).map(|v| v.to_string())))
            .collect();
        RowWrite {
            natural_id: natural_id.to_string(),
            metadata: metadata.clone(),
            payload: payload.clone(),
            payload_hash: row_payload_hash(metadata, payload),
            values,
        }
    }

    /// Insert or overwrite one row keyed by `natural_id`.
    ///
    /// Row-level problems come back as [`UpsertOutcome::Failed`]; connection and
    /// schema failures abort with an error.
    pub async fn upsert_row(
        &mut self,
        natural_id: &str,
        metadata: &RowMetadata,
        payload: &RowFields,
    ) -> Result<UpsertOutcome, SyncError> {
        if natural_id.trim().is_empty() {
            return Ok(UpsertOutcome::Failed("row has no natural id".to_string()));
        }
        let write = self.row_write(natural_id, metadata, payload);
        match self.store.write_row(&self.table, &write).await {
            Ok(outcome) => Ok(outcome_of(outcome)),
            Err(StoreError::ValueTooLong { column }) => {
                self.widen_and_retry(natural_id, metadata, payload, &write, column)
                    .await
            }
            Err(err) if err.is_row_level() => Ok(UpsertOutcome::Failed(err.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    fn overflowing(&self, write: &RowWrite, reported: Option<&str>) -> Vec<ColumnWidening> {
        write
            .values
            .iter()
            .filter_map(|(spec, value)| {
                let current = self.columns.iter().find(|c| c.name == spec.name)?;
                let ColumnKind::Text(width @ TextWidth::Bounded(_)) = current.kind else {
                    return None;
                };
                let len = value.as_deref().map(|v| v.chars().count()).unwrap_or(0);
                let overflows = !width.fits(len) || reported == Some(current.name.as_str());
                overflows.then(|| ColumnWidening {
                    column: current.name.clone(),
                    from: current.kind,
                    to: ColumnKind::UNBOUNDED_TEXT,
                })
            })
            .collect()
    }

    async fn widen_and_retry(
        &mut self,
        natural_id: &str,
        metadata: &RowMetadata,
        payload: &RowFields,
        write: &RowWrite,
        reported: Option<String>,
    ) -> Result<UpsertOutcome, SyncError> {
        let widenings = self.overflowing(write, reported.as_deref());
        if widenings.is_empty() {
            return Ok(UpsertOutcome::Failed(
                "value too long and no bounded column to widen".to_string(),
            ));
        }

        for widening in widenings {
            let changeset = SchemaChangeset {
                columns_to_add: Vec::new(),
                columns_to_widen: vec![widening.clone()],
            };
            self.store.apply_changeset(&self.table, &changeset).await?;
            if let Some(column) = self.columns.iter_mut().find(|c| c.name == widening.column) {
                column.kind = widening.to;
            }
            info!(
                table = %self.table,
                column = %widening.column,
                from = %widening.from,
                "widened column after truncation"
            );
        }

        let retry = self.row_write(natural_id, metadata, payload);
        match self.store.write_row(&self.table, &retry).await {
            Ok(outcome) => {
                debug!(table = %self.table, natural_id, "row written after widening");
                Ok(outcome_of(outcome))
            }
            Err(err) if err.is_row_level() => Ok(UpsertOutcome::Failed(format!(
                "after widening: {err}"
            ))),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksync_core::ScalarKind;
    use ksync_storage::MemoryStore;

    fn detected(name: &str) -> DetectedColumn {
        DetectedColumn {
            name: name.to_string(),
            source_key: format!("{name}?"),
            kind: ScalarKind::Text,
            max_len: 0,
            samples: vec![],
        }
    }

    fn payload(pairs: &[(&str, Option<&str>)]) -> RowFields {
        pairs
            .iter()
            .map(|(k, v)| (format!("{k}?"), v.map(ToString::to_string)))
            .collect()
    }

    async fn setup(columns: Vec<ColumnSpec>) -> MemoryStore {
        let store = MemoryStore::new();
        store.create_table("t", &columns).await.expect("create");
        store
    }

    #[tokio::test]
    async fn insert_update_and_unchanged() {
        let columns = vec![ColumnSpec::new("Local", ColumnKind::Text(TextWidth::Bounded(255)))];
        let store = setup(columns.clone()).await;
        let mut engine = UpsertEngine::new(&store, "t", columns, &[detected("Local")]);
        let meta = RowMetadata::default();

        let a = payload(&[("Local", Some("Escazu"))]);
        assert_eq!(engine.upsert_row("1", &meta, &a).await.expect("w"), UpsertOutcome::Inserted);
        assert_eq!(engine.upsert_row("1", &meta, &a).await.expect("w"), UpsertOutcome::Unchanged);
        let b = payload(&[("Local", Some("Lindora"))]);
        assert_eq!(engine.upsert_row("1", &meta, &b).await.expect("w"), UpsertOutcome::Updated);
        assert_eq!(store.column_value("t", "1", "Local").await.as_deref(), Some("Lindora"));
    }

    #[tokio::test]
    async fn absent_fields_overwrite_with_null() {
        let columns = vec![
            ColumnSpec::new("Local", ColumnKind::UNBOUNDED_TEXT),
            ColumnSpec::new("Zona", ColumnKind::UNBOUNDED_TEXT),
        ];
        let store = setup(columns.clone()).await;
        let mut engine =
            UpsertEngine::new(&store, "t", columns, &[detected("Local"), detected("Zona")]);
        let meta = RowMetadata::default();
        engine
            .upsert_row("1", &meta, &payload(&[("Local", Some("A")), ("Zona", Some("Norte"))]))
            .await
            .expect("first");
        engine
            .upsert_row("1", &meta, &payload(&[("Local", Some("A"))]))
            .await
            .expect("second");
        assert_eq!(store.column_value("t", "1", "Zona").await, None);
    }

    #[tokio::test]
    async fn overflow_widens_each_column_once_and_retries() {
        let columns = vec![
            ColumnSpec::new("Local", ColumnKind::Text(TextWidth::Bounded(4))),
            ColumnSpec::new("Zona", ColumnKind::Text(TextWidth::Bounded(4))),
            ColumnSpec::new("Nota", ColumnKind::Text(TextWidth::Bounded(4))),
        ];
        let store = setup(columns.clone()).await;
        let mut engine = UpsertEngine::new(
            &store,
            "t",
            columns,
            &[detected("Local"), detected("Zona"), detected("Nota")],
        );
        let row = payload(&[("Local", Some("Escazu")), ("Zona", Some("Norte")), ("Nota", Some("ok"))]);
        let outcome = engine
            .upsert_row("1", &RowMetadata::default(), &row)
            .await
            .expect("write");
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let ddl = store.ddl_log().await;
        assert_eq!(ddl.len(), 3, "create + one ALTER per overflowing column: {ddl:?}");
        assert_eq!(engine.columns()[2].kind, ColumnKind::Text(TextWidth::Bounded(4)));
        assert_eq!(store.column_value("t", "1", "Local").await.as_deref(), Some("Escazu"));
    }

    #[tokio::test]
    async fn type_mismatches_fail_only_the_row() {
        let columns = vec![ColumnSpec::new("Total", ColumnKind::Integer)];
        let store = setup(columns.clone()).await;
        let mut engine = UpsertEngine::new(&store, "t", columns, &[detected("Total")]);
        let outcome = engine
            .upsert_row("1", &RowMetadata::default(), &payload(&[("Total", Some("doce"))]))
            .await
            .expect("no abort");
        assert!(matches!(outcome, UpsertOutcome::Failed(_)));
        assert_eq!(store.count_rows("t").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn widening_ddl_failure_aborts() {
        let columns = vec![ColumnSpec::new("Local", ColumnKind::Text(TextWidth::Bounded(2)))];
        let store = setup(columns.clone()).await;
        store.set_fail_ddl(true);
        let mut engine = UpsertEngine::new(&store, "t", columns, &[detected("Local")]);
        let err = engine
            .upsert_row("1", &RowMetadata::default(), &payload(&[("Local", Some("Escazu"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Schema(_)));
    }
}
