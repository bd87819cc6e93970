//! Schema diffing and destination-table materialization.

use ksync_core::{
    derive_table_name, ColumnKind, ColumnSpec, ColumnWidening, DetectedColumn, SchemaChangeset,
    SourceDefinition, TextWidth, MAX_BOUNDED_TEXT_WIDTH,
};
use ksync_storage::SyncStore;
use serde::Serialize;
use tracing::{info, warn};

use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterializeReport {
    pub table: String,
    pub created: bool,
    pub added: Vec<String>,
    pub widened: Vec<ColumnWidening>,
}

/// Width for a new text column holding values up to `max_len` chars.
pub fn bounded_width_for(max_len: usize, default_width: u32) -> TextWidth {
    let needed = max_len.max(1).next_power_of_two();
    let width = needed.max(default_width as usize);
    if width > MAX_BOUNDED_TEXT_WIDTH as usize {
        TextWidth::Unbounded
    } else {
        TextWidth::Bounded(width as u32)
    }
}

pub fn spec_for_detected(column: &DetectedColumn, default_width: u32) -> ColumnSpec {
    ColumnSpec::new(
        column.name.clone(),
        ColumnKind::for_scalar(column.kind, bounded_width_for(column.max_len, default_width)),
    )
}

/// Changes needed for `existing` to hold the `detected` batch.
///
/// Never drops or narrows: missing columns are added, bounded text too narrow for
/// the batch becomes unbounded, typed columns that can no longer hold the batch
/// become unbounded text.
pub fn plan_schema(
    existing: &[ColumnSpec],
    detected: &[DetectedColumn],
    default_width: u32,
) -> SchemaChangeset {
    let mut changeset = SchemaChangeset::default();
    for column in detected {
        let desired = spec_for_detected(column, default_width);
        let Some(current) = existing
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(&column.name))
        else {
            changeset.columns_to_add.push(desired);
            continue;
        };
        let needs_widening = match current.kind {
            ColumnKind::Text(width) => !width.fits(column.max_len),
            typed => !typed.covers(&desired.kind),
        };
        if needs_widening {
            changeset.columns_to_widen.push(ColumnWidening {
                column: current.name.clone(),
                from: current.kind,
                to: ColumnKind::UNBOUNDED_TEXT,
            });
        }
    }
    changeset
}

/// Make sure `source` has a destination table able to hold `detected`.
pub async fn ensure_table(
    store: &dyn SyncStore,
    source: &SourceDefinition,
    detected: &[DetectedColumn],
    default_width: u32,
) -> Result<MaterializeReport, SyncError> {
    let table = match &source.table_name {
        Some(table) => table.clone(),
        None => {
            let table = derive_table_name(source.id, &source.alias);
            store.assign_table_name(source.id, &table).await?;
            table
        }
    };

    match store.table_columns(&table).await? {
        None => {
            if source.table_name.is_some() {
                warn!(source_id = source.id, table = %table, "registered table is missing; recreating");
            }
            let specs = detected
                .iter()
                .map(|c| spec_for_detected(c, default_width))
                .collect::<Vec<_>>();
            store.create_table(&table, &specs).await?;
            info!(source_id = source.id, table = %table, columns = specs.len(), "created destination table");
            Ok(MaterializeReport {
                table,
                created: true,
                added: specs.into_iter().map(|s| s.name).collect(),
                widened: Vec::new(),
            })
        }
        Some(existing) => {
            let changeset = plan_schema(&existing, detected, default_width);
            if !changeset.is_empty() {
                store.apply_changeset(&table, &changeset).await?;
                info!(
                    source_id = source.id,
                    table = %table,
                    added = changeset.columns_to_add.len(),
                    widened = changeset.columns_to_widen.len(),
                    "evolved destination table"
                );
            }
            Ok(MaterializeReport {
                table,
                created: false,
                added: changeset.columns_to_add.into_iter().map(|s| s.name).collect(),
                widened: changeset.columns_to_widen,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksync_core::{ConnectorSpec, NewSource, ScalarKind};
    use ksync_storage::MemoryStore;

    fn detected(name: &str, kind: ScalarKind, max_len: usize) -> DetectedColumn {
        DetectedColumn {
            name: name.to_string(),
            source_key: name.to_string(),
            kind,
            max_len,
            samples: vec![],
        }
    }

    async fn source(store: &MemoryStore) -> SourceDefinition {
        store
            .upsert_source(NewSource {
                id: Some(3),
                alias: "Visita Operativa".into(),
                connector: ConnectorSpec::Fixture { path: "rows.json".into() },
                credentials_ref: None,
                owner: None,
                active: true,
            })
            .await
            .expect("source")
    }

    #[test]
    fn widths_round_up_and_cap() {
        assert_eq!(bounded_width_for(0, 255), TextWidth::Bounded(255));
        assert_eq!(bounded_width_for(300, 255), TextWidth::Bounded(512));
        assert_eq!(bounded_width_for(4000, 255), TextWidth::Unbounded);
        assert_eq!(bounded_width_for(2048, 255), TextWidth::Bounded(2048));
    }

    #[test]
    fn plan_adds_and_widens_but_never_narrows() {
        let existing = vec![
            ColumnSpec::new("Local", ColumnKind::Text(TextWidth::Bounded(255))),
            ColumnSpec::new("Total", ColumnKind::Integer),
            ColumnSpec::new("Monto", ColumnKind::Decimal),
            ColumnSpec::new("Viejo", ColumnKind::UNBOUNDED_TEXT),
        ];
        let batch = vec![
            detected("Local", ScalarKind::Text, 300),
            detected("Total", ScalarKind::Text, 3),
            detected("Monto", ScalarKind::Integer, 2),
            detected("Nueva", ScalarKind::Integer, 2),
        ];
        let plan = plan_schema(&existing, &batch, 255);
        assert_eq!(plan.columns_to_add, vec![ColumnSpec::new("Nueva", ColumnKind::Integer)]);
        let widened = plan
            .columns_to_widen
            .iter()
            .map(|w| (w.column.as_str(), w.to))
            .collect::<Vec<_>>();
        assert_eq!(
            widened,
            vec![("Local", ColumnKind::UNBOUNDED_TEXT), ("Total", ColumnKind::UNBOUNDED_TEXT)]
        );

        // Same batch against the evolved table: nothing left to do.
        let mut evolved = existing.clone();
        evolved[0].kind = ColumnKind::UNBOUNDED_TEXT;
        evolved[1].kind = ColumnKind::UNBOUNDED_TEXT;
        evolved.push(ColumnSpec::new("Nueva", ColumnKind::Integer));
        assert!(plan_schema(&evolved, &batch, 255).is_empty());
    }

    #[tokio::test]
    async fn ensure_table_creates_once_then_evolves() {
        let store = MemoryStore::new();
        let src = source(&store).await;

        let report = ensure_table(&store, &src, &[detected("Local", ScalarKind::Text, 10)], 255)
            .await
            .expect("create");
        assert_eq!(report.table, "src_3_VisitaOperativa");
        assert!(report.created);

        let src = store.get_source(3).await.expect("get").expect("source");
        assert_eq!(src.table_name.as_deref(), Some("src_3_VisitaOperativa"));
        let report = ensure_table(
            &store,
            &src,
            &[detected("Local", ScalarKind::Text, 10), detected("Zona", ScalarKind::Text, 4)],
            255,
        )
        .await
        .expect("evolve");
        assert!(!report.created);
        assert_eq!(report.added, vec!["Zona".to_string()]);
        assert_eq!(store.ddl_log().await.len(), 2);
    }

    #[tokio::test]
    async fn ddl_failures_become_schema_errors() {
        let store = MemoryStore::new();
        let src = source(&store).await;
        store.set_fail_ddl(true);
        let err = ensure_table(&store, &src, &[detected("Local", ScalarKind::Text, 10)], 255)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Schema(_)));
    }
}
