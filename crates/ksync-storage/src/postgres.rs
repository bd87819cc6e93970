//! PostgreSQL-backed [`SyncStore`].
//!
//! Destination tables are shaped at runtime, so every statement touching them is
//! built from allow-listed identifiers and bound parameters; nothing from a remote
//! payload is ever spliced into SQL text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ksync_core::{
    control, parse_timestamp, CanonicalEntity, ColumnKind, ColumnSpec, ConnectorSpec, FieldBinding,
    MappingOrigin, MappingType, NewSource, Resolution, RowCounts, RowFields, RowMetadata,
    SchemaChangeset, SourceDefinition, SourceFieldBinding, SyncKind, SyncLogEntry, SyncLogRecord,
    SyncStatus, SyncedRow, TextWidth, ValueMapping,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};

use crate::{
    check_identifier, MappingStats, RowWrite, StoreError, StoreResult, SyncStore, ValueGroup,
    WriteOutcome,
};

const SOURCE_COLUMNS: &str = "id, alias, connector, credentials_ref, owner, table_name, active, last_synced_at, created_at";
const MAPPING_COLUMNS: &str =
    "id, mapping_type, source_value, canonical_id, origin, usage_count, active, created_by, created_at";
const SYNCED_ROW_COLUMNS: &str = r#""_natural_id", "_respondent_email", "_respondent_name", "_submitted_at", "_synced_at", "_payload", "_payload_hash", "_store_code", "_store_name", "_store_origin", "_person_id", "_person_name", "_person_origin""#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn quoted(ident: &str) -> StoreResult<String> {
    check_identifier(ident)?;
    Ok(format!("\"{ident}\""))
}

pub(crate) fn column_sql(kind: &ColumnKind) -> String {
    match kind {
        ColumnKind::Text(TextWidth::Bounded(n)) => format!("VARCHAR({n})"),
        ColumnKind::Text(TextWidth::Unbounded) => "TEXT".to_string(),
        ColumnKind::Integer => "BIGINT".to_string(),
        ColumnKind::Decimal => "NUMERIC(18,4)".to_string(),
        ColumnKind::Timestamp => "TIMESTAMPTZ".to_string(),
    }
}

fn kind_from_information_schema(data_type: &str, max_len: Option<i32>) -> Option<ColumnKind> {
    match data_type {
        "character varying" | "character" => Some(match max_len {
            Some(n) if n > 0 => ColumnKind::Text(TextWidth::Bounded(n as u32)),
            _ => ColumnKind::UNBOUNDED_TEXT,
        }),
        "text" => Some(ColumnKind::UNBOUNDED_TEXT),
        "bigint" | "integer" | "smallint" => Some(ColumnKind::Integer),
        "numeric" | "double precision" | "real" => Some(ColumnKind::Decimal),
        "timestamp with time zone" | "timestamp without time zone" | "date" => {
            Some(ColumnKind::Timestamp)
        }
        _ => None,
    }
}

/// Placeholder for a bound text parameter, cast for typed columns.
fn placeholder(index: usize, kind: &ColumnKind) -> String {
    match kind {
        // Plain assignment so over-long values raise instead of truncating.
        ColumnKind::Text(_) => format!("${index}"),
        ColumnKind::Integer => format!("${index}::BIGINT"),
        ColumnKind::Decimal => format!("${index}::NUMERIC"),
        ColumnKind::Timestamp => format!("${index}::TIMESTAMPTZ"),
    }
}

pub(crate) fn upsert_sql(table: &str, columns: &[ColumnSpec]) -> StoreResult<String> {
    let table = quoted(table)?;
    let mut names = vec![
        "\"_natural_id\"".to_string(),
        "\"_respondent_email\"".to_string(),
        "\"_respondent_name\"".to_string(),
        "\"_submitted_at\"".to_string(),
        "\"_payload\"".to_string(),
        "\"_payload_hash\"".to_string(),
    ];
    let mut values = (1..=names.len()).map(|i| format!("${i}")).collect::<Vec<_>>();
    let mut updates = names[1..]
        .iter()
        .map(|n| format!("{n} = EXCLUDED.{n}"))
        .collect::<Vec<_>>();

    for column in columns {
        let name = quoted(&column.name)?;
        values.push(placeholder(names.len() + 1, &column.kind));
        updates.push(format!("{name} = EXCLUDED.{name}"));
        names.push(name);
    }
    for reset in [
        control::STORE_CODE,
        control::STORE_NAME,
        control::STORE_ORIGIN,
        control::PERSON_ID,
        control::PERSON_NAME,
        control::PERSON_ORIGIN,
    ] {
        updates.push(format!("\"{reset}\" = NULL"));
    }
    updates.push("\"_synced_at\" = NOW()".to_string());

    Ok(format!(
        "INSERT INTO {table} AS t ({}) VALUES ({}) \
         ON CONFLICT (\"_natural_id\") DO UPDATE SET {} \
         WHERE t.\"_payload_hash\" IS DISTINCT FROM EXCLUDED.\"_payload_hash\" \
         RETURNING (xmax = 0) AS inserted",
        names.join(", "),
        values.join(", "),
        updates.join(", "),
    ))
}

fn create_table_sql(table: &str, columns: &[ColumnSpec]) -> StoreResult<String> {
    let mut defs = vec![
        "\"_row_id\" BIGSERIAL PRIMARY KEY".to_string(),
        "\"_natural_id\" TEXT NOT NULL UNIQUE".to_string(),
        "\"_respondent_email\" TEXT".to_string(),
        "\"_respondent_name\" TEXT".to_string(),
        "\"_submitted_at\" TIMESTAMPTZ".to_string(),
        "\"_synced_at\" TIMESTAMPTZ NOT NULL DEFAULT NOW()".to_string(),
        "\"_payload\" JSONB".to_string(),
        "\"_payload_hash\" TEXT".to_string(),
        "\"_store_code\" TEXT".to_string(),
        "\"_store_name\" TEXT".to_string(),
        "\"_store_origin\" VARCHAR(10)".to_string(),
        "\"_person_id\" TEXT".to_string(),
        "\"_person_name\" TEXT".to_string(),
        "\"_person_origin\" VARCHAR(10)".to_string(),
    ];
    for column in columns {
        defs.push(format!("{} {}", quoted(&column.name)?, column_sql(&column.kind)));
    }
    Ok(format!("CREATE TABLE {} ({})", quoted(table)?, defs.join(", ")))
}

fn resolution_columns(mapping_type: MappingType) -> (&'static str, &'static str, &'static str) {
    match mapping_type {
        MappingType::Store => (control::STORE_CODE, control::STORE_NAME, control::STORE_ORIGIN),
        MappingType::Person => (control::PERSON_ID, control::PERSON_NAME, control::PERSON_ORIGIN),
    }
}

/// Normalize a value for its column's parameter cast.
fn bind_value(column: &ColumnSpec, value: Option<&str>) -> StoreResult<Option<String>> {
    let Some(value) = value else {
        return Ok(None);
    };
    match column.kind {
        ColumnKind::Text(_) => Ok(Some(value.to_string())),
        ColumnKind::Integer | ColumnKind::Decimal => Ok(Some(value.trim().to_string())),
        ColumnKind::Timestamp => parse_timestamp(value)
            .map(|ts| Some(ts.to_rfc3339()))
            .ok_or_else(|| StoreError::InvalidValue {
                column: Some(column.name.clone()),
                message: format!("{value:?} is not a recognizable date"),
            }),
    }
}

fn map_row_error(table: &str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some("22001") => return StoreError::ValueTooLong { column: None },
            Some("22P02" | "22007" | "22008" | "22003") => {
                return StoreError::InvalidValue {
                    column: None,
                    message: db.message().to_string(),
                }
            }
            Some("42P01") => return StoreError::TableMissing(table.to_string()),
            _ => {}
        }
    }
    StoreError::Database(err)
}

fn map_ddl_error(table: &str, err: sqlx::Error) -> StoreError {
    StoreError::Ddl {
        table: table.to_string(),
        message: err.to_string(),
    }
}

fn parse_mapping_type(raw: &str) -> StoreResult<MappingType> {
    MappingType::parse(raw).ok_or_else(|| StoreError::Other(format!("unknown mapping type {raw:?}")))
}

fn source_from_row(row: &PgRow) -> StoreResult<SourceDefinition> {
    let connector: Json<ConnectorSpec> = row.try_get("connector")?;
    Ok(SourceDefinition {
        id: row.try_get("id")?,
        alias: row.try_get("alias")?,
        connector: connector.0,
        credentials_ref: row.try_get("credentials_ref")?,
        owner: row.try_get("owner")?,
        table_name: row.try_get("table_name")?,
        active: row.try_get("active")?,
        last_synced_at: row.try_get("last_synced_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn mapping_from_row(row: &PgRow) -> StoreResult<ValueMapping> {
    let mapping_type: String = row.try_get("mapping_type")?;
    let origin: String = row.try_get("origin")?;
    Ok(ValueMapping {
        id: row.try_get("id")?,
        mapping_type: parse_mapping_type(&mapping_type)?,
        source_value: row.try_get("source_value")?,
        canonical_id: row.try_get("canonical_id")?,
        origin: MappingOrigin::parse(&origin)
            .ok_or_else(|| StoreError::Other(format!("unknown mapping origin {origin:?}")))?,
        usage_count: row.try_get("usage_count")?,
        active: row.try_get("active")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
    })
}

fn resolution_from_row(
    row: &PgRow,
    code: &str,
    name: &str,
    origin: &str,
) -> StoreResult<Option<Resolution>> {
    let canonical_id: Option<String> = row.try_get(code)?;
    let display_name: Option<String> = row.try_get(name)?;
    let origin: Option<String> = row.try_get(origin)?;
    Ok(canonical_id.map(|canonical_id| Resolution {
        canonical_id,
        display_name,
        origin: origin
            .as_deref()
            .and_then(MappingOrigin::parse)
            .unwrap_or(MappingOrigin::Auto),
    }))
}

fn synced_row_from_row(row: &PgRow) -> StoreResult<SyncedRow> {
    let payload: Option<Json<RowFields>> = row.try_get("_payload")?;
    let payload_hash: Option<String> = row.try_get("_payload_hash")?;
    Ok(SyncedRow {
        natural_id: row.try_get("_natural_id")?,
        metadata: RowMetadata {
            submitted_at: row.try_get("_submitted_at")?,
            respondent_email: row.try_get("_respondent_email")?,
            respondent_name: row.try_get("_respondent_name")?,
        },
        synced_at: row.try_get("_synced_at")?,
        payload: payload.map(|p| p.0).unwrap_or_default(),
        payload_hash: payload_hash.unwrap_or_default(),
        store: resolution_from_row(row, control::STORE_CODE, control::STORE_NAME, control::STORE_ORIGIN)?,
        person: resolution_from_row(row, control::PERSON_ID, control::PERSON_NAME, control::PERSON_ORIGIN)?,
    })
}

fn log_from_row(row: &PgRow) -> StoreResult<SyncLogEntry> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let count = |name: &str| -> StoreResult<u64> { Ok(row.try_get::<i64, _>(name)?.max(0) as u64) };
    Ok(SyncLogEntry {
        id: row.try_get("id")?,
        record: SyncLogRecord {
            source_id: row.try_get("source_id")?,
            kind: SyncKind::parse(&kind)
                .ok_or_else(|| StoreError::Other(format!("unknown sync kind {kind:?}")))?,
            started_at: row.try_get("started_at")?,
            duration_ms: count("duration_ms")?,
            counts: RowCounts {
                processed: count("processed")?,
                inserted: count("inserted")?,
                updated: count("updated")?,
                unchanged: count("unchanged")?,
                failed: count("failed")?,
            },
            status: SyncStatus::parse(&status)
                .ok_or_else(|| StoreError::Other(format!("unknown sync status {status:?}")))?,
            error_message: row.try_get("error_message")?,
            initiated_by: row.try_get("initiated_by")?,
        },
    })
}

#[async_trait]
impl SyncStore for PgStore {
    async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("control tables migrated");
        Ok(())
    }

    async fn list_sources(&self, active_only: bool) -> StoreResult<Vec<SourceDefinition>> {
        let sql = format!(
            "SELECT {SOURCE_COLUMNS} FROM ksync_sources WHERE ($1 = FALSE OR active) ORDER BY id"
        );
        let rows = sqlx::query(&sql).bind(active_only).fetch_all(&self.pool).await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn get_source(&self, source_id: i64) -> StoreResult<Option<SourceDefinition>> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM ksync_sources WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn upsert_source(&self, source: NewSource) -> StoreResult<SourceDefinition> {
        let connector = Json(&source.connector);
        let row = match source.id {
            Some(id) => {
                let sql = format!(
                    r#"
                    INSERT INTO ksync_sources (id, alias, connector, credentials_ref, owner, active)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (id) DO UPDATE
                       SET alias = EXCLUDED.alias,
                           connector = EXCLUDED.connector,
                           credentials_ref = EXCLUDED.credentials_ref,
                           owner = EXCLUDED.owner,
                           active = EXCLUDED.active
                    RETURNING {SOURCE_COLUMNS}
                    "#
                );
                let row = sqlx::query(&sql)
                    .bind(id)
                    .bind(&source.alias)
                    .bind(connector)
                    .bind(&source.credentials_ref)
                    .bind(&source.owner)
                    .bind(source.active)
                    .fetch_one(&self.pool)
                    .await?;
                // Explicit ids bypass the sequence; keep it ahead of them.
                sqlx::query(
                    "SELECT setval(pg_get_serial_sequence('ksync_sources', 'id'), (SELECT MAX(id) FROM ksync_sources))",
                )
                .execute(&self.pool)
                .await?;
                row
            }
            None => {
                let sql = format!(
                    r#"
                    INSERT INTO ksync_sources (alias, connector, credentials_ref, owner, active)
                    VALUES ($1, $2, $3, $4, $5)
                    RETURNING {SOURCE_COLUMNS}
                    "#
                );
                sqlx::query(&sql)
                    .bind(&source.alias)
                    .bind(connector)
                    .bind(&source.credentials_ref)
                    .bind(&source.owner)
                    .bind(source.active)
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        source_from_row(&row)
    }

    async fn repoint_source(&self, source_id: i64, connector: ConnectorSpec) -> StoreResult<()> {
        let result = sqlx::query("UPDATE ksync_sources SET connector = $2 WHERE id = $1")
            .bind(source_id)
            .bind(Json(&connector))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SourceNotFound(source_id));
        }
        Ok(())
    }

    async fn set_source_active(&self, source_id: i64, active: bool) -> StoreResult<()> {
        let result = sqlx::query("UPDATE ksync_sources SET active = $2 WHERE id = $1")
            .bind(source_id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SourceNotFound(source_id));
        }
        Ok(())
    }

    async fn assign_table_name(&self, source_id: i64, table: &str) -> StoreResult<()> {
        check_identifier(table)?;
        let updated = sqlx::query(
            r#"
            UPDATE ksync_sources
               SET table_name = $2
             WHERE id = $1
               AND (table_name IS NULL OR table_name = $2)
            RETURNING id
            "#,
        )
        .bind(source_id)
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;
        if updated.is_some() {
            return Ok(());
        }
        match self.get_source(source_id).await? {
            None => Err(StoreError::SourceNotFound(source_id)),
            Some(source) => Err(StoreError::TableNameConflict {
                source_id,
                existing: source.table_name.unwrap_or_default(),
            }),
        }
    }

    async fn mark_source_synced(&self, source_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE ksync_sources SET last_synced_at = $2 WHERE id = $1")
            .bind(source_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn table_columns(&self, table: &str) -> StoreResult<Option<Vec<ColumnSpec>>> {
        check_identifier(table)?;
        let rows = sqlx::query(
            r#"
            SELECT column_name::TEXT AS column_name,
                   data_type::TEXT AS data_type,
                   character_maximum_length::INT4 AS max_len
              FROM information_schema.columns
             WHERE table_schema = current_schema()
               AND table_name = $1
             ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut columns = Vec::new();
        for row in rows {
            let name: String = row.try_get("column_name")?;
            if control::ALL.contains(&name.as_str()) {
                continue;
            }
            let data_type: String = row.try_get("data_type")?;
            let max_len: Option<i32> = row.try_get("max_len")?;
            let kind = kind_from_information_schema(&data_type, max_len)
                .unwrap_or(ColumnKind::UNBOUNDED_TEXT);
            columns.push(ColumnSpec { name, kind });
        }
        Ok(Some(columns))
    }

    async fn create_table(&self, table: &str, columns: &[ColumnSpec]) -> StoreResult<()> {
        let ddl = create_table_sql(table, columns)?;
        debug!(table, columns = columns.len(), "creating destination table");
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|err| map_ddl_error(table, err))?;
        Ok(())
    }

    async fn apply_changeset(&self, table: &str, changeset: &SchemaChangeset) -> StoreResult<()> {
        let quoted_table = quoted(table)?;
        let current = self
            .table_columns(table)
            .await?
            .ok_or_else(|| StoreError::TableMissing(table.to_string()))?;

        let mut statements = Vec::new();
        for column in &changeset.columns_to_add {
            statements.push(format!(
                "ALTER TABLE {quoted_table} ADD COLUMN IF NOT EXISTS {} {}",
                quoted(&column.name)?,
                column_sql(&column.kind)
            ));
        }
        for widening in &changeset.columns_to_widen {
            let existing = current
                .iter()
                .find(|c| c.name == widening.column)
                .ok_or_else(|| StoreError::Ddl {
                    table: table.to_string(),
                    message: format!("column {} does not exist", widening.column),
                })?;
            if !widening.to.covers(&existing.kind) {
                return Err(StoreError::Ddl {
                    table: table.to_string(),
                    message: format!("refusing to narrow {} to {}", widening.column, widening.to),
                });
            }
            let column = quoted(&widening.column)?;
            let sql_type = column_sql(&widening.to);
            statements.push(format!(
                "ALTER TABLE {quoted_table} ALTER COLUMN {column} TYPE {sql_type} USING {column}::{sql_type}"
            ));
        }

        let mut tx = self.pool.begin().await?;
        for statement in &statements {
            debug!(table, statement = %statement, "applying schema change");
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|err| map_ddl_error(table, err))?;
        }
        tx.commit().await.map_err(|err| map_ddl_error(table, err))?;
        Ok(())
    }

    async fn write_row(&self, table: &str, row: &RowWrite) -> StoreResult<WriteOutcome> {
        let columns = row.values.iter().map(|(c, _)| c.clone()).collect::<Vec<_>>();
        let sql = upsert_sql(table, &columns)?;

        let mut query = sqlx::query(&sql)
            .bind(&row.natural_id)
            .bind(&row.metadata.respondent_email)
            .bind(&row.metadata.respondent_name)
            .bind(row.metadata.submitted_at)
            .bind(Json(&row.payload))
            .bind(&row.payload_hash);
        for (column, value) in &row.values {
            query = query.bind(bind_value(column, value.as_deref())?);
        }

        let returned = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| map_row_error(table, err))?;
        match returned {
            None => Ok(WriteOutcome::Unchanged),
            Some(r) if r.try_get::<bool, _>("inserted")? => Ok(WriteOutcome::Inserted),
            Some(_) => Ok(WriteOutcome::Updated),
        }
    }

    async fn get_row(&self, table: &str, natural_id: &str) -> StoreResult<Option<SyncedRow>> {
        let sql = format!(
            "SELECT {SYNCED_ROW_COLUMNS} FROM {} WHERE \"_natural_id\" = $1",
            quoted(table)?
        );
        let row = sqlx::query(&sql)
            .bind(natural_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| map_row_error(table, err))?;
        row.as_ref().map(synced_row_from_row).transpose()
    }

    async fn list_rows(&self, table: &str, limit: usize) -> StoreResult<Vec<SyncedRow>> {
        let sql = format!(
            "SELECT {SYNCED_ROW_COLUMNS} FROM {} ORDER BY \"_row_id\" LIMIT $1",
            quoted(table)?
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| map_row_error(table, err))?;
        rows.iter().map(synced_row_from_row).collect()
    }

    async fn count_rows(&self, table: &str) -> StoreResult<u64> {
        let sql = format!("SELECT COUNT(*) AS n FROM {}", quoted(table)?);
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| map_row_error(table, err))?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    async fn field_bindings(&self, source_id: i64) -> StoreResult<Vec<SourceFieldBinding>> {
        let rows = sqlx::query(
            r#"
            SELECT source_id, mapping_type, column_name, updated_by
              FROM ksync_field_bindings
             WHERE source_id = $1
             ORDER BY mapping_type
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mapping_type: String = row.try_get("mapping_type")?;
            let column: Option<String> = row.try_get("column_name")?;
            out.push(SourceFieldBinding {
                source_id: row.try_get("source_id")?,
                mapping_type: parse_mapping_type(&mapping_type)?,
                binding: column.map(FieldBinding::Column).unwrap_or(FieldBinding::Disabled),
                updated_by: row.try_get("updated_by")?,
            });
        }
        Ok(out)
    }

    async fn set_field_binding(&self, binding: &SourceFieldBinding) -> StoreResult<()> {
        let column = match &binding.binding {
            FieldBinding::Column(name) => {
                check_identifier(name)?;
                Some(name.as_str())
            }
            FieldBinding::Disabled => None,
        };
        sqlx::query(
            r#"
            INSERT INTO ksync_field_bindings (source_id, mapping_type, column_name, updated_by)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source_id, mapping_type) DO UPDATE
               SET column_name = EXCLUDED.column_name,
                   updated_by = EXCLUDED.updated_by,
                   updated_at = NOW()
            "#,
        )
        .bind(binding.source_id)
        .bind(binding.mapping_type.as_str())
        .bind(column)
        .bind(&binding.updated_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_field_binding(&self, source_id: i64, mapping_type: MappingType) -> StoreResult<()> {
        sqlx::query("DELETE FROM ksync_field_bindings WHERE source_id = $1 AND mapping_type = $2")
            .bind(source_id)
            .bind(mapping_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn canonical_entities(&self, mapping_type: MappingType) -> StoreResult<Vec<CanonicalEntity>> {
        let rows = sqlx::query(
            r#"
            SELECT canonical_id, display_name, email, active
              FROM ksync_canonical_entities
             WHERE mapping_type = $1
             ORDER BY canonical_id
            "#,
        )
        .bind(mapping_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(CanonicalEntity {
                mapping_type,
                canonical_id: row.try_get("canonical_id")?,
                display_name: row.try_get("display_name")?,
                email: row.try_get("email")?,
                active: row.try_get("active")?,
            });
        }
        Ok(out)
    }

    async fn upsert_canonical_entity(&self, entity: &CanonicalEntity) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ksync_canonical_entities (mapping_type, canonical_id, display_name, email, active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (mapping_type, canonical_id) DO UPDATE
               SET display_name = EXCLUDED.display_name,
                   email = EXCLUDED.email,
                   active = EXCLUDED.active
            "#,
        )
        .bind(entity.mapping_type.as_str())
        .bind(&entity.canonical_id)
        .bind(&entity.display_name)
        .bind(&entity.email)
        .bind(entity.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_value_mapping(
        &self,
        mapping_type: MappingType,
        source_value: &str,
    ) -> StoreResult<Option<ValueMapping>> {
        let sql = format!(
            "SELECT {MAPPING_COLUMNS} FROM ksync_value_mappings \
             WHERE mapping_type = $1 AND source_value = $2 AND active"
        );
        let row = sqlx::query(&sql)
            .bind(mapping_type.as_str())
            .bind(source_value)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(mapping_from_row).transpose()
    }

    async fn value_mappings(&self, mapping_type: Option<MappingType>) -> StoreResult<Vec<ValueMapping>> {
        let sql = format!(
            "SELECT {MAPPING_COLUMNS} FROM ksync_value_mappings \
             WHERE ($1::TEXT IS NULL OR mapping_type = $1) \
             ORDER BY mapping_type, source_value, id"
        );
        let rows = sqlx::query(&sql)
            .bind(mapping_type.map(|t| t.as_str()))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(mapping_from_row).collect()
    }

    async fn save_value_mapping(
        &self,
        mapping_type: MappingType,
        source_value: &str,
        canonical_id: &str,
        origin: MappingOrigin,
        created_by: &str,
    ) -> StoreResult<ValueMapping> {
        let mut tx = self.pool.begin().await?;
        let select = format!(
            "SELECT {MAPPING_COLUMNS} FROM ksync_value_mappings \
             WHERE mapping_type = $1 AND source_value = $2 AND active FOR UPDATE"
        );
        let existing = sqlx::query(&select)
            .bind(mapping_type.as_str())
            .bind(source_value)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(mapping_from_row)
            .transpose()?;

        if let Some(existing) = existing {
            let keeps_manual = existing.origin == MappingOrigin::Manual && origin == MappingOrigin::Auto;
            let identical = existing.origin == origin && existing.canonical_id == canonical_id;
            if keeps_manual || identical {
                tx.commit().await?;
                return Ok(existing);
            }
            sqlx::query("UPDATE ksync_value_mappings SET active = FALSE WHERE id = $1")
                .bind(existing.id)
                .execute(&mut *tx)
                .await?;
        }

        let insert = format!(
            r#"
            INSERT INTO ksync_value_mappings (mapping_type, source_value, canonical_id, origin, created_by)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {MAPPING_COLUMNS}
            "#
        );
        let row = sqlx::query(&insert)
            .bind(mapping_type.as_str())
            .bind(source_value)
            .bind(canonical_id)
            .bind(origin.as_str())
            .bind(created_by)
            .fetch_one(&mut *tx)
            .await?;
        let saved = mapping_from_row(&row)?;
        tx.commit().await?;
        Ok(saved)
    }

    async fn deactivate_value_mapping(&self, mapping_id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE ksync_value_mappings SET active = FALSE WHERE id = $1")
            .bind(mapping_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bump_mapping_usage(&self, mapping_id: i64, by: u64) -> StoreResult<()> {
        sqlx::query("UPDATE ksync_value_mappings SET usage_count = usage_count + $2 WHERE id = $1")
            .bind(mapping_id)
            .bind(by as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn value_groups(
        &self,
        table: &str,
        column: &str,
        mapping_type: MappingType,
    ) -> StoreResult<Vec<ValueGroup>> {
        let (code, name, origin) = resolution_columns(mapping_type);
        let column = quoted(column)?;
        let sql = format!(
            r#"
            SELECT btrim({column}::TEXT) AS source_value,
                   "{code}" AS canonical_id,
                   "{name}" AS display_name,
                   "{origin}" AS origin,
                   COUNT(*) AS n
              FROM {}
             WHERE {column} IS NOT NULL AND btrim({column}::TEXT) <> ''
             GROUP BY 1, 2, 3, 4
             ORDER BY n DESC, source_value
            "#,
            quoted(table)?
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| map_row_error(table, err))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ValueGroup {
                source_value: row.try_get("source_value")?,
                resolution: resolution_from_row(&row, "canonical_id", "display_name", "origin")?,
                rows: row.try_get::<i64, _>("n")? as u64,
            });
        }
        Ok(out)
    }

    async fn set_row_resolution(
        &self,
        table: &str,
        column: &str,
        mapping_type: MappingType,
        source_value: &str,
        resolution: &Resolution,
    ) -> StoreResult<u64> {
        let (code, name, origin) = resolution_columns(mapping_type);
        let column = quoted(column)?;
        let guard = match resolution.origin {
            MappingOrigin::Auto => format!(" AND (\"{origin}\" IS NULL OR \"{origin}\" <> 'MANUAL')"),
            MappingOrigin::Manual => String::new(),
        };
        let sql = format!(
            "UPDATE {} SET \"{code}\" = $2, \"{name}\" = $3, \"{origin}\" = $4 \
             WHERE btrim({column}::TEXT) = $1{guard}",
            quoted(table)?
        );
        let result = sqlx::query(&sql)
            .bind(source_value)
            .bind(&resolution.canonical_id)
            .bind(&resolution.display_name)
            .bind(resolution.origin.as_str())
            .execute(&self.pool)
            .await
            .map_err(|err| map_row_error(table, err))?;
        Ok(result.rows_affected())
    }

    async fn clear_row_resolution(
        &self,
        table: &str,
        column: &str,
        mapping_type: MappingType,
        source_value: &str,
    ) -> StoreResult<u64> {
        let (code, name, origin) = resolution_columns(mapping_type);
        let column = quoted(column)?;
        let sql = format!(
            "UPDATE {} SET \"{code}\" = NULL, \"{name}\" = NULL, \"{origin}\" = NULL \
             WHERE btrim({column}::TEXT) = $1 AND \"{code}\" IS NOT NULL",
            quoted(table)?
        );
        let result = sqlx::query(&sql)
            .bind(source_value)
            .execute(&self.pool)
            .await
            .map_err(|err| map_row_error(table, err))?;
        Ok(result.rows_affected())
    }

    async fn mapping_stats(&self, table: &str) -> StoreResult<MappingStats> {
        let sql = format!(
            "SELECT COUNT(*) AS total, COUNT(\"_store_code\") AS with_store, COUNT(\"_person_id\") AS with_person FROM {}",
            quoted(table)?
        );
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| map_row_error(table, err))?;
        Ok(MappingStats {
            total: row.try_get::<i64, _>("total")? as u64,
            with_store: row.try_get::<i64, _>("with_store")? as u64,
            with_person: row.try_get::<i64, _>("with_person")? as u64,
        })
    }

    async fn append_sync_log(&self, record: &SyncLogRecord) -> StoreResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO ksync_sync_log
                (source_id, kind, started_at, duration_ms, processed, inserted, updated,
                 unchanged, failed, status, error_message, initiated_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            "#,
        )
        .bind(record.source_id)
        .bind(record.kind.as_str())
        .bind(record.started_at)
        .bind(record.duration_ms as i64)
        .bind(record.counts.processed as i64)
        .bind(record.counts.inserted as i64)
        .bind(record.counts.updated as i64)
        .bind(record.counts.unchanged as i64)
        .bind(record.counts.failed as i64)
        .bind(record.status.as_str())
        .bind(&record.error_message)
        .bind(&record.initiated_by)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn recent_sync_logs(&self, source_id: Option<i64>, limit: usize) -> StoreResult<Vec<SyncLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_id, kind, started_at, duration_ms, processed, inserted, updated,
                   unchanged, failed, status, error_message, initiated_by
              FROM ksync_sync_log
             WHERE ($1::BIGINT IS NULL OR source_id = $1)
             ORDER BY started_at DESC, id DESC
             LIMIT $2
            "#,
        )
        .bind(source_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_types_map_to_postgres() {
        assert_eq!(column_sql(&ColumnKind::Text(TextWidth::Bounded(255))), "VARCHAR(255)");
        assert_eq!(column_sql(&ColumnKind::UNBOUNDED_TEXT), "TEXT");
        assert_eq!(column_sql(&ColumnKind::Decimal), "NUMERIC(18,4)");
        assert_eq!(
            kind_from_information_schema("character varying", Some(64)),
            Some(ColumnKind::Text(TextWidth::Bounded(64)))
        );
        assert_eq!(
            kind_from_information_schema("timestamp with time zone", None),
            Some(ColumnKind::Timestamp)
        );
    }

    #[test]
    fn upsert_statement_only_rewrites_changed_payloads() {
        let sql = upsert_sql(
            "src_1_Visitas",
            &[
                ColumnSpec::new("Local", ColumnKind::Text(TextWidth::Bounded(255))),
                ColumnSpec::new("Total", ColumnKind::Integer),
            ],
        )
        .expect("sql");
        assert!(sql.starts_with("INSERT INTO \"src_1_Visitas\" AS t"));
        assert!(sql.contains("$7, $8::BIGINT"));
        assert!(sql.contains("\"_store_code\" = NULL"));
        assert!(sql.contains("WHERE t.\"_payload_hash\" IS DISTINCT FROM EXCLUDED.\"_payload_hash\""));
        assert!(sql.ends_with("RETURNING (xmax = 0) AS inserted"));
    }

    #[test]
    fn unsafe_identifiers_never_reach_sql() {
        assert!(matches!(
            upsert_sql("t", &[ColumnSpec::new("a\"b", ColumnKind::UNBOUNDED_TEXT)]),
            Err(StoreError::UnsafeIdentifier(_))
        ));
        assert!(create_table_sql("x; DROP", &[]).is_err());
    }

    #[test]
    fn timestamps_are_normalized_before_binding() {
        let column = ColumnSpec::new("Fecha", ColumnKind::Timestamp);
        let bound = bind_value(&column, Some("24/02/2026")).expect("bind");
        assert_eq!(bound.as_deref(), Some("2026-02-24T00:00:00+00:00"));
        assert!(matches!(
            bind_value(&column, Some("soon")),
            Err(StoreError::InvalidValue { .. })
        ));
    }
}
