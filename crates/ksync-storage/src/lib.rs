//! Destination store + HTTP fetch utilities for KSYNC.
//!
//! [`SyncStore`] is the seam between the sync engine and the database that holds
//! source registrations, the dynamically shaped per-source tables, value mappings
//! and the sync log. [`PgStore`] talks to PostgreSQL; [`MemoryStore`] keeps the same
//! semantics in process for tests and dry runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ksync_core::{
    is_safe_identifier, CanonicalEntity, ColumnSpec, ConnectorSpec, MappingOrigin, MappingType,
    NewSource, Resolution, RowFields, RowMetadata, SchemaChangeset, SourceDefinition,
    SourceFieldBinding, SyncLogEntry, SyncLogRecord, SyncedRow, ValueMapping,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

mod http;
mod memory;
mod postgres;

pub use http::{classify_reqwest_error, classify_status, FetchError, HttpClientConfig, HttpFetcher, Transience};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "ksync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identifier {0:?} is not allow-listed ([A-Za-z0-9_]+)")]
    UnsafeIdentifier(String),
    #[error("table {0} does not exist")]
    TableMissing(String),
    #[error("source {0} not found")]
    SourceNotFound(i64),
    #[error("source {source_id} already owns table {existing}")]
    TableNameConflict { source_id: i64, existing: String },
    #[error("value too long for column {}", column.as_deref().unwrap_or("<unknown>"))]
    ValueTooLong { column: Option<String> },
    #[error("invalid value for column {}: {message}", column.as_deref().unwrap_or("<unknown>"))]
    InvalidValue {
        column: Option<String>,
        message: String,
    },
    #[error("schema change on {table} failed: {message}")]
    Ddl { table: String, message: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Errors caused by one row's data rather than by the schema or the connection.
    pub fn is_row_level(&self) -> bool {
        matches!(self, Self::ValueTooLong { .. } | Self::InvalidValue { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything the store needs to insert or overwrite one destination row.
#[derive(Debug, Clone)]
pub struct RowWrite {
    pub natural_id: String,
    pub metadata: RowMetadata,
    pub payload: RowFields,
    pub payload_hash: String,
    /// One entry per user column of the table, `None` for values the row lacks.
    pub values: Vec<(ColumnSpec, Option<String>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Inserted,
    Updated,
    /// Stored payload hash already matches; nothing was written.
    Unchanged,
}

/// Rows sharing one trimmed source value and one resolution state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueGroup {
    pub source_value: String,
    pub resolution: Option<Resolution>,
    pub rows: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MappingStats {
    pub total: u64,
    pub with_store: u64,
    pub with_person: u64,
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Create the control tables when missing.
    async fn migrate(&self) -> StoreResult<()>;

    async fn list_sources(&self, active_only: bool) -> StoreResult<Vec<SourceDefinition>>;
    async fn get_source(&self, source_id: i64) -> StoreResult<Option<SourceDefinition>>;
    /// Register a source, or update an existing one (same id) without touching its table name.
    async fn upsert_source(&self, source: NewSource) -> StoreResult<SourceDefinition>;
    async fn repoint_source(&self, source_id: i64, connector: ConnectorSpec) -> StoreResult<()>;
    async fn set_source_active(&self, source_id: i64, active: bool) -> StoreResult<()>;
    /// Record the destination table; refuses to replace an already assigned name.
    async fn assign_table_name(&self, source_id: i64, table: &str) -> StoreResult<()>;
    async fn mark_source_synced(&self, source_id: i64, at: DateTime<Utc>) -> StoreResult<()>;

    /// User columns of `table` in ordinal order, `None` when the table does not exist.
    async fn table_columns(&self, table: &str) -> StoreResult<Option<Vec<ColumnSpec>>>;
    async fn create_table(&self, table: &str, columns: &[ColumnSpec]) -> StoreResult<()>;
    /// Apply the whole changeset or nothing.
    async fn apply_changeset(&self, table: &str, changeset: &SchemaChangeset) -> StoreResult<()>;

    async fn write_row(&self, table: &str, row: &RowWrite) -> StoreResult<WriteOutcome>;
    async fn get_row(&self, table: &str, natural_id: &str) -> StoreResult<Option<SyncedRow>>;
    async fn list_rows(&self, table: &str, limit: usize) -> StoreResult<Vec<SyncedRow>>;
    async fn count_rows(&self, table: &str) -> StoreResult<u64>;

    async fn field_bindings(&self, source_id: i64) -> StoreResult<Vec<SourceFieldBinding>>;
    async fn set_field_binding(&self, binding: &SourceFieldBinding) -> StoreResult<()>;
    async fn delete_field_binding(&self, source_id: i64, mapping_type: MappingType) -> StoreResult<()>;

    async fn canonical_entities(&self, mapping_type: MappingType) -> StoreResult<Vec<CanonicalEntity>>;
    async fn upsert_canonical_entity(&self, entity: &CanonicalEntity) -> StoreResult<()>;

    async fn active_value_mapping(
        &self,
        mapping_type: MappingType,
        source_value: &str,
    ) -> StoreResult<Option<ValueMapping>>;
    async fn value_mappings(&self, mapping_type: Option<MappingType>) -> StoreResult<Vec<ValueMapping>>;
    /// Save the active mapping for `(mapping_type, source_value)`.
    ///
    /// At most one mapping per pair stays active. An automatic mapping never
    /// replaces a manual one: the existing manual mapping is returned instead.
    async fn save_value_mapping(
        &self,
        mapping_type: MappingType,
        source_value: &str,
        canonical_id: &str,
        origin: MappingOrigin,
        created_by: &str,
    ) -> StoreResult<ValueMapping>;
    async fn deactivate_value_mapping(&self, mapping_id: i64) -> StoreResult<()>;
    async fn bump_mapping_usage(&self, mapping_id: i64, by: u64) -> StoreResult<()>;

    /// Group non-blank values of `column` by trimmed value and current resolution.
    async fn value_groups(
        &self,
        table: &str,
        column: &str,
        mapping_type: MappingType,
    ) -> StoreResult<Vec<ValueGroup>>;
    /// Attach `resolution` to rows whose trimmed `column` equals `source_value`.
    ///
    /// Automatic resolutions skip rows already resolved manually; manual ones
    /// overwrite every matching row.
    async fn set_row_resolution(
        &self,
        table: &str,
        column: &str,
        mapping_type: MappingType,
        source_value: &str,
        resolution: &Resolution,
    ) -> StoreResult<u64>;
    async fn clear_row_resolution(
        &self,
        table: &str,
        column: &str,
        mapping_type: MappingType,
        source_value: &str,
    ) -> StoreResult<u64>;
    async fn mapping_stats(&self, table: &str) -> StoreResult<MappingStats>;

    async fn append_sync_log(&self, record: &SyncLogRecord) -> StoreResult<i64>;
    async fn recent_sync_logs(&self, source_id: Option<i64>, limit: usize) -> StoreResult<Vec<SyncLogEntry>>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content hash of a row as the upsert engine sees it.
///
/// Field order is irrelevant: a remote reordering its columns is not a change.
pub fn row_payload_hash(metadata: &RowMetadata, payload: &RowFields) -> String {
    let sorted: BTreeMap<&str, Option<&str>> = payload
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_deref()))
        .collect();
    let canonical = serde_json::json!({
        "metadata": metadata,
        "payload": sorted,
    });
    sha256_hex(canonical.to_string().as_bytes())
}

pub(crate) fn check_identifier(ident: &str) -> StoreResult<()> {
    if is_safe_identifier(ident) {
        Ok(())
    } else {
        Err(StoreError::UnsafeIdentifier(ident.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn payload_hash_ignores_field_order_but_not_values() {
        let meta = RowMetadata::default();
        let mut a: RowFields = IndexMap::new();
        a.insert("x".into(), Some("1".into()));
        a.insert("y".into(), None);
        let mut b: RowFields = IndexMap::new();
        b.insert("y".into(), None);
        b.insert("x".into(), Some("1".into()));
        assert_eq!(row_payload_hash(&meta, &a), row_payload_hash(&meta, &b));

        b.insert("x".into(), Some("2".into()));
        assert_ne!(row_payload_hash(&meta, &a), row_payload_hash(&meta, &b));
    }

    #[test]
    fn identifiers_outside_the_allow_list_are_rejected() {
        assert!(check_identifier("src_1_Visitas").is_ok());
        assert!(matches!(
            check_identifier("src\"; DROP"),
            Err(StoreError::UnsafeIdentifier(_))
        ));
    }
}
