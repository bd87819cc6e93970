//! Sync engine: schema detection, table materialization, upserts, value
//! mapping resolution and the pipeline/scheduler that drives them.

use ksync_adapters::AdapterError;
use ksync_storage::StoreError;
use thiserror::Error;

mod config;
mod detect;
mod pipeline;
mod registry;
mod resolver;
mod schema;
mod upsert;

pub use config::{ResolverConfig, SyncConfig};
pub use detect::{column_target, detect_columns, route_control_fields, ColumnTarget, MAX_COLUMN_NAME_LEN};
pub use pipeline::{
    build_scheduler, AdapterFactory, FullSyncSummary, SourceFailure, SyncPipeline, SyncResult,
};
pub use registry::{import_registry, load_registry, AliasEntry, ImportSummary, Registry};
pub use resolver::{
    detect_binding_column, match_against_entities, MappingResolver, MatchOutcome, ResolveSummary,
    Suggestion, UnmappedValue,
};
pub use schema::{bounded_width_for, ensure_table, plan_schema, spec_for_detected, MaterializeReport};
pub use upsert::UpsertEngine;

pub const CRATE_NAME: &str = "ksync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source {0} not found")]
    SourceNotFound(i64),
    #[error("source {0} is already being synchronized")]
    AlreadyRunning(i64),
    #[error("remote source failed ({}): {message}", transience_label(.transient))]
    Remote { transient: bool, message: String },
    #[error("schema change failed: {0}")]
    Schema(String),
    #[error(transparent)]
    Store(StoreError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

fn transience_label(transient: &bool) -> &'static str {
    if *transient {
        "transient"
    } else {
        "permanent"
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Ddl { .. } => Self::Schema(err.to_string()),
            other => Self::Store(other),
        }
    }
}

impl From<AdapterError> for SyncError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Credentials(message) => Self::Config(message),
            other => Self::Remote {
                transient: other.is_transient(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_failures_surface_as_schema_errors() {
        let err: SyncError = StoreError::Ddl {
            table: "src_1".into(),
            message: "permission denied".into(),
        }
        .into();
        assert!(matches!(err, SyncError::Schema(ref m) if m.contains("permission denied")));

        let err: SyncError = StoreError::SourceNotFound(4).into();
        assert!(matches!(err, SyncError::Store(_)));
    }

    #[test]
    fn adapter_errors_keep_their_transience() {
        let err: SyncError = AdapterError::Message("boom".into()).into();
        assert!(matches!(err, SyncError::Remote { transient: false, .. }));
        assert_eq!(err.to_string(), "remote source failed (permanent): boom");

        let err: SyncError = AdapterError::Credentials("FORMS_CLIENT_ID is not set".into()).into();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
