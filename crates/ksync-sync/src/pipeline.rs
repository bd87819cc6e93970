use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ksync_adapters::{adapter_for_source, AdapterContext, SourceAdapter, TokenCache};
use ksync_core::{
    ConnectorSpec, NewSource, RowCounts, SourceDefinition, SyncKind, SyncLogEntry, SyncLogRecord, SyncStatus, UpsertOutcome,
};
use ksync_storage::{HttpClientConfig, HttpFetcher, SyncStore};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    detect_columns, ensure_table, route_control_fields, MappingResolver, MaterializeReport,
    ResolveSummary, SyncConfig, SyncError, UpsertEngine,
};

/// Builds the adapter for a source; swapped out in tests.
pub type AdapterFactory = Arc<dyn Fn(&SourceDefinition) -> Box<dyn SourceAdapter> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub run_id: Uuid,
    pub source_id: i64,
    pub alias: String,
    pub kind: SyncKind,
    /// `None` when the source returned nothing and no table exists yet.
    pub table: Option<String>,
    pub counts: RowCounts,
    pub materialize: Option<MaterializeReport>,
    pub mappings: Option<ResolveSummary>,
    pub log_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub source_id: i64,
    pub alias: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FullSyncSummary {
    pub kind: SyncKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<SyncResult>,
    pub failures: Vec<SourceFailure>,
}

impl FullSyncSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

struct SourceRun {
    table: Option<String>,
    materialize: Option<MaterializeReport>,
    mappings: Option<ResolveSummary>,
}

/// Releases a source's in-flight slot when the sync ends, however it ends.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<i64>>,
    source_id: i64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.source_id);
    }
}

struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn SyncStore>,
    http: HttpFetcher,
    tokens: Arc<TokenCache>,
    adapters: AdapterFactory,
    in_flight: Mutex<HashSet<i64>>,
    tick_running: AtomicBool,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn SyncStore>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })
        .context("building http client")?;
        Ok(Self {
            config,
            store,
            http,
            tokens: Arc::new(TokenCache::new()),
            adapters: Arc::new(|source: &SourceDefinition| adapter_for_source(source)),
            in_flight: Mutex::new(HashSet::new()),
            tick_running: AtomicBool::new(false),
        })
    }

    pub fn with_adapter_factory(mut self, adapters: AdapterFactory) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    pub fn resolver(&self) -> MappingResolver {
        MappingResolver::new(self.store.clone(), self.config.resolver)
    }

    pub async fn register_source(&self, source: NewSource) -> Result<SourceDefinition, SyncError> {
        if source.alias.trim().is_empty() {
            return Err(SyncError::InvalidInput("source alias is empty".to_string()));
        }
        let saved = self.store.upsert_source(source).await?;
        info!(source_id = saved.id, alias = %saved.alias, connector = saved.connector.kind(), "registered source");
        Ok(saved)
    }

    /// Point a source at a new connector. The destination table stays the same.
    pub async fn repoint_source(&self, source_id: i64, connector: ConnectorSpec) -> Result<(), SyncError> {
        self.require_source(source_id).await?;
        let kind = connector.kind();
        self.store.repoint_source(source_id, connector).await?;
        info!(source_id, connector = kind, "repointed source");
        Ok(())
    }

    /// Sources are never deleted, only switched off.
    pub async fn set_source_active(&self, source_id: i64, active: bool) -> Result<(), SyncError> {
        self.require_source(source_id).await?;
        self.store.set_source_active(source_id, active).await?;
        info!(source_id, active, "changed source state");
        Ok(())
    }

    async fn require_source(&self, source_id: i64) -> Result<SourceDefinition, SyncError> {
        self.store
            .get_source(source_id)
            .await?
            .ok_or(SyncError::SourceNotFound(source_id))
    }

    fn claim(&self, source_id: i64) -> Result<InFlightGuard<'_>, SyncError> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(source_id) {
            return Err(SyncError::AlreadyRunning(source_id));
        }
        Ok(InFlightGuard {
            in_flight: &self.in_flight,
            source_id,
        })
    }

    /// Fetch, materialize, upsert and resolve one source, then log the attempt.
    ///
    /// A second call for a source that is still running fails with
    /// [`SyncError::AlreadyRunning`] without touching anything.
    pub async fn sync_source(
        &self,
        source_id: i64,
        kind: SyncKind,
        initiated_by: &str,
    ) -> Result<SyncResult, SyncError> {
        let _slot = self.claim(source_id)?;
        let source = self.require_source(source_id).await?;

        let run_id = Uuid::new_v4();
        let span = info_span!("sync_source", source_id, alias = %source.alias, %run_id, kind = kind.as_str());
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut counts = RowCounts::default();

        let outcome = self
            .run_source(&source, kind, started_at, &mut counts)
            .instrument(span.clone())
            .await;

        let record = SyncLogRecord {
            source_id: Some(source_id),
            kind,
            started_at,
            duration_ms: whole_millis(clock.elapsed()),
            counts,
            status: if outcome.is_ok() {
                SyncStatus::Success
            } else {
                SyncStatus::Error
            },
            error_message: outcome.as_ref().err().map(ToString::to_string),
            initiated_by: initiated_by.to_string(),
        };
        let log_id = self.append_log(&record).instrument(span.clone()).await;

        match outcome {
            Ok(run) => {
                info!(
                    source_id,
                    processed = counts.processed,
                    inserted = counts.inserted,
                    updated = counts.updated,
                    unchanged = counts.unchanged,
                    failed = counts.failed,
                    duration_ms = record.duration_ms,
                    "sync finished"
                );
                Ok(SyncResult {
                    run_id,
                    source_id,
                    alias: source.alias,
                    kind,
                    table: run.table,
                    counts,
                    materialize: run.materialize,
                    mappings: run.mappings,
                    log_id,
                })
            }
            Err(err) => {
                warn!(source_id, error = %err, "sync failed");
                Err(err)
            }
        }
    }

    async fn append_log(&self, record: &SyncLogRecord) -> Option<i64> {
        match self.store.append_sync_log(record).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(error = %err, "could not write sync log entry");
                None
            }
        }
    }

    async fn run_source(
        &self,
        source: &SourceDefinition,
        kind: SyncKind,
        started_at: DateTime<Utc>,
        counts: &mut RowCounts,
    ) -> Result<SourceRun, SyncError> {
        let since = match kind {
            SyncKind::Incremental => source.last_synced_at,
            SyncKind::Full | SyncKind::Manual => None,
        };
        let ctx = AdapterContext::for_source(source, self.tokens.clone())?;
        let adapter = (self.adapters)(source);
        let mut rows = adapter.fetch_rows(&self.http, &ctx, since).await?;
        info!(adapter = adapter.kind(), rows = rows.len(), since = ?since, "fetched rows");
        rows.iter_mut().for_each(route_control_fields);

        let mut run = SourceRun {
            table: source.table_name.clone(),
            materialize: None,
            mappings: None,
        };

        if !rows.is_empty() {
            let detected = detect_columns(&rows, self.config.sample_rows);
            let report = ensure_table(
                self.store.as_ref(),
                source,
                &detected,
                self.config.default_text_width,
            )
            .await?;
            let columns = self
                .store
                .table_columns(&report.table)
                .await?
                .ok_or_else(|| SyncError::Schema(format!("{} is missing after materialization", report.table)))?;

            let limit = self.config.row_failure_log_limit as u64;
            let mut engine = UpsertEngine::new(self.store.as_ref(), report.table.clone(), columns, &detected);
            for row in &rows {
                counts.processed += 1;
                match engine
                    .upsert_row(&row.natural_id, &row.metadata, &row.fields)
                    .await?
                {
                    UpsertOutcome::Inserted => counts.inserted += 1,
                    UpsertOutcome::Updated => counts.updated += 1,
                    UpsertOutcome::Unchanged => counts.unchanged += 1,
                    UpsertOutcome::Failed(reason) => {
                        counts.failed += 1;
                        if counts.failed <= limit {
                            warn!(natural_id = %row.natural_id, %reason, "row failed");
                        }
                    }
                }
            }
            if counts.failed > limit {
                warn!(suppressed = counts.failed - limit, "further row failures not logged individually");
            }
            run.table = Some(report.table.clone());
            run.materialize = Some(report);
        }

        // Mapping is best-effort: the rows are already stored.
        run.mappings = match self.resolver().resolve_mappings(source.id).await {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!(error = %err, "mapping resolution failed");
                None
            }
        };

        self.store.mark_source_synced(source.id, started_at).await?;
        Ok(run)
    }

    async fn sync_all(&self, kind: SyncKind, initiated_by: &str) -> Result<FullSyncSummary, SyncError> {
        let started_at = Utc::now();
        let sources = match self.store.list_sources(true).await {
            Ok(sources) => sources,
            Err(err) => {
                let err = SyncError::from(err);
                self.append_log(&SyncLogRecord {
                    source_id: None,
                    kind,
                    started_at,
                    duration_ms: 0,
                    counts: RowCounts::default(),
                    status: SyncStatus::Error,
                    error_message: Some(err.to_string()),
                    initiated_by: initiated_by.to_string(),
                })
                .await;
                return Err(err);
            }
        };

        let mut results = Vec::new();
        let mut failures = Vec::new();
        for source in sources {
            match self.sync_source(source.id, kind, initiated_by).await {
                Ok(result) => results.push(result),
                Err(err) => failures.push(SourceFailure {
                    source_id: source.id,
                    alias: source.alias,
                    error: err.to_string(),
                }),
            }
        }
        info!(
            kind = kind.as_str(),
            succeeded = results.len(),
            failed = failures.len(),
            "sync run finished"
        );
        Ok(FullSyncSummary {
            kind,
            started_at,
            finished_at: Utc::now(),
            results,
            failures,
        })
    }

    /// Sync every active source from scratch, continuing past failures.
    pub async fn full_sync(&self, initiated_by: &str) -> Result<FullSyncSummary, SyncError> {
        self.sync_all(SyncKind::Full, initiated_by).await
    }

    pub async fn incremental_sync(&self, initiated_by: &str) -> Result<FullSyncSummary, SyncError> {
        self.sync_all(SyncKind::Incremental, initiated_by).await
    }

    /// One scheduler firing. Returns `None` when the previous tick is still running.
    pub async fn scheduled_tick(&self) -> Option<Result<FullSyncSummary, SyncError>> {
        if self.tick_running.swap(true, Ordering::SeqCst) {
            info!("previous scheduled sync still running; skipping tick");
            return None;
        }
        let _tick = TickGuard(&self.tick_running);
        Some(self.incremental_sync("CRON").await)
    }

    pub async fn recent_sync_logs(
        &self,
        source_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SyncLogEntry>, SyncError> {
        Ok(self.store.recent_sync_logs(source_id, limit).await?)
    }

    pub async fn latest_sync_log(&self, source_id: Option<i64>) -> Result<Option<SyncLogEntry>, SyncError> {
        Ok(self
            .store
            .recent_sync_logs(source_id, 1)
            .await?
            .into_iter()
            .next())
    }
}

/// Cron job running incremental syncs, or `None` when scheduling is disabled.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.scheduled_tick().await {
                None => {}
                Some(Ok(summary)) if summary.is_success() => {
                    info!(sources = summary.results.len(), "scheduled sync finished");
                }
                Some(Ok(summary)) => {
                    warn!(failed = summary.failures.len(), "scheduled sync finished with failures");
                }
                Some(Err(err)) => warn!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

fn whole_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksync_storage::MemoryStore;

    #[test]
    fn durations_saturate_instead_of_wrapping() {
        assert_eq!(whole_millis(Duration::from_millis(1_250)), 1_250);
        assert_eq!(whole_millis(Duration::MAX), u64::MAX);
    }

    fn pipeline() -> SyncPipeline {
        let store: Arc<dyn SyncStore> = Arc::new(MemoryStore::new());
        SyncPipeline::new(SyncConfig::default(), store).expect("pipeline")
    }

    #[test]
    fn a_source_can_only_be_claimed_once_at_a_time() {
        let p = pipeline();
        let slot = p.claim(7).expect("first claim");
        assert!(matches!(p.claim(7), Err(SyncError::AlreadyRunning(7))));
        assert!(p.claim(8).is_ok());
        drop(slot);
        assert!(p.claim(7).is_ok());
    }

    #[tokio::test]
    async fn overlapping_ticks_are_skipped() {
        let p = pipeline();
        p.tick_running.store(true, Ordering::SeqCst);
        assert!(p.scheduled_tick().await.is_none());
        p.tick_running.store(false, Ordering::SeqCst);
        let summary = p.scheduled_tick().await.expect("ran").expect("no sources is fine");
        assert!(summary.results.is_empty());
        assert!(!p.tick_running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unknown_sources_are_rejected() {
        let p = pipeline();
        let err = p.sync_source(99, SyncKind::Manual, "ana").await.unwrap_err();
        assert!(matches!(err, SyncError::SourceNotFound(99)));
    }

    #[tokio::test]
    async fn sources_are_registered_repointed_and_switched_off() {
        let p = pipeline();
        let saved = p
            .register_source(NewSource {
                id: None,
                alias: "Visita Operativa".into(),
                connector: ConnectorSpec::Fixture { path: "a.json".into() },
                credentials_ref: None,
                owner: None,
                active: true,
            })
            .await
            .expect("register");
        p.repoint_source(saved.id, ConnectorSpec::Fixture { path: "b.json".into() })
            .await
            .expect("repoint");
        p.set_source_active(saved.id, false).await.expect("disable");

        let stored = p.store().get_source(saved.id).await.expect("get").expect("source");
        assert!(!stored.active);
        assert_eq!(stored.connector, ConnectorSpec::Fixture { path: "b.json".into() });
        assert!(matches!(
            p.set_source_active(404, true).await,
            Err(SyncError::SourceNotFound(404))
        ));
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let p = Arc::new(pipeline());
        assert!(build_scheduler(p).await.expect("build").is_none());
    }
}
