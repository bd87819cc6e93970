//! Value mapping: free-text store/person values to canonical ids.
//!
//! Precedence per distinct value: an active alias (manual beats auto), then an
//! exact email match for persons, then normalized name equality, then a
//! Jaro-Winkler match that is both above the threshold and clearly ahead of the
//! runner-up. Anything ambiguous stays unmapped.

use std::collections::BTreeSet;
use std::sync::Arc;

use indexmap::IndexMap;
use ksync_core::{
    normalize_for_match, CanonicalEntity, ColumnSpec, FieldBinding, MappingOrigin, MappingType,
    Resolution, SourceDefinition, SourceFieldBinding, ValueMapping,
};
use ksync_storage::{MappingStats, SyncStore};
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::{debug, info, warn};

use crate::{ResolverConfig, SyncError};

const STORE_PATTERNS: &[&str] = &[
    "restaurante",
    "local",
    "sucursal",
    "almacen",
    "tienda",
    "store",
    "punto de venta",
    "pdv",
];
const PERSON_PATTERNS: &[&str] = &[
    "cliente",
    "agente",
    "creador",
    "usuario",
    "persona",
    "responsable",
    "asignado",
    "operador",
    "customer",
];
const SUGGESTION_FLOOR: f64 = 0.75;
const MAX_SUGGESTIONS: usize = 3;
const SYSTEM_USER: &str = "SYSTEM";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolveSummary {
    pub resolved_count: u64,
    pub remaining_unmapped: u64,
    pub ambiguous: u64,
}

impl ResolveSummary {
    fn absorb(&mut self, other: ResolveSummary) {
        self.resolved_count += other.resolved_count;
        self.remaining_unmapped += other.remaining_unmapped;
        self.ambiguous += other.ambiguous;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Email { canonical_id: String },
    Normalized { canonical_id: String },
    Fuzzy { canonical_id: String, score: f64 },
    Ambiguous { candidates: Vec<String> },
    Unmapped,
}

impl MatchOutcome {
    fn canonical_id(&self) -> Option<&str> {
        match self {
            Self::Email { canonical_id }
            | Self::Normalized { canonical_id }
            | Self::Fuzzy { canonical_id, .. } => Some(canonical_id),
            Self::Ambiguous { .. } | Self::Unmapped => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub canonical_id: String,
    pub display_name: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnmappedValue {
    pub mapping_type: MappingType,
    pub column: String,
    pub source_value: String,
    pub rows: u64,
    pub suggestions: Vec<Suggestion>,
}

/// First text column whose name looks like it carries `mapping_type` values.
pub fn detect_binding_column(columns: &[ColumnSpec], mapping_type: MappingType) -> Option<String> {
    let patterns = match mapping_type {
        MappingType::Store => STORE_PATTERNS,
        MappingType::Person => PERSON_PATTERNS,
    };
    columns
        .iter()
        .filter(|c| c.kind.is_text())
        .find(|c| {
            let name = normalize_for_match(&c.name);
            patterns.iter().any(|p| name.contains(p))
        })
        .map(|c| c.name.clone())
}

fn distinct_ids<'a>(entities: impl Iterator<Item = &'a CanonicalEntity>) -> Vec<String> {
    entities
        .map(|e| e.canonical_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Match `value` against the reference entities, without consulting aliases.
pub fn match_against_entities(
    mapping_type: MappingType,
    value: &str,
    entities: &[CanonicalEntity],
    config: &ResolverConfig,
) -> MatchOutcome {
    let active = entities.iter().filter(|e| e.active).collect::<Vec<_>>();
    let value = value.trim();

    if mapping_type == MappingType::Person && value.contains('@') {
        let hits = distinct_ids(active.iter().copied().filter(|e| {
            e.email
                .as_deref()
                .is_some_and(|email| email.trim().eq_ignore_ascii_case(value))
        }));
        match hits.len() {
            0 => {}
            1 => {
                return MatchOutcome::Email {
                    canonical_id: hits.into_iter().next().unwrap_or_default(),
                }
            }
            _ => return MatchOutcome::Ambiguous { candidates: hits },
        }
    }

    let wanted = normalize_for_match(value);
    if wanted.is_empty() {
        return MatchOutcome::Unmapped;
    }

    let hits = distinct_ids(active.iter().copied().filter(|e| {
        normalize_for_match(&e.display_name) == wanted || normalize_for_match(&e.canonical_id) == wanted
    }));
    match hits.len() {
        0 => {}
        1 => {
            return MatchOutcome::Normalized {
                canonical_id: hits.into_iter().next().unwrap_or_default(),
            }
        }
        _ => return MatchOutcome::Ambiguous { candidates: hits },
    }

    let mut scored = active
        .iter()
        .map(|e| (jaro_winkler(&wanted, &normalize_for_match(&e.display_name)), *e))
        .collect::<Vec<_>>();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let Some((best_score, best)) = scored.first().copied() else {
        return MatchOutcome::Unmapped;
    };
    if best_score < config.fuzzy_threshold {
        return MatchOutcome::Unmapped;
    }
    let rivals = scored
        .iter()
        .filter(|(score, e)| e.canonical_id != best.canonical_id && *score >= best_score - config.ambiguity_margin)
        .map(|(_, e)| *e)
        .collect::<Vec<_>>();
    if rivals.is_empty() {
        MatchOutcome::Fuzzy {
            canonical_id: best.canonical_id.clone(),
            score: best_score,
        }
    } else {
        MatchOutcome::Ambiguous {
            candidates: distinct_ids(std::iter::once(best).chain(rivals)),
        }
    }
}

fn suggestions_for(value: &str, entities: &[CanonicalEntity]) -> Vec<Suggestion> {
    let wanted = normalize_for_match(value);
    let mut scored = entities
        .iter()
        .filter(|e| e.active)
        .map(|e| Suggestion {
            canonical_id: e.canonical_id.clone(),
            display_name: e.display_name.clone(),
            score: jaro_winkler(&wanted, &normalize_for_match(&e.display_name)),
        })
        .filter(|s| s.score >= SUGGESTION_FLOOR)
        .collect::<Vec<_>>();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(MAX_SUGGESTIONS);
    scored
}

#[derive(Debug, Default)]
struct ValueState {
    unmapped_before: bool,
    candidate: bool,
}

/// Where a value ended up after one resolution attempt.
enum Resolved {
    Mapped { mapping: ValueMapping },
    Ambiguous,
    Unmapped,
}

#[derive(Clone)]
pub struct MappingResolver {
    store: Arc<dyn SyncStore>,
    config: ResolverConfig,
}

impl MappingResolver {
    pub fn new(store: Arc<dyn SyncStore>, config: ResolverConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    async fn source(&self, source_id: i64) -> Result<SourceDefinition, SyncError> {
        self.store
            .get_source(source_id)
            .await?
            .ok_or(SyncError::SourceNotFound(source_id))
    }

    async fn table_and_columns(
        &self,
        source: &SourceDefinition,
    ) -> Result<Option<(String, Vec<ColumnSpec>)>, SyncError> {
        let Some(table) = source.table_name.clone() else {
            return Ok(None);
        };
        Ok(self
            .store
            .table_columns(&table)
            .await?
            .map(|columns| (table, columns)))
    }

    /// Binding per mapping type: stored bindings win, missing ones are detected
    /// from the column names, disabled ones are skipped.
    pub async fn effective_bindings(
        &self,
        source_id: i64,
        columns: &[ColumnSpec],
    ) -> Result<Vec<(MappingType, String)>, SyncError> {
        let stored = self.store.field_bindings(source_id).await?;
        let mut out = Vec::new();
        for mapping_type in MappingType::ALL {
            match stored.iter().find(|b| b.mapping_type == mapping_type).map(|b| &b.binding) {
                Some(FieldBinding::Disabled) => {}
                Some(FieldBinding::Column(column)) => {
                    if columns.iter().any(|c| &c.name == column) {
                        out.push((mapping_type, column.clone()));
                    } else {
                        warn!(source_id, %mapping_type, column = %column, "bound column no longer exists");
                    }
                }
                None => {
                    if let Some(column) = detect_binding_column(columns, mapping_type) {
                        out.push((mapping_type, column));
                    }
                }
            }
        }
        Ok(out)
    }

    async fn bound_column(
        &self,
        source_id: i64,
        mapping_type: MappingType,
    ) -> Result<(String, String), SyncError> {
        let source = self.source(source_id).await?;
        let (table, columns) = self.table_and_columns(&source).await?.ok_or_else(|| {
            SyncError::InvalidInput(format!("source {source_id} has not been synchronized yet"))
        })?;
        let bindings = self.effective_bindings(source_id, &columns).await?;
        bindings
            .into_iter()
            .find(|(t, _)| *t == mapping_type)
            .map(|(_, column)| (table, column))
            .ok_or_else(|| {
                SyncError::InvalidInput(format!("source {source_id} has no {mapping_type} column bound"))
            })
    }

    async fn resolve_value(
        &self,
        mapping_type: MappingType,
        value: &str,
        entities: &[CanonicalEntity],
    ) -> Result<Resolved, SyncError> {
        if let Some(mapping) = self.store.active_value_mapping(mapping_type, value).await? {
            return Ok(Resolved::Mapped { mapping });
        }
        let outcome = match_against_entities(mapping_type, value, entities, &self.config);
        debug!(%mapping_type, value, outcome = ?outcome, "matched value");
        match (&outcome, outcome.canonical_id()) {
            (_, Some(canonical_id)) => {
                let mapping = self
                    .store
                    .save_value_mapping(mapping_type, value, canonical_id, MappingOrigin::Auto, SYSTEM_USER)
                    .await?;
                Ok(Resolved::Mapped { mapping })
            }
            (MatchOutcome::Ambiguous { .. }, None) => Ok(Resolved::Ambiguous),
            _ => Ok(Resolved::Unmapped),
        }
    }

    async fn resolve_binding(
        &self,
        table: &str,
        column: &str,
        mapping_type: MappingType,
    ) -> Result<ResolveSummary, SyncError> {
        let entities = self.store.canonical_entities(mapping_type).await?;
        let groups = self.store.value_groups(table, column, mapping_type).await?;

        let mut values: IndexMap<String, ValueState> = IndexMap::new();
        for group in groups {
            let state = values.entry(group.source_value).or_default();
            match group.resolution.map(|r| r.origin) {
                None => {
                    state.unmapped_before = true;
                    state.candidate = true;
                }
                Some(MappingOrigin::Auto) => state.candidate = true,
                // Manual rows are never touched by automatic resolution.
                Some(MappingOrigin::Manual) => {}
            }
        }

        let mut summary = ResolveSummary::default();
        for (value, state) in values.into_iter().filter(|(_, s)| s.candidate) {
            match self.resolve_value(mapping_type, &value, &entities).await? {
                Resolved::Mapped { mapping } => {
                    let resolution = Resolution {
                        display_name: entities
                            .iter()
                            .find(|e| e.canonical_id == mapping.canonical_id)
                            .map(|e| e.display_name.clone()),
                        canonical_id: mapping.canonical_id.clone(),
                        origin: mapping.origin,
                    };
                    let touched = self
                        .store
                        .set_row_resolution(table, column, mapping_type, &value, &resolution)
                        .await?;
                    if state.unmapped_before {
                        summary.resolved_count += 1;
                        self.store.bump_mapping_usage(mapping.id, touched).await?;
                    }
                }
                Resolved::Ambiguous => {
                    if state.unmapped_before {
                        summary.remaining_unmapped += 1;
                        summary.ambiguous += 1;
                    }
                }
                // Rows already auto-resolved keep their resolution when nothing matches now.
                Resolved::Unmapped => {
                    if state.unmapped_before {
                        summary.remaining_unmapped += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Resolve every unmapped (or automatically mapped) value of a source.
    ///
    /// `resolved_count + remaining_unmapped` equals the number of distinct values
    /// that were unmapped before the call.
    pub async fn resolve_mappings(&self, source_id: i64) -> Result<ResolveSummary, SyncError> {
        let source = self.source(source_id).await?;
        let Some((table, columns)) = self.table_and_columns(&source).await? else {
            return Ok(ResolveSummary::default());
        };

        let mut summary = ResolveSummary::default();
        for (mapping_type, column) in self.effective_bindings(source_id, &columns).await? {
            let part = self.resolve_binding(&table, &column, mapping_type).await?;
            info!(
                source_id,
                %mapping_type,
                column = %column,
                resolved = part.resolved_count,
                remaining = part.remaining_unmapped,
                ambiguous = part.ambiguous,
                "resolved mapping values"
            );
            summary.absorb(part);
        }
        Ok(summary)
    }

    /// Distinct unmapped values with row counts and the closest candidates.
    pub async fn unmapped_report(&self, source_id: i64) -> Result<Vec<UnmappedValue>, SyncError> {
        let source = self.source(source_id).await?;
        let Some((table, columns)) = self.table_and_columns(&source).await? else {
            return Ok(Vec::new());
        };

        let mut report = Vec::new();
        for (mapping_type, column) in self.effective_bindings(source_id, &columns).await? {
            let entities = self.store.canonical_entities(mapping_type).await?;
            let groups = self.store.value_groups(&table, &column, mapping_type).await?;
            let mut rows_by_value: IndexMap<String, u64> = IndexMap::new();
            for group in groups.into_iter().filter(|g| g.resolution.is_none()) {
                *rows_by_value.entry(group.source_value).or_default() += group.rows;
            }
            for (source_value, rows) in rows_by_value {
                report.push(UnmappedValue {
                    mapping_type,
                    column: column.clone(),
                    suggestions: suggestions_for(&source_value, &entities),
                    source_value,
                    rows,
                });
            }
        }
        report.sort_by(|a, b| b.rows.cmp(&a.rows).then_with(|| a.source_value.cmp(&b.source_value)));
        Ok(report)
    }

    pub async fn mapping_stats(&self, source_id: i64) -> Result<MappingStats, SyncError> {
        let source = self.source(source_id).await?;
        match self.table_and_columns(&source).await? {
            Some((table, _)) => Ok(self.store.mapping_stats(&table).await?),
            None => Ok(MappingStats::default()),
        }
    }

    /// Record an operator alias; it replaces any automatic mapping of the value.
    pub async fn set_manual_mapping(
        &self,
        mapping_type: MappingType,
        source_value: &str,
        canonical_id: &str,
        created_by: &str,
    ) -> Result<ValueMapping, SyncError> {
        let source_value = source_value.trim();
        if source_value.is_empty() {
            return Err(SyncError::InvalidInput("source value is empty".to_string()));
        }
        let entities = self.store.canonical_entities(mapping_type).await?;
        if !entities.iter().any(|e| e.canonical_id == canonical_id) {
            return Err(SyncError::InvalidInput(format!(
                "unknown {mapping_type} canonical id {canonical_id:?}"
            )));
        }
        let mapping = self
            .store
            .save_value_mapping(mapping_type, source_value, canonical_id, MappingOrigin::Manual, created_by)
            .await?;
        info!(%mapping_type, source_value, canonical_id, created_by, "saved manual mapping");
        Ok(mapping)
    }

    /// Apply the active manual alias of `source_value` to a source's rows now.
    pub async fn apply_manual_mapping(
        &self,
        source_id: i64,
        mapping_type: MappingType,
        source_value: &str,
    ) -> Result<u64, SyncError> {
        let source_value = source_value.trim();
        let mapping = self
            .store
            .active_value_mapping(mapping_type, source_value)
            .await?
            .filter(|m| m.origin == MappingOrigin::Manual)
            .ok_or_else(|| {
                SyncError::InvalidInput(format!("no manual {mapping_type} mapping for {source_value:?}"))
            })?;
        let (table, column) = self.bound_column(source_id, mapping_type).await?;
        let display_name = self
            .store
            .canonical_entities(mapping_type)
            .await?
            .into_iter()
            .find(|e| e.canonical_id == mapping.canonical_id)
            .map(|e| e.display_name);
        let resolution = Resolution {
            canonical_id: mapping.canonical_id.clone(),
            display_name,
            origin: MappingOrigin::Manual,
        };
        let touched = self
            .store
            .set_row_resolution(&table, &column, mapping_type, source_value, &resolution)
            .await?;
        self.store.bump_mapping_usage(mapping.id, touched).await?;
        Ok(touched)
    }

    /// Operator reset: rows carrying `source_value` go back to unmapped.
    pub async fn clear_resolution(
        &self,
        source_id: i64,
        mapping_type: MappingType,
        source_value: &str,
    ) -> Result<u64, SyncError> {
        let (table, column) = self.bound_column(source_id, mapping_type).await?;
        Ok(self
            .store
            .clear_row_resolution(&table, &column, mapping_type, source_value.trim())
            .await?)
    }

    pub async fn set_field_binding(
        &self,
        source_id: i64,
        mapping_type: MappingType,
        binding: FieldBinding,
        updated_by: &str,
    ) -> Result<SourceFieldBinding, SyncError> {
        let source = self.source(source_id).await?;
        if let FieldBinding::Column(column) = &binding {
            if let Some((table, columns)) = self.table_and_columns(&source).await? {
                if !columns.iter().any(|c| &c.name == column) {
                    return Err(SyncError::InvalidInput(format!("{table} has no column {column}")));
                }
            }
        }
        let binding = SourceFieldBinding {
            source_id,
            mapping_type,
            binding,
            updated_by: updated_by.to_string(),
        };
        self.store.set_field_binding(&binding).await?;
        Ok(binding)
    }

    /// Persist detected bindings for mapping types the operator has not bound.
    pub async fn auto_detect_bindings(
        &self,
        source_id: i64,
        updated_by: &str,
    ) -> Result<Vec<SourceFieldBinding>, SyncError> {
        let source = self.source(source_id).await?;
        let Some((_, columns)) = self.table_and_columns(&source).await? else {
            return Ok(Vec::new());
        };
        let stored = self.store.field_bindings(source_id).await?;
        for mapping_type in MappingType::ALL {
            if stored.iter().any(|b| b.mapping_type == mapping_type) {
                continue;
            }
            if let Some(column) = detect_binding_column(&columns, mapping_type) {
                self.set_field_binding(source_id, mapping_type, FieldBinding::Column(column), updated_by)
                    .await?;
            }
        }
        Ok(self.store.field_bindings(source_id).await?)
    }
}
