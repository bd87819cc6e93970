//! Core domain model for KSYNC: registered sources, fetched rows, destination table
//! shapes, value mappings and sync-log records.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ksync-core";

/// Flat, ordered field map of one remote record.
pub type RowFields = IndexMap<String, Option<String>>;

/// Default bounded width for freshly created text columns.
pub const DEFAULT_TEXT_WIDTH: u32 = 255;

/// Bounded text above this width is created as unbounded text instead.
pub const MAX_BOUNDED_TEXT_WIDTH: u32 = 4000;

/// PostgreSQL truncates longer identifiers silently.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Names of the fixed columns every destination table carries.
pub mod control {
    pub const ROW_ID: &str = "_row_id";
    pub const NATURAL_ID: &str = "_natural_id";
    pub const RESPONDENT_EMAIL: &str = "_respondent_email";
    pub const RESPONDENT_NAME: &str = "_respondent_name";
    pub const SUBMITTED_AT: &str = "_submitted_at";
    pub const SYNCED_AT: &str = "_synced_at";
    pub const PAYLOAD: &str = "_payload";
    pub const PAYLOAD_HASH: &str = "_payload_hash";
    pub const STORE_CODE: &str = "_store_code";
    pub const STORE_NAME: &str = "_store_name";
    pub const STORE_ORIGIN: &str = "_store_origin";
    pub const PERSON_ID: &str = "_person_id";
    pub const PERSON_NAME: &str = "_person_name";
    pub const PERSON_ORIGIN: &str = "_person_origin";

    pub const ALL: &[&str] = &[
        ROW_ID,
        NATURAL_ID,
        RESPONDENT_EMAIL,
        RESPONDENT_NAME,
        SUBMITTED_AT,
        SYNCED_AT,
        PAYLOAD,
        PAYLOAD_HASH,
        STORE_CODE,
        STORE_NAME,
        STORE_ORIGIN,
        PERSON_ID,
        PERSON_NAME,
        PERSON_ORIGIN,
    ];
}

/// Which fixed column a colliding remote field name lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlField {
    RowId,
    NaturalId,
    SubmittedAt,
    SyncedAt,
    RespondentEmail,
    RespondentName,
    Internal,
}

/// Classify a (sanitized) remote column name that collides with a control column.
///
/// Matching ignores case and underscores, so `Submitted_At`, `submittedat` and
/// `_submitted_at` all land on the same fixed column.
pub fn control_collision(name: &str) -> Option<ControlField> {
    let squashed: String = name
        .chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect();
    let field = match squashed.as_str() {
        "id" | "rowid" => ControlField::RowId,
        "naturalid" | "responseid" => ControlField::NaturalId,
        "submittedat" => ControlField::SubmittedAt,
        "syncedat" => ControlField::SyncedAt,
        "respondentemail" => ControlField::RespondentEmail,
        "respondentname" => ControlField::RespondentName,
        _ => {
            let is_internal = control::ALL
                .iter()
                .any(|c| c.replace('_', "") == squashed);
            if is_internal {
                ControlField::Internal
            } else {
                return None;
            }
        }
    };
    Some(field)
}

// ─── Sources ────────────────────────────────────────────────────────────────

/// One externally-owned dataset registered for synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub id: i64,
    pub alias: String,
    pub connector: ConnectorSpec,
    #[serde(default)]
    pub credentials_ref: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub table_name: Option<String>,
    pub active: bool,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Admin-supplied fields for registering a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSource {
    #[serde(default)]
    pub id: Option<i64>,
    pub alias: String,
    pub connector: ConnectorSpec,
    #[serde(default)]
    pub credentials_ref: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// How rows are pulled from a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorSpec {
    /// JSON file holding an array of flat records (offline replay and tests).
    Fixture { path: PathBuf },
    /// Authenticated REST endpoint returning pages of flat records.
    PagedJson(PagedJsonSpec),
}

impl ConnectorSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fixture { .. } => "fixture",
            Self::PagedJson(_) => "paged_json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagedJsonSpec {
    pub url: String,
    /// JSON pointer to the array of records in each page.
    #[serde(default = "default_rows_pointer")]
    pub rows_pointer: String,
    /// JSON pointer to the absolute URL of the next page.
    #[serde(default)]
    pub next_pointer: Option<String>,
    pub id_field: String,
    #[serde(default)]
    pub submitted_field: Option<String>,
    #[serde(default)]
    pub email_field: Option<String>,
    #[serde(default)]
    pub name_field: Option<String>,
    /// Records are positional arrays and the first one holds the headers.
    #[serde(default)]
    pub header_row: bool,
    /// Query parameter carrying the incremental watermark (RFC 3339).
    #[serde(default)]
    pub since_param: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_rows_pointer() -> String {
    "/value".to_string()
}

// ─── Fetched rows and detected schema ───────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowMetadata {
    pub submitted_at: Option<DateTime<Utc>>,
    pub respondent_email: Option<String>,
    pub respondent_name: Option<String>,
}

/// One remote record, keyed by the source's own identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedRow {
    pub natural_id: String,
    #[serde(default)]
    pub metadata: RowMetadata,
    pub fields: RowFields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    Text,
    Integer,
    Decimal,
    Date,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedColumn {
    /// Sanitized destination column name.
    pub name: String,
    /// Remote field name the column was detected from.
    pub source_key: String,
    pub kind: ScalarKind,
    /// Longest value (in chars) seen for this column across the whole batch.
    pub max_len: usize,
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TextWidth {
    Bounded(u32),
    Unbounded,
}

impl TextWidth {
    pub fn fits(&self, len: usize) -> bool {
        match self {
            Self::Bounded(n) => len <= *n as usize,
            Self::Unbounded => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    Text(TextWidth),
    Integer,
    Decimal,
    Timestamp,
}

impl ColumnKind {
    pub const UNBOUNDED_TEXT: ColumnKind = ColumnKind::Text(TextWidth::Unbounded);

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    /// Whether a column of this kind can hold `other`'s values without loss.
    ///
    /// Widening is monotonic: bounded text only grows, and every typed kind only
    /// ever widens into unbounded text.
    pub fn covers(&self, other: &ColumnKind) -> bool {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => a >= b,
            (Self::Text(TextWidth::Unbounded), _) => true,
            (Self::Decimal, Self::Integer) => true,
            (a, b) => a == b,
        }
    }

    pub fn for_scalar(kind: ScalarKind, width: TextWidth) -> Self {
        match kind {
            ScalarKind::Text => Self::Text(width),
            ScalarKind::Integer => Self::Integer,
            ScalarKind::Decimal => Self::Decimal,
            ScalarKind::Date => Self::Timestamp,
        }
    }

    /// Whether `value` can be stored in a column of this kind.
    pub fn accepts(&self, value: &str) -> bool {
        match self {
            Self::Text(width) => width.fits(value.chars().count()),
            Self::Integer => value.trim().parse::<i64>().is_ok(),
            Self::Decimal => value.trim().parse::<f64>().map(f64::is_finite).unwrap_or(false),
            Self::Timestamp => parse_timestamp(value).is_some(),
        }
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(TextWidth::Bounded(n)) => write!(f, "text({n})"),
            Self::Text(TextWidth::Unbounded) => write!(f, "text"),
            Self::Integer => write!(f, "integer"),
            Self::Decimal => write!(f, "decimal"),
            Self::Timestamp => write!(f, "timestamp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnWidening {
    pub column: String,
    pub from: ColumnKind,
    pub to: ColumnKind,
}

/// Typed schema delta applied before any data write of a sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChangeset {
    pub columns_to_add: Vec<ColumnSpec>,
    pub columns_to_widen: Vec<ColumnWidening>,
}

impl SchemaChangeset {
    pub fn is_empty(&self) -> bool {
        self.columns_to_add.is_empty() && self.columns_to_widen.is_empty()
    }
}

// ─── Synced rows and mappings ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingType {
    Store,
    Person,
}

impl MappingType {
    pub const ALL: [MappingType; 2] = [MappingType::Store, MappingType::Person];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "STORE",
            Self::Person => "PERSON",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "STORE" | "CODALMACEN" => Some(Self::Store),
            "PERSON" | "PERSONA" => Some(Self::Person),
            _ => None,
        }
    }
}

impl fmt::Display for MappingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingOrigin {
    Auto,
    Manual,
}

impl MappingOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Manual => "MANUAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "AUTO" => Some(Self::Auto),
            "MANUAL" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Canonical id attached to a synced row for one mapping type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub canonical_id: String,
    pub display_name: Option<String>,
    pub origin: MappingOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedRow {
    pub natural_id: String,
    pub metadata: RowMetadata,
    pub synced_at: DateTime<Utc>,
    pub payload: RowFields,
    pub payload_hash: String,
    pub store: Option<Resolution>,
    pub person: Option<Resolution>,
}

impl SyncedRow {
    pub fn resolution(&self, mapping_type: MappingType) -> Option<&Resolution> {
        match mapping_type {
            MappingType::Store => self.store.as_ref(),
            MappingType::Person => self.person.as_ref(),
        }
    }
}

/// Association from a raw source string to a canonical entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueMapping {
    pub id: i64,
    pub mapping_type: MappingType,
    pub source_value: String,
    pub canonical_id: String,
    pub origin: MappingOrigin,
    pub usage_count: i64,
    pub active: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Reference-table entry a free-text value can resolve to (a store or a person).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub mapping_type: MappingType,
    pub canonical_id: String,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Which destination column carries the free-text value for a mapping type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "binding", content = "column", rename_all = "snake_case")]
pub enum FieldBinding {
    Column(String),
    /// Operator opted this source out of the mapping type.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFieldBinding {
    pub source_id: i64,
    pub mapping_type: MappingType,
    pub binding: FieldBinding,
    pub updated_by: String,
}

// ─── Sync log ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncKind {
    Full,
    Incremental,
    Manual,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Incremental => "INCREMENTAL",
            Self::Manual => "MANUAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "FULL" => Some(Self::Full),
            "INCREMENTAL" => Some(Self::Incremental),
            "MANUAL" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SUCCESS" => Some(Self::Success),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCounts {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
}

/// Immutable record of one synchronization attempt, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogRecord {
    pub source_id: Option<i64>,
    pub kind: SyncKind,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub counts: RowCounts,
    pub status: SyncStatus,
    pub error_message: Option<String>,
    pub initiated_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: i64,
    #[serde(flatten)]
    pub record: SyncLogRecord,
}

/// Result of writing one row into a destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
    Failed(String),
}

// ─── Identifiers and normalization ──────────────────────────────────────────

fn fold_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' => 'a',
        'Á' | 'À' | 'Â' | 'Ä' | 'Ã' | 'Å' => 'A',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'É' | 'È' | 'Ê' | 'Ë' => 'E',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
        'Ó' | 'Ò' | 'Ô' | 'Ö' | 'Õ' => 'O',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
        'ñ' => 'n',
        'Ñ' => 'N',
        'ç' => 'c',
        'Ç' => 'C',
        other => other,
    }
}

/// Strip common Latin diacritics so names survive the `[A-Za-z0-9_]` allow-list.
pub fn fold_accents(input: &str) -> String {
    input.chars().map(fold_accent).collect()
}

/// True when `ident` only contains `[A-Za-z0-9_]` and is non-empty.
pub fn is_safe_identifier(ident: &str) -> bool {
    !ident.is_empty() && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Turn a free-text remote field name into a column identifier.
pub fn sanitize_identifier(raw: &str, max_len: usize) -> Option<String> {
    let folded = fold_accents(raw);
    let words = folded
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect::<String>();
    let joined = words.split_whitespace().collect::<Vec<_>>().join("_");
    let truncated: String = joined.chars().take(max_len).collect();
    if truncated.is_empty() {
        None
    } else {
        Some(truncated)
    }
}

/// PascalCase slug of a source alias, e.g. `"Visita Operativa (3)"` -> `VisitaOperativa3`.
pub fn table_slug(alias: &str) -> String {
    let folded = fold_accents(alias);
    let cleaned = folded
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .collect::<String>();
    let slug = cleaned
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<String>();
    slug.chars().take(50).collect()
}

/// Stable destination table name for a source, never longer than `MAX_IDENTIFIER_LEN`.
pub fn derive_table_name(source_id: i64, alias_hint: &str) -> String {
    let prefix = format!("src_{source_id}");
    let room = MAX_IDENTIFIER_LEN.saturating_sub(prefix.len() + 1);
    let slug: String = table_slug(alias_hint).chars().take(room).collect();
    if slug.is_empty() {
        prefix
    } else {
        format!("{prefix}_{slug}")
    }
}

/// Comparison key for fuzzy matching: accent-folded, lowercase, punctuation as
/// spaces, whitespace collapsed.
pub fn normalize_for_match(input: &str) -> String {
    fold_accents(input)
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse the date/time shapes remote sources emit.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.len() < 8 {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%d/%m/%Y %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_slugged_and_allow_listed() {
        assert_eq!(
            derive_table_name(3, "Visita Operativa Ops (3)"),
            "src_3_VisitaOperativaOps3"
        );
        assert_eq!(derive_table_name(7, "Quejas de Atención"), "src_7_QuejasDeAtencion");
        assert_eq!(derive_table_name(9, "!!!"), "src_9");
        assert!(is_safe_identifier(&derive_table_name(1, "x'; DROP TABLE y; --")));
    }

    #[test]
    fn long_aliases_fit_the_identifier_limit() {
        let alias = "Visita Operativa Regional Zona Norte Supervisores Semanal Extendida";
        let name = derive_table_name(123456789, alias);
        assert_eq!(name.len(), MAX_IDENTIFIER_LEN);
        assert!(name.starts_with("src_123456789_VisitaOperativa"));
        assert_eq!(derive_table_name(123456789, alias), name);
        assert!(derive_table_name(i64::MAX, alias).len() <= MAX_IDENTIFIER_LEN);
    }

    #[test]
    fn column_identifiers_keep_only_safe_characters() {
        assert_eq!(
            sanitize_identifier("¿Cuál es el restaurante?", 100).as_deref(),
            Some("Cual_es_el_restaurante")
        );
        assert_eq!(sanitize_identifier("  a  b ", 100).as_deref(), Some("a_b"));
        assert_eq!(sanitize_identifier("???", 100), None);
        assert_eq!(sanitize_identifier("abcdef", 3).as_deref(), Some("abc"));
        assert!(!is_safe_identifier("bad name"));
        assert!(!is_safe_identifier("\"quoted\""));
    }

    #[test]
    fn control_collisions_ignore_case_and_underscores() {
        assert_eq!(control_collision("SubmittedAt"), Some(ControlField::SubmittedAt));
        assert_eq!(control_collision("ID"), Some(ControlField::RowId));
        assert_eq!(control_collision("Synced_At"), Some(ControlField::SyncedAt));
        assert_eq!(control_collision("payload_hash"), Some(ControlField::Internal));
        assert_eq!(control_collision("Restaurante"), None);
    }

    #[test]
    fn widening_order_is_monotonic() {
        let narrow = ColumnKind::Text(TextWidth::Bounded(50));
        let wide = ColumnKind::Text(TextWidth::Bounded(255));
        assert!(wide.covers(&narrow));
        assert!(!narrow.covers(&wide));
        assert!(ColumnKind::UNBOUNDED_TEXT.covers(&ColumnKind::Integer));
        assert!(!ColumnKind::Integer.covers(&ColumnKind::UNBOUNDED_TEXT));
        assert!(TextWidth::Bounded(4000) < TextWidth::Unbounded);
    }

    #[test]
    fn kinds_accept_matching_values() {
        assert!(ColumnKind::Integer.accepts(" 42 "));
        assert!(!ColumnKind::Integer.accepts("4.2"));
        assert!(ColumnKind::Decimal.accepts("4.2"));
        assert!(ColumnKind::Timestamp.accepts("2026-02-24"));
        assert!(!ColumnKind::Text(TextWidth::Bounded(3)).accepts("four"));
    }

    #[test]
    fn match_normalization_collapses_noise() {
        assert_eq!(normalize_for_match("  Rostipollos   ESCAZÚ-Centro "), "rostipollos escazu centro");
        assert_eq!(normalize_for_match("María  José"), "maria jose");
    }

    #[test]
    fn timestamps_parse_common_shapes() {
        assert!(parse_timestamp("2026-02-24T12:00:00Z").is_some());
        assert!(parse_timestamp("2026-02-24 12:00:00").is_some());
        assert!(parse_timestamp("24/02/2026").is_some());
        assert!(parse_timestamp("12345").is_none());
        assert!(parse_timestamp("not a date").is_none());
    }

    #[test]
    fn connector_spec_round_trips_through_tagged_json() {
        let spec: ConnectorSpec = serde_json::from_str(
            r#"{"type":"paged_json","url":"https://api.example/rows","id_field":"Id"}"#,
        )
        .expect("parse");
        match spec {
            ConnectorSpec::PagedJson(p) => {
                assert_eq!(p.rows_pointer, "/value");
                assert!(!p.header_row);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
