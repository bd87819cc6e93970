//! Source adapter contracts + the fixture and paged-JSON connectors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use ksync_core::{
    parse_timestamp, ConnectorSpec, FetchedRow, PagedJsonSpec, RowFields, RowMetadata,
    SourceDefinition,
};
use ksync_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ksync-adapters";

/// Tokens are refreshed this long before the provider says they expire.
const TOKEN_EXPIRY_BUFFER_SECS: i64 = 60;
const MAX_PAGES: usize = 1_000;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("credentials unavailable: {0}")]
    Credentials(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    /// Whether retrying later could succeed (network trouble, 5xx, rate limits).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Fetch(err) if err.is_transient())
    }
}

/// OAuth2 client-credentials pair resolved from the environment.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl ClientCredentials {
    /// Read `<REF>_CLIENT_ID` / `<REF>_CLIENT_SECRET`.
    pub fn from_env(credentials_ref: &str) -> Result<Self, AdapterError> {
        let prefix = credentials_ref.trim().to_ascii_uppercase();
        let read = |suffix: &str| {
            let key = format!("{prefix}_{suffix}");
            std::env::var(&key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| AdapterError::Credentials(format!("{key} is not set")))
        };
        Ok(Self {
            client_id: read("CLIENT_ID")?,
            client_secret: read("CLIENT_SECRET")?,
        })
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    refresh_at: DateTime<Utc>,
}

/// Access tokens shared across syncs, keyed by token endpoint and client id.
#[derive(Debug, Default)]
pub struct TokenCache {
    tokens: Mutex<HashMap<(String, String), CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn bearer(
        &self,
        http: &HttpFetcher,
        token_url: &str,
        scope: Option<&str>,
        credentials: &ClientCredentials,
    ) -> Result<String, AdapterError> {
        let key = (token_url.to_string(), credentials.client_id.clone());
        let mut tokens = self.tokens.lock().await;
        if let Some(cached) = tokens.get(&key) {
            if cached.refresh_at > Utc::now() {
                return Ok(cached.access_token.clone());
            }
        }

        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
        ];
        if let Some(scope) = scope {
            form.push(("scope", scope));
        }
        let body = http.post_form_json(token_url, &form).await?;
        let response: TokenResponse = serde_json::from_value(body)
            .map_err(|err| AdapterError::Malformed(format!("token response: {err}")))?;

        let lifetime = response.expires_in.unwrap_or(3600) - TOKEN_EXPIRY_BUFFER_SECS;
        debug!(token_url, lifetime_secs = lifetime, "acquired access token");
        tokens.insert(
            key,
            CachedToken {
                access_token: response.access_token.clone(),
                refresh_at: Utc::now() + Duration::seconds(lifetime.max(0)),
            },
        );
        Ok(response.access_token)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub source_id: i64,
    pub credentials: Option<ClientCredentials>,
    pub tokens: Arc<TokenCache>,
}

impl AdapterContext {
    /// Context for one fetch of `source`, resolving its credentials reference.
    pub fn for_source(source: &SourceDefinition, tokens: Arc<TokenCache>) -> Result<Self, AdapterError> {
        let credentials = source
            .credentials_ref
            .as_deref()
            .map(ClientCredentials::from_env)
            .transpose()?;
        Ok(Self {
            run_id: Uuid::new_v4(),
            source_id: source.id,
            credentials,
            tokens,
        })
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Fetch every record, or only those submitted after `since` when the
    /// connector can tell.
    async fn fetch_rows(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FetchedRow>, AdapterError>;
}

pub fn adapter_for_source(source: &SourceDefinition) -> Box<dyn SourceAdapter> {
    match &source.connector {
        ConnectorSpec::Fixture { path } => Box::new(FixtureAdapter::new(path.clone())),
        ConnectorSpec::PagedJson(spec) => Box::new(PagedJsonAdapter::new(spec.clone())),
    }
}

/// Render a JSON scalar the way it lands in a text column.
pub fn flatten_json_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn submitted_after(row: &FetchedRow, since: Option<DateTime<Utc>>) -> bool {
    match (since, row.metadata.submitted_at) {
        (Some(since), Some(submitted)) => submitted > since,
        _ => true,
    }
}

// ─── Fixture connector ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FixtureRecord {
    natural_id: String,
    #[serde(default)]
    submitted_at: Option<String>,
    #[serde(default)]
    respondent_email: Option<String>,
    #[serde(default)]
    respondent_name: Option<String>,
    #[serde(default)]
    fields: IndexMap<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FixtureFile {
    Rows(Vec<FixtureRecord>),
    Wrapped { rows: Vec<FixtureRecord> },
}

/// Replays a JSON file of records; used for offline runs and tests.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

pub async fn load_fixture_rows(path: impl AsRef<Path>) -> anyhow::Result<Vec<FetchedRow>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: FixtureFile =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    let records = match file {
        FixtureFile::Rows(rows) | FixtureFile::Wrapped { rows } => rows,
    };
    Ok(records
        .into_iter()
        .map(|record| FetchedRow {
            natural_id: record.natural_id,
            metadata: RowMetadata {
                submitted_at: record.submitted_at.as_deref().and_then(parse_timestamp),
                respondent_email: record.respondent_email,
                respondent_name: record.respondent_name,
            },
            fields: record
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), flatten_json_value(v)))
                .collect(),
        })
        .collect())
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn kind(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_rows(
        &self,
        _http: &HttpFetcher,
        ctx: &AdapterContext,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FetchedRow>, AdapterError> {
        let rows = load_fixture_rows(&self.path).await?;
        let total = rows.len();
        let rows = rows
            .into_iter()
            .filter(|row| submitted_after(row, since))
            .collect::<Vec<_>>();
        info!(
            source_id = ctx.source_id,
            path = %self.path.display(),
            total,
            kept = rows.len(),
            "loaded fixture rows"
        );
        Ok(rows)
    }
}

// ─── Paged JSON connector ───────────────────────────────────────────────────

/// Authenticated REST endpoint returning pages of flat records.
#[derive(Debug, Clone)]
pub struct PagedJsonAdapter {
    spec: PagedJsonSpec,
}

impl PagedJsonAdapter {
    pub fn new(spec: PagedJsonSpec) -> Self {
        Self { spec }
    }

    fn records_to_rows(
        &self,
        records: Vec<JsonValue>,
        header: &mut Option<Vec<String>>,
    ) -> Result<Vec<FetchedRow>, AdapterError> {
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let fields: RowFields = if self.spec.header_row {
                let JsonValue::Array(cells) = record else {
                    return Err(AdapterError::Malformed(
                        "header_row connectors expect positional arrays".to_string(),
                    ));
                };
                match header {
                    None => {
                        *header = Some(
                            cells
                                .iter()
                                .map(|c| flatten_json_value(c).unwrap_or_default())
                                .collect(),
                        );
                        continue;
                    }
                    Some(names) => names
                        .iter()
                        .zip(cells.iter().map(flatten_json_value).chain(std::iter::repeat(None)))
                        .filter(|(name, _)| !name.trim().is_empty())
                        .map(|(name, value)| (name.clone(), value))
                        .collect(),
                }
            } else {
                let JsonValue::Object(map) = record else {
                    return Err(AdapterError::Malformed("expected an object per record".to_string()));
                };
                map.iter().map(|(k, v)| (k.clone(), flatten_json_value(v))).collect()
            };
            if let Some(row) = self.to_fetched_row(fields) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn to_fetched_row(&self, mut fields: RowFields) -> Option<FetchedRow> {
        let mut take = |name: &Option<String>| {
            name.as_ref()
                .and_then(|n| fields.shift_remove(n))
                .flatten()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let Some(natural_id) = take(&Some(self.spec.id_field.clone())) else {
            warn!(id_field = %self.spec.id_field, "skipping record without an identifier");
            return None;
        };
        let submitted = take(&self.spec.submitted_field);
        let email = take(&self.spec.email_field);
        let name = take(&self.spec.name_field);
        Some(FetchedRow {
            natural_id,
            metadata: RowMetadata {
                submitted_at: submitted.as_deref().and_then(parse_timestamp),
                respondent_email: email,
                respondent_name: name,
            },
            fields,
        })
    }

    async fn bearer(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<Option<String>, AdapterError> {
        let Some(token_url) = &self.spec.token_url else {
            return Ok(None);
        };
        let credentials = ctx.credentials.as_ref().ok_or_else(|| {
            AdapterError::Credentials(format!("source {} has a token_url but no credentials_ref", ctx.source_id))
        })?;
        let token = ctx
            .tokens
            .bearer(http, token_url, self.spec.scope.as_deref(), credentials)
            .await?;
        Ok(Some(token))
    }
}

#[async_trait]
impl SourceAdapter for PagedJsonAdapter {
    fn kind(&self) -> &'static str {
        "paged_json"
    }

    async fn fetch_rows(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FetchedRow>, AdapterError> {
        let bearer = self.bearer(http, ctx).await?;
        let mut query = Vec::new();
        if let (Some(param), Some(since)) = (&self.spec.since_param, since) {
            query.push((param.clone(), since.to_rfc3339()));
        }

        let mut rows = Vec::new();
        let mut header = None;
        let mut next_url = Some(self.spec.url.clone());
        let mut pages = 0usize;
        while let Some(url) = next_url.take() {
            pages += 1;
            if pages > MAX_PAGES {
                return Err(AdapterError::Malformed(format!("more than {MAX_PAGES} pages")));
            }
            let page_query: &[(String, String)] = if pages == 1 { &query } else { &[] };
            let page = http.get_json(&url, bearer.as_deref(), page_query).await?;

            let records = match page.pointer(&self.spec.rows_pointer) {
                Some(JsonValue::Array(items)) => items.clone(),
                Some(JsonValue::Null) | None => Vec::new(),
                Some(_) => {
                    return Err(AdapterError::Malformed(format!(
                        "{} does not point at an array",
                        self.spec.rows_pointer
                    )))
                }
            };
            debug!(source_id = ctx.source_id, page = pages, records = records.len(), "fetched page");
            rows.extend(self.records_to_rows(records, &mut header)?);

            next_url = self
                .spec
                .next_pointer
                .as_deref()
                .and_then(|p| page.pointer(p))
                .and_then(JsonValue::as_str)
                .filter(|next| !next.is_empty() && *next != url)
                .map(ToString::to_string);
        }

        // Endpoints without a server-side filter are narrowed here.
        if self.spec.since_param.is_none() {
            rows.retain(|row| submitted_after(row, since));
        }
        info!(source_id = ctx.source_id, pages, rows = rows.len(), "fetched remote rows");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use ksync_storage::HttpClientConfig;
    use serde_json::json;
    use std::io::Write;

    fn ctx(credentials: Option<ClientCredentials>) -> AdapterContext {
        AdapterContext {
            run_id: Uuid::new_v4(),
            source_id: 1,
            credentials,
            tokens: Arc::new(TokenCache::new()),
        }
    }

    fn http() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig::default()).expect("http client")
    }

    fn spec(url: String) -> PagedJsonSpec {
        PagedJsonSpec {
            url,
            rows_pointer: "/value".into(),
            next_pointer: Some("/next".into()),
            id_field: "Id".into(),
            submitted_field: Some("Submitted".into()),
            email_field: Some("Email".into()),
            name_field: None,
            header_row: false,
            since_param: None,
            token_url: None,
            scope: None,
        }
    }

    #[test]
    fn json_scalars_flatten_to_text() {
        assert_eq!(flatten_json_value(&json!("a")), Some("a".into()));
        assert_eq!(flatten_json_value(&json!(12)), Some("12".into()));
        assert_eq!(flatten_json_value(&json!(1.5)), Some("1.5".into()));
        assert_eq!(flatten_json_value(&json!(true)), Some("true".into()));
        assert_eq!(flatten_json_value(&json!(null)), None);
        assert_eq!(flatten_json_value(&json!(["x", 1])), Some("[\"x\",1]".into()));
    }

    #[tokio::test]
    async fn fixture_rows_keep_field_order_and_respect_watermark() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(
            br#"[
                {"natural_id": "1", "submitted_at": "2026-01-01T10:00:00Z",
                 "fields": {"Zona": "Norte", "Local": "Escazu", "Total": 3}},
                {"natural_id": "2", "submitted_at": "2026-03-01T10:00:00Z",
                 "fields": {"Zona": "Sur", "Local": null}}
            ]"#,
        )
        .expect("write");

        let adapter = FixtureAdapter::new(file.path());
        let rows = adapter.fetch_rows(&http(), &ctx(None), None).await.expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].fields.keys().collect::<Vec<_>>(), vec!["Zona", "Local", "Total"]);
        assert_eq!(rows[0].fields["Total"].as_deref(), Some("3"));
        assert_eq!(rows[1].fields["Local"], None);

        let since = parse_timestamp("2026-02-01").expect("ts");
        let rows = adapter.fetch_rows(&http(), &ctx(None), Some(since)).await.expect("rows");
        assert_eq!(rows.iter().map(|r| r.natural_id.as_str()).collect::<Vec<_>>(), vec!["2"]);
    }

    #[tokio::test]
    async fn missing_fixture_file_is_an_error() {
        let adapter = FixtureAdapter::new("/definitely/not/here.json");
        assert!(adapter.fetch_rows(&http(), &ctx(None), None).await.is_err());
    }

    #[tokio::test]
    async fn paged_json_follows_next_links_and_extracts_metadata() {
        let server = MockServer::start_async().await;
        let page2 = server
            .mock_async(|when, then| {
                when.method(GET).path("/rows/2");
                then.status(200).json_body(json!({
                    "value": [{"Id": "b", "Submitted": "2026-02-02T00:00:00Z", "Local": "Curridabat"}]
                }));
            })
            .await;
        let next = server.url("/rows/2");
        let page1 = server
            .mock_async(|when, then| {
                when.method(GET).path("/rows");
                then.status(200).json_body(json!({
                    "value": [
                        {"Id": "a", "Submitted": "2026-02-01T00:00:00Z", "Email": "ana@x.test", "Local": "Escazu"},
                        {"Local": "no id"}
                    ],
                    "next": next
                }));
            })
            .await;

        let adapter = PagedJsonAdapter::new(spec(server.url("/rows")));
        let rows = adapter.fetch_rows(&http(), &ctx(None), None).await.expect("rows");
        page1.assert_async().await;
        page2.assert_async().await;

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].natural_id, "a");
        assert_eq!(rows[0].metadata.respondent_email.as_deref(), Some("ana@x.test"));
        assert!(rows[0].metadata.submitted_at.is_some());
        assert!(!rows[0].fields.contains_key("Id"));
        assert_eq!(rows[1].fields["Local"].as_deref(), Some("Curridabat"));
    }

    #[tokio::test]
    async fn paged_json_keeps_remote_field_order() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/rows");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"value": [{"Id": "a", "Zona": "Norte", "Local": "Escazu", "Cantidad": 4, "Abierto": true}]}"#);
            })
            .await;

        let mut spec = spec(server.url("/rows"));
        spec.next_pointer = None;
        let rows = PagedJsonAdapter::new(spec)
            .fetch_rows(&http(), &ctx(None), None)
            .await
            .expect("rows");
        assert_eq!(
            rows[0].fields.keys().collect::<Vec<_>>(),
            vec!["Zona", "Local", "Cantidad", "Abierto"]
        );
    }

    #[tokio::test]
    async fn header_row_sheets_zip_cells_with_headers() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/sheet");
                then.status(200).json_body(json!({
                    "values": [["Id", "Restaurante", "Monto"], ["r1", "Escazu", 1200], ["r2", "Lindora"]]
                }));
            })
            .await;

        let mut spec = spec(server.url("/sheet"));
        spec.rows_pointer = "/values".into();
        spec.header_row = true;
        spec.submitted_field = None;
        spec.email_field = None;
        let rows = PagedJsonAdapter::new(spec)
            .fetch_rows(&http(), &ctx(None), None)
            .await
            .expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].fields["Monto"].as_deref(), Some("1200"));
        assert_eq!(rows[1].fields["Monto"], None);
    }

    #[tokio::test]
    async fn oauth_tokens_are_cached_between_fetches() {
        let server = MockServer::start_async().await;
        let token = server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200).json_body(json!({"access_token": "tok-1", "expires_in": 3600}));
            })
            .await;
        let rows = server
            .mock_async(|when, then| {
                when.method(GET).path("/rows").header("authorization", "Bearer tok-1");
                then.status(200).json_body(json!({"value": [{"Id": "1"}]}));
            })
            .await;

        let mut spec = spec(server.url("/rows"));
        spec.token_url = Some(server.url("/token"));
        let adapter = PagedJsonAdapter::new(spec);
        let ctx = ctx(Some(ClientCredentials {
            client_id: "id".into(),
            client_secret: "secret".into(),
        }));
        adapter.fetch_rows(&http(), &ctx, None).await.expect("first");
        adapter.fetch_rows(&http(), &ctx, None).await.expect("second");
        token.assert_hits_async(1).await;
        rows.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn token_url_without_credentials_fails_before_any_request() {
        let mut spec = spec("http://127.0.0.1:9/rows".into());
        spec.token_url = Some("http://127.0.0.1:9/token".into());
        let err = PagedJsonAdapter::new(spec)
            .fetch_rows(&http(), &ctx(None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Credentials(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn server_errors_are_reported_as_transient() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/rows");
                then.status(503);
            })
            .await;
        let err = PagedJsonAdapter::new(spec(server.url("/rows")))
            .fetch_rows(&http(), &ctx(None), None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
