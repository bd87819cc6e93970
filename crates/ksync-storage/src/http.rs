//! HTTP fetch utilities shared by remote source adapters.
//!
//! Requests are issued once: a transient failure is reported as such and the
//! caller (ultimately the scheduler) decides whether to try again.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transience {
    Transient,
    Permanent,
}

pub fn classify_status(status: StatusCode) -> Transience {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Transience::Transient
    } else {
        Transience::Permanent
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> Transience {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Transience::Transient
    } else {
        Transience::Permanent
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Build(String),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("response from {url} is not valid json: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    pub fn transience(&self) -> Transience {
        match self {
            Self::Request { source, .. } => classify_reqwest_error(source),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(Transience::Permanent),
            Self::Build(_) | Self::Decode { .. } => Transience::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transience() == Transience::Transient
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|err| FetchError::Build(format!("building reqwest client: {err}")))?;
        Ok(Self { client })
    }

    /// GET `url` and decode a JSON body, optionally with a bearer token.
    pub async fn get_json(
        &self,
        url: &str,
        bearer: Option<&str>,
        query: &[(String, String)],
    ) -> Result<JsonValue, FetchError> {
        let mut request = self.client.get(url).header("Accept", "application/json");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        debug!(url, "http get");
        self.send_json(url, request).await
    }

    /// POST an urlencoded form and decode a JSON body (OAuth token endpoints).
    pub async fn post_form_json(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<JsonValue, FetchError> {
        let request = self.client.post(url).form(form);
        debug!(url, "http post form");
        self.send_json(url, request).await
    }

    async fn send_json(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<JsonValue, FetchError> {
        let resp = request.send().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.bytes().await.map_err(|source| FetchError::Request {
            url: final_url.clone(),
            source,
        })?;

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                body: String::from_utf8_lossy(&body).chars().take(200).collect(),
            });
        }

        serde_json::from_slice(&body).map_err(|err| FetchError::Decode {
            url: final_url,
            message: err.to_string(),
        })
    }
}
