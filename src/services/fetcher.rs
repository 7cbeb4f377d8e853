use crate::models::{CatalogSnapshot, ErrorKind, Source};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::time::Duration;
use thiserror::Error;

/// Errors a [`CatalogFetcher`] may return.
///
/// Each variant corresponds to exactly one [`ErrorKind`] recorded on the job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to parse catalog: {0}")]
    Parse(String),

    #[error("Remote catalog unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Fetch failed: {0}")]
    Unknown(String),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::NetworkError,
            Self::Parse(_) => ErrorKind::ParseError,
            Self::RemoteUnavailable(_) => ErrorKind::RemoteUnavailable,
            Self::Unknown(_) => ErrorKind::UnknownFetchError,
        }
    }
}

/// Produces a full catalog snapshot for one source.
#[async_trait]
pub trait CatalogFetcher: Send + Sync {
    async fn fetch(&self, source: &Source) -> Result<CatalogSnapshot, FetchError>;
}

/// Fetches a JSON [`CatalogSnapshot`] over HTTP, one endpoint per source id.
pub struct HttpCatalogFetcher {
    client: reqwest::Client,
    endpoints: IndexMap<String, String>,
}

impl HttpCatalogFetcher {
    pub fn new(endpoints: IndexMap<String, String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Unknown(e.to_string()))?;

        Ok(Self { client, endpoints })
    }

    pub fn endpoint(&self, source_id: &str) -> Option<&str> {
        self.endpoints.get(source_id).map(String::as_str)
    }
}

fn classify_transport(e: reqwest::Error) -> FetchError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        FetchError::Network(e.to_string())
    } else if e.is_decode() {
        FetchError::Parse(e.to_string())
    } else {
        FetchError::Unknown(e.to_string())
    }
}

fn classify_status(status: reqwest::StatusCode) -> Option<FetchError> {
    if status.is_success() {
        None
    } else if status.is_server_error() || status == reqwest::StatusCode::NOT_FOUND {
        Some(FetchError::RemoteUnavailable(format!("HTTP {}", status)))
    } else {
        Some(FetchError::Unknown(format!("HTTP {}", status)))
    }
}

#[async_trait]
impl CatalogFetcher for HttpCatalogFetcher {
    async fn fetch(&self, source: &Source) -> Result<CatalogSnapshot, FetchError> {
        let Some(url) = self.endpoint(source.id) else {
            return Err(FetchError::RemoteUnavailable(format!(
                "no endpoint configured for {}",
                source.id
            )));
        };

        tracing::debug!("Fetching catalog for {} from {}", source.id, url);
        let response = self.client.get(url).send().await.map_err(classify_transport)?;

        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }

        let body = response.text().await.map_err(classify_transport)?;
        let snapshot: CatalogSnapshot =
            serde_json::from_str(&body).map_err(|e| FetchError::Parse(e.to_string()))?;

        tracing::debug!(
            "Fetched {} entities for {} ({} bytes)",
            snapshot.len(),
            source.id,
            body.len()
        );
        Ok(snapshot)
    }
}
