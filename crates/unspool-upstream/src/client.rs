//! Queue client for the *arr family of applications.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument};
use unspool_config::ServerConfig;
use unspool_core::{ExternalIds, QueueClient, QueueEntry, SourceKind};
use url::Url;

use crate::error::{UpstreamError, UpstreamResult};

const HEADER_API_KEY: &str = "x-api-key";
const DOWNLOAD_ID: &str = "downloadId";

/// Client polling `/api/<version>/queue` on one configured server.
#[derive(Debug, Clone)]
pub struct StarrClient {
    kind: SourceKind,
    origin: String,
    queue_url: Url,
    api_key: String,
    page_size: u32,
    paths: Vec<PathBuf>,
    http: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueuePage {
    #[serde(default)]
    total_records: u64,
    #[serde(default)]
    records: Vec<QueueRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueRecord {
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    output_path: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// API version segment used by an application kind.
#[must_use]
pub const fn api_version(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Lidarr | SourceKind::Readarr => "v1",
        _ => "v3",
    }
}

/// Record keys forwarded as external identifiers, besides `downloadId`.
#[must_use]
pub const fn id_keys(kind: SourceKind) -> &'static [&'static str] {
    match kind {
        SourceKind::Sonarr | SourceKind::Whisparr => &["seriesId", "episodeId"],
        SourceKind::Radarr => &["movieId"],
        SourceKind::Lidarr => &["artistId", "albumId"],
        SourceKind::Readarr => &["authorId", "bookId"],
        SourceKind::Folder | SourceKind::Unknown => &[],
    }
}

impl StarrClient {
    /// Build a client for `server`.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::InvalidUrl`] for an unusable base URL and
    /// [`UpstreamError::Client`] when the HTTP client cannot be built.
    pub fn new(kind: SourceKind, server: &ServerConfig) -> UpstreamResult<Self> {
        let base = server.url.trim_end_matches('/');
        let queue_url = Url::parse(&format!("{base}/api/{}/queue", api_version(kind)))
            .map_err(|source| UpstreamError::InvalidUrl {
                url: server.url.clone(),
                source,
            })?;
        let http = Client::builder()
            .timeout(server.timeout())
            .build()
            .map_err(|source| UpstreamError::Client { source })?;
        Ok(Self {
            kind,
            origin: server.url.clone(),
            queue_url,
            api_key: server.api_key.clone(),
            page_size: server.page_size.max(1),
            paths: server.paths.clone(),
            http,
        })
    }

    /// Fetch every page of the queue.
    ///
    /// # Errors
    ///
    /// Transport failures, non-success statuses and undecodable bodies.
    #[instrument(skip(self), fields(source = self.kind.as_str(), origin = %self.origin))]
    pub async fn fetch_all(&self) -> UpstreamResult<Vec<QueueEntry>> {
        let mut entries = Vec::new();
        let mut page = 1_u32;
        loop {
            let body = self.fetch_page(page).await?;
            let received = body.records.len();
            entries.extend(body.records.into_iter().map(|record| self.entry(record)));
            let collected = u64::try_from(entries.len()).unwrap_or(u64::MAX);
            if received == 0 || collected >= body.total_records {
                break;
            }
            page += 1;
        }
        debug!(records = entries.len(), pages = page, "queue fetched");
        Ok(entries)
    }

    async fn fetch_page(&self, page: u32) -> UpstreamResult<QueuePage> {
        let url = self.queue_url.as_str().to_string();
        let response = self
            .http
            .get(self.queue_url.clone())
            .header(HEADER_API_KEY, &self.api_key)
            .query(&[("page", page), ("pageSize", self.page_size)])
            .send()
            .await
            .map_err(|source| UpstreamError::Request {
                operation: "queue.send",
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                url,
                status: status.as_u16(),
            });
        }
        response
            .json::<QueuePage>()
            .await
            .map_err(|source| UpstreamError::Request {
                operation: "queue.decode",
                url,
                source,
            })
    }

    fn entry(&self, record: QueueRecord) -> QueueEntry {
        let mut external_ids = ExternalIds::new();
        for key in std::iter::once(DOWNLOAD_ID).chain(id_keys(self.kind).iter().copied()) {
            if let Some(value) = record.extra.get(key).filter(|value| !value.is_null()) {
                external_ids.insert(key.to_string(), value.clone());
            }
        }
        let output_path = record
            .output_path
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| resolve_path(&self.paths, &record.title));
        QueueEntry {
            title: record.title,
            status: record.status,
            protocol: record.protocol,
            output_path,
            external_ids,
        }
    }
}

/// First configured download directory holding a child named `title`.
fn resolve_path(paths: &[PathBuf], title: &str) -> Option<PathBuf> {
    if title.is_empty() {
        return None;
    }
    paths
        .iter()
        .map(|root| root.join(title))
        .find(|candidate| Path::exists(candidate))
}

#[async_trait]
impl QueueClient for StarrClient {
    fn source(&self) -> SourceKind {
        self.kind
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    async fn fetch_queue(&self) -> anyhow::Result<Vec<QueueEntry>> {
        Ok(self.fetch_all().await?)
    }
}
