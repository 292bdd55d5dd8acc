//! HTTP fetch utilities, raw page archive and contract persistence for bidscope.

mod memory;
mod postgres;
mod store;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub use memory::MemoryContractStore;
pub use postgres::PgContractStore;
pub use store::{
    BulkWriteOutcome, ContractFilter, ContractPage, ContractQuery, ContractStore, UpsertSink,
    WriteFailure, WriteSummary, BATCH_SIZE, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};

pub const CRATE_NAME: &str = "bidscope-storage";

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed copy of every upstream response body, for diagnosing field drift.
#[derive(Debug, Clone)]
pub struct RawPageArchive {
    root: PathBuf,
}

impl RawPageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(source_id)
            .join(format!("{content_hash}.json"))
    }

    /// Store a page body once; identical bodies on the same day share a path.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let deduplicated = if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            true
        } else {
            !write_atomically(&parent, &absolute_path, bytes).await?
        };

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Writes through a temp file + rename. Returns `false` when another writer won the race.
async fn write_atomically(dir: &Path, dest: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, dest).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(false)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "renaming temp archive file {} -> {}",
                    temp_path.display(),
                    dest.display()
                )
            })
        }
    }
}

/// How a failed upstream request affects the run that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Rate limiting, server errors, timeouts: stop paging, keep what we have.
    Transient,
    Fatal,
}

pub fn classify_status(status: StatusCode) -> FailureClass {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        FailureClass::Transient
    } else {
        FailureClass::Fatal
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> FailureClass {
    if err.is_timeout() {
        FailureClass::Transient
    } else if let Some(status) = err.status() {
        classify_status(status)
    } else {
        FailureClass::Fatal
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn class(&self) -> FailureClass {
        match self {
            FetchError::Request { source, .. } => classify_reqwest_error(source),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(FailureClass::Fatal),
            FetchError::Decode { .. } => FailureClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub archive_dir: Option<PathBuf>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            archive_dir: None,
        }
    }
}

/// Shared JSON client for all upstream sources.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    archive: Option<RawPageArchive>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
            archive: config.archive_dir.map(RawPageArchive::new),
        })
    }

    /// GET `url` with `query` and decode the body as JSON.
    ///
    /// Transient failures are retried per the backoff policy before being
    /// returned. Query parameters (which may carry API keys) never appear in
    /// logs or error messages.
    pub async fn fetch_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);

        async {
            let mut attempt = 0usize;
            loop {
                let err = match self.send_once(source_id, url, query).await {
                    Ok(value) => return Ok(value),
                    Err(err) => err,
                };
                if !err.is_transient() || attempt >= self.backoff.max_retries {
                    return Err(err);
                }
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(attempt, ?delay, error = %err, "transient upstream failure; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }

    async fn send_once(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source: source.without_url(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = resp.bytes().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source: source.without_url(),
        })?;
        debug!(bytes = body.len(), "fetched upstream page");

        if let Some(archive) = &self.archive {
            if let Err(err) = archive.store_page(Utc::now(), source_id, &body).await {
                warn!(error = %err, "failed to archive raw page");
            }
        }

        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn page_hashing_is_stable() {
        let hash = RawPageArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_pages_share_one_archive_entry() {
        let dir = tempdir().expect("tempdir");
        let archive = RawPageArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_page(fetched_at, "federal", br#"{"opportunitiesData":[]}"#)
            .await
            .expect("first store");
        let second = archive
            .store_page(fetched_at, "federal", br#"{"opportunitiesData":[]}"#)
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20260224/federal"));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), FailureClass::Transient);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), FailureClass::Transient);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), FailureClass::Fatal);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), FailureClass::Fatal);

        let rate_limited = FetchError::HttpStatus {
            status: 429,
            url: "https://api.sam.gov/opportunities/v2/search".into(),
        };
        assert!(rate_limited.is_transient());
        let forbidden = FetchError::HttpStatus {
            status: 403,
            url: "https://api.sam.gov/opportunities/v2/search".into(),
        };
        assert!(!forbidden.is_transient());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
        assert_eq!(BackoffPolicy::none().max_retries, 0);
    }
}
