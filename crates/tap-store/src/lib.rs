//! Persisted-store trait, the in-memory engine, raw feed archiving, and the
//! shared HTTP transport for the tender acquisition pipeline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::info_span;
use uuid::Uuid;

use tap_core::{
    AlertRule, CandidateActivity, CandidateEngagementSnapshot, JobDefinition, MatchRecord,
    RunRecord, TenderRecord, TenderStatus,
};

pub const CRATE_NAME: &str = "tap-store";

/// How many run records the in-memory engine retains.
const RUN_LOG_CAP: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Outcome of a natural-key tender upsert. On a key hit the existing record
/// comes back untouched and `inserted` is false.
#[derive(Debug, Clone)]
pub struct TenderUpsert {
    pub record: TenderRecord,
    pub inserted: bool,
}

/// The single persisted-store collaborator. Everything the scheduler and the
/// pipeline persist goes through this trait; `MemoryStore` is the in-tree
/// engine and any durable backend would implement the same surface.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_job(&self, name: &str) -> Result<Option<JobDefinition>, StoreError>;
    async fn put_job(&self, job: &JobDefinition) -> Result<(), StoreError>;
    async fn list_jobs(&self) -> Result<Vec<JobDefinition>, StoreError>;

    async fn get_tender_by_key(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<TenderRecord>, StoreError>;
    async fn upsert_tender(&self, record: &TenderRecord) -> Result<TenderUpsert, StoreError>;
    async fn update_tender(&self, record: &TenderRecord) -> Result<(), StoreError>;
    async fn list_tenders(&self) -> Result<Vec<TenderRecord>, StoreError>;
    /// Close every open tender whose closing date is strictly before `now`'s
    /// date. Returns how many moved.
    async fn close_tenders_past(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn list_active_alerts(&self) -> Result<Vec<AlertRule>, StoreError>;
    async fn upsert_alert(&self, alert: &AlertRule) -> Result<(), StoreError>;
    async fn touch_alerts_checked(&self, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Insert unless a match for the same (alert, tender) pair exists.
    /// Returns true when a new record was created.
    async fn insert_match_if_absent(&self, record: &MatchRecord) -> Result<bool, StoreError>;
    async fn mark_match_notified(&self, id: &Uuid) -> Result<(), StoreError>;
    async fn list_matches(&self) -> Result<Vec<MatchRecord>, StoreError>;

    async fn list_candidate_activity(&self) -> Result<Vec<CandidateActivity>, StoreError>;
    async fn upsert_candidate_activity(
        &self,
        activity: &CandidateActivity,
    ) -> Result<(), StoreError>;
    async fn record_engagement_attempt(
        &self,
        candidate_id: &Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn put_engagement_snapshot(
        &self,
        snapshot: &CandidateEngagementSnapshot,
    ) -> Result<(), StoreError>;
    async fn list_engagement_snapshots(
        &self,
    ) -> Result<Vec<CandidateEngagementSnapshot>, StoreError>;

    async fn record_run(&self, run: &RunRecord) -> Result<(), StoreError>;
    /// Newest first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    jobs: HashMap<String, JobDefinition>,
    tenders: HashMap<Uuid, TenderRecord>,
    alerts: HashMap<Uuid, AlertRule>,
    matches: HashMap<Uuid, MatchRecord>,
    candidates: HashMap<Uuid, CandidateActivity>,
    snapshots: HashMap<Uuid, CandidateEngagementSnapshot>,
    runs: Vec<RunRecord>,
}

/// In-memory store engine backing the daemon and the test suites.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_job(&self, name: &str) -> Result<Option<JobDefinition>, StoreError> {
        Ok(self.inner.read().await.jobs.get(name).cloned())
    }

    async fn put_job(&self, job: &JobDefinition) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .jobs
            .insert(job.name.clone(), job.clone());
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<JobDefinition>, StoreError> {
        let mut jobs: Vec<_> = self.inner.read().await.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    async fn get_tender_by_key(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<TenderRecord>, StoreError> {
        let id = TenderRecord::deterministic_id(source, external_id);
        Ok(self.inner.read().await.tenders.get(&id).cloned())
    }

    async fn upsert_tender(&self, record: &TenderRecord) -> Result<TenderUpsert, StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.tenders.get(&record.id) {
            return Ok(TenderUpsert {
                record: existing.clone(),
                inserted: false,
            });
        }
        inner.tenders.insert(record.id, record.clone());
        Ok(TenderUpsert {
            record: record.clone(),
            inserted: true,
        })
    }

    async fn update_tender(&self, record: &TenderRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.tenders.contains_key(&record.id) {
            return Err(StoreError::NotFound {
                entity: "tender",
                key: record.id.to_string(),
            });
        }
        inner.tenders.insert(record.id, record.clone());
        Ok(())
    }

    async fn list_tenders(&self) -> Result<Vec<TenderRecord>, StoreError> {
        let mut tenders: Vec<_> = self.inner.read().await.tenders.values().cloned().collect();
        tenders.sort_by(|a, b| (&a.source, &a.external_id).cmp(&(&b.source, &b.external_id)));
        Ok(tenders)
    }

    async fn close_tenders_past(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let today = now.date_naive();
        let mut closed = 0;
        let mut inner = self.inner.write().await;
        for tender in inner.tenders.values_mut() {
            if tender.status == TenderStatus::Closed {
                continue;
            }
            if matches!(tender.closing_date, Some(date) if date < today) {
                tender.status = TenderStatus::Closed;
                tender.updated_at = now;
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn list_active_alerts(&self) -> Result<Vec<AlertRule>, StoreError> {
        let mut alerts: Vec<_> = self
            .inner
            .read()
            .await
            .alerts
            .values()
            .filter(|a| a.active)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| a.keyword.cmp(&b.keyword));
        Ok(alerts)
    }

    async fn upsert_alert(&self, alert: &AlertRule) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .alerts
            .insert(alert.id, alert.clone());
        Ok(())
    }

    async fn touch_alerts_checked(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for alert in inner.alerts.values_mut() {
            if alert.active {
                alert.last_checked = Some(at);
            }
        }
        Ok(())
    }

    async fn insert_match_if_absent(&self, record: &MatchRecord) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.matches.contains_key(&record.id) {
            return Ok(false);
        }
        inner.matches.insert(record.id, record.clone());
        Ok(true)
    }

    async fn mark_match_notified(&self, id: &Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.matches.get_mut(id) {
            Some(record) => {
                record.notified = true;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "match",
                key: id.to_string(),
            }),
        }
    }

    async fn list_matches(&self) -> Result<Vec<MatchRecord>, StoreError> {
        let mut matches: Vec<_> = self.inner.read().await.matches.values().cloned().collect();
        matches.sort_by_key(|m| m.created_at);
        Ok(matches)
    }

    async fn list_candidate_activity(&self) -> Result<Vec<CandidateActivity>, StoreError> {
        let mut candidates: Vec<_> = self
            .inner
            .read()
            .await
            .candidates
            .values()
            .cloned()
            .collect();
        candidates.sort_by_key(|c| c.candidate_id);
        Ok(candidates)
    }

    async fn upsert_candidate_activity(
        &self,
        activity: &CandidateActivity,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .candidates
            .insert(activity.candidate_id, activity.clone());
        Ok(())
    }

    async fn record_engagement_attempt(
        &self,
        candidate_id: &Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.candidates.get_mut(candidate_id) {
            Some(activity) => {
                activity.last_engagement_attempt = Some(at);
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "candidate",
                key: candidate_id.to_string(),
            }),
        }
    }

    async fn put_engagement_snapshot(
        &self,
        snapshot: &CandidateEngagementSnapshot,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .snapshots
            .insert(snapshot.candidate_id, snapshot.clone());
        Ok(())
    }

    async fn list_engagement_snapshots(
        &self,
    ) -> Result<Vec<CandidateEngagementSnapshot>, StoreError> {
        let mut snapshots: Vec<_> = self.inner.read().await.snapshots.values().cloned().collect();
        snapshots.sort_by_key(|s| s.candidate_id);
        Ok(snapshots)
    }

    async fn record_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.runs.push(run.clone());
        if inner.runs.len() > RUN_LOG_CAP {
            let excess = inner.runs.len() - RUN_LOG_CAP;
            inner.runs.drain(..excess);
        }
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.runs.iter().rev().take(limit).cloned().collect())
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable archive of raw feed payloads, addressed by content hash so
/// identical payloads within a day collapse to one file.
#[derive(Debug, Clone)]
pub struct FeedArchive {
    root: PathBuf,
}

impl FeedArchive {
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

    pub fn payload_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(source)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic
    /// temp-file rename.
    pub async fn store_payload(
        &self,
        fetched_at: DateTime<Utc>,
        source: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.payload_relative_path(fetched_at, source, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("archive path always has parent")
            .join(temp_name);

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

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(ArchivedPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedPayload {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp payload {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared HTTP transport: GETs retry transient failures with exponential
/// backoff, POSTs are single-shot (notification delivery is at-most-once).
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
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
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    pub async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.post(url).json(body).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.bytes().await?.to_vec();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
