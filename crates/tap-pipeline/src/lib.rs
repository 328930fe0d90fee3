//! Pipeline orchestration: feed ingestion, alert matching, notification
//! delivery, tender enrichment, and the daily candidate scoring pass.
//!
//! The two entry points are `IngestionJob` and `ScoringJob`, registered with
//! the scheduler by the daemon. Everything they touch goes through the
//! `JobContext` collaborators so tests can swap in fixture feeds, recording
//! gateways, and scripted analyzers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use tap_core::{
    AlertRule, CandidateActivity, CandidateEngagementSnapshot, EngagementTier, MatchRecord,
    Recurrence, RunRecord, TenderAnalysis, TenderRecord, TenderStatus,
};
use tap_feed::{CategoryRules, Extractor, FeedClient, FeedItem, FixtureFeedClient, HttpFeedClient};
use tap_sched::{JobHandler, JobSpec, DEFAULT_MAX_CONSECUTIVE_FAILURES};
use tap_store::{
    FeedArchive, FetchError, HttpClientConfig, HttpFetcher, Store, StoreError,
};

pub const CRATE_NAME: &str = "tap-pipeline";

pub const INGESTION_JOB: &str = "tender-ingestion";
pub const SCORING_JOB: &str = "candidate-scoring";

/// Same-source title similarity at or above this raises a duplicate advisory.
pub const DUPLICATE_ADVISORY_THRESHOLD: f64 = 0.95;

/// Confidence attached to rule-derived analyses. Kept below the default
/// remote floor so a usable remote answer always wins the merge.
const RULE_CONFIDENCE: f64 = 0.4;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub feed_url: String,
    pub feed_fixture: Option<PathBuf>,
    pub feed_source: String,
    pub category_rules_file: Option<PathBuf>,
    pub ingest_every_minutes: u32,
    pub scoring_daily_at: (u32, u32),
    pub job_timeout_secs: u64,
    pub max_consecutive_failures: u32,
    pub notify_webhook_url: Option<String>,
    pub analyzer_url: Option<String>,
    pub analyzer_timeout_secs: u64,
    pub analyzer_min_confidence: f64,
    pub web_port: u16,
    pub alerts_file: Option<PathBuf>,
    pub candidates_file: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            feed_url: std::env::var("TAP_FEED_URL")
                .unwrap_or_else(|_| "https://www.gebiz.gov.sg/feeds/opportunities.json".to_string()),
            feed_fixture: std::env::var("TAP_FEED_FIXTURE").ok().map(PathBuf::from),
            feed_source: std::env::var("TAP_FEED_SOURCE").unwrap_or_else(|_| "gebiz".to_string()),
            category_rules_file: std::env::var("TAP_CATEGORY_RULES").ok().map(PathBuf::from),
            ingest_every_minutes: std::env::var("TAP_INGEST_EVERY_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            scoring_daily_at: std::env::var("TAP_SCORING_DAILY_AT")
                .ok()
                .and_then(|v| parse_daily_at(&v))
                .unwrap_or((2, 0)),
            job_timeout_secs: std::env::var("TAP_JOB_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            max_consecutive_failures: std::env::var("TAP_MAX_CONSECUTIVE_FAILURES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES),
            notify_webhook_url: std::env::var("TAP_NOTIFY_WEBHOOK_URL").ok(),
            analyzer_url: std::env::var("TAP_ANALYZER_URL").ok(),
            analyzer_timeout_secs: std::env::var("TAP_ANALYZER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            analyzer_min_confidence: std::env::var("TAP_ANALYZER_MIN_CONFIDENCE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.5),
            web_port: std::env::var("TAP_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            alerts_file: std::env::var("TAP_ALERTS_FILE").ok().map(PathBuf::from),
            candidates_file: std::env::var("TAP_CANDIDATES_FILE").ok().map(PathBuf::from),
            artifacts_dir: std::env::var("TAP_ARTIFACTS_DIR").ok().map(PathBuf::from),
            user_agent: std::env::var("TAP_USER_AGENT")
                .unwrap_or_else(|_| "tap-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("TAP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

fn parse_daily_at(value: &str) -> Option<(u32, u32)> {
    let (hour, minute) = value.trim().split_once(':')?;
    let hour: u32 = hour.trim().parse().ok()?;
    let minute: u32 = minute.trim().parse().ok()?;
    (hour <= 23 && minute <= 59).then_some((hour, minute))
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("notification transport: {0}")]
    Transport(#[from] FetchError),
}

/// Outbound notification seam. `notify_match` delivery is at-most-once: the
/// caller marks the match notified only after this returns Ok.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify_match(
        &self,
        alert: &AlertRule,
        tender: &TenderRecord,
        record: &MatchRecord,
    ) -> Result<(), GatewayError>;

    async fn notify_engagement(
        &self,
        candidate: &CandidateActivity,
        score: u8,
        tier: EngagementTier,
    ) -> Result<(), GatewayError>;
}

/// Default gateway when no webhook is configured: notifications land in the
/// structured log and nothing leaves the process.
#[derive(Debug, Default)]
pub struct LogGateway;

#[async_trait]
impl NotificationGateway for LogGateway {
    async fn notify_match(
        &self,
        alert: &AlertRule,
        tender: &TenderRecord,
        _record: &MatchRecord,
    ) -> Result<(), GatewayError> {
        info!(
            keyword = %alert.keyword,
            tender = %tender.external_id,
            title = %tender.title,
            "match notification (log only)"
        );
        Ok(())
    }

    async fn notify_engagement(
        &self,
        candidate: &CandidateActivity,
        score: u8,
        tier: EngagementTier,
    ) -> Result<(), GatewayError> {
        info!(
            candidate = %candidate.candidate_id,
            score,
            tier = tier.as_str(),
            "engagement message (log only)"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct MatchWebhookPayload<'a> {
    kind: &'static str,
    match_id: Uuid,
    keyword: &'a str,
    tender_title: &'a str,
    agency: Option<&'a str>,
    closing_date: Option<NaiveDate>,
    external_url: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct EngagementWebhookPayload<'a> {
    kind: &'static str,
    candidate_id: Uuid,
    score: u8,
    tier: &'a str,
}

/// Posts notifications to a configured webhook endpoint, one request per
/// notification, no retries.
pub struct WebhookGateway {
    fetcher: Arc<HttpFetcher>,
    url: String,
}

impl WebhookGateway {
    pub fn new(fetcher: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationGateway for WebhookGateway {
    async fn notify_match(
        &self,
        alert: &AlertRule,
        tender: &TenderRecord,
        record: &MatchRecord,
    ) -> Result<(), GatewayError> {
        let payload = MatchWebhookPayload {
            kind: "tender_match",
            match_id: record.id,
            keyword: &alert.keyword,
            tender_title: &tender.title,
            agency: tender.agency.as_deref(),
            closing_date: tender.closing_date,
            external_url: tender.external_url.as_deref(),
        };
        self.fetcher.post_json(&self.url, &payload).await?;
        Ok(())
    }

    async fn notify_engagement(
        &self,
        candidate: &CandidateActivity,
        score: u8,
        tier: EngagementTier,
    ) -> Result<(), GatewayError> {
        let payload = EngagementWebhookPayload {
            kind: "candidate_engagement",
            candidate_id: candidate.candidate_id,
            score,
            tier: tier.as_str(),
        };
        self.fetcher.post_json(&self.url, &payload).await?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analyzer transport: {0}")]
    Transport(#[from] FetchError),
    #[error("analyzer response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("analyzer timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait TenderAnalyzer: Send + Sync {
    async fn analyze(&self, tender: &TenderRecord) -> Result<TenderAnalysis, AnalyzerError>;
}

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    title: &'a str,
    agency: Option<&'a str>,
    category: &'a str,
    estimated_value: Option<f64>,
    closing_date: Option<NaiveDate>,
    location: Option<&'a str>,
}

/// Calls the external analysis service. The whole exchange runs under its
/// own deadline so a slow analyzer cannot stall an ingestion run.
pub struct RemoteAnalyzer {
    fetcher: Arc<HttpFetcher>,
    url: String,
    timeout: Duration,
}

impl RemoteAnalyzer {
    pub fn new(fetcher: Arc<HttpFetcher>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            fetcher,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl TenderAnalyzer for RemoteAnalyzer {
    async fn analyze(&self, tender: &TenderRecord) -> Result<TenderAnalysis, AnalyzerError> {
        let request = AnalyzeRequest {
            title: &tender.title,
            agency: tender.agency.as_deref(),
            category: &tender.category,
            estimated_value: tender.estimated_value,
            closing_date: tender.closing_date,
            location: tender.location.as_deref(),
        };
        let response = tokio::time::timeout(self.timeout, self.fetcher.post_json(&self.url, &request))
            .await
            .map_err(|_| AnalyzerError::Timeout(self.timeout))??;
        Ok(serde_json::from_slice(&response.body)?)
    }
}

fn baseline_skills(category: &str) -> Vec<String> {
    let skills: &[&str] = match category {
        "Cleaning Services" => &["general cleaning", "equipment handling"],
        "Security Services" => &["licensed security officer"],
        "Facilities Management" => &["facilities maintenance"],
        "Landscaping" => &["horticulture"],
        "IT Services" => &["software support"],
        "Manpower Services" => &["recruitment coordination"],
        "Event Support" => &["event operations"],
        _ => &[],
    };
    skills.iter().map(|s| s.to_string()).collect()
}

/// Deterministic analysis derived from the extracted fields alone. Runs for
/// every new tender, with or without a remote analyzer.
pub fn rule_analysis(tender: &TenderRecord, today: NaiveDate) -> TenderAnalysis {
    let estimated_manpower = tender
        .estimated_value
        .map(|value| ((value / 60_000.0).ceil() as u32).clamp(1, 200));
    let duration_months = tender.estimated_value.map(|value| {
        if value >= 500_000.0 {
            24
        } else if value >= 100_000.0 {
            12
        } else {
            6
        }
    });
    let urgency_score = tender.closing_date.map(|closing| {
        match (closing - today).num_days() {
            ..=7 => 90,
            8..=14 => 75,
            15..=30 => 50,
            _ => 25,
        }
    });
    let complexity_score = Some(match tender.estimated_value {
        Some(value) if value >= 250_000.0 => 80,
        Some(value) if value >= 50_000.0 => 55,
        Some(_) => 30,
        None => 40,
    });

    TenderAnalysis {
        category: Some(tender.category.clone()),
        estimated_manpower,
        duration_months,
        skills_required: baseline_skills(&tender.category),
        urgency_score,
        complexity_score,
        confidence: RULE_CONFIDENCE,
    }
}

/// Remote answers below the confidence floor are discarded wholesale;
/// above it, remote fields win and rule fields fill the gaps.
pub fn merge_analysis(
    rule: TenderAnalysis,
    remote: TenderAnalysis,
    min_confidence: f64,
) -> TenderAnalysis {
    if remote.confidence < min_confidence {
        return rule;
    }
    TenderAnalysis {
        category: remote.category.or(rule.category),
        estimated_manpower: remote.estimated_manpower.or(rule.estimated_manpower),
        duration_months: remote.duration_months.or(rule.duration_months),
        skills_required: if remote.skills_required.is_empty() {
            rule.skills_required
        } else {
            remote.skills_required
        },
        urgency_score: remote.urgency_score.or(rule.urgency_score),
        complexity_score: remote.complexity_score.or(rule.complexity_score),
        confidence: remote.confidence,
    }
}

/// Everything a job execution needs. Collaborators are trait objects so the
/// daemon and the tests wire different transports into the same flow.
pub struct JobContext {
    pub store: Arc<dyn Store>,
    pub feed: Arc<dyn FeedClient>,
    pub gateway: Arc<dyn NotificationGateway>,
    pub analyzer: Option<Arc<dyn TenderAnalyzer>>,
    pub archive: Option<FeedArchive>,
    pub extractor: Extractor,
    pub analyzer_min_confidence: f64,
}

impl JobContext {
    pub fn from_config(config: &AppConfig, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);

        let feed: Arc<dyn FeedClient> = match &config.feed_fixture {
            Some(path) => Arc::new(FixtureFeedClient::new(&config.feed_source, path)),
            None => Arc::new(HttpFeedClient::new(
                &config.feed_source,
                &config.feed_url,
                fetcher.clone(),
            )),
        };

        let gateway: Arc<dyn NotificationGateway> = match &config.notify_webhook_url {
            Some(url) => Arc::new(WebhookGateway::new(fetcher.clone(), url)),
            None => Arc::new(LogGateway),
        };

        let analyzer = config.analyzer_url.as_ref().map(|url| {
            Arc::new(RemoteAnalyzer::new(
                fetcher.clone(),
                url,
                Duration::from_secs(config.analyzer_timeout_secs),
            )) as Arc<dyn TenderAnalyzer>
        });

        let archive = config.artifacts_dir.as_ref().map(FeedArchive::new);

        let rules = match &config.category_rules_file {
            Some(path) => CategoryRules::from_yaml_file(path)
                .with_context(|| format!("loading category rules from {}", path.display()))?,
            None => CategoryRules::builtin(),
        };

        Ok(Self {
            store,
            feed,
            gateway,
            analyzer,
            archive,
            extractor: Extractor::new(&config.feed_source, rules),
            analyzer_min_confidence: config.analyzer_min_confidence,
        })
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct AlertSeedFile {
    #[serde(default)]
    alerts: Vec<AlertSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertSeed {
    pub keyword: String,
    #[serde(default = "default_true")]
    pub email_notify: bool,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Load alert rules from a YAML file. Ids are derived from the keyword, so
/// reseeding the same file never duplicates rules.
pub async fn seed_alerts(store: &dyn Store, path: &Path) -> anyhow::Result<usize> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: AlertSeedFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let now = Utc::now();
    let mut seeded = 0;
    for seed in file.alerts {
        let id = Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("alert:{}", seed.keyword).as_bytes(),
        );
        store
            .upsert_alert(&AlertRule {
                id,
                keyword: seed.keyword,
                email_notify: seed.email_notify,
                active: seed.active,
                last_checked: None,
                created_at: now,
            })
            .await?;
        seeded += 1;
    }
    Ok(seeded)
}

#[derive(Debug, Deserialize)]
struct CandidateSeedFile {
    #[serde(default)]
    candidates: Vec<CandidateActivity>,
}

pub async fn seed_candidates(store: &dyn Store, path: &Path) -> anyhow::Result<usize> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: CandidateSeedFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let count = file.candidates.len();
    for activity in &file.candidates {
        store.upsert_candidate_activity(activity).await?;
    }
    Ok(count)
}

pub async fn seed_from_config(config: &AppConfig, store: &dyn Store) -> anyhow::Result<()> {
    if let Some(path) = &config.alerts_file {
        let seeded = seed_alerts(store, path).await?;
        info!(count = seeded, path = %path.display(), "seeded alert rules");
    }
    if let Some(path) = &config.candidates_file {
        let seeded = seed_candidates(store, path).await?;
        info!(count = seeded, path = %path.display(), "seeded candidate activity");
    }
    Ok(())
}

/// Case-insensitive alert matching: the keyword matches as a contiguous
/// phrase, or when every word of it appears somewhere in the haystack.
pub fn keyword_matches(keyword: &str, haystack: &str) -> bool {
    let keyword = keyword.trim().to_lowercase();
    if keyword.is_empty() {
        return false;
    }
    let haystack = haystack.to_lowercase();
    if haystack.contains(&keyword) {
        return true;
    }
    keyword.split_whitespace().all(|word| haystack.contains(word))
}

/// Composite candidate score on a 0..=100 scale: profile completeness (25),
/// activity recency (25), application volume (20), hire rate (15), and
/// message responsiveness (15).
pub fn composite_score(activity: &CandidateActivity, now: DateTime<Utc>) -> u8 {
    let mut score = 0u32;

    let flags = [
        activity.has_resume,
        activity.has_skills,
        activity.has_availability,
        activity.has_contact,
        activity.has_preferences,
    ];
    score += flags.iter().filter(|&&set| set).count() as u32 * 5;

    if let Some(last_active) = activity.last_active_at {
        let days = (now - last_active).num_days();
        score += if days <= 7 {
            25
        } else if days <= 30 {
            15
        } else if days <= 90 {
            5
        } else {
            0
        };
    }

    score += activity.recent_applications.min(10) * 2;

    if activity.recent_applications > 0 {
        let rate = f64::from(activity.recent_hires) / f64::from(activity.recent_applications);
        score += (rate.clamp(0.0, 1.0) * 15.0).round() as u32;
    }

    score += activity.recent_messages.min(5) * 3;

    score.min(100) as u8
}

/// Tier policy for outreach: intensive candidates are contacted every run,
/// moderate after a week of silence, maintain after a month.
pub fn engagement_due(
    tier: EngagementTier,
    last_attempt: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match tier {
        EngagementTier::Intensive => true,
        EngagementTier::Moderate => {
            last_attempt.is_none_or(|at| now - at > chrono::Duration::days(7))
        }
        EngagementTier::Maintain => {
            last_attempt.is_none_or(|at| now - at > chrono::Duration::days(30))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub run_id: Uuid,
    /// Items that made it through extraction and persistence; items that
    /// failed mid-pipeline land in `errors` instead.
    pub tenders_processed: usize,
    pub new_tenders: usize,
    pub new_matches: usize,
    pub notifications_sent: usize,
    pub possible_duplicates: usize,
    pub tenders_closed: u64,
    pub errors: Vec<String>,
}

impl IngestionReport {
    pub fn summary_line(&self) -> String {
        format!(
            "processed {} items ({} new), {} new matches ({} notified), {} duplicate advisories, {} closed, {} errors",
            self.tenders_processed,
            self.new_tenders,
            self.new_matches,
            self.notifications_sent,
            self.possible_duplicates,
            self.tenders_closed,
            self.errors.len()
        )
    }
}

/// One full ingestion pass. Per-item failures are collected, not fatal; only
/// a feed-level failure aborts the run, and even that still counts as an
/// alert check.
pub async fn run_ingestion(ctx: &JobContext, run_id: Uuid) -> anyhow::Result<IngestionReport> {
    let span = info_span!("ingestion_run", %run_id);
    let _guard = span.enter();

    let now = Utc::now();
    let fetched = match ctx.feed.fetch(run_id).await {
        Ok(fetched) => fetched,
        Err(err) => {
            ctx.store.touch_alerts_checked(now).await?;
            return Err(anyhow::Error::new(err).context("fetching tender feed"));
        }
    };
    info!(items = fetched.items.len(), from = %fetched.fetched_from, "fetched tender feed");

    if let Some(archive) = &ctx.archive {
        let stored = archive
            .store_payload(now, ctx.feed.source(), "json", &fetched.raw)
            .await
            .context("archiving feed payload")?;
        info!(
            hash = %stored.content_hash,
            deduplicated = stored.deduplicated,
            bytes = stored.byte_size,
            "archived feed payload"
        );
    }

    let alerts = ctx.store.list_active_alerts().await?;
    let today = now.date_naive();
    let mut report = IngestionReport {
        run_id,
        tenders_processed: 0,
        new_tenders: 0,
        new_matches: 0,
        notifications_sent: 0,
        possible_duplicates: 0,
        tenders_closed: 0,
        errors: Vec::new(),
    };

    for item in &fetched.items {
        match ingest_item(ctx, &alerts, item, today, now, &mut report).await {
            Ok(()) => report.tenders_processed += 1,
            Err(err) => {
                let label = if item.title.trim().is_empty() {
                    "(untitled)"
                } else {
                    item.title.trim()
                };
                warn!(item = label, error = %format!("{err:#}"), "feed item failed; continuing");
                report.errors.push(format!("{label}: {err:#}"));
            }
        }
    }

    report.tenders_closed = ctx.store.close_tenders_past(now).await?;
    ctx.store.touch_alerts_checked(now).await?;

    info!(
        processed = report.tenders_processed,
        new = report.new_tenders,
        matches = report.new_matches,
        duplicates = report.possible_duplicates,
        closed = report.tenders_closed,
        errors = report.errors.len(),
        "ingestion run finished"
    );
    Ok(report)
}

async fn ingest_item(
    ctx: &JobContext,
    alerts: &[AlertRule],
    item: &FeedItem,
    today: NaiveDate,
    now: DateTime<Utc>,
    report: &mut IngestionReport,
) -> anyhow::Result<()> {
    let draft = ctx.extractor.extract(item, today)?;
    let candidate = TenderRecord::from_draft(draft, now);
    let upsert = ctx.store.upsert_tender(&candidate).await?;
    let mut record = upsert.record;

    if upsert.inserted {
        report.new_tenders += 1;
        if let Some((twin, score)) = nearest_duplicate(ctx, &record).await? {
            report.possible_duplicates += 1;
            warn!(
                tender = %record.external_id,
                twin = %twin,
                similarity = score,
                "possible duplicate tender"
            );
        }
    }

    if record.status == TenderStatus::New {
        record = enrich_tender(ctx, record, today, now).await?;
    }

    let haystack = format!("{} {}", record.title, record.category);
    for alert in alerts {
        if !keyword_matches(&alert.keyword, &haystack) {
            continue;
        }
        let match_record = MatchRecord {
            id: MatchRecord::deterministic_id(&alert.id, &record.id),
            alert_id: alert.id,
            tender_id: record.id,
            title: record.title.clone(),
            external_url: record.external_url.clone(),
            matched_keyword: alert.keyword.clone(),
            notified: false,
            created_at: now,
        };
        if !ctx.store.insert_match_if_absent(&match_record).await? {
            continue;
        }
        report.new_matches += 1;
        info!(keyword = %alert.keyword, tender = %record.external_id, "new alert match");

        if alert.email_notify {
            match ctx.gateway.notify_match(alert, &record, &match_record).await {
                Ok(()) => {
                    ctx.store.mark_match_notified(&match_record.id).await?;
                    report.notifications_sent += 1;
                }
                Err(err) => {
                    warn!(keyword = %alert.keyword, error = %err, "match notification failed");
                    report.errors.push(format!("notify {}: {err}", alert.keyword));
                }
            }
        }
    }

    Ok(())
}

/// Advisory only: flags the closest same-source title twin at or above the
/// threshold. The record is kept either way.
async fn nearest_duplicate(
    ctx: &JobContext,
    record: &TenderRecord,
) -> Result<Option<(String, f64)>, StoreError> {
    let title = record.title.to_lowercase();
    let mut best: Option<(String, f64)> = None;
    for other in ctx.store.list_tenders().await? {
        if other.id == record.id || other.source != record.source {
            continue;
        }
        let score = jaro_winkler(&title, &other.title.to_lowercase());
        if score >= DUPLICATE_ADVISORY_THRESHOLD
            && best.as_ref().map_or(true, |(_, s)| score > *s)
        {
            best = Some((other.external_id.clone(), score));
        }
    }
    Ok(best)
}

/// Attach an analysis and move the tender to Analyzed. A remote analyzer
/// failure downgrades to the rule analysis instead of failing the item.
async fn enrich_tender(
    ctx: &JobContext,
    mut record: TenderRecord,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> anyhow::Result<TenderRecord> {
    let baseline = rule_analysis(&record, today);
    let analysis = match &ctx.analyzer {
        Some(analyzer) => match analyzer.analyze(&record).await {
            Ok(remote) => merge_analysis(baseline, remote, ctx.analyzer_min_confidence),
            Err(err) => {
                warn!(
                    tender = %record.external_id,
                    error = %err,
                    "remote analysis failed; keeping rule analysis"
                );
                baseline
            }
        },
        None => baseline,
    };

    record.analysis = Some(analysis);
    record.status = TenderStatus::Analyzed;
    record.updated_at = now;
    ctx.store.update_tender(&record).await?;
    Ok(record)
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoringReport {
    pub run_id: Uuid,
    pub candidates_scored: usize,
    pub intensive: usize,
    pub moderate: usize,
    pub maintain: usize,
    pub messages_sent: usize,
    pub errors: Vec<String>,
}

impl ScoringReport {
    pub fn summary_line(&self) -> String {
        format!(
            "scored {} candidates ({} intensive, {} moderate, {} maintain), {} engagement messages, {} errors",
            self.candidates_scored,
            self.intensive,
            self.moderate,
            self.maintain,
            self.messages_sent,
            self.errors.len()
        )
    }
}

/// One scoring pass over every candidate: compute the composite score, pick
/// the tier, send outreach where the tier policy says it is due, and persist
/// a snapshot per candidate.
pub async fn run_scoring(ctx: &JobContext, run_id: Uuid) -> anyhow::Result<ScoringReport> {
    let span = info_span!("scoring_run", %run_id);
    let _guard = span.enter();

    let now = Utc::now();
    let candidates = ctx.store.list_candidate_activity().await?;
    let mut report = ScoringReport {
        run_id,
        candidates_scored: candidates.len(),
        intensive: 0,
        moderate: 0,
        maintain: 0,
        messages_sent: 0,
        errors: Vec::new(),
    };

    for activity in &candidates {
        let score = composite_score(activity, now);
        let tier = EngagementTier::for_score(score);
        match tier {
            EngagementTier::Intensive => report.intensive += 1,
            EngagementTier::Moderate => report.moderate += 1,
            EngagementTier::Maintain => report.maintain += 1,
        }

        let mut attempt_at = activity.last_engagement_attempt;
        if engagement_due(tier, activity.last_engagement_attempt, now) {
            match ctx.gateway.notify_engagement(activity, score, tier).await {
                Ok(()) => {
                    ctx.store
                        .record_engagement_attempt(&activity.candidate_id, now)
                        .await?;
                    attempt_at = Some(now);
                    report.messages_sent += 1;
                }
                Err(err) => {
                    warn!(
                        candidate = %activity.candidate_id,
                        error = %err,
                        "engagement message failed"
                    );
                    report
                        .errors
                        .push(format!("engage {}: {err}", activity.candidate_id));
                }
            }
        }

        ctx.store
            .put_engagement_snapshot(&CandidateEngagementSnapshot {
                candidate_id: activity.candidate_id,
                score,
                tier,
                last_engagement_attempt: attempt_at,
                computed_at: now,
            })
            .await?;
    }

    info!(
        scored = report.candidates_scored,
        messages = report.messages_sent,
        errors = report.errors.len(),
        "scoring run finished"
    );
    Ok(report)
}

pub struct IngestionJob;

#[async_trait]
impl JobHandler<JobContext> for IngestionJob {
    async fn execute(&self, ctx: &JobContext) -> anyhow::Result<String> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        match run_ingestion(ctx, run_id).await {
            Ok(report) => {
                let summary = report.summary_line();
                ctx.store
                    .record_run(&RunRecord {
                        run_id,
                        job: INGESTION_JOB.to_string(),
                        started_at,
                        finished_at: Utc::now(),
                        success: true,
                        summary: summary.clone(),
                        errors: report.errors.clone(),
                    })
                    .await?;
                Ok(summary)
            }
            Err(err) => {
                ctx.store
                    .record_run(&RunRecord {
                        run_id,
                        job: INGESTION_JOB.to_string(),
                        started_at,
                        finished_at: Utc::now(),
                        success: false,
                        summary: "ingestion failed".to_string(),
                        errors: vec![format!("{err:#}")],
                    })
                    .await?;
                Err(err)
            }
        }
    }
}

pub struct ScoringJob;

#[async_trait]
impl JobHandler<JobContext> for ScoringJob {
    async fn execute(&self, ctx: &JobContext) -> anyhow::Result<String> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        match run_scoring(ctx, run_id).await {
            Ok(report) => {
                let summary = report.summary_line();
                ctx.store
                    .record_run(&RunRecord {
                        run_id,
                        job: SCORING_JOB.to_string(),
                        started_at,
                        finished_at: Utc::now(),
                        success: true,
                        summary: summary.clone(),
                        errors: report.errors.clone(),
                    })
                    .await?;
                Ok(summary)
            }
            Err(err) => {
                ctx.store
                    .record_run(&RunRecord {
                        run_id,
                        job: SCORING_JOB.to_string(),
                        started_at,
                        finished_at: Utc::now(),
                        success: false,
                        summary: "scoring failed".to_string(),
                        errors: vec![format!("{err:#}")],
                    })
                    .await?;
                Err(err)
            }
        }
    }
}

pub fn ingestion_spec(config: &AppConfig) -> JobSpec {
    JobSpec {
        name: INGESTION_JOB.to_string(),
        description: "Polls the tender feed, matches alerts, and sends notifications".to_string(),
        recurrence: Recurrence::Every {
            minutes: config.ingest_every_minutes.max(1),
        },
        timeout_secs: config.job_timeout_secs,
    }
}

pub fn scoring_spec(config: &AppConfig) -> JobSpec {
    let (hour, minute) = config.scoring_daily_at;
    JobSpec {
        name: SCORING_JOB.to_string(),
        description: "Scores candidate activity and schedules engagement outreach".to_string(),
        recurrence: Recurrence::Daily { hour, minute },
        timeout_secs: config.job_timeout_secs,
    }
}
