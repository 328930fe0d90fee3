//! Feed client contracts + heuristic tender extraction.
//!
//! The feed is a JSON document of entries (bare array or an `{"items": [..]}`
//! envelope). Extraction is pure: the reference date is injected so the same
//! raw text always yields the same draft.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use scraper::Html;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use tap_core::TenderDraft;
use tap_store::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "tap-feed";

pub const DEFAULT_CATEGORY: &str = "General Services";

/// One decoded feed entry. Descriptions may carry markup and are stripped
/// before any heuristic runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

/// A fetched feed: decoded entries plus the raw payload for archiving.
#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub items: Vec<FeedItem>,
    pub raw: Vec<u8>,
    pub fetched_from: String,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("fetching feed: {0}")]
    Transport(#[from] FetchError),
    #[error("decoding feed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait FeedClient: Send + Sync {
    fn source(&self) -> &str;
    async fn fetch(&self, run_id: Uuid) -> Result<FetchedFeed, FeedError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FeedDocument {
    Bare(Vec<FeedItem>),
    Envelope { items: Vec<FeedItem> },
}

pub fn decode_feed(bytes: &[u8]) -> Result<Vec<FeedItem>, serde_json::Error> {
    let document: FeedDocument = serde_json::from_slice(bytes)?;
    Ok(match document {
        FeedDocument::Bare(items) => items,
        FeedDocument::Envelope { items } => items,
    })
}

/// Pulls the feed over HTTP through the shared fetcher.
#[derive(Debug)]
pub struct HttpFeedClient {
    source: String,
    url: String,
    fetcher: Arc<HttpFetcher>,
}

impl HttpFeedClient {
    pub fn new(source: impl Into<String>, url: impl Into<String>, fetcher: Arc<HttpFetcher>) -> Self {
        Self {
            source: source.into(),
            url: url.into(),
            fetcher,
        }
    }
}

#[async_trait]
impl FeedClient for HttpFeedClient {
    fn source(&self) -> &str {
        &self.source
    }

    async fn fetch(&self, run_id: Uuid) -> Result<FetchedFeed, FeedError> {
        let resp = self.fetcher.fetch_bytes(run_id, &self.source, &self.url).await?;
        let items = decode_feed(&resp.body)?;
        Ok(FetchedFeed {
            items,
            raw: resp.body,
            fetched_from: resp.final_url,
        })
    }
}

/// Reads the same feed shape from disk, for tests and offline runs.
#[derive(Debug, Clone)]
pub struct FixtureFeedClient {
    source: String,
    path: PathBuf,
}

impl FixtureFeedClient {
    pub fn new(source: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl FeedClient for FixtureFeedClient {
    fn source(&self) -> &str {
        &self.source
    }

    async fn fetch(&self, _run_id: Uuid) -> Result<FetchedFeed, FeedError> {
        let raw = std::fs::read(&self.path)
            .with_context(|| format!("reading feed fixture {}", self.path.display()))?;
        let items = decode_feed(&raw)?;
        Ok(FetchedFeed {
            items,
            raw,
            fetched_from: self.path.display().to_string(),
        })
    }
}

pub fn strip_html(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if !trimmed.contains('<') {
        return trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    let fragment = Html::parse_fragment(trimmed);
    let joined = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Agency convention is `"<Agency> - <Title>"`; only the first spaced hyphen
/// splits, so hyphenated words inside titles survive.
pub fn split_agency_title(raw: &str) -> (Option<String>, String) {
    if let Some((agency, title)) = raw.split_once(" - ") {
        let agency = agency.trim();
        let title = title.trim();
        if !agency.is_empty() && !title.is_empty() {
            return (Some(agency.to_string()), title.to_string());
        }
    }
    (None, raw.trim().to_string())
}

const ID_QUERY_KEYS: [&str; 3] = ["id", "tender_id", "ref"];
const ID_PATH_SEGMENTS: [&str; 3] = ["tenders", "opportunities", "notices"];

fn id_from_query(link: &str) -> Option<String> {
    let (_, query) = link.split_once('?')?;
    let query = query.split('#').next().unwrap_or(query);
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        if ID_QUERY_KEYS.contains(&key) && !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

fn id_from_path(link: &str) -> Option<String> {
    let without_scheme = link.split_once("://").map(|(_, rest)| rest).unwrap_or(link);
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or(without_scheme);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for window in segments.windows(2) {
        if ID_PATH_SEGMENTS.contains(&window[0]) {
            return Some(window[1].to_string());
        }
    }
    None
}

/// Ordered external-id strategies: known query parameters, known path
/// segments, the feed guid, then the raw link.
pub fn extract_external_id(link: Option<&str>, guid: Option<&str>) -> Option<String> {
    if let Some(link) = link {
        if let Some(id) = id_from_query(link) {
            return Some(id);
        }
        if let Some(id) = id_from_path(link) {
            return Some(id);
        }
    }
    if let Some(guid) = guid {
        let guid = guid.trim();
        if !guid.is_empty() {
            return Some(guid.to_string());
        }
    }
    link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty())
}

fn clamp_to_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn is_word_bounded(text: &str, start: usize, end: usize) -> bool {
    let before_ok = start == 0
        || text[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_ascii_alphanumeric());
    let after_ok = text[end..]
        .chars()
        .next()
        .is_none_or(|c| !c.is_ascii_alphanumeric());
    before_ok && after_ok
}

/// Byte ranges immediately after each word-bounded marker occurrence, in
/// marker priority order. ASCII lowercasing preserves byte offsets, so the
/// ranges are valid for the original text too.
fn marker_windows(lower: &str, markers: &[&str], window_len: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    for marker in markers {
        let mut from = 0;
        while let Some(pos) = lower[from..].find(marker) {
            let start = from + pos;
            let end = start + marker.len();
            if is_word_bounded(lower, start, end) {
                out.push((end, clamp_to_char_boundary(lower, end + window_len)));
            }
            from = end;
        }
    }
    out
}

/// First monetary amount in `text`. Commas inside digit runs are thousands
/// separators; the scan stops at the first complete number.
fn first_amount(text: &str) -> Option<f64> {
    let chars: Vec<char> = text.chars().collect();
    let mut current = String::new();
    let mut seen_dot = false;
    for (i, ch) in chars.iter().enumerate() {
        if ch.is_ascii_digit() {
            current.push(*ch);
            continue;
        }
        let next_is_digit = chars.get(i + 1).is_some_and(|c| c.is_ascii_digit());
        if *ch == ',' && !current.is_empty() && next_is_digit {
            continue;
        }
        if *ch == '.' && !seen_dot && !current.is_empty() && next_is_digit {
            current.push('.');
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            break;
        }
    }
    current.parse::<f64>().ok()
}

const VALUE_MARKERS: [&str; 4] = ["estimated value", "budget", "value", "amount"];

/// Currency-prefixed amounts near a value marker win; any bare `$` amount is
/// the fallback. Non-positive amounts are discarded.
pub fn extract_estimated_value(text: &str) -> Option<f64> {
    let lower = text.to_ascii_lowercase();
    for (start, end) in marker_windows(&lower, &VALUE_MARKERS, 48) {
        if let Some(value) = first_amount(&lower[start..end]) {
            if value > 0.0 {
                return Some(value);
            }
        }
    }

    let mut from = 0;
    while let Some(pos) = lower[from..].find('$') {
        let start = from + pos + 1;
        let end = clamp_to_char_boundary(&lower, start + 32);
        if let Some(value) = first_amount(&lower[start..end]) {
            if value > 0.0 {
                return Some(value);
            }
        }
        from = start;
    }
    None
}

const CLOSING_MARKERS: [&str; 4] = ["closing date", "closing", "deadline", "due"];
const NUMERIC_DATE_FORMATS: [&str; 3] = ["%d/%m/%Y", "%d-%m-%Y", "%Y-%m-%d"];
const WORDY_DATE_FORMATS: [&str; 2] = ["%d %b %Y", "%d %B %Y"];

fn numeric_runs(window: &str) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();
    for ch in window.chars() {
        if ch.is_ascii_digit() || ch == '/' || ch == '-' {
            current.push(ch);
        } else {
            if current.len() >= 8 {
                runs.push(current.clone());
            }
            current.clear();
        }
    }
    if current.len() >= 8 {
        runs.push(current);
    }
    runs
}

fn first_date_on_or_after(window: &str, today: NaiveDate) -> Option<NaiveDate> {
    for run in numeric_runs(window) {
        let run = run.trim_matches(|c| c == '/' || c == '-');
        for fmt in NUMERIC_DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(run, fmt) {
                if date >= today {
                    return Some(date);
                }
            }
        }
    }

    let tokens: Vec<&str> = window
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| matches!(c, ',' | '.' | ';' | ':' | ')' | '(')))
        .filter(|t| !t.is_empty())
        .collect();
    for triple in tokens.windows(3) {
        let candidate = format!("{} {} {}", triple[0], triple[1], triple[2]);
        for fmt in WORDY_DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(&candidate, fmt) {
                if date >= today {
                    return Some(date);
                }
            }
        }
    }
    None
}

/// Date tokens near a closing marker, ordered formats, first date on or
/// after `today` wins. Past and unparseable dates are discarded.
pub fn extract_closing_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let lower = text.to_ascii_lowercase();
    for (start, end) in marker_windows(&lower, &CLOSING_MARKERS, 40) {
        if let Some(date) = first_date_on_or_after(&lower[start..end], today) {
            return Some(date);
        }
    }
    None
}

const LOCATION_MARKERS: [&str; 3] = ["location", "venue", "site"];

/// Phrase following a location marker, captured from the original text so
/// casing survives.
pub fn extract_location(text: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    for (start, end) in marker_windows(&lower, &LOCATION_MARKERS, 60) {
        let captured = text[start..end]
            .trim_start_matches([':', '-', ' ', '\t'])
            .split(|c: char| matches!(c, ',' | '.' | ';' | '\n'))
            .next()
            .unwrap_or("")
            .trim();
        if !captured.is_empty() {
            return Some(captured.to_string());
        }
    }
    None
}

/// Ordered keyword buckets; first match wins, `fallback` otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRules {
    pub rules: Vec<CategoryRule>,
    #[serde(default = "default_fallback")]
    pub fallback: String,
}

fn default_fallback() -> String {
    DEFAULT_CATEGORY.to_string()
}

impl Default for CategoryRules {
    fn default() -> Self {
        Self::builtin()
    }
}

fn rule(category: &str, keywords: &[&str]) -> CategoryRule {
    CategoryRule {
        category: category.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
    }
}

impl CategoryRules {
    pub fn builtin() -> Self {
        Self {
            rules: vec![
                rule("Cleaning Services", &["cleaning", "custodial", "janitorial"]),
                rule("Security Services", &["security", "guard"]),
                rule(
                    "Facilities Management",
                    &["facilities", "facility management", "maintenance"],
                ),
                rule("Landscaping", &["landscap", "horticult", "greenery"]),
                rule(
                    "IT Services",
                    &["software", "it services", "digital", "system integration"],
                ),
                rule(
                    "Manpower Services",
                    &["manpower", "staffing", "temporary staff", "recruitment"],
                ),
                rule("Event Support", &["event"]),
            ],
            fallback: DEFAULT_CATEGORY.to_string(),
        }
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading category rules {}", path.display()))?;
        let rules: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing category rules {}", path.display()))?;
        Ok(rules)
    }

    pub fn classify(&self, text: &str) -> String {
        let lower = text.to_ascii_lowercase();
        for rule in &self.rules {
            if rule
                .keywords
                .iter()
                .any(|k| lower.contains(&k.to_ascii_lowercase()))
            {
                return rule.category.clone();
            }
        }
        self.fallback.clone()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("feed item has an empty title")]
    EmptyTitle,
    #[error("no usable external id in link or guid")]
    MissingExternalId,
}

/// Turns feed items into tender drafts for one source.
#[derive(Debug, Clone)]
pub struct Extractor {
    source: String,
    rules: CategoryRules,
}

impl Extractor {
    pub fn new(source: impl Into<String>, rules: CategoryRules) -> Self {
        Self {
            source: source.into(),
            rules,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn extract(&self, item: &FeedItem, today: NaiveDate) -> Result<TenderDraft, ExtractionError> {
        let title_raw = strip_html(&item.title);
        if title_raw.is_empty() {
            return Err(ExtractionError::EmptyTitle);
        }
        let description = strip_html(&item.description);

        let external_id = extract_external_id(item.link.as_deref(), item.guid.as_deref())
            .ok_or(ExtractionError::MissingExternalId)?;
        let (agency, title) = split_agency_title(&title_raw);

        let haystack = format!("{title_raw} {description}");
        let category = self.rules.classify(&haystack);

        let estimated_value =
            extract_estimated_value(&description).or_else(|| extract_estimated_value(&title_raw));
        let closing_date = extract_closing_date(&description, today)
            .or_else(|| extract_closing_date(&title_raw, today));
        let location = extract_location(&description).or_else(|| extract_location(&title_raw));

        Ok(TenderDraft {
            source: self.source.clone(),
            external_id,
            title,
            agency,
            category,
            estimated_value,
            closing_date,
            location,
            external_url: item.link.clone(),
        })
    }
}
