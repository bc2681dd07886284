//! Source adapter contract and the closed set of job-board adapters.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use jobhound_core::{sha256_hex, Metadata, RawPosting};
use jobhound_storage::{FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "jobhound-adapters";

/// Source id carried by the deterministic fixture postings.
pub const FIXTURE_SOURCE: &str = "fixture";

pub const FINN_SEARCH_URL: &str = "https://www.finn.no/job/fulltime/search.html";
pub const GREENHOUSE_API: &str = "https://boards-api.greenhouse.io/v1/boards";
pub const LEVER_API: &str = "https://api.lever.co/v0/postings";

const KEY_PHRASES: [&str; 3] = ["product manager", "senior product manager", "product owner"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Finn,
    Greenhouse,
    Lever,
    Fixture,
}

/// Everything an adapter gets to know about the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterQuery {
    pub query: String,
    pub cities: Vec<String>,
    pub window_days: u32,
    pub today: NaiveDate,
    /// How long the live branch may run before the adapter answers with fixtures instead.
    pub live_budget: Duration,
}

/// Where a successful adapter result came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "origin", rename_all = "lowercase")]
pub enum PostingOrigin {
    Live,
    Fixture { reason: String },
}

impl PostingOrigin {
    pub fn label(&self) -> &'static str {
        match self {
            PostingOrigin::Live => "live",
            PostingOrigin::Fixture { .. } => "fixture",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutput {
    pub postings: Vec<RawPosting>,
    pub origin: PostingOrigin,
}

impl FetchOutput {
    pub fn live(postings: Vec<RawPosting>) -> Self {
        Self {
            postings,
            origin: PostingOrigin::Live,
        }
    }

    pub fn fixture(postings: Vec<RawPosting>, reason: impl Into<String>) -> Self {
        Self {
            postings,
            origin: PostingOrigin::Fixture {
                reason: reason.into(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("live fetch gave up after {}s", .0.as_secs_f64())]
    Deadline(Duration),
    #[error("{0}")]
    Message(String),
}

/// One job source. An empty result is a valid success; `Err` means the source contributed nothing.
/// The network-backed adapters never return either: no live postings means fixture postings.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> AdapterKind;

    async fn fetch(&self, http: &HttpFetcher, query: &AdapterQuery) -> Result<FetchOutput, AdapterError>;
}

/// Per-adapter knobs read from the source registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AdapterSettings {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub boards: Vec<String>,
    #[serde(default)]
    pub companies: Vec<String>,
}

pub fn adapter_for_source(
    kind: AdapterKind,
    source_id: &str,
    settings: &AdapterSettings,
) -> Box<dyn SourceAdapter> {
    let source_id = source_id.to_string();
    match kind {
        AdapterKind::Finn => Box::new(FinnAdapter {
            source_id,
            search_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| FINN_SEARCH_URL.to_string()),
        }),
        AdapterKind::Greenhouse => Box::new(GreenhouseAdapter {
            source_id,
            api_base: settings
                .base_url
                .clone()
                .unwrap_or_else(|| GREENHOUSE_API.to_string()),
            boards: settings.boards.clone(),
        }),
        AdapterKind::Lever => Box::new(LeverAdapter {
            source_id,
            api_base: settings
                .base_url
                .clone()
                .unwrap_or_else(|| LEVER_API.to_string()),
            companies: settings.companies.clone(),
        }),
        AdapterKind::Fixture => Box::new(FixtureAdapter { source_id }),
    }
}

/// Deterministic stand-in postings used when live sources come back empty.
pub fn fixture_postings(today: NaiveDate) -> Vec<RawPosting> {
    vec![
        RawPosting {
            source: FIXTURE_SOURCE.to_string(),
            source_id: "lnk-001".to_string(),
            title: "Senior Product Manager".to_string(),
            company: "Cognite".to_string(),
            location: "Oslo, NO".to_string(),
            posted_date: (today - TimeDelta::days(1)).to_string(),
            url: "https://example.com/cognite-spm".to_string(),
            description_text: "Lead B2B SaaS products with GenAI features. English work environment."
                .to_string(),
            language_hint: Some("en".to_string()),
            seniority_hint: Some("Senior".to_string()),
            employment_type: Some("Full-time".to_string()),
            metadata: Metadata::from([("latency_ms".to_string(), json!(0))]),
        },
        RawPosting {
            source: FIXTURE_SOURCE.to_string(),
            source_id: "lnk-002".to_string(),
            title: "Produktleder for adresse- og bostedsopplysninger".to_string(),
            company: "Skatteetaten".to_string(),
            location: "Oslo, NO".to_string(),
            posted_date: (today - TimeDelta::days(12)).to_string(),
            url: "https://example.com/skatteetaten-pl".to_string(),
            description_text: "Forvalte kjerne data. Norsk språk kreves.".to_string(),
            language_hint: Some("no".to_string()),
            seniority_hint: None,
            employment_type: Some("Full-time".to_string()),
            metadata: Metadata::from([("latency_ms".to_string(), json!(0))]),
        },
    ]
}

fn normalize_phrase(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn query_matches(title: &str, description: &str) -> bool {
    let title = normalize_phrase(title);
    let description = normalize_phrase(description);
    KEY_PHRASES
        .iter()
        .any(|p| title.contains(p) || description.contains(p))
}

pub fn location_matches(location: &str, cities: &[String]) -> bool {
    let location = normalize_phrase(location);
    cities
        .iter()
        .any(|city| location.contains(&city.trim().to_lowercase()))
}

/// Keep a posting when no whitelist applies or its location names a whitelisted city.
fn passes_city_filter(location: &str, cities: &[String]) -> bool {
    cities.is_empty() || location.trim().is_empty() || location_matches(location, cities)
}

/// Visible text of an HTML fragment with whitespace collapsed.
pub fn html_to_text(fragment: &str) -> String {
    let text = Html::parse_fragment(fragment)
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Greenhouse double-escapes its `content` field; peel one more layer when markup survives.
fn escaped_html_to_text(fragment: &str) -> String {
    let once = html_to_text(fragment);
    if once.contains('<') && once.contains('>') {
        html_to_text(&once)
    } else {
        once
    }
}

fn short_id(seed: &str) -> String {
    sha256_hex(seed.as_bytes())[..12].to_string()
}

fn with_latency(mut postings: Vec<RawPosting>, latency_ms: u64, extra: Option<(&str, &str)>) -> Vec<RawPosting> {
    for posting in &mut postings {
        posting
            .metadata
            .insert("latency_ms".to_string(), json!(latency_ms));
        if let Some((key, value)) = extra {
            posting.metadata.insert(key.to_string(), json!(value));
        }
    }
    postings
}

// ---- FINN ----

#[derive(Debug, Clone)]
struct FinnAdapter {
    source_id: String,
    search_url: String,
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_str().map(str::trim).filter(|s| !s.is_empty())
}

fn finn_posting_from_ld(source: &str, data: &JsonValue) -> Option<RawPosting> {
    if data.get("@type").and_then(JsonValue::as_str) != Some("JobPosting") {
        return None;
    }
    let title = json_str(data, &["title"]).unwrap_or_default().to_string();
    let company = json_str(data, &["hiringOrganization", "name"])
        .unwrap_or_default()
        .to_string();
    let url = json_str(data, &["url"]).unwrap_or_default().to_string();
    let locality = json_str(data, &["jobLocation", "address", "addressLocality"]).unwrap_or("Oslo");
    let posted_date: String = json_str(data, &["datePosted"])
        .unwrap_or_default()
        .chars()
        .take(10)
        .collect();
    let description = json_str(data, &["description"]).map(html_to_text).unwrap_or_default();

    let seed = if url.is_empty() {
        format!("{title}{company}")
    } else {
        url.clone()
    };
    Some(RawPosting {
        source: source.to_string(),
        source_id: short_id(&seed),
        title,
        company,
        location: format!("{locality}, NO"),
        posted_date,
        url,
        description_text: description,
        language_hint: None,
        seniority_hint: None,
        employment_type: None,
        metadata: Metadata::new(),
    })
}

/// Parse a FINN search page: JSON-LD `JobPosting` blocks first, bare `/job/` links otherwise.
pub fn parse_finn_search(source: &str, html: &str) -> Result<Vec<RawPosting>, AdapterError> {
    let document = Html::parse_document(html);
    let ld_selector = Selector::parse(r#"script[type="application/ld+json"]"#)
        .map_err(|e| AdapterError::Parse(e.to_string()))?;

    let mut postings = Vec::new();
    for script in document.select(&ld_selector) {
        let text = script.text().collect::<String>();
        let Ok(data) = serde_json::from_str::<JsonValue>(text.trim()) else {
            continue;
        };
        match &data {
            JsonValue::Array(items) => postings.extend(
                items
                    .iter()
                    .filter_map(|item| finn_posting_from_ld(source, item)),
            ),
            other => postings.extend(finn_posting_from_ld(source, other)),
        }
    }
    if !postings.is_empty() {
        return Ok(postings);
    }

    let link_selector =
        Selector::parse("a[href*='/job/']").map_err(|e| AdapterError::Parse(e.to_string()))?;
    for link in document.select(&link_selector) {
        let title = link
            .text()
            .collect::<Vec<_>>()
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let href = link.value().attr("href").unwrap_or_default().trim();
        if title.is_empty() || href.is_empty() {
            continue;
        }
        let url = if href.starts_with("http") {
            href.to_string()
        } else {
            format!("https://www.finn.no{href}")
        };
        postings.push(RawPosting {
            source: source.to_string(),
            source_id: short_id(href),
            title,
            company: String::new(),
            location: "Oslo, NO".to_string(),
            posted_date: String::new(),
            url,
            description_text: String::new(),
            language_hint: None,
            seniority_hint: None,
            employment_type: None,
            metadata: Metadata::new(),
        });
    }
    Ok(postings)
}

#[async_trait::async_trait]
impl SourceAdapter for FinnAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Finn
    }

    async fn fetch(&self, http: &HttpFetcher, query: &AdapterQuery) -> Result<FetchOutput, AdapterError> {
        let q = format!("{} {}", query.query, query.cities.join(", "));
        let live = within_budget(query.live_budget, async {
            let resp = http
                .get_text(&self.source_id, &self.search_url, &[("q", q.as_str())])
                .await?;
            parse_finn_search(&self.source_id, &resp.body)
                .map(|postings| with_latency(postings, resp.latency_ms, None))
        })
        .await;
        Ok(live_or_fixture(&self.source_id, live, query.today))
    }
}

// ---- Greenhouse ----

#[derive(Debug, Clone, Deserialize)]
pub struct GreenhouseResponse {
    #[serde(default)]
    pub jobs: Vec<GreenhouseJob>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GreenhouseJob {
    pub id: Option<u64>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub absolute_url: String,
    pub location: Option<GreenhouseLocation>,
    pub updated_at: Option<String>,
    pub created_at: Option<String>,
    #[serde(default)]
    pub content: String,
    pub company: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GreenhouseLocation {
    #[serde(default)]
    pub name: String,
}

pub fn greenhouse_postings(
    source: &str,
    board: &str,
    response: &GreenhouseResponse,
    cities: &[String],
) -> Vec<RawPosting> {
    response
        .jobs
        .iter()
        .filter_map(|item| {
            let location = item
                .location
                .as_ref()
                .map(|l| l.name.trim().to_string())
                .unwrap_or_default();
            let description = escaped_html_to_text(&item.content);
            if !passes_city_filter(&location, cities) || !query_matches(&item.title, &description) {
                return None;
            }
            let posted_date: String = item
                .updated_at
                .as_deref()
                .or(item.created_at.as_deref())
                .unwrap_or_default()
                .chars()
                .take(10)
                .collect();
            let company = item
                .company
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .unwrap_or(board)
                .to_string();
            Some(RawPosting {
                source: source.to_string(),
                source_id: item
                    .id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| short_id(&item.absolute_url)),
                title: item.title.clone(),
                company,
                location: if location.is_empty() {
                    cities.join(", ")
                } else {
                    location
                },
                posted_date,
                url: item.absolute_url.clone(),
                description_text: description,
                language_hint: None,
                seniority_hint: None,
                employment_type: None,
                metadata: Metadata::new(),
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
struct GreenhouseAdapter {
    source_id: String,
    api_base: String,
    boards: Vec<String>,
}

#[async_trait::async_trait]
impl SourceAdapter for GreenhouseAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Greenhouse
    }

    async fn fetch(&self, http: &HttpFetcher, query: &AdapterQuery) -> Result<FetchOutput, AdapterError> {
        let live = within_budget(query.live_budget, self.fetch_boards(http, query)).await;
        Ok(live_or_fixture(&self.source_id, live, query.today))
    }
}

impl GreenhouseAdapter {
    async fn fetch_boards(&self, http: &HttpFetcher, query: &AdapterQuery) -> Result<Vec<RawPosting>, AdapterError> {
        let mut postings = Vec::new();
        let mut failures = Vec::new();
        for board in &self.boards {
            let url = format!("{}/{board}/jobs", self.api_base.trim_end_matches('/'));
            match http
                .get_json::<GreenhouseResponse>(&self.source_id, &url, &[("content", "true")])
                .await
            {
                Ok((response, latency_ms)) => postings.extend(with_latency(
                    greenhouse_postings(&self.source_id, board, &response, &query.cities),
                    latency_ms,
                    Some(("board", board)),
                )),
                Err(err) => {
                    warn!(adapter = %self.source_id, board = %board, error = %err, "board fetch failed");
                    failures.push(err);
                }
            }
        }
        collect_partial(postings, self.boards.len(), failures)
    }
}

// ---- Lever ----

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeverPosting {
    pub id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub categories: LeverCategories,
    pub created_at: Option<i64>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub description_plain: Option<String>,
    pub hosted_url: Option<String>,
    pub apply_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeverCategories {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub commitment: Option<String>,
}

pub fn lever_postings(
    source: &str,
    company: &str,
    items: &[LeverPosting],
    cities: &[String],
) -> Vec<RawPosting> {
    items
        .iter()
        .filter_map(|item| {
            let location = item.categories.location.clone().unwrap_or_default();
            let description = match (&item.description_plain, &item.content) {
                (Some(plain), _) if !plain.trim().is_empty() => plain.trim().to_string(),
                (_, Some(html)) => html_to_text(html),
                _ => String::new(),
            };
            if !passes_city_filter(&location, cities) || !query_matches(&item.text, &description) {
                return None;
            }
            let url = item
                .hosted_url
                .clone()
                .or_else(|| item.apply_url.clone())
                .unwrap_or_default();
            let posted_date = item
                .created_at
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .map(|dt| dt.date_naive().to_string())
                .unwrap_or_default();
            Some(RawPosting {
                source: source.to_string(),
                source_id: item.id.clone().unwrap_or_else(|| short_id(&url)),
                title: item.text.clone(),
                company: company.to_string(),
                location: if location.trim().is_empty() {
                    cities.join(", ")
                } else {
                    location
                },
                posted_date,
                url,
                description_text: description,
                language_hint: None,
                seniority_hint: None,
                employment_type: item.categories.commitment.clone(),
                metadata: Metadata::new(),
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
struct LeverAdapter {
    source_id: String,
    api_base: String,
    companies: Vec<String>,
}

#[async_trait::async_trait]
impl SourceAdapter for LeverAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Lever
    }

    async fn fetch(&self, http: &HttpFetcher, query: &AdapterQuery) -> Result<FetchOutput, AdapterError> {
        let live = within_budget(query.live_budget, self.fetch_companies(http, query)).await;
        Ok(live_or_fixture(&self.source_id, live, query.today))
    }
}

impl LeverAdapter {
    async fn fetch_companies(&self, http: &HttpFetcher, query: &AdapterQuery) -> Result<Vec<RawPosting>, AdapterError> {
        let mut postings = Vec::new();
        let mut failures = Vec::new();
        for company in &self.companies {
            let url = format!("{}/{company}", self.api_base.trim_end_matches('/'));
            match http
                .get_json::<Vec<LeverPosting>>(&self.source_id, &url, &[("mode", "json")])
                .await
            {
                Ok((items, latency_ms)) => postings.extend(with_latency(
                    lever_postings(&self.source_id, company, &items, &query.cities),
                    latency_ms,
                    Some(("company", company)),
                )),
                Err(err) => {
                    warn!(adapter = %self.source_id, company = %company, error = %err, "company fetch failed");
                    failures.push(err);
                }
            }
        }
        collect_partial(postings, self.companies.len(), failures)
    }
}

/// Partial success keeps what was fetched; only when every request failed is the first error surfaced.
fn collect_partial(
    postings: Vec<RawPosting>,
    attempted: usize,
    failures: Vec<FetchError>,
) -> Result<Vec<RawPosting>, AdapterError> {
    if attempted > 0 && failures.len() == attempted {
        if let Some(err) = failures.into_iter().next() {
            return Err(err.into());
        }
    }
    Ok(postings)
}

/// Bound the live branch so an adapter still answers before the coordinator gives up on it.
async fn within_budget<F>(budget: Duration, live: F) -> Result<Vec<RawPosting>, AdapterError>
where
    F: Future<Output = Result<Vec<RawPosting>, AdapterError>>,
{
    tokio::time::timeout(budget, live)
        .await
        .unwrap_or(Err(AdapterError::Deadline(budget)))
}

/// Live postings when there are any, otherwise the fixture set tagged with why.
fn live_or_fixture(
    source_id: &str,
    live: Result<Vec<RawPosting>, AdapterError>,
    today: NaiveDate,
) -> FetchOutput {
    match live {
        Ok(postings) if !postings.is_empty() => FetchOutput::live(postings),
        Ok(_) => FetchOutput::fixture(fixture_postings(today), "no live results"),
        Err(err) => {
            warn!(adapter = %source_id, error = %err, "live fetch failed; using fixture postings");
            FetchOutput::fixture(fixture_postings(today), err.to_string())
        }
    }
}

// ---- Fixture ----

#[derive(Debug, Clone)]
struct FixtureAdapter {
    source_id: String,
}

#[async_trait::async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Fixture
    }

    async fn fetch(&self, _http: &HttpFetcher, query: &AdapterQuery) -> Result<FetchOutput, AdapterError> {
        Ok(FetchOutput::fixture(
            fixture_postings(query.today),
            "static fixture source",
        ))
    }
}
