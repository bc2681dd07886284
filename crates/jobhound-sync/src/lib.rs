//! Daily run orchestration: configuration, source registry, concurrent fetch,
//! the staged in-memory pipeline, persistence, scheduling and reporting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local, Timelike};
use jobhound_adapters::{
    adapter_for_source, AdapterKind, AdapterQuery, AdapterSettings, PostingOrigin, SourceAdapter,
};
use jobhound_core::{RawPosting, SelectedEntry};
use jobhound_storage::{
    ensure_dir, load_preferences, HttpClientConfig, HttpFetcher, SeenStore, StatePaths,
    StatusTracker,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};

pub mod snapshot;
pub mod stages;

pub use snapshot::{DailySnapshot, SnapshotPaths, SnapshotWriter};
pub use stages::{Rollup, RunLog, ScoringProfile, Stage, StubTranslator, Translation, Translator};

use stages::{dedup, enrich, normalize, rank, rollup, select, translate, RollupInputs};

pub const CRATE_NAME: &str = "jobhound-sync";

pub const DEFAULT_QUERY: &str = "(Product Manager) OR (Senior Product Manager) OR (Product Owner)";
pub const DEFAULT_QUIET_AFTER_HOUR: u32 = 11;
pub const DEFAULT_WINDOW_DAYS: u32 = 7;
pub const DEFAULT_TOP_N: usize = 10;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 20;

/// Time left to an adapter, after its live budget runs out, to hand back fixture postings.
pub const FALLBACK_HEADROOM: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub kind: AdapterKind,
    #[serde(flatten)]
    pub settings: AdapterSettings,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    /// Registry used when no `sources.yaml` exists.
    pub fn builtin() -> Self {
        let source = |source_id: &str, display_name: &str, kind| SourceConfig {
            source_id: source_id.to_string(),
            display_name: display_name.to_string(),
            enabled: true,
            kind,
            settings: AdapterSettings::default(),
            notes: None,
        };
        Self {
            sources: vec![
                source("finn", "FINN.no jobs", AdapterKind::Finn),
                source("fixture", "Deterministic fixtures", AdapterKind::Fixture),
            ],
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &std::path::Path) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(text) => Self::from_yaml(&text).with_context(|| format!("in {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no source registry; using built-in sources");
                Ok(Self::builtin())
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Adapters for enabled sources, in registry order.
    pub fn build_adapters(&self) -> Vec<Arc<dyn SourceAdapter>> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| Arc::from(adapter_for_source(s.kind, &s.source_id, &s.settings)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub sources_path: PathBuf,
    pub quiet_after_hour: u32,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub adapter_timeout_secs: u64,
    pub query: String,
    pub run_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let http_timeout_secs = number("JOBHOUND_HTTP_TIMEOUT_SECS").unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
        Self {
            data_dir: lookup("JOBHOUND_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            sources_path: lookup("JOBHOUND_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sources.yaml")),
            quiet_after_hour: number("JOBHOUND_QUIET_AFTER_HOUR")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(DEFAULT_QUIET_AFTER_HOUR),
            user_agent: lookup("JOBHOUND_USER_AGENT")
                .unwrap_or_else(|| "jobhound/0.1 (+daily job digest)".to_string()),
            http_timeout_secs,
            adapter_timeout_secs: number("JOBHOUND_ADAPTER_TIMEOUT_SECS")
                .unwrap_or_else(|| default_adapter_timeout_secs(http_timeout_secs)),
            query: lookup("JOBHOUND_QUERY").unwrap_or_else(|| DEFAULT_QUERY.to_string()),
            run_cron: lookup("JOBHOUND_RUN_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
        }
    }

    pub fn state_paths(&self) -> StatePaths {
        StatePaths::under(&self.data_dir)
    }

    pub fn http_config(&self) -> HttpClientConfig {
        http_config_for(self.http_timeout_secs, Some(self.user_agent.clone()))
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    /// Deadline for an adapter's live branch, leaving [`FALLBACK_HEADROOM`] before the coordinator cuts it off.
    pub fn live_budget(&self) -> Duration {
        let timeout = self.adapter_timeout();
        timeout.saturating_sub(FALLBACK_HEADROOM).max(timeout / 2)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn http_config_for(timeout_secs: u64, user_agent: Option<String>) -> HttpClientConfig {
    HttpClientConfig {
        timeout: Duration::from_secs(timeout_secs),
        user_agent,
        ..Default::default()
    }
}

/// Long enough for one request to spend all its retries and still fall back to fixtures.
fn default_adapter_timeout_secs(http_timeout_secs: u64) -> u64 {
    let transport = http_config_for(http_timeout_secs, None).worst_case();
    (transport + FALLBACK_HEADROOM).as_secs_f64().ceil() as u64
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdapterOutcome {
    Success { count: usize, origin: PostingOrigin },
    Failure { cause: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterReport {
    pub source_id: String,
    pub duration_ms: u64,
    pub outcome: AdapterOutcome,
}

impl AdapterReport {
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, AdapterOutcome::Success { .. })
    }

    pub fn log_line(&self) -> String {
        match &self.outcome {
            AdapterOutcome::Success { count, origin } => format!(
                "adapter={} duration_ms={} size={} origin={}",
                self.source_id,
                self.duration_ms,
                count,
                origin.label()
            ),
            AdapterOutcome::Failure { cause } => format!(
                "adapter={} duration_ms={} error={}",
                self.source_id, self.duration_ms, cause
            ),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub postings: Vec<RawPosting>,
    pub reports: Vec<AdapterReport>,
}

impl FetchResult {
    pub fn sources_ok(&self) -> usize {
        self.reports.iter().filter(|r| r.is_ok()).count()
    }

    pub fn sources_total(&self) -> usize {
        self.reports.len()
    }
}

/// Runs every registered adapter once, concurrently, each under its own timeout.
pub struct FetchCoordinator {
    http: Arc<HttpFetcher>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    adapter_timeout: Duration,
}

impl FetchCoordinator {
    pub fn new(http: Arc<HttpFetcher>, adapters: Vec<Arc<dyn SourceAdapter>>, adapter_timeout: Duration) -> Self {
        Self {
            http,
            adapters,
            adapter_timeout,
        }
    }

    /// Postings come back in adapter registration order regardless of completion order.
    pub async fn fetch_all(&self, query: &AdapterQuery) -> FetchResult {
        let handles: Vec<_> = self
            .adapters
            .iter()
            .map(|adapter| {
                let adapter = Arc::clone(adapter);
                let source_id = adapter.source_id().to_string();
                let http = Arc::clone(&self.http);
                let query = query.clone();
                let limit = self.adapter_timeout;
                let span = info_span!("adapter_fetch", adapter = %source_id);
                let handle = tokio::spawn(
                    async move {
                        let started = Instant::now();
                        let outcome = tokio::time::timeout(limit, adapter.fetch(&http, &query)).await;
                        (started.elapsed(), outcome)
                    }
                    .instrument(span),
                );
                (source_id, handle)
            })
            .collect();

        let mut result = FetchResult::default();
        for (source_id, handle) in handles {
            let (elapsed, outcome) = match handle.await {
                Ok((elapsed, Ok(Ok(output)))) => (elapsed, Ok(output)),
                Ok((elapsed, Ok(Err(err)))) => (elapsed, Err(err.to_string())),
                Ok((elapsed, Err(_))) => (
                    elapsed,
                    Err(format!("timed out after {}s", self.adapter_timeout.as_secs_f64())),
                ),
                Err(join) => (Duration::ZERO, Err(format!("adapter task failed: {join}"))),
            };
            let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
            let outcome = match outcome {
                Ok(output) => {
                    let count = output.postings.len();
                    result.postings.extend(output.postings);
                    AdapterOutcome::Success {
                        count,
                        origin: output.origin,
                    }
                }
                Err(cause) => {
                    warn!(adapter = %source_id, duration_ms, error = %cause, "adapter failed");
                    AdapterOutcome::Failure { cause }
                }
            };
            result.reports.push(AdapterReport {
                source_id,
                duration_ms,
                outcome,
            });
        }
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunParams {
    pub window_days: u32,
    pub top_n: usize,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            window_days: DEFAULT_WINDOW_DAYS,
            top_n: DEFAULT_TOP_N,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub skipped: bool,
    pub selected: Vec<SelectedEntry>,
    pub stats: Option<Rollup>,
    pub logs: Vec<String>,
    pub snapshot: Option<SnapshotPaths>,
}

pub struct Pipeline {
    config: SyncConfig,
    coordinator: FetchCoordinator,
    translator: Box<dyn Translator>,
    profile: ScoringProfile,
    writer: SnapshotWriter,
}

impl Pipeline {
    pub fn new(config: SyncConfig, adapters: Vec<Arc<dyn SourceAdapter>>) -> Result<Self> {
        let http = HttpFetcher::new(config.http_config())?;
        let coordinator = FetchCoordinator::new(Arc::new(http), adapters, config.adapter_timeout());
        let writer = SnapshotWriter::new(config.logs_dir());
        Ok(Self {
            config,
            coordinator,
            translator: Box::new(StubTranslator),
            profile: ScoringProfile::default(),
            writer,
        })
    }

    /// Build adapters from the configured source registry.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_path).await?;
        let adapters = registry.build_adapters();
        Self::new(config, adapters)
    }

    pub fn with_translator(mut self, translator: Box<dyn Translator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn with_profile(mut self, profile: ScoringProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self, params: RunParams) -> Result<RunSummary> {
        self.run_at(params, Local::now().fixed_offset()).await
    }

    /// One full run as if the local clock read `now`.
    pub async fn run_at(&self, params: RunParams, now: DateTime<FixedOffset>) -> Result<RunSummary> {
        let today = now.date_naive();
        let run_id = today.format("%Y-%m-%d").to_string();
        let mut log = RunLog::new();

        if now.hour() >= self.config.quiet_after_hour {
            log.push(
                Stage::Guard,
                format!(
                    "skipped hour={} quiet_after_hour={}",
                    now.hour(),
                    self.config.quiet_after_hour
                ),
            );
            return Ok(RunSummary {
                run_id,
                skipped: true,
                selected: Vec::new(),
                stats: None,
                logs: log.into_lines(),
                snapshot: None,
            });
        }

        ensure_dir(&self.config.data_dir).await?;
        let paths = self.config.state_paths();
        let prefs = load_preferences(&paths.preferences).await;

        let query = AdapterQuery {
            query: self.config.query.clone(),
            cities: prefs.city_whitelist.clone(),
            window_days: params.window_days,
            today,
            live_budget: self.config.live_budget(),
        };
        let fetched = self.coordinator.fetch_all(&query).await;
        for report in &fetched.reports {
            log.push(Stage::FetchLatency, report.log_line());
        }
        let (sources_ok, sources_total) = (fetched.sources_ok(), fetched.sources_total());
        let fetched_count = fetched.postings.len();
        log.push(
            Stage::Fetch,
            format!("count={fetched_count} sources_ok={sources_ok}/{sources_total}"),
        );

        let (jobs, normalized) = normalize(fetched.postings, today, params.window_days);
        log.push(
            Stage::Normalize,
            format!(
                "in={} out={} out_of_window={} defaulted_dates={}",
                normalized.input, normalized.output, normalized.out_of_window, normalized.defaulted_dates
            ),
        );

        let (jobs, deduped) = dedup(jobs);
        log.push(
            Stage::Dedup,
            format!(
                "before={} after={} removed={}",
                deduped.before,
                deduped.after,
                deduped.removed()
            ),
        );

        let (jobs, translated) = translate(jobs, self.translator.as_ref());
        log.push(
            Stage::Translate,
            format!(
                "translated={} avg_chars={}",
                translated.translated, translated.avg_chars
            ),
        );

        let (jobs, enriched) = enrich(jobs);
        log.push(
            Stage::Enrich,
            format!(
                "enriched={} english_ok={} norwegian_required={}",
                enriched.enriched, enriched.english_ok, enriched.secondary_required
            ),
        );

        let ranked = rank(&jobs, &prefs, &self.profile);
        let top1 = ranked
            .first()
            .map(|e| format!("\"{} | {}\"", e.company, e.title))
            .unwrap_or_else(|| "none".to_string());
        log.push(Stage::Rank, format!("ranked={} top1={top1}", ranked.len()));

        let (top, selected_report) = select(&ranked, params.top_n);
        log.push(
            Stage::Select,
            format!(
                "final_count={} same_day={}",
                selected_report.final_count, selected_report.same_day
            ),
        );

        let mut seen = SeenStore::load(&paths.seen).await;
        let is_new = seen.observe(&ranked, today);
        seen.save(&paths.seen).await?;

        let mut tracker = StatusTracker::load(&paths.status).await;
        let discovered = tracker.discover(&top, now);
        tracker.save(&paths.status).await?;

        let new_count = is_new.values().filter(|new| **new).count();
        log.push(
            Stage::Persist,
            format!(
                "seen_total={} new={new_count} discovered={discovered} tracked={}",
                seen.len(),
                tracker.len()
            ),
        );

        let selected: Vec<SelectedEntry> = top
            .into_iter()
            .map(|entry| {
                let is_new = is_new.get(&entry.job_id).copied().unwrap_or(false);
                SelectedEntry { entry, is_new }
            })
            .collect();

        let stats = rollup(RollupInputs {
            fetched: fetched_count,
            unique: deduped.after,
            sources_ok,
            sources_total,
            selected: &selected,
        });
        log.push(Stage::Rollup, stats.log_line());

        let logs = log.into_lines();
        let document = DailySnapshot {
            run_id: run_id.clone(),
            generated_at: now,
            stats: stats.clone(),
            jobs: selected.clone(),
            logs: logs.clone(),
        };
        let snapshot = self.writer.write(today, &document).await?;

        Ok(RunSummary {
            run_id,
            skipped: false,
            selected,
            stats: Some(stats),
            logs,
            snapshot: Some(snapshot),
        })
    }
}

/// Register the daily run on `config.run_cron`. The caller starts and owns the scheduler.
pub async fn build_scheduler(pipeline: Arc<Pipeline>, params: RunParams) -> Result<JobScheduler> {
    let cron = pipeline.config().run_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once(params).await {
                Ok(summary) if summary.skipped => info!(run_id = %summary.run_id, "scheduled run skipped by quiet hours"),
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    selected = summary.selected.len(),
                    "scheduled run finished"
                ),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub fn report_daily_markdown(snapshots: &[DailySnapshot]) -> String {
    let mut lines = vec!["# jobhound daily report".to_string(), String::new()];
    if snapshots.is_empty() {
        lines.push("_no daily snapshots found_".to_string());
        return lines.join("\n");
    }
    for snapshot in snapshots {
        let stats = &snapshot.stats;
        lines.push(format!("## {}", snapshot.run_id));
        lines.push(format!("- generated: {}", snapshot.generated_at.to_rfc3339()));
        lines.push(format!(
            "- fetched {}, unique {}, final {}, new today {}",
            stats.fetched, stats.unique, stats.final_count, stats.new_today
        ));
        lines.push(format!(
            "- sources ok {}/{}, english ok {}, genai hits {}",
            stats.sources_ok, stats.sources_total, stats.english_ok, stats.genai_hits
        ));
        for (rank, job) in snapshot.jobs.iter().take(5).enumerate() {
            let marker = if job.is_new { " (new)" } else { "" };
            lines.push(format!(
                "{}. **{}** at {} | {:.2} | {}{marker}",
                rank + 1,
                job.entry.title,
                job.entry.company,
                job.entry.score,
                job.entry.reasons.join("; ")
            ));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

pub async fn report_recent(config: &SyncConfig, days: usize) -> Result<String> {
    let snapshots = SnapshotWriter::new(config.logs_dir())
        .load_recent(days.max(1))
        .await?;
    Ok(report_daily_markdown(&snapshots))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use jobhound_adapters::{AdapterError, FetchOutput};
    use jobhound_core::Metadata;
    use std::collections::HashMap;

    struct StaticAdapter {
        id: &'static str,
        delay: Duration,
        postings: usize,
    }

    #[async_trait]
    impl SourceAdapter for StaticAdapter {
        fn source_id(&self) -> &str {
            self.id
        }

        fn kind(&self) -> AdapterKind {
            AdapterKind::Fixture
        }

        async fn fetch(&self, _http: &HttpFetcher, query: &AdapterQuery) -> Result<FetchOutput, AdapterError> {
            tokio::time::sleep(self.delay).await;
            let postings = (0..self.postings)
                .map(|i| RawPosting {
                    source: self.id.to_string(),
                    source_id: i.to_string(),
                    title: "Product Manager".to_string(),
                    company: "Acme".to_string(),
                    location: "Oslo".to_string(),
                    posted_date: query.today.to_string(),
                    url: format!("https://example.com/{}/{i}", self.id),
                    description_text: String::new(),
                    language_hint: None,
                    seniority_hint: None,
                    employment_type: None,
                    metadata: Metadata::new(),
                })
                .collect();
            Ok(FetchOutput::live(postings))
        }
    }

    struct BrokenAdapter;

    #[async_trait]
    impl SourceAdapter for BrokenAdapter {
        fn source_id(&self) -> &str {
            "broken"
        }

        fn kind(&self) -> AdapterKind {
            AdapterKind::Greenhouse
        }

        async fn fetch(&self, _http: &HttpFetcher, _query: &AdapterQuery) -> Result<FetchOutput, AdapterError> {
            Err(AdapterError::Message("board unreachable".to_string()))
        }
    }

    fn query() -> AdapterQuery {
        AdapterQuery {
            query: DEFAULT_QUERY.to_string(),
            cities: vec!["Oslo".to_string()],
            window_days: 7,
            today: NaiveDate::from_ymd_opt(2026, 2, 22).unwrap(),
            live_budget: Duration::from_secs(5),
        }
    }

    fn coordinator(adapters: Vec<Arc<dyn SourceAdapter>>, timeout: Duration) -> FetchCoordinator {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        FetchCoordinator::new(Arc::new(http), adapters, timeout)
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = SyncConfig::from_lookup(|_| None);
        assert_eq!(defaults.data_dir, PathBuf::from("./data"));
        assert_eq!(defaults.quiet_after_hour, 11);
        assert_eq!(defaults.query, DEFAULT_QUERY);
        assert_eq!(defaults.logs_dir(), PathBuf::from("./data/logs"));

        let env = HashMap::from([
            ("JOBHOUND_DATA_DIR", "/tmp/jh"),
            ("JOBHOUND_QUIET_AFTER_HOUR", "24"),
            ("JOBHOUND_HTTP_TIMEOUT_SECS", "not-a-number"),
        ]);
        let config = SyncConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/jh"));
        assert_eq!(config.quiet_after_hour, 24);
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.state_paths().status, PathBuf::from("/tmp/jh/state/ats.json"));
    }

    #[test]
    fn default_adapter_timeout_outlasts_transport_retries() {
        let defaults = SyncConfig::from_lookup(|_| None);
        let transport = defaults.http_config().worst_case();
        assert_eq!(transport, Duration::from_millis(62_400));
        assert_eq!(defaults.adapter_timeout_secs, 65);
        assert!(defaults.live_budget() >= transport);
        assert!(defaults.live_budget() + FALLBACK_HEADROOM <= defaults.adapter_timeout());

        let env = HashMap::from([("JOBHOUND_HTTP_TIMEOUT_SECS", "5")]);
        let shorter = SyncConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(shorter.adapter_timeout_secs, 20);
        assert!(shorter.live_budget() >= shorter.http_config().worst_case());
    }

    #[tokio::test]
    async fn stalled_finn_still_reports_fixture_postings() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let finn = adapter_for_source(
            AdapterKind::Finn,
            "finn",
            &AdapterSettings {
                base_url: Some(format!("http://{addr}")),
                ..Default::default()
            },
        );
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::from(finn)];
        let query = AdapterQuery {
            live_budget: Duration::from_millis(300),
            ..query()
        };

        let result = coordinator(adapters, Duration::from_secs(2)).fetch_all(&query).await;
        assert_eq!(result.sources_ok(), 1);
        assert_eq!(result.postings, jobhound_adapters::fixture_postings(query.today));
        assert!(result.reports[0].log_line().ends_with("origin=fixture"));
    }

    #[test]
    fn registry_parses_kinds_and_settings() {
        let registry = SourceRegistry::from_yaml(
            r#"
sources:
  - source_id: finn
    display_name: FINN
    kind: finn
  - source_id: gh
    display_name: Greenhouse boards
    enabled: false
    kind: greenhouse
    boards: [cognite, kahoot]
  - source_id: lever
    display_name: Lever
    kind: lever
    companies: [oda]
"#,
        )
        .expect("valid registry");
        assert_eq!(registry.sources.len(), 3);
        assert!(registry.sources[0].enabled);
        assert_eq!(registry.sources[1].settings.boards, vec!["cognite", "kahoot"]);
        assert_eq!(registry.sources[2].kind, AdapterKind::Lever);

        let ids: Vec<String> = registry
            .build_adapters()
            .iter()
            .map(|a| a.source_id().to_string())
            .collect();
        assert_eq!(ids, vec!["finn", "lever"]);
    }

    #[test]
    fn unknown_adapter_kind_is_a_configuration_error() {
        let err = SourceRegistry::from_yaml(
            "sources:\n  - source_id: x\n    display_name: X\n    kind: linkedin\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("source registry"));
    }

    #[tokio::test]
    async fn missing_registry_file_uses_builtin_sources() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = SourceRegistry::load(&dir.path().join("sources.yaml")).await.expect("builtin");
        let kinds: Vec<AdapterKind> = registry.sources.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![AdapterKind::Finn, AdapterKind::Fixture]);
    }

    #[tokio::test]
    async fn fetch_keeps_registration_order_and_isolates_failures() {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(StaticAdapter {
                id: "slow",
                delay: Duration::from_millis(40),
                postings: 2,
            }),
            Arc::new(BrokenAdapter),
            Arc::new(StaticAdapter {
                id: "fast",
                delay: Duration::ZERO,
                postings: 1,
            }),
        ];
        let result = coordinator(adapters, Duration::from_secs(5)).fetch_all(&query()).await;

        let sources: Vec<&str> = result.postings.iter().map(|p| p.source.as_str()).collect();
        assert_eq!(sources, vec!["slow", "slow", "fast"]);
        assert_eq!(result.sources_ok(), 2);
        assert_eq!(result.sources_total(), 3);
        assert!(result.reports[1].log_line().contains("error=board unreachable"));
        assert!(result.reports[2].log_line().contains("size=1 origin=live"));
    }

    #[tokio::test]
    async fn slow_adapter_times_out_without_blocking_others() {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(StaticAdapter {
                id: "stuck",
                delay: Duration::from_secs(30),
                postings: 1,
            }),
            Arc::new(StaticAdapter {
                id: "fast",
                delay: Duration::ZERO,
                postings: 1,
            }),
        ];
        let started = Instant::now();
        let result = coordinator(adapters, Duration::from_millis(50)).fetch_all(&query()).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.postings.len(), 1);
        assert!(matches!(
            &result.reports[0].outcome,
            AdapterOutcome::Failure { cause } if cause.starts_with("timed out")
        ));
    }

    #[tokio::test]
    async fn quiet_hours_skip_touches_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SyncConfig {
            data_dir: dir.path().join("data"),
            ..SyncConfig::from_lookup(|_| None)
        };
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(BrokenAdapter)];
        let pipeline = Pipeline::new(config, adapters).expect("pipeline");
        let at = DateTime::parse_from_rfc3339("2026-02-22T11:00:00+01:00").unwrap();

        let summary = pipeline.run_at(RunParams::default(), at).await.expect("run");
        assert!(summary.skipped);
        assert!(summary.selected.is_empty());
        assert_eq!(summary.logs, vec!["[jobhound][Guard] skipped hour=11 quiet_after_hour=11"]);
        assert!(!dir.path().join("data").exists());
    }

    #[test]
    fn report_renders_counts_per_snapshot() {
        assert!(report_daily_markdown(&[]).contains("no daily snapshots"));

        let snapshot = DailySnapshot {
            run_id: "2026-02-22".to_string(),
            generated_at: DateTime::parse_from_rfc3339("2026-02-22T08:00:00+01:00").unwrap(),
            stats: Rollup {
                fetched: 3,
                unique: 2,
                final_count: 2,
                sources_ok: 1,
                sources_total: 2,
                ..Rollup::default()
            },
            jobs: Vec::new(),
            logs: Vec::new(),
        };
        let text = report_daily_markdown(&[snapshot]);
        assert!(text.contains("## 2026-02-22"));
        assert!(text.contains("fetched 3, unique 2, final 2"));
        assert!(text.contains("sources ok 1/2"));
    }
}
