//! Pure in-memory pipeline stages: normalize, dedup, translate, enrich, rank, select, rollup.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use jobhound_core::{
    identity_hash, CompanyType, Job, Preferences, RankedEntry, RawPosting, SelectedEntry, Signals,
    DEFAULT_LANGUAGE, SECONDARY_LANGUAGE,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Guard,
    FetchLatency,
    Fetch,
    Normalize,
    Dedup,
    Translate,
    Enrich,
    Rank,
    Select,
    Persist,
    Rollup,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Guard => "Guard",
            Stage::FetchLatency => "FetchLatency",
            Stage::Fetch => "Fetch",
            Stage::Normalize => "Normalize",
            Stage::Dedup => "Dedup",
            Stage::Translate => "Translate",
            Stage::Enrich => "Enrich",
            Stage::Rank => "Rank",
            Stage::Select => "Select",
            Stage::Persist => "Persist",
            Stage::Rollup => "Rollup",
        }
    }
}

/// Stage-tagged human readable lines kept for the daily snapshot.
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    lines: Vec<String>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        info!(stage = stage.name(), "{message}");
        self.lines
            .push(format!("[jobhound][{}] {message}", stage.name()));
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

// ---- Normalize ----

static SECONDARY_LANGUAGE_MARKERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(å|ø|æ|norsk|norge)\b").expect("valid regex"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub input: usize,
    pub output: usize,
    pub out_of_window: usize,
    pub defaulted_dates: usize,
}

/// Accepts RFC 3339 timestamps, naive `YYYY-MM-DDTHH:MM:SS`, or a leading `YYYY-MM-DD`.
pub fn parse_canonical_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.date());
    }
    raw.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

/// Deliberately narrow: a diacritic only counts when it stands alone as a word, so
/// "Vi søker" guesses English. Adapters that know better pass a language hint.
pub fn guess_language(text: &str) -> &'static str {
    if SECONDARY_LANGUAGE_MARKERS.is_match(text) {
        SECONDARY_LANGUAGE
    } else {
        DEFAULT_LANGUAGE
    }
}

/// Map one raw posting to a [`Job`]. The flag reports whether the date fell back to `today`.
pub fn normalize_posting(raw: RawPosting, today: NaiveDate) -> (Job, bool) {
    let parsed = parse_canonical_date(&raw.posted_date);
    let defaulted = parsed.is_none();
    let posted_date = parsed.unwrap_or(today);
    let age_days = u32::try_from((today - posted_date).num_days().max(0)).unwrap_or(u32::MAX);

    let language = raw
        .language_hint
        .as_deref()
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| guess_language(&raw.description_text).to_string());
    let needs_translation = language != DEFAULT_LANGUAGE;

    let job = Job {
        identity_hash: identity_hash(&raw.source, &raw.source_id),
        title: raw.title,
        company: raw.company,
        location: raw.location,
        posted_date,
        age_days,
        url: raw.url,
        description_raw: raw.description_text,
        description_language: language,
        needs_translation,
        description_english: None,
        signals: Signals::default(),
        seniority_hint: raw.seniority_hint,
        source: raw.source,
        metadata: raw.metadata,
    };
    (job, defaulted)
}

/// Normalize a batch and drop postings older than `window_days`.
pub fn normalize(raws: Vec<RawPosting>, today: NaiveDate, window_days: u32) -> (Vec<Job>, NormalizeReport) {
    let mut report = NormalizeReport {
        input: raws.len(),
        ..Default::default()
    };
    let mut jobs = Vec::with_capacity(raws.len());
    for raw in raws {
        let (job, defaulted) = normalize_posting(raw, today);
        if defaulted {
            report.defaulted_dates += 1;
        }
        if job.age_days > window_days {
            report.out_of_window += 1;
            continue;
        }
        jobs.push(job);
    }
    report.output = jobs.len();
    (jobs, report)
}

// ---- Dedup ----

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupReport {
    pub before: usize,
    pub after: usize,
}

impl DedupReport {
    pub fn removed(&self) -> usize {
        self.before - self.after
    }
}

/// First job per identity hash wins; later ones are dropped untouched.
pub fn dedup(jobs: Vec<Job>) -> (Vec<Job>, DedupReport) {
    let before = jobs.len();
    let mut seen = HashSet::with_capacity(before);
    let unique: Vec<Job> = jobs
        .into_iter()
        .filter(|job| seen.insert(job.identity_hash.clone()))
        .collect();
    let report = DedupReport {
        before,
        after: unique.len(),
    };
    (unique, report)
}

// ---- Translate ----

pub const STUB_TRANSLATION_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub text: String,
    pub confidence: f64,
}

/// Pluggable translation provider. Must not perform I/O inside the pipeline.
pub trait Translator: Send + Sync {
    fn translate(&self, text: &str, source_language: &str) -> Translation;
}

/// Marks the text as machine translated without changing it.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubTranslator;

impl Translator for StubTranslator {
    fn translate(&self, text: &str, source_language: &str) -> Translation {
        if source_language == DEFAULT_LANGUAGE {
            return Translation {
                text: text.to_string(),
                confidence: 1.0,
            };
        }
        Translation {
            text: format!("[AUTO-TRANSLATED from {source_language}] {text}"),
            confidence: STUB_TRANSLATION_CONFIDENCE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslateReport {
    pub translated: usize,
    pub avg_chars: usize,
}

/// Fill `description_english`. Only description fields are touched.
pub fn translate(mut jobs: Vec<Job>, translator: &dyn Translator) -> (Vec<Job>, TranslateReport) {
    let mut translated = 0usize;
    for job in &mut jobs {
        let (text, confidence) = if job.needs_translation {
            translated += 1;
            let t = translator.translate(&job.description_raw, &job.description_language);
            (t.text, t.confidence)
        } else {
            (job.description_raw.clone(), 1.0)
        };
        job.description_english = Some(text);
        job.metadata
            .insert("translation_confidence".to_string(), json!(confidence));
    }
    let total_chars: usize = jobs.iter().map(|j| j.description_raw.chars().count()).sum();
    let report = TranslateReport {
        translated,
        avg_chars: total_chars / jobs.len().max(1),
    };
    (jobs, report)
}

// ---- Enrich ----

pub const KEYWORD_VOCABULARY: [&str; 9] = [
    "GenAI",
    "LLM",
    "SaaS",
    "B2B",
    "SQL",
    "analytics",
    "roadmap",
    "Norwegian",
    "English",
];

pub const SECONDARY_LANGUAGE_REQUIREMENT: &str = "Norwegian";
pub const DEFAULT_LANGUAGE_REQUIREMENT: &str = "English";

static KEYWORD_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    KEYWORD_VOCABULARY
        .iter()
        .map(|k| {
            let re = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(k))).expect("valid regex");
            (*k, re)
        })
        .collect()
});

static SECONDARY_REQUIREMENT_MARKERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(norwegian|norsk)\b").expect("valid regex"));
static DEFAULT_REQUIREMENT_MARKERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\benglish\b").expect("valid regex"));
static GOVERNMENT_NAMES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)skatteetaten|municipal|kommune|directorate|direktoratet|agency|etaten")
        .expect("valid regex")
});

pub fn classify_company(name: &str) -> CompanyType {
    if GOVERNMENT_NAMES.is_match(name) {
        CompanyType::Government
    } else {
        CompanyType::Private
    }
}

/// Signals are recomputed from scratch, so enriching twice yields the same result.
pub fn derive_signals(job: &Job) -> Signals {
    let text = job.effective_description();
    let keywords = KEYWORD_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(k, _)| k.to_string())
        .collect();

    let mut language_requirements = std::collections::BTreeSet::new();
    let secondary = SECONDARY_REQUIREMENT_MARKERS.is_match(text);
    let default = DEFAULT_REQUIREMENT_MARKERS.is_match(text);
    if secondary {
        language_requirements.insert(SECONDARY_LANGUAGE_REQUIREMENT.to_string());
    }
    if default {
        language_requirements.insert(DEFAULT_LANGUAGE_REQUIREMENT.to_string());
    }
    let english_ok = if secondary {
        Some(false)
    } else if default {
        Some(true)
    } else {
        None
    };

    Signals {
        keywords,
        language_requirements,
        company_type: classify_company(&job.company),
        english_ok,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichReport {
    pub enriched: usize,
    pub english_ok: usize,
    pub secondary_required: usize,
}

pub fn enrich(mut jobs: Vec<Job>) -> (Vec<Job>, EnrichReport) {
    let mut report = EnrichReport {
        enriched: jobs.len(),
        ..Default::default()
    };
    for job in &mut jobs {
        job.signals = derive_signals(job);
        match job.signals.english_ok {
            Some(true) => report.english_ok += 1,
            Some(false) => report.secondary_required += 1,
            None => {}
        }
    }
    (jobs, report)
}

// ---- Rank ----

pub const WEIGHT_TITLE: f64 = 3.0;
pub const WEIGHT_DOMAIN: f64 = 2.5;
pub const WEIGHT_ENGLISH_OK: f64 = 1.5;
pub const WEIGHT_SENIORITY: f64 = 1.0;
pub const WEIGHT_SKILLS: f64 = 1.0;
pub const PENALTY_SKIP: f64 = -10.0;
pub const BONUS_PRIORITY: f64 = 0.5;
pub const BONUS_FRESH: f64 = 1.5;
pub const BONUS_RECENT: f64 = 0.8;
pub const FRESH_MAX_AGE: u32 = 3;
pub const RECENT_MAX_AGE: u32 = 7;
pub const MAX_REASONS: usize = 3;

/// Vocabulary the ranker scores against.
#[derive(Debug, Clone)]
pub struct ScoringProfile {
    title_pattern: Regex,
    seniority_pattern: Regex,
    pub domain_keywords: Vec<String>,
    pub skill_keywords: Vec<String>,
}

impl ScoringProfile {
    pub fn new(
        title_phrases: &[&str],
        seniority_markers: &[&str],
        domain_keywords: &[&str],
        skill_keywords: &[&str],
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            title_pattern: word_alternation(title_phrases)?,
            seniority_pattern: word_alternation(seniority_markers)?,
            domain_keywords: domain_keywords.iter().map(|s| s.to_string()).collect(),
            skill_keywords: skill_keywords.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn title_matches(&self, title: &str) -> bool {
        self.title_pattern.is_match(title)
    }

    pub fn seniority_matches(&self, hint: &str) -> bool {
        self.seniority_pattern.is_match(hint)
    }
}

impl Default for ScoringProfile {
    fn default() -> Self {
        Self::new(
            &["Product Manager", "Senior Product Manager", "Product Owner"],
            &["Senior", "Lead"],
            &["B2B", "SaaS"],
            &["LLM", "GenAI", "SQL", "analytics", "roadmap"],
        )
        .expect("default scoring profile compiles")
    }
}

fn word_alternation(words: &[&str]) -> Result<Regex, regex::Error> {
    let alternation = words
        .iter()
        .map(|w| regex::escape(w))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{alternation})\b"))
}

fn overlaps(keywords: &std::collections::BTreeSet<String>, wanted: &[String]) -> bool {
    wanted.iter().any(|w| keywords.contains(w))
}

/// Weighted heuristic score, floored at zero and rounded to cents, plus up to three reasons.
pub fn score_job(job: &Job, prefs: &Preferences, profile: &ScoringProfile) -> (f64, Vec<String>) {
    let mut score = 0.0;
    let mut reasons: Vec<&str> = Vec::new();
    let mut apply = |fired: bool, weight: f64, reason: &'static str| {
        if fired {
            score += weight;
            reasons.push(reason);
        }
    };

    // Skip goes first so its reason always survives the display cap.
    apply(prefs.is_skipped(&job.company), PENALTY_SKIP, "SKIP company");
    apply(profile.title_matches(&job.title), WEIGHT_TITLE, "Title match");
    apply(
        overlaps(&job.signals.keywords, &profile.domain_keywords),
        WEIGHT_DOMAIN,
        "B2B/SaaS",
    );
    apply(job.signals.english_ok == Some(true), WEIGHT_ENGLISH_OK, "English OK");
    apply(
        job.seniority_hint
            .as_deref()
            .is_some_and(|hint| profile.seniority_matches(hint)),
        WEIGHT_SENIORITY,
        "Sr/Lead",
    );
    apply(
        overlaps(&job.signals.keywords, &profile.skill_keywords),
        WEIGHT_SKILLS,
        "Key skills",
    );
    apply(prefs.is_priority(&job.company), BONUS_PRIORITY, "Priority company");
    if job.age_days <= FRESH_MAX_AGE {
        apply(true, BONUS_FRESH, "Fresh");
    } else if job.age_days <= RECENT_MAX_AGE {
        apply(true, BONUS_RECENT, "Recent");
    }

    let score = (f64::max(0.0, score) * 100.0).round() / 100.0;
    let reasons = reasons
        .into_iter()
        .take(MAX_REASONS)
        .map(str::to_string)
        .collect();
    (score, reasons)
}

/// Score every job and order by score, then posted date, both descending. Ties keep input order.
pub fn rank(jobs: &[Job], prefs: &Preferences, profile: &ScoringProfile) -> Vec<RankedEntry> {
    let mut ranked: Vec<RankedEntry> = jobs
        .iter()
        .map(|job| {
            let (score, reasons) = score_job(job, prefs, profile);
            RankedEntry {
                job_id: job.identity_hash.clone(),
                company: job.company.clone(),
                title: job.title.clone(),
                location: job.location.clone(),
                post_date: job.posted_date,
                url: job.url.clone(),
                score,
                reasons,
                english_ok: job.signals.english_ok,
                keywords: job.signals.keywords.iter().cloned().collect(),
                age_days: job.age_days,
                source: job.source.clone(),
            }
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.post_date.cmp(&a.post_date))
    });
    ranked
}

// ---- Select ----

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectReport {
    pub final_count: usize,
    pub same_day: usize,
}

pub fn select(ranked: &[RankedEntry], top_n: usize) -> (Vec<RankedEntry>, SelectReport) {
    let selected: Vec<RankedEntry> = ranked.iter().take(top_n).cloned().collect();
    let report = SelectReport {
        final_count: selected.len(),
        same_day: selected.iter().filter(|e| e.age_days == 0).count(),
    };
    (selected, report)
}

// ---- Rollup ----

/// Per-run aggregate counters stored under `stats` in the daily snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    pub fetched: usize,
    pub unique: usize,
    #[serde(rename = "final")]
    pub final_count: usize,
    pub median_age: Option<u32>,
    pub english_ok: usize,
    pub genai_hits: usize,
    pub errors: usize,
    pub sources_ok: usize,
    pub sources_total: usize,
    pub new_today: usize,
    pub same_day: usize,
}

pub struct RollupInputs<'a> {
    pub fetched: usize,
    pub unique: usize,
    pub sources_ok: usize,
    pub sources_total: usize,
    pub selected: &'a [SelectedEntry],
}

pub fn median_age(entries: &[SelectedEntry]) -> Option<u32> {
    if entries.is_empty() {
        return None;
    }
    let mut ages: Vec<u32> = entries.iter().map(|e| e.entry.age_days).collect();
    ages.sort_unstable();
    Some(ages[ages.len() / 2])
}

pub fn rollup(inputs: RollupInputs<'_>) -> Rollup {
    let selected = inputs.selected;
    Rollup {
        fetched: inputs.fetched,
        unique: inputs.unique,
        final_count: selected.len(),
        median_age: median_age(selected),
        english_ok: selected
            .iter()
            .filter(|e| e.entry.english_ok == Some(true))
            .count(),
        genai_hits: selected
            .iter()
            .filter(|e| e.entry.keywords.iter().any(|k| k == "GenAI" || k == "LLM"))
            .count(),
        errors: inputs.sources_total - inputs.sources_ok,
        sources_ok: inputs.sources_ok,
        sources_total: inputs.sources_total,
        new_today: selected.iter().filter(|e| e.is_new).count(),
        same_day: selected.iter().filter(|e| e.entry.age_days == 0).count(),
    }
}

impl Rollup {
    pub fn log_line(&self) -> String {
        let median = self
            .median_age
            .map(|m| m.to_string())
            .unwrap_or_else(|| "none".to_string());
        format!(
            "fetched={} unique={} final={} median_age={} english_ok={} genai_hits={} errors={} new_today={}",
            self.fetched,
            self.unique,
            self.final_count,
            median,
            self.english_ok,
            self.genai_hits,
            self.errors,
            self.new_today
        )
    }
}
