//! Core domain model and identity scheme for jobhound.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobhound-core";

/// Language every description is ranked in.
pub const DEFAULT_LANGUAGE: &str = "en";
/// Language the normalizer recognizes besides the default one.
pub const SECONDARY_LANGUAGE: &str = "no";

/// Free-form per-record metadata (fetch latency, translation confidence, ...).
pub type Metadata = BTreeMap<String, JsonValue>;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Cross-run identity of a posting: sha256 of `source:source_id`.
///
/// Title and company never participate, so edits at the source keep the id.
pub fn identity_hash(source: &str, source_id: &str) -> String {
    sha256_hex(format!("{source}:{source_id}").as_bytes())
}

/// Adapter-supplied posting before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPosting {
    pub source: String,
    pub source_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    /// Free-form; the normalizer tolerates anything here.
    pub posted_date: String,
    pub url: String,
    pub description_text: String,
    #[serde(default)]
    pub language_hint: Option<String>,
    #[serde(default)]
    pub seniority_hint: Option<String>,
    #[serde(default)]
    pub employment_type: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompanyType {
    #[default]
    Private,
    Government,
}

/// Derived tags attached to a job by the enrichment stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signals {
    pub keywords: BTreeSet<String>,
    pub language_requirements: BTreeSet<String>,
    pub company_type: CompanyType,
    /// `None` when the description says nothing either way.
    pub english_ok: Option<bool>,
}

/// Canonical posting used by every stage after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub identity_hash: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub posted_date: NaiveDate,
    pub age_days: u32,
    pub url: String,
    pub description_raw: String,
    pub description_language: String,
    pub needs_translation: bool,
    pub description_english: Option<String>,
    pub signals: Signals,
    pub seniority_hint: Option<String>,
    pub source: String,
    pub metadata: Metadata,
}

impl Job {
    /// Translated description when available, raw text otherwise.
    pub fn effective_description(&self) -> &str {
        self.description_english
            .as_deref()
            .unwrap_or(&self.description_raw)
    }
}

/// Ranked projection of a [`Job`]; the unit persisted to snapshots and stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub job_id: String,
    pub company: String,
    pub title: String,
    pub location: String,
    pub post_date: NaiveDate,
    pub url: String,
    pub score: f64,
    pub reasons: Vec<String>,
    pub english_ok: Option<bool>,
    pub keywords: Vec<String>,
    pub age_days: u32,
    pub source: String,
}

/// A top-N entry tagged with whether this run is the first to see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedEntry {
    #[serde(flatten)]
    pub entry: RankedEntry,
    pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
    pub url: String,
    pub company: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Discovered,
    Interested,
    Applied,
    Interviewing,
    Rejected,
    Offer,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Discovered,
        Status::Interested,
        Status::Applied,
        Status::Interviewing,
        Status::Rejected,
        Status::Offer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Discovered => "discovered",
            Status::Interested => "interested",
            Status::Applied => "applied",
            Status::Interviewing => "interviewing",
            Status::Rejected => "rejected",
            Status::Offer => "offer",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown status `{0}` (expected one of discovered, interested, applied, interviewing, rejected, offer)")]
pub struct ParseStatusError(String);

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Status::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ParseStatusError(wanted.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Create,
    StatusChange,
}

/// One immutable line of a status record's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<FixedOffset>,
    pub action: HistoryAction,
    pub from_status: Option<Status>,
    pub to_status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub company: String,
    pub title: String,
    pub url: String,
    pub status: Status,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl StatusRecord {
    pub fn discovered(entry: &RankedEntry, at: DateTime<FixedOffset>) -> Self {
        Self {
            company: entry.company.clone(),
            title: entry.title.clone(),
            url: entry.url.clone(),
            status: Status::Discovered,
            notes: String::new(),
            history: vec![HistoryEntry {
                timestamp: at,
                action: HistoryAction::Create,
                from_status: None,
                to_status: Status::Discovered,
            }],
        }
    }

    /// Notes only ever grow, one line per note.
    pub fn append_note(&mut self, note: &str) {
        let note = note.trim();
        if note.is_empty() {
            return;
        }
        if !self.notes.is_empty() {
            self.notes.push('\n');
        }
        self.notes.push_str(note);
    }
}

/// Externally editable user preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub city_whitelist: Vec<String>,
    pub skip_companies: BTreeSet<String>,
    pub priority_companies: BTreeSet<String>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            city_whitelist: vec!["Oslo".to_string(), "Lysaker".to_string()],
            skip_companies: BTreeSet::from(["Skatteetaten".to_string()]),
            priority_companies: BTreeSet::new(),
        }
    }
}

fn company_listed(list: &BTreeSet<String>, company: &str) -> bool {
    let company = company.trim();
    !company.is_empty()
        && list
            .iter()
            .any(|listed| listed.trim().eq_ignore_ascii_case(company))
}

impl Preferences {
    pub fn is_skipped(&self, company: &str) -> bool {
        company_listed(&self.skip_companies, company)
    }

    pub fn is_priority(&self, company: &str) -> bool {
        company_listed(&self.priority_companies, company)
    }

    pub fn add_skip(&mut self, company: &str) {
        let company = company.trim();
        if !company.is_empty() {
            self.skip_companies.insert(company.to_string());
        }
    }

    pub fn add_priority(&mut self, company: &str) {
        let company = company.trim();
        if !company.is_empty() {
            self.priority_companies.insert(company.to_string());
        }
    }

    /// Replace the whitelist from a comma-separated list. Empty input keeps the old one.
    pub fn set_cities(&mut self, csv: &str) -> bool {
        let cities: Vec<String> = csv
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if cities.is_empty() {
            return false;
        }
        self.city_whitelist = cities;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hash_is_stable_and_source_scoped() {
        let a = identity_hash("linkedin", "lnk-001");
        assert_eq!(a, identity_hash("linkedin", "lnk-001"));
        assert_eq!(a, sha256_hex(b"linkedin:lnk-001"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, identity_hash("finn", "lnk-001"));
        assert_ne!(a, identity_hash("linkedin", "lnk-002"));
    }

    #[test]
    fn status_parses_case_insensitively_and_rejects_unknown() {
        assert_eq!("Applied".parse::<Status>().unwrap(), Status::Applied);
        assert_eq!(" offer ".parse::<Status>().unwrap(), Status::Offer);
        assert!("hired".parse::<Status>().is_err());
        assert_eq!(Status::Interviewing.to_string(), "interviewing");
    }

    #[test]
    fn status_record_serializes_lowercase_status_and_history() {
        let at = DateTime::parse_from_rfc3339("2026-02-24T08:00:00+01:00").unwrap();
        let entry = RankedEntry {
            job_id: "abc".into(),
            company: "Cognite".into(),
            title: "Senior Product Manager".into(),
            location: "Oslo, NO".into(),
            post_date: NaiveDate::from_ymd_opt(2026, 2, 23).unwrap(),
            url: "https://example.com/cognite-spm".into(),
            score: 9.5,
            reasons: vec![],
            english_ok: Some(true),
            keywords: vec![],
            age_days: 1,
            source: "linkedin".into(),
        };
        let record = StatusRecord::discovered(&entry, at);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "discovered");
        assert_eq!(json["history"][0]["action"], "create");
        assert_eq!(json["history"][0]["from_status"], JsonValue::Null);
    }

    #[test]
    fn notes_append_with_newlines_and_ignore_blank() {
        let at = DateTime::parse_from_rfc3339("2026-02-24T08:00:00+00:00").unwrap();
        let mut record = StatusRecord {
            company: "Acme".into(),
            title: "PM".into(),
            url: String::new(),
            status: Status::Discovered,
            notes: String::new(),
            history: vec![HistoryEntry {
                timestamp: at,
                action: HistoryAction::Create,
                from_status: None,
                to_status: Status::Discovered,
            }],
        };
        record.append_note("first");
        record.append_note("   ");
        record.append_note("second");
        assert_eq!(record.notes, "first\nsecond");
    }

    #[test]
    fn preferences_match_companies_loosely() {
        let mut prefs = Preferences::default();
        assert!(prefs.is_skipped("skatteetaten "));
        assert!(!prefs.is_skipped(""));
        prefs.add_priority(" Cognite ");
        assert!(prefs.is_priority("COGNITE"));
        assert!(!prefs.set_cities(" , "));
        assert_eq!(prefs.city_whitelist, vec!["Oslo", "Lysaker"]);
        assert!(prefs.set_cities("Bergen, Trondheim"));
        assert_eq!(prefs.city_whitelist, vec!["Bergen", "Trondheim"]);
    }

    #[test]
    fn preferences_fill_missing_fields_with_defaults() {
        let prefs: Preferences = serde_json::from_str(r#"{"skip_companies":["Acme"]}"#).unwrap();
        assert!(prefs.is_skipped("Acme"));
        assert!(!prefs.is_skipped("Skatteetaten"));
        assert_eq!(prefs.city_whitelist, vec!["Oslo", "Lysaker"]);
    }
}
