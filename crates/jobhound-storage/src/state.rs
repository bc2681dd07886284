//! Cross-run state: seen history, ATS-lite status tracking and preferences.
//!
//! Each store is loaded whole, mutated in memory and written back with one atomic replace.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, NaiveDate};
use jobhound_core::{HistoryAction, HistoryEntry, Preferences, RankedEntry, SeenRecord, Status, StatusRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::{load_json_or_default, write_json_atomic};

/// Locations of the persisted documents under one data directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub seen: PathBuf,
    pub status: PathBuf,
    pub preferences: PathBuf,
}

impl StatePaths {
    pub fn under(data_dir: &Path) -> Self {
        let state = data_dir.join("state");
        Self {
            seen: state.join("seen.json"),
            status: state.join("ats.json"),
            preferences: state.join("prefs.json"),
        }
    }
}

/// `job_id -> SeenRecord`. Records are never removed here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeenStore {
    records: BTreeMap<String, SeenRecord>,
}

impl SeenStore {
    pub async fn load(path: &Path) -> Self {
        load_json_or_default(path).await
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        write_json_atomic(path, self).await
    }

    /// Record every entry as seen on `today`; returns `job_id -> is_new`.
    ///
    /// `first_seen` is written only when the id is absent.
    pub fn observe(&mut self, entries: &[RankedEntry], today: NaiveDate) -> BTreeMap<String, bool> {
        let mut is_new = BTreeMap::new();
        for entry in entries {
            match self.records.get_mut(&entry.job_id) {
                Some(record) => {
                    record.last_seen = today;
                    is_new.entry(entry.job_id.clone()).or_insert(false);
                }
                None => {
                    self.records.insert(
                        entry.job_id.clone(),
                        SeenRecord {
                            first_seen: today,
                            last_seen: today,
                            url: entry.url.clone(),
                            company: entry.company.clone(),
                            title: entry.title.clone(),
                        },
                    );
                    is_new.insert(entry.job_id.clone(), true);
                }
            }
        }
        is_new
    }

    pub fn get(&self, job_id: &str) -> Option<&SeenRecord> {
        self.records.get(job_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("job id `{0}` is not tracked; copy a job_id from a daily snapshot")]
    UnknownJob(String),
}

/// ATS-lite lifecycle store: `job_id -> StatusRecord`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusTracker {
    records: BTreeMap<String, StatusRecord>,
}

impl StatusTracker {
    pub async fn load(path: &Path) -> Self {
        load_json_or_default(path).await
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        write_json_atomic(path, self).await
    }

    /// Start tracking unseen entries as `discovered`. Existing records are left alone.
    pub fn discover(&mut self, entries: &[RankedEntry], at: DateTime<FixedOffset>) -> usize {
        let mut created = 0usize;
        for entry in entries {
            if !self.records.contains_key(&entry.job_id) {
                self.records
                    .insert(entry.job_id.clone(), StatusRecord::discovered(entry, at));
                created += 1;
            }
        }
        created
    }

    /// Apply a user-requested status change. Any status may move to any other.
    pub fn transition(
        &mut self,
        job_id: &str,
        to: Status,
        note: Option<&str>,
        at: DateTime<FixedOffset>,
    ) -> Result<&StatusRecord, StatusError> {
        let record = self
            .records
            .get_mut(job_id)
            .ok_or_else(|| StatusError::UnknownJob(job_id.to_string()))?;

        let from = record.status;
        record.status = to;
        if let Some(note) = note {
            record.append_note(note);
        }
        record.history.push(HistoryEntry {
            timestamp: at,
            action: HistoryAction::StatusChange,
            from_status: Some(from),
            to_status: to,
        });
        info!(job_id, from = %from, to = %to, "status transition");
        Ok(record)
    }

    pub fn get(&self, job_id: &str) -> Option<&StatusRecord> {
        self.records.get(job_id)
    }

    /// Records sorted by status name then company, optionally filtered to one status.
    pub fn list(&self, status: Option<Status>) -> Vec<(&str, &StatusRecord)> {
        let mut items: Vec<(&str, &StatusRecord)> = self
            .records
            .iter()
            .filter(|(_, record)| status.map_or(true, |s| record.status == s))
            .map(|(id, record)| (id.as_str(), record))
            .collect();
        items.sort_by(|a, b| {
            a.1.status
                .as_str()
                .cmp(b.1.status.as_str())
                .then_with(|| a.1.company.cmp(&b.1.company))
        });
        items
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub async fn load_preferences(path: &Path) -> Preferences {
    load_json_or_default(path).await
}

pub async fn save_preferences(path: &Path, prefs: &Preferences) -> anyhow::Result<()> {
    write_json_atomic(path, prefs).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(job_id: &str, company: &str) -> RankedEntry {
        RankedEntry {
            job_id: job_id.to_string(),
            company: company.to_string(),
            title: "Product Manager".to_string(),
            location: "Oslo, NO".to_string(),
            post_date: NaiveDate::from_ymd_opt(2026, 2, 20).unwrap(),
            url: format!("https://example.com/{job_id}"),
            score: 4.5,
            reasons: vec!["Title match".to_string()],
            english_ok: None,
            keywords: vec![],
            age_days: 2,
            source: "fixture".to_string(),
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, d).unwrap()
    }

    fn at(hour: u32) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(&format!("2026-02-22T{hour:02}:00:00+01:00")).unwrap()
    }

    #[test]
    fn first_seen_is_fixed_and_is_new_only_on_first_run() {
        let mut store = SeenStore::default();
        let batch = vec![entry("a", "Acme"), entry("b", "Cognite")];

        let first = store.observe(&batch, day(20));
        assert!(first.values().all(|new| *new));

        let second = store.observe(&[entry("a", "Acme"), entry("c", "Kahoot")], day(22));
        assert_eq!(second.get("a"), Some(&false));
        assert_eq!(second.get("c"), Some(&true));

        let a = store.get("a").unwrap();
        assert_eq!(a.first_seen, day(20));
        assert_eq!(a.last_seen, day(22));
        assert_eq!(store.get("b").unwrap().last_seen, day(20));
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn seen_store_persists_as_flat_mapping() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::under(dir.path());
        let mut store = SeenStore::load(&paths.seen).await;
        store.observe(&[entry("a", "Acme")], day(20));
        store.save(&paths.seen).await.expect("save");

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.seen).unwrap()).unwrap();
        assert_eq!(raw["a"]["first_seen"], "2026-02-20");
        assert_eq!(raw["a"]["company"], "Acme");

        let reloaded = SeenStore::load(&paths.seen).await;
        assert_eq!(reloaded, store);
    }

    #[test]
    fn discover_creates_once_and_never_resets_status() {
        let mut tracker = StatusTracker::default();
        assert_eq!(tracker.discover(&[entry("a", "Acme")], at(8)), 1);
        tracker
            .transition("a", Status::Applied, Some("sent cv"), at(9))
            .expect("known id");

        assert_eq!(tracker.discover(&[entry("a", "Acme")], at(10)), 0);
        let record = tracker.get("a").unwrap();
        assert_eq!(record.status, Status::Applied);
        assert_eq!(record.history.len(), 2);
    }

    #[test]
    fn transitions_append_history_in_order() {
        let mut tracker = StatusTracker::default();
        tracker.discover(&[entry("a", "Acme")], at(8));
        tracker
            .transition("a", Status::Interested, None, at(9))
            .unwrap();
        tracker
            .transition("a", Status::Applied, Some("via Greenhouse"), at(10))
            .unwrap();
        let record = tracker
            .transition("a", Status::Discovered, Some("reopened"), at(11))
            .unwrap();

        let steps: Vec<(Option<Status>, Status)> = record
            .history
            .iter()
            .map(|h| (h.from_status, h.to_status))
            .collect();
        assert_eq!(
            steps,
            vec![
                (None, Status::Discovered),
                (Some(Status::Discovered), Status::Interested),
                (Some(Status::Interested), Status::Applied),
                (Some(Status::Applied), Status::Discovered),
            ]
        );
        assert!(record.history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(record.notes, "via Greenhouse\nreopened");
    }

    #[test]
    fn unknown_job_is_rejected_without_mutation() {
        let mut tracker = StatusTracker::default();
        tracker.discover(&[entry("a", "Acme")], at(8));
        let before = tracker.clone();

        let err = tracker
            .transition("missing", Status::Applied, Some("note"), at(9))
            .unwrap_err();
        assert_eq!(err, StatusError::UnknownJob("missing".to_string()));
        assert_eq!(tracker, before);
    }

    #[test]
    fn list_filters_and_sorts_by_status_then_company() {
        let mut tracker = StatusTracker::default();
        tracker.discover(
            &[entry("a", "Zalando"), entry("b", "Acme"), entry("c", "Cognite")],
            at(8),
        );
        tracker.transition("c", Status::Applied, None, at(9)).unwrap();

        let all: Vec<&str> = tracker.list(None).into_iter().map(|(id, _)| id).collect();
        assert_eq!(all, vec!["c", "b", "a"]);

        let discovered: Vec<&str> = tracker
            .list(Some(Status::Discovered))
            .into_iter()
            .map(|(_, r)| r.company.as_str())
            .collect();
        assert_eq!(discovered, vec!["Acme", "Zalando"]);
    }

    #[tokio::test]
    async fn preferences_default_when_missing_and_round_trip() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::under(dir.path());
        let mut prefs = load_preferences(&paths.preferences).await;
        assert_eq!(prefs, Preferences::default());

        prefs.add_skip("Acme");
        save_preferences(&paths.preferences, &prefs).await.expect("save");
        assert!(load_preferences(&paths.preferences).await.is_skipped("acme"));
    }
}
