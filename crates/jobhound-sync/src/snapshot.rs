//! Daily snapshot artifacts under `<data_dir>/logs`: one JSON document and one Parquet table per day.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, FixedOffset, NaiveDate};
use jobhound_core::SelectedEntry;
use jobhound_storage::{ensure_dir, write_bytes_with_retry, write_json_atomic, write_policy};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::stages::Rollup;

pub const RETENTION_DAYS: i64 = 7;
pub const REASONS_DELIMITER: &str = "; ";
pub const TABLE_COLUMNS: [&str; 9] = [
    "job_id", "company", "title", "location", "post_date", "score", "reasons", "url", "source",
];

const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySnapshot {
    pub run_id: String,
    pub generated_at: DateTime<FixedOffset>,
    pub stats: Rollup,
    pub jobs: Vec<SelectedEntry>,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotPaths {
    pub document: PathBuf,
    pub table: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
    retention_days: i64,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            retention_days: RETENTION_DAYS,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn document_path(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.json", day.format(DAY_FORMAT)))
    }

    pub fn table_path(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.parquet", day.format(DAY_FORMAT)))
    }

    /// Delete day artifacts whose filename date is `retention_days` or more before `today`.
    pub async fn prune(&self, today: NaiveDate) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.dir.display()))
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.dir.display()))?
        {
            let path = entry.path();
            let Some(day) = artifact_day(&path) else {
                continue;
            };
            if (today - day).num_days() < self.retention_days {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed.push(path),
                Err(err) => warn!(path = %path.display(), error = %err, "could not prune snapshot"),
            }
        }
        removed.sort();
        Ok(removed)
    }

    /// Prune, then replace both artifacts for `day`.
    pub async fn write(&self, day: NaiveDate, snapshot: &DailySnapshot) -> Result<SnapshotPaths> {
        ensure_dir(&self.dir).await?;
        let pruned = self.prune(day).await?;
        if !pruned.is_empty() {
            info!(count = pruned.len(), "pruned expired snapshots");
        }

        let paths = SnapshotPaths {
            document: self.document_path(day),
            table: self.table_path(day),
        };
        write_json_atomic(&paths.document, snapshot).await?;
        let table = tabular_bytes(&snapshot.jobs)?;
        write_bytes_with_retry(&paths.table, &table, write_policy()).await?;
        Ok(paths)
    }

    /// Up to `days` most recent snapshot documents, newest first. Unreadable documents are skipped.
    pub async fn load_recent(&self, days: usize) -> Result<Vec<DailySnapshot>> {
        let mut documents = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.dir.display()))
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.dir.display()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(day) = artifact_day(&path) {
                    documents.push((day, path));
                }
            }
        }
        documents.sort_by(|a, b| b.0.cmp(&a.0));

        let mut snapshots = Vec::new();
        for (_, path) in documents.into_iter().take(days) {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            match serde_json::from_str(&text) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable snapshot"),
            }
        }
        Ok(snapshots)
    }
}

/// Date encoded in a `YYYY-MM-DD.{json,parquet}` filename.
fn artifact_day(path: &Path) -> Option<NaiveDate> {
    let ext = path.extension()?.to_str()?;
    if ext != "json" && ext != "parquet" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    NaiveDate::parse_from_str(stem, DAY_FORMAT).ok()
}

pub fn table_schema() -> Arc<Schema> {
    let fields = TABLE_COLUMNS
        .iter()
        .map(|name| {
            let data_type = if *name == "score" {
                DataType::Float64
            } else {
                DataType::Utf8
            };
            ArrowField::new(*name, data_type, false)
        })
        .collect::<Vec<_>>();
    Arc::new(Schema::new(fields))
}

fn string_column<'a>(entries: &'a [SelectedEntry], f: impl Fn(&'a SelectedEntry) -> String) -> ArrayRef {
    Arc::new(StringArray::from(entries.iter().map(f).collect::<Vec<_>>()))
}

/// Encode the selected entries as an in-memory Parquet file.
pub fn tabular_bytes(entries: &[SelectedEntry]) -> Result<Vec<u8>> {
    let columns: Vec<ArrayRef> = vec![
        string_column(entries, |e| e.entry.job_id.clone()),
        string_column(entries, |e| e.entry.company.clone()),
        string_column(entries, |e| e.entry.title.clone()),
        string_column(entries, |e| e.entry.location.clone()),
        string_column(entries, |e| e.entry.post_date.format(DAY_FORMAT).to_string()),
        Arc::new(Float64Array::from(
            entries.iter().map(|e| e.entry.score).collect::<Vec<_>>(),
        )),
        string_column(entries, |e| e.entry.reasons.join(REASONS_DELIMITER)),
        string_column(entries, |e| e.entry.url.clone()),
        string_column(entries, |e| e.entry.source.clone()),
    ];
    let batch = RecordBatch::try_new(table_schema(), columns).context("building snapshot record batch")?;

    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(&batch).context("writing snapshot record batch")?;
    writer.into_inner().context("closing parquet writer")
}
