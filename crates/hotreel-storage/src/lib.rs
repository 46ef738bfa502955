//! Result persistence (parquet batches) and stored-session loading for HOTREEL.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use hotreel_core::{Comment, ItemRecord, RelatedRecord, StoredBatch};
use parquet::arrow::ArrowWriter;
use parquet::file::reader::{FileReader, SerializedFileReader};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hotreel-storage";

pub const PRIMARY_DIR: &str = "hotdata";
pub const RELATED_DIR: &str = "recommendations";
pub const DEFAULT_PRIMARY_PREFIX: &str = "iqiyi";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// One batch handed to a sink. Related batches carry the name of the item they were found on.
#[derive(Debug, Clone, Copy)]
pub enum ResultBatch<'a> {
    Primary(&'a [ItemRecord]),
    Related {
        origin: &'a str,
        records: &'a [RelatedRecord],
    },
}

impl ResultBatch<'_> {
    pub fn len(&self) -> usize {
        match self {
            ResultBatch::Primary(records) => records.len(),
            ResultBatch::Related { records, .. } => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn append_batch(
        &self,
        batch: ResultBatch<'_>,
        at: DateTime<Utc>,
    ) -> Result<StoredBatch, PersistenceError>;
}

/// Row shape of a primary batch after comments are serialized to JSON text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryRow {
    pub name: String,
    pub link: String,
    pub poster_url: String,
    pub rating: String,
    pub rating_count: String,
    pub description: String,
    pub cast: String,
    pub comments_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedRow {
    pub origin: String,
    pub name: String,
    pub link: String,
    pub poster_url: String,
    pub kind: Option<String>,
    pub episode_label: Option<String>,
    pub rating: Option<String>,
    pub rating_count: Option<String>,
    pub description: Option<String>,
    pub cast: Option<String>,
    pub comments_json: String,
}

pub fn serialize_comments(comments: &[Comment]) -> Result<String> {
    serde_json::to_string(comments).context("serializing comments")
}

pub fn hydrate_primary_rows(records: &[ItemRecord]) -> Result<Vec<PrimaryRow>> {
    records
        .iter()
        .map(|r| {
            Ok(PrimaryRow {
                name: r.name.clone(),
                link: r.link.clone(),
                poster_url: r.poster_url.clone(),
                rating: r.rating.clone(),
                rating_count: r.rating_count.clone(),
                description: r.description.clone(),
                cast: r.cast.clone(),
                comments_json: serialize_comments(&r.comments)
                    .with_context(|| format!("hydrating comments of {}", r.name))?,
            })
        })
        .collect()
}

pub fn hydrate_related_rows(origin: &str, records: &[RelatedRecord]) -> Result<Vec<RelatedRow>> {
    records
        .iter()
        .map(|r| {
            let detail = r.detail.as_ref();
            Ok(RelatedRow {
                origin: origin.to_string(),
                name: r.item.name.clone(),
                link: r.item.source_link.clone(),
                poster_url: r.item.poster_url.clone(),
                kind: r.item.kind.clone(),
                episode_label: r.item.episode_label.clone(),
                rating: detail.map(|d| d.rating.clone()),
                rating_count: detail.map(|d| d.rating_count.clone()),
                description: detail.map(|d| d.description.clone()),
                cast: detail.map(|d| d.cast.clone()),
                comments_json: serialize_comments(&r.comments)
                    .with_context(|| format!("hydrating comments of {}", r.item.name))?,
            })
        })
        .collect()
}

/// Keeps a batch file name inside its directory: separators and control characters become `_`.
pub fn sanitize_file_stem(input: &str) -> String {
    let cleaned = input
        .trim()
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect::<String>();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned
    }
}

/// Parquet-backed sink writing one file per batch under `root`.
#[derive(Debug, Clone)]
pub struct ParquetResultStore {
    root: PathBuf,
    primary_prefix: String,
}

impl ParquetResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            primary_prefix: DEFAULT_PRIMARY_PREFIX.to_string(),
        }
    }

    pub fn with_primary_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.primary_prefix = prefix.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn primary_prefix(&self) -> &str {
        &self.primary_prefix
    }

    pub fn primary_path(&self, at: DateTime<Utc>) -> PathBuf {
        self.root.join(PRIMARY_DIR).join(format!(
            "{}_{}.parquet",
            self.primary_prefix,
            at.format(TIMESTAMP_FORMAT)
        ))
    }

    pub fn related_path(&self, origin: &str, at: DateTime<Utc>) -> PathBuf {
        self.root.join(RELATED_DIR).join(format!(
            "{}_{}.parquet",
            sanitize_file_stem(origin),
            at.format(TIMESTAMP_FORMAT)
        ))
    }
}

#[async_trait]
impl ResultSink for ParquetResultStore {
    async fn append_batch(
        &self,
        batch: ResultBatch<'_>,
        at: DateTime<Utc>,
    ) -> Result<StoredBatch, PersistenceError> {
        if batch.is_empty() {
            return Err(PersistenceError::Message("refusing to store an empty batch".into()));
        }

        let (path, record_batch) = match batch {
            ResultBatch::Primary(records) => {
                let rows = hydrate_primary_rows(records)?;
                (self.primary_path(at), primary_record_batch(&rows)?)
            }
            ResultBatch::Related { origin, records } => {
                let rows = hydrate_related_rows(origin, records)?;
                (self.related_path(origin, at), related_record_batch(&rows)?)
            }
        };
        let rows = record_batch.num_rows();

        let target = path.clone();
        let sha256 = tokio::task::spawn_blocking(move || write_parquet_atomically(&target, record_batch))
            .await
            .map_err(|e| PersistenceError::Message(format!("parquet writer task failed: {e}")))??;

        info!(path = %path.display(), rows, "stored result batch");
        Ok(StoredBatch { path, rows, sha256 })
    }
}

fn string_column<'a>(values: impl Iterator<Item = &'a str>) -> ArrayRef {
    Arc::new(StringArray::from(values.map(Some).collect::<Vec<_>>()))
}

fn optional_string_column<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    Arc::new(StringArray::from(values.collect::<Vec<_>>()))
}

fn primary_record_batch(rows: &[PrimaryRow]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("link", DataType::Utf8, false),
        ArrowField::new("poster_url", DataType::Utf8, false),
        ArrowField::new("rating", DataType::Utf8, false),
        ArrowField::new("rating_count", DataType::Utf8, false),
        ArrowField::new("description", DataType::Utf8, false),
        ArrowField::new("cast", DataType::Utf8, false),
        ArrowField::new("comments", DataType::Utf8, false),
    ]));

    RecordBatch::try_new(
        schema,
        vec![
            string_column(rows.iter().map(|r| r.name.as_str())),
            string_column(rows.iter().map(|r| r.link.as_str())),
            string_column(rows.iter().map(|r| r.poster_url.as_str())),
            string_column(rows.iter().map(|r| r.rating.as_str())),
            string_column(rows.iter().map(|r| r.rating_count.as_str())),
            string_column(rows.iter().map(|r| r.description.as_str())),
            string_column(rows.iter().map(|r| r.cast.as_str())),
            string_column(rows.iter().map(|r| r.comments_json.as_str())),
        ],
    )
    .context("building primary record batch")
}

fn related_record_batch(rows: &[RelatedRow]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("origin", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("link", DataType::Utf8, false),
        ArrowField::new("poster_url", DataType::Utf8, false),
        ArrowField::new("type", DataType::Utf8, true),
        ArrowField::new("episodes", DataType::Utf8, true),
        ArrowField::new("rating", DataType::Utf8, true),
        ArrowField::new("rating_count", DataType::Utf8, true),
        ArrowField::new("description", DataType::Utf8, true),
        ArrowField::new("cast", DataType::Utf8, true),
        ArrowField::new("comments", DataType::Utf8, false),
    ]));

    RecordBatch::try_new(
        schema,
        vec![
            string_column(rows.iter().map(|r| r.origin.as_str())),
            string_column(rows.iter().map(|r| r.name.as_str())),
            string_column(rows.iter().map(|r| r.link.as_str())),
            string_column(rows.iter().map(|r| r.poster_url.as_str())),
            optional_string_column(rows.iter().map(|r| r.kind.as_deref())),
            optional_string_column(rows.iter().map(|r| r.episode_label.as_deref())),
            optional_string_column(rows.iter().map(|r| r.rating.as_deref())),
            optional_string_column(rows.iter().map(|r| r.rating_count.as_deref())),
            optional_string_column(rows.iter().map(|r| r.description.as_deref())),
            optional_string_column(rows.iter().map(|r| r.cast.as_deref())),
            string_column(rows.iter().map(|r| r.comments_json.as_str())),
        ],
    )
    .context("building related record batch")
}

/// Writes through a temp file in the target directory and renames into place.
/// Returns the sha256 of the finished file.
fn write_parquet_atomically(path: &Path, batch: RecordBatch) -> Result<String> {
    let parent = path
        .parent()
        .with_context(|| format!("batch path {} has no parent", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("creating batch directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.parquet.tmp", Uuid::new_v4()));
    let written = (|| -> Result<()> {
        let file = File::create(&temp_path)
            .with_context(|| format!("creating {}", temp_path.display()))?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
            .with_context(|| format!("opening parquet writer {}", temp_path.display()))?;
        writer
            .write(&batch)
            .with_context(|| format!("writing record batch {}", temp_path.display()))?;
        writer
            .close()
            .with_context(|| format!("closing parquet writer {}", temp_path.display()))?;
        Ok(())
    })();

    if let Err(err) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err);
    }

    if let Err(err) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(sha256_hex(&bytes))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// A primary batch found on disk.
#[derive(Debug, Clone, Serialize)]
pub struct StoredRun {
    pub file_name: String,
    pub path: PathBuf,
    pub timestamp: String,
    pub display_name: String,
    pub rows: Option<u64>,
}

/// Primary batches under `root`, newest first. Files whose names do not carry a
/// `<prefix>_<YYYYmmdd_HHMMSS>.parquet` timestamp are skipped.
pub fn list_stored_runs(root: &Path, prefix: &str) -> Result<Vec<StoredRun>> {
    let dir = root.join(PRIMARY_DIR);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut runs = Vec::new();
    for entry in std::fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry.with_context(|| format!("reading entry in {}", dir.display()))?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(stamp) = file_name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('_'))
            .and_then(|rest| rest.strip_suffix(".parquet"))
        else {
            continue;
        };
        let parsed = match NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(file = %file_name, error = %err, "skipping batch with malformed timestamp");
                continue;
            }
        };
        let path = entry.path();
        let rows = match parquet_row_count(&path) {
            Ok(rows) => Some(rows),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not read batch metadata");
                None
            }
        };
        runs.push(StoredRun {
            timestamp: stamp.to_string(),
            display_name: parsed.format("%Y-%m-%d %H:%M:%S").to_string(),
            file_name,
            path,
            rows,
        });
    }

    runs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(runs)
}

fn parquet_row_count(path: &Path) -> Result<u64> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = SerializedFileReader::new(file)
        .with_context(|| format!("reading parquet footer {}", path.display()))?;
    let rows = reader.metadata().file_metadata().num_rows();
    Ok(u64::try_from(rows).unwrap_or_default())
}

/// Cookie captured from a logged-in browser session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: Option<bool>,
    #[serde(default, rename = "httpOnly")]
    pub http_only: Option<bool>,
    #[serde(default)]
    pub expiry: Option<i64>,
}

impl SessionToken {
    /// `Set-Cookie` style header value for this token.
    pub fn to_cookie_header(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(domain) = &self.domain {
            out.push_str(&format!("; Domain={domain}"));
        }
        out.push_str(&format!("; Path={}", self.path.as_deref().unwrap_or("/")));
        if self.secure.unwrap_or(false) {
            out.push_str("; Secure");
        }
        if self.http_only.unwrap_or(false) {
            out.push_str("; HttpOnly");
        }
        out
    }
}

pub fn load_session_tokens(path: &Path) -> Result<Vec<SessionToken>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Like [`load_session_tokens`] but a missing file means "no stored session".
pub fn load_session_tokens_if_present(path: &Path) -> Result<Vec<SessionToken>> {
    if !path.exists() {
        debug!(path = %path.display(), "no stored session file");
        return Ok(Vec::new());
    }
    load_session_tokens(path)
}
