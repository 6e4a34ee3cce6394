// GateCrash Forms - Response Store
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Append-only persistence of accepted submissions, keyed by form.
// Artifacts: <dir>/<key>.json (pretty array) and/or <dir>/<key>.csv.
//
// CONCURRENCY CONTRACT: every write to a key runs under an in-process
// mutex for that key AND an fs2 advisory lock on <dir>/<key>.lock, so the
// JSON read-modify-write never loses a concurrent append.

use crate::csv;
use crate::submission::{FieldValue, ResponseMetadata, StoredResponse};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

const MAX_KEY_LEN: usize = 255;
const MULTI_VALUE_SEP: &str = "; ";
const EXPORT_DIR: &str = "exports";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored responses at {path:?} are corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),

    #[error("no responses to export for {0}")]
    NothingToExport(String),
}

/// Artifact format, picked from the declared storage path's extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFormat {
    Json,
    Csv,
}

impl StorageFormat {
    pub fn from_path(path: &str) -> Option<Self> {
        let ext = Path::new(path).extension()?.to_string_lossy().to_lowercase();
        match ext.as_str() {
            "json" => Some(StorageFormat::Json),
            "csv" => Some(StorageFormat::Csv),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            StorageFormat::Json => "json",
            StorageFormat::Csv => "csv",
        }
    }
}

/// Result of one append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
    pub path: PathBuf,
    /// Responses (JSON) or data rows (CSV) now in the artifact
    pub count: usize,
    /// CSV only: data keys with no column in the fixed header
    pub dropped_columns: Vec<String>,
}

/// Strip path-traversal risk from a name.
///
/// Characters outside `[A-Za-z0-9_.-]` become `_`, runs of dots collapse to
/// one, result truncated to 255 chars. Idempotent.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '_' };
        if c == '.' && out.ends_with('.') {
            continue;
        }
        out.push(c);
    }
    out.truncate(MAX_KEY_LEN);
    out
}

/// File-backed response store rooted at one directory
pub struct ResponseStore {
    dir: PathBuf,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ResponseStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Artifact path for a key. The key is sanitized here, always.
    pub fn path_for(&self, form_key: &str, format: StorageFormat) -> Result<PathBuf, StoreError> {
        let key = checked_key(form_key)?;
        Ok(self.dir.join(format!("{}.{}", key, format.extension())))
    }

    // ========================================================================
    // LOCKING
    // ========================================================================

    /// Run `f` holding the per-key process mutex and the cross-process file lock
    fn with_key_lock<R>(
        &self,
        key: &str,
        f: impl FnOnce() -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let key_lock = Arc::clone(
            self.key_locks
                .lock()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        let _guard = key_lock.lock();

        std::fs::create_dir_all(&self.dir)?;
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(format!("{}.lock", key)))?;
        lock_file.lock_exclusive()?;

        let result = f();
        let _ = FileExt::unlock(&lock_file);
        result
    }

    // ========================================================================
    // APPEND
    // ========================================================================

    /// Append one response. Appends to the same key are serialized.
    pub fn append(
        &self,
        form_key: &str,
        format: StorageFormat,
        response: &StoredResponse,
    ) -> Result<StoreOutcome, StoreError> {
        let key = checked_key(form_key)?;
        let path = self.path_for(&key, format)?;

        let outcome = self.with_key_lock(&key, || match format {
            StorageFormat::Json => self.append_json(&path, response),
            StorageFormat::Csv => self.append_csv(&path, response),
        })?;

        log::debug!("Stored response for '{}' at {:?} (count {})", key, outcome.path, outcome.count);
        Ok(outcome)
    }

    fn append_json(&self, path: &Path, response: &StoredResponse) -> Result<StoreOutcome, StoreError> {
        // Foreign entries are carried through untouched
        let mut entries: Vec<Value> = read_json_array(path)?.unwrap_or_default();
        entries.push(serde_json::to_value(response)?);

        write_atomic(path, serde_json::to_string_pretty(&entries)?.as_bytes())?;

        Ok(StoreOutcome {
            path: path.to_path_buf(),
            count: entries.len(),
            dropped_columns: Vec::new(),
        })
    }

    fn append_csv(&self, path: &Path, response: &StoredResponse) -> Result<StoreOutcome, StoreError> {
        let existing = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut records = csv::parse_records(&existing);
        let header_written = !records.is_empty();
        let header: Vec<String> = if header_written {
            records.remove(0)
        } else {
            std::iter::once("timestamp".to_string())
                .chain(response.data.keys().cloned())
                .collect()
        };

        // Header is fixed at first write; late keys are reported, never misaligned
        let dropped_columns: Vec<String> = response
            .data
            .keys()
            .filter(|k| !header.iter().any(|h| h == *k))
            .cloned()
            .collect();
        if !dropped_columns.is_empty() {
            log::warn!(
                "CSV header for {:?} has no column for {:?}; values not written (export from JSON widens the header)",
                path,
                dropped_columns
            );
        }

        let row = row_for(&header, &response.timestamp_string(), &response.data);

        let mut out = String::new();
        if !header_written {
            out.push_str(&csv::join_record(&header));
            out.push('\n');
        } else if !existing.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&csv::join_record(&row));
        out.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(out.as_bytes())?;
        file.sync_data()?;

        Ok(StoreOutcome {
            path: path.to_path_buf(),
            count: records.len() + 1,
            dropped_columns,
        })
    }

    // ========================================================================
    // READ
    // ========================================================================

    /// All stored responses for a key, in append order, read from the
    /// artifact of the given format. A missing artifact reads as empty.
    pub fn list(&self, form_key: &str, format: StorageFormat) -> Result<Vec<StoredResponse>, StoreError> {
        let key = checked_key(form_key)?;
        let path = self.path_for(&key, format)?;
        read_artifact(&key, &path, format)
    }

    pub fn count(&self, form_key: &str, format: StorageFormat) -> Result<usize, StoreError> {
        Ok(self.list(form_key, format)?.len())
    }

    // ========================================================================
    // EXPORT / PURGE
    // ========================================================================

    /// Export destination: <dir>/exports/<key>.<ext>. Never a live artifact.
    pub fn export_path(&self, form_key: &str, format: StorageFormat) -> Result<PathBuf, StoreError> {
        let key = checked_key(form_key)?;
        Ok(self.dir.join(EXPORT_DIR).join(format!("{}.{}", key, format.extension())))
    }

    /// Write every response stored in the `source` artifact to the export
    /// directory in the `target` format.
    ///
    /// CSV export discovers columns across ALL responses (first-seen order),
    /// unlike incremental CSV append whose header is fixed at first write.
    pub fn export(
        &self,
        form_key: &str,
        source: StorageFormat,
        target: StorageFormat,
    ) -> Result<PathBuf, StoreError> {
        let key = checked_key(form_key)?;
        let source_path = self.path_for(&key, source)?;
        let target_path = self.export_path(&key, target)?;

        self.with_key_lock(&key, || {
            let responses = read_artifact(&key, &source_path, source)?;
            if responses.is_empty() {
                return Err(StoreError::NothingToExport(key.clone()));
            }

            let content = match target {
                StorageFormat::Csv => export_csv(&responses),
                StorageFormat::Json => serde_json::to_string_pretty(&responses)?,
            };
            if let Some(parent) = target_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            write_atomic(&target_path, content.as_bytes())?;

            log::info!("Exported {} responses for '{}' to {:?}", responses.len(), key, target_path);
            Ok(target_path.clone())
        })
    }

    /// Delete every artifact and export for a key. Returns how many were
    /// removed. The `<key>.lock` file stays so lock holders never diverge.
    pub fn purge(&self, form_key: &str) -> Result<usize, StoreError> {
        let key = checked_key(form_key)?;

        let removed = self.with_key_lock(&key, || {
            let mut removed = 0;
            for format in [StorageFormat::Json, StorageFormat::Csv] {
                for path in [self.path_for(&key, format)?, self.export_path(&key, format)?] {
                    match std::fs::remove_file(&path) {
                        Ok(()) => removed += 1,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Ok(removed)
        })?;

        log::info!("Purged {} artifacts for '{}'", removed, key);
        Ok(removed)
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn checked_key(form_key: &str) -> Result<String, StoreError> {
    let key = sanitize_filename(form_key);
    if key.is_empty() || key.chars().all(|c| c == '.') {
        return Err(StoreError::InvalidKey(form_key.to_string()));
    }
    Ok(key)
}

/// Parse one artifact. A missing file reads as empty.
fn read_artifact(key: &str, path: &Path, format: StorageFormat) -> Result<Vec<StoredResponse>, StoreError> {
    match format {
        StorageFormat::Json => read_json_array(path)?
            .unwrap_or_default()
            .into_iter()
            .map(|v| {
                serde_json::from_value(v).map_err(|source| StoreError::Corrupt {
                    path: path.to_path_buf(),
                    source,
                })
            })
            .collect(),
        StorageFormat::Csv => match std::fs::read_to_string(path) {
            Ok(text) => Ok(responses_from_csv(key, &text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        },
    }
}

/// None when the artifact does not exist yet; empty file reads as empty
fn read_json_array(path: &Path) -> Result<Option<Vec<Value>>, StoreError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if content.trim().is_empty() {
        return Ok(Some(Vec::new()));
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Write to a sibling temp file then rename into place
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn row_for(header: &[String], timestamp: &str, data: &IndexMap<String, FieldValue>) -> Vec<String> {
    header
        .iter()
        .map(|column| {
            if column == "timestamp" {
                timestamp.to_string()
            } else {
                data.get(column).map(|v| v.join(MULTI_VALUE_SEP)).unwrap_or_default()
            }
        })
        .collect()
}

fn export_csv(responses: &[StoredResponse]) -> String {
    let mut columns: IndexSet<String> = IndexSet::new();
    columns.insert("timestamp".to_string());
    for response in responses {
        columns.extend(response.data.keys().cloned());
    }
    let header: Vec<String> = columns.into_iter().collect();

    let mut out = csv::join_record(&header);
    out.push('\n');
    for response in responses {
        out.push_str(&csv::join_record(&row_for(&header, &response.timestamp_string(), &response.data)));
        out.push('\n');
    }
    out
}

fn responses_from_csv(key: &str, text: &str) -> Vec<StoredResponse> {
    let mut records = csv::parse_records(text).into_iter();
    let Some(header) = records.next() else {
        return Vec::new();
    };

    records
        .map(|record| {
            let mut timestamp: Option<DateTime<Utc>> = None;
            let mut data = IndexMap::new();
            for (column, value) in header.iter().zip(record) {
                if column == "timestamp" {
                    timestamp = DateTime::parse_from_rfc3339(&value)
                        .ok()
                        .map(|t| t.with_timezone(&Utc));
                } else {
                    data.insert(column.clone(), FieldValue::Single(value));
                }
            }
            StoredResponse {
                timestamp: timestamp.unwrap_or_default(),
                form_id: key.to_string(),
                form_title: None,
                data,
                metadata: ResponseMetadata::default(),
            }
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
