//! Quarantine sink and input archival.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uaw_core::QuarantinedRecord;
use uuid::Uuid;

use crate::StorageError;

/// How a run's quarantine batch combines with an existing sink file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuarantineMode {
    #[default]
    Overwrite,
    /// Extend the existing array. Each input contributes at most once, keyed
    /// by its content digest.
    Append,
}

impl FromStr for QuarantineMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "append" => Ok(Self::Append),
            other => Err(format!("expected `overwrite` or `append`, got `{other}`")),
        }
    }
}

impl fmt::Display for QuarantineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Overwrite => "overwrite",
            Self::Append => "append",
        })
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct QuarantineSink {
    path: PathBuf,
    mode: QuarantineMode,
}

impl QuarantineSink {
    pub fn new(path: impl Into<PathBuf>, mode: QuarantineMode) -> Self {
        Self {
            path: path.into(),
            mode,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Digests of the inputs already appended, kept next to the sink file.
    pub fn ledger_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".sources");
        self.path.with_file_name(name)
    }

    /// Persist the batch quarantined from the input with `input_digest` as a
    /// pretty JSON array. An empty batch writes nothing. In append mode a
    /// source already recorded in the ledger is skipped, so re-reading an
    /// input that stayed in place never duplicates its records.
    pub async fn write(
        &self,
        records: &[QuarantinedRecord],
        input_digest: &str,
    ) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut sources = Vec::new();
        let mut entries: Vec<Value> = match self.mode {
            QuarantineMode::Overwrite => Vec::new(),
            QuarantineMode::Append => {
                sources = read_json_array::<String>(&self.ledger_path()).await?;
                if sources.iter().any(|seen| seen == input_digest) {
                    debug!(
                        path = %self.path.display(),
                        input_digest,
                        "input already quarantined; skipping append"
                    );
                    return Ok(0);
                }
                read_json_array(&self.path).await?
            }
        };
        let previous = entries.len();
        for record in records {
            let value = serde_json::to_value(record).map_err(|source| StorageError::Json {
                path: self.path.clone(),
                source,
            })?;
            entries.push(value);
        }

        let bytes = serde_json::to_vec_pretty(&entries).map_err(|source| StorageError::Json {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &bytes).await?;

        if self.mode == QuarantineMode::Append {
            sources.push(input_digest.to_string());
            let ledger = self.ledger_path();
            let bytes = serde_json::to_vec_pretty(&sources).map_err(|source| StorageError::Json {
                path: ledger.clone(),
                source,
            })?;
            write_atomic(&ledger, &bytes).await?;
        }

        debug!(
            path = %self.path.display(),
            written = records.len(),
            previous,
            "wrote quarantined records"
        );
        Ok(records.len())
    }
}

/// Read a JSON array file; a missing or blank file is an empty array.
async fn read_json_array<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Vec<T>, StorageError> {
    let exists = fs::try_exists(path)
        .await
        .map_err(|err| StorageError::io(path, err))?;
    if !exists {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path)
        .await
        .map_err(|err| StorageError::io(path, err))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&bytes).map_err(|source| StorageError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Write bytes through a temp file in the target directory and rename it into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|err| StorageError::io(&parent, err))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|err| StorageError::io(&temp_path, err))?;
    file.write_all(bytes)
        .await
        .map_err(|err| StorageError::io(&temp_path, err))?;
    file.flush()
        .await
        .map_err(|err| StorageError::io(&temp_path, err))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::io(path, err));
    }
    Ok(())
}

/// Side effect fired once the extracted batch is safely in staging.
#[async_trait]
pub trait ExtractionCommit: Send + Sync {
    /// Returns where the consumed input ended up.
    async fn commit(&self) -> Result<PathBuf, StorageError>;
}

pub fn archive_file_name(at: DateTime<Utc>) -> String {
    format!("{}_raw_logs", at.format("%Y%m%d_%H%M%S"))
}

/// Moves the consumed input file into the archive directory.
#[derive(Debug, Clone)]
pub struct ArchiveMover {
    source: PathBuf,
    archive_dir: PathBuf,
}

impl ArchiveMover {
    pub fn new(source: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            archive_dir: archive_dir.into(),
        }
    }

    async fn free_destination(&self, at: DateTime<Utc>) -> Result<PathBuf, StorageError> {
        let base = archive_file_name(at);
        let mut candidate = self.archive_dir.join(&base);
        let mut suffix = 1u32;
        while fs::try_exists(&candidate)
            .await
            .map_err(|err| StorageError::io(&candidate, err))?
        {
            candidate = self.archive_dir.join(format!("{base}_{suffix}"));
            suffix += 1;
        }
        Ok(candidate)
    }
}

#[async_trait]
impl ExtractionCommit for ArchiveMover {
    async fn commit(&self) -> Result<PathBuf, StorageError> {
        fs::create_dir_all(&self.archive_dir)
            .await
            .map_err(|err| StorageError::io(&self.archive_dir, err))?;
        let dest = self.free_destination(Utc::now()).await?;

        if let Err(rename_err) = fs::rename(&self.source, &dest).await {
            // rename cannot cross filesystems; fall back to copy + remove
            warn!(error = %rename_err, "rename into archive failed, copying instead");
            fs::copy(&self.source, &dest)
                .await
                .map_err(|err| StorageError::io(&self.source, err))?;
            fs::remove_file(&self.source)
                .await
                .map_err(|err| StorageError::io(&self.source, err))?;
        }

        info!(from = %self.source.display(), to = %dest.display(), "input file archived");
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use uaw_core::{QuarantineReason, RawRecord};

    fn quarantined(user: &str) -> QuarantinedRecord {
        QuarantinedRecord::new(
            RawRecord::new(json!({ "user_id": user })),
            QuarantineReason::MissingIdentity,
        )
    }

    #[test]
    fn archive_names_follow_timestamp_pattern() {
        let at = DateTime::parse_from_rfc3339("2026-02-24T12:03:04Z")
            .expect("ts")
            .with_timezone(&Utc);
        assert_eq!(archive_file_name(at), "20260224_120304_raw_logs");
    }

    #[tokio::test]
    async fn overwrite_mode_replaces_previous_batch() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("errors").join("bad.json");
        let sink = QuarantineSink::new(&path, QuarantineMode::Overwrite);

        sink.write(&[quarantined("a"), quarantined("b")], "first").await.unwrap();
        sink.write(&[quarantined("c")], "second").await.unwrap();

        let stored: Vec<Value> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["user_id"], "c");
    }

    #[tokio::test]
    async fn append_mode_extends_previous_batch() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        let sink = QuarantineSink::new(&path, QuarantineMode::Append);

        sink.write(&[quarantined("a")], "first").await.unwrap();
        sink.write(&[quarantined("b")], "second").await.unwrap();

        let stored: Vec<Value> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1]["error_reason"], "Missing user_id or action_type");
    }

    #[tokio::test]
    async fn append_mode_writes_each_input_once() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        let sink = QuarantineSink::new(&path, QuarantineMode::Append);
        let digest = sha256_hex(b"[{\"user_id\": \"a\"}]");

        assert_eq!(sink.write(&[quarantined("a")], &digest).await.unwrap(), 1);
        assert_eq!(sink.write(&[quarantined("a")], &digest).await.unwrap(), 0);
        assert_eq!(sink.write(&[quarantined("a")], &digest).await.unwrap(), 0);

        let stored: Vec<Value> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(stored.len(), 1);
        let ledger: Vec<String> =
            serde_json::from_slice(&std::fs::read(sink.ledger_path()).unwrap()).unwrap();
        assert_eq!(ledger, vec![digest]);
    }

    #[test]
    fn content_digest_is_stable_hex() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_ne!(sha256_hex(b"[]"), sha256_hex(b"[ ]"));
    }

    #[test]
    fn quarantine_mode_parses_case_insensitively() {
        assert_eq!("Append".parse::<QuarantineMode>(), Ok(QuarantineMode::Append));
        assert_eq!(" overwrite ".parse::<QuarantineMode>(), Ok(QuarantineMode::Overwrite));
        assert!("rotate".parse::<QuarantineMode>().is_err());
    }

    #[tokio::test]
    async fn empty_batch_does_not_create_sink() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        let written = QuarantineSink::new(&path, QuarantineMode::Overwrite)
            .write(&[], "empty")
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn archive_moves_input_and_avoids_collisions() {
        let dir = tempdir().expect("tempdir");
        let archive = dir.path().join("processed");
        let input = dir.path().join("raw.json");

        std::fs::write(&input, b"[]").unwrap();
        let mover = ArchiveMover::new(&input, &archive);
        let first = mover.commit().await.unwrap();
        assert!(!input.exists());
        assert!(first.exists());

        std::fs::write(&input, b"[1]").unwrap();
        let second = mover.commit().await.unwrap();
        assert_ne!(first, second);
        assert!(second.exists());
    }
}
