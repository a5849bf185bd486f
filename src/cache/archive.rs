//! Durable archive of CAS entries.
//!
//! Each entry is written as zstd-compressed JSON to a sharded directory.
//! Writes go to a temporary file that is renamed into place, so a reader
//! never sees a partially written entry.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::cache::entry::{ArchivedEntry, CacheEntry};
use crate::keys::TrivariateKey;

const ENTRY_EXTENSION: &str = "entry";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed archived entry {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Default, Clone)]
pub struct ArchiveStats {
    pub total_writes: u64,
    pub total_deletes: u64,
    pub total_bytes_written: u64,
}

/// On-disk entry archive.
pub struct EntryArchive {
    base: PathBuf,
    zstd_level: i32,
    stats: ArchiveStats,
}

impl EntryArchive {
    /// Open (and create if needed) an archive directory.
    pub async fn open(base: impl Into<PathBuf>, zstd_level: i32) -> Result<Self, ArchiveError> {
        let base = base.into();
        fs::create_dir_all(&base).await?;
        Ok(Self {
            base,
            zstd_level,
            stats: ArchiveStats::default(),
        })
    }

    /// Path of a key's file. The first byte of the content part picks the
    /// shard: `ab/abcd...-...-....entry`.
    fn entry_path(&self, key: &TrivariateKey) -> PathBuf {
        let shard = format!("{:02x}", key.content >> 56);
        self.base.join(shard).join(format!("{key}.{ENTRY_EXTENSION}"))
    }

    /// Write an entry, replacing any previous file for its key.
    pub async fn write(&mut self, entry: &CacheEntry) -> Result<PathBuf, ArchiveError> {
        let path = self.entry_path(&entry.key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec(&entry.to_archived())?;
        let data = zstd::encode_all(json.as_slice(), self.zstd_level)?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path).await?;

        debug!(key = %entry.key, path = %path.display(), size = data.len(), "Archived entry");

        self.stats.total_writes += 1;
        self.stats.total_bytes_written += data.len() as u64;
        Ok(path)
    }

    /// Delete a key's file if present.
    pub async fn delete(&mut self, key: &TrivariateKey) -> Result<(), ArchiveError> {
        let path = self.entry_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.stats.total_deletes += 1;
                debug!(key = %key, "Deleted archived entry");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one archived entry.
    pub async fn read(&self, key: &TrivariateKey) -> Result<Option<CacheEntry>, ArchiveError> {
        let path = self.entry_path(key);
        match fs::read(&path).await {
            Ok(data) => Ok(Some(decode_file(&path, &data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every archived entry. Unreadable files are skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<CacheEntry>, ArchiveError> {
        let mut loaded = Vec::new();
        let mut shards = fs::read_dir(&self.base).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                    continue;
                }
                let data = fs::read(&path).await?;
                match decode_file(&path, &data) {
                    Ok(entry) => loaded.push(entry),
                    Err(e) => warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable archived entry"
                    ),
                }
            }
        }
        info!(entries = loaded.len(), path = %self.base.display(), "Loaded entry archive");
        Ok(loaded)
    }

    pub fn stats(&self) -> &ArchiveStats {
        &self.stats
    }
}

fn decode_file(path: &Path, data: &[u8]) -> Result<CacheEntry, ArchiveError> {
    let json = zstd::decode_all(data)?;
    let archived: ArchivedEntry =
        serde_json::from_slice(&json).map_err(|source| ArchiveError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(archived.into())
}
