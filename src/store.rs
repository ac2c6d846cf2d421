use crate::models::{ProductKey, ProductRecord};
use std::{
    collections::HashMap,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unable to read catalogue {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("catalogue {path} is not valid JSON: {source}")]
    Decode {
        path: String,
        source: serde_json::Error,
    },
    #[error("unable to write catalogue {path}: {message}")]
    Write { path: String, message: String },
}

/// The persisted catalogue: one JSON array rewritten as a whole on save.
///
/// Callers must ensure a single writer per file; the orchestrator's run lock
/// covers this within one process.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    path: PathBuf,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current catalogue, empty on first run. Repeated keys left behind by
    /// older writers collapse to their latest entry.
    pub async fn load(&self) -> Result<Vec<ProductRecord>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(target = "catalog.store", path = %self.path.display(), "no catalogue yet");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.display_path(),
                    source,
                });
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let records: Vec<ProductRecord> =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
                path: self.display_path(),
                source,
            })?;
        Ok(merge(Vec::new(), records))
    }

    /// Folds `updates` into the stored catalogue and writes it back. Returns
    /// the number of distinct records written.
    pub async fn merge_and_save(&self, updates: Vec<ProductRecord>) -> Result<usize, StoreError> {
        if updates.is_empty() {
            debug!(target = "catalog.store", "nothing to merge; catalogue left untouched");
            return Ok(0);
        }
        let existing = self.load().await?;
        let before = existing.len();
        let written = merge(Vec::new(), updates);
        let count = written.len();
        let merged = merge(existing, written);
        self.save(merged.clone()).await?;
        info!(
            target = "catalog.store",
            path = %self.path.display(),
            written = count,
            added = merged.len() - before,
            total = merged.len(),
            "catalogue saved"
        );
        Ok(count)
    }

    /// Atomic replace: the new document is written to a sibling temp file and
    /// renamed over the target, so readers see either the old or new file.
    pub async fn save(&self, records: Vec<ProductRecord>) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &records))
            .await
            .map_err(|err| StoreError::Write {
                path: self.display_path(),
                message: err.to_string(),
            })?
            .map_err(|message| StoreError::Write {
                path: self.display_path(),
                message,
            })
    }

    fn display_path(&self) -> String {
        self.path.display().to_string()
    }
}

/// Replaces records with a matching key in place and appends the rest in
/// order. The result holds at most one record per key.
pub fn merge(existing: Vec<ProductRecord>, updates: Vec<ProductRecord>) -> Vec<ProductRecord> {
    let mut merged: Vec<ProductRecord> = Vec::with_capacity(existing.len() + updates.len());
    let mut positions: HashMap<ProductKey, usize> = HashMap::new();
    for record in existing.into_iter().chain(updates) {
        let key = record.key();
        match positions.get(&key) {
            Some(&idx) => merged[idx] = record,
            None => {
                positions.insert(key, merged.len());
                merged.push(record);
            }
        }
    }
    merged
}

fn write_atomic(path: &Path, records: &[ProductRecord]) -> Result<(), String> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|err| err.to_string())?;

    let tmp = NamedTempFile::new_in(&dir).map_err(|err| err.to_string())?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, records).map_err(|err| err.to_string())?;
        writer.flush().map_err(|err| err.to_string())?;
    }
    tmp.as_file().sync_all().map_err(|err| err.to_string())?;
    tmp.persist(path).map_err(|err| err.error.to_string())?;
    Ok(())
}
