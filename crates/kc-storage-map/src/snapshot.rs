//! Snapshot export and import of concurrent-map containers.
//!
//! A snapshot is either one JSON array (`json`) or one entity per line
//! (`jsonl`). The format comes from an explicit preference when given, else
//! from the file extension, else defaults to `json`.
//!
//! File access is blocking; call from a blocking context.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use kc_model::SearchableEntity;
use kc_storage::{StorageError, StorageResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::chm::ConcurrentHashMapStorage;

/// Snapshot file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotFormat {
    /// One JSON array.
    #[default]
    Json,
    /// One JSON document per line.
    JsonLines,
}

impl SnapshotFormat {
    /// Format implied by a file extension.
    #[must_use]
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "jsonl" | "ndjson" => Some(Self::JsonLines),
            _ => None,
        }
    }

    /// Picks the format for `path`. An explicit preference always wins over
    /// the extension.
    #[must_use]
    pub fn resolve(preferred: Option<Self>, path: &Path) -> Self {
        if let (Some(preferred), Some(derived)) = (preferred, Self::from_extension(path)) {
            if preferred != derived {
                tracing::debug!(
                    path = %path.display(),
                    %preferred,
                    %derived,
                    "Preferred snapshot format overrides file extension"
                );
            }
        }
        preferred
            .or_else(|| Self::from_extension(path))
            .unwrap_or_default()
    }
}

impl fmt::Display for SnapshotFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::JsonLines => "jsonl",
        })
    }
}

impl FromStr for SnapshotFormat {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "jsonl" | "ndjson" => Ok(Self::JsonLines),
            other => Err(StorageError::InvalidData(format!("unknown snapshot format: {other}"))),
        }
    }
}

fn io_error(path: &Path, err: &std::io::Error) -> StorageError {
    StorageError::Internal(format!("{}: {err}", path.display()))
}

fn json_error(err: &serde_json::Error) -> StorageError {
    StorageError::Serialization(err.to_string())
}

/// Writes every entity of `storage` to `path`, sorted by id. Returns the
/// number written.
///
/// ## Errors
///
/// Returns an error if the file cannot be written or an entity fails to
/// serialize.
pub fn export<E>(
    storage: &ConcurrentHashMapStorage<E>,
    path: &Path,
    preferred: Option<SnapshotFormat>,
) -> StorageResult<usize>
where
    E: SearchableEntity + Serialize,
{
    let format = SnapshotFormat::resolve(preferred, path);
    let mut entities = storage.entities();
    entities.sort_by(|a, b| a.id().cmp(&b.id()));

    let file = File::create(path).map_err(|e| io_error(path, &e))?;
    let mut writer = BufWriter::new(file);
    match format {
        SnapshotFormat::Json => {
            serde_json::to_writer_pretty(&mut writer, &entities).map_err(|e| json_error(&e))?;
        }
        SnapshotFormat::JsonLines => {
            for entity in &entities {
                serde_json::to_writer(&mut writer, entity).map_err(|e| json_error(&e))?;
                writer.write_all(b"\n").map_err(|e| io_error(path, &e))?;
            }
        }
    }
    writer.flush().map_err(|e| io_error(path, &e))?;

    tracing::info!(
        entity_type = %E::ENTITY_TYPE,
        path = %path.display(),
        %format,
        count = entities.len(),
        "Exported snapshot"
    );
    Ok(entities.len())
}

/// Loads the entities in `path` into `storage`. Returns the number loaded.
///
/// ## Errors
///
/// Returns an error if the file cannot be read or parsed, or an id is
/// already stored.
pub fn import<E>(
    storage: &ConcurrentHashMapStorage<E>,
    path: &Path,
    preferred: Option<SnapshotFormat>,
) -> StorageResult<usize>
where
    E: SearchableEntity + DeserializeOwned,
{
    let format = SnapshotFormat::resolve(preferred, path);
    let file = File::open(path).map_err(|e| io_error(path, &e))?;
    let reader = BufReader::new(file);

    let entities: Vec<E> = match format {
        SnapshotFormat::Json => serde_json::from_reader(reader).map_err(|e| json_error(&e))?,
        SnapshotFormat::JsonLines => {
            let mut entities = Vec::new();
            for line in reader.lines() {
                let line = line.map_err(|e| io_error(path, &e))?;
                if line.trim().is_empty() {
                    continue;
                }
                entities.push(serde_json::from_str(&line).map_err(|e| json_error(&e))?);
            }
            entities
        }
    };

    let loaded = storage.load(entities)?;
    tracing::info!(
        entity_type = %E::ENTITY_TYPE,
        path = %path.display(),
        %format,
        count = loaded,
        "Imported snapshot"
    );
    Ok(loaded)
}
