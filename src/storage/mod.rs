// Durable record storage
//
// Each engine record (voucher, balance, session) is stored as its own JSON
// file, so writes for unrelated subscribers never contend on a shared file.
// File names are the SHA-256 of the record key, which keeps arbitrary
// subscriber ids and voucher codes safe to use as paths.

pub mod fs;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{EngineError, EngineResult};

/// Current record format version
const RECORD_VERSION: &str = "1.0";

/// On-disk wrapper around a record
#[derive(Debug, Deserialize, Serialize)]
struct Envelope<T> {
    version: String,
    key: String,
    record: T,
}

#[derive(Debug, Clone)]
enum Backend {
    /// Nothing is persisted; state lives only in the owning component
    Memory,
    /// One JSON file per record in this directory
    Directory(PathBuf),
}

/// A keyed collection of persisted records of one kind
#[derive(Debug, Clone)]
pub struct RecordStore<T> {
    kind: &'static str,
    backend: Backend,
    _record: PhantomData<fn() -> T>,
}

impl<T> RecordStore<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Store that keeps nothing on disk
    pub fn in_memory(kind: &'static str) -> Self {
        Self {
            kind,
            backend: Backend::Memory,
            _record: PhantomData,
        }
    }

    /// Open (creating if needed) the `kind` subdirectory under `root`
    pub fn open(root: &Path, kind: &'static str) -> Result<Self> {
        let dir = root.join(kind);
        fs::ensure_directory_exists(&dir)
            .with_context(|| format!("Failed to open {} store", kind))?;

        Ok(Self {
            kind,
            backend: Backend::Directory(dir),
            _record: PhantomData,
        })
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.backend, Backend::Directory(_))
    }

    /// Durably write a record, replacing any previous version
    pub fn put(&self, key: &str, record: &T) -> EngineResult<()> {
        let Backend::Directory(dir) = &self.backend else {
            return Ok(());
        };

        let envelope = Envelope {
            version: RECORD_VERSION.to_string(),
            key: key.to_string(),
            record,
        };

        let content = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| EngineError::storage(format!("serializing {} '{}'", self.kind, key), e))?;

        fs::atomic_write(&record_path(dir, key), &content)
            .map_err(|e| EngineError::storage(format!("writing {} '{}'", self.kind, key), e))
    }

    /// Remove a record; removing a missing record is not an error
    pub fn remove(&self, key: &str) -> EngineResult<()> {
        let Backend::Directory(dir) = &self.backend else {
            return Ok(());
        };

        match std::fs::remove_file(record_path(dir, key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::storage(
                format!("removing {} '{}'", self.kind, key),
                e,
            )),
        }
    }

    /// Load every record of this kind
    ///
    /// Records written by an incompatible format version are skipped with a
    /// warning; unreadable records are an error.
    pub fn load_all(&self) -> Result<Vec<T>> {
        let Backend::Directory(dir) = &self.backend else {
            return Ok(Vec::new());
        };

        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read {} store: {}", self.kind, dir.display()))?;

        let mut records = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("Failed to list {} store", self.kind))?
                .path();

            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read record: {}", path.display()))?;

            let envelope: Envelope<T> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse record: {}", path.display()))?;

            if envelope.version != RECORD_VERSION {
                warn!(
                    "Skipping {} record '{}' with version {} (expected {})",
                    self.kind, envelope.key, envelope.version, RECORD_VERSION
                );
                continue;
            }

            records.push(envelope.record);
        }

        Ok(records)
    }
}

fn record_path(dir: &Path, key: &str) -> PathBuf {
    let digest = Sha256::digest(key.as_bytes());
    let name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    dir.join(format!("{}.json", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use predicates::prelude::*;

    #[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
    struct Note {
        id: String,
        body: String,
    }

    fn note(id: &str, body: &str) -> Note {
        Note {
            id: id.to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn put_and_load_roundtrip() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store: RecordStore<Note> = RecordStore::open(temp.path(), "notes").unwrap();

        store.put("a", &note("a", "first")).unwrap();
        store.put("b", &note("b", "second")).unwrap();
        store.put("a", &note("a", "updated")).unwrap();

        let mut loaded = store.load_all().unwrap();
        loaded.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(loaded, vec![note("a", "updated"), note("b", "second")]);
    }

    #[test]
    fn file_names_do_not_leak_keys() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store: RecordStore<Note> = RecordStore::open(temp.path(), "notes").unwrap();

        store.put("../../etc/passwd", &note("x", "y")).unwrap();

        let path = record_path(&temp.path().join("notes"), "../../etc/passwd");
        assert!(path.starts_with(temp.path()));
        temp.child("notes").assert(predicate::path::is_dir());
        assert!(path.is_file());
    }

    #[test]
    fn remove_is_idempotent() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store: RecordStore<Note> = RecordStore::open(temp.path(), "notes").unwrap();

        store.put("a", &note("a", "first")).unwrap();
        store.remove("a").unwrap();
        store.remove("a").unwrap();

        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn skips_foreign_versions() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store: RecordStore<Note> = RecordStore::open(temp.path(), "notes").unwrap();
        store.put("a", &note("a", "first")).unwrap();

        let old = serde_json::json!({
            "version": "0.1",
            "key": "old",
            "record": {"id": "old", "body": "legacy"}
        });
        std::fs::write(
            record_path(&temp.path().join("notes"), "old"),
            old.to_string(),
        )
        .unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, vec![note("a", "first")]);
    }

    #[test]
    fn write_failure_is_storage_unavailable() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store: RecordStore<Note> = RecordStore::open(temp.path(), "notes").unwrap();

        // Replace the store directory with a plain file
        std::fs::remove_dir_all(temp.path().join("notes")).unwrap();
        temp.child("notes").write_str("blocked").unwrap();

        let err = store.put("a", &note("a", "first")).unwrap_err();
        assert_eq!(err.category(), "storage_unavailable");
    }

    #[test]
    fn memory_store_keeps_nothing() {
        let store: RecordStore<Note> = RecordStore::in_memory("notes");
        store.put("a", &note("a", "first")).unwrap();
        assert!(!store.is_persistent());
        assert!(store.load_all().unwrap().is_empty());
    }
}
