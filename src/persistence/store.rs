//! Whole-document storage keyed by collection and id.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;

use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::{AppError, Result};

/// Boxed future returned by [`DocumentStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage collaborator for JSON documents.
///
/// Each `save` replaces the whole document atomically; readers never see a
/// partially written document.
pub trait DocumentStore: Send + Sync {
    /// Load every document in `collection`.
    fn load_all<'a>(&'a self, collection: &'a str) -> StoreFuture<'a, Vec<Value>>;

    /// Create or replace one document.
    fn save<'a>(&'a self, collection: &'a str, id: &'a str, doc: Value) -> StoreFuture<'a, ()>;

    /// Remove one document. Returns whether it existed.
    fn delete<'a>(&'a self, collection: &'a str, id: &'a str) -> StoreFuture<'a, bool>;
}

fn check_key(kind: &str, key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(AppError::Store(format!("invalid {kind} key: {key:?}")))
    }
}

/// Documents stored as `<root>/<collection>/<id>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Store rooted at `root`. The directory is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> Result<PathBuf> {
        check_key("collection", collection)?;
        Ok(self.root.join(collection))
    }
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|err| AppError::Store(format!("failed to create {}: {err}", dir.display())))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|err| AppError::Store(format!("failed to create temp file: {err}")))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|err| AppError::Store(format!("failed to write document: {err}")))?;
    tmp.persist(path)
        .map_err(|err| AppError::Store(format!("failed to persist {}: {}", path.display(), err.error)))?;
    Ok(())
}

fn read_collection(dir: &Path) -> Result<Vec<Value>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(AppError::Store(format!(
                "failed to list {}: {err}",
                dir.display()
            )))
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut docs = Vec::with_capacity(paths.len());
    for path in paths {
        let parsed = std::fs::read(&path)
            .map_err(AppError::from)
            .and_then(|raw| serde_json::from_slice::<Value>(&raw).map_err(AppError::from));
        match parsed {
            Ok(doc) => docs.push(doc),
            Err(err) => warn!(path = %path.display(), %err, "skipping unreadable document"),
        }
    }
    Ok(docs)
}

impl DocumentStore for JsonFileStore {
    fn load_all<'a>(&'a self, collection: &'a str) -> StoreFuture<'a, Vec<Value>> {
        Box::pin(async move {
            let dir = self.collection_dir(collection)?;
            tokio::task::spawn_blocking(move || read_collection(&dir))
                .await
                .map_err(|err| AppError::Store(format!("load task failed: {err}")))?
        })
    }

    fn save<'a>(&'a self, collection: &'a str, id: &'a str, doc: Value) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let dir = self.collection_dir(collection)?;
            check_key("document", id)?;
            let path = dir.join(format!("{id}.json"));
            let bytes = serde_json::to_vec_pretty(&doc)?;
            tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &bytes))
                .await
                .map_err(|err| AppError::Store(format!("save task failed: {err}")))?
        })
    }

    fn delete<'a>(&'a self, collection: &'a str, id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let dir = self.collection_dir(collection)?;
            check_key("document", id)?;
            match tokio::fs::remove_file(dir.join(format!("{id}.json"))).await {
                Ok(()) => Ok(true),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(err) => Err(AppError::Store(format!("failed to delete {id}: {err}"))),
            }
        })
    }
}

/// In-process store used for ephemeral runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut HashMap<String, BTreeMap<String, Value>>) -> T) -> T {
        let mut guard = self
            .collections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }
}

impl DocumentStore for MemoryStore {
    fn load_all<'a>(&'a self, collection: &'a str) -> StoreFuture<'a, Vec<Value>> {
        let docs = self.with(|c| {
            c.get(collection)
                .map(|docs| docs.values().cloned().collect())
                .unwrap_or_default()
        });
        Box::pin(async move { Ok(docs) })
    }

    fn save<'a>(&'a self, collection: &'a str, id: &'a str, doc: Value) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            check_key("collection", collection)?;
            check_key("document", id)?;
            self.with(|c| {
                c.entry(collection.to_owned())
                    .or_default()
                    .insert(id.to_owned(), doc);
            });
            Ok(())
        })
    }

    fn delete<'a>(&'a self, collection: &'a str, id: &'a str) -> StoreFuture<'a, bool> {
        let existed = self.with(|c| {
            c.get_mut(collection)
                .is_some_and(|docs| docs.remove(id).is_some())
        });
        Box::pin(async move { Ok(existed) })
    }
}
