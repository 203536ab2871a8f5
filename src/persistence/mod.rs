//! Persistence layer modules.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::{GlobalConfig, Result};

pub mod schedule_repo;
pub mod store;
pub mod task_repo;
pub mod workload_repo;

pub use store::{DocumentStore, JsonFileStore, MemoryStore};

/// Shared handle to the document store.
pub type SharedStore = Arc<dyn DocumentStore>;

/// Open the document store for `config`: JSON files under the state
/// directory, or an in-memory store when `use_memory` is set.
#[must_use]
pub fn open(config: &GlobalConfig, use_memory: bool) -> SharedStore {
    if use_memory {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(JsonFileStore::new(config.documents_dir()))
    }
}

async fn load_typed<T: DeserializeOwned>(store: &dyn DocumentStore, collection: &str) -> Result<Vec<T>> {
    let docs = store.load_all(collection).await?;
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        match serde_json::from_value(doc) {
            Ok(item) => out.push(item),
            Err(err) => warn!(collection, %err, "skipping malformed document"),
        }
    }
    Ok(out)
}

async fn save_typed<T: Serialize + Sync>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    item: &T,
) -> Result<()> {
    let doc = serde_json::to_value(item)?;
    store.save(collection, id, doc).await
}
