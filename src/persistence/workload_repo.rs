//! Repository for per-agent workload aggregates.

use crate::models::workload::AgentWorkload;
use crate::Result;

use super::{load_typed, save_typed, SharedStore};

const WORKLOADS: &str = "workloads";

/// Typed access to the `workloads` collection.
#[derive(Clone)]
pub struct WorkloadRepo {
    store: SharedStore,
}

impl WorkloadRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Load every workload record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the collection cannot be read.
    pub async fn load_all(&self) -> Result<Vec<AgentWorkload>> {
        load_typed(self.store.as_ref(), WORKLOADS).await
    }

    /// Persist a workload record, keyed by session name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the write fails or the session name is
    /// not a valid document key.
    pub async fn save(&self, workload: &AgentWorkload) -> Result<()> {
        save_typed(
            self.store.as_ref(),
            WORKLOADS,
            &workload.session_name,
            workload,
        )
        .await
    }
}
