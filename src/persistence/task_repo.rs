//! Repository for queued tasks.

use crate::models::task::Task;
use crate::Result;

use super::{load_typed, save_typed, SharedStore};

const TASKS: &str = "tasks";

/// Typed access to the `tasks` collection.
#[derive(Clone)]
pub struct TaskRepo {
    store: SharedStore,
}

impl TaskRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Load every task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the collection cannot be read.
    pub async fn load_all(&self) -> Result<Vec<Task>> {
        load_typed(self.store.as_ref(), TASKS).await
    }

    /// Persist the whole task document.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the write fails.
    pub async fn save(&self, task: &Task) -> Result<()> {
        save_typed(self.store.as_ref(), TASKS, &task.id, task).await
    }
}
