//! Repository for scheduled checks and messages.

use crate::models::schedule::{ScheduledCheck, ScheduledMessage};
use crate::Result;

use super::{load_typed, save_typed, SharedStore};

const CHECKS: &str = "checks";
const MESSAGES: &str = "messages";

/// Typed access to the `checks` and `messages` collections.
#[derive(Clone)]
pub struct ScheduleRepo {
    store: SharedStore,
}

impl ScheduleRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Load every recurring check.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the collection cannot be read.
    pub async fn load_checks(&self) -> Result<Vec<ScheduledCheck>> {
        load_typed(self.store.as_ref(), CHECKS).await
    }

    /// Load every one-shot message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the collection cannot be read.
    pub async fn load_messages(&self) -> Result<Vec<ScheduledMessage>> {
        load_typed(self.store.as_ref(), MESSAGES).await
    }

    /// Persist a check.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the write fails.
    pub async fn save_check(&self, check: &ScheduledCheck) -> Result<()> {
        save_typed(self.store.as_ref(), CHECKS, &check.id, check).await
    }

    /// Persist a message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the write fails.
    pub async fn save_message(&self, message: &ScheduledMessage) -> Result<()> {
        save_typed(self.store.as_ref(), MESSAGES, &message.id, message).await
    }

    /// Delete a check by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the delete fails.
    pub async fn delete_check(&self, id: &str) -> Result<bool> {
        self.store.delete(CHECKS, id).await
    }

    /// Delete a message by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the delete fails.
    pub async fn delete_message(&self, id: &str) -> Result<bool> {
        self.store.delete(MESSAGES, id).await
    }
}
