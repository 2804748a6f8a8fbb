//! Durable current-selection record
//!
//! A single key with a single writer (the state machine). Display layers
//! and the restarted control loop read it back.

use crate::store::StorageBackend;
use crate::RelayControlError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const SELECTION_KEY: &[u8] = b"selection/current";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedSelection {
    pub current_relay_id: Option<String>,
    pub manual_override: bool,
}

pub struct SelectionStore {
    backend: Arc<dyn StorageBackend>,
}

impl SelectionStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Read the last persisted selection; a missing or unreadable record
    /// falls back to the empty default.
    pub fn load(&self) -> Result<PersistedSelection, RelayControlError> {
        let raw = self
            .backend
            .get(SELECTION_KEY)
            .map_err(RelayControlError::Storage)?;
        match raw {
            None => Ok(PersistedSelection::default()),
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(record) => Ok(record),
                Err(e) => {
                    tracing::warn!(error = %e, "selection record unreadable, starting empty");
                    Ok(PersistedSelection::default())
                }
            },
        }
    }

    /// Durably record the current selection.
    pub fn save(&self, record: &PersistedSelection) -> Result<(), RelayControlError> {
        let bytes =
            serde_json::to_vec(record).map_err(|e| RelayControlError::Storage(e.to_string()))?;
        self.backend
            .put(SELECTION_KEY, &bytes)
            .map_err(RelayControlError::Storage)?;
        self.backend.flush().map_err(RelayControlError::Storage)
    }
}
