//! Error types for Offmap core

use offmap_types::DownloadState;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in Offmap core
#[derive(Debug, Error)]
pub enum OffmapError {
    #[error("Region {0} was already cancelled")]
    AlreadyCancelled(Uuid),

    #[error("Region {0} is being cancelled")]
    CancelInProgress(Uuid),

    #[error("Cannot {command} region {id} while it is {state}")]
    InvalidTransition {
        id: Uuid,
        state: DownloadState,
        command: &'static str,
    },

    #[error("Region {0} is not registered with the controller")]
    NotRegistered(Uuid),

    #[error("Region not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    #[error("Cancellation failed: {0}")]
    Cancellation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl OffmapError {
    /// Whether this error reports a lifecycle command the caller should not have issued
    pub fn is_lifecycle_violation(&self) -> bool {
        matches!(
            self,
            OffmapError::AlreadyCancelled(_)
                | OffmapError::CancelInProgress(_)
                | OffmapError::InvalidTransition { .. }
                | OffmapError::NotRegistered(_)
        )
    }
}

impl From<serde_json::Error> for OffmapError {
    fn from(error: serde_json::Error) -> Self {
        OffmapError::Serialization(error.to_string())
    }
}
