use storyledger_core::{CoreError, EntityId, EntityKind};
use storyledger_storage::StorageError;
use thiserror::Error;

use crate::conflicts::ConflictSummary;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error("entity already deleted: {0}")]
    EntityDeleted(String),

    #[error("{entity_id} is a {actual}, not a {expected}")]
    KindMismatch {
        entity_id: EntityId,
        expected: EntityKind,
        actual: EntityKind,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} {entity_id}: version counter raced {attempts} times")]
    VersionConflict {
        kind: EntityKind,
        entity_id: EntityId,
        attempts: u32,
    },

    #[error("submission conflicts with {} local change(s)", conflicts.len())]
    ExternalConflict { conflicts: Vec<ConflictSummary> },

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),
}

impl EngineError {
    /// Validation failures raised by descriptor checks.
    pub(crate) fn invalid(err: CoreError) -> Self {
        match err {
            CoreError::InvalidData(msg) => EngineError::Validation(msg),
            other => EngineError::Core(other),
        }
    }
}
