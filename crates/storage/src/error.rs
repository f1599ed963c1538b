use storyledger_core::{EntityId, EntityKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("entity collision: {entity_id}")]
    EntityCollision { entity_id: String },

    #[error("{kind} {entity_id} already has a snapshot at version {version}")]
    VersionConflict {
        kind: EntityKind,
        entity_id: EntityId,
        version: u64,
    },

    #[error("core error: {0}")]
    Core(#[from] storyledger_core::CoreError),
}
