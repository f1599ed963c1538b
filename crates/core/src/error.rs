use thiserror::Error;

use crate::registry::EntityKind;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unstable primary key for {kind}: {reason}")]
    UnstableKey { kind: EntityKind, reason: &'static str },

    #[error("entity kind already registered: {0}")]
    DuplicateKind(EntityKind),

    #[error("entity kind not registered: {0}")]
    UnknownKind(EntityKind),

    #[error("invalid descriptor for {kind}: {reason}")]
    InvalidDescriptor { kind: EntityKind, reason: String },

    #[error("invalid data: {0}")]
    InvalidData(String),
}
