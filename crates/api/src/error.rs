use storyledger_engine::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::Engine(e) => match e {
                EngineError::Validation(_)
                | EngineError::KindMismatch { .. }
                | EngineError::EntityDeleted(_) => 400,
                EngineError::EntityNotFound(_) | EngineError::ConflictNotFound(_) => 404,
                EngineError::ExternalConflict { .. } => 409,
                EngineError::Storage(_)
                | EngineError::Core(_)
                | EngineError::Config(_)
                | EngineError::VersionConflict { .. } => 500,
            },
        }
    }
}
