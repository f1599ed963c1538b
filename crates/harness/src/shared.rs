use std::io;

use storyledger_engine::{Engine, EngineConfig, EngineError};
use tempfile::TempDir;

use crate::TestStore;

/// An on-disk database that several engines open, each with its own connection.
pub struct SharedDatabase {
    _dir: TempDir,
    config: EngineConfig,
}

impl SharedDatabase {
    pub fn new() -> io::Result<Self> {
        crate::init_logging();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("storyledger.db");
        let config = EngineConfig::default().with_database_path(path.to_string_lossy());
        Ok(Self { _dir: dir, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn open(&self) -> Result<TestStore, EngineError> {
        Ok(TestStore::with_engine(Engine::open(self.config.clone())?))
    }
}
