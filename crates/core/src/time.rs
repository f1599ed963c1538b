use std::time::{SystemTime, UNIX_EPOCH};

use crate::CoreError;

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_ms() -> Result<i64, CoreError> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| CoreError::InvalidData("system clock before epoch".into()))?;
    i64::try_from(elapsed.as_millis())
        .map_err(|_| CoreError::Serialization("clock millis do not fit in i64".into()))
}
