mod shared;
mod store;

pub use shared::SharedDatabase;
pub use store::TestStore;

use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once; `RUST_LOG` overrides the default level.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_test_writer()
        .try_init();
}
