//! Tracing subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{PenumbraError, Result};

/// Installs a global fmt subscriber filtered by `level` (an `EnvFilter` directive).
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| PenumbraError::Config(format!("Invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| PenumbraError::Config("Logging already initialized".into()))
}
