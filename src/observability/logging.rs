//! Logging initialisation built on `tracing-subscriber`.
//!
//! Level filtering honours `RUST_LOG` when set, falling back to the
//! configured level. Output is plain text or structured JSON.

use tracing_subscriber::EnvFilter;

use crate::utils::config::ObservabilitySection;
use crate::utils::error::{MeshError, MeshResult};

/// Install the global subscriber from the observability config section.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &ObservabilitySection) -> MeshResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let result = match config.log_format.as_str() {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .try_init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };

    result.map_err(|e| MeshError::Configuration {
        reason: format!("Failed to install logging subscriber: {e}"),
    })
}

/// Best-effort initialisation for tests and examples: ignores the error when
/// a subscriber is already installed.
pub fn init_logging_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
