use tracing_subscriber::{EnvFilter, prelude::*};

use crate::error::TelemetryError;

/// Install a global fmt subscriber filtered by `RUST_LOG`, or by
/// `default_directive` when the variable is unset or unparsable.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(default_directive: &str) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;

    Ok(())
}
