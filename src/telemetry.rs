//! Process-wide tracing subscriber
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber. `RUST_LOG` wins over `default_filter` when set.
/// Calling this twice is an error; tests should not rely on it.
pub fn init(default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    tracing::debug!(filter = default_filter, "tracing initialised");
    Ok(())
}
