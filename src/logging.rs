use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber on stderr, filtered by `RUST_LOG`.
/// Fails if one is already set; callers that may run twice ignore the error.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))
}
