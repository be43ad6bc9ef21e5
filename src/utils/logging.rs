use tracing_subscriber::EnvFilter;

// ort reports every session option at info level.
const DEFAULT_FILTER: &str = "info,ort=warn";

/// Install the global subscriber. `RUST_LOG` replaces the default filter.
/// Calling it again is a no-op.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .try_init();
}
