use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

static LOGGING: OnceLock<()> = OnceLock::new();

/// Installs the global fmt subscriber once. Honors `RUST_LOG`, defaulting to `info`.
///
/// Safe to call repeatedly and from hosts that already installed a subscriber.
pub fn init_logging() {
    LOGGING.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}
