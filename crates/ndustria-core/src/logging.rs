//! Console logging for pipeline programs

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install a console subscriber filtered by `RUST_LOG` (default: info).
///
/// Returns false when a subscriber was already installed.
pub fn init_console() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_filter(filter),
        )
        .try_init()
        .is_ok()
}
