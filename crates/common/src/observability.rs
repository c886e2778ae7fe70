//! Logging setup shared by all binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` controls filtering (default `info`). With `json` set, events
/// are emitted as one JSON object per line for log shippers; otherwise the
/// human-readable format with targets and thread ids is used.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // try_init: tests may install a subscriber more than once.
    if json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .try_init();
    }
}

/// Startup banner.
pub fn banner(title: &str) {
    tracing::info!("========================================");
    tracing::info!("  {}", title);
    tracing::info!("========================================");
}
