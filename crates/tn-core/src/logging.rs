//! Tracing subscriber setup for the binaries

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` is used (e.g.
/// `"info"` or `"tn_broker=debug"`). `foreground` forces `debug`.
pub fn init_tracing(default_filter: &str, foreground: bool) {
    let fallback = if foreground { "debug" } else { default_filter };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| fallback.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
