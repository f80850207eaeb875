//! tracing-subscriber initialization.
//!
//! JSON lines on stdout, filtered by `RUST_LOG` and falling back to the
//! configured level. Message text, tokens and secrets are never recorded as
//! fields; request handlers skip their bodies and headers.

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Registry};

/// Install the global subscriber. Call once, first thing in `main`.
pub fn init(log_level: &str) {
    // Suppress noisy internal crates.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{log_level},hyper=off,h2=off,fred=warn"))
    });

    Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
