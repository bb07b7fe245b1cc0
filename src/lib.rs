pub mod config;
pub mod controller;
pub mod engine;
pub mod entry;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod planner;
pub mod progress;
pub mod reporter;
pub mod source;
pub mod store;

pub use error::*;

use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber once per process. `RUST_LOG` overrides the
/// default `info` level.
pub fn init_tracing(service: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
    if installed.is_ok() {
        tracing::debug!(service, "tracing initialised");
    }
}
