//! provides logging helpers

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::EnvFilter;

/// initiate the global tracing subscriber
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = layer().with_writer(std::io::stdout).with_target(true);

    registry().with(fmt_layer.with_filter(filter)).init();
}
