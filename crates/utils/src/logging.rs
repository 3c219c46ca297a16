//! provides logging helpers

use tracing::Subscriber;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// stderr fmt layer with the standard env filter, default INFO
pub fn fmt_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter)
}

/// initiate the global tracing subscriber
pub fn init() {
    registry().with(fmt_layer()).init();
}
