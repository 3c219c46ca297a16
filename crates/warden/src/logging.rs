//! Tracing subscriber setup for the daemon binary.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Initialize the global subscriber: stderr always, plus an optional
/// daily-rolling file that receives the daemon's enforcement audit trail.
pub fn init(audit_log: Option<&Path>) -> Option<WorkerGuard> {
    let fmt_layer = utils::logging::fmt_layer();

    let Some(audit_log) = audit_log else {
        registry().with(fmt_layer).init();
        return None;
    };

    let dir = audit_log.parent().unwrap_or(Path::new("."));
    let file = audit_log
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("audit.log");
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file)
        .max_log_files(7)
        .build(dir)
        .expect("failed to create rolling file appender");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let audit_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(|metadata| {
            metadata.target().contains("daemon")
        }));

    registry().with(fmt_layer).with(audit_layer).init();
    Some(guard)
}
