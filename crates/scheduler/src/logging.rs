//! provides logging helpers

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Target of allocation decision events written to the audit file.
pub const AUDIT_TARGET: &str = "audit";

fn is_audit(metadata: &tracing::Metadata<'_>) -> bool {
    metadata.target() == AUDIT_TARGET
}

/// initiate the global tracing subscriber
///
/// With an audit path, events targeting [`AUDIT_TARGET`] go to a daily-rolling
/// file instead of stderr. The returned guard must live as long as the process.
pub fn init(audit_log: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let Some(audit_log) = audit_log else {
        utils::logging::init();
        return Ok(None);
    };

    let fmt_layer = utils::logging::get_fmt_layer().with_filter(
        utils::logging::env_filter().and(filter::filter_fn(|metadata| !is_audit(metadata))),
    );

    let directory = audit_log
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = audit_log
        .file_name()
        .and_then(|name| name.to_str())
        .context("audit log path has no file name")?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(7)
        .build(directory)
        .context("failed to create audit log appender")?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let audit_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(filter::filter_fn(is_audit));

    registry().with(fmt_layer).with(audit_layer).init();
    Ok(Some(file_guard))
}
