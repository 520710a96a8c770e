//! Logging setup and the per-plugin logger.

use anyhow::{Context, Result};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use crate::config::ServerConfig;
use crate::console::{on_worker_thread, ConsoleWriter, WORKER_TARGET};

/// Target of every event emitted through a [`PluginLogger`].
pub const PLUGIN_TARGET: &str = "oasis::plugin";

impl<'a> MakeWriter<'a> for ConsoleWriter {
    type Writer = ConsoleWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the global subscriber: one layer printing through the console
/// pipeline and one writing daily rolled files next to `LogPath`.
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// for the life of the process.
pub fn init(config: &ServerConfig, console: ConsoleWriter) -> Result<WorkerGuard> {
    let debug_mode = config.debug_mode;
    let filter = EnvFilter::try_new(config.effective_log_level())
        .context("Invalid log level")?;

    let directory = config
        .log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = config
        .log_path
        .file_name()
        .map_or_else(|| "oasis.log".into(), |name| name.to_os_string());
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, file_name));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_file(debug_mode)
        .with_line_number(debug_mode);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer(console, debug_mode))
        .with(file_layer)
        .try_init()
        .context("Failed to set global default subscriber")?;

    Ok(guard)
}

/// Layer printing through the console pipeline. Events raised on the
/// output worker are dropped; they would be queued behind themselves.
fn console_layer<S>(console: ConsoleWriter, debug_mode: bool) -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_writer(console)
        .with_target(false)
        .with_file(debug_mode)
        .with_line_number(debug_mode)
        .with_filter(filter_fn(|meta| {
            meta.target() != WORKER_TARGET && !on_worker_thread()
        }))
}

/// Host-side emitter. A plain function pointer, so a plugin module built
/// with its own copy of `tracing` still logs into the host's subscriber.
type Emit = fn(Level, &str, fmt::Arguments<'_>);

fn emit(level: Level, plugin: &str, message: fmt::Arguments<'_>) {
    match level {
        Level::ERROR => error!(target: PLUGIN_TARGET, plugin, "[{plugin}] {message}"),
        Level::WARN => warn!(target: PLUGIN_TARGET, plugin, "[{plugin}] {message}"),
        Level::INFO => info!(target: PLUGIN_TARGET, plugin, "[{plugin}] {message}"),
        _ => debug!(target: PLUGIN_TARGET, plugin, "[{plugin}] {message}"),
    }
}

/// Logger handed to a plugin; every event is tagged with the plugin name.
#[derive(Clone)]
pub struct PluginLogger {
    plugin: Arc<str>,
    emit: Emit,
}

impl PluginLogger {
    pub(crate) fn new(plugin: &str) -> Self {
        Self {
            plugin: Arc::from(plugin),
            emit,
        }
    }

    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn log(&self, level: Level, message: fmt::Arguments<'_>) {
        (self.emit)(level, &self.plugin, message);
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.log(Level::DEBUG, format_args!("{message}"));
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.log(Level::INFO, format_args!("{message}"));
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.log(Level::WARN, format_args!("{message}"));
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.log(Level::ERROR, format_args!("{message}"));
    }
}

impl fmt::Debug for PluginLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLogger")
            .field("plugin", &self.plugin)
            .finish_non_exhaustive()
    }
}
