//! Oasis - an extensible plugin host
//!
//! The host discovers native plugin modules, loads them in dependency order
//! and offers them shared services: command routing, cron-style scheduled
//! tasks and a serialized console.
//!
//! # Modules
//!
//! - [`host`]: The composition root every plugin talks to
//! - [`plugins`]: Plugin API, discovery, records and lifecycle
//! - [`commands`]: Prefix-indexed command registry and dispatcher
//! - [`console`]: Bounded console output pipeline and line input
//! - [`tasks`]: Cron-style task scheduler
//! - [`config`]: Server configuration and YAML config documents
//! - [`logging`]: Subscriber setup and per-plugin loggers
//!
//! # Writing a plugin
//!
//! A plugin is a `cdylib` depending on this crate that implements
//! [`plugins::UserPlugin`] and exports it with [`declare_plugin!`]. It must be
//! built with the same `oasis` version and toolchain as the host.

pub mod commands;
pub mod config;
pub mod console;
mod fault;
pub mod host;
pub mod logging;
pub mod plugins;
pub mod tasks;

pub use commands::{executor, CommandCaller, CommandDispatcher, CommandEntry, CommandExecutor};
pub use config::{ConfigDocument, ServerConfig};
pub use console::{ConsoleError, ConsolePrinter, ConsoleWriter, Formatter};
pub use host::Host;
pub use logging::PluginLogger;
pub use plugins::{
    Comparator, Dependency, PluginContext, PluginDescriptor, PluginHandle, UserPlugin,
};
pub use tasks::{ScheduleError, TaskId, TaskScheduler};
