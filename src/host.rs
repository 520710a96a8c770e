//! The host facade.
//!
//! [`Host`] is the composition root: it owns the command dispatcher, the
//! task scheduler, the plugin manager and the console pipeline, and is the
//! single capability set the console and every plugin talk to.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::commands::{
    builtin, CommandCaller, CommandDispatcher, CommandEntry, CommandExecutor, Prediction,
};
use crate::config::ServerConfig;
use crate::console::{ConsoleError, ConsolePrinter};
use crate::plugins::{LoadReport, PluginHandle, PluginManager, PluginPaths};
use crate::tasks::{ScheduleError, TaskId, TaskScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Running,
    Stopping,
    Stopped,
}

pub struct Host {
    config: ServerConfig,
    console: Arc<ConsolePrinter>,
    commands: Arc<CommandDispatcher>,
    tasks: Arc<TaskScheduler>,
    plugins: PluginManager,
    create_time: DateTime<Local>,
    started: Instant,
    status: Mutex<Status>,
    stopped: Condvar,
}

impl Host {
    /// Build the host and register the built-in commands.
    ///
    /// Plugins are not loaded yet; call [`Host::load_plugins`].
    pub fn new(config: ServerConfig, console: Arc<ConsolePrinter>) -> Result<Arc<Self>> {
        config
            .ensure_directories()
            .context("Failed to prepare server directories")?;

        let tasks = Arc::new(TaskScheduler::new().context("Failed to start task scheduler")?);
        let commands = Arc::new(CommandDispatcher::new());
        let paths = PluginPaths::from(&config);

        let host = Arc::new_cyclic(|weak| Self {
            plugins: PluginManager::new(
                paths,
                Arc::clone(&commands),
                Arc::clone(&tasks),
                weak.clone(),
            ),
            config,
            console,
            commands,
            tasks,
            create_time: Local::now(),
            started: Instant::now(),
            status: Mutex::new(Status::Running),
            stopped: Condvar::new(),
        });

        builtin::register(&host);
        debug!("Host created at {}", host.create_time);
        Ok(host)
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn console(&self) -> &Arc<ConsolePrinter> {
        &self.console
    }

    #[must_use]
    pub fn commands(&self) -> &Arc<CommandDispatcher> {
        &self.commands
    }

    #[must_use]
    pub fn tasks(&self) -> &Arc<TaskScheduler> {
        &self.tasks
    }

    #[must_use]
    pub fn plugin_manager(&self) -> &PluginManager {
        &self.plugins
    }

    #[must_use]
    pub fn create_time(&self) -> DateTime<Local> {
        self.create_time
    }

    #[must_use]
    pub fn running_time(&self) -> Duration {
        self.started.elapsed()
    }

    /// Print through the console pipeline.
    ///
    /// # Errors
    /// Returns [`ConsoleError::Closed`] after the host has stopped.
    pub fn print(&self, text: &str) -> Result<(), ConsoleError> {
        self.console.print(text)
    }

    /// Print a line through the console pipeline.
    ///
    /// # Errors
    /// Returns [`ConsoleError::Closed`] after the host has stopped.
    pub fn println(&self, text: &str) -> Result<(), ConsoleError> {
        self.console.println(text)
    }

    // Commands

    pub fn execute_command(&self, caller: &CommandCaller, line: &str) -> bool {
        self.commands.execute_command(caller, line)
    }

    pub fn register_command(
        &self,
        command: &str,
        owner: Option<&PluginHandle>,
        executor: Arc<dyn CommandExecutor>,
    ) -> bool {
        self.commands.register_command(command, owner, executor)
    }

    pub fn unregister_command(&self, command: &str) -> bool {
        self.commands.unregister_command(command)
    }

    /// Commands registered by the plugin named `owner`, `None` for built-ins.
    #[must_use]
    pub fn plugin_commands(&self, owner: Option<&str>) -> Vec<CommandEntry> {
        self.commands.plugin_commands(owner)
    }

    #[must_use]
    pub fn get_prediction(&self, prefix: &str, force: bool) -> Prediction {
        self.commands.get_prediction(prefix, force)
    }

    // Tasks

    /// Schedule `callback` on a six-field cron expression.
    ///
    /// # Errors
    /// Returns an error for an invalid expression or a stopped host.
    pub fn register_task<F>(
        &self,
        owner: Option<&PluginHandle>,
        expression: &str,
        callback: F,
    ) -> Result<TaskId, ScheduleError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.tasks
            .register_task(owner.map(|p| p.name()), expression, callback)
    }

    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.tasks.cancel_task(id)
    }

    // Plugins

    #[must_use]
    pub fn get_plugin(&self, name: &str) -> Option<PluginHandle> {
        self.plugins.get_plugin(name)
    }

    /// Same as [`Host::enabled_plugins`].
    #[must_use]
    pub fn plugins(&self) -> Vec<PluginHandle> {
        self.plugins.plugins()
    }

    #[must_use]
    pub fn enabled_plugins(&self) -> Vec<PluginHandle> {
        self.plugins.enabled_plugins()
    }

    #[must_use]
    pub fn disabled_plugins(&self) -> Vec<PluginHandle> {
        self.plugins.disabled_plugins()
    }

    #[must_use]
    pub fn all_plugins(&self) -> Vec<PluginHandle> {
        self.plugins.all_plugins()
    }

    #[must_use]
    pub fn stuck_plugins(&self) -> Vec<PluginHandle> {
        self.plugins.stuck_plugins()
    }

    pub fn load_plugin<S: AsRef<str>>(&self, names: &[S]) -> LoadReport {
        self.plugins.load_plugin(names)
    }

    pub fn load_plugins(&self) -> LoadReport {
        self.plugins.load_plugins()
    }

    pub fn enable_plugin(&self, name: &str) -> bool {
        self.plugins.enable_plugin(name)
    }

    pub fn disable_plugin(&self, name: &str) -> bool {
        self.plugins.disable_plugin(name)
    }

    pub fn restart_plugin(&self, name: &str) -> bool {
        self.plugins.restart_plugin(name)
    }

    // Lifecycle

    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.status.lock() == Status::Running
    }

    /// Stop tasks, disable plugins, then close the console. Only the first
    /// call does anything.
    pub fn stop(&self) {
        {
            let mut status = self.status.lock();
            if *status != Status::Running {
                return;
            }
            *status = Status::Stopping;
        }

        info!("Stopping the server...");
        debug!("Stopping TaskScheduler...");
        self.tasks.stop();
        debug!("Stopping PluginManager...");
        let disabled = self.plugins.shutdown();
        info!(
            "Disabled {disabled} plugins, server ran for {:.1}s",
            self.running_time().as_secs_f64()
        );
        debug!("Stopping ConsolePrinter...");
        self.console.stop();

        *self.status.lock() = Status::Stopped;
        self.stopped.notify_all();
    }

    /// Block until [`Host::stop`] has finished.
    pub fn wait(&self) {
        let mut status = self.status.lock();
        while *status != Status::Stopped {
            self.stopped.wait(&mut status);
        }
    }
}
