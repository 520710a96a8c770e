//! Plugin discovery, dependency resolution and lifecycle.
//!
//! Loading runs as a breadth-first topological relaxation: every plugin
//! whose hard dependencies are all loaded is loaded, configured and enabled,
//! then the plugins waiting on it are decremented, until a pass makes no
//! progress. Whatever is left is stuck and retried with the next batch.
//!
//! The manager lock covers the plugin table and the membership lists only.
//! It is released before any plugin callback runs; the per-record state
//! lock is always taken after it, never before.

use parking_lot::Mutex;
use serde_yaml::Mapping;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::api::PluginContext;
use super::loader::{module_file_name, scan_directory, DiscoveryError, PluginModule};
use super::record::{PluginHandle, PluginRecord, PluginState, UnsatisfiedDependency};
use crate::commands::CommandDispatcher;
use crate::config::{ConfigDocument, ServerConfig};
use crate::host::Host;
use crate::logging::PluginLogger;
use crate::tasks::TaskScheduler;

/// Directories the manager reads modules from and writes plugin data into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginPaths {
    pub plugin_dir: PathBuf,
    pub resource_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl From<&ServerConfig> for PluginPaths {
    fn from(config: &ServerConfig) -> Self {
        Self {
            plugin_dir: config.plugin_path.clone(),
            resource_dir: config.plugin_resource_path.clone(),
            config_dir: config.config_path.clone(),
        }
    }
}

/// A plugin left unloaded at the end of a batch.
#[derive(Debug, Clone)]
pub struct StuckPlugin {
    pub name: String,
    pub pending: usize,
    pub unsatisfied: Vec<UnsatisfiedDependency>,
}

/// Outcome of one load batch.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Modules that never became records.
    pub rejected: Vec<DiscoveryError>,
    /// Names in load order.
    pub loaded: Vec<String>,
    pub enabled: Vec<String>,
    pub disabled: Vec<String>,
    pub stuck: Vec<StuckPlugin>,
    /// Dependencies that were missing or had the wrong version.
    pub unsatisfied: usize,
}

/// Reverse dependency map: plugin name to the plugins waiting on it.
type Dependents = HashMap<String, Vec<PluginHandle>>;

#[derive(Default)]
struct ManagerState {
    table: HashMap<String, PluginHandle>,
    /// In enable order.
    enabled: Vec<PluginHandle>,
    disabled: Vec<PluginHandle>,
    stuck: Vec<PluginHandle>,
}

impl ManagerState {
    fn mark_enabled(&mut self, record: &PluginHandle) {
        self.disabled.retain(|p| !Arc::ptr_eq(p, record));
        if !self.enabled.iter().any(|p| Arc::ptr_eq(p, record)) {
            self.enabled.push(Arc::clone(record));
        }
    }

    fn mark_disabled(&mut self, record: &PluginHandle) {
        self.enabled.retain(|p| !Arc::ptr_eq(p, record));
        if !self.disabled.iter().any(|p| Arc::ptr_eq(p, record)) {
            self.disabled.push(Arc::clone(record));
        }
    }
}

pub struct PluginManager {
    state: Mutex<ManagerState>,
    /// Plugin registry document (`plugin.yml`).
    registry: ConfigDocument,
    paths: PluginPaths,
    commands: Arc<CommandDispatcher>,
    tasks: Arc<TaskScheduler>,
    host: Weak<Host>,
}

impl PluginManager {
    pub fn new(
        paths: PluginPaths,
        commands: Arc<CommandDispatcher>,
        tasks: Arc<TaskScheduler>,
        host: Weak<Host>,
    ) -> Self {
        let registry = ConfigDocument::open(
            paths.config_dir.join(crate::config::PLUGIN_REGISTRY_FILE),
            &Mapping::new(),
        );

        Self {
            state: Mutex::new(ManagerState::default()),
            registry,
            paths,
            commands,
            tasks,
            host,
        }
    }

    #[must_use]
    pub fn paths(&self) -> &PluginPaths {
        &self.paths
    }

    /// Any discovered plugin, loaded or not.
    #[must_use]
    pub fn get_plugin(&self, name: &str) -> Option<PluginHandle> {
        let plugin = self.state.lock().table.get(name).cloned();
        if plugin.is_none() {
            debug!("Plugin {name} is not found");
        }
        plugin
    }

    /// Same as [`PluginManager::enabled_plugins`].
    #[must_use]
    pub fn plugins(&self) -> Vec<PluginHandle> {
        self.enabled_plugins()
    }

    #[must_use]
    pub fn enabled_plugins(&self) -> Vec<PluginHandle> {
        self.state.lock().enabled.clone()
    }

    #[must_use]
    pub fn disabled_plugins(&self) -> Vec<PluginHandle> {
        self.state.lock().disabled.clone()
    }

    /// Enabled plugins followed by disabled ones.
    #[must_use]
    pub fn all_plugins(&self) -> Vec<PluginHandle> {
        let state = self.state.lock();
        state
            .enabled
            .iter()
            .chain(state.disabled.iter())
            .cloned()
            .collect()
    }

    /// Discovered plugins whose dependencies never resolved.
    #[must_use]
    pub fn stuck_plugins(&self) -> Vec<PluginHandle> {
        self.state.lock().stuck.clone()
    }

    /// Open the named modules from the plugin directory and load them as
    /// one batch. The platform extension is appended when missing.
    pub fn load_plugin<S: AsRef<str>>(&self, names: &[S]) -> LoadReport {
        let mut modules = Vec::new();
        let mut rejected = Vec::new();

        for name in names {
            let file = module_file_name(name.as_ref());
            info!("Checking plugin file {file}");
            match PluginModule::open(&self.paths.plugin_dir.join(&file)) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    warn!("{e}");
                    rejected.push(e);
                }
            }
        }

        let mut report = self.load_modules(modules);
        rejected.append(&mut report.rejected);
        report.rejected = rejected;
        report
    }

    /// Load every module directly inside the plugin directory.
    pub fn load_plugins(&self) -> LoadReport {
        match scan_directory(&self.paths.plugin_dir) {
            Ok(names) => self.load_plugin(&names),
            Err(e) => {
                warn!(
                    "Fail to access to PluginPath {}: {e}",
                    self.paths.plugin_dir.display()
                );
                LoadReport::default()
            }
        }
    }

    /// Register `modules` and load everything that can be loaded, including
    /// plugins left stuck by earlier batches.
    pub fn load_modules(&self, modules: Vec<PluginModule>) -> LoadReport {
        let mut report = LoadReport::default();

        // Descriptors are plugin code: build records before taking the lock.
        let mut records = Vec::with_capacity(modules.len());
        for module in modules {
            match PluginRecord::new(module) {
                Ok(record) => records.push(Arc::new(record)),
                Err(e) => {
                    warn!("{e}");
                    report.rejected.push(e);
                }
            }
        }

        let (batch, dependents) = {
            let mut state = self.state.lock();

            let mut batch = std::mem::take(&mut state.stuck);
            for record in records {
                if state.table.contains_key(record.name()) {
                    let e = DiscoveryError::Duplicate {
                        name: record.name().to_string(),
                    };
                    warn!("{e}");
                    report.rejected.push(e);
                    continue;
                }
                state
                    .table
                    .insert(record.name().to_string(), Arc::clone(&record));
                batch.push(record);
            }

            if batch.is_empty() {
                return report;
            }

            info!("Handling Plugin Dependencies...");
            let dependents = Self::resolve_dependencies(&state.table, &batch, &mut report);
            info!("Reported {} unsatisfied dependencies", report.unsatisfied);
            (batch, dependents)
        };

        info!("Loading Plugins...");
        let stuck = self.relax(batch, &dependents, &mut report);

        for record in &stuck {
            warn!(
                "Plugin [{record}] is not loaded, {} dependencies unloaded",
                record.pending_dependencies()
            );
            report.stuck.push(StuckPlugin {
                name: record.name().to_string(),
                pending: record.pending_dependencies(),
                unsatisfied: record.unsatisfied_dependencies(),
            });
        }
        self.state.lock().stuck.extend(stuck);

        report
    }

    /// Count pending dependencies of every batch member and build the
    /// reverse adjacency map.
    fn resolve_dependencies(
        table: &HashMap<String, PluginHandle>,
        batch: &[PluginHandle],
        report: &mut LoadReport,
    ) -> Dependents {
        let mut dependents = Dependents::new();

        for record in batch {
            let mut pending = 0;
            let mut unsatisfied = Vec::new();

            for dependency in record.dependencies() {
                match table.get(&dependency.name) {
                    Some(found) if dependency.is_satisfied_by(found.version()) => {
                        debug!("Plugin Dependency satisfied: [{record}] -> [{dependency}]. Found [{found}]");
                    }
                    Some(found) => {
                        warn!("Plugin Dependency not satisfied: [{record}] -> [{dependency}]. But Found [{found}]");
                        unsatisfied.push(UnsatisfiedDependency {
                            dependency: dependency.clone(),
                            found: Some(found.version().to_string()),
                        });
                    }
                    None => {
                        warn!(
                            "Plugin Dependency not satisfied: [{record}] -> [{dependency}]. [{}] is not found",
                            dependency.name
                        );
                        unsatisfied.push(UnsatisfiedDependency {
                            dependency: dependency.clone(),
                            found: None,
                        });
                    }
                }

                // A mismatched version is reported, loading is still attempted.
                if table.get(&dependency.name).is_some_and(|found| found.is_loaded()) {
                    continue;
                }
                pending += 1;
                dependents
                    .entry(dependency.name.clone())
                    .or_default()
                    .push(Arc::clone(record));
            }

            report.unsatisfied += unsatisfied.len();
            record.reset_dependencies(pending, unsatisfied);
        }

        dependents
    }

    /// Load passes until nothing changes; returns what could not be loaded.
    fn relax(
        &self,
        mut queue: Vec<PluginHandle>,
        dependents: &Dependents,
        report: &mut LoadReport,
    ) -> Vec<PluginHandle> {
        let mut pass = 0;
        loop {
            let mut progress = 0;
            let mut next: Vec<PluginHandle> = Vec::new();
            let mut queued = HashSet::new();

            for record in queue {
                if record.is_loaded() {
                    continue;
                }
                if record.pending_dependencies() > 0 {
                    debug!(
                        "Plugin [{record}] has {} dependencies unloaded, ignored.",
                        record.pending_dependencies()
                    );
                    if queued.insert(record.name().to_string()) {
                        next.push(record);
                    }
                    continue;
                }

                self.load_and_enable(&record, report);
                progress += 1;

                for dependent in dependents.get(record.name()).into_iter().flatten() {
                    let left = dependent.resolve_dependency();
                    debug!("Plugin [{dependent}]'s unloaded dependencies -1, left {left}");
                    if !dependent.is_loaded() && queued.insert(dependent.name().to_string()) {
                        next.push(Arc::clone(dependent));
                    }
                }
            }

            debug!("Topological sort[{pass}] finished. Loaded {progress} plugins");
            queue = next;
            pass += 1;
            if progress == 0 {
                return queue;
            }
        }
    }

    /// Load sequence for one record, followed by the enable decision.
    fn load_and_enable(&self, record: &PluginHandle, report: &mut LoadReport) {
        if !record.transition(&[PluginState::Discovered], PluginState::Loading) {
            return;
        }
        info!("Loading Plugin [{record}]...");

        let context = self.build_context(record);
        let entered = record.invoke_entry_point(context);
        if entered && record.invoke_load() {
            info!("Plugin [{record}] successfully loaded.");
        } else {
            warn!("Plugin [{record}] unsuccessfully loaded.");
        }
        record.set_state(PluginState::Loaded);
        report.loaded.push(record.name().to_string());

        if self.check_plugin_config(record) {
            self.enable_record(record);
            report.enabled.push(record.name().to_string());
        } else {
            info!("Plugin [{record}] is disabled by the plugin registry");
            record.set_state(PluginState::Disabled);
            self.state.lock().mark_disabled(record);
            report.disabled.push(record.name().to_string());
        }
    }

    fn build_context(&self, record: &PluginHandle) -> PluginContext {
        let name = record.name();

        let folder = self.paths.resource_dir.join(name);
        if let Err(e) = fs::create_dir_all(&folder) {
            warn!("Failed to create folder {} for [{record}]: {e}", folder.display());
        }

        let config = Arc::new(ConfigDocument::open(
            self.paths.config_dir.join(format!("{name}.yml")),
            &record.descriptor().default_config,
        ));
        record.attach(Arc::clone(&config), folder.clone());

        PluginContext::new(
            Arc::downgrade(record),
            self.host.clone(),
            PluginLogger::new(name),
            config,
            folder,
        )
    }

    /// Read the persisted `Enable` flag (default true) and rewrite the
    /// plugin's registry entry.
    fn check_plugin_config(&self, record: &PluginRecord) -> bool {
        let name = record.name();
        let enable = self
            .registry
            .get_bool(&format!("{name}.Enable"))
            .unwrap_or(true);

        self.registry.set(name, record.registry_snapshot(enable));
        if let Err(e) = self.registry.write() {
            warn!("{e}");
        }
        enable
    }

    fn enable_record(&self, record: &PluginHandle) -> bool {
        if !record.transition(
            &[PluginState::Loaded, PluginState::Disabled],
            PluginState::Enabling,
        ) {
            return false;
        }
        info!("Enabling Plugin [{record}]...");

        let succeeded = record.invoke_enable();
        if succeeded {
            info!("Plugin [{record}] successfully enabled.");
        } else {
            warn!("Plugin [{record}] unsuccessfully enabled.");
        }

        record.set_state(PluginState::Enabled);
        self.state.lock().mark_enabled(record);
        succeeded
    }

    /// Enable a loaded, not enabled plugin.
    ///
    /// Returns `false` if the plugin is unknown, not loaded, already
    /// enabled, or its enable callback failed.
    pub fn enable_plugin(&self, name: &str) -> bool {
        match self.get_plugin(name) {
            Some(record) => self.enable_record(&record),
            None => false,
        }
    }

    /// Revoke the plugin's commands, cancel its tasks, then call its disable
    /// callback.
    ///
    /// Returns `false` if the plugin is unknown or not enabled; the callback
    /// is not invoked in that case. Otherwise returns the callback's result.
    pub fn disable_plugin(&self, name: &str) -> bool {
        let Some(record) = self.get_plugin(name) else {
            return false;
        };
        if !record.transition(&[PluginState::Enabled], PluginState::Disabling) {
            debug!("Plugin [{record}] is not enabled");
            return false;
        }
        info!("Disabling Plugin [{record}]...");

        let commands = self.commands.unregister_plugin_commands(record.name());
        let tasks = self.tasks.cancel_owner_tasks(record.name());
        debug!("Revoked {commands} commands and {tasks} tasks of [{record}]");

        let succeeded = record.invoke_disable();
        if succeeded {
            info!("Plugin [{record}] successfully disabled.");
        } else {
            warn!("Plugin [{record}] unsuccessfully disabled.");
        }

        record.set_state(PluginState::Disabled);
        self.state.lock().mark_disabled(&record);
        succeeded
    }

    /// Disable then enable. Returns whether the plugin ended up enabled
    /// again.
    pub fn restart_plugin(&self, name: &str) -> bool {
        self.disable_plugin(name);
        self.enable_plugin(name);
        self.get_plugin(name).is_some_and(|p| p.is_enabled())
    }

    /// Disable every enabled plugin, most recently enabled first.
    pub fn shutdown(&self) -> usize {
        let enabled = self.enabled_plugins();
        let mut disabled = 0;
        for record in enabled.iter().rev() {
            if record.is_enabled() {
                self.disable_plugin(record.name());
                disabled += 1;
            }
        }
        disabled
    }
}
