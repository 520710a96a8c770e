//! Command registry and dispatcher.
//!
//! Commands are stored lowercase in a [`Trie`] so lookups and autocomplete
//! predictions cost O(length). A reverse index from owner to its commands
//! lets a plugin's commands be revoked in one pass when it is disabled.

pub mod builtin;
pub mod trie;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::fault::catch_fault;
use crate::plugins::PluginHandle;
use trie::{NodeId, Trie};

/// Largest prediction result returned without `force`.
pub const PREDICTION_THRESHOLD: usize = 10;

/// Something that can run a command.
///
/// `caller` is the plugin that issued the command, or `None` when it came
/// from the console. `args` is the rest of the line split on every single
/// space, so `say a  b` yields `["a", "", "b"]`.
pub trait CommandExecutor: Send + Sync {
    fn on_command(&self, caller: Option<&PluginHandle>, command: &str, args: &[String]);
}

impl<F> CommandExecutor for F
where
    F: Fn(Option<&PluginHandle>, &str, &[String]) + Send + Sync,
{
    fn on_command(&self, caller: Option<&PluginHandle>, command: &str, args: &[String]) {
        self(caller, command, args);
    }
}

/// Wrap a closure as a shareable executor.
pub fn executor<F>(f: F) -> Arc<dyn CommandExecutor>
where
    F: Fn(Option<&PluginHandle>, &str, &[String]) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A registered command.
#[derive(Clone)]
pub struct CommandEntry {
    command: String,
    owner: Option<PluginHandle>,
    executor: Arc<dyn CommandExecutor>,
}

impl CommandEntry {
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Owning plugin, `None` for built-in commands.
    #[must_use]
    pub fn owner(&self) -> Option<&PluginHandle> {
        self.owner.as_ref()
    }

    #[must_use]
    pub fn owner_name(&self) -> Option<&str> {
        self.owner.as_ref().map(|p| p.name())
    }
}

impl fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEntry")
            .field("command", &self.command)
            .field("owner", &self.owner_name())
            .finish_non_exhaustive()
    }
}

/// Origin of a command line.
#[derive(Clone)]
pub enum CommandCaller {
    Console,
    Plugin(PluginHandle),
}

impl fmt::Display for CommandCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Console => f.write_str("[Console]"),
            Self::Plugin(plugin) => write!(f, "[{plugin}]"),
        }
    }
}

/// Autocomplete result for a prefix.
///
/// `entries` is empty when `count` exceeds [`PREDICTION_THRESHOLD`] and the
/// caller did not force disclosure.
#[derive(Debug, Clone, Default)]
pub struct Prediction {
    pub count: usize,
    pub entries: Vec<CommandEntry>,
}

#[derive(Default)]
struct Registry {
    trie: Trie<CommandEntry>,
    /// Owner name (`None` = built-in) to command to trie node.
    owners: HashMap<Option<String>, HashMap<String, NodeId>>,
}

/// Routes command lines to registered executors.
#[derive(Default)]
pub struct CommandDispatcher {
    registry: Mutex<Registry>,
}

impl CommandDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and run one command line.
    ///
    /// Returns `true` when a command was found and invoked, whatever the
    /// executor did. A panicking executor is logged and treated as handled.
    pub fn execute_command(&self, caller: &CommandCaller, line: &str) -> bool {
        if line.is_empty() {
            return false;
        }

        let plugin = match caller {
            CommandCaller::Console => None,
            CommandCaller::Plugin(plugin) if plugin.is_loaded() => Some(plugin),
            CommandCaller::Plugin(plugin) => {
                warn!("Ignored command from plugin [{plugin}] which is not loaded: {line}");
                return false;
            }
        };

        let (command, args): (&str, Vec<String>) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.split(' ').map(str::to_string).collect()),
            None => (line, Vec::new()),
        };
        let command = command.to_lowercase();

        info!("{caller} issued command: {line}");

        // Clone out of the lock: executors may register or revoke commands.
        let entry = self.registry.lock().trie.get(&command).cloned();
        let Some(entry) = entry else {
            info!("Command: {command} is not found.");
            return false;
        };

        if let Err(message) = catch_fault(|| entry.executor.on_command(plugin, &command, &args)) {
            error!("Command [{command}] panicked: {message}");
        }
        true
    }

    /// Register `command` for `owner` (`None` = built-in).
    ///
    /// Returns `false` if the lowercased command is empty or already taken;
    /// an existing registration is never replaced.
    pub fn register_command(
        &self,
        command: &str,
        owner: Option<&PluginHandle>,
        executor: Arc<dyn CommandExecutor>,
    ) -> bool {
        let command = command.to_lowercase();
        if command.is_empty() {
            return false;
        }

        let entry = CommandEntry {
            command: command.clone(),
            owner: owner.cloned(),
            executor,
        };
        let owner_key = entry.owner_name().map(str::to_string);

        let mut registry = self.registry.lock();
        match registry.trie.insert(&command, entry) {
            Ok(node) => {
                registry
                    .owners
                    .entry(owner_key)
                    .or_default()
                    .insert(command, node);
                true
            }
            Err(_) => {
                debug!("Command {command} has already been registered");
                false
            }
        }
    }

    /// Remove one command. Returns `false` if it was not registered.
    pub fn unregister_command(&self, command: &str) -> bool {
        let command = command.to_lowercase();
        let mut registry = self.registry.lock();

        let Some(entry) = registry.trie.delete(&command) else {
            return false;
        };
        let owner_key = entry.owner_name().map(str::to_string);
        if let Some(commands) = registry.owners.get_mut(&owner_key) {
            commands.remove(&command);
            if commands.is_empty() {
                registry.owners.remove(&owner_key);
            }
        }
        true
    }

    /// Remove every command owned by the plugin named `owner`.
    ///
    /// Returns how many commands were removed.
    pub fn unregister_plugin_commands(&self, owner: &str) -> usize {
        let mut registry = self.registry.lock();
        let Some(commands) = registry.owners.remove(&Some(owner.to_string())) else {
            return 0;
        };

        let mut removed = 0;
        for node in commands.into_values() {
            if registry.trie.clear(node).is_some() {
                removed += 1;
            }
        }
        debug!("Unregistered {removed} commands of plugin {owner}");
        removed
    }

    /// Autocomplete `prefix`.
    #[must_use]
    pub fn get_prediction(&self, prefix: &str, force: bool) -> Prediction {
        let prefix = prefix.to_lowercase();
        let registry = self.registry.lock();

        let count = registry.trie.count(&prefix);
        if count == 0 || (count > PREDICTION_THRESHOLD && !force) {
            return Prediction {
                count,
                entries: Vec::new(),
            };
        }

        Prediction {
            count,
            entries: registry
                .trie
                .contents(&prefix)
                .into_iter()
                .cloned()
                .collect(),
        }
    }

    /// Commands registered by `owner` (`None` = built-ins), sorted.
    #[must_use]
    pub fn plugin_commands(&self, owner: Option<&str>) -> Vec<CommandEntry> {
        let registry = self.registry.lock();
        let Some(commands) = registry.owners.get(&owner.map(str::to_string)) else {
            return Vec::new();
        };

        let mut entries: Vec<CommandEntry> = commands
            .values()
            .filter_map(|&node| registry.trie.get_node(node).cloned())
            .collect();
        entries.sort_by(|a, b| a.command.cmp(&b.command));
        entries
    }

    /// Exact lookup.
    #[must_use]
    pub fn get(&self, command: &str) -> Option<CommandEntry> {
        self.registry.lock().trie.get(&command.to_lowercase()).cloned()
    }

    /// Number of registered commands starting with `prefix`.
    #[must_use]
    pub fn count(&self, prefix: &str) -> usize {
        self.registry.lock().trie.count(&prefix.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{PluginContext, PluginDescriptor, PluginModule, PluginRecord, UserPlugin};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Named(&'static str);

    impl UserPlugin for Named {
        fn description(&self) -> PluginDescriptor {
            PluginDescriptor::new(self.0, "1.0")
        }

        fn entry_point(&self, _context: PluginContext) {}
    }

    fn plugin(name: &'static str) -> PluginHandle {
        Arc::new(PluginRecord::new(PluginModule::in_process(Named(name))).unwrap())
    }

    fn noop() -> Arc<dyn CommandExecutor> {
        executor(|_, _, _| {})
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Arc<dyn CommandExecutor> {
        let counter = Arc::clone(counter);
        executor(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let dispatcher = CommandDispatcher::new();
        let owner = plugin("alpha");

        assert!(dispatcher.register_command("Hello", Some(&owner), noop()));
        assert!(!dispatcher.register_command("hello", None, noop()));
        assert!(!dispatcher.register_command("HELLO", None, noop()));

        let entry = dispatcher.get("hello").expect("first registration survives");
        assert_eq!(entry.command(), "hello");
        assert_eq!(entry.owner_name(), Some("alpha"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let dispatcher = CommandDispatcher::new();
        assert!(!dispatcher.register_command("", None, noop()));
        assert_eq!(dispatcher.count(""), 0);
    }

    #[test]
    fn test_count_after_unregister() {
        let dispatcher = CommandDispatcher::new();
        for i in 0..12 {
            assert!(dispatcher.register_command(&format!("tp{i}"), None, noop()));
        }
        assert_eq!(dispatcher.count("tp"), 12);

        for i in 0..5 {
            assert!(dispatcher.unregister_command(&format!("TP{i}")));
        }
        assert!(!dispatcher.unregister_command("tp0"));
        assert_eq!(dispatcher.count("tp"), 7);
    }

    #[test]
    fn test_prediction_threshold() {
        let dispatcher = CommandDispatcher::new();
        for i in 0..15 {
            dispatcher.register_command(&format!("warp{i:02}"), None, noop());
        }

        let hidden = dispatcher.get_prediction("warp", false);
        assert_eq!(hidden.count, 15);
        assert!(hidden.entries.is_empty());

        let forced = dispatcher.get_prediction("warp", true);
        assert_eq!(forced.count, 15);
        assert_eq!(forced.entries.len(), 15);

        let narrow = dispatcher.get_prediction("WARP0", false);
        assert_eq!(narrow.count, 10);
        assert_eq!(narrow.entries.len(), 10);

        let none = dispatcher.get_prediction("zzz", true);
        assert_eq!(none.count, 0);
        assert!(none.entries.is_empty());
    }

    #[test]
    fn test_unregister_plugin_commands_only_touches_owner() {
        let dispatcher = CommandDispatcher::new();
        let alpha = plugin("alpha");
        let beta = plugin("beta");

        dispatcher.register_command("a1", Some(&alpha), noop());
        dispatcher.register_command("a2", Some(&alpha), noop());
        dispatcher.register_command("b1", Some(&beta), noop());
        dispatcher.register_command("stop", None, noop());

        assert_eq!(dispatcher.unregister_plugin_commands("alpha"), 2);
        assert!(dispatcher.get("a1").is_none());
        assert!(dispatcher.get("a2").is_none());
        assert!(dispatcher.get("b1").is_some());
        assert!(dispatcher.get("stop").is_some());

        // Nothing left to revoke.
        assert_eq!(dispatcher.unregister_plugin_commands("alpha"), 0);
        assert_eq!(dispatcher.unregister_plugin_commands("ghost"), 0);
    }

    #[test]
    fn test_unregister_updates_owner_index() {
        let dispatcher = CommandDispatcher::new();
        let alpha = plugin("alpha");
        dispatcher.register_command("a1", Some(&alpha), noop());
        dispatcher.register_command("a2", Some(&alpha), noop());

        assert!(dispatcher.unregister_command("a1"));
        let remaining: Vec<_> = dispatcher
            .plugin_commands(Some("alpha"))
            .iter()
            .map(|e| e.command().to_string())
            .collect();
        assert_eq!(remaining, vec!["a2".to_string()]);
    }

    #[test]
    fn test_execute_routes_arguments() {
        let dispatcher = CommandDispatcher::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.register_command(
            "say",
            None,
            executor(move |caller, command, args| {
                sink.lock().push((caller.is_none(), command.to_string(), args.to_vec()));
            }),
        );

        assert!(dispatcher.execute_command(&CommandCaller::Console, "SAY hello  world"));
        assert!(dispatcher.execute_command(&CommandCaller::Console, "say"));
        assert!(dispatcher.execute_command(&CommandCaller::Console, "say "));
        assert!(!dispatcher.execute_command(&CommandCaller::Console, "shout hi"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        // Every single space separates, so repeated spaces give empty arguments.
        assert_eq!(
            seen[0],
            (true, "say".to_string(), vec!["hello".to_string(), String::new(), "world".to_string()])
        );
        assert!(seen[1].2.is_empty());
        assert_eq!(seen[2].2, vec![String::new()]);
    }

    #[test]
    fn test_execute_rejects_empty_and_unloaded_callers() {
        let dispatcher = CommandDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.register_command("ping", None, counting(&counter));

        assert!(!dispatcher.execute_command(&CommandCaller::Console, ""));

        // A record that never went through loading is not a valid caller.
        let stranger = plugin("stranger");
        assert!(!dispatcher.execute_command(&CommandCaller::Plugin(stranger), "ping"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert!(dispatcher.execute_command(&CommandCaller::Console, "ping"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_executor_panic_is_contained() {
        let dispatcher = CommandDispatcher::new();
        dispatcher.register_command("explode", None, executor(|_, _, _| panic!("kaboom")));

        assert!(dispatcher.execute_command(&CommandCaller::Console, "explode now"));
        // The registry lock is still usable afterwards.
        assert!(dispatcher.register_command("after", None, noop()));
    }

    #[test]
    fn test_executor_may_reenter_dispatcher() {
        let dispatcher = Arc::new(CommandDispatcher::new());
        let inner = Arc::clone(&dispatcher);
        dispatcher.register_command(
            "selfdestruct",
            None,
            executor(move |_, command, _| {
                inner.unregister_command(command);
            }),
        );

        assert!(dispatcher.execute_command(&CommandCaller::Console, "selfdestruct"));
        assert!(dispatcher.get("selfdestruct").is_none());
    }
}
