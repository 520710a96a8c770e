use oasis::commands::executor;
use oasis::config::ServerConfig;
use oasis::console::ConsolePrinter;
use oasis::plugins::{Comparator, Dependency, PluginModule, PluginState};
use oasis::{CommandCaller, Host, PluginContext, PluginDescriptor, UserPlugin};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn server_config(root: &Path) -> ServerConfig {
    ServerConfig {
        log_path: root.join("logs").join("oasis.log"),
        plugin_resource_path: root.join("resources"),
        plugin_path: root.join("plugins"),
        config_path: root.join("configs"),
        ..ServerConfig::default()
    }
}

fn start_host(root: &Path) -> (Arc<Host>, SharedBuffer) {
    let buffer = SharedBuffer::default();
    let console = Arc::new(ConsolePrinter::start(buffer.clone()).unwrap());
    (Host::new(server_config(root), console).unwrap(), buffer)
}

/// Registers a command and a task while loading, using only what the
/// context hands it.
#[derive(Default)]
struct Economy {
    context: Mutex<Option<PluginContext>>,
    callers: Arc<Mutex<Vec<Option<String>>>>,
    disables: AtomicUsize,
}

impl UserPlugin for Economy {
    fn description(&self) -> PluginDescriptor {
        PluginDescriptor::new("economy", "1.2")
            .with_author("oasis")
            .with_description("keeps everyone's coins")
            .with_default("StartingBalance", 100)
    }

    fn entry_point(&self, context: PluginContext) {
        *self.context.lock() = Some(context);
    }

    fn on_load(&self) -> bool {
        let context = self.context.lock();
        let Some(context) = context.as_ref() else {
            return false;
        };
        let (Some(host), Some(me)) = (context.host(), context.plugin()) else {
            return false;
        };

        let balance = context.config().get_i64("StartingBalance").unwrap_or(0);
        let callers = Arc::clone(&self.callers);
        host.register_command(
            "balance",
            Some(&me),
            executor(move |caller, _, _| {
                assert_eq!(balance, 100);
                callers.lock().push(caller.map(|p| p.name().to_string()));
            }),
        );
        context.logger().info("registered balance");
        host.register_task(Some(&me), "0 0 0 1 1 *", || {}).is_ok()
    }

    fn on_disable(&self) -> bool {
        self.disables.fetch_add(1, Ordering::SeqCst);
        true
    }
}

struct Shop;

impl UserPlugin for Shop {
    fn description(&self) -> PluginDescriptor {
        PluginDescriptor::new("shop", "0.1")
            .depends_on(Dependency::new("economy", Comparator::GreaterEqual, "1.0"))
            .soft_depends_on(Dependency::any("discounts"))
    }

    fn entry_point(&self, _context: PluginContext) {}
}

#[cfg(test)]
mod host_tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_plugin_services_through_context() {
        let dir = tempdir().unwrap();
        let (host, _buffer) = start_host(dir.path());
        let economy = Arc::new(Economy::default());

        struct Handle(Arc<Economy>);
        impl UserPlugin for Handle {
            fn description(&self) -> PluginDescriptor {
                self.0.description()
            }
            fn entry_point(&self, context: PluginContext) {
                self.0.entry_point(context);
            }
            fn on_load(&self) -> bool {
                self.0.on_load()
            }
            fn on_disable(&self) -> bool {
                self.0.on_disable()
            }
        }

        let report = host.plugin_manager().load_modules(vec![
            PluginModule::in_process(Shop),
            PluginModule::in_process(Handle(Arc::clone(&economy))),
        ]);
        assert_eq!(report.loaded, vec!["economy", "shop"]);
        assert!(report.stuck.is_empty());

        let owned: Vec<_> = host
            .plugin_commands(Some("economy"))
            .iter()
            .map(|e| e.command().to_string())
            .collect();
        assert_eq!(owned, vec!["balance"]);
        assert_eq!(host.tasks().owner_tasks("economy").len(), 1);

        // Console and plugin callers are told apart.
        let shop = host.get_plugin("shop").unwrap();
        assert!(host.execute_command(&CommandCaller::Console, "Balance"));
        assert!(host.execute_command(&CommandCaller::Plugin(Arc::clone(&shop)), "balance me"));
        assert_eq!(
            *economy.callers.lock(),
            vec![None, Some("shop".to_string())]
        );

        // Disabling revokes, re-enabling does not bring anything back.
        assert!(host.disable_plugin("economy"));
        assert!(!host.execute_command(&CommandCaller::Console, "balance"));
        assert!(host.tasks().owner_tasks("economy").is_empty());
        assert!(host.enable_plugin("economy"));
        assert!(host.plugin_commands(Some("economy")).is_empty());

        host.stop();
        assert_eq!(economy.disables.load(Ordering::SeqCst), 2);
        assert_eq!(shop.state(), PluginState::Disabled);
    }

    #[test]
    fn test_missing_dependency_leaves_dependent_stuck() {
        let dir = tempdir().unwrap();
        let (host, _buffer) = start_host(dir.path());

        let report = host
            .plugin_manager()
            .load_modules(vec![PluginModule::in_process(Shop)]);
        assert!(report.loaded.is_empty());
        assert_eq!(report.unsatisfied, 1);
        assert_eq!(report.stuck[0].name, "shop");
        assert_eq!(
            report.stuck[0].unsatisfied[0].to_string(),
            "[economy version>=1.0]. [economy] is not found"
        );

        let shop = host.get_plugin("shop").unwrap();
        assert!(!host.execute_command(&CommandCaller::Plugin(shop), "pm list"));

        let report = host
            .plugin_manager()
            .load_modules(vec![PluginModule::in_process(Economy::default())]);
        assert_eq!(report.loaded, vec!["economy", "shop"]);
        assert!(host.stuck_plugins().is_empty());
        host.stop();
    }

    #[test]
    fn test_plugin_config_and_registry_files() {
        let dir = tempdir().unwrap();
        let (host, _buffer) = start_host(dir.path());
        host.plugin_manager()
            .load_modules(vec![PluginModule::in_process(Economy::default())]);
        host.stop();

        let config = std::fs::read_to_string(dir.path().join("configs").join("economy.yml")).unwrap();
        assert!(config.contains("StartingBalance: 100"));

        let registry = std::fs::read_to_string(dir.path().join("configs").join("plugin.yml")).unwrap();
        assert!(registry.contains("economy:"));
        assert!(registry.contains("Enable: true"));
        assert!(registry.contains("Author: oasis"));
        assert!(dir.path().join("resources").join("economy").is_dir());
    }

    #[test]
    fn test_load_plugins_from_empty_directory() {
        let dir = tempdir().unwrap();
        let (host, _buffer) = start_host(dir.path());
        std::fs::write(dir.path().join("plugins").join("readme.txt"), "not a plugin").unwrap();

        let report = host.load_plugins();
        assert!(report.loaded.is_empty());
        assert!(report.rejected.is_empty());
        assert!(host.all_plugins().is_empty());
        host.stop();
    }
}

#[cfg(test)]
mod console_command_tests {
    use super::*;
    use tempfile::tempdir;

    fn run(commands: &[&str]) -> String {
        let dir = tempdir().unwrap();
        let (host, buffer) = start_host(dir.path());
        host.plugin_manager().load_modules(vec![
            PluginModule::in_process(Economy::default()),
            PluginModule::in_process(Shop),
        ]);

        for command in commands {
            host.execute_command(&CommandCaller::Console, command);
        }
        host.stop();
        buffer.contents()
    }

    #[test]
    fn test_pm_list() {
        let output = run(&["pm list"]);
        assert!(output.contains("Found 2 Enabled plugins:"));
        assert!(output.contains("[economy version=1.2]"));
        assert!(output.contains("[shop version=0.1]"));
        assert!(output.contains("Found 0 Disabled plugins:"));
    }

    #[test]
    fn test_pm_info_and_unknown_plugin() {
        let output = run(&["plugin i economy ghost"]);
        assert!(output.contains("[Name]: economy"));
        assert!(output.contains("[Author]: oasis"));
        assert!(output.contains("No such a plugin Named: ghost"));
    }

    #[test]
    fn test_pm_disable_then_list() {
        let output = run(&["pm d shop", "pm disable shop", "pm l"]);
        assert!(output.contains("Plugin [shop version=0.1] disabled."));
        assert!(output.contains("Plugin [shop version=0.1] was not disabled."));
        assert!(output.contains("Found 1 Disabled plugins:"));
    }

    #[test]
    fn test_pm_usage_lists_commands() {
        let output = run(&["pluginmanager usage economy"]);
        assert!(output.contains("Usages of [economy version=1.2]:"));
        assert!(output.contains("balance"));
    }

    #[test]
    fn test_pm_without_arguments_prints_help() {
        let output = run(&["pm", "pm enable"]);
        assert_eq!(output.matches("[PluginManager Usage]").count(), 2);
    }
}
