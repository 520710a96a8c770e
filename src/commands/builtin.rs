//! Commands the host registers for itself.

use std::sync::{Arc, Weak};
use tracing::debug;

use super::executor;
use crate::host::Host;
use crate::plugins::PluginHandle;

pub const STOP_COMMANDS: [&str; 3] = ["stop", "exit", "quit"];
pub const PLUGIN_COMMANDS: [&str; 3] = ["pm", "plugin", "pluginmanager"];

/// Entries per line in listings.
const COLUMNS: usize = 5;

pub const PLUGIN_MANAGER_USAGE: &str = "\
------------[PluginManager Usage]------------
>>> l[ist] --------\t| List plugins and status
>>> i[nfo] <plugin>\t| Show plugin info
>>> e[nable] <plugin>\t| Enable plugin
>>> d[isable] <plugin>\t| Disable plugin
>>> r[estart] <plugin>\t| Restart plugin
>>> u[sage] <plugin>\t| Check registered commands";

/// Register the stop and plugin-manager commands. Executors hold the host
/// weakly so the dispatcher does not keep it alive.
pub(crate) fn register(host: &Arc<Host>) {
    let weak = Arc::downgrade(host);
    let stop = executor(move |_, _, _| {
        if let Some(host) = weak.upgrade() {
            host.stop();
        }
    });
    for command in STOP_COMMANDS {
        host.register_command(command, None, Arc::clone(&stop));
    }

    let weak: Weak<Host> = Arc::downgrade(host);
    let manage = executor(move |_, _, args| {
        if let Some(host) = weak.upgrade() {
            let output = plugin_manager_command(&host, args);
            if let Err(e) = host.println(&output) {
                debug!("Dropped plugin manager output: {e}");
            }
        }
    });
    for command in PLUGIN_COMMANDS {
        host.register_command(command, None, Arc::clone(&manage));
    }
}

/// Run a `pm` subcommand and return what it prints.
pub fn plugin_manager_command(host: &Host, args: &[String]) -> String {
    let Some((action, names)) = args.split_first() else {
        return PLUGIN_MANAGER_USAGE.to_string();
    };

    match (action.to_lowercase().as_str(), names.is_empty()) {
        ("l" | "list", true) => list(host),
        ("i" | "info", false) => each_plugin(host, names, |plugin| plugin.detailed_info()),
        ("e" | "enable", false) => each_plugin(host, names, |plugin| {
            if host.enable_plugin(plugin.name()) {
                format!("Plugin [{plugin}] enabled.")
            } else {
                format!("Plugin [{plugin}] was not enabled.")
            }
        }),
        ("d" | "disable", false) => each_plugin(host, names, |plugin| {
            if host.disable_plugin(plugin.name()) {
                format!("Plugin [{plugin}] disabled.")
            } else {
                format!("Plugin [{plugin}] was not disabled.")
            }
        }),
        ("r" | "restart", false) => each_plugin(host, names, |plugin| {
            if host.restart_plugin(plugin.name()) {
                format!("Plugin [{plugin}] restarted.")
            } else {
                format!("Plugin [{plugin}] was not restarted.")
            }
        }),
        ("u" | "usage", false) => each_plugin(host, names, |plugin| {
            let usages = host.plugin_commands(Some(plugin.name()));
            format!(
                "Usages of [{plugin}]:{}",
                columns(usages.iter().map(|entry| entry.command().to_string()))
            )
        }),
        _ => PLUGIN_MANAGER_USAGE.to_string(),
    }
}

fn list(host: &Host) -> String {
    let enabled = host.enabled_plugins();
    let disabled = host.disabled_plugins();
    format!(
        "Found {} Enabled plugins:{}\nFound {} Disabled plugins:{}",
        enabled.len(),
        columns(enabled.iter().map(|p| format!("[{p}]"))),
        disabled.len(),
        columns(disabled.iter().map(|p| format!("[{p}]")))
    )
}

fn each_plugin<F>(host: &Host, names: &[String], mut action: F) -> String
where
    F: FnMut(&PluginHandle) -> String,
{
    names
        .iter()
        .map(|name| match host.get_plugin(name) {
            Some(plugin) => action(&plugin),
            None => format!("No such a plugin Named: {name}"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Lay items out `COLUMNS` per line, each line starting on a new row.
fn columns(items: impl Iterator<Item = String>) -> String {
    let mut out = String::new();
    for (i, item) in items.enumerate() {
        if i % COLUMNS == 0 {
            out.push('\n');
        }
        out.push_str(&item);
        out.push_str(" \t");
    }
    out
}
