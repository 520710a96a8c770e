use oasis::commands::executor;
use oasis::{declare_plugin, Host, PluginContext, PluginDescriptor, UserPlugin};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Greeter Plugin - A small example plugin for Oasis
///
/// Registers a `hello` command and an announcement task whenever it is
/// enabled. Both are revoked by the host when the plugin is disabled.
#[derive(Default)]
pub struct Greeter {
    context: Mutex<Option<PluginContext>>,
}

impl Greeter {
    fn register(&self, context: &PluginContext) -> bool {
        let (Some(host), Some(me)) = (context.host(), context.plugin()) else {
            return false;
        };
        let config = context.config();
        let greeting = config
            .get_string("Greeting")
            .unwrap_or_else(|| "Hello".to_string());
        let schedule = config
            .get_string("Announce")
            .unwrap_or_else(|| "0 0 * * * *".to_string());

        let weak: Weak<Host> = Arc::downgrade(&host);
        let hello = executor(move |caller, _, args| {
            let Some(host) = weak.upgrade() else {
                return;
            };
            let name = match (args.first(), caller) {
                (Some(name), _) => name.clone(),
                (None, Some(plugin)) => plugin.name().to_string(),
                (None, None) => "console".to_string(),
            };
            let _ = host.println(&format!("{greeting}, {name}!"));
        });
        if !host.register_command("hello", Some(&me), hello) {
            context.logger().warn("command hello is already taken");
        }

        let weak: Weak<Host> = Arc::downgrade(&host);
        let announce = move || {
            if let Some(host) = weak.upgrade() {
                let uptime = host.running_time().as_secs();
                let _ = host.println(&format!("Server has been up for {uptime}s"));
            }
        };
        match host.register_task(Some(&me), &schedule, announce) {
            Ok(id) => {
                context.logger().debug(format_args!("announce task {id} on [{schedule}]"));
                true
            }
            Err(e) => {
                context.logger().error(e);
                false
            }
        }
    }
}

impl UserPlugin for Greeter {
    fn description(&self) -> PluginDescriptor {
        PluginDescriptor::new("greeter", "0.1.0")
            .with_author("oasis")
            .with_description("Says hello and announces the uptime")
            .with_default("Greeting", "Hello")
            .with_default("Announce", "0 0 * * * *")
    }

    fn entry_point(&self, context: PluginContext) {
        *self.context.lock() = Some(context);
    }

    fn on_load(&self) -> bool {
        let context = self.context.lock();
        let Some(context) = context.as_ref() else {
            return false;
        };
        context.logger().info(format_args!(
            "files live in {}",
            context.folder().display()
        ));
        true
    }

    fn on_enable(&self) -> bool {
        let context = self.context.lock();
        context.as_ref().is_some_and(|context| self.register(context))
    }

    fn on_disable(&self) -> bool {
        if let Some(context) = self.context.lock().as_ref() {
            context.logger().info("Goodbye!");
        }
        true
    }
}

declare_plugin!(Greeter::default());
