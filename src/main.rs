use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use oasis::config::{ServerConfig, DEFAULT_CONFIG_FILE};
use oasis::console::reader::ConsoleReader;
use oasis::console::ConsolePrinter;
use oasis::{logging, Host};

/// Oasis - An extensible plugin host
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Directory to load plugins from
    #[arg(short, long)]
    plugin_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = ServerConfig::load_or_create(&args.config);
    if args.debug {
        config.debug_mode = true;
    }
    if let Some(plugin_dir) = args.plugin_dir {
        config.plugin_path = plugin_dir;
    }
    config
        .ensure_directories()
        .context("Failed to prepare server directories")?;

    let console = Arc::new(ConsolePrinter::stdout().context("Failed to start console output")?);
    let _log_guard = logging::init(&config, console.writer())?;
    info!("Starting oasis {}", env!("CARGO_PKG_VERSION"));

    let host = Host::new(config, console)?;

    let report = host.load_plugins();
    info!(
        "Loaded {} plugins ({} enabled, {} disabled)",
        report.loaded.len(),
        report.enabled.len(),
        report.disabled.len()
    );
    for stuck in &report.stuck {
        warn!(
            "Plugin [{}] is waiting on {} dependencies",
            stuck.name, stuck.pending
        );
    }

    // Attaching the console is the last thing that may fail
    if let Err(e) = ConsoleReader::spawn(&host) {
        host.stop();
        return Err(e);
    }

    host.wait();
    Ok(())
}
