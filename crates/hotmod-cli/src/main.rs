//! Hotmod CLI - Interactive host for hot-reloadable modules

mod cli;
mod session;

use std::io::BufRead;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use hotmod::{HotmodConfig, NativeLoader, OrAbort, WatchRoot};
use session::Session;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout belongs to the module
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => HotmodConfig::from_file(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?,
        None => HotmodConfig::from_env()?,
    };

    let root = if cli.no_watch {
        None
    } else {
        WatchRoot::init_global(config.watch.clone());
        Some(WatchRoot::global())
    };

    let mut session = Session::open(NativeLoader::new(config.load.clone()), &cli.module, root)
        .or_abort("Failed to load module");

    for line in std::io::stdin().lock().lines() {
        session.handle_line(&line?);
    }

    session.finish()?;
    Ok(())
}
