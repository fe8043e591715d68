//! Line-driven session over one module
//!
//! Every input line first gives the monitor a chance to reload, then runs a
//! command from the module's command table.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use hotmod::{HotmodResult, ImageLoader, Module, Monitor, OrAbort, WatchRoot};
use hotmod_demo::Commands;
use tracing::{info, warn};

/// A command typed by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Up,
    Down,
    Show,
    Reload,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "up" => Ok(Command::Up),
            "down" => Ok(Command::Down),
            "show" => Ok(Command::Show),
            "reload" => Ok(Command::Reload),
            other => Err(format!(
                "Unknown command: {:?} (expected up, down, show or reload)",
                other
            )),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Up => "up",
            Command::Down => "down",
            Command::Show => "show",
            Command::Reload => "reload",
        };
        f.write_str(name)
    }
}

/// The module, with or without a file monitor
enum Host<L: ImageLoader> {
    Watched(Monitor<L>),
    Unwatched(Module<L>),
}

impl<L: ImageLoader> Host<L> {
    fn module(&self) -> &Module<L> {
        match self {
            Host::Watched(monitor) => monitor.module(),
            Host::Unwatched(module) => module,
        }
    }

    fn module_mut(&mut self) -> &mut Module<L> {
        match self {
            Host::Watched(monitor) => monitor.module_mut(),
            Host::Unwatched(module) => module,
        }
    }

    fn check(&mut self) -> HotmodResult<bool> {
        match self {
            Host::Watched(monitor) => monitor.check(),
            Host::Unwatched(_) => Ok(false),
        }
    }

    fn into_module(self) -> Module<L> {
        match self {
            Host::Watched(monitor) => monitor.unmonitor(),
            Host::Unwatched(module) => module,
        }
    }
}

pub struct Session<L: ImageLoader> {
    // declared first: the module clears the table while unloading
    host: Host<L>,
    commands: Box<Commands>,
}

impl<L: ImageLoader> Session<L> {
    /// Load the module at `path`; with a `root`, also watch it for changes.
    pub fn open(loader: L, path: &Path, root: Option<Arc<WatchRoot>>) -> HotmodResult<Self> {
        let mut commands = Box::new(Commands::default());
        // SAFETY: the table outlives the module; see field order above
        let module = unsafe { Module::load_with(loader, path, commands.as_userdata()) }?;

        let host = match root {
            Some(root) => Host::Watched(Monitor::with_root(module, root)?),
            None => Host::Unwatched(module),
        };
        Ok(Self { host, commands })
    }

    pub fn module(&self) -> &Module<L> {
        self.host.module()
    }

    /// Handle one input line.
    pub fn handle_line(&mut self, line: &str) {
        if self.host.check().or_abort("Failed to reload module") {
            info!("Reloaded {}", self.module().source_path().display());
        }

        if line.trim().is_empty() {
            return;
        }
        match line.parse::<Command>() {
            Ok(Command::Reload) => {
                self.host
                    .module_mut()
                    .reload()
                    .or_abort("Failed to reload module");
                info!("Reloaded {}", self.module().source_path().display());
            }
            Ok(command) => self.invoke(command),
            Err(e) => eprintln!("{}", e),
        }
    }

    fn invoke(&self, command: Command) {
        let function = match command {
            Command::Up => self.commands.up,
            Command::Down => self.commands.down,
            Command::Show => self.commands.show,
            Command::Reload => None,
        };
        match function {
            Some(function) => function(),
            None => warn!("Module does not provide `{}`", command),
        }
    }

    /// Stop watching, then unload.
    pub fn finish(self) -> HotmodResult<()> {
        let Session { host, commands } = self;
        let result = host.into_module().unload();
        drop(commands);
        result
    }
}
