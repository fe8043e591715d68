//! File-change monitor for a module
//!
//! A [`Monitor`] owns a [`Module`] and a subscription on the directory holding
//! its source file. [`Monitor::should_reload`] reports at most once per burst
//! of changes; [`Monitor::check`] also performs the reload.

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{HotmodError, HotmodResult};
use crate::loader::{ImageLoader, NativeLoader};
use crate::module::Module;
use crate::watch::{Subscribed, WatchRoot};

/// Subscription on a watch root, released on drop
#[derive(Debug)]
struct Registration {
    root: Arc<WatchRoot>,
    subscribed: Subscribed,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.root.unsubscribe(&self.subscribed);
    }
}

/// A module watched for changes on disk
pub struct Monitor<L: ImageLoader = NativeLoader> {
    module: Module<L>,
    registration: Registration,
    /// Version last reported by `should_reload`
    acted_version: u64,
    /// Root generation observed on the previous poll
    root_generation: u64,
}

impl<L: ImageLoader> Monitor<L> {
    /// Watch `module` through the process-wide root
    pub fn new(module: Module<L>) -> HotmodResult<Self> {
        Self::with_root(module, WatchRoot::global())
    }

    /// Watch `module` through `root`
    pub fn with_root(module: Module<L>, root: Arc<WatchRoot>) -> HotmodResult<Self> {
        let source = module.source_path();
        let (dir, file_name) = split(source)?;

        let subscribed = root.subscribe(dir, file_name)?;
        info!("Monitoring {:?}", source);
        let root_generation = root.generation();

        Ok(Self {
            module,
            registration: Registration { root, subscribed },
            acted_version: 0,
            root_generation,
        })
    }

    /// Whether the file changed since this was last answered true.
    ///
    /// Any number of writes between two calls yields a single true.
    pub fn should_reload(&mut self) -> bool {
        let Registration { root, subscribed } = &self.registration;
        let latest = root.latest_version(subscribed, &mut self.root_generation);
        if latest == self.acted_version {
            return false;
        }

        debug!(
            "Change detected on {:?} (version {} -> {})",
            self.module.source_path(),
            self.acted_version,
            latest
        );
        self.acted_version = latest;
        true
    }

    /// Reload the module if its file changed; returns whether it did.
    pub fn check(&mut self) -> HotmodResult<bool> {
        if !self.should_reload() {
            return Ok(false);
        }
        self.module.reload()?;
        Ok(true)
    }

    /// Stop watching and hand the module back
    pub fn unmonitor(self) -> Module<L> {
        let Monitor {
            module,
            registration,
            ..
        } = self;
        info!("Stopped monitoring {:?}", module.source_path());
        drop(registration);
        module
    }

    pub fn module(&self) -> &Module<L> {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut Module<L> {
        &mut self.module
    }

    /// The root this monitor is registered with
    pub fn root(&self) -> &Arc<WatchRoot> {
        &self.registration.root
    }
}

impl<L: ImageLoader> std::fmt::Debug for Monitor<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("module", &self.module)
            .field("dir", &self.registration.subscribed.dir)
            .field("acted_version", &self.acted_version)
            .finish()
    }
}

fn split(source: &Path) -> HotmodResult<(&Path, OsString)> {
    match (source.parent(), source.file_name()) {
        (Some(dir), Some(name)) => Ok((dir, name.to_os_string())),
        _ => Err(HotmodError::InvalidPath {
            path: source.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "module path has no parent directory",
            ),
        }
        .recorded()),
    }
}
