//! Module lifecycle
//!
//! `LOADED -> (RELOADING -> LOADED)* -> UNLOADED`. Reloading is transient and
//! never observable between calls. A reload whose reopen fails leaves the
//! module defunct; it is never retried.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::time::Instant;

use hotmod_abi::{ABI_VERSION, ModuleInfo, ModuleOp};
use tracing::{debug, info, warn};

use crate::config::LoadOptions;
use crate::error::{HotmodError, HotmodResult};
use crate::loader::{ImageLoader, LoadedImage, NativeLoader};
use crate::state::{MigrationReport, StateSnapshot};

/// A loaded image together with the metadata snapshot resolved from it.
/// Replaced as one unit on reload.
struct Instance<I> {
    image: I,
    info: ModuleInfo,
}

/// One reloadable module
pub struct Module<L: ImageLoader = NativeLoader> {
    loader: L,
    /// Resolved location of the module file on disk
    source: PathBuf,
    /// Location of the file actually opened
    path: PathBuf,
    userdata: *mut c_void,
    instance: Option<Instance<L::Image>>,
    reloads: u64,
    loaded_at: Instant,
}

impl Module<NativeLoader> {
    /// Load the module at `path`, calling its entry with [`ModuleOp::Load`].
    ///
    /// # Safety
    /// The file at `path`, and every later build reloaded from it, must be a
    /// module built against this ABI. `userdata` is handed to the module
    /// as-is on every lifecycle callback.
    pub unsafe fn load<P: AsRef<Path>>(path: P, userdata: *mut c_void) -> HotmodResult<Self> {
        unsafe { Self::load_with_options(path, userdata, LoadOptions::default()) }
    }

    /// Like [`Module::load`] with explicit load options.
    ///
    /// # Safety
    /// See [`Module::load`].
    pub unsafe fn load_with_options<P: AsRef<Path>>(
        path: P,
        userdata: *mut c_void,
        options: LoadOptions,
    ) -> HotmodResult<Self> {
        unsafe { Self::load_with(NativeLoader::new(options), path, userdata) }
    }
}

impl<L: ImageLoader> Module<L> {
    /// Load through a specific image loader.
    ///
    /// # Safety
    /// See [`Module::load`].
    pub unsafe fn load_with<P: AsRef<Path>>(
        mut loader: L,
        path: P,
        userdata: *mut c_void,
    ) -> HotmodResult<Self> {
        let requested = path.as_ref();
        let source = requested.canonicalize().map_err(|e| {
            HotmodError::InvalidPath {
                path: requested.to_path_buf(),
                source: e,
            }
            .recorded()
        })?;

        info!("Loading module: {:?}", source);
        let instance = unsafe { open_instance(&mut loader, &source) }?;
        let path = instance.image.path().to_path_buf();

        unsafe { instance.info.call(ModuleOp::Load, userdata) };

        Ok(Self {
            loader,
            source,
            path,
            userdata,
            instance: Some(instance),
            reloads: 0,
            loaded_at: Instant::now(),
        })
    }

    /// Swap in a fresh instance of the module, carrying persistent variables
    /// whose name and size are unchanged.
    pub fn reload(&mut self) -> HotmodResult<MigrationReport> {
        let start = Instant::now();
        let current = self.instance.take().ok_or_else(|| {
            HotmodError::Defunct {
                path: self.source.clone(),
            }
            .recorded()
        })?;

        info!("Reloading module: {:?}", self.source);

        // SAFETY: `current` is still open; the load contract covers its code.
        let snapshot = unsafe {
            current.info.call(ModuleOp::BeforeReload, self.userdata);
            StateSnapshot::capture(&current.info)
        };

        current.image.close()?;

        // SAFETY: same source file as the original load.
        let next = unsafe { open_instance(&mut self.loader, &self.source) }?;
        self.path = next.image.path().to_path_buf();

        let report = unsafe {
            let report = snapshot.restore(&next.info);
            next.info.call(ModuleOp::AfterReload, self.userdata);
            report
        };
        self.instance = Some(next);
        self.reloads += 1;
        self.loaded_at = Instant::now();

        info!(
            "Module {:?} reloaded in {:?} (carried: {}, reset: {}, dropped: {})",
            self.source,
            start.elapsed(),
            report.carried.len(),
            report.reset.len(),
            report.dropped.len()
        );

        Ok(report)
    }

    /// Call the entry with [`ModuleOp::Unload`] and release the library.
    pub fn unload(mut self) -> HotmodResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> HotmodResult<()> {
        let Some(instance) = self.instance.take() else {
            debug!("Module {:?} has no instance to unload", self.source);
            return Ok(());
        };

        info!("Unloading module: {:?}", self.source);
        unsafe { instance.info.call(ModuleOp::Unload, self.userdata) };
        instance.image.close()
    }

    /// Path of the loaded file (a temporary copy when shadow copying)
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolved path of the module file on disk
    pub fn source_path(&self) -> &Path {
        &self.source
    }

    /// The pointer passed at load time
    pub fn userdata(&self) -> *mut c_void {
        self.userdata
    }

    /// Number of successful reloads
    pub fn reload_count(&self) -> u64 {
        self.reloads
    }

    /// When the current instance was loaded
    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    /// Whether an instance is loaded; false after a failed reload
    pub fn is_loaded(&self) -> bool {
        self.instance.is_some()
    }

    /// Current values of the module's persistent variables; `None` when defunct
    pub fn snapshot(&self) -> Option<StateSnapshot> {
        // SAFETY: the instance is open for as long as it is held here
        self.instance
            .as_ref()
            .map(|instance| unsafe { StateSnapshot::capture(&instance.info) })
    }

    /// Get the image loader
    pub fn loader(&self) -> &L {
        &self.loader
    }
}

impl<L: ImageLoader> Drop for Module<L> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Failed to unload module {:?}: {}", self.source, e);
        }
    }
}

impl<L: ImageLoader> std::fmt::Debug for Module<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("source", &self.source)
            .field("path", &self.path)
            .field("userdata", &self.userdata)
            .field("loaded", &self.is_loaded())
            .field("reloads", &self.reloads)
            .finish()
    }
}

/// Open `source` and resolve its export, closing the image again on failure.
unsafe fn open_instance<L: ImageLoader>(
    loader: &mut L,
    source: &Path,
) -> HotmodResult<Instance<L::Image>> {
    let image = unsafe { loader.open(source) }?;

    let info = match unsafe { image.module_info() } {
        Ok(info) if info.abi_version == ABI_VERSION => info,
        Ok(info) => {
            let err = HotmodError::AbiMismatch {
                path: source.to_path_buf(),
                expected: ABI_VERSION,
                actual: info.abi_version,
            }
            .recorded();
            discard(image);
            return Err(err);
        }
        Err(e) => {
            discard(image);
            return Err(e);
        }
    };

    Ok(Instance { image, info })
}

fn discard<I: LoadedImage>(image: I) {
    if let Err(e) = image.close() {
        warn!("Failed to close rejected image: {}", e);
    }
}
