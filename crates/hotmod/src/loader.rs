//! Dynamic library loader
//!
//! Opens module images and resolves their well-known export. The native
//! loader wraps `libloading`; on platforms where the loader locks the source
//! file, a private temporary copy is opened instead so the original stays
//! replaceable.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hotmod_abi::{MODULE_INFO_SYMBOL, MODULE_INFO_SYMBOL_CSTR, ModuleInfo, ModuleInfoFn};
use libloading::{Library, Symbol};
use parking_lot::Mutex;
use tempfile::TempPath;
use tracing::{debug, warn};

use crate::config::LoadOptions;
use crate::error::{HotmodError, HotmodResult};

/// Platform file extension of dynamic libraries, without the dot
pub const DYLIB_EXTENSION: &str = std::env::consts::DLL_EXTENSION;

/// Platform file name for a library called `name` (`libname.so`, `name.dll`, ...)
pub fn library_filename(name: &str) -> OsString {
    libloading::library_filename(name)
}

/// Opens module images from disk
pub trait ImageLoader {
    /// The opened image
    type Image: LoadedImage;

    /// Open the module at `path`.
    ///
    /// # Safety
    /// Opening a library runs its initializers; the file must be a module
    /// built against this ABI.
    unsafe fn open(&mut self, path: &Path) -> HotmodResult<Self::Image>;
}

/// One opened module image
pub trait LoadedImage {
    /// Absolute path of the file actually opened (possibly a temporary copy)
    fn path(&self) -> &Path;

    /// Resolve the well-known export.
    ///
    /// # Safety
    /// Calls into the loaded module.
    unsafe fn module_info(&self) -> HotmodResult<ModuleInfo>;

    /// Release the image, removing any temporary copy.
    fn close(self) -> HotmodResult<()>;
}

/// `libloading`-backed loader
#[derive(Debug, Clone, Default)]
pub struct NativeLoader {
    options: LoadOptions,
}

impl NativeLoader {
    /// Create a loader with the given options
    pub fn new(options: LoadOptions) -> Self {
        Self { options }
    }

    /// Get the load options
    pub fn options(&self) -> &LoadOptions {
        &self.options
    }
}

impl ImageLoader for NativeLoader {
    type Image = NativeImage;

    unsafe fn open(&mut self, path: &Path) -> HotmodResult<NativeImage> {
        let shadow = if self.options.shadow_copy.enabled() {
            Some(shadow_copy(path)?)
        } else {
            None
        };
        let load_path = shadow.as_deref().unwrap_or(path).to_path_buf();

        debug!("Opening library {:?}", load_path);
        let library = unsafe { open_library(&load_path) }.map_err(|e| {
            HotmodError::LibraryOpen {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
            .recorded()
        })?;

        Ok(NativeImage {
            library,
            path: load_path,
            shadow,
        })
    }
}

/// A library opened by [`NativeLoader`]
#[derive(Debug)]
pub struct NativeImage {
    library: Library,
    path: PathBuf,
    shadow: Option<TempPath>,
}

impl NativeImage {
    /// Whether this image was opened from a temporary copy
    pub fn is_shadow_copy(&self) -> bool {
        self.shadow.is_some()
    }
}

impl LoadedImage for NativeImage {
    fn path(&self) -> &Path {
        &self.path
    }

    unsafe fn module_info(&self) -> HotmodResult<ModuleInfo> {
        let export: Symbol<ModuleInfoFn> =
            unsafe { self.library.get(MODULE_INFO_SYMBOL_CSTR) }.map_err(|e| {
                HotmodError::MissingExport {
                    path: self.path.clone(),
                    symbol: MODULE_INFO_SYMBOL,
                    reason: e.to_string(),
                }
                .recorded()
            })?;

        Ok(unsafe { export() })
    }

    fn close(self) -> HotmodResult<()> {
        let NativeImage {
            library,
            path,
            shadow,
        } = self;

        debug!("Closing library {:?}", path);
        let closed = library.close().map_err(|e| {
            HotmodError::LibraryClose {
                path: path.clone(),
                reason: e.to_string(),
            }
            .recorded()
        });

        // The copy can only be removed once the loader has let go of it
        if let Some(shadow) = shadow
            && let Err(e) = shadow.close()
        {
            warn!("Failed to remove temporary copy {:?}: {}", path, e);
        }

        closed
    }
}

/// A module build compiled into the host
pub type StaticBuild = fn() -> ModuleInfo;

#[derive(Default)]
struct StaticRegistry {
    builds: HashMap<PathBuf, StaticBuild>,
    open: usize,
}

/// Loader serving modules linked into the host binary.
///
/// Each path maps to the build currently installed for it; a reload picks up
/// whatever build is installed at that moment. Useful where hot reloading is
/// compiled out, and for exercising the lifecycle without a native library.
#[derive(Clone, Default)]
pub struct StaticLoader {
    registry: Arc<Mutex<StaticRegistry>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `build` as the current build for `path`
    pub fn install<P: AsRef<Path>>(&self, path: P, build: StaticBuild) {
        let key = static_key(path.as_ref());
        debug!("Installing static build for {:?}", key);
        self.registry.lock().builds.insert(key, build);
    }

    /// Remove the build for `path`; later opens of it fail
    pub fn remove<P: AsRef<Path>>(&self, path: P) -> bool {
        let key = static_key(path.as_ref());
        self.registry.lock().builds.remove(&key).is_some()
    }

    /// Number of images opened and not yet closed
    pub fn open_images(&self) -> usize {
        self.registry.lock().open
    }
}

impl std::fmt::Debug for StaticLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("StaticLoader")
            .field("builds", &registry.builds.keys().collect::<Vec<_>>())
            .field("open", &registry.open)
            .finish()
    }
}

fn static_key(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

impl ImageLoader for StaticLoader {
    type Image = StaticImage;

    unsafe fn open(&mut self, path: &Path) -> HotmodResult<StaticImage> {
        let key = static_key(path);
        let mut registry = self.registry.lock();
        let build = *registry.builds.get(&key).ok_or_else(|| {
            HotmodError::LibraryOpen {
                path: path.to_path_buf(),
                reason: "no static build installed".to_string(),
            }
            .recorded()
        })?;
        registry.open += 1;

        Ok(StaticImage {
            path: key,
            build,
            registry: self.registry.clone(),
        })
    }
}

/// An image opened by [`StaticLoader`]
pub struct StaticImage {
    path: PathBuf,
    build: StaticBuild,
    registry: Arc<Mutex<StaticRegistry>>,
}

impl LoadedImage for StaticImage {
    fn path(&self) -> &Path {
        &self.path
    }

    unsafe fn module_info(&self) -> HotmodResult<ModuleInfo> {
        Ok((self.build)())
    }

    fn close(self) -> HotmodResult<()> {
        let mut registry = self.registry.lock();
        registry.open = registry.open.saturating_sub(1);
        Ok(())
    }
}

#[cfg(unix)]
unsafe fn open_library(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_LOCAL, RTLD_NOW};

    unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_LOCAL) }.map(Library::from)
}

#[cfg(not(unix))]
unsafe fn open_library(path: &Path) -> Result<Library, libloading::Error> {
    unsafe { Library::new(path) }
}

/// Copy `source` next to itself under a unique temporary name.
fn shadow_copy(source: &Path) -> HotmodResult<TempPath> {
    let fail = |source_err: std::io::Error| {
        HotmodError::ShadowCopy {
            path: source.to_path_buf(),
            source: source_err,
        }
        .recorded()
    };

    let dir = source.parent().unwrap_or_else(|| Path::new("."));
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module".to_string());
    let suffix = match source.extension() {
        Some(ext) => format!(".{}", ext.to_string_lossy()),
        None => format!(".{}", DYLIB_EXTENSION),
    };

    let temp = tempfile::Builder::new()
        .prefix(&format!("{}.", stem))
        .suffix(&suffix)
        .tempfile_in(dir)
        .map_err(fail)?
        .into_temp_path();

    std::fs::copy(source, &temp).map_err(fail)?;
    debug!("Created temporary copy {:?} of {:?}", temp, source);

    Ok(temp)
}
