//! Hot-reloadable native modules
//!
//! Provides:
//! - Module lifecycle (load, reload, unload) with entry callbacks
//! - Persistent variable migration across reloads, matched by name and size
//! - Directory-watch multiplexing with per-file change detection
//! - Shadow copies for platforms that lock loaded libraries
//!
//! ```no_run
//! use hotmod::{Module, Monitor};
//!
//! # fn main() -> hotmod::HotmodResult<()> {
//! let module = unsafe { Module::load("target/debug/libhotmod_demo.so", std::ptr::null_mut()) }?;
//! let mut monitor = Monitor::new(module)?;
//! loop {
//!     if monitor.check()? {
//!         println!("reloaded");
//!     }
//!     # break;
//! }
//! monitor.unmonitor().unload()
//! # }
//! ```

pub mod config;
pub mod error;
pub mod loader;
pub mod module;
pub mod monitor;
pub mod state;
pub mod watch;

pub use hotmod_abi as abi;
pub use hotmod_abi::{ModuleInfo, ModuleOp, Persistent, export_module, module_info, persistent};

pub use config::{HotmodConfig, LoadOptions, ShadowCopy, WatchOptions};
pub use error::{HotmodError, HotmodResult, OrAbort, last_error};
pub use loader::{
    DYLIB_EXTENSION, ImageLoader, LoadedImage, NativeImage, NativeLoader, StaticBuild,
    StaticImage, StaticLoader, library_filename,
};
pub use module::Module;
pub use monitor::Monitor;
pub use state::{MigrationReport, StateSnapshot};
pub use watch::WatchRoot;
