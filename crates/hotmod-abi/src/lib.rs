//! Hotmod ABI
//!
//! The contract between a reloadable module and the host that loads it:
//! - `ModuleOp`: lifecycle notifications delivered to the module's entry callback
//! - `VarInfo`: descriptor of one persistent variable (name, address, size)
//! - `ModuleInfo`: the structure behind the module's single well-known export
//! - `Persistent<T>`: storage cell for a variable whose bytes survive a reload
//!
//! A module declares its persistent variables with [`persistent!`] and exposes
//! itself with [`export_module!`]:
//!
//! ```rust,ignore
//! use std::ffi::c_void;
//! use hotmod_abi::{ModuleOp, export_module, persistent};
//!
//! persistent! {
//!     static COUNTER: i32 = 0;
//! }
//!
//! fn entry(op: ModuleOp, userdata: *mut c_void) {
//!     // wire callbacks into `userdata`, react to `op`
//! }
//!
//! export_module!(entry = entry, persistent = [COUNTER]);
//! ```

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::fmt;

/// Version of the export layout. Bumped whenever `ModuleInfo` or `VarInfo` change shape.
pub const ABI_VERSION: u32 = 1;

/// Name of the well-known export every module must provide.
pub const MODULE_INFO_SYMBOL: &str = "hotmod_module_info";

/// Null-terminated form of [`MODULE_INFO_SYMBOL`] for symbol lookup.
pub const MODULE_INFO_SYMBOL_CSTR: &[u8] = b"hotmod_module_info\0";

/// The operation being executed on a module
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleOp {
    /// The module is being loaded for the first time.
    Load,
    /// The module is being unloaded.
    Unload,
    /// Observed by the **old** instance right before a reload.
    BeforeReload,
    /// Observed by the **new** instance right after a reload.
    AfterReload,
}

impl fmt::Display for ModuleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleOp::Load => write!(f, "Load"),
            ModuleOp::Unload => write!(f, "Unload"),
            ModuleOp::BeforeReload => write!(f, "BeforeReload"),
            ModuleOp::AfterReload => write!(f, "AfterReload"),
        }
    }
}

/// Entry callback signature.
///
/// `userdata` is the pointer the host passed at load time and stays the same
/// object across every reload.
pub type EntryFn = unsafe extern "C" fn(op: ModuleOp, userdata: *mut c_void);

/// Signature of the well-known export.
pub type ModuleInfoFn = unsafe extern "C" fn() -> ModuleInfo;

/// Descriptor of a persistent variable inside one loaded instance
#[repr(C)]
#[derive(Debug)]
pub struct VarInfo {
    name: *const u8,
    name_len: usize,
    addr: *mut u8,
    size: usize,
}

// Descriptors only carry addresses; all access goes through the unsafe
// accessors below.
unsafe impl Sync for VarInfo {}
unsafe impl Send for VarInfo {}

impl VarInfo {
    /// Describe a persistent cell under `name`.
    pub const fn of<T: Copy>(name: &'static str, cell: &'static Persistent<T>) -> Self {
        Self {
            name: name.as_ptr(),
            name_len: name.len(),
            addr: cell.as_ptr().cast::<u8>(),
            size: size_of::<T>(),
        }
    }

    /// Build a descriptor from raw parts.
    ///
    /// # Safety
    /// `name` must point to `name_len` readable bytes and `addr` to `size`
    /// writable bytes for as long as the descriptor is used.
    pub const unsafe fn from_raw_parts(
        name: *const u8,
        name_len: usize,
        addr: *mut u8,
        size: usize,
    ) -> Self {
        Self {
            name,
            name_len,
            addr,
            size,
        }
    }

    /// Variable name bytes.
    ///
    /// # Safety
    /// The instance that owns this descriptor must still be loaded.
    pub unsafe fn name(&self) -> &[u8] {
        if self.name_len == 0 || self.name.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.name, self.name_len) }
    }

    /// Address of the variable inside the loaded instance
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    /// Size of the variable in bytes
    pub fn size(&self) -> usize {
        self.size
    }
}

/// The structure returned by a module's well-known export
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ModuleInfo {
    /// Must equal [`ABI_VERSION`] for the host to accept the module.
    pub abi_version: u32,
    /// Lifecycle callback
    pub entry: EntryFn,
    /// First slot of the descriptor array
    pub vars_begin: *const *const VarInfo,
    /// One past the last slot of the descriptor array
    pub vars_end: *const *const VarInfo,
}

impl ModuleInfo {
    /// Build module info over a static descriptor table.
    pub const fn new(entry: EntryFn, vars: &'static [&'static VarInfo]) -> Self {
        let range = vars.as_ptr_range();
        Self {
            abi_version: ABI_VERSION,
            entry,
            vars_begin: range.start.cast::<*const VarInfo>(),
            vars_end: range.end.cast::<*const VarInfo>(),
        }
    }

    /// Walk the descriptor array from begin to end, skipping null slots.
    ///
    /// # Safety
    /// The instance that produced this info must still be loaded and its
    /// begin/end pointers must bound a single array.
    pub unsafe fn vars(&self) -> impl Iterator<Item = &VarInfo> + '_ {
        let slots: &[*const VarInfo] = if self.vars_begin.is_null() || self.vars_end.is_null() {
            &[]
        } else {
            let len = unsafe { self.vars_end.offset_from(self.vars_begin) };
            if len <= 0 {
                &[]
            } else {
                unsafe { std::slice::from_raw_parts(self.vars_begin, len as usize) }
            }
        };
        slots.iter().filter_map(|slot| unsafe { slot.as_ref() })
    }

    /// Invoke the entry callback.
    ///
    /// # Safety
    /// The instance that produced this info must still be loaded.
    pub unsafe fn call(&self, op: ModuleOp, userdata: *mut c_void) {
        unsafe { (self.entry)(op, userdata) }
    }
}

/// Storage for a module global whose bytes are carried across reloads.
///
/// Only a shallow byte copy is made when migrating, so `T` should not hold
/// pointers into module memory or into a module-private allocator.
#[repr(transparent)]
pub struct Persistent<T: Copy>(UnsafeCell<T>);

// Module code is driven from the host thread that owns the `Module`.
unsafe impl<T: Copy + Send> Sync for Persistent<T> {}

impl<T: Copy> Persistent<T> {
    /// Create a cell holding its static initial value
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Raw address of the value
    pub const fn as_ptr(&self) -> *mut T {
        self.0.get()
    }

    /// Read the current value.
    ///
    /// # Safety
    /// No other thread may be writing the variable concurrently.
    pub unsafe fn get(&self) -> T {
        unsafe { *self.0.get() }
    }

    /// Overwrite the value.
    ///
    /// # Safety
    /// No other thread may be accessing the variable concurrently.
    pub unsafe fn set(&self, value: T) {
        unsafe { *self.0.get() = value }
    }

    /// Apply `f` to the value and store the result, returning it.
    ///
    /// # Safety
    /// No other thread may be accessing the variable concurrently.
    pub unsafe fn update(&self, f: impl FnOnce(T) -> T) -> T {
        unsafe {
            let next = f(*self.0.get());
            *self.0.get() = next;
            next
        }
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for Persistent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persistent")
            .field("size", &size_of::<T>())
            .finish_non_exhaustive()
    }
}

/// Declare one or more persistent variables.
///
/// ```rust,ignore
/// hotmod_abi::persistent! {
///     static COUNTER: i32 = 0;
///     pub static SCORE: (u32, u32) = (0, 0);
/// }
/// ```
#[macro_export]
macro_rules! persistent {
    ($($(#[$meta:meta])* $vis:vis static $name:ident : $ty:ty = $init:expr;)+) => {
        $(
            $(#[$meta])*
            $vis static $name: $crate::Persistent<$ty> = $crate::Persistent::new($init);
        )+
    };
}

/// Build a [`ModuleInfo`] for `entry` and a list of persistent variables.
///
/// The descriptor table is a `static` laid out at compile time; each
/// variable is registered under its identifier.
#[macro_export]
macro_rules! module_info {
    (entry = $entry:path $(, persistent = [$($var:ident),* $(,)?])? $(,)?) => {{
        extern "C" fn __hotmod_entry(
            op: $crate::ModuleOp,
            userdata: *mut ::core::ffi::c_void,
        ) {
            $entry(op, userdata)
        }

        static __HOTMOD_VARS: &[&$crate::VarInfo] = &[
            $($(&$crate::VarInfo::of(::core::stringify!($var), &$var),)*)?
        ];

        $crate::ModuleInfo::new(__hotmod_entry, __HOTMOD_VARS)
    }};
}

/// Define the module's well-known export.
///
/// Must be invoked exactly once per module binary.
#[macro_export]
macro_rules! export_module {
    ($($args:tt)*) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn hotmod_module_info() -> $crate::ModuleInfo {
            $crate::module_info!($($args)*)
        }
    };
}
