//! Demo module
//!
//! Keeps a counter across rebuilds and publishes three commands through the
//! userdata table the host passes in. Build it as a `cdylib`, load it with
//! `hotmod`, edit `up`/`down`, rebuild, and the counter survives.

use std::ffi::c_void;

use hotmod_abi::{ModuleOp, export_module, persistent};

/// Command table shared with the host through userdata.
///
/// The module refills it on every lifecycle callback so the host never calls
/// into a closed instance; it is cleared on unload.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Commands {
    pub up: Option<extern "C" fn()>,
    pub down: Option<extern "C" fn()>,
    pub show: Option<extern "C" fn()>,
}

impl Commands {
    /// Userdata pointer for `self`
    pub fn as_userdata(&mut self) -> *mut c_void {
        (self as *mut Self).cast()
    }
}

persistent! {
    static COUNTER: i32 = 0;
}

extern "C" fn up() {
    // SAFETY: the host calls commands from one thread only
    unsafe { COUNTER.update(|c| c + 200) };
    show();
}

extern "C" fn down() {
    unsafe { COUNTER.update(|c| c - 100) };
    show();
}

extern "C" fn show() {
    println!("Counter = {}", unsafe { COUNTER.get() });
}

/// Current counter value
pub fn counter() -> i32 {
    unsafe { COUNTER.get() }
}

fn entry(op: ModuleOp, userdata: *mut c_void) {
    match op {
        ModuleOp::Load => println!("Loading"),
        ModuleOp::Unload => println!("Unloading"),
        ModuleOp::BeforeReload => println!("Begin reload"),
        ModuleOp::AfterReload => println!("End reload"),
    }

    let table = userdata.cast::<Commands>();
    if table.is_null() {
        return;
    }
    let commands = match op {
        ModuleOp::Unload | ModuleOp::BeforeReload => Commands::default(),
        ModuleOp::Load | ModuleOp::AfterReload => Commands {
            up: Some(up),
            down: Some(down),
            show: Some(show),
        },
    };
    // SAFETY: a non-null userdata is always a `Commands` owned by the host
    unsafe { table.write(commands) };
}

export_module!(entry = entry, persistent = [COUNTER]);
