//! Persistent variable migration
//!
//! Captures the bytes of every persistent variable of the outgoing instance
//! into a host-owned buffer, then copies them into the incoming instance for
//! each variable whose name and size are unchanged.

use std::ops::Range;

use hotmod_abi::{ModuleInfo, VarInfo};
use tracing::debug;

/// One captured variable: ranges into the snapshot buffer
#[derive(Debug, Clone)]
struct SavedVar {
    name: Range<usize>,
    value: Range<usize>,
}

/// Host-owned copy of a module instance's persistent variables.
///
/// The buffer is allocated by the host, not the module, since the module's
/// allocator goes away with the old instance.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    buffer: Vec<u8>,
    entries: Vec<SavedVar>,
}

impl StateSnapshot {
    /// Capture every persistent variable exposed by `info`.
    ///
    /// # Safety
    /// The instance that produced `info` must still be loaded.
    pub unsafe fn capture(info: &ModuleInfo) -> Self {
        let total: usize = unsafe { info.vars() }
            .map(|var| unsafe { var.name() }.len() + var.size())
            .sum();

        let mut buffer = Vec::with_capacity(total);
        let mut entries = Vec::new();

        for var in unsafe { info.vars() } {
            let name = unsafe { var.name() };
            let name_start = buffer.len();
            buffer.extend_from_slice(name);
            let value_start = buffer.len();
            buffer.extend_from_slice(unsafe { value_bytes(var) });

            entries.push(SavedVar {
                name: name_start..value_start,
                value: value_start..buffer.len(),
            });
        }

        debug!(
            "Captured {} persistent variables ({} bytes)",
            entries.len(),
            buffer.len()
        );

        Self { buffer, entries }
    }

    /// Number of captured variables
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was captured
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes held, names included
    pub fn byte_len(&self) -> usize {
        self.buffer.len()
    }

    /// Captured variable names
    pub fn names(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.entries.iter().map(|e| &self.buffer[e.name.clone()])
    }

    /// Captured bytes of the variable matching `name` and `size`
    pub fn get(&self, name: &[u8], size: usize) -> Option<&[u8]> {
        self.position(name, size)
            .map(|idx| &self.buffer[self.entries[idx].value.clone()])
    }

    fn position(&self, name: &[u8], size: usize) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.value.len() == size && &self.buffer[e.name.clone()] == name
        })
    }

    /// Copy captured bytes into every matching variable of `info`.
    ///
    /// Variables without a match keep their own initial value.
    ///
    /// # Safety
    /// The instance that produced `info` must be loaded and not running
    /// concurrently.
    pub unsafe fn restore(&self, info: &ModuleInfo) -> MigrationReport {
        let mut report = MigrationReport::default();
        let mut used = vec![false; self.entries.len()];

        for var in unsafe { info.vars() } {
            let name = unsafe { var.name() };
            let label = String::from_utf8_lossy(name).into_owned();

            match self.position(name, var.size()) {
                Some(idx) => {
                    let bytes = &self.buffer[self.entries[idx].value.clone()];
                    unsafe {
                        std::ptr::copy_nonoverlapping(bytes.as_ptr(), var.addr(), bytes.len());
                    }
                    used[idx] = true;
                    debug!("Carried persistent variable {} ({} bytes)", label, bytes.len());
                    report.carried.push(label);
                }
                None => {
                    debug!("Persistent variable {} starts fresh", label);
                    report.reset.push(label);
                }
            }
        }

        for (entry, used) in self.entries.iter().zip(used) {
            if !used {
                report
                    .dropped
                    .push(String::from_utf8_lossy(&self.buffer[entry.name.clone()]).into_owned());
            }
        }

        report
    }
}

unsafe fn value_bytes(var: &VarInfo) -> &[u8] {
    if var.size() == 0 {
        return &[];
    }
    unsafe { std::slice::from_raw_parts(var.addr(), var.size()) }
}

/// What happened to each persistent variable during a reload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Present in both instances with the same size; value carried over
    pub carried: Vec<String>,
    /// Present only in the new instance, or resized; keeps its initializer
    pub reset: Vec<String>,
    /// Present only in the old instance; value discarded
    pub dropped: Vec<String>,
}

impl MigrationReport {
    /// Whether `name` kept its value
    pub fn was_carried(&self, name: &str) -> bool {
        self.carried.iter().any(|n| n == name)
    }
}
