//! Lifecycle against the real `hotmod-demo` shared library.
//!
//! The demo is built once into its own target directory so the nested cargo
//! never waits on the lock held by the outer test run.

#![allow(deprecated)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use hotmod::{HotmodError, LoadOptions, Module, ShadowCopy, library_filename};
use hotmod_demo::Commands;
use predicates::str::contains;
use tempfile::tempdir;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Path of the freshly built demo library
fn demo_library() -> &'static Path {
    static BUILT: OnceLock<PathBuf> = OnceLock::new();
    BUILT.get_or_init(|| {
        let root = workspace_root();
        let target = root.join("target").join("native-tests");
        let output = Command::new(env!("CARGO"))
            .args(["build", "-p", "hotmod-demo", "--manifest-path"])
            .arg(root.join("Cargo.toml"))
            .arg("--target-dir")
            .arg(&target)
            .output()
            .expect("run cargo");
        assert!(
            output.status.success(),
            "building hotmod-demo failed:\n{}",
            String::from_utf8_lossy(&output.stderr)
        );
        let library = target.join("debug").join(library_filename("hotmod_demo"));
        assert!(library.exists(), "missing {}", library.display());
        library
    })
}

/// Copy the demo into `dir`; every copy is a distinct file, so a distinct instance
fn install_demo(dir: &Path) -> PathBuf {
    let path = dir.join(library_filename("hotmod_demo"));
    std::fs::copy(demo_library(), &path).expect("copy demo");
    path
}

/// Replace `path` the way a linker does: write a sibling, then rename over it
fn replace_by_rename(path: &Path) {
    let staged = path.with_extension("new");
    std::fs::copy(demo_library(), &staged).expect("stage rebuild");
    std::fs::rename(&staged, path).expect("rename rebuild");
}

fn counter(module: &Module) -> i32 {
    let snapshot = module.snapshot().expect("module is loaded");
    let bytes = snapshot.get(b"COUNTER", 4).expect("COUNTER exported");
    i32::from_ne_bytes(bytes.try_into().expect("four bytes"))
}

fn files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .expect("read dir")
        .map(|entry| entry.expect("dir entry").path())
        .collect();
    files.sort();
    files
}

fn reload_carries_counter(shadow_copy: ShadowCopy) {
    let dir = tempdir().expect("tempdir");
    let source = install_demo(dir.path());
    let options = LoadOptions::new().with_shadow_copy(shadow_copy);

    let mut commands = Commands::default();
    let mut module =
        unsafe { Module::load_with_options(&source, commands.as_userdata(), options) }
            .expect("load demo");
    assert_eq!(module.source_path(), source.canonicalize().unwrap());
    assert_eq!(counter(&module), 0);

    (commands.up.expect("up published"))();
    assert_eq!(counter(&module), 200);

    replace_by_rename(&source);
    let report = module.reload().expect("reload demo");
    assert!(report.was_carried("COUNTER"));
    assert!(report.reset.is_empty());
    assert_eq!(module.reload_count(), 1);
    assert_eq!(counter(&module), 200);

    // the table now points into the new instance
    (commands.up.expect("up republished"))();
    (commands.down.expect("down republished"))();
    assert_eq!(counter(&module), 300);

    module.unload().expect("unload demo");
    assert!(commands.up.is_none());
    assert_eq!(files_in(dir.path()), vec![source]);
}

#[test]
fn reload_in_place_carries_counter() {
    reload_carries_counter(ShadowCopy::Never);
}

#[test]
fn reload_from_shadow_copy_carries_counter() {
    reload_carries_counter(ShadowCopy::Always);
}

#[test]
fn shadow_copy_is_opened_and_removed() {
    let dir = tempdir().expect("tempdir");
    let source = install_demo(dir.path());
    let options = LoadOptions::new().with_shadow_copy(ShadowCopy::Always);

    let mut module = unsafe {
        Module::load_with_options(&source, std::ptr::null_mut(), options)
    }
    .expect("load demo");
    let first = module.path().to_path_buf();
    assert_ne!(first, module.source_path());
    assert_eq!(first.parent(), module.source_path().parent());
    assert!(first.exists());

    replace_by_rename(&source);
    module.reload().expect("reload demo");
    let second = module.path().to_path_buf();
    assert_ne!(second, first);
    assert!(!first.exists());
    assert!(second.exists());
    assert_eq!(files_in(dir.path()).len(), 2);

    module.unload().expect("unload demo");
    assert!(!second.exists());
    assert_eq!(files_in(dir.path()), vec![source]);
}

/// A shared library mapped into this process that is not a module
#[cfg(target_os = "linux")]
fn foreign_library() -> Option<PathBuf> {
    let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
    let libraries: Vec<&str> = maps
        .lines()
        .filter_map(|line| line.split_whitespace().nth(5))
        .filter(|path| path.starts_with('/') && path.contains(".so"))
        .collect();
    libraries
        .iter()
        .find(|path| path.contains("/libc.so") || path.contains("/libc-"))
        .or_else(|| libraries.first())
        .map(PathBuf::from)
}

#[cfg(target_os = "linux")]
#[test]
fn library_without_module_info_is_rejected() {
    let Some(library) = foreign_library() else {
        return;
    };
    let options = LoadOptions::new().with_shadow_copy(ShadowCopy::Never);

    let err = unsafe { Module::load_with_options(&library, std::ptr::null_mut(), options) }
        .unwrap_err();
    assert!(
        matches!(err, HotmodError::MissingExport { symbol, .. } if symbol == "hotmod_module_info"),
        "unexpected error: {err}"
    );
}

#[test]
fn host_commands_print_counter() {
    let dir = tempdir().expect("tempdir");
    let source = install_demo(dir.path());

    assert_cmd::Command::cargo_bin("hotmod")
        .expect("hotmod bin")
        .arg(&source)
        .arg("--no-watch")
        .env_remove("HOTMOD_CONFIG")
        .write_stdin("up\ndown\nshow\n")
        .assert()
        .success()
        .stdout(contains("Loading"))
        .stdout(contains("Counter = 200"))
        .stdout(contains("Counter = 100"))
        .stdout(contains("Unloading"));
}
