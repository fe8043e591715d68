//! Change detection against real filesystem notifications.

use std::ffi::c_void;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime};

use hotmod::{
    Module, ModuleInfo, ModuleOp, Monitor, StaticLoader, WatchOptions, WatchRoot, module_info,
};

const SETTLE: Duration = Duration::from_millis(300);

fn noop(_op: ModuleOp, _userdata: *mut c_void) {}

fn build() -> ModuleInfo {
    module_info!(entry = noop)
}

/// Poll `f` until it returns true or five seconds pass.
fn eventually(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        sleep(Duration::from_millis(20));
    }
    false
}

fn module_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"v1").unwrap();
    path
}

fn load(loader: &StaticLoader, path: &Path) -> Module<StaticLoader> {
    loader.install(path, build);
    unsafe { Module::load_with(loader.clone(), path, std::ptr::null_mut()) }.unwrap()
}

fn monitor(root: &Arc<WatchRoot>, loader: &StaticLoader, path: &Path) -> Monitor<StaticLoader> {
    Monitor::with_root(load(loader, path), root.clone()).unwrap()
}

#[test]
fn test_unrelated_files_never_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let path = module_file(dir.path(), "libwatched.so");
    let root = Arc::new(WatchRoot::default());
    let loader = StaticLoader::new();
    let mut mon = monitor(&root, &loader, &path);

    let start = mon.root().generation();
    let other = dir.path().join("notes.txt");
    for i in 0..3 {
        std::fs::write(&other, format!("edit {i}")).unwrap();
    }

    // events for the other file arrive and are drained, but never match
    assert!(eventually(|| {
        assert!(!mon.should_reload());
        mon.root().generation() > start
    }));
    sleep(SETTLE);
    assert!(!mon.should_reload());
}

#[test]
fn test_burst_of_writes_reports_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = module_file(dir.path(), "libburst.so");
    let root = Arc::new(WatchRoot::default());
    let loader = StaticLoader::new();
    let mut mon = monitor(&root, &loader, &path);

    assert!(!mon.should_reload());
    for i in 0..3 {
        std::fs::write(&path, format!("build {i}")).unwrap();
    }
    sleep(SETTLE);

    assert!(eventually(|| mon.should_reload()));
    assert!(!mon.should_reload());
    sleep(SETTLE);
    assert!(!mon.should_reload());
}

#[test]
fn test_check_reloads_module() {
    let dir = tempfile::tempdir().unwrap();
    let path = module_file(dir.path(), "libcheck.so");
    let root = Arc::new(WatchRoot::default());
    let loader = StaticLoader::new();
    let mut mon = monitor(&root, &loader, &path);

    assert!(!mon.check().unwrap());
    assert_eq!(mon.module().reload_count(), 0);

    std::fs::write(&path, b"v2").unwrap();
    assert!(eventually(|| mon.check().unwrap()));
    assert_eq!(mon.module().reload_count(), 1);

    let module = mon.unmonitor();
    assert!(root.watched_directories().is_empty());
    module.unload().unwrap();
    assert_eq!(loader.open_images(), 0);
}

#[test]
fn test_shared_directory_is_watched_once() {
    let dir = tempfile::tempdir().unwrap();
    let a_path = module_file(dir.path(), "liba.so");
    let b_path = module_file(dir.path(), "libb.so");
    let root = Arc::new(WatchRoot::default());
    let loader = StaticLoader::new();

    let mut a = monitor(&root, &loader, &a_path);
    let mut b = monitor(&root, &loader, &b_path);
    assert_eq!(root.dirmon_count(), 1);
    assert_eq!(root.watchers_of(dir.path()), 2);
    assert_eq!(
        root.watched_directories(),
        vec![dir.path().canonicalize().unwrap()]
    );

    std::fs::write(&a_path, b"v2").unwrap();
    sleep(SETTLE);
    assert!(eventually(|| a.should_reload()));
    // b polls after a already drained the same events
    assert!(!b.should_reload());

    std::fs::write(&b_path, b"v2").unwrap();
    sleep(SETTLE);
    assert!(eventually(|| b.should_reload()));
    assert!(!a.should_reload());

    drop(a.unmonitor());
    assert_eq!(root.dirmon_count(), 1);
    assert_eq!(root.watchers_of(dir.path()), 1);
    assert!(root.has_channel());

    drop(b);
    assert_eq!(root.dirmon_count(), 0);
    assert!(!root.has_channel());
}

#[test]
fn test_monitors_in_separate_directories() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let a_path = module_file(first.path(), "libsame.so");
    let b_path = module_file(second.path(), "libsame.so");
    let root = Arc::new(WatchRoot::default());
    let loader = StaticLoader::new();

    let mut a = monitor(&root, &loader, &a_path);
    let mut b = monitor(&root, &loader, &b_path);
    assert_eq!(root.dirmon_count(), 2);

    // same file name, different directory
    std::fs::write(&b_path, b"v2").unwrap();
    sleep(SETTLE);
    assert!(eventually(|| b.should_reload()));
    assert!(!a.should_reload());
}

#[test]
fn test_poll_backend_detects_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = module_file(dir.path(), "libpolled.so");
    let root = Arc::new(WatchRoot::new(
        WatchOptions::new().with_poll_interval(Duration::from_millis(50)),
    ));
    let loader = StaticLoader::new();
    let mut mon = monitor(&root, &loader, &path);

    std::fs::write(&path, b"rebuilt").unwrap();
    // move the timestamp well past the first scan
    File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(10))
        .unwrap();

    assert!(eventually(|| mon.should_reload()));
}
