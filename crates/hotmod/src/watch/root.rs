//! Process-wide watch root
//!
//! Owns the single notification channel and the set of dirmons. The channel
//! exists exactly while at least one directory is watched. Events are only
//! consumed when a monitor asks; nothing runs in the background besides the
//! backend's own thread.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, OnceLock};

use notify::event::{AccessKind, AccessMode, MetadataKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, PollWatcher, RecommendedWatcher, Watcher};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::dirmon::{Dirmon, MonitorId};
use crate::config::WatchOptions;
use crate::error::HotmodResult;

static GLOBAL: OnceLock<Arc<WatchRoot>> = OnceLock::new();

/// Which notify backend feeds the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Native,
    Poll,
}

impl Backend {
    /// Whether the backend reports the end of a write separately from the
    /// writes themselves (inotify's close-write)
    fn reports_write_completion(self) -> bool {
        self == Backend::Native && cfg!(any(target_os = "linux", target_os = "android"))
    }
}

pub(crate) struct Channel {
    pub(crate) watcher: Box<dyn Watcher + Send>,
    events: Receiver<notify::Result<Event>>,
    backend: Backend,
    /// Set once the backend hung up; nothing more will arrive
    disconnected: bool,
}

pub(crate) struct RootState {
    pub(crate) channel: Option<Channel>,
    pub(crate) dirmons: HashMap<PathBuf, Dirmon>,
    generation: u64,
    next_id: MonitorId,
    options: WatchOptions,
}

impl RootState {
    pub(crate) fn channel_or_open(&mut self) -> notify::Result<&mut Channel> {
        let channel = match self.channel.take() {
            Some(channel) => channel,
            None => open_channel(&self.options)?,
        };
        Ok(self.channel.insert(channel))
    }

    pub(crate) fn close_channel_if_idle(&mut self) {
        if self.dirmons.is_empty() && self.channel.take().is_some() {
            info!("Closed watch channel");
        }
    }

    /// Consume every pending event and bump the matching subscriptions.
    ///
    /// Returns the number of subscriptions bumped.
    fn drain_and_dispatch(&mut self) -> usize {
        let Some(channel) = self.channel.as_mut() else {
            return 0;
        };
        if channel.disconnected {
            return 0;
        }
        let backend = channel.backend;

        let mut pending = Vec::new();
        let mut observed = 0usize;
        loop {
            match channel.events.try_recv() {
                Ok(Ok(event)) => {
                    observed += 1;
                    pending.push(event);
                }
                Ok(Err(e)) => {
                    observed += 1;
                    warn!("Watch backend error: {}", e);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("Watch backend disconnected; no further changes will be seen");
                    channel.disconnected = true;
                    break;
                }
            }
        }

        if observed == 0 {
            return 0;
        }
        self.generation += 1;

        let mut matched = 0;
        for event in pending.iter().filter(|e| is_change(&e.kind, backend)) {
            for path in changed_paths(event) {
                matched += self.dispatch(path);
            }
        }
        debug!(
            "Drained {} watch events, {} subscriptions bumped (generation {})",
            observed, matched, self.generation
        );
        matched
    }

    fn dispatch(&mut self, path: &Path) -> usize {
        let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
            return 0;
        };
        match self.dirmons.get_mut(dir) {
            Some(dirmon) => dirmon.bump(name),
            None => 0,
        }
    }

    fn dirmon(&self, dir: &Path) -> Option<&Dirmon> {
        self.dirmons.get(dir)
    }
}

fn open_channel(options: &WatchOptions) -> notify::Result<Channel> {
    let (tx, events) = mpsc::channel();
    let (watcher, backend): (Box<dyn Watcher + Send>, Backend) = match options.poll_interval() {
        Some(interval) => {
            let config = notify::Config::default().with_poll_interval(interval);
            (Box::new(PollWatcher::new(tx, config)?), Backend::Poll)
        }
        None => (
            Box::new(RecommendedWatcher::new(tx, notify::Config::default())?),
            Backend::Native,
        ),
    };
    info!("Opened watch channel ({:?} backend)", backend);

    Ok(Channel {
        watcher,
        events,
        backend,
        disconnected: false,
    })
}

/// Whether an event means a file finished changing.
///
/// Plain data writes are ignored where the backend also reports the end of
/// the write, so a multi-chunk rewrite counts once.
fn is_change(kind: &EventKind, backend: Backend) -> bool {
    match kind {
        EventKind::Create(_) => true,
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        EventKind::Modify(ModifyKind::Name(
            RenameMode::To | RenameMode::Both | RenameMode::Any,
        )) => true,
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => {
            !backend.reports_write_completion()
        }
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime)) => {
            backend == Backend::Poll
        }
        _ => false,
    }
}

/// Paths an event changed; a paired rename only changed its destination
fn changed_paths(event: &Event) -> &[PathBuf] {
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() > 1 => {
            &event.paths[event.paths.len() - 1..]
        }
        _ => &event.paths,
    }
}

/// Registration returned by [`WatchRoot::subscribe`]
#[derive(Debug, Clone)]
pub(crate) struct Subscribed {
    pub(crate) dir: PathBuf,
    pub(crate) id: MonitorId,
}

/// Directory watch multiplexer shared by every monitor of a process.
///
/// Most hosts use [`WatchRoot::global`]; tests and embedders needing
/// isolation create their own with [`WatchRoot::new`].
pub struct WatchRoot {
    state: Mutex<RootState>,
}

impl WatchRoot {
    pub fn new(options: WatchOptions) -> Self {
        Self {
            state: Mutex::new(RootState {
                channel: None,
                dirmons: HashMap::new(),
                generation: 0,
                next_id: 1,
                options,
            }),
        }
    }

    /// The process-wide root, created with default options on first use
    pub fn global() -> Arc<WatchRoot> {
        GLOBAL
            .get_or_init(|| Arc::new(WatchRoot::new(WatchOptions::default())))
            .clone()
    }

    /// Create the process-wide root with `options`.
    ///
    /// Returns false if it already exists; the existing root is kept.
    pub fn init_global(options: WatchOptions) -> bool {
        let created = GLOBAL.set(Arc::new(WatchRoot::new(options))).is_ok();
        if !created {
            warn!("Global watch root already initialized; options ignored");
        }
        created
    }

    /// Watch `file_name` inside `dir`.
    pub(crate) fn subscribe(&self, dir: &Path, file_name: OsString) -> HotmodResult<Subscribed> {
        let mut state = self.state.lock();
        // Events already queued predate this subscription
        state.drain_and_dispatch();

        let dir = state.acquire(dir)?;
        let id = state.next_id;
        state.next_id += 1;
        if let Some(dirmon) = state.dirmons.get_mut(&dir) {
            dirmon.attach(id, file_name);
        }
        debug!("Subscription {} on {:?}", id, dir);

        Ok(Subscribed { dir, id })
    }

    pub(crate) fn unsubscribe(&self, subscribed: &Subscribed) {
        let mut state = self.state.lock();
        if let Some(dirmon) = state.dirmons.get_mut(&subscribed.dir) {
            dirmon.detach(subscribed.id);
        }
        state.release(&subscribed.dir);
    }

    /// Latest change version of a subscription.
    ///
    /// Drains the channel only if nobody has drained it since `seen_generation`
    /// was last updated, so each monitor polling in turn reuses the events the
    /// first one dispatched.
    pub(crate) fn latest_version(&self, subscribed: &Subscribed, seen_generation: &mut u64) -> u64 {
        let mut state = self.state.lock();
        if *seen_generation == state.generation {
            state.drain_and_dispatch();
        }
        *seen_generation = state.generation;

        state
            .dirmon(&subscribed.dir)
            .and_then(|d| d.version(subscribed.id))
            .unwrap_or(0)
    }

    /// Directories currently watched
    pub fn watched_directories(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.state.lock().dirmons.keys().cloned().collect();
        dirs.sort();
        dirs
    }

    /// Number of dirmons
    pub fn dirmon_count(&self) -> usize {
        self.state.lock().dirmons.len()
    }

    /// Number of monitors sharing the watch on `dir`
    pub fn watchers_of<P: AsRef<Path>>(&self, dir: P) -> usize {
        let dir = dir.as_ref();
        let key = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        self.state.lock().dirmon(&key).map_or(0, Dirmon::refs)
    }

    /// Whether the notification channel is open
    pub fn has_channel(&self) -> bool {
        self.state.lock().channel.is_some()
    }

    /// Number of drains that consumed at least one event
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}

impl Default for WatchRoot {
    fn default() -> Self {
        Self::new(WatchOptions::default())
    }
}

impl std::fmt::Debug for WatchRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WatchRoot")
            .field("directories", &state.dirmons.keys().collect::<Vec<_>>())
            .field("channel", &state.channel.as_ref().map(|c| c.backend))
            .field("generation", &state.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    #[test]
    fn test_change_kinds() {
        let close_write = EventKind::Access(AccessKind::Close(AccessMode::Write));
        let data = EventKind::Modify(ModifyKind::Data(DataChange::Content));
        let mtime = EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime));
        let rename_from = EventKind::Modify(ModifyKind::Name(RenameMode::From));

        for backend in [Backend::Native, Backend::Poll] {
            assert!(is_change(&EventKind::Create(CreateKind::File), backend));
            assert!(is_change(&close_write, backend));
            assert!(!is_change(&rename_from, backend));
            assert!(!is_change(&EventKind::Remove(notify::event::RemoveKind::File), backend));
        }

        assert!(is_change(&data, Backend::Poll));
        assert!(is_change(&mtime, Backend::Poll));
        assert!(!is_change(&mtime, Backend::Native));
        assert_eq!(
            is_change(&data, Backend::Native),
            !Backend::Native.reports_write_completion()
        );
    }

    #[test]
    fn test_rename_both_only_counts_destination() {
        let both = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/w/liba.so.tmp", "/w/liba.so"],
        );
        assert_eq!(changed_paths(&both), &[PathBuf::from("/w/liba.so")]);

        let create = event(EventKind::Create(CreateKind::File), &["/w/liba.so"]);
        assert_eq!(changed_paths(&create).len(), 1);
    }

    #[test]
    fn test_channel_lifecycle_follows_dirmons() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let root = WatchRoot::default();
        assert!(!root.has_channel());

        let a = root.subscribe(first.path(), "liba.so".into()).unwrap();
        let b = root.subscribe(first.path(), "libb.so".into()).unwrap();
        let c = root.subscribe(second.path(), "liba.so".into()).unwrap();
        assert!(root.has_channel());
        assert_eq!(root.dirmon_count(), 2);
        assert_eq!(root.watchers_of(first.path()), 2);
        assert_ne!(a.id, b.id);

        root.unsubscribe(&a);
        assert_eq!(root.watchers_of(first.path()), 1);
        root.unsubscribe(&b);
        assert_eq!(root.watchers_of(first.path()), 0);
        assert_eq!(root.dirmon_count(), 1);
        assert!(root.has_channel());

        root.unsubscribe(&c);
        assert_eq!(root.dirmon_count(), 0);
        assert!(!root.has_channel());
    }

    #[test]
    fn test_subscribe_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = WatchRoot::default();
        let err = root
            .subscribe(&dir.path().join("missing"), "liba.so".into())
            .unwrap_err();
        assert!(matches!(err, crate::error::HotmodError::InvalidPath { .. }));
        assert!(!root.has_channel());
    }

    #[test]
    fn test_disconnected_backend_is_drained_once() {
        let dir = tempfile::tempdir().unwrap();
        let root = WatchRoot::default();
        let sub = root.subscribe(dir.path(), "liba.so".into()).unwrap();

        let (tx, rx) = mpsc::channel();
        tx.send(Ok(Event::new(EventKind::Create(CreateKind::File))
            .add_path(dir.path().canonicalize().unwrap().join("liba.so"))))
            .unwrap();
        drop(tx);
        root.state.lock().channel.as_mut().unwrap().events = rx;

        let mut seen = root.generation();
        assert_eq!(root.latest_version(&sub, &mut seen), 1);
        assert!(root.state.lock().channel.as_ref().unwrap().disconnected);
        let after_first = root.generation();

        // later polls skip the dead receiver entirely
        assert_eq!(root.state.lock().drain_and_dispatch(), 0);
        assert_eq!(root.latest_version(&sub, &mut seen), 1);
        assert_eq!(root.generation(), after_first);
        assert!(root.has_channel());

        root.unsubscribe(&sub);
        assert!(!root.has_channel());
    }

    #[test]
    fn test_latest_version_without_events() {
        let dir = tempfile::tempdir().unwrap();
        let root = WatchRoot::default();
        let sub = root.subscribe(dir.path(), "liba.so".into()).unwrap();

        let mut seen = root.generation();
        assert_eq!(root.latest_version(&sub, &mut seen), 0);
        root.unsubscribe(&sub);
    }
}
