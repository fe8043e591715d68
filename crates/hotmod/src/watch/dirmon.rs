//! Per-directory watch multiplexer
//!
//! One dirmon per canonical directory, shared by every monitor watching a
//! file in it. Directory watches fire for any file in the directory, so each
//! subscription is filtered by file name.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use notify::RecursiveMode;
use tracing::{debug, info};

use super::root::RootState;
use crate::error::{HotmodError, HotmodResult};

/// Identifier of one monitor's subscription
pub(crate) type MonitorId = u64;

/// One monitor's interest in a file of the directory
#[derive(Debug, Clone)]
pub(crate) struct Subscription {
    file_name: OsString,
    /// Latest change version recorded for `file_name`
    version: u64,
}

/// Shared watch over one directory
#[derive(Debug, Default)]
pub(crate) struct Dirmon {
    refs: usize,
    subscriptions: HashMap<MonitorId, Subscription>,
}

impl Dirmon {
    pub(crate) fn refs(&self) -> usize {
        self.refs
    }

    pub(crate) fn attach(&mut self, id: MonitorId, file_name: OsString) {
        self.subscriptions.insert(
            id,
            Subscription {
                file_name,
                version: 0,
            },
        );
    }

    pub(crate) fn detach(&mut self, id: MonitorId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    pub(crate) fn version(&self, id: MonitorId) -> Option<u64> {
        self.subscriptions.get(&id).map(|s| s.version)
    }

    /// Bump every subscription for `file_name`; returns how many matched.
    pub(crate) fn bump(&mut self, file_name: &OsStr) -> usize {
        let mut matched = 0;
        for sub in self.subscriptions.values_mut() {
            if sub.file_name == file_name {
                sub.version += 1;
                matched += 1;
            }
        }
        matched
    }
}

impl RootState {
    /// Find or create the dirmon for `dir` and take a reference on it.
    ///
    /// Returns the canonical directory used as its key.
    pub(crate) fn acquire(&mut self, dir: &Path) -> HotmodResult<PathBuf> {
        let canonical = dir.canonicalize().map_err(|e| {
            HotmodError::InvalidPath {
                path: dir.to_path_buf(),
                source: e,
            }
            .recorded()
        })?;

        if let Some(dirmon) = self.dirmons.get_mut(&canonical) {
            dirmon.refs += 1;
            debug!("Sharing watch on {:?} ({} refs)", canonical, dirmon.refs);
            return Ok(canonical);
        }

        let watch_err = |source: notify::Error| {
            HotmodError::Watch {
                path: canonical.clone(),
                source,
            }
            .recorded()
        };
        let channel = self.channel_or_open().map_err(watch_err)?;
        let watched = channel
            .watcher
            .watch(&canonical, RecursiveMode::NonRecursive)
            .map_err(watch_err);
        if let Err(e) = watched {
            self.close_channel_if_idle();
            return Err(e);
        }

        info!("Watching directory {:?}", canonical);
        self.dirmons.insert(
            canonical.clone(),
            Dirmon {
                refs: 1,
                subscriptions: HashMap::new(),
            },
        );
        Ok(canonical)
    }

    /// Drop a reference; the last one removes the watch, and the last dirmon
    /// closes the channel.
    pub(crate) fn release(&mut self, dir: &Path) {
        let Some(dirmon) = self.dirmons.get_mut(dir) else {
            return;
        };
        dirmon.refs = dirmon.refs.saturating_sub(1);
        if dirmon.refs > 0 {
            debug!("Released watch on {:?} ({} refs left)", dir, dirmon.refs);
            return;
        }

        self.dirmons.remove(dir);
        if let Some(channel) = self.channel.as_mut()
            && let Err(e) = channel.watcher.unwatch(dir)
        {
            debug!("Unwatch of {:?} failed: {}", dir, e);
        }
        info!("Stopped watching directory {:?}", dir);

        self.close_channel_if_idle();
    }
}
