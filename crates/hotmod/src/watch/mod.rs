//! Directory watching
//!
//! A single [`WatchRoot`] multiplexes every monitored file onto one
//! notification channel, with one dirmon per watched directory.

mod dirmon;
mod root;

pub(crate) use root::Subscribed;
pub use root::WatchRoot;
