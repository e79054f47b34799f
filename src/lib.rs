//! designsync: scene synchronization, undo history, presence and comments for
//! a collaborative design editor.
//!
//! The core ([`session::SyncSession`]) is synchronous and clock-free. The
//! [`editor`] module drives it on tokio against a [`sync::relay`] and a
//! [`persist::DesignStore`].

pub mod autosave;
pub mod comments;
pub mod config;
pub mod document;
pub mod editor;
pub mod history;
pub mod ids;
pub mod persist;
pub mod presence;
pub mod reconcile;
pub mod scene;
pub mod session;
pub mod snapshot;
pub mod suppress;
pub mod sync;
