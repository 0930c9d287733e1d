//! Client side of the delivery/recovery protocol.

pub mod tracker;
pub mod watcher;

pub use tracker::ProgressTracker;
pub use watcher::JobWatcher;
