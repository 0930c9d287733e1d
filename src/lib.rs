//! Comic Batch: asynchronous batch jobs over comic archives.
//!
//! Jobs are persisted in a [`store::JobStore`], run by a
//! [`jobs::JobManager`] on a bounded worker pool, and reported to clients
//! through [`events::Broadcaster`] topics. [`client::JobWatcher`] is the
//! matching consumer.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod processors;
pub mod store;
