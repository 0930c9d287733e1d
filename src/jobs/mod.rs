//! Batch jobs: the record model, the manager that runs them, and the
//! reaper that clears out old ones.

pub mod manager;
pub mod model;
pub mod reaper;

pub use manager::{JobManager, Submission};
pub use model::{ItemResult, Job, JobStatus};
