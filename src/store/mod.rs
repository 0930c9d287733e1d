//! Persistence layer: job records behind the `JobStore` trait.

mod libsql_backend;
mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryJobStore;
pub use traits::JobStore;
