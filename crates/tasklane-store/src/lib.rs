//! Server-side persistence for Tasklane.
//!
//! Every operation opens its own SQLite connection so that concurrent
//! requests are isolated by the database rather than by application locks.

pub mod db;
pub mod error;
pub mod isolation;
pub mod provision;
pub mod tasks;
pub mod users;

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use isolation::IsolationLevel;
pub use provision::{ProvisionError, Provisioner};
pub use tasks::TaskRepository;
pub use users::{SqliteUserRepository, UserRepository};
