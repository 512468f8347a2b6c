//! MERIDIAN Storage
//!
//! Persists the latest [`ExecutionResult`](meridian_runtime::ExecutionResult)
//! of each stack so a later run can resume or tear down what an earlier
//! one created.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod record;
pub mod store;

pub use error::StorageError;
pub use record::{RECORD_VERSION, StoredRecord};
pub use store::{InMemoryStateStore, RedbStateStore, StateStore};
