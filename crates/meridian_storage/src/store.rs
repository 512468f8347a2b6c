//! State stores keyed by stack.

use crate::error::StorageError;
use crate::record::StoredRecord;
use meridian_core::StackId;
use meridian_runtime::ExecutionResult;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

const RESULTS: TableDefinition<&str, &[u8]> = TableDefinition::new("execution_results");

/// Latest execution result per stack
pub trait StateStore: Send + Sync {
    /// Replace the stored result of the result's stack
    ///
    /// # Errors
    ///
    /// Returns error if the result cannot be written
    fn save(&self, result: &ExecutionResult) -> Result<(), StorageError>;

    /// Latest result of `stack`
    ///
    /// # Errors
    ///
    /// Returns error if the stored record cannot be read
    fn load(&self, stack: &StackId) -> Result<Option<ExecutionResult>, StorageError>;

    /// Forget `stack`, returning whether anything was stored
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written
    fn clear(&self, stack: &StackId) -> Result<bool, StorageError>;

    /// Every stack with a stored result, in id order
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    fn stacks(&self) -> Result<Vec<StackId>, StorageError>;
}

/// Store backed by a redb database file
pub struct RedbStateStore {
    db: Database,
    path: PathBuf,
}

impl RedbStateStore {
    /// Open or create the database at `path`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created or is not a database
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(&path).map_err(StorageError::database)?;
        let txn = db.begin_write().map_err(StorageError::database)?;
        txn.open_table(RESULTS).map_err(StorageError::database)?;
        txn.commit().map_err(StorageError::database)?;

        tracing::debug!(path = %path.display(), "state store opened");
        Ok(Self { db, path })
    }

    /// Database file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for RedbStateStore {
    fn save(&self, result: &ExecutionResult) -> Result<(), StorageError> {
        let bytes = StoredRecord::new(result.clone()).encode()?;
        let txn = self.db.begin_write().map_err(StorageError::database)?;
        {
            let mut table = txn.open_table(RESULTS).map_err(StorageError::database)?;
            table
                .insert(result.stack.as_str(), bytes.as_slice())
                .map_err(StorageError::database)?;
        }
        txn.commit().map_err(StorageError::database)?;
        tracing::debug!(stack = %result.stack, run = %result.run, bytes = bytes.len(), "result saved");
        Ok(())
    }

    fn load(&self, stack: &StackId) -> Result<Option<ExecutionResult>, StorageError> {
        let txn = self.db.begin_read().map_err(StorageError::database)?;
        let table = txn.open_table(RESULTS).map_err(StorageError::database)?;
        let Some(guard) = table.get(stack.as_str()).map_err(StorageError::database)? else {
            return Ok(None);
        };
        let record = StoredRecord::decode(guard.value())?;
        Ok(Some(record.result))
    }

    fn clear(&self, stack: &StackId) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(StorageError::database)?;
        let removed = {
            let mut table = txn.open_table(RESULTS).map_err(StorageError::database)?;
            table
                .remove(stack.as_str())
                .map_err(StorageError::database)?
                .is_some()
        };
        txn.commit().map_err(StorageError::database)?;
        Ok(removed)
    }

    fn stacks(&self) -> Result<Vec<StackId>, StorageError> {
        let txn = self.db.begin_read().map_err(StorageError::database)?;
        let table = txn.open_table(RESULTS).map_err(StorageError::database)?;
        let mut stacks = Vec::new();
        for entry in table.iter().map_err(StorageError::database)? {
            let (key, _) = entry.map_err(StorageError::database)?;
            stacks.push(StackId::new(key.value()));
        }
        Ok(stacks)
    }
}

/// Store kept in memory, encoded the same way as on disk
#[derive(Default)]
pub struct InMemoryStateStore {
    records: RwLock<BTreeMap<StackId, Vec<u8>>>,
}

impl InMemoryStateStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn save(&self, result: &ExecutionResult) -> Result<(), StorageError> {
        let bytes = StoredRecord::new(result.clone()).encode()?;
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(result.stack.clone(), bytes);
        Ok(())
    }

    fn load(&self, stack: &StackId) -> Result<Option<ExecutionResult>, StorageError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records
            .get(stack)
            .map(|bytes| StoredRecord::decode(bytes).map(|r| r.result))
            .transpose()
    }

    fn clear(&self, stack: &StackId) -> Result<bool, StorageError> {
        Ok(self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stack)
            .is_some())
    }

    fn stacks(&self) -> Result<Vec<StackId>, StorageError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }
}
