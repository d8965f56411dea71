// Storage backend: one sled database per repo, split into named trees

use std::path::Path;
use thiserror::Error;
use tracing::debug;

pub const TREE_FEEDS: &str = "feeds";
pub const TREE_BLOCKS: &str = "blocks";
pub const TREE_CLOCKS: &str = "clocks";
pub const TREE_CURSORS: &str = "cursors";
pub const TREE_KEYS: &str = "keys";

/// Storage error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Metadata ledger error: {0}")]
    Ledger(String),
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Handle to the repo database. Cheap to clone.
#[derive(Clone)]
pub struct Storage {
    db: sled::Db,
    temporary: bool,
}

impl Storage {
    /// Open (or create) a persistent database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        debug!("Opened storage at {}", path.display());
        Ok(Self {
            db,
            temporary: false,
        })
    }

    /// A database that is deleted when the last handle drops
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            db,
            temporary: true,
        })
    }

    /// Persistent when a path is given, temporary otherwise
    pub fn open_or_temporary(path: Option<&Path>) -> Result<Self, StoreError> {
        match path {
            Some(path) => Self::open(path),
            None => Self::temporary(),
        }
    }

    pub fn tree(&self, name: &str) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(name)?)
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_storage_trees() {
        let storage = Storage::temporary().unwrap();
        assert!(storage.is_temporary());
        let tree = storage.tree(TREE_KEYS).unwrap();
        tree.insert(b"k", b"v".to_vec()).unwrap();
        assert_eq!(tree.get(b"k").unwrap().unwrap().as_ref(), b"v");
    }

    #[test]
    fn test_persistent_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = Storage::open(dir.path()).unwrap();
            storage.tree(TREE_KEYS).unwrap().insert(b"k", b"v".to_vec()).unwrap();
            storage.flush().unwrap();
        }
        let storage = Storage::open(dir.path()).unwrap();
        assert!(storage.tree(TREE_KEYS).unwrap().get(b"k").unwrap().is_some());
    }
}
