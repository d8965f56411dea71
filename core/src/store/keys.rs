// Key storage using sled

use super::backend::{Storage, StoreError, TREE_KEYS};
use crate::keys::KeyPair;

/// Name of the repo identity key
pub const SELF_REPO: &str = "self.repo";

/// Named secret keys
pub struct KeyStore {
    tree: sled::Tree,
}

impl KeyStore {
    pub fn open(storage: &Storage) -> Result<Self, StoreError> {
        Ok(Self {
            tree: storage.tree(TREE_KEYS)?,
        })
    }

    /// Load a key pair by name
    pub fn get(&self, name: &str) -> Result<Option<KeyPair>, StoreError> {
        match self.tree.get(name.as_bytes())? {
            Some(bytes) => KeyPair::from_secret_bytes(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("key '{}': {}", name, e))),
            None => Ok(None),
        }
    }

    /// Save a key pair under `name`, replacing any previous one
    pub fn set(&self, name: &str, keys: &KeyPair) -> Result<(), StoreError> {
        let secret = keys.secret_bytes();
        self.tree.insert(name.as_bytes(), secret.as_slice())?;
        self.tree.flush()?;
        Ok(())
    }

    /// Load `name`, generating and saving a fresh key pair on first use
    pub fn get_or_create(&self, name: &str) -> Result<KeyPair, StoreError> {
        if let Some(keys) = self.get(name)? {
            return Ok(keys);
        }
        let keys = KeyPair::generate();
        self.set(name, &keys)?;
        Ok(keys)
    }
}
