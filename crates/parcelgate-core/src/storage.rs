//! Persistent storage for the gateway.
//!
//! Two layers live here:
//! - [`Storage`]: the redb database holding the gateway's small records
//!   (inbound collection ledger, key-value configuration, identity key)
//! - [`ParcelStore`]: parcel bodies on the filesystem via [`ObjectWriter`],
//!   consulting the ledger for inbound dedup

use crate::error::StoreError;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

// Submodules
mod collections;
mod config;
pub mod objects;
pub mod parcels;

use collections::PARCEL_COLLECTIONS_TABLE;
use config::CONFIG_TABLE;

pub use collections::ParcelCollectionRecord;
pub use config::{RegistrationStatus, REGISTRATION_PEER_ADDRESS_KEY};
pub use objects::ObjectWriter;
pub use parcels::{derive_key, ParcelMetadata, ParcelStore};

// Table definitions
const IDENTITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("identity");

/// Key under which the gateway's ed25519 seed is kept
const GATEWAY_KEY: &str = "gateway_signing_key";

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Get a reference to the shared database handle
    pub fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(PARCEL_COLLECTIONS_TABLE)?;
            let _ = write_txn.open_table(CONFIG_TABLE)?;
            let _ = write_txn.open_table(IDENTITY_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save the gateway's signing key seed.
    ///
    /// Overwrites any previously stored key.
    pub fn save_gateway_key(&self, seed: &[u8; 32]) -> Result<(), StoreError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDENTITY_TABLE)?;
            table.insert(GATEWAY_KEY, seed.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the gateway's signing key seed, if one was saved.
    pub fn load_gateway_key(&self) -> Result<Option<[u8; 32]>, StoreError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_TABLE)?;

        match table.get(GATEWAY_KEY)? {
            Some(v) => {
                let bytes = v.value();
                if bytes.len() != 32 {
                    return Err(StoreError::Serialization(format!(
                        "gateway key has {} bytes, expected 32",
                        bytes.len()
                    )));
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(bytes);
                Ok(Some(arr))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let storage = Storage::new(&db_path).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_storage_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested/path/to/test.redb");
        let storage = Storage::new(&db_path);
        assert!(storage.is_ok());
        assert!(db_path.exists());
    }

    #[test]
    fn test_gateway_key_missing() {
        let (storage, _temp) = create_test_storage();
        assert!(storage.load_gateway_key().unwrap().is_none());
    }

    #[test]
    fn test_gateway_key_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let seed = [7u8; 32];

        {
            let storage = Storage::new(&db_path).unwrap();
            storage.save_gateway_key(&seed).unwrap();
        }

        let storage = Storage::new(&db_path).unwrap();
        assert_eq!(storage.load_gateway_key().unwrap(), Some(seed));
    }
}
