//! Key-value configuration records and registration status

use crate::error::StoreError;
use redb::{ReadableTable, TableDefinition};

use super::Storage;

/// Table for string configuration (key: config name, value: string)
pub(crate) const CONFIG_TABLE: TableDefinition<&str, &str> = TableDefinition::new("config");

/// Config key holding the address of the peer this gateway registered with
pub const REGISTRATION_PEER_ADDRESS_KEY: &str = "registration.peer_address";

/// Answers whether the gateway is currently registered with a remote peer.
///
/// Registration itself (and renewal) is handled elsewhere; the collection
/// handler only needs to ask.
pub trait RegistrationStatus: Send + Sync {
    fn is_registered(&self) -> Result<bool, StoreError>;
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Config Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Get a configuration value
    pub fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(CONFIG_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    /// Set a configuration value, overwriting any previous one
    pub fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(CONFIG_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Delete a configuration value. Missing keys are not an error.
    pub fn delete_config(&self, key: &str) -> Result<(), StoreError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(CONFIG_TABLE)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Record the peer this gateway is registered with
    pub fn set_registration(&self, peer_address: &str) -> Result<(), StoreError> {
        self.set_config(REGISTRATION_PEER_ADDRESS_KEY, peer_address)
    }

    /// Forget the current registration
    pub fn clear_registration(&self) -> Result<(), StoreError> {
        self.delete_config(REGISTRATION_PEER_ADDRESS_KEY)
    }

    /// Address of the registered peer, if any
    pub fn registered_peer(&self) -> Result<Option<String>, StoreError> {
        self.get_config(REGISTRATION_PEER_ADDRESS_KEY)
    }
}

impl RegistrationStatus for Storage {
    fn is_registered(&self) -> Result<bool, StoreError> {
        Ok(self.registered_peer()?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path().join("test.redb")).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_config_set_get_delete() {
        let (storage, _temp) = create_test_storage();

        assert_eq!(storage.get_config("k").unwrap(), None);
        storage.set_config("k", "v1").unwrap();
        storage.set_config("k", "v2").unwrap();
        assert_eq!(storage.get_config("k").unwrap().as_deref(), Some("v2"));

        storage.delete_config("k").unwrap();
        storage.delete_config("k").unwrap();
        assert_eq!(storage.get_config("k").unwrap(), None);
    }

    #[test]
    fn test_registration_status() {
        let (storage, _temp) = create_test_storage();
        assert!(!storage.is_registered().unwrap());

        storage.set_registration("relay.example.com:443").unwrap();
        assert!(storage.is_registered().unwrap());
        assert_eq!(
            storage.registered_peer().unwrap().as_deref(),
            Some("relay.example.com:443")
        );

        storage.clear_registration().unwrap();
        assert!(!storage.is_registered().unwrap());
    }
}
