//! Inbound collection ledger
//!
//! One row per `(sender_id, recipient_id, parcel_id)` that was handed to its
//! endpoint at least once. Rows are created on first store and never
//! updated or deleted here.

use crate::error::StoreError;
use crate::types::Parcel;
use redb::{ReadableTable, TableDefinition};

use super::Storage;

/// Table for collected parcels (key: addressing triple, value: unix seconds of first store)
pub(crate) const PARCEL_COLLECTIONS_TABLE: TableDefinition<(&str, &str, &str), i64> =
    TableDefinition::new("parcel_collections");

/// Marks that an inbound parcel has already been accepted once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParcelCollectionRecord {
    pub sender_id: String,
    pub recipient_id: String,
    pub parcel_id: String,
}

impl ParcelCollectionRecord {
    /// Build the record for a parcel's addressing triple
    pub fn for_parcel(parcel: &Parcel) -> Self {
        Self {
            sender_id: parcel.sender_id.clone(),
            recipient_id: parcel.recipient_id.clone(),
            parcel_id: parcel.parcel_id.clone(),
        }
    }

    fn as_key(&self) -> (&str, &str, &str) {
        (
            self.sender_id.as_str(),
            self.recipient_id.as_str(),
            self.parcel_id.as_str(),
        )
    }
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Collection Ledger Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Record that a parcel was collected.
    ///
    /// An existing row is left untouched.
    pub fn record_collection(&self, record: &ParcelCollectionRecord) -> Result<(), StoreError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(PARCEL_COLLECTIONS_TABLE)?;
            if table.get(record.as_key())?.is_none() {
                table.insert(record.as_key(), chrono::Utc::now().timestamp())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Whether a parcel was collected before
    pub fn has_collection(&self, record: &ParcelCollectionRecord) -> Result<bool, StoreError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(PARCEL_COLLECTIONS_TABLE)?;
        Ok(table.get(record.as_key())?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path().join("test.redb")).unwrap();
        (storage, temp_dir)
    }

    fn record(sender: &str, recipient: &str, id: &str) -> ParcelCollectionRecord {
        let parcel = Parcel::new(sender, recipient, id, Utc::now(), vec![]);
        ParcelCollectionRecord::for_parcel(&parcel)
    }

    #[test]
    fn test_record_and_lookup() {
        let (storage, _temp) = create_test_storage();
        let rec = record("S", "R", "1");

        assert!(!storage.has_collection(&rec).unwrap());
        storage.record_collection(&rec).unwrap();
        assert!(storage.has_collection(&rec).unwrap());
    }

    #[test]
    fn test_records_are_distinct_per_triple() {
        let (storage, _temp) = create_test_storage();
        storage.record_collection(&record("S", "R", "1")).unwrap();

        assert!(!storage.has_collection(&record("S", "R", "2")).unwrap());
        assert!(!storage.has_collection(&record("R", "S", "1")).unwrap());
        assert!(!storage.has_collection(&record("S", "R1", "")).unwrap());
    }

    #[test]
    fn test_recording_twice_is_harmless() {
        let (storage, _temp) = create_test_storage();
        let rec = record("S", "R", "1");

        storage.record_collection(&rec).unwrap();
        storage.record_collection(&rec).unwrap();
        assert!(storage.has_collection(&rec).unwrap());
    }
}
