//! Parcel store
//!
//! Parcels live under `<direction>/<plain>/<hashed>` in an [`ObjectWriter`],
//! next to a JSON side-car `<...>.meta` holding the expiry date. The plain
//! component keeps one identity readable (sender for outbound parcels,
//! recipient for inbound ones) so listings can be scoped to it; the hashed
//! component covers the rest of the addressing triple.
//!
//! An entry is only *active* once its side-car exists and parses. Listings
//! garbage-collect entries whose side-car is missing, corrupt or expired.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::objects::ObjectWriter;
use super::{ParcelCollectionRecord, Storage};
use crate::error::StoreError;
use crate::types::{Direction, Parcel, QueuedParcel, StoredParcelKey};

/// Suffix of metadata side-car files
const META_SUFFIX: &str = ".meta";

/// Age before a side-car without content counts as abandoned. A `store()`
/// in progress has written the side-car but not yet the content.
pub const ORPHAN_METADATA_GRACE: Duration = Duration::from_secs(10 * 60);

/// Side-car record stored next to each parcel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParcelMetadata {
    /// Expiry as unix seconds
    #[serde(rename = "expiryDate")]
    pub expiry_date: i64,
}

impl ParcelMetadata {
    pub fn for_parcel(parcel: &Parcel) -> Self {
        Self {
            expiry_date: parcel.expiry_date.timestamp(),
        }
    }

    /// Expiry as a timestamp; `None` if out of range
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expiry_date, 0)
    }
}

/// Check that an identity can be used as a single path segment
fn validate_component(component: &str) -> Result<&str, StoreError> {
    let invalid = component.is_empty()
        || component.starts_with('.')
        || component.contains('/')
        || component.contains('\\')
        || component.contains('\0');
    if invalid {
        return Err(StoreError::InvalidKeyComponent(component.to_string()));
    }
    Ok(component)
}

/// Derive the storage key of a parcel for the given direction.
///
/// The hash input is length-prefixed so that `("ab", "c")` and `("a", "bc")`
/// cannot produce the same digest.
pub fn derive_key(parcel: &Parcel, direction: Direction) -> Result<StoredParcelKey, StoreError> {
    let (plain, other) = match direction {
        Direction::ToPeer => (&parcel.sender_id, &parcel.recipient_id),
        Direction::ToEndpoint => (&parcel.recipient_id, &parcel.sender_id),
    };
    let plain = validate_component(plain)?;

    let mut hasher = Sha256::new();
    hasher.update((other.len() as u64).to_be_bytes());
    hasher.update(other.as_bytes());
    hasher.update(parcel.parcel_id.as_bytes());
    let hashed = hex::encode(hasher.finalize());

    Ok(StoredParcelKey::new(format!("{}/{}", plain, hashed)))
}

/// Durable, directional parcel storage with expiry and inbound dedup
#[derive(Debug, Clone)]
pub struct ParcelStore {
    objects: ObjectWriter,
    ledger: Storage,
}

impl ParcelStore {
    /// Create a store writing parcel files through `objects` and recording
    /// inbound collections in `ledger`.
    pub fn new(objects: ObjectWriter, ledger: Storage) -> Self {
        Self { objects, ledger }
    }

    fn object_key(direction: Direction, key: &StoredParcelKey) -> String {
        format!("{}/{}", direction.as_str(), key.as_str())
    }

    fn meta_key(object_key: &str) -> String {
        format!("{}{}", object_key, META_SUFFIX)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Persist a serialized parcel and its metadata.
    ///
    /// The side-car is written first so a crash can never leave content
    /// that looks active without an expiry.
    pub async fn store(
        &self,
        bytes: &[u8],
        parcel: &Parcel,
        direction: Direction,
    ) -> Result<StoredParcelKey, StoreError> {
        let key = derive_key(parcel, direction)?;
        let object_key = Self::object_key(direction, &key);

        let metadata = serde_json::to_vec(&ParcelMetadata::for_parcel(parcel))
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.objects
            .write(&Self::meta_key(&object_key), &metadata)
            .await?;
        self.objects.write(&object_key, bytes).await?;

        debug!(key = %key, direction = %direction, size = bytes.len(), "Stored parcel");
        Ok(key)
    }

    /// Persist an inbound parcel unless it was collected before.
    ///
    /// Returns the key only when the parcel is new. A parcel that was
    /// collected and already deleted is not resurrected; one that is still
    /// on disk is overwritten in place.
    pub async fn store_inbound(
        &self,
        bytes: &[u8],
        parcel: &Parcel,
    ) -> Result<Option<StoredParcelKey>, StoreError> {
        let record = ParcelCollectionRecord::for_parcel(parcel);

        if self.ledger.has_collection(&record)? {
            let key = derive_key(parcel, Direction::ToEndpoint)?;
            if self.exists(&key, Direction::ToEndpoint).await? {
                self.store(bytes, parcel, Direction::ToEndpoint).await?;
                debug!(key = %key, "Refreshed previously collected parcel");
            } else {
                debug!(
                    sender = %parcel.sender_id,
                    parcel_id = %parcel.parcel_id,
                    "Ignoring parcel that was already collected"
                );
            }
            return Ok(None);
        }

        let key = self.store(bytes, parcel, Direction::ToEndpoint).await?;
        self.ledger.record_collection(&record)?;
        Ok(Some(key))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    /// Read a parcel's serialized bytes
    pub async fn retrieve(
        &self,
        key: &StoredParcelKey,
        direction: Direction,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.objects.read(&Self::object_key(direction, key)).await
    }

    /// Whether the parcel content exists
    pub async fn exists(
        &self,
        key: &StoredParcelKey,
        direction: Direction,
    ) -> Result<bool, StoreError> {
        self.objects.exists(&Self::object_key(direction, key)).await
    }

    /// Remove a parcel and its side-car. Missing files are not an error.
    pub async fn delete(
        &self,
        key: &StoredParcelKey,
        direction: Direction,
    ) -> Result<(), StoreError> {
        self.delete_object(&Self::object_key(direction, key)).await
    }

    async fn delete_object(&self, object_key: &str) -> Result<(), StoreError> {
        self.objects.delete(object_key).await?;
        self.objects.delete(&Self::meta_key(object_key)).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Listings
    // ═══════════════════════════════════════════════════════════════════════

    /// Stream every active parcel in a direction.
    ///
    /// Entries are checked one at a time as the stream is polled; corrupt
    /// and expired entries are deleted and skipped.
    pub fn list_queued(
        &self,
        direction: Direction,
    ) -> BoxStream<'static, Result<QueuedParcel, StoreError>> {
        self.queued_under(direction, vec![direction.as_str().to_string()])
    }

    /// Stream the keys of active parcels whose plain component is one of
    /// `recipient_ids`, recipient by recipient in the given order.
    ///
    /// Recipient ids that cannot name a directory are skipped.
    pub fn list_queued_for_recipients(
        &self,
        direction: Direction,
        recipient_ids: &[String],
    ) -> BoxStream<'static, Result<StoredParcelKey, StoreError>> {
        let mut seen = HashSet::new();
        let prefixes = recipient_ids
            .iter()
            .filter(|id| match validate_component(id) {
                Ok(_) => true,
                Err(_) => {
                    warn!(recipient = %id, "Skipping recipient id that cannot be a path segment");
                    false
                }
            })
            .filter(|id| seen.insert(id.as_str()))
            .map(|id| format!("{}/{}", direction.as_str(), id))
            .collect();

        self.queued_under(direction, prefixes)
            .map_ok(|queued| queued.key)
            .boxed()
    }

    fn queued_under(
        &self,
        direction: Direction,
        prefixes: Vec<String>,
    ) -> BoxStream<'static, Result<QueuedParcel, StoreError>> {
        let state = ListState {
            store: self.clone(),
            direction,
            prefixes: prefixes.into(),
            candidates: VecDeque::new(),
        };
        stream::try_unfold(state, next_queued).boxed()
    }

    /// Validate one listed entry against its side-car.
    async fn activate(
        &self,
        direction: Direction,
        object_key: &str,
    ) -> Result<Option<QueuedParcel>, StoreError> {
        let namespace = format!("{}/", direction.as_str());
        let Some(relative) = object_key.strip_prefix(&namespace) else {
            return Ok(None);
        };
        let key = StoredParcelKey::new(relative);

        let metadata = self
            .objects
            .read(&Self::meta_key(object_key))
            .await?
            .and_then(|bytes| serde_json::from_slice::<ParcelMetadata>(&bytes).ok());

        match metadata.and_then(|m| m.expires_at()) {
            Some(expiry_date) if expiry_date > Utc::now() => {
                Ok(Some(QueuedParcel { key, expiry_date }))
            }
            Some(expiry_date) => {
                debug!(key = %key, expiry = %expiry_date, "Deleting expired parcel");
                self.delete_object(object_key).await?;
                Ok(None)
            }
            None => {
                warn!(key = %key, "Deleting parcel with missing or corrupt metadata");
                self.delete_object(object_key).await?;
                Ok(None)
            }
        }
    }

    /// Run one full listing pass over a direction, deleting expired and
    /// corrupt entries plus side-cars whose content has been missing for
    /// longer than [`ORPHAN_METADATA_GRACE`].
    ///
    /// Returns the number of parcels still queued.
    pub async fn sweep_expired(&self, direction: Direction) -> Result<usize, StoreError> {
        let remaining = self
            .list_queued(direction)
            .try_fold(0usize, |count, _| async move { Ok(count + 1) })
            .await?;

        let cutoff = SystemTime::now()
            .checked_sub(ORPHAN_METADATA_GRACE)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        for meta_key in self
            .objects
            .list(direction.as_str())
            .await?
            .into_iter()
            .filter(|k| k.ends_with(META_SUFFIX))
        {
            let content_key = &meta_key[..meta_key.len() - META_SUFFIX.len()];
            if self.objects.exists(content_key).await? {
                continue;
            }
            let abandoned = matches!(
                self.objects.modified(&meta_key).await?,
                Some(modified) if modified < cutoff
            );
            if abandoned {
                debug!(key = %content_key, "Deleting orphaned metadata");
                self.objects.delete(&meta_key).await?;
            }
        }

        Ok(remaining)
    }
}

/// Cursor of a lazy listing: prefixes still to enumerate and the
/// candidates of the current one.
struct ListState {
    store: ParcelStore,
    direction: Direction,
    prefixes: VecDeque<String>,
    candidates: VecDeque<String>,
}

async fn next_queued(
    mut state: ListState,
) -> Result<Option<(QueuedParcel, ListState)>, StoreError> {
    loop {
        if let Some(object_key) = state.candidates.pop_front() {
            if let Some(queued) = state.store.activate(state.direction, &object_key).await? {
                return Ok(Some((queued, state)));
            }
            continue;
        }

        let Some(prefix) = state.prefixes.pop_front() else {
            return Ok(None);
        };
        state.candidates = state
            .store
            .objects
            .list(&prefix)
            .await?
            .into_iter()
            .filter(|k| !k.ends_with(META_SUFFIX))
            .collect();
    }
}
