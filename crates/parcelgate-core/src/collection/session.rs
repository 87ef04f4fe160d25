//! Per-connection delivery bookkeeping

use std::collections::{HashMap, HashSet};

use ulid::Ulid;

use crate::types::StoredParcelKey;

/// Deliveries awaiting acknowledgement on one connection
#[derive(Debug)]
pub struct DeliverySession {
    recipients: Vec<String>,
    pending: HashMap<String, StoredParcelKey>,
    in_flight: HashSet<StoredParcelKey>,
    no_more_parcels: bool,
}

impl DeliverySession {
    pub fn new(recipients: Vec<String>) -> Self {
        Self {
            recipients,
            pending: HashMap::new(),
            in_flight: HashSet::new(),
            no_more_parcels: false,
        }
    }

    /// Endpoint ids authenticated on this connection
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Whether `key` was delivered and not yet acknowledged
    pub fn is_in_flight(&self, key: &StoredParcelKey) -> bool {
        self.in_flight.contains(key)
    }

    /// Register a delivery and return its fresh id
    pub fn record(&mut self, key: StoredParcelKey) -> String {
        let delivery_id = Ulid::new().to_string();
        self.in_flight.insert(key.clone());
        self.pending.insert(delivery_id.clone(), key);
        delivery_id
    }

    /// Resolve an acknowledgement. `None` if the id is not pending.
    pub fn acknowledge(&mut self, delivery_id: &[u8]) -> Option<StoredParcelKey> {
        let delivery_id = std::str::from_utf8(delivery_id).ok()?;
        let key = self.pending.remove(delivery_id)?;
        self.in_flight.remove(&key);
        Some(key)
    }

    pub fn mark_no_more_parcels(&mut self) {
        self.no_more_parcels = true;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Nothing left to send and everything sent was acknowledged
    pub fn is_complete(&self) -> bool {
        self.no_more_parcels && self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_resolves_once() {
        let mut session = DeliverySession::new(vec!["R".to_string()]);
        let key = StoredParcelKey::new("R/abc");
        let id = session.record(key.clone());
        assert!(session.is_in_flight(&key));

        assert_eq!(session.acknowledge(id.as_bytes()), Some(key.clone()));
        assert!(!session.is_in_flight(&key));
        assert_eq!(session.acknowledge(id.as_bytes()), None);
    }

    #[test]
    fn test_unknown_ids_are_rejected() {
        let mut session = DeliverySession::new(vec![]);
        session.record(StoredParcelKey::new("R/abc"));
        assert_eq!(session.acknowledge(b"nope"), None);
        assert_eq!(session.acknowledge(&[0xff, 0xfe]), None);
        assert_eq!(session.pending_count(), 1);
    }

    #[test]
    fn test_completion_needs_both_conditions() {
        let mut session = DeliverySession::new(vec![]);
        assert!(!session.is_complete());

        let id = session.record(StoredParcelKey::new("R/abc"));
        session.mark_no_more_parcels();
        assert!(!session.is_complete());

        session.acknowledge(id.as_bytes());
        assert!(session.is_complete());
    }

    #[test]
    fn test_delivery_ids_are_unique() {
        let mut session = DeliverySession::new(vec![]);
        let a = session.record(StoredParcelKey::new("R/a"));
        let b = session.record(StoredParcelKey::new("R/b"));
        assert_ne!(a, b);
        assert_eq!(session.pending_count(), 2);
    }
}
