//! In-memory tree store backed by `RwLock<HashMap>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::leaf::{Leaf, LeafStatus};
use crate::SdkError;

use super::store::{LeafReservation, ReservationId, TreeStore};

// ---------------------------------------------------------------------------
// InMemoryTreeStore
// ---------------------------------------------------------------------------

/// In-memory tree store for development and testing.
///
/// A leaf's [`LeafStatus`] is the source of truth for availability;
/// reservations only remember which leaves they locked.
pub struct InMemoryTreeStore {
    /// All leaves keyed by ID.
    leaves: RwLock<HashMap<String, Leaf>>,
    /// Active reservations: reservation ID -> locked leaf IDs.
    reservations: RwLock<HashMap<ReservationId, Vec<String>>>,
    /// Auto-incrementing reservation counter.
    next_reservation: AtomicU64,
}

impl InMemoryTreeStore {
    /// Creates an empty in-memory tree store.
    pub fn new() -> Self {
        Self {
            leaves: RwLock::new(HashMap::new()),
            reservations: RwLock::new(HashMap::new()),
            next_reservation: AtomicU64::new(1),
        }
    }
}

impl Default for InMemoryTreeStore {
    fn default() -> Self {
        Self::new()
    }
}

fn reservation_not_found(id: ReservationId) -> SdkError {
    SdkError::InvalidRequest(format!("reservation {} not found", id.0))
}

impl TreeStore for InMemoryTreeStore {
    fn insert_leaves(&self, leaves: &[Leaf]) -> Result<(), SdkError> {
        let mut map = self.leaves.write().unwrap_or_else(PoisonError::into_inner);
        for leaf in leaves {
            map.insert(leaf.id.clone(), leaf.clone());
        }
        Ok(())
    }

    fn remove_leaves(&self, leaf_ids: &[&str]) -> Result<(), SdkError> {
        let mut map = self.leaves.write().unwrap_or_else(PoisonError::into_inner);
        for id in leaf_ids {
            map.remove(*id);
        }
        Ok(())
    }

    fn get_leaf(&self, leaf_id: &str) -> Result<Option<Leaf>, SdkError> {
        let map = self.leaves.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(leaf_id).cloned())
    }

    fn get_available_leaves(&self) -> Result<Vec<Leaf>, SdkError> {
        let map = self.leaves.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map
            .values()
            .filter(|l| l.status == LeafStatus::Available)
            .cloned()
            .collect())
    }

    fn reserve_leaves(&self, leaf_ids: &[&str]) -> Result<LeafReservation, SdkError> {
        let mut map = self.leaves.write().unwrap_or_else(PoisonError::into_inner);
        let mut reservations = self
            .reservations
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        // Check everything before locking anything.
        for (i, id) in leaf_ids.iter().enumerate() {
            let leaf = map
                .get(*id)
                .ok_or_else(|| SdkError::LeafNotFound((*id).to_owned()))?;
            if leaf.status != LeafStatus::Available || leaf_ids[..i].contains(id) {
                return Err(SdkError::InsufficientBalance);
            }
        }

        let mut leaves = Vec::with_capacity(leaf_ids.len());
        for id in leaf_ids {
            if let Some(leaf) = map.get_mut(*id) {
                leaf.status = LeafStatus::TransferLocked;
                leaves.push(leaf.clone());
            }
        }

        let rid = ReservationId(self.next_reservation.fetch_add(1, Ordering::Relaxed));
        reservations.insert(rid, leaf_ids.iter().map(|s| (*s).to_owned()).collect());

        Ok(LeafReservation { id: rid, leaves })
    }

    fn finalize_reservation(&self, id: ReservationId) -> Result<(), SdkError> {
        let mut map = self.leaves.write().unwrap_or_else(PoisonError::into_inner);
        let mut reservations = self
            .reservations
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let leaf_ids = reservations
            .remove(&id)
            .ok_or_else(|| reservation_not_found(id))?;
        for lid in &leaf_ids {
            map.remove(lid);
        }
        Ok(())
    }

    fn cancel_reservation(&self, id: ReservationId) -> Result<(), SdkError> {
        let mut map = self.leaves.write().unwrap_or_else(PoisonError::into_inner);
        let mut reservations = self
            .reservations
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let leaf_ids = reservations
            .remove(&id)
            .ok_or_else(|| reservation_not_found(id))?;
        for lid in &leaf_ids {
            if let Some(leaf) = map.get_mut(lid) {
                leaf.status = LeafStatus::Available;
            }
        }
        Ok(())
    }

    fn available_balance(&self) -> Result<u64, SdkError> {
        let map = self.leaves.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map
            .values()
            .filter(|l| l.status == LeafStatus::Available)
            .map(|l| l.value)
            .sum())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
