//! Tree store trait and reservation types.

use crate::leaf::Leaf;
use crate::SdkError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Unique identifier for a leaf reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationId(pub u64);

/// A set of reserved leaves with their reservation ID.
#[derive(Debug)]
pub struct LeafReservation {
    /// Reservation identifier (used to finalize or cancel).
    pub id: ReservationId,

    /// The reserved leaves, in the order requested.
    pub leaves: Vec<Leaf>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Storage for the wallet's leaves.
///
/// Reserving a leaf marks it [`LeafStatus::TransferLocked`], which excludes
/// it from balance and selection until the reservation is finalized
/// (the leaf is spent and removed) or cancelled (it becomes available).
///
/// [`LeafStatus::TransferLocked`]: crate::leaf::LeafStatus::TransferLocked
pub trait TreeStore: Send + Sync {
    /// Insert leaves (after a deposit or a claimed transfer), replacing any
    /// leaf with the same id.
    fn insert_leaves(&self, leaves: &[Leaf]) -> Result<(), SdkError>;

    /// Remove leaves by ID.
    fn remove_leaves(&self, leaf_ids: &[&str]) -> Result<(), SdkError>;

    /// Look up a leaf in any status.
    fn get_leaf(&self, leaf_id: &str) -> Result<Option<Leaf>, SdkError>;

    /// All leaves with status `Available`.
    fn get_available_leaves(&self) -> Result<Vec<Leaf>, SdkError>;

    /// Reserve a set of available leaves.
    ///
    /// Fails with [`SdkError::LeafNotFound`] for an unknown id and
    /// [`SdkError::InsufficientBalance`] if a leaf is not available. No
    /// leaf is reserved on failure.
    fn reserve_leaves(&self, leaf_ids: &[&str]) -> Result<LeafReservation, SdkError>;

    /// Finalize a reservation: the reserved leaves are spent and removed.
    fn finalize_reservation(&self, id: ReservationId) -> Result<(), SdkError>;

    /// Cancel a reservation, returning its leaves to `Available`.
    fn cancel_reservation(&self, id: ReservationId) -> Result<(), SdkError>;

    /// Total value of available leaves in satoshis.
    fn available_balance(&self) -> Result<u64, SdkError>;
}
