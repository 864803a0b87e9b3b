//! Leaf tree storage.
//!
//! Tracks the leaves the wallet owns and which of them are locked in an
//! outgoing transfer. Selection strategies pick leaves to cover an amount.

mod memory;
mod selection;
mod store;

pub use memory::InMemoryTreeStore;
pub use selection::{GreedySelector, LeafSelector};
pub use store::{LeafReservation, ReservationId, TreeStore};
