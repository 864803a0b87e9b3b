//! Leaf selection strategies.
//!
//! [`LeafSelector`] is the trait that all selection algorithms implement.
//! The wallet stores the active strategy as `Arc<dyn LeafSelector>`; it can
//! be swapped at runtime via [`crate::Wallet::set_leaf_selector`].

use crate::leaf::Leaf;

// ---------------------------------------------------------------------------
// LeafSelector trait
// ---------------------------------------------------------------------------

/// Strategy for selecting leaves to cover a target amount.
///
/// Implementations receive the available leaves and the target in
/// satoshis, and return the selected subset with its total value, or
/// `None` if the target cannot be met.
pub trait LeafSelector: Send + Sync {
    /// Select leaves whose total value meets or exceeds `target_sats`.
    fn select<'a>(&self, available: &'a [Leaf], target_sats: u64) -> Option<(Vec<&'a Leaf>, u64)>;
}

// ---------------------------------------------------------------------------
// GreedySelector
// ---------------------------------------------------------------------------

/// Largest-first greedy selection. Stateless, zero-sized.
///
/// Minimizes the number of leaves used but may overshoot the target.
pub struct GreedySelector;

impl LeafSelector for GreedySelector {
    fn select<'a>(&self, available: &'a [Leaf], target_sats: u64) -> Option<(Vec<&'a Leaf>, u64)> {
        if target_sats == 0 {
            return Some((Vec::new(), 0));
        }

        let mut sorted: Vec<&Leaf> = available.iter().collect();
        sorted.sort_unstable_by(|a, b| b.value.cmp(&a.value));

        let mut selected = Vec::new();
        let mut total = 0u64;
        for leaf in sorted {
            selected.push(leaf);
            total = total.saturating_add(leaf.value);
            if total >= target_sats {
                return Some((selected, total));
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
