//! Token output selection strategies.

use custody_config::constants::MAX_TOKEN_INPUTS;

use super::store::OwnedTokenOutput;

/// Strategy for selecting token outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Pick smallest outputs first (consolidates dust).
    #[default]
    SmallFirst,
    /// Pick largest outputs first (minimizes input count).
    LargeFirst,
}

/// Select token outputs to cover `target_amount` using the given strategy.
///
/// Returns the selected outputs and their total, or `None` if the target
/// cannot be met within [`MAX_TOKEN_INPUTS`] outputs.
pub fn select_token_outputs(
    available: &[OwnedTokenOutput],
    target_amount: u128,
    strategy: SelectionStrategy,
) -> Option<(Vec<&OwnedTokenOutput>, u128)> {
    if target_amount == 0 {
        return Some((Vec::new(), 0));
    }

    let mut sorted: Vec<&OwnedTokenOutput> = available.iter().collect();
    match strategy {
        SelectionStrategy::SmallFirst => sorted.sort_unstable_by_key(|o| o.amount),
        SelectionStrategy::LargeFirst => sorted.sort_unstable_by(|a, b| b.amount.cmp(&a.amount)),
    }

    let mut selected = Vec::new();
    let mut total = 0u128;
    for output in sorted.into_iter().take(MAX_TOKEN_INPUTS) {
        selected.push(output);
        total = total.saturating_add(output.amount);
        if total >= target_amount {
            return Some((selected, total));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
