//! Quorum fan-out over the operator set.
//!
//! [`quorum_join`] drives one future per operator concurrently and returns
//! as soon as `required` of them have succeeded. Slower operators are
//! dropped, not awaited. If the stream runs dry first, the per-operator
//! failures are returned together as a [`QuorumError`].

use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::warn;

use crate::error::QuorumError;
use crate::SdkError;

/// Runs `calls` concurrently until `required` succeed.
///
/// Each call is paired with the id of the operator it targets. Results are
/// returned in completion order. A `required` of zero is treated as one: a
/// fan-out with no successful response never succeeds.
///
/// # Errors
///
/// Returns [`QuorumError`] if fewer than `required` calls succeed.
pub async fn quorum_join<T, F>(
    required: usize,
    calls: impl IntoIterator<Item = (String, F)>,
) -> Result<Vec<(String, T)>, QuorumError>
where
    F: Future<Output = Result<T, SdkError>>,
{
    let required = required.max(1);
    let mut pending: FuturesUnordered<_> = calls
        .into_iter()
        .map(|(operator, call)| async move { (operator, call.await) })
        .collect();

    let mut succeeded = Vec::with_capacity(required);
    let mut failures = Vec::new();

    while let Some((operator, result)) = pending.next().await {
        match result {
            Ok(value) => {
                succeeded.push((operator, value));
                if succeeded.len() >= required {
                    return Ok(succeeded);
                }
            }
            Err(err) => {
                warn!(operator = %operator, error = %err, "operator call failed");
                failures.push((operator, err));
            }
        }
    }

    Err(QuorumError {
        required,
        succeeded: succeeded.len(),
        failures,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
