//! In-memory token store backed by `RwLock<HashMap>`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::SdkError;

use super::selection::{select_token_outputs, SelectionStrategy};
use super::store::{AcquiredOutputs, LockId, OwnedTokenOutput, TokenStore};
use super::transaction::TokenPublicKey;

/// Default lifetime of an unreleased lock.
const DEFAULT_LOCK_EXPIRY: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Lock state
// ---------------------------------------------------------------------------

struct OutputLock {
    output_ids: Vec<String>,
    created_at: Instant,
}

#[derive(Default)]
struct Locks {
    by_id: HashMap<LockId, OutputLock>,
    locked_outputs: HashSet<String>,
}

impl Locks {
    fn remove(&mut self, lock_id: LockId) -> Result<Vec<String>, SdkError> {
        let lock = self.by_id.remove(&lock_id).ok_or(SdkError::LockNotFound)?;
        for id in &lock.output_ids {
            self.locked_outputs.remove(id);
        }
        Ok(lock.output_ids)
    }

    fn expire(&mut self, max_age: Duration) {
        let now = Instant::now();
        let locked_outputs = &mut self.locked_outputs;
        self.by_id.retain(|_, lock| {
            if now.duration_since(lock.created_at) > max_age {
                for id in &lock.output_ids {
                    locked_outputs.remove(id);
                }
                false
            } else {
                true
            }
        });
    }
}

// ---------------------------------------------------------------------------
// InMemoryTokenStore
// ---------------------------------------------------------------------------

/// In-memory token store with local output locking.
///
/// Outputs are keyed by their ID. Locks expire so an abandoned operation
/// cannot hold outputs forever.
pub struct InMemoryTokenStore {
    outputs: RwLock<HashMap<String, OwnedTokenOutput>>,
    locks: RwLock<Locks>,
    next_lock: AtomicU64,
    strategy: SelectionStrategy,
    lock_expiry: Duration,
}

impl InMemoryTokenStore {
    /// Creates an empty store selecting small outputs first.
    pub fn new() -> Self {
        Self::with_strategy(SelectionStrategy::default())
    }

    /// Creates an empty store with the given selection strategy.
    pub fn with_strategy(strategy: SelectionStrategy) -> Self {
        Self {
            outputs: RwLock::new(HashMap::new()),
            locks: RwLock::new(Locks::default()),
            next_lock: AtomicU64::new(1),
            strategy,
            lock_expiry: DEFAULT_LOCK_EXPIRY,
        }
    }

    /// Overrides how long an unreleased lock holds its outputs.
    pub fn with_lock_expiry(mut self, lock_expiry: Duration) -> Self {
        self.lock_expiry = lock_expiry;
        self
    }

    fn locks(&self) -> std::sync::RwLockWriteGuard<'_, Locks> {
        let mut locks = self.locks.write().unwrap_or_else(PoisonError::into_inner);
        locks.expire(self.lock_expiry);
        locks
    }
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore for InMemoryTokenStore {
    fn set_outputs(&self, outputs: &[OwnedTokenOutput]) -> Result<(), SdkError> {
        let mut map = self.outputs.write().unwrap_or_else(PoisonError::into_inner);

        let updated: HashSet<TokenPublicKey> =
            outputs.iter().map(|o| o.token_public_key).collect();
        map.retain(|_, o| !updated.contains(&o.token_public_key));

        for output in outputs {
            map.insert(output.id.clone(), output.clone());
        }
        Ok(())
    }

    fn insert_outputs(&self, outputs: &[OwnedTokenOutput]) -> Result<(), SdkError> {
        let mut map = self.outputs.write().unwrap_or_else(PoisonError::into_inner);
        for output in outputs {
            map.insert(output.id.clone(), output.clone());
        }
        Ok(())
    }

    fn acquire_outputs(
        &self,
        token_public_key: &TokenPublicKey,
        amount: u128,
    ) -> Result<AcquiredOutputs, SdkError> {
        let outputs = self.outputs.read().unwrap_or_else(PoisonError::into_inner);
        let mut locks = self.locks();

        let available: Vec<OwnedTokenOutput> = outputs
            .values()
            .filter(|o| {
                o.token_public_key == *token_public_key && !locks.locked_outputs.contains(&o.id)
            })
            .cloned()
            .collect();

        let (selected, total_amount) = select_token_outputs(&available, amount, self.strategy)
            .ok_or(SdkError::InsufficientTokenBalance)?;
        let selected: Vec<OwnedTokenOutput> = selected.into_iter().cloned().collect();
        let output_ids: Vec<String> = selected.iter().map(|o| o.id.clone()).collect();

        let lock_id = LockId(self.next_lock.fetch_add(1, Ordering::Relaxed));
        locks.locked_outputs.extend(output_ids.iter().cloned());
        locks.by_id.insert(
            lock_id,
            OutputLock {
                output_ids,
                created_at: Instant::now(),
            },
        );

        Ok(AcquiredOutputs {
            lock_id,
            outputs: selected,
            total_amount,
        })
    }

    fn release_outputs(&self, lock_id: LockId) -> Result<(), SdkError> {
        self.locks().remove(lock_id).map(drop)
    }

    fn spend_outputs(&self, lock_id: LockId) -> Result<(), SdkError> {
        let mut map = self.outputs.write().unwrap_or_else(PoisonError::into_inner);
        for id in self.locks().remove(lock_id)? {
            map.remove(&id);
        }
        Ok(())
    }

    fn get_balance(&self, token_public_key: &TokenPublicKey) -> Result<u128, SdkError> {
        let outputs = self.outputs.read().unwrap_or_else(PoisonError::into_inner);
        let locks = self.locks();
        Ok(outputs
            .values()
            .filter(|o| {
                o.token_public_key == *token_public_key && !locks.locked_outputs.contains(&o.id)
            })
            .map(|o| o.amount)
            .sum())
    }

    fn list_tokens(&self) -> Result<Vec<TokenPublicKey>, SdkError> {
        let outputs = self.outputs.read().unwrap_or_else(PoisonError::into_inner);
        let tokens: HashSet<TokenPublicKey> =
            outputs.values().map(|o| o.token_public_key).collect();
        Ok(tokens.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
