//! Per-operator session cache.
//!
//! Tokens are stored per (operator index, identity key). Each operator slot
//! has its own [`RwLock`], so lookups for different operators never contend.
//! A session is treated as expired [`EXPIRY_BUFFER_SECS`] before its actual
//! expiry so a token cannot lapse mid-request.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use bytes::Bytes;
use custody_signer::PubKey;

use crate::utils::unix_now;

/// Sessions are considered expired this many seconds early.
pub const EXPIRY_BUFFER_SECS: i64 = 30;

struct CachedSession {
    /// `Bytes::clone()` is a ref-count increment.
    token: Bytes,
    /// UNIX seconds.
    expires_at: i64,
}

/// Session tokens keyed by operator index and identity key.
pub struct SessionCache {
    operators: Box<[RwLock<HashMap<PubKey, CachedSession>>]>,
}

impl SessionCache {
    /// Creates a cache with `operator_count` empty slots.
    pub fn new(operator_count: usize) -> Self {
        let operators = (0..operator_count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { operators }
    }

    /// The cached token, if present and not about to expire.
    pub fn get(&self, operator_idx: usize, pubkey: &PubKey) -> Option<Bytes> {
        let now = i64::try_from(unix_now()).unwrap_or(i64::MAX);
        let map = self
            .operators
            .get(operator_idx)?
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let session = map.get(pubkey)?;
        (session.expires_at - EXPIRY_BUFFER_SECS > now).then(|| session.token.clone())
    }

    /// Inserts or replaces a session.
    pub fn insert(&self, operator_idx: usize, pubkey: PubKey, token: Bytes, expires_at: i64) {
        if let Some(slot) = self.operators.get(operator_idx) {
            slot.write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(pubkey, CachedSession { token, expires_at });
        }
    }

    /// Drops a session the operator rejected.
    pub fn invalidate(&self, operator_idx: usize, pubkey: &PubKey) {
        if let Some(slot) = self.operators.get(operator_idx) {
            slot.write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(pubkey);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn pubkey(seed: u8) -> PubKey {
        let mut pk = [0x02u8; 33];
        pk[1] = seed;
        pk
    }

    fn now() -> i64 {
        unix_now() as i64
    }

    #[test]
    fn empty_cache_misses() {
        let cache = SessionCache::new(3);
        assert!(cache.get(0, &pubkey(1)).is_none());
        assert!(cache.get(7, &pubkey(1)).is_none());
    }

    #[test]
    fn insert_then_get() {
        let cache = SessionCache::new(2);
        let token = Bytes::from_static(b"session-token");
        cache.insert(1, pubkey(1), token.clone(), now() + 3600);
        assert_eq!(cache.get(1, &pubkey(1)), Some(token));
        assert!(cache.get(0, &pubkey(1)).is_none());
        assert!(cache.get(1, &pubkey(2)).is_none());
    }

    #[test]
    fn expiry_buffer_is_applied() {
        let cache = SessionCache::new(1);
        cache.insert(0, pubkey(3), Bytes::from_static(b"almost-expired"), now() + 10);
        assert!(cache.get(0, &pubkey(3)).is_none());

        cache.insert(0, pubkey(3), Bytes::from_static(b"still-valid"), now() + 60);
        assert!(cache.get(0, &pubkey(3)).is_some());
    }

    #[test]
    fn invalidate_removes_session() {
        let cache = SessionCache::new(1);
        cache.insert(0, pubkey(4), Bytes::from_static(b"t"), now() + 3600);
        cache.invalidate(0, &pubkey(4));
        assert!(cache.get(0, &pubkey(4)).is_none());
    }
}
