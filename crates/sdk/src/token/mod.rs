//! Token output management.
//!
//! Manages the set of token outputs representing token balances, the
//! canonical transaction hash, and validation of operator-completed
//! transactions. Token operations use ECDSA identity key signatures (not
//! FROST).

mod hash;
mod memory;
mod ops;
mod selection;
mod store;
mod transaction;
mod validate;

pub use hash::hash_token_transaction;
pub use memory::InMemoryTokenStore;
pub use ops::{freeze_payload_digest, IssuerExtensions, TokenTransactionResult};
pub use selection::{select_token_outputs, SelectionStrategy};
pub use store::{AcquiredOutputs, LockId, OwnedTokenOutput, TokenStore};
pub use transaction::{
    KeyshareInfo, OutputRef, TokenAmount, TokenInputs, TokenOutput, TokenPublicKey,
    TokenTransaction, BURN_PUBLIC_KEY,
};
pub use validate::{validate_token_transaction, TokenValidationError};
