//! Transfer state machine.
//!
//! A transfer moves a set of leaves from a sender to a receiver by
//! re-keying them in two steps:
//!
//! ```text
//! SenderInitiated -> SenderKeyTweakPending -> SenderKeyTweaked
//!     -> ReceiverKeyTweaked -> ReceiverRefundSigned -> Completed
//! ```
//!
//! Any non-terminal state may expire. Only the sender may cancel, and only
//! while the sender's key tweak has not been applied.
//!
//! The sending side lives in [`send`], the receiving side in [`pending`]
//! (listing and verification) and [`claim`].

pub mod claim;
pub mod pending;
pub mod send;

use std::fmt;

use bitcoin::secp256k1::PublicKey;

use crate::leaf::Leaf;

// ---------------------------------------------------------------------------
// TransferStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a transfer, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransferStatus {
    SenderInitiated,
    SenderKeyTweakPending,
    SenderKeyTweaked,
    ReceiverKeyTweaked,
    ReceiverRefundSigned,
    Completed,
    Expired,
    Cancelled,
}

impl TransferStatus {
    /// `Completed`, `Expired` and `Cancelled` admit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Cancelled)
    }

    /// Whether the sender's key tweak has been applied.
    pub fn is_sender_tweaked(self) -> bool {
        matches!(
            self,
            Self::SenderKeyTweaked
                | Self::ReceiverKeyTweaked
                | Self::ReceiverRefundSigned
                | Self::Completed
        )
    }

    /// Whether the transfer is waiting on its receiver.
    pub fn is_claimable(self) -> bool {
        matches!(
            self,
            Self::SenderKeyTweakPending
                | Self::SenderKeyTweaked
                | Self::ReceiverKeyTweaked
                | Self::ReceiverRefundSigned
        )
    }

    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(self, next: Self) -> bool {
        use TransferStatus::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Expired => true,
            Cancelled => matches!(self, SenderInitiated | SenderKeyTweakPending),
            SenderKeyTweakPending => self == SenderInitiated,
            SenderKeyTweaked => self == SenderKeyTweakPending,
            ReceiverKeyTweaked => self == SenderKeyTweaked,
            ReceiverRefundSigned => self == ReceiverKeyTweaked,
            Completed => self == ReceiverRefundSigned,
            SenderInitiated => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SenderInitiated => "sender_initiated",
            Self::SenderKeyTweakPending => "sender_key_tweak_pending",
            Self::SenderKeyTweaked => "sender_key_tweaked",
            Self::ReceiverKeyTweaked => "receiver_key_tweaked",
            Self::ReceiverRefundSigned => "receiver_refund_signed",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

/// One leaf inside a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLeaf {
    pub leaf: Leaf,
    /// The sender's key share before the transfer.
    pub old_signing_public_key: PublicKey,
    /// The intermediate key the sender claims to have encrypted.
    pub new_signing_public_key: PublicKey,
    /// ECIES ciphertext of the intermediate key, for the receiver.
    pub secret_cipher: Vec<u8>,
    /// Sender ECDSA over `sha256(leaf_id ‖ transfer_id ‖ secret_cipher)`.
    pub signature: Vec<u8>,
    /// Refund to the receiver, signed under the leaf key.
    pub intermediate_refund_tx: Vec<u8>,
}

/// A transfer as reported by the operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// UUIDv4.
    pub id: String,
    pub sender_identity_public_key: PublicKey,
    pub receiver_identity_public_key: PublicKey,
    /// UNIX seconds.
    pub expiry_time: u64,
    pub status: TransferStatus,
    pub leaves: Vec<TransferLeaf>,
}

impl Transfer {
    /// Whether the transfer is past its expiry and still unfinished.
    ///
    /// The operators' view is authoritative: callers must query the
    /// transfer before acting on a locally expired one.
    pub fn is_expired(&self, now: u64) -> bool {
        !self.status.is_terminal() && now >= self.expiry_time
    }

    /// Total value of the transferred leaves.
    pub fn total_value(&self) -> u64 {
        self.leaves.iter().map(|l| l.leaf.value).sum()
    }
}

/// Digest the sender signs for each transferred leaf.
pub(crate) fn leaf_package_digest(leaf_id: &str, transfer_id: &str, secret_cipher: &[u8]) -> [u8; 32] {
    use bitcoin::hashes::{sha256, Hash, HashEngine};
    let mut engine = sha256::Hash::engine();
    engine.input(leaf_id.as_bytes());
    engine.input(transfer_id.as_bytes());
    engine.input(secret_cipher);
    sha256::Hash::from_engine(engine).to_byte_array()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf::testing::{leaf, public_key};
    use TransferStatus::*;

    const ALL: [TransferStatus; 8] = [
        SenderInitiated,
        SenderKeyTweakPending,
        SenderKeyTweaked,
        ReceiverKeyTweaked,
        ReceiverRefundSigned,
        Completed,
        Expired,
        Cancelled,
    ];

    #[test]
    fn forward_path_is_legal() {
        let path = [
            SenderInitiated,
            SenderKeyTweakPending,
            SenderKeyTweaked,
            ReceiverKeyTweaked,
            ReceiverRefundSigned,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert!(!pair[1].can_transition_to(pair[0]), "{} -> {}", pair[1], pair[0]);
        }
        assert!(!SenderKeyTweakPending.can_transition_to(ReceiverKeyTweaked));
    }

    #[test]
    fn any_open_state_can_expire() {
        for status in ALL {
            assert_eq!(status.can_transition_to(Expired), !status.is_terminal(), "{status}");
        }
    }

    #[test]
    fn cancel_only_before_sender_tweak() {
        for status in ALL {
            let expected = matches!(status, SenderInitiated | SenderKeyTweakPending);
            assert_eq!(status.can_transition_to(Cancelled), expected, "{status}");
            if status.is_sender_tweaked() {
                assert!(!expected);
            }
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for from in [Completed, Expired, Cancelled] {
            assert!(ALL.iter().all(|to| !from.can_transition_to(*to)));
        }
    }

    #[test]
    fn expiry_ignores_terminal_transfers() {
        let mut transfer = Transfer {
            id: "t".into(),
            sender_identity_public_key: public_key(1),
            receiver_identity_public_key: public_key(2),
            expiry_time: 100,
            status: SenderKeyTweaked,
            leaves: vec![TransferLeaf {
                leaf: leaf("a", 1000),
                old_signing_public_key: public_key(3),
                new_signing_public_key: public_key(4),
                secret_cipher: Vec::new(),
                signature: Vec::new(),
                intermediate_refund_tx: Vec::new(),
            }],
        };
        assert!(!transfer.is_expired(99));
        assert!(transfer.is_expired(100));
        assert_eq!(transfer.total_value(), 1000);

        transfer.status = Completed;
        assert!(!transfer.is_expired(1_000));
    }
}
