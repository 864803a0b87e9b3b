//! Protocol constants.
//!
//! Timelock parameters for refund re-signing, the sequence flag carried by
//! every protocol transaction input, and the expected withdrawal parameters
//! operators attach to token outputs.

/// Initial relative timelock for new leaves (in blocks).
pub const INITIAL_TIMELOCK: u16 = 2000;

/// Timelock decrement applied on every refund re-signature (in blocks).
pub const TIMELOCK_INTERVAL: u16 = 100;

/// Sequence flag (bit 30) marking protocol transaction inputs.
pub const SEQUENCE_FLAG: u32 = 1 << 30;

/// Mask for extracting the timelock value from a sequence number.
pub const TIMELOCK_MASK: u32 = 0x0000_FFFF;

/// Default expected withdraw bond in satoshis.
pub const DEFAULT_WITHDRAW_BOND_SATS: u64 = 10_000;

/// Default expected relative block locktime for withdrawals.
pub const DEFAULT_WITHDRAW_RELATIVE_LOCKTIME: u64 = 1_000;

/// Default lifetime of an outgoing transfer before operators expire it.
pub const DEFAULT_TRANSFER_EXPIRY_SECS: u64 = 60 * 60;

/// Number of attempts for a transfer send round before giving up.
pub const DEFAULT_SEND_ATTEMPTS: u32 = 3;

/// Maximum width of a token amount on the wire, in bytes.
pub const MAX_TOKEN_AMOUNT_BYTES: usize = 16;

/// Maximum number of token outputs spent by one transaction.
pub const MAX_TOKEN_INPUTS: usize = 500;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timelock_allows_nineteen_renewals() {
        // 2000 -> 100 in steps of 100; the step to 0 is not allowed.
        let renewals = (INITIAL_TIMELOCK / TIMELOCK_INTERVAL) - 1;
        assert_eq!(renewals, 19);
    }

    #[test]
    fn sequence_flag_is_outside_timelock_mask() {
        assert_eq!(SEQUENCE_FLAG, 0x4000_0000);
        assert_eq!(SEQUENCE_FLAG & TIMELOCK_MASK, 0);
    }
}
