//! Feldman verifiable secret sharing over the secp256k1 scalar field.
//!
//! A secret is the constant term of a random polynomial of degree
//! `threshold - 1`. Share `i` is the polynomial evaluated at `x = i`
//! (1-based), and every share carries the public commitments `c_k * G` to
//! each coefficient so a holder can check it without learning the secret.
//!
//! The field is always the curve order `n`: the commitments live on
//! secp256k1, so a share is only checkable modulo `n`. Callers still pass the
//! modulus explicitly and every share records it, which lets
//! [`recover_secret`] refuse to mix shares from incompatible splits.
//!
//! # Example
//!
//! ```
//! use custody_crypto::verifiable_secret_sharing::*;
//!
//! let secret = scalar_from_bytes(&[0x42; 32]).unwrap();
//! let mut rng = rand_core::OsRng;
//! let shares = split_secret_with_proofs(&secret, &SECP256K1_ORDER, 3, 5, &mut rng).unwrap();
//!
//! for share in &shares {
//!     validate_share(share).unwrap();
//! }
//! assert_eq!(recover_secret(&shares[1..4]).unwrap(), secret);
//! ```

use std::collections::HashSet;
use std::fmt;

use k256::elliptic_curve::PrimeField;
use k256::{AffinePoint, FieldBytes, NonZeroScalar, ProjectivePoint, PublicKey, Scalar};
use rand_core::{CryptoRng, RngCore};

/// The secp256k1 group order, big-endian. This is the only supported field.
pub const SECP256K1_ORDER: [u8; 32] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE,
    0xBA, 0xAE, 0xDC, 0xE6, 0xAF, 0x48, 0xA0, 0x3B, 0xBF, 0xD2, 0x5E, 0x8C, 0xD0, 0x36, 0x41, 0x41,
];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors returned by VSS operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VssError {
    /// Threshold is zero or exceeds the number of shares.
    InvalidThreshold { threshold: usize, shares: usize },
    /// The requested field modulus is not the secp256k1 group order.
    UnsupportedModulus,
    /// Byte slice is not 32 bytes.
    InvalidByteLength { expected: usize, got: usize },
    /// Byte value exceeds the secp256k1 scalar field order.
    ScalarOutOfRange,
    /// The secret is zero and cannot be committed to.
    ZeroSecret,
    /// Fewer shares provided than the threshold requires.
    InsufficientShares { required: usize, provided: usize },
    /// Shares disagree on modulus or threshold.
    MismatchedShares,
    /// A share index is zero or appears twice.
    InvalidShareIndex,
    /// Proof vector length does not match the threshold.
    InvalidProofLength { expected: usize, got: usize },
    /// The share does not match the polynomial committed to by its proofs.
    InvalidShare,
}

impl fmt::Display for VssError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidThreshold { threshold, shares } => {
                write!(f, "invalid threshold {threshold} for {shares} shares")
            }
            Self::UnsupportedModulus => write!(f, "field modulus must be the secp256k1 order"),
            Self::InvalidByteLength { expected, got } => {
                write!(f, "invalid byte length: expected {expected}, got {got}")
            }
            Self::ScalarOutOfRange => write!(f, "scalar out of range"),
            Self::ZeroSecret => write!(f, "secret is zero"),
            Self::InsufficientShares { required, provided } => {
                write!(f, "insufficient shares: need {required}, got {provided}")
            }
            Self::MismatchedShares => write!(f, "shares disagree on modulus or threshold"),
            Self::InvalidShareIndex => write!(f, "share index is zero or duplicated"),
            Self::InvalidProofLength { expected, got } => {
                write!(f, "invalid proof length: expected {expected}, got {got}")
            }
            Self::InvalidShare => write!(f, "share does not match its proofs"),
        }
    }
}

impl std::error::Error for VssError {}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A share together with the Feldman commitments to its polynomial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiableSecretShare {
    /// Field modulus, big-endian. Always [`SECP256K1_ORDER`].
    pub field_modulus: [u8; 32],
    /// Minimum number of shares needed for reconstruction.
    pub threshold: usize,
    /// Index (x-coordinate) of this share. Never zero.
    pub index: Scalar,
    /// Value (y-coordinate) of this share.
    pub share: Scalar,
    /// One commitment per polynomial coefficient, constant term first.
    pub proofs: Vec<PublicKey>,
}

// ---------------------------------------------------------------------------
// Scalar helpers
// ---------------------------------------------------------------------------

/// Converts a 32-byte big-endian slice to a secp256k1 scalar.
///
/// # Errors
///
/// Returns [`VssError::InvalidByteLength`] if `bytes.len() != 32`, or
/// [`VssError::ScalarOutOfRange`] if the value is not below the curve order.
pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar, VssError> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| VssError::InvalidByteLength {
        expected: 32,
        got: bytes.len(),
    })?;
    Scalar::from_repr_vartime(FieldBytes::from(arr)).ok_or(VssError::ScalarOutOfRange)
}

/// Serializes a scalar to a 32-byte big-endian array.
pub fn scalar_to_bytes(scalar: &Scalar) -> [u8; 32] {
    scalar.to_bytes().into()
}

fn commit(coefficient: &Scalar) -> Result<PublicKey, VssError> {
    let point = ProjectivePoint::GENERATOR * *coefficient;
    PublicKey::from_affine(AffinePoint::from(point)).map_err(|_| VssError::ZeroSecret)
}

fn scalar_pow(base: &Scalar, exp: usize) -> Scalar {
    let mut result = Scalar::ONE;
    let mut b = *base;
    let mut e = exp;
    while e > 0 {
        if e & 1 == 1 {
            result *= b;
        }
        b *= b;
        e >>= 1;
    }
    result
}

/// Lagrange basis coefficient `L_j(0)` for `x_j` over the point set `xs`.
///
/// `xs` may contain `x_j` itself; it is skipped.
///
/// # Errors
///
/// Returns [`VssError::InvalidShareIndex`] if two points coincide.
pub fn lagrange_coefficient(x_j: &Scalar, xs: &[Scalar]) -> Result<Scalar, VssError> {
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for x_i in xs.iter().filter(|x| *x != x_j) {
        // L_j(0) = prod_{i != j} (0 - x_i) / (x_j - x_i)
        numerator *= -*x_i;
        denominator *= *x_j - *x_i;
    }
    let inverse = denominator
        .invert()
        .into_option()
        .ok_or(VssError::InvalidShareIndex)?;
    Ok(numerator * inverse)
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Splits `secret` into `number_of_shares` verifiable shares, any
/// `threshold` of which recover it.
///
/// With `threshold == 1` the polynomial is constant and every share equals
/// the secret.
///
/// # Errors
///
/// Returns [`VssError::UnsupportedModulus`] for any modulus other than the
/// secp256k1 order, [`VssError::InvalidThreshold`] if `threshold` is zero or
/// exceeds `number_of_shares`, and [`VssError::ZeroSecret`] for a zero secret.
pub fn split_secret_with_proofs(
    secret: &Scalar,
    field_modulus: &[u8; 32],
    threshold: usize,
    number_of_shares: usize,
    rng: &mut (impl CryptoRng + RngCore),
) -> Result<Vec<VerifiableSecretShare>, VssError> {
    if *field_modulus != SECP256K1_ORDER {
        return Err(VssError::UnsupportedModulus);
    }
    if threshold == 0 || threshold > number_of_shares {
        return Err(VssError::InvalidThreshold {
            threshold,
            shares: number_of_shares,
        });
    }

    let mut coefficients = Vec::with_capacity(threshold);
    coefficients.push(*secret);
    for _ in 1..threshold {
        coefficients.push(*NonZeroScalar::random(&mut *rng));
    }
    let proofs = coefficients.iter().map(commit).collect::<Result<Vec<_>, _>>()?;

    let shares = (1..=number_of_shares as u64)
        .map(|i| {
            let index = Scalar::from(i);
            // Horner evaluation, highest coefficient first.
            let share = coefficients
                .iter()
                .rev()
                .fold(Scalar::ZERO, |acc, c| acc * index + c);
            VerifiableSecretShare {
                field_modulus: *field_modulus,
                threshold,
                index,
                share,
                proofs: proofs.clone(),
            }
        })
        .collect();

    Ok(shares)
}

/// Recovers the secret from at least `threshold` shares by Lagrange
/// interpolation at zero.
///
/// Shares are not validated here; run [`validate_share`] on receipt.
///
/// # Errors
///
/// Returns [`VssError::InsufficientShares`] if fewer shares than the threshold
/// are provided, [`VssError::MismatchedShares`] if shares come from splits
/// with a different modulus or threshold, and [`VssError::InvalidShareIndex`]
/// for a zero or repeated index.
pub fn recover_secret(shares: &[VerifiableSecretShare]) -> Result<Scalar, VssError> {
    let first = shares.first().ok_or(VssError::InsufficientShares {
        required: 1,
        provided: 0,
    })?;
    if shares
        .iter()
        .any(|s| s.threshold != first.threshold || s.field_modulus != first.field_modulus)
    {
        return Err(VssError::MismatchedShares);
    }
    if shares.len() < first.threshold {
        return Err(VssError::InsufficientShares {
            required: first.threshold,
            provided: shares.len(),
        });
    }

    let mut seen: HashSet<[u8; 32]> = HashSet::with_capacity(shares.len());
    for s in shares {
        if bool::from(s.index.is_zero()) || !seen.insert(scalar_to_bytes(&s.index)) {
            return Err(VssError::InvalidShareIndex);
        }
    }

    let xs: Vec<Scalar> = shares.iter().map(|s| s.index).collect();
    let mut secret = Scalar::ZERO;
    for s in shares {
        secret += s.share * lagrange_coefficient(&s.index, &xs)?;
    }
    Ok(secret)
}

/// Checks `share * G == sum_k(proof_k * index^k)`.
///
/// # Errors
///
/// Returns [`VssError::InvalidShareIndex`] for index zero,
/// [`VssError::InvalidProofLength`] if the proof count does not match the
/// threshold, and [`VssError::InvalidShare`] if the check fails.
pub fn validate_share(share: &VerifiableSecretShare) -> Result<(), VssError> {
    if bool::from(share.index.is_zero()) {
        return Err(VssError::InvalidShareIndex);
    }
    if share.proofs.len() != share.threshold {
        return Err(VssError::InvalidProofLength {
            expected: share.threshold,
            got: share.proofs.len(),
        });
    }

    let target = ProjectivePoint::GENERATOR * share.share;
    let accumulated = share
        .proofs
        .iter()
        .enumerate()
        .fold(ProjectivePoint::IDENTITY, |acc, (k, proof)| {
            acc + ProjectivePoint::from(*proof.as_affine()) * scalar_pow(&share.index, k)
        });

    if accumulated == target {
        Ok(())
    } else {
        Err(VssError::InvalidShare)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
