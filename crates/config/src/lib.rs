//! Network configuration for the leaf custody client.
//!
//! This crate provides per-network configuration:
//!
//! - [`Network`] -- network identifier, with the numeric value used in
//!   canonical transaction hashing
//! - [`NetworkConfig`] -- signing operators, coordinator, and threshold
//! - [`OperatorInfo`] -- information about a single signing operator
//! - [`constants`] -- protocol-level parameters (timelocks, sequence flags,
//!   withdrawal bond defaults)
//!
//! `config` has no dependencies, so every other crate in the workspace can
//! use it as a leaf dependency.

pub mod constants;
pub mod operators;

pub use operators::OperatorInfo;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use operators::{MAINNET_OPERATORS, REGTEST_OPERATORS};

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Network identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Mainnet,
    Regtest,
    Testnet,
    Signet,
}

impl Network {
    /// Numeric value committed to by the canonical token transaction hash.
    ///
    /// Zero is reserved for "unspecified" and never produced here.
    pub const fn wire_value(self) -> u32 {
        match self {
            Self::Mainnet => 1,
            Self::Regtest => 2,
            Self::Testnet => 3,
            Self::Signet => 4,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Regtest => write!(f, "regtest"),
            Self::Testnet => write!(f, "testnet"),
            Self::Signet => write!(f, "signet"),
        }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors from building a custom [`NetworkConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The operator list is empty.
    NoOperators,
    /// The coordinator index does not point into the operator list.
    CoordinatorOutOfRange { index: usize, operators: usize },
    /// The threshold is zero or larger than the operator count.
    InvalidThreshold { threshold: usize, operators: usize },
    /// Two operators share the same identifier.
    DuplicateOperator(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOperators => write!(f, "no signing operators configured"),
            Self::CoordinatorOutOfRange { index, operators } => {
                write!(f, "coordinator index {index} out of range for {operators} operators")
            }
            Self::InvalidThreshold {
                threshold,
                operators,
            } => write!(f, "threshold {threshold} invalid for {operators} operators"),
            Self::DuplicateOperator(id) => write!(f, "duplicate operator identifier {id}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// NetworkConfig
// ---------------------------------------------------------------------------

/// Network-specific configuration: signing operators and FROST threshold.
///
/// Cheap to clone (the operator list is shared behind an `Arc`). The
/// coordinator is identified by index into the operator list, guaranteeing
/// exactly one coordinator.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// The network this configuration is for.
    pub network: Network,

    /// Signing operators for this network.
    operators: Arc<[OperatorInfo]>,

    /// Index into `operators` identifying the coordinator.
    coordinator_index: usize,

    /// FROST signing threshold (t of n).
    pub threshold: usize,
}

impl NetworkConfig {
    /// Get the built-in configuration for a network.
    ///
    /// Testnet and signet share the regtest operator table.
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            other => Self {
                network: other,
                ..Self::regtest()
            },
        }
    }

    /// Production mainnet configuration (3 operators, threshold 2).
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            operators: MAINNET_OPERATORS.iter().map(OperatorInfo::from_static).collect(),
            coordinator_index: 0,
            threshold: 2,
        }
    }

    /// Local regtest configuration (5 operators, threshold 3).
    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            operators: REGTEST_OPERATORS.iter().map(OperatorInfo::from_static).collect(),
            coordinator_index: 0,
            threshold: 3,
        }
    }

    /// Build a configuration from an explicit operator set.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the operator list is empty, contains a
    /// duplicate identifier, the coordinator index is out of range, or the
    /// threshold is zero or exceeds the operator count.
    pub fn custom(
        network: Network,
        operators: Vec<OperatorInfo>,
        coordinator_index: usize,
        threshold: usize,
    ) -> Result<Self, ConfigError> {
        if operators.is_empty() {
            return Err(ConfigError::NoOperators);
        }
        if coordinator_index >= operators.len() {
            return Err(ConfigError::CoordinatorOutOfRange {
                index: coordinator_index,
                operators: operators.len(),
            });
        }
        if threshold == 0 || threshold > operators.len() {
            return Err(ConfigError::InvalidThreshold {
                threshold,
                operators: operators.len(),
            });
        }
        let mut seen = HashSet::with_capacity(operators.len());
        for op in &operators {
            if !seen.insert(op.id.as_str()) {
                return Err(ConfigError::DuplicateOperator(op.id.clone()));
            }
        }

        Ok(Self {
            network,
            operators: operators.into(),
            coordinator_index,
            threshold,
        })
    }

    /// Returns the list of operators.
    pub fn operators(&self) -> &[OperatorInfo] {
        &self.operators
    }

    /// Returns the number of operators.
    pub fn num_operators(&self) -> usize {
        self.operators.len()
    }

    /// Returns the coordinator operator.
    pub fn coordinator(&self) -> &OperatorInfo {
        &self.operators[self.coordinator_index]
    }

    /// Looks up an operator by its identifier.
    pub fn operator(&self, id: &str) -> Option<&OperatorInfo> {
        self.operators.iter().find(|op| op.id == id)
    }

    /// Iterates over every operator except the coordinator.
    pub fn non_coordinators(&self) -> impl Iterator<Item = &OperatorInfo> {
        let coordinator = self.coordinator_index;
        self.operators
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != coordinator)
            .map(|(_, op)| op)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
