//! Signing operator definitions and built-in per-network tables.
//!
//! Operators jointly custody every leaf: each holds a share of the leaf's
//! threshold key and participates in signing rounds for node and refund
//! transactions.

// ---------------------------------------------------------------------------
// OperatorInfo
// ---------------------------------------------------------------------------

/// Information about a single signing operator.
///
/// Whether an operator is the coordinator is a network-level property, not
/// an operator-level one -- see [`crate::NetworkConfig::coordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorInfo {
    /// Numeric index of the operator (0-based).
    pub index: u32,

    /// FROST identifier (64-char hex string, 32 bytes).
    pub id: String,

    /// RPC endpoint URL.
    pub address: String,

    /// Identity public key (33-byte compressed, hex-encoded).
    pub identity_public_key: String,
}

impl OperatorInfo {
    pub(crate) fn from_static(op: &StaticOperator) -> Self {
        Self {
            index: op.index,
            id: op.id.to_owned(),
            address: op.address.to_owned(),
            identity_public_key: op.identity_public_key.to_owned(),
        }
    }
}

/// Compile-time operator entry backing the built-in tables.
pub(crate) struct StaticOperator {
    index: u32,
    id: &'static str,
    address: &'static str,
    identity_public_key: &'static str,
}

// ---------------------------------------------------------------------------
// Operator tables
// ---------------------------------------------------------------------------

pub(crate) const MAINNET_OPERATORS: [StaticOperator; 3] = [
    StaticOperator {
        index: 0,
        id: "0000000000000000000000000000000000000000000000000000000000000001",
        address: "https://operator-0.custody.network",
        identity_public_key: "03dfbdff4b6332c220f8fa2ba8ed496c698ceada563fa01b67d9983bfc5c95e763",
    },
    StaticOperator {
        index: 1,
        id: "0000000000000000000000000000000000000000000000000000000000000002",
        address: "https://operator-1.custody.network",
        identity_public_key: "03e625e9768651c9be268e287245cc33f96a68ce9141b0b4769205db027ee8ed77",
    },
    StaticOperator {
        index: 2,
        id: "0000000000000000000000000000000000000000000000000000000000000003",
        address: "https://operator-2.custody.network",
        identity_public_key: "022eda13465a59205413086130a65dc0ed1b8f8e51937043161f8be0c369b1a410",
    },
];

pub(crate) const REGTEST_OPERATORS: [StaticOperator; 5] = [
    StaticOperator {
        index: 0,
        id: "0000000000000000000000000000000000000000000000000000000000000001",
        address: "https://localhost:8535",
        identity_public_key: "0322ca18fc489ae25418a0e768273c2c61cabb823edfb14feb891e9bec62016510",
    },
    StaticOperator {
        index: 1,
        id: "0000000000000000000000000000000000000000000000000000000000000002",
        address: "https://localhost:8536",
        identity_public_key: "0341727a6c41b168f07eb50865ab8c397a53c7eef628ac1020956b705e43b6cb27",
    },
    StaticOperator {
        index: 2,
        id: "0000000000000000000000000000000000000000000000000000000000000003",
        address: "https://localhost:8537",
        identity_public_key: "0305ab8d485cc752394de4981f8a5ae004f2becfea6f432c9a59d5022d8764f0a6",
    },
    StaticOperator {
        index: 3,
        id: "0000000000000000000000000000000000000000000000000000000000000004",
        address: "https://localhost:8538",
        identity_public_key: "0352aef4d49439dedd798ac4aef1e7ebef95f569545b647a25338398c1247ffdea",
    },
    StaticOperator {
        index: 4,
        id: "0000000000000000000000000000000000000000000000000000000000000005",
        address: "https://localhost:8539",
        identity_public_key: "02c05c88cc8fc181b1ba30006df6a4b0597de6490e24514fbdd0266d2b9cd3d0ba",
    },
];
