use std::fmt;

/// Custom error types for node operations
#[derive(Debug, Clone, PartialEq)]
pub enum NodeError {
    /// Balance below the required fee or transfer amount
    InsufficientFunds { wallet: String, balance: f64, required: f64 },
    /// Domain name already registered and still un-expired, or username taken
    DuplicateName(String),
    /// Unknown asset, contract, block, user or wallet
    NotFound(String),
    /// Non-owner attempt to edit, delete or view private content
    Unauthorized(String),
    /// Mining re-attempted before the cooldown elapsed
    CooldownActive { remaining_secs: f64 },
    /// Sender and recipient are the same wallet
    SelfTransfer,
    /// Transfer amount is zero or negative
    NonPositiveAmount(f64),
    /// Contract source contains a forbidden token
    VmValidation(String),
    /// Contract method raised during execution
    VmRuntime(String),
    /// A single peer could not be reached
    PeerUnreachable(String),
    /// Lost a race on a unique key; the caller may retry
    StoreConflict(String),
    /// Storage layer failure
    Storage(String),
    /// Serialization failure
    Serialization(String),
    /// Malformed caller input
    InvalidInput(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::InsufficientFunds { wallet, balance, required } => {
                write!(f, "Insufficient funds for {}: have {}, need {}", wallet, balance, required)
            }
            NodeError::DuplicateName(name) => write!(f, "Name already taken: {}", name),
            NodeError::NotFound(what) => write!(f, "Not found: {}", what),
            NodeError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            NodeError::CooldownActive { remaining_secs } => {
                write!(f, "Mining cooldown active: {:.0}s remaining", remaining_secs)
            }
            NodeError::SelfTransfer => write!(f, "Sender and recipient cannot be the same"),
            NodeError::NonPositiveAmount(amount) => {
                write!(f, "Amount must be positive, got {}", amount)
            }
            NodeError::VmValidation(msg) => write!(f, "Contract validation failed: {}", msg),
            NodeError::VmRuntime(msg) => write!(f, "Contract execution failed: {}", msg),
            NodeError::PeerUnreachable(peer) => write!(f, "Peer unreachable: {}", peer),
            NodeError::StoreConflict(msg) => write!(f, "Store conflict: {}", msg),
            NodeError::Storage(msg) => write!(f, "Storage error: {}", msg),
            NodeError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            NodeError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
        }
    }
}

impl std::error::Error for NodeError {}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<sled::Error> for NodeError {
    fn from(err: sled::Error) -> Self {
        NodeError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(err: reqwest::Error) -> Self {
        NodeError::PeerUnreachable(err.to_string())
    }
}

impl From<crate::vm::VmError> for NodeError {
    fn from(err: crate::vm::VmError) -> Self {
        match err {
            crate::vm::VmError::Validation(msg) => NodeError::VmValidation(msg),
            crate::vm::VmError::Runtime(msg) => NodeError::VmRuntime(msg),
        }
    }
}
