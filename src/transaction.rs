use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{utils, NodeError, Result, SYSTEM_SENDER, TREASURY_WALLET};

/// Represents a coin movement between two wallets
///
/// A transaction sits in the mempool with `block_index == 0` until a block
/// confirms it. Coinbase transactions carry the system sender and are created
/// already confirmed. `settled` records whether the balance movement has been
/// applied locally; transactions received from peers settle at confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    /// Unique identifier, de-duplicated across the network
    pub tx_id: String,
    /// Sender wallet identifier, or the system sentinel for coinbase
    pub sender: String,
    /// Recipient wallet identifier
    pub recipient: String,
    /// Amount moved
    pub amount: f64,
    /// Creation time in seconds since the Unix epoch
    pub timestamp: f64,
    /// Confirming block index, 0 while in the mempool
    pub block_index: u64,
    /// Whether both balance sides have been applied on this node
    #[serde(default = "default_settled")]
    pub settled: bool,
}

fn default_settled() -> bool {
    true
}

impl Transaction {
    /// Create a wallet-to-wallet transfer, unconfirmed
    ///
    /// # Arguments
    /// * `sender` - Sending wallet identifier
    /// * `recipient` - Receiving wallet identifier
    /// * `amount` - Amount to move, must be positive
    ///
    /// # Returns
    /// * `Result<Transaction>` - The transaction, or a validation error
    pub fn new_transfer(sender: &str, recipient: &str, amount: f64) -> Result<Self> {
        if sender == recipient {
            return Err(NodeError::SelfTransfer);
        }
        if amount <= 0.0 {
            return Err(NodeError::NonPositiveAmount(amount));
        }
        if sender.is_empty() || recipient.is_empty() {
            return Err(NodeError::InvalidInput(
                "sender and recipient cannot be empty".to_string(),
            ));
        }

        let tx = Transaction {
            tx_id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            timestamp: utils::now_ts(),
            block_index: 0,
            settled: true,
        };
        debug!("Created transfer transaction {}", tx.tx_id);
        Ok(tx)
    }

    /// Create the coinbase transaction of a freshly committed block
    pub fn coinbase(recipient: &str, amount: f64, block_index: u64, timestamp: f64) -> Self {
        Transaction {
            tx_id: Uuid::new_v4().to_string(),
            sender: SYSTEM_SENDER.to_string(),
            recipient: recipient.to_string(),
            amount,
            timestamp,
            block_index,
            settled: true,
        }
    }

    /// Create a network-fee transaction crediting the treasury, unconfirmed
    pub fn fee(sender: &str, amount: f64) -> Self {
        Transaction {
            tx_id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            recipient: TREASURY_WALLET.to_string(),
            amount,
            timestamp: utils::now_ts(),
            block_index: 0,
            settled: true,
        }
    }

    /// True when the sender is the system sentinel
    pub fn is_coinbase(&self) -> bool {
        self.sender == SYSTEM_SENDER
    }

    /// True while the transaction waits in the mempool
    pub fn is_pending(&self) -> bool {
        self.block_index == 0
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {}: {} (block #{})",
            self.sender, self.recipient, self.amount, self.block_index
        )
    }
}
