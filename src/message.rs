use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{self, keys, Store};
use crate::transaction::Transaction;
use crate::{utils, NodeError, Result, TREASURY_WALLET};

/// Payload marker carried by friend invites
pub const INVITE_MARKER: &str = "__invite__";

/// A directed wallet-to-wallet message
///
/// The payload is stored base64-encoded; that is obfuscation for casual
/// readers of the store, not encryption. Messages are append-only and
/// de-duplicated on id across the network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub msg_id: String,
    pub sender: String,
    pub recipient: String,
    /// Base64-encoded payload
    pub content: String,
    /// Optional attached asset
    pub asset_id: Option<String>,
    pub timestamp: f64,
    /// Confirming block index, 0 while unconfirmed
    #[serde(default)]
    pub block_index: u64,
}

impl Message {
    /// Decode the payload for presentation
    pub fn decoded_content(&self) -> String {
        match utils::b64_decode(&self.content) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => self.content.clone(),
        }
    }

    /// True for the administrative friend-invite payload
    pub fn is_invite(&self) -> bool {
        self.decoded_content() == INVITE_MARKER
    }
}

/// One side of a conversation, payload already decoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub msg_id: String,
    pub sender: String,
    pub recipient: String,
    pub text: String,
    pub asset_id: Option<String>,
    pub timestamp: f64,
}

/// Fee-charged append-only message log
#[derive(Debug, Clone)]
pub struct MessageLog {
    store: Arc<Store>,
}

impl MessageLog {
    pub fn new(store: Arc<Store>) -> Self {
        MessageLog { store }
    }

    /// Send a message, charging the `msg_fee` to the treasury atomically
    ///
    /// # Returns
    /// * `Result<(Message, Transaction)>` - The message and its fee transaction
    pub fn send(
        &self,
        sender: &str,
        recipient: &str,
        text: &str,
        asset_id: Option<String>,
    ) -> Result<(Message, Transaction)> {
        if sender == recipient {
            return Err(NodeError::SelfTransfer);
        }
        if text.is_empty() {
            return Err(NodeError::InvalidInput("message content is required".to_string()));
        }
        let fee = self.store.fee("msg_fee")?;
        let message = self.commit(sender, recipient, text, asset_id, fee)?;
        info!("Sent message {} from {} to {}", message.0.msg_id, sender, recipient);
        Ok(message)
    }

    /// Send a friend invite, charging the `invite_fee`
    ///
    /// Adds the symmetric friendship locally; remote nodes apply it when the
    /// gossiped invite arrives.
    pub fn invite(&self, sender: &str, recipient: &str) -> Result<(Message, Transaction)> {
        if sender == recipient {
            return Err(NodeError::SelfTransfer);
        }
        let fee = self.store.fee("invite_fee")?;
        let message = self.commit(sender, recipient, INVITE_MARKER, None, fee)?;
        info!("Sent invite from {} to {}", sender, recipient);
        Ok(message)
    }

    fn commit(
        &self,
        sender: &str,
        recipient: &str,
        text: &str,
        asset_id: Option<String>,
        fee: f64,
    ) -> Result<(Message, Transaction)> {
        let message = Message {
            msg_id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            content: utils::b64_encode(text),
            asset_id,
            timestamp: utils::now_ts(),
            block_index: 0,
        };
        let fee_tx = Transaction::fee(sender, fee);
        let is_invite = text == INVITE_MARKER;

        self.store.transact(|tree| {
            store::tx_debit_wallet(tree, sender, fee)?;
            store::tx_credit_wallet(tree, TREASURY_WALLET, fee)?;
            store::tx_insert_transaction(tree, &fee_tx)?;
            store::tx_put(tree, &keys::message(&message.msg_id), &message)?;
            if is_invite {
                store::tx_put(tree, &keys::friend(sender, recipient), &message.timestamp)?;
            }
            Ok(())
        })?;
        Ok((message, fee_tx))
    }

    /// Insert a gossiped message, de-duplicated on id
    ///
    /// The fee was charged on the origin node. Invites apply the friendship
    /// here too.
    ///
    /// # Returns
    /// * `Result<bool>` - True when the message was new
    pub fn receive(&self, message: Message) -> Result<bool> {
        if self.store.has_message(&message.msg_id)? {
            return Ok(false);
        }
        let is_invite = message.is_invite();
        let inserted = self.store.transact(|tree| {
            if tree.get(keys::message(&message.msg_id))?.is_some() {
                return Ok(false);
            }
            store::tx_put(tree, &keys::message(&message.msg_id), &message)?;
            if is_invite {
                store::tx_put(
                    tree,
                    &keys::friend(&message.sender, &message.recipient),
                    &message.timestamp,
                )?;
            }
            Ok(true)
        })?;
        if inserted {
            debug!("Received message {}", message.msg_id);
        }
        Ok(inserted)
    }

    /// Both directions of a conversation, oldest first, payloads decoded
    pub fn conversation(&self, user: &str, other: &str) -> Result<Vec<ConversationEntry>> {
        let mut entries: Vec<ConversationEntry> = self
            .store
            .messages()?
            .into_iter()
            .filter(|m| {
                (m.sender == user && m.recipient == other)
                    || (m.sender == other && m.recipient == user)
            })
            .map(|m| ConversationEntry {
                text: m.decoded_content(),
                msg_id: m.msg_id,
                sender: m.sender,
                recipient: m.recipient,
                asset_id: m.asset_id,
                timestamp: m.timestamp,
            })
            .collect();
        entries.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Ok(entries)
    }

    /// Whether two wallets are friends
    pub fn are_friends(&self, a: &str, b: &str) -> Result<bool> {
        self.store.has_friend(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::{Wallet, WalletManager};
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<Store>, MessageLog, String, String) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let wallets = WalletManager::new(Arc::clone(&store), 0.0);
        wallets.ensure_system_wallets().unwrap();
        store.seed_fee_if_absent("msg_fee", 0.01).unwrap();
        store.seed_fee_if_absent("invite_fee", 0.1).unwrap();
        let alice = wallets.register("alice", "pw").unwrap().wallet_id;
        let bob = wallets.register("bob", "pw").unwrap().wallet_id;
        store
            .put_wallet(&Wallet {
                wallet_id: alice.clone(),
                balance: 10.0,
                last_mined: 0.0,
            })
            .unwrap();
        let log = MessageLog::new(Arc::clone(&store));
        (dir, store, log, alice, bob)
    }

    #[test]
    fn test_send_charges_fee_and_encodes() {
        let (_dir, store, log, alice, bob) = setup();
        let (message, fee_tx) = log.send(&alice, &bob, "hello bob", None).unwrap();

        assert_ne!(message.content, "hello bob");
        assert_eq!(message.decoded_content(), "hello bob");
        assert_eq!(message.block_index, 0);
        assert_eq!(fee_tx.amount, 0.01);
        assert_eq!(store.wallet(&alice).unwrap().unwrap().balance, 9.99);
        assert_eq!(
            store.wallet(TREASURY_WALLET).unwrap().unwrap().balance,
            0.01
        );
    }

    #[test]
    fn test_send_requires_funds() {
        let (_dir, store, log, alice, bob) = setup();
        store
            .put_wallet(&Wallet {
                wallet_id: alice.clone(),
                balance: 0.0,
                last_mined: 0.0,
            })
            .unwrap();
        assert!(matches!(
            log.send(&alice, &bob, "hi", None),
            Err(NodeError::InsufficientFunds { .. })
        ));
        assert!(store.messages().unwrap().is_empty());
    }

    #[test]
    fn test_receive_is_idempotent() {
        let (_dir, store, log, alice, bob) = setup();
        let (message, _) = log.send(&alice, &bob, "hi", None).unwrap();

        assert!(!log.receive(message.clone()).unwrap());
        let remote = Message {
            msg_id: "remote-1".to_string(),
            sender: bob.clone(),
            recipient: alice.clone(),
            content: utils::b64_encode("from afar"),
            asset_id: None,
            timestamp: utils::now_ts(),
            block_index: 0,
        };
        assert!(log.receive(remote.clone()).unwrap());
        assert!(!log.receive(remote).unwrap());
        assert_eq!(store.messages().unwrap().len(), 2);
    }

    #[test]
    fn test_conversation_orders_and_decodes() {
        let (_dir, _store, log, alice, bob) = setup();
        log.send(&alice, &bob, "first", None).unwrap();
        log.receive(Message {
            msg_id: "reply".to_string(),
            sender: bob.clone(),
            recipient: alice.clone(),
            content: utils::b64_encode("second"),
            asset_id: None,
            timestamp: utils::now_ts() + 5.0,
            block_index: 0,
        })
        .unwrap();
        // A third party's message stays out of this conversation
        log.receive(Message {
            msg_id: "other".to_string(),
            sender: "GHSTcarol".to_string(),
            recipient: alice.clone(),
            content: utils::b64_encode("noise"),
            asset_id: None,
            timestamp: utils::now_ts(),
            block_index: 0,
        })
        .unwrap();

        let thread = log.conversation(&alice, &bob).unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].text, "first");
        assert_eq!(thread[1].text, "second");
    }

    #[test]
    fn test_invite_creates_friendship() {
        let (_dir, store, log, alice, bob) = setup();
        let (message, fee_tx) = log.invite(&alice, &bob).unwrap();

        assert!(message.is_invite());
        assert_eq!(fee_tx.amount, 0.1);
        // Symmetric regardless of argument order
        assert!(log.are_friends(&alice, &bob).unwrap());
        assert!(log.are_friends(&bob, &alice).unwrap());
        assert_eq!(store.wallet(&alice).unwrap().unwrap().balance, 9.9);
    }

    #[test]
    fn test_received_invite_applies_friendship() {
        let (_dir, _store, log, alice, bob) = setup();
        let invite = Message {
            msg_id: "inv-1".to_string(),
            sender: bob.clone(),
            recipient: alice.clone(),
            content: utils::b64_encode(INVITE_MARKER),
            asset_id: None,
            timestamp: utils::now_ts(),
            block_index: 0,
        };
        log.receive(invite).unwrap();
        assert!(log.are_friends(&alice, &bob).unwrap());
    }
}
