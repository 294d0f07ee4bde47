use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::asset::{Asset, AssetRegistry, AssetType};
use crate::block::Block;
use crate::config::NodeConfig;
use crate::contract::{CallOutcome, Contract, ContractRegistry};
use crate::ledger::{Ledger, LedgerStats};
use crate::message::{ConversationEntry, Message, MessageLog};
use crate::peer::{self, Peer, PeerSet};
use crate::proof_of_work;
use crate::store::Store;
use crate::sync::{AdoptReport, ChainBundle, GossipEvent, SyncEngine, SyncReport};
use crate::transaction::Transaction;
use crate::wallet::{User, Wallet, WalletManager};
use crate::{NodeError, Result};

/// Peer-table summary for the operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersOverview {
    pub active: Vec<Peer>,
    pub known: Vec<String>,
}

/// The owning coordinator of every component
///
/// Holds the store and one handle per leaf component, wires cross-component
/// operations explicitly, and publishes gossip events for the broadcaster
/// task. Components never reference each other or the node back.
#[derive(Debug)]
pub struct Node {
    pub config: NodeConfig,
    pub store: Arc<Store>,
    pub wallets: WalletManager,
    pub ledger: Ledger,
    pub assets: AssetRegistry,
    pub messages: MessageLog,
    pub contracts: ContractRegistry,
    pub peers: PeerSet,
    pub sync: SyncEngine,
    gossip: UnboundedSender<GossipEvent>,
}

impl Node {
    /// Open the store, bootstrap genesis state, and wire every component
    ///
    /// Returns the node plus the gossip queue receiver; the caller decides
    /// whether to spawn the broadcaster (the CLI does, tests usually don't).
    pub fn open(config: NodeConfig) -> Result<(Arc<Node>, UnboundedReceiver<GossipEvent>)> {
        let store = Arc::new(Store::open(&config.data_dir)?);

        let wallets = WalletManager::new(Arc::clone(&store), config.initial_balance);
        wallets.ensure_system_wallets()?;

        let ledger = Ledger::new(Arc::clone(&store));
        ledger.ensure_genesis()?;

        for (kind, amount) in config.fees.entries() {
            store.seed_fee_if_absent(kind, amount)?;
        }

        let assets = AssetRegistry::new(Arc::clone(&store));
        let messages = MessageLog::new(Arc::clone(&store));
        let contracts =
            ContractRegistry::new(Arc::clone(&store), config.charge_call_fee_on_failure);
        let peers = PeerSet::new(Arc::clone(&store), config.bootstrap_peers.clone());

        let self_ip = peer::local_ip().unwrap_or_else(|| "127.0.0.1".to_string());
        let sync = SyncEngine::new(
            Arc::clone(&store),
            ledger.clone(),
            assets.clone(),
            peers.clone(),
            self_ip,
            config.http_port,
            config.peer_timeout_secs,
        );

        let (gossip, gossip_rx) = mpsc::unbounded_channel();

        info!("Node ready on data dir {:?}", config.data_dir);
        let node = Node {
            config,
            store,
            wallets,
            ledger,
            assets,
            messages,
            contracts,
            peers,
            sync,
            gossip,
        };
        Ok((Arc::new(node), gossip_rx))
    }

    fn publish(&self, event: GossipEvent) {
        if self.gossip.send(event).is_err() {
            debug!("Gossip queue closed, event dropped");
        }
    }

    // --- wallet operations ---

    pub fn register_user(&self, username: &str, password: &str) -> Result<User> {
        self.wallets.register(username, password)
    }

    pub fn login(&self, username: &str, password: &str) -> Result<(User, Wallet)> {
        let user = self.wallets.authenticate(username, password)?;
        let wallet = self.wallets.wallet(&user.wallet_id)?;
        Ok((user, wallet))
    }

    pub fn wallet_info(&self, username: &str) -> Result<(User, Wallet)> {
        self.wallets.wallet_of(username)
    }

    pub fn transactions_for(&self, wallet_id: &str, limit: usize) -> Result<Vec<Transaction>> {
        self.store.transactions_for(wallet_id, limit)
    }

    // --- ledger operations ---

    /// Transfer coins and gossip the transaction to known peers
    pub fn transfer(&self, sender: &str, recipient: &str, amount: f64) -> Result<Transaction> {
        let tx = self.ledger.transfer(sender, recipient, amount)?;
        self.publish(GossipEvent::Transaction(tx.clone()));
        Ok(tx)
    }

    /// Mine a block on a blocking task at the current network difficulty
    pub async fn mine(&self, miner: &str) -> Result<Block> {
        let difficulty = proof_of_work::difficulty_for(self.peers.active_count()?);
        let ledger = self.ledger.clone();
        let miner = miner.to_string();
        tokio::task::spawn_blocking(move || ledger.mine(&miner, difficulty))
            .await
            .map_err(|e| NodeError::Storage(format!("mining task aborted: {}", e)))?
    }

    /// Synchronous mining entry point for the CLI and tests
    pub fn mine_blocking(&self, miner: &str) -> Result<Block> {
        let difficulty = proof_of_work::difficulty_for(self.peers.active_count()?);
        self.ledger.mine(miner, difficulty)
    }

    pub fn stats(&self) -> Result<LedgerStats> {
        self.ledger.get_statistics()
    }

    // --- asset operations ---

    /// Register a domain and gossip its fee transaction
    pub fn register_domain(&self, owner: &str, name: &str, content: &str) -> Result<Asset> {
        let (asset, fee_tx) = self.assets.register_domain(owner, name, content)?;
        self.publish(GossipEvent::Transaction(fee_tx));
        Ok(asset)
    }

    /// Register media and gossip its fee transaction
    pub fn register_media(
        &self,
        owner: &str,
        asset_type: AssetType,
        name: &str,
        content: Vec<u8>,
    ) -> Result<Asset> {
        let (asset, fee_tx) = self.assets.register_media(owner, asset_type, name, content)?;
        self.publish(GossipEvent::Transaction(fee_tx));
        Ok(asset)
    }

    pub fn view_asset(&self, asset_id: &str, viewer: Option<&str>) -> Result<Asset> {
        self.assets.view(asset_id, viewer)
    }

    pub fn update_asset(&self, asset_id: &str, owner: &str, content: Vec<u8>) -> Result<Asset> {
        self.assets.update_content(asset_id, owner, content)
    }

    pub fn delete_asset(&self, asset_id: &str, owner: &str) -> Result<()> {
        self.assets.delete(asset_id, owner)
    }

    pub fn assets_of(&self, owner: &str) -> Result<Vec<Asset>> {
        self.assets.assets_of(owner)
    }

    pub fn search_domains(&self, query: &str) -> Result<Vec<Asset>> {
        self.assets.search_domains(query)
    }

    // --- contract operations ---

    pub fn deploy_contract(&self, owner: &str, code: &str) -> Result<Contract> {
        let (contract, fee_tx) = self.contracts.deploy(owner, code)?;
        self.publish(GossipEvent::Transaction(fee_tx));
        Ok(contract)
    }

    pub fn call_contract(
        &self,
        caller: &str,
        address: &str,
        method: &str,
        args: &[String],
    ) -> Result<CallOutcome> {
        self.contracts.call(caller, address, method, args)
    }

    pub fn get_contract(&self, address: &str) -> Result<Contract> {
        self.contracts.get(address)
    }

    // --- messaging operations ---

    /// Send a message and gossip it to known peers
    pub fn send_message(
        &self,
        sender: &str,
        recipient: &str,
        text: &str,
        asset_id: Option<String>,
    ) -> Result<Message> {
        let (message, fee_tx) = self.messages.send(sender, recipient, text, asset_id)?;
        self.publish(GossipEvent::Transaction(fee_tx));
        self.publish(GossipEvent::Message(message.clone()));
        Ok(message)
    }

    /// Send a friend invite and gossip it
    pub fn send_invite(&self, sender: &str, recipient: &str) -> Result<Message> {
        let (message, fee_tx) = self.messages.invite(sender, recipient)?;
        self.publish(GossipEvent::Transaction(fee_tx));
        self.publish(GossipEvent::Message(message.clone()));
        Ok(message)
    }

    pub fn conversation(&self, user: &str, other: &str) -> Result<Vec<ConversationEntry>> {
        self.messages.conversation(user, other)
    }

    // --- mesh operations ---

    pub fn peers_overview(&self) -> Result<PeersOverview> {
        Ok(PeersOverview {
            active: self.peers.active()?,
            known: self.peers.known()?,
        })
    }

    /// Run one sync pass immediately
    pub async fn sync_now(&self) -> SyncReport {
        self.sync.sync_once().await
    }

    /// Explicit longest-chain adoption across every known peer
    pub async fn adopt_longest_chain(&self) -> Result<AdoptReport> {
        self.sync.adopt_longest_chain().await
    }

    /// Whole-state bundle for `/chain` consumers
    pub fn export_chain(&self) -> Result<ChainBundle> {
        self.sync.export_bundle()
    }

    /// Swap in a bundle when it is strictly longer than local state
    pub fn adopt_chain_bundle(&self, bundle: &ChainBundle) -> Result<bool> {
        self.sync.adopt_bundle(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_node() -> (tempfile::TempDir, Arc<Node>, UnboundedReceiver<GossipEvent>) {
        let dir = tempdir().unwrap();
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            ..NodeConfig::default()
        };
        let (node, rx) = Node::open(config).unwrap();
        (dir, node, rx)
    }

    #[test]
    fn test_open_bootstraps_state() {
        let (_dir, node, _rx) = open_node();
        assert!(node.ledger.last_block().unwrap().is_genesis());
        assert_eq!(node.store.fee("domain_reg").unwrap(), 1.0);
        assert_eq!(
            node.store.wallet(crate::TREASURY_WALLET).unwrap().unwrap().balance,
            0.0
        );
    }

    #[test]
    fn test_transfer_publishes_gossip() {
        let (_dir, node, mut rx) = open_node();
        let alice = node.register_user("alice", "pw").unwrap();
        let bob = node.register_user("bob", "pw").unwrap();
        node.mine_blocking(&alice.wallet_id).unwrap();

        node.transfer(&alice.wallet_id, &bob.wallet_id, 5.0).unwrap();
        match rx.try_recv() {
            Ok(GossipEvent::Transaction(tx)) => {
                assert_eq!(tx.sender, alice.wallet_id);
                assert_eq!(tx.amount, 5.0);
            }
            other => panic!("expected a transaction event, got {:?}", other),
        }
    }

    #[test]
    fn test_login_round_trip() {
        let (_dir, node, _rx) = open_node();
        node.register_user("alice", "pw").unwrap();
        let (user, wallet) = node.login("alice", "pw").unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(wallet.wallet_id, user.wallet_id);
        assert!(node.login("alice", "nope").is_err());
    }
}
