use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::asset::{Asset, AssetRegistry};
use crate::block::{Block, BlockHeader};
use crate::ledger::Ledger;
use crate::message::Message;
use crate::peer::{peer_url, PeerSet};
use crate::store::{self, keys, Store};
use crate::transaction::Transaction;
use crate::{Result, SYSTEM_SENDER};

/// Wire form of a gossiped transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionAnnounce {
    pub tx_id: String,
    pub sender: String,
    pub recipient: String,
    pub amount: f64,
    pub timestamp: f64,
}

impl From<&Transaction> for TransactionAnnounce {
    fn from(tx: &Transaction) -> Self {
        TransactionAnnounce {
            tx_id: tx.tx_id.clone(),
            sender: tx.sender.clone(),
            recipient: tx.recipient.clone(),
            amount: tx.amount,
            timestamp: tx.timestamp,
        }
    }
}

impl TransactionAnnounce {
    /// Rebuild the mempool row; balances settle at confirmation time
    pub fn into_transaction(self) -> Transaction {
        Transaction {
            tx_id: self.tx_id,
            sender: self.sender,
            recipient: self.recipient,
            amount: self.amount,
            timestamp: self.timestamp,
            block_index: 0,
            settled: false,
        }
    }
}

/// Wire form of a gossiped message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAnnounce {
    pub msg_id: String,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    #[serde(default)]
    pub asset_id: Option<String>,
    pub timestamp: f64,
}

impl From<&Message> for MessageAnnounce {
    fn from(message: &Message) -> Self {
        MessageAnnounce {
            msg_id: message.msg_id.clone(),
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            content: message.content.clone(),
            asset_id: message.asset_id.clone(),
            timestamp: message.timestamp,
        }
    }
}

impl MessageAnnounce {
    pub fn into_message(self) -> Message {
        Message {
            msg_id: self.msg_id,
            sender: self.sender,
            recipient: self.recipient,
            content: self.content,
            asset_id: self.asset_id,
            timestamp: self.timestamp,
            block_index: 0,
        }
    }
}

/// One block of the whole-state bundle, with its confirmed transactions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleBlock {
    #[serde(flatten)]
    pub block: Block,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

/// Whole-state export used for longest-chain adoption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainBundle {
    pub chain: Vec<BundleBlock>,
    pub assets: Vec<Asset>,
    pub length: u64,
}

/// Events fanned out to every known peer, best effort
#[derive(Debug, Clone)]
pub enum GossipEvent {
    Transaction(Transaction),
    Message(Message),
}

/// Outcome of one sync pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub peers_contacted: u64,
    pub peers_failed: u64,
    pub blocks_added: u64,
    pub assets_added: u64,
}

/// Outcome of a longest-chain adoption attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdoptReport {
    pub replaced: bool,
    pub length: u64,
}

/// Periodic pull-based reconciliation plus gossip fan-out
///
/// Holds handles to the leaf components and drives them; no component ever
/// references the engine back. Per-peer errors are swallowed: the next tick
/// retries, and a single unreachable peer never blocks the rest.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    store: Arc<Store>,
    ledger: Ledger,
    assets: AssetRegistry,
    peers: PeerSet,
    client: reqwest::Client,
    self_address: String,
    self_ip: String,
    http_port: u16,
}

impl SyncEngine {
    pub fn new(
        store: Arc<Store>,
        ledger: Ledger,
        assets: AssetRegistry,
        peers: PeerSet,
        self_ip: String,
        http_port: u16,
        peer_timeout_secs: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(peer_timeout_secs))
            .build()
            .unwrap_or_default();
        SyncEngine {
            store,
            ledger,
            assets,
            peers,
            client,
            self_address: format!("http://{}:{}", self_ip, http_port),
            self_ip,
            http_port,
        }
    }

    /// Run the periodic sync loop forever
    pub async fn run(self, interval_secs: u64, initial_delay_secs: u64) {
        tokio::time::sleep(Duration::from_secs(initial_delay_secs)).await;
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            let report = self.sync_once().await;
            debug!(
                "Sync pass: {} peers, {} blocks, {} assets, {} failures",
                report.peers_contacted, report.blocks_added, report.assets_added, report.peers_failed
            );
        }
    }

    /// One full reconciliation pass over every known peer
    pub async fn sync_once(&self) -> SyncReport {
        let mut report = SyncReport::default();
        let peers = match self.peers.known() {
            Ok(peers) => peers,
            Err(e) => {
                warn!("Cannot list peers: {}", e);
                return report;
            }
        };

        for peer in peers {
            if self.is_self(&peer) {
                continue;
            }
            let base = peer_url(&peer, self.http_port);
            match self.sync_peer(&base).await {
                Ok((blocks, assets)) => {
                    report.peers_contacted += 1;
                    report.blocks_added += blocks;
                    report.assets_added += assets;
                    if let Err(e) = self.peers.touch(&peer) {
                        warn!("Cannot refresh peer {}: {}", peer, e);
                    }
                }
                Err(e) => {
                    report.peers_failed += 1;
                    warn!("Sync with {} failed: {}", base, e);
                }
            }
        }
        report
    }

    fn is_self(&self, peer: &str) -> bool {
        let base = peer_url(peer, self.http_port);
        base == self.self_address || peer == self.self_ip
    }

    /// Announce ourselves, then pull blocks, assets and fees from one peer
    async fn sync_peer(&self, base: &str) -> Result<(u64, u64)> {
        self.announce(base).await;
        let blocks = self.pull_blocks(base).await?;
        let assets = self.pull_assets(base).await?;
        self.pull_fees(base).await?;
        Ok((blocks, assets))
    }

    /// Best-effort self-introduction so the peer learns our address
    async fn announce(&self, base: &str) {
        let body = serde_json::json!({ "ip_address": self.self_ip });
        if let Err(e) = self
            .client
            .post(format!("{}/peer_update", base))
            .json(&body)
            .send()
            .await
        {
            debug!("Announce to {} failed: {}", base, e);
        }
    }

    /// Fetch the peer's headers and append every missing block
    async fn pull_blocks(&self, base: &str) -> Result<u64> {
        let headers: Vec<BlockHeader> = self
            .client
            .get(format!("{}/api/chain_meta", base))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut added = 0;
        for header in headers {
            if self.store.block_by_hash(&header.block_hash)?.is_some() {
                continue;
            }
            let block: Block = self
                .client
                .get(format!("{}/api/block/{}", base, header.block_hash))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            if self.ledger.accept_peer_block(block)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Fetch the peer's asset ids and pull every missing body
    async fn pull_assets(&self, base: &str) -> Result<u64> {
        #[derive(Deserialize)]
        struct AssetMeta {
            asset_id: String,
        }

        let metas: Vec<AssetMeta> = self
            .client
            .get(format!("{}/api/assets_meta", base))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut added = 0;
        for meta in metas {
            if self.store.asset(&meta.asset_id)?.is_some() {
                continue;
            }
            let asset: Asset = self
                .client
                .get(format!("{}/api/asset_data/{}", base, meta.asset_id))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            if self.assets.sync_receive(asset)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Upsert every entry of the peer's fee schedule
    async fn pull_fees(&self, base: &str) -> Result<()> {
        let fees: BTreeMap<String, f64> = self
            .client
            .get(format!("{}/api/get_fees", base))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        for (kind, amount) in fees {
            self.store.set_fee(&kind, amount)?;
        }
        Ok(())
    }

    /// Fan an event out to every known peer, logging and dropping failures
    ///
    /// Pushes are never retried; the periodic pull fills any gaps.
    pub async fn broadcast(&self, event: &GossipEvent) {
        let peers = match self.peers.known() {
            Ok(peers) => peers,
            Err(e) => {
                warn!("Cannot list peers for broadcast: {}", e);
                return;
            }
        };

        for peer in peers {
            if self.is_self(&peer) {
                continue;
            }
            let base = peer_url(&peer, self.http_port);
            let request = match event {
                GossipEvent::Transaction(tx) => self
                    .client
                    .post(format!("{}/api/send_transaction", base))
                    .json(&TransactionAnnounce::from(tx)),
                GossipEvent::Message(message) => self
                    .client
                    .post(format!("{}/api/messenger/receive_message", base))
                    .json(&MessageAnnounce::from(message)),
            };
            if let Err(e) = request.send().await {
                debug!("Broadcast to {} dropped: {}", base, e);
            }
        }
    }

    /// Drain the gossip queue, one fan-out per event
    pub async fn run_gossip(self, mut events: UnboundedReceiver<GossipEvent>) {
        while let Some(event) = events.recv().await {
            self.broadcast(&event).await;
        }
    }

    /// Export the whole local state for `/chain` consumers
    pub fn export_bundle(&self) -> Result<ChainBundle> {
        let mut chain = Vec::new();
        for block in self.store.blocks()? {
            let transactions = self.store.transactions_in_block(block.block_index)?;
            chain.push(BundleBlock { block, transactions });
        }
        let assets = self.store.assets()?;
        let length = chain.len() as u64;
        Ok(ChainBundle { chain, assets, length })
    }

    /// Fetch every known peer's bundle and adopt the longest strictly longer chain
    pub async fn adopt_longest_chain(&self) -> Result<AdoptReport> {
        let local_length = self.store.blocks()?.len() as u64;
        let mut best: Option<ChainBundle> = None;
        let mut best_length = local_length;

        for peer in self.peers.known()? {
            if self.is_self(&peer) {
                continue;
            }
            let base = peer_url(&peer, self.http_port);
            let bundle: ChainBundle = match self
                .client
                .get(format!("{}/chain", base))
                .send()
                .await
                .and_then(|r| r.error_for_status())
            {
                Ok(response) => match response.json().await {
                    Ok(bundle) => bundle,
                    Err(e) => {
                        warn!("Bad chain bundle from {}: {}", base, e);
                        continue;
                    }
                },
                Err(e) => {
                    warn!("Chain fetch from {} failed: {}", base, e);
                    continue;
                }
            };
            if bundle.length > best_length {
                best_length = bundle.length;
                best = Some(bundle);
            }
        }

        match best {
            Some(bundle) => {
                self.adopt_bundle(&bundle)?;
                Ok(AdoptReport { replaced: true, length: best_length })
            }
            None => Ok(AdoptReport { replaced: false, length: local_length }),
        }
    }

    /// Swap the local chain and assets for a strictly longer remote bundle
    ///
    /// # Returns
    /// * `Result<bool>` - False when the bundle is not longer than local state
    pub fn adopt_bundle(&self, bundle: &ChainBundle) -> Result<bool> {
        let local_length = self.store.blocks()?.len() as u64;
        if bundle.length <= local_length {
            return Ok(false);
        }
        self.swap_chain(bundle)?;
        info!(
            "Adopted remote chain of length {} (was {})",
            bundle.length, local_length
        );
        Ok(true)
    }

    /// The wholesale replacement primitive
    ///
    /// Atomically drops every non-genesis block, every transaction and every
    /// asset, re-inserts the remote records with their hashes untouched, and
    /// re-derives every wallet balance by replaying the remote transaction
    /// set in block order.
    fn swap_chain(&self, bundle: &ChainBundle) -> Result<()> {
        let mut deletions: Vec<Vec<u8>> = Vec::new();
        for block in self.store.blocks()? {
            if block.block_index > 1 {
                deletions.push(keys::block(block.block_index));
                deletions.push(keys::block_hash(&block.block_hash));
            }
        }
        for prefix in [
            keys::TX,
            keys::TX_ID,
            keys::ASSET,
            keys::ASSET_OWNER,
            keys::ASSET_EXPIRY,
            keys::DOMAIN,
        ] {
            deletions.extend(self.store.keys_with_prefix(prefix)?);
        }

        let mut ordered: Vec<&BundleBlock> = bundle.chain.iter().collect();
        ordered.sort_by_key(|b| b.block.block_index);

        let balances = replay_balances(&ordered);
        let mut wallet_ids = self.store.wallet_ids()?;
        for wallet_id in balances.keys() {
            if !wallet_ids.contains(wallet_id) {
                wallet_ids.push(wallet_id.clone());
            }
        }

        self.store.transact(|tree| {
            for key in &deletions {
                tree.remove(key.as_slice())?;
            }

            for entry in &ordered {
                let block = &entry.block;
                if block.block_index > 1 {
                    store::tx_put(tree, &keys::block(block.block_index), block)?;
                    store::tx_put(tree, &keys::block_hash(&block.block_hash), &block.block_index)?;
                }
                for tx in &entry.transactions {
                    let row = Transaction {
                        block_index: block.block_index,
                        settled: true,
                        ..tx.clone()
                    };
                    store::tx_insert_transaction(tree, &row)?;
                }
            }

            for asset in &bundle.assets {
                store::tx_put(tree, &keys::asset(&asset.asset_id), asset)?;
                tree.insert(
                    keys::asset_owner(&asset.owner, &asset.asset_id),
                    asset.asset_id.as_bytes(),
                )?;
                tree.insert(
                    keys::asset_expiry(asset.expiry_time as u64, &asset.asset_id),
                    asset.asset_id.as_bytes(),
                )?;
                if asset.asset_type == crate::asset::AssetType::Domain
                    && tree.get(keys::domain(&asset.name))?.is_none()
                {
                    tree.insert(keys::domain(&asset.name), asset.asset_id.as_bytes())?;
                }
            }

            for wallet_id in &wallet_ids {
                let key = keys::wallet(wallet_id);
                let mut wallet = store::tx_get::<crate::wallet::Wallet>(tree, &key)?
                    .unwrap_or_else(|| crate::wallet::Wallet::new(wallet_id));
                wallet.balance = balances.get(wallet_id).copied().unwrap_or(0.0);
                store::tx_put(tree, &key, &wallet)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

/// Re-derive balances from a bundle's confirmed transactions, in block order
fn replay_balances(ordered: &[&BundleBlock]) -> BTreeMap<String, f64> {
    let mut balances: BTreeMap<String, f64> = BTreeMap::new();
    for entry in ordered {
        let mut txs: Vec<&Transaction> = entry.transactions.iter().collect();
        txs.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        for tx in txs {
            if tx.sender != SYSTEM_SENDER {
                *balances.entry(tx.sender.clone()).or_insert(0.0) -= tx.amount;
            }
            *balances.entry(tx.recipient.clone()).or_insert(0.0) += tx.amount;
        }
    }
    balances
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(sender: &str, recipient: &str, amount: f64, ts: f64) -> Transaction {
        Transaction {
            tx_id: format!("{}-{}-{}", sender, recipient, ts),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            timestamp: ts,
            block_index: 0,
            settled: true,
        }
    }

    #[test]
    fn test_replay_balances() {
        let genesis = Block::genesis();
        let b2 = Block::next(&genesis, 1, "GHSTminer", 10.0);
        let bundle_blocks = vec![
            BundleBlock {
                block: b2.clone(),
                transactions: vec![
                    Transaction::coinbase("GHSTminer", 50.0, 2, 10.0),
                    tx("GHSTminer", "GHSTbob", 20.0, 11.0),
                ],
            },
            BundleBlock {
                block: genesis.clone(),
                transactions: vec![],
            },
        ];
        let mut ordered: Vec<&BundleBlock> = bundle_blocks.iter().collect();
        ordered.sort_by_key(|b| b.block.block_index);

        let balances = replay_balances(&ordered);
        assert_eq!(balances.get("GHSTminer"), Some(&30.0));
        assert_eq!(balances.get("GHSTbob"), Some(&20.0));
        // The system sender is never debited
        assert!(!balances.contains_key(SYSTEM_SENDER));
    }

    #[test]
    fn test_announce_wire_shapes() {
        let tx = tx("GHSTa", "GHSTb", 5.0, 9.0);
        let wire = serde_json::to_value(TransactionAnnounce::from(&tx)).unwrap();
        assert_eq!(
            wire,
            serde_json::json!({
                "tx_id": tx.tx_id,
                "sender": "GHSTa",
                "recipient": "GHSTb",
                "amount": 5.0,
                "timestamp": 9.0,
            })
        );
        // The mempool row from the wire form settles at confirmation
        let announce: TransactionAnnounce = serde_json::from_value(wire).unwrap();
        let rebuilt = announce.into_transaction();
        assert_eq!(rebuilt.block_index, 0);
        assert!(!rebuilt.settled);
    }

    #[test]
    fn test_bundle_block_flattens() {
        let block = Block::genesis();
        let bundle = BundleBlock {
            block: block.clone(),
            transactions: vec![],
        };
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["block_index"], serde_json::json!(1));
        assert_eq!(json["previous_hash"], serde_json::json!("0"));
        assert!(json["transactions"].as_array().unwrap().is_empty());

        let back: BundleBlock = serde_json::from_value(json).unwrap();
        assert_eq!(back.block, block);
    }
}
