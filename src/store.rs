use std::collections::BTreeMap;
use std::path::Path;

use log::{debug, error, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{Db, Tree};
use thiserror::Error;

use crate::asset::Asset;
use crate::block::{Block, BlockHeader};
use crate::contract::Contract;
use crate::message::Message;
use crate::peer::Peer;
use crate::transaction::Transaction;
use crate::wallet::{User, Wallet};
use crate::{NodeError, Result};

/// Storage-related errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row at key {0}")]
    Corrupt(String),
}

impl From<StoreError> for NodeError {
    fn from(err: StoreError) -> Self {
        NodeError::Storage(err.to_string())
    }
}

/// Key construction for the namespaced keyspace
///
/// Every table lives under its own prefix inside one sled tree, so any
/// multi-row commit is a single serializable sled transaction. Numeric key
/// parts are big-endian, which makes prefix scans range scans.
pub mod keys {
    pub const USER: &[u8] = b"user/";
    pub const WALLET: &[u8] = b"wallet/";
    pub const BLOCK: &[u8] = b"block/";
    pub const BLOCK_HASH: &[u8] = b"blockhash/";
    pub const TX: &[u8] = b"tx/";
    pub const TX_ID: &[u8] = b"txid/";
    pub const ASSET: &[u8] = b"asset/";
    pub const ASSET_OWNER: &[u8] = b"assetowner/";
    pub const ASSET_EXPIRY: &[u8] = b"assetexp/";
    pub const DOMAIN: &[u8] = b"domain/";
    pub const MESSAGE: &[u8] = b"msg/";
    pub const CONTRACT: &[u8] = b"contract/";
    pub const PEER: &[u8] = b"peer/";
    pub const FEE: &[u8] = b"fee/";
    pub const FRIEND: &[u8] = b"friend/";

    fn join(prefix: &[u8], parts: &[&[u8]]) -> Vec<u8> {
        let mut key = prefix.to_vec();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                key.push(b'/');
            }
            key.extend_from_slice(part);
        }
        key
    }

    pub fn user(username: &str) -> Vec<u8> {
        join(USER, &[username.as_bytes()])
    }

    pub fn wallet(wallet_id: &str) -> Vec<u8> {
        join(WALLET, &[wallet_id.as_bytes()])
    }

    pub fn block(index: u64) -> Vec<u8> {
        join(BLOCK, &[&index.to_be_bytes()])
    }

    pub fn block_hash(hash: &str) -> Vec<u8> {
        join(BLOCK_HASH, &[hash.as_bytes()])
    }

    /// Transactions are keyed by confirming block first, so the mempool and
    /// every block's transaction list are prefix scans
    pub fn tx(block_index: u64, tx_id: &str) -> Vec<u8> {
        join(TX, &[&block_index.to_be_bytes(), tx_id.as_bytes()])
    }

    pub fn tx_block_prefix(block_index: u64) -> Vec<u8> {
        let mut key = join(TX, &[&block_index.to_be_bytes()]);
        key.push(b'/');
        key
    }

    pub fn tx_id(tx_id: &str) -> Vec<u8> {
        join(TX_ID, &[tx_id.as_bytes()])
    }

    pub fn asset(asset_id: &str) -> Vec<u8> {
        join(ASSET, &[asset_id.as_bytes()])
    }

    pub fn asset_owner(owner: &str, asset_id: &str) -> Vec<u8> {
        join(ASSET_OWNER, &[owner.as_bytes(), asset_id.as_bytes()])
    }

    pub fn asset_owner_prefix(owner: &str) -> Vec<u8> {
        let mut key = join(ASSET_OWNER, &[owner.as_bytes()]);
        key.push(b'/');
        key
    }

    pub fn asset_expiry(expiry_secs: u64, asset_id: &str) -> Vec<u8> {
        join(ASSET_EXPIRY, &[&expiry_secs.to_be_bytes(), asset_id.as_bytes()])
    }

    pub fn domain(name: &str) -> Vec<u8> {
        join(DOMAIN, &[name.to_lowercase().as_bytes()])
    }

    pub fn message(msg_id: &str) -> Vec<u8> {
        join(MESSAGE, &[msg_id.as_bytes()])
    }

    pub fn contract(address: &str) -> Vec<u8> {
        join(CONTRACT, &[address.as_bytes()])
    }

    pub fn peer(ip: &str) -> Vec<u8> {
        join(PEER, &[ip.as_bytes()])
    }

    pub fn fee(kind: &str) -> Vec<u8> {
        join(FEE, &[kind.as_bytes()])
    }

    /// Friendship rows use the lexicographically sorted wallet pair
    pub fn friend(a: &str, b: &str) -> Vec<u8> {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        join(FRIEND, &[low.as_bytes(), high.as_bytes()])
    }
}

/// Read a typed row inside a transaction
pub fn tx_get<T: DeserializeOwned>(
    tree: &TransactionalTree,
    key: &[u8],
) -> ConflictableTransactionResult<Option<T>, NodeError> {
    match tree.get(key)? {
        Some(raw) => match serde_json::from_slice(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => abort(NodeError::Serialization(e.to_string())),
        },
        None => Ok(None),
    }
}

/// Write a typed row inside a transaction
pub fn tx_put<T: Serialize>(
    tree: &TransactionalTree,
    key: &[u8],
    value: &T,
) -> ConflictableTransactionResult<(), NodeError> {
    let raw = match serde_json::to_vec(value) {
        Ok(raw) => raw,
        Err(e) => return abort(NodeError::Serialization(e.to_string())),
    };
    tree.insert(key, raw)?;
    Ok(())
}

/// Abort the surrounding transaction with a domain error
pub fn abort<T>(err: NodeError) -> ConflictableTransactionResult<T, NodeError> {
    Err(ConflictableTransactionError::Abort(err))
}

/// Credit a wallet inside a transaction, creating the row if absent
///
/// Remote wallets first seen through synced transactions get a zero-history
/// row here.
pub fn tx_credit_wallet(
    tree: &TransactionalTree,
    wallet_id: &str,
    amount: f64,
) -> ConflictableTransactionResult<(), NodeError> {
    let key = keys::wallet(wallet_id);
    let mut wallet = tx_get::<Wallet>(tree, &key)?.unwrap_or_else(|| Wallet::new(wallet_id));
    wallet.balance += amount;
    tx_put(tree, &key, &wallet)
}

/// Debit a wallet inside a transaction, aborting on insufficient balance
pub fn tx_debit_wallet(
    tree: &TransactionalTree,
    wallet_id: &str,
    amount: f64,
) -> ConflictableTransactionResult<(), NodeError> {
    let key = keys::wallet(wallet_id);
    let wallet = match tx_get::<Wallet>(tree, &key)? {
        Some(wallet) => wallet,
        None => return abort(NodeError::NotFound(format!("wallet {}", wallet_id))),
    };
    if wallet.balance < amount {
        return abort(NodeError::InsufficientFunds {
            wallet: wallet_id.to_string(),
            balance: wallet.balance,
            required: amount,
        });
    }
    let updated = Wallet {
        balance: wallet.balance - amount,
        ..wallet
    };
    tx_put(tree, &key, &updated)
}

/// Record an unconfirmed transaction row and its id index inside a transaction
pub fn tx_insert_transaction(
    tree: &TransactionalTree,
    tx: &Transaction,
) -> ConflictableTransactionResult<(), NodeError> {
    let key = keys::tx(tx.block_index, &tx.tx_id);
    tx_put(tree, &key, tx)?;
    tree.insert(keys::tx_id(&tx.tx_id), key)?;
    Ok(())
}

/// Durable keyed store backing every component
///
/// All rows are JSON values inside one sled tree, partitioned by key prefix.
/// Reads are concurrent; writes inside [`Store::transact`] are serialized and
/// atomic. The store is the single system of record: components hold a handle
/// and never cache derived state.
#[derive(Debug)]
pub struct Store {
    db: Db,
    data: Tree,
}

impl Store {
    /// Open (or create) the store at the given directory and run migrations
    pub fn open<P: AsRef<Path>>(path: P) -> std::result::Result<Self, StoreError> {
        let db = sled::open(path)?;
        let data = db.open_tree("records")?;
        let store = Store { db, data };
        store.migrate()?;
        info!("Opened node store");
        Ok(store)
    }

    /// Backfill columns added after the initial release
    ///
    /// Rows written by an older deployment are rewritten with the new
    /// column's default, so a schema addition never strands a store.
    fn migrate(&self) -> std::result::Result<(), StoreError> {
        let mut rewritten = 0usize;
        for item in self.data.scan_prefix(keys::TX) {
            let (key, raw) = item?;
            let mut row: serde_json::Value = serde_json::from_slice(&raw)?;
            let obj = row.as_object_mut().ok_or_else(|| {
                StoreError::Corrupt(String::from_utf8_lossy(&key).into_owned())
            })?;
            if !obj.contains_key("settled") {
                obj.insert("settled".to_string(), serde_json::Value::Bool(true));
                self.data.insert(key, serde_json::to_vec(&row)?)?;
                rewritten += 1;
            }
        }
        for item in self.data.scan_prefix(keys::ASSET) {
            let (key, raw) = item?;
            let mut row: serde_json::Value = serde_json::from_slice(&raw)?;
            let obj = row.as_object_mut().ok_or_else(|| {
                StoreError::Corrupt(String::from_utf8_lossy(&key).into_owned())
            })?;
            if !obj.contains_key("keywords") {
                obj.insert("keywords".to_string(), serde_json::Value::Array(Vec::new()));
                self.data.insert(key, serde_json::to_vec(&row)?)?;
                rewritten += 1;
            }
        }
        if rewritten > 0 {
            info!("Migrated {} rows to the current schema", rewritten);
        }
        Ok(())
    }

    /// Run a closure as one atomic multi-row transaction
    ///
    /// The closure may be retried on contention; aborting with a domain error
    /// rolls every write back and surfaces the error unchanged.
    pub fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&TransactionalTree) -> ConflictableTransactionResult<T, NodeError>,
    {
        self.data.transaction(f).map_err(|err| match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => NodeError::from(e),
        })
    }

    fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> std::result::Result<Option<T>, StoreError> {
        match self.data.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, key: &[u8], value: &T) -> std::result::Result<(), StoreError> {
        self.data.insert(key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn scan_json<T: DeserializeOwned>(&self, prefix: &[u8]) -> std::result::Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        for item in self.data.scan_prefix(prefix) {
            let (_, raw) = item?;
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }

    /// Every key under a prefix, for bulk deletes computed outside a transaction
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> std::result::Result<Vec<Vec<u8>>, StoreError> {
        let mut out = Vec::new();
        for item in self.data.scan_prefix(prefix) {
            let (key, _) = item?;
            out.push(key.to_vec());
        }
        Ok(out)
    }

    // --- users and wallets ---

    pub fn user(&self, username: &str) -> Result<Option<User>> {
        Ok(self.get_json(&keys::user(username))?)
    }

    pub fn wallet(&self, wallet_id: &str) -> Result<Option<Wallet>> {
        Ok(self.get_json(&keys::wallet(wallet_id))?)
    }

    pub fn put_wallet(&self, wallet: &Wallet) -> Result<()> {
        Ok(self.put_json(&keys::wallet(&wallet.wallet_id), wallet)?)
    }

    pub fn wallet_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .scan_json::<Wallet>(keys::WALLET)?
            .into_iter()
            .map(|w| w.wallet_id)
            .collect())
    }

    // --- blocks ---

    pub fn block(&self, index: u64) -> Result<Option<Block>> {
        Ok(self.get_json(&keys::block(index))?)
    }

    pub fn block_by_hash(&self, hash: &str) -> Result<Option<Block>> {
        match self.get_json::<u64>(&keys::block_hash(hash))? {
            Some(index) => self.block(index),
            None => Ok(None),
        }
    }

    pub fn last_block(&self) -> Result<Option<Block>> {
        match self.data.scan_prefix(keys::BLOCK).next_back() {
            Some(item) => {
                let (_, raw) = item.map_err(StoreError::from)?;
                Ok(Some(serde_json::from_slice(&raw).map_err(StoreError::from)?))
            }
            None => Ok(None),
        }
    }

    /// All blocks ordered by index ascending
    pub fn blocks(&self) -> Result<Vec<Block>> {
        Ok(self.scan_json(keys::BLOCK)?)
    }

    pub fn headers(&self) -> Result<Vec<BlockHeader>> {
        Ok(self.blocks()?.iter().map(Block::header).collect())
    }

    // --- transactions ---

    pub fn transaction(&self, tx_id: &str) -> Result<Option<Transaction>> {
        match self.data.get(keys::tx_id(tx_id)).map_err(StoreError::from)? {
            Some(row_key) => Ok(self.get_json(&row_key)?),
            None => Ok(None),
        }
    }

    pub fn has_transaction(&self, tx_id: &str) -> Result<bool> {
        Ok(self
            .data
            .contains_key(keys::tx_id(tx_id))
            .map_err(StoreError::from)?)
    }

    /// Unconfirmed transactions, i.e. rows under block index 0
    pub fn mempool(&self) -> Result<Vec<Transaction>> {
        Ok(self.scan_json(&keys::tx_block_prefix(0))?)
    }

    pub fn transactions_in_block(&self, block_index: u64) -> Result<Vec<Transaction>> {
        Ok(self.scan_json(&keys::tx_block_prefix(block_index))?)
    }

    pub fn all_transactions(&self) -> Result<Vec<Transaction>> {
        Ok(self.scan_json(keys::TX)?)
    }

    /// Recent transactions touching a wallet, newest first
    pub fn transactions_for(&self, wallet_id: &str, limit: usize) -> Result<Vec<Transaction>> {
        let mut txs: Vec<Transaction> = self
            .all_transactions()?
            .into_iter()
            .filter(|tx| tx.sender == wallet_id || tx.recipient == wallet_id)
            .collect();
        txs.sort_by(|a, b| b.timestamp.total_cmp(&a.timestamp));
        txs.truncate(limit);
        Ok(txs)
    }

    // --- assets ---

    pub fn asset(&self, asset_id: &str) -> Result<Option<Asset>> {
        Ok(self.get_json(&keys::asset(asset_id))?)
    }

    pub fn assets(&self) -> Result<Vec<Asset>> {
        Ok(self.scan_json(keys::ASSET)?)
    }

    pub fn asset_ids(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for item in self.data.scan_prefix(keys::ASSET) {
            let (key, _) = item.map_err(StoreError::from)?;
            out.push(String::from_utf8_lossy(&key[keys::ASSET.len()..]).into_owned());
        }
        Ok(out)
    }

    /// A wallet's assets, newest first
    pub fn assets_of(&self, owner: &str) -> Result<Vec<Asset>> {
        let mut assets = Vec::new();
        for item in self.data.scan_prefix(&keys::asset_owner_prefix(owner)) {
            let (_, asset_id) = item.map_err(StoreError::from)?;
            if let Some(asset) = self.get_json::<Asset>(&keys::asset(&String::from_utf8_lossy(&asset_id)))? {
                assets.push(asset);
            }
        }
        assets.sort_by(|a, b| b.creation_time.total_cmp(&a.creation_time));
        Ok(assets)
    }

    /// The asset currently registered under a domain name, if any
    pub fn domain_asset(&self, name: &str) -> Result<Option<Asset>> {
        match self.data.get(keys::domain(name)).map_err(StoreError::from)? {
            Some(asset_id) => Ok(self.get_json(&keys::asset(&String::from_utf8_lossy(&asset_id)))?),
            None => Ok(None),
        }
    }

    // --- messages ---

    pub fn message(&self, msg_id: &str) -> Result<Option<Message>> {
        Ok(self.get_json(&keys::message(msg_id))?)
    }

    pub fn has_message(&self, msg_id: &str) -> Result<bool> {
        Ok(self
            .data
            .contains_key(keys::message(msg_id))
            .map_err(StoreError::from)?)
    }

    pub fn messages(&self) -> Result<Vec<Message>> {
        Ok(self.scan_json(keys::MESSAGE)?)
    }

    pub fn has_friend(&self, a: &str, b: &str) -> Result<bool> {
        Ok(self
            .data
            .contains_key(keys::friend(a, b))
            .map_err(StoreError::from)?)
    }

    // --- contracts ---

    pub fn contract(&self, address: &str) -> Result<Option<Contract>> {
        Ok(self.get_json(&keys::contract(address))?)
    }

    pub fn contracts(&self) -> Result<Vec<Contract>> {
        Ok(self.scan_json(keys::CONTRACT)?)
    }

    // --- peers ---

    pub fn peers(&self) -> Result<Vec<Peer>> {
        Ok(self.scan_json(keys::PEER)?)
    }

    /// Insert or refresh a peer's last-seen stamp (single-statement update)
    pub fn upsert_peer(&self, ip: &str, last_seen: f64) -> Result<()> {
        let peer = Peer {
            ip: ip.to_string(),
            last_seen,
        };
        Ok(self.put_json(&keys::peer(ip), &peer)?)
    }

    // --- fee schedule ---

    pub fn fee(&self, kind: &str) -> Result<f64> {
        self.get_json::<f64>(&keys::fee(kind))?
            .ok_or_else(|| NodeError::NotFound(format!("fee schedule entry {}", kind)))
    }

    pub fn set_fee(&self, kind: &str, amount: f64) -> Result<()> {
        Ok(self.put_json(&keys::fee(kind), &amount)?)
    }

    pub fn seed_fee_if_absent(&self, kind: &str, amount: f64) -> Result<()> {
        if self.get_json::<f64>(&keys::fee(kind))?.is_none() {
            self.set_fee(kind, amount)?;
        }
        Ok(())
    }

    pub fn fees(&self) -> Result<BTreeMap<String, f64>> {
        let mut schedule = BTreeMap::new();
        for item in self.data.scan_prefix(keys::FEE) {
            let (key, raw) = item.map_err(StoreError::from)?;
            let kind = String::from_utf8_lossy(&key[keys::FEE.len()..]).into_owned();
            let amount: f64 = serde_json::from_slice(&raw).map_err(StoreError::from)?;
            schedule.insert(kind, amount);
        }
        Ok(schedule)
    }

    /// Flush dirty pages to disk
    pub fn flush(&self) -> std::result::Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("Failed to flush store on drop: {}", e);
        } else {
            debug!("Flushed store on drop");
        }
    }
}
