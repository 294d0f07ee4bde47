use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};

use crate::block::{Block, BlockHeader};
use crate::proof_of_work::ProofOfWork;
use crate::store::{self, keys, Store};
use crate::transaction::Transaction;
use crate::wallet::Wallet;
use crate::{
    utils, NodeError, Result, HALVING_INTERVAL, INITIAL_BLOCK_REWARD, MAX_SUPPLY,
    MINE_COOLDOWN_SECS,
};

/// Supply and chain totals reported to the operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Hard supply cap
    pub max_supply: f64,
    /// Sum of all coinbase amounts
    pub circulating: f64,
    /// Coins left to mine
    pub remaining: f64,
    /// Reward of the next block
    pub block_reward: f64,
    /// Index of the chain tip
    pub block_height: u64,
    /// Truncated hash of the chain tip
    pub last_hash: String,
    /// Blocks until the reward halves again
    pub blocks_until_halving: u64,
}

/// The consensus-and-balance engine
///
/// Owns block production and acceptance, the mempool, and every balance
/// movement. All commit paths are single atomic store transactions; the
/// proof-of-work search runs outside any transaction and the commit re-checks
/// the chain tip, so a lost mining race surfaces as `StoreConflict`.
#[derive(Debug, Clone)]
pub struct Ledger {
    store: Arc<Store>,
}

impl Ledger {
    pub fn new(store: Arc<Store>) -> Self {
        Ledger { store }
    }

    /// Insert the genesis block on first boot
    pub fn ensure_genesis(&self) -> Result<()> {
        if self.store.last_block()?.is_some() {
            return Ok(());
        }
        let genesis = Block::genesis();
        self.store.transact(|tree| {
            if tree.get(keys::block(1))?.is_some() {
                return Ok(());
            }
            store::tx_put(tree, &keys::block(1), &genesis)?;
            store::tx_put(tree, &keys::block_hash(&genesis.block_hash), &1u64)?;
            Ok(())
        })?;
        info!("Created genesis block {}", genesis.short_hash());
        Ok(())
    }

    /// Scheduled reward for a block at the given height
    ///
    /// Halves every [`HALVING_INTERVAL`] blocks, using integer division on
    /// the height.
    pub fn reward_at(height: u64) -> f64 {
        INITIAL_BLOCK_REWARD / 2f64.powi((height / HALVING_INTERVAL) as i32)
    }

    /// The block with the highest index
    pub fn last_block(&self) -> Result<Block> {
        self.store
            .last_block()?
            .ok_or_else(|| NodeError::NotFound("chain tip (store not bootstrapped)".to_string()))
    }

    /// Ordered `(index, hash)` list for every block
    pub fn headers(&self) -> Result<Vec<BlockHeader>> {
        self.store.headers()
    }

    /// Full block record by hash
    pub fn block_by_hash(&self, hash: &str) -> Result<Block> {
        self.store
            .block_by_hash(hash)?
            .ok_or_else(|| NodeError::NotFound(format!("block {}", hash)))
    }

    /// Supply and chain totals
    pub fn get_statistics(&self) -> Result<LedgerStats> {
        let last = self.last_block()?;
        let height = last.block_index;
        let circulating: f64 = self
            .store
            .all_transactions()?
            .iter()
            .filter(|tx| tx.is_coinbase())
            .map(|tx| tx.amount)
            .sum();
        Ok(LedgerStats {
            max_supply: MAX_SUPPLY,
            circulating,
            remaining: MAX_SUPPLY - circulating,
            block_reward: Self::reward_at(height + 1),
            block_height: height,
            last_hash: last.short_hash().to_string(),
            blocks_until_halving: HALVING_INTERVAL - height % HALVING_INTERVAL,
        })
    }

    /// Produce and commit a new block
    ///
    /// Fails with `CooldownActive` when the miner mined within the last
    /// 86 400 s. The commit inserts the block, credits the scheduled coinbase
    /// reward, stamps the miner's cooldown, and confirms every mempool
    /// transaction, all atomically.
    ///
    /// # Arguments
    /// * `miner` - Wallet identifier receiving the reward
    /// * `difficulty` - Current network difficulty
    pub fn mine(&self, miner: &str, difficulty: u32) -> Result<Block> {
        let wallet = self
            .store
            .wallet(miner)?
            .ok_or_else(|| NodeError::NotFound(format!("wallet {}", miner)))?;
        let now = utils::now_ts();
        if wallet.last_mined > 0.0 && now - wallet.last_mined < MINE_COOLDOWN_SECS {
            return Err(NodeError::CooldownActive {
                remaining_secs: MINE_COOLDOWN_SECS - (now - wallet.last_mined),
            });
        }

        let last = self.last_block()?;
        let pow = ProofOfWork::new(difficulty)?;
        let proof = pow.mine(last.proof);

        let timestamp = utils::now_ts();
        let block = Block::next(&last, proof, miner, timestamp);
        let reward = Self::reward_at(block.block_index);
        let coinbase = Transaction::coinbase(miner, reward, block.block_index, timestamp);
        let pending = self.store.mempool()?;

        self.store.transact(|tree| {
            if tree.get(keys::block(block.block_index))?.is_some() {
                return store::abort(NodeError::StoreConflict(format!(
                    "block {} was committed by a concurrent writer",
                    block.block_index
                )));
            }
            let tip: Option<Block> = store::tx_get(tree, &keys::block(last.block_index))?;
            match tip {
                Some(ref tip) if tip.block_hash == block.previous_hash => {}
                _ => {
                    return store::abort(NodeError::StoreConflict(
                        "chain tip moved during the proof search".to_string(),
                    ))
                }
            }

            let miner_key = keys::wallet(miner);
            let mut miner_wallet = match store::tx_get::<Wallet>(tree, &miner_key)? {
                Some(wallet) => wallet,
                None => return store::abort(NodeError::NotFound(format!("wallet {}", miner))),
            };
            if miner_wallet.last_mined > 0.0
                && timestamp - miner_wallet.last_mined < MINE_COOLDOWN_SECS
            {
                return store::abort(NodeError::CooldownActive {
                    remaining_secs: MINE_COOLDOWN_SECS - (timestamp - miner_wallet.last_mined),
                });
            }

            store::tx_put(tree, &keys::block(block.block_index), &block)?;
            store::tx_put(tree, &keys::block_hash(&block.block_hash), &block.block_index)?;
            store::tx_insert_transaction(tree, &coinbase)?;

            miner_wallet.balance += reward;
            miner_wallet.last_mined = timestamp;
            store::tx_put(tree, &miner_key, &miner_wallet)?;

            Self::confirm_pending(tree, &pending, block.block_index)?;
            Ok(())
        })?;

        info!(
            "Mined block #{} (reward {}, {} confirmed)",
            block.block_index,
            reward,
            pending.len()
        );
        Ok(block)
    }

    /// Move coins between two wallets and record the unconfirmed transaction
    ///
    /// Debit and credit both apply at insert time; a later block only stamps
    /// the confirming index.
    pub fn transfer(&self, sender: &str, recipient: &str, amount: f64) -> Result<Transaction> {
        let tx = Transaction::new_transfer(sender, recipient, amount)?;
        self.store.transact(|tree| {
            store::tx_debit_wallet(tree, sender, amount)?;
            store::tx_credit_wallet(tree, recipient, amount)?;
            store::tx_insert_transaction(tree, &tx)?;
            Ok(())
        })?;
        info!("Transferred {} from {} to {}", amount, sender, recipient);
        Ok(tx)
    }

    /// Insert a transaction announced by a peer, de-duplicated on id
    ///
    /// The sender's debit happened on the origin node; the recipient is
    /// credited here when a block confirms the transaction.
    ///
    /// # Returns
    /// * `Result<bool>` - True when the transaction was new
    pub fn receive_transaction(&self, tx: Transaction) -> Result<bool> {
        if self.store.has_transaction(&tx.tx_id)? {
            return Ok(false);
        }
        let record = Transaction {
            block_index: 0,
            settled: false,
            ..tx
        };
        let inserted = self.store.transact(|tree| {
            if tree.get(keys::tx_id(&record.tx_id))?.is_some() {
                return Ok(false);
            }
            store::tx_insert_transaction(tree, &record)?;
            Ok(true)
        })?;
        if inserted {
            debug!("Accepted peer transaction {}", record.tx_id);
        }
        Ok(inserted)
    }

    /// Append a block produced by a peer
    ///
    /// Idempotent on index and hash. Only a block extending the local tip is
    /// appended; anything else is left to longest-chain adoption. A new
    /// insert issues the coinbase credit and confirms the mempool exactly as
    /// a local mine would, but never touches the miner's cooldown.
    ///
    /// # Returns
    /// * `Result<bool>` - True when the block was appended
    pub fn accept_peer_block(&self, block: Block) -> Result<bool> {
        if self.store.block(block.block_index)?.is_some()
            || self.store.block_by_hash(&block.block_hash)?.is_some()
        {
            return Ok(false);
        }
        let last = self.last_block()?;
        if block.block_index != last.block_index + 1 || block.previous_hash != last.block_hash {
            warn!(
                "Ignoring unlinked peer block #{} ({}), local tip is #{}",
                block.block_index,
                block.short_hash(),
                last.block_index
            );
            return Ok(false);
        }

        let reward = Self::reward_at(block.block_index);
        let coinbase = Transaction::coinbase(&block.miner, reward, block.block_index, block.timestamp);
        let pending = self.store.mempool()?;

        let appended = self.store.transact(|tree| {
            if tree.get(keys::block(block.block_index))?.is_some() {
                return Ok(false);
            }
            let tip: Option<Block> = store::tx_get(tree, &keys::block(last.block_index))?;
            match tip {
                Some(ref tip) if tip.block_hash == block.previous_hash => {}
                _ => return Ok(false),
            }

            store::tx_put(tree, &keys::block(block.block_index), &block)?;
            store::tx_put(tree, &keys::block_hash(&block.block_hash), &block.block_index)?;
            store::tx_insert_transaction(tree, &coinbase)?;
            store::tx_credit_wallet(tree, &block.miner, reward)?;
            Self::confirm_pending(tree, &pending, block.block_index)?;
            Ok(true)
        })?;

        if appended {
            info!("Accepted peer block #{} from {}", block.block_index, block.miner);
        }
        Ok(appended)
    }

    /// Confirm a snapshot of mempool transactions into a block
    ///
    /// Each row still unconfirmed moves to the block's key range; rows whose
    /// balances were never applied locally credit the recipient now.
    fn confirm_pending(
        tree: &TransactionalTree,
        pending: &[Transaction],
        block_index: u64,
    ) -> ConflictableTransactionResult<(), NodeError> {
        for tx in pending {
            let old_key = keys::tx(0, &tx.tx_id);
            let current: Option<Transaction> = store::tx_get(tree, &old_key)?;
            if let Some(mut current) = current {
                if current.block_index != 0 {
                    continue;
                }
                tree.remove(old_key)?;
                current.block_index = block_index;
                if !current.settled {
                    store::tx_credit_wallet(tree, &current.recipient, current.amount)?;
                    current.settled = true;
                }
                store::tx_insert_transaction(tree, &current)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::WalletManager;
    use tempfile::tempdir;

    const TEST_DIFFICULTY: u32 = 1;

    fn setup() -> (tempfile::TempDir, Arc<Store>, WalletManager, Ledger) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let wallets = WalletManager::new(Arc::clone(&store), 0.0);
        wallets.ensure_system_wallets().unwrap();
        let ledger = Ledger::new(Arc::clone(&store));
        ledger.ensure_genesis().unwrap();
        (dir, store, wallets, ledger)
    }

    fn reset_cooldown(store: &Store, wallet_id: &str) {
        let mut wallet = store.wallet(wallet_id).unwrap().unwrap();
        wallet.last_mined = 0.0;
        store.put_wallet(&wallet).unwrap();
    }

    #[test]
    fn test_reward_schedule() {
        assert_eq!(Ledger::reward_at(1), 50.0);
        assert_eq!(Ledger::reward_at(1_999), 50.0);
        assert_eq!(Ledger::reward_at(2_000), 25.0);
        assert_eq!(Ledger::reward_at(3_999), 25.0);
        assert_eq!(Ledger::reward_at(4_000), 12.5);
        assert_eq!(Ledger::reward_at(6_000), 6.25);
    }

    #[test]
    fn test_genesis_is_idempotent() {
        let (_dir, store, _wallets, ledger) = setup();
        ledger.ensure_genesis().unwrap();
        assert_eq!(store.blocks().unwrap().len(), 1);
        assert!(ledger.last_block().unwrap().is_genesis());
    }

    #[test]
    fn test_mine_and_reward() {
        let (_dir, store, wallets, ledger) = setup();
        let alice = wallets.register("alice", "pw").unwrap();

        let block = ledger.mine(&alice.wallet_id, TEST_DIFFICULTY).unwrap();
        assert_eq!(block.block_index, 2);
        assert_eq!(block.previous_hash, Block::genesis().block_hash);

        let coinbases: Vec<Transaction> = store
            .transactions_in_block(2)
            .unwrap()
            .into_iter()
            .filter(|tx| tx.is_coinbase())
            .collect();
        assert_eq!(coinbases.len(), 1);
        assert_eq!(coinbases[0].amount, 50.0);
        assert_eq!(coinbases[0].recipient, alice.wallet_id);
        assert_eq!(wallets.wallet(&alice.wallet_id).unwrap().balance, 50.0);
    }

    #[test]
    fn test_double_mine_blocked_by_cooldown() {
        let (_dir, store, wallets, ledger) = setup();
        let alice = wallets.register("alice", "pw").unwrap();
        ledger.mine(&alice.wallet_id, TEST_DIFFICULTY).unwrap();

        let err = ledger.mine(&alice.wallet_id, TEST_DIFFICULTY).unwrap_err();
        assert!(matches!(err, NodeError::CooldownActive { .. }));
        assert_eq!(store.blocks().unwrap().len(), 2);
        assert_eq!(wallets.wallet(&alice.wallet_id).unwrap().balance, 50.0);
    }

    #[test]
    fn test_mine_unknown_wallet() {
        let (_dir, _store, _wallets, ledger) = setup();
        assert!(matches!(
            ledger.mine("GHSTnobody", TEST_DIFFICULTY),
            Err(NodeError::NotFound(_))
        ));
    }

    #[test]
    fn test_transfer_settles_immediately() {
        let (_dir, store, wallets, ledger) = setup();
        let alice = wallets.register("alice", "pw").unwrap();
        let bob = wallets.register("bob", "pw").unwrap();
        ledger.mine(&alice.wallet_id, TEST_DIFFICULTY).unwrap();

        let tx = ledger.transfer(&alice.wallet_id, &bob.wallet_id, 10.0).unwrap();
        assert_eq!(wallets.wallet(&alice.wallet_id).unwrap().balance, 40.0);
        assert_eq!(wallets.wallet(&bob.wallet_id).unwrap().balance, 10.0);
        assert!(tx.is_pending());
        assert_eq!(store.mempool().unwrap().len(), 1);
    }

    #[test]
    fn test_transfer_validation() {
        let (_dir, _store, wallets, ledger) = setup();
        let alice = wallets.register("alice", "pw").unwrap();
        let bob = wallets.register("bob", "pw").unwrap();

        assert!(matches!(
            ledger.transfer(&alice.wallet_id, &bob.wallet_id, 10.0),
            Err(NodeError::InsufficientFunds { .. })
        ));
        assert_eq!(
            ledger.transfer(&alice.wallet_id, &alice.wallet_id, 1.0),
            Err(NodeError::SelfTransfer)
        );
        assert!(matches!(
            ledger.transfer(&alice.wallet_id, &bob.wallet_id, -1.0),
            Err(NodeError::NonPositiveAmount(_))
        ));
    }

    #[test]
    fn test_mempool_confirmation_on_mine() {
        let (_dir, store, wallets, ledger) = setup();
        let alice = wallets.register("alice", "pw").unwrap();
        let bob = wallets.register("bob", "pw").unwrap();
        ledger.mine(&alice.wallet_id, TEST_DIFFICULTY).unwrap();
        let tx = ledger.transfer(&alice.wallet_id, &bob.wallet_id, 10.0).unwrap();

        reset_cooldown(&store, &alice.wallet_id);
        let block = ledger.mine(&alice.wallet_id, TEST_DIFFICULTY).unwrap();

        let confirmed = store.transaction(&tx.tx_id).unwrap().unwrap();
        assert_eq!(confirmed.block_index, block.block_index);
        assert!(store.mempool().unwrap().is_empty());
        // Settled at insert time, so no double credit at confirmation
        assert_eq!(wallets.wallet(&bob.wallet_id).unwrap().balance, 10.0);
        assert_eq!(wallets.wallet(&alice.wallet_id).unwrap().balance, 90.0);
    }

    #[test]
    fn test_receive_transaction_idempotent() {
        let (_dir, store, _wallets, ledger) = setup();
        let tx = Transaction::new_transfer("GHSTremote", "GHSTlocal", 5.0).unwrap();

        assert!(ledger.receive_transaction(tx.clone()).unwrap());
        assert!(!ledger.receive_transaction(tx.clone()).unwrap());
        assert_eq!(store.mempool().unwrap().len(), 1);
        // No balance movement on receive
        assert!(store.wallet("GHSTlocal").unwrap().is_none());
    }

    #[test]
    fn test_received_transaction_credits_at_confirmation() {
        let (_dir, store, wallets, ledger) = setup();
        let alice = wallets.register("alice", "pw").unwrap();
        let remote = Transaction::new_transfer("GHSTremote", &alice.wallet_id, 7.5).unwrap();
        ledger.receive_transaction(remote.clone()).unwrap();

        ledger.mine(&alice.wallet_id, TEST_DIFFICULTY).unwrap();

        let confirmed = store.transaction(&remote.tx_id).unwrap().unwrap();
        assert_eq!(confirmed.block_index, 2);
        assert!(confirmed.settled);
        // Coinbase 50 plus the synced credit
        assert_eq!(wallets.wallet(&alice.wallet_id).unwrap().balance, 57.5);
    }

    #[test]
    fn test_accept_peer_block_idempotent() {
        let (_dir, store, _wallets, ledger) = setup();
        let genesis = ledger.last_block().unwrap();
        let pow = ProofOfWork::new(TEST_DIFFICULTY).unwrap();
        let proof = pow.mine(genesis.proof);
        let block = Block::next(&genesis, proof, "GHSTremoteminer", 10.0);

        assert!(ledger.accept_peer_block(block.clone()).unwrap());
        assert!(!ledger.accept_peer_block(block.clone()).unwrap());

        assert_eq!(store.blocks().unwrap().len(), 2);
        // Exactly one coinbase credit despite re-delivery
        let miner = store.wallet("GHSTremoteminer").unwrap().unwrap();
        assert_eq!(miner.balance, 50.0);
        // Accepting a peer block never stamps the cooldown
        assert_eq!(miner.last_mined, 0.0);
    }

    #[test]
    fn test_accept_peer_block_requires_linkage() {
        let (_dir, store, _wallets, ledger) = setup();
        let genesis = ledger.last_block().unwrap();
        let forged = Block::next(
            &Block {
                block_hash: "somethingelse".to_string(),
                ..genesis.clone()
            },
            9,
            "GHSTforger",
            10.0,
        );
        assert!(!ledger.accept_peer_block(forged).unwrap());

        let skipped = Block {
            block_index: 5,
            ..Block::next(&genesis, 9, "GHSTforger", 10.0)
        };
        assert!(!ledger.accept_peer_block(skipped).unwrap());
        assert_eq!(store.blocks().unwrap().len(), 1);
    }

    #[test]
    fn test_statistics() {
        let (_dir, _store, wallets, ledger) = setup();
        let alice = wallets.register("alice", "pw").unwrap();
        ledger.mine(&alice.wallet_id, TEST_DIFFICULTY).unwrap();

        let stats = ledger.get_statistics().unwrap();
        assert_eq!(stats.max_supply, MAX_SUPPLY);
        assert_eq!(stats.circulating, 50.0);
        assert_eq!(stats.remaining, MAX_SUPPLY - 50.0);
        assert_eq!(stats.block_height, 2);
        assert_eq!(stats.block_reward, 50.0);
        assert_eq!(stats.blocks_until_halving, HALVING_INTERVAL - 2);
        assert_eq!(stats.last_hash.len(), 16);
    }
}
