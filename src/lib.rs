//! # GhostMesh Node v2.0.0
//!
//! A decentralized application platform node in Rust. Every node maintains a
//! proof-of-work coin ledger, a registry of expiring content assets (`.ghost`
//! domains and binary media), an append-only wallet-to-wallet message log, and
//! a registry of sandboxed smart contracts with persistent per-contract state.
//!
//! This crate provides a complete node implementation with:
//! - Block production with proof-of-work and a halving reward schedule
//! - Coin transfers with a mempool of unconfirmed transactions
//! - Fee-charged asset registration with six-month expiry
//! - Fee-charged messaging and friend invites
//! - A purpose-built deterministic script VM for smart contracts
//! - Persistent storage using sled
//! - Peer HTTP API and operator REST API using axum
//! - UDP presence discovery and periodic pull-based synchronization
//!
//! ## Architecture
//!
//! The project follows a modular architecture with clear separation of concerns:
//!
//! - **Store**: single system of record; namespaced sled keyspace with atomic
//!   multi-row transactions
//! - **Ledger**: chain of blocks, mempool, rewards, balance application
//! - **AssetRegistry**: domains and media with TTL and fee deduction
//! - **MessageLog**: append-only directed messages, de-duplicated by id
//! - **ContractRegistry + VM**: contract deployment, dispatch, sandboxed execution
//! - **PeerSet**: known-peer table plus UDP presence beacon and listener
//! - **SyncEngine**: periodic pull of blocks, assets and fees; gossip push
//! - **Node**: owning coordinator exposing the operator surface

pub mod api;
pub mod asset;
pub mod block;
pub mod config;
pub mod contract;
pub mod error;
pub mod ledger;
pub mod message;
pub mod node;
pub mod peer;
pub mod proof_of_work;
pub mod store;
pub mod sync;
pub mod transaction;
pub mod utils;
pub mod vm;
pub mod wallet;

// Re-export main types for easy access
pub use asset::{Asset, AssetRegistry, AssetType};
pub use block::{Block, BlockHeader};
pub use config::{FeeDefaults, NodeConfig};
pub use contract::{CallOutcome, Contract, ContractRegistry};
pub use error::{NodeError, Result};
pub use ledger::{Ledger, LedgerStats};
pub use message::{ConversationEntry, Message, MessageLog};
pub use node::Node;
pub use peer::{Peer, PeerSet};
pub use proof_of_work::ProofOfWork;
pub use store::Store;
pub use sync::{ChainBundle, GossipEvent, SyncEngine};
pub use transaction::Transaction;
pub use wallet::{User, Wallet, WalletManager};

/// Current version of the node protocol
pub const PROTOCOL_VERSION: &str = "2.0.0";

/// Base mining difficulty (number of leading zeros required)
pub const BASE_DIFFICULTY: u32 = 4;

/// Every this many active peers raises the difficulty by one
pub const PEERS_PER_DIFFICULTY_STEP: u64 = 5;

/// Block reward before the first halving
pub const INITIAL_BLOCK_REWARD: f64 = 50.0;

/// Reward halves every this many blocks
pub const HALVING_INTERVAL: u64 = 2_000;

/// Hard cap on total coin supply
pub const MAX_SUPPLY: f64 = 100_000_000.0;

/// Minimum seconds between two mining runs by the same wallet
pub const MINE_COOLDOWN_SECS: f64 = 86_400.0;

/// Lifetime of a registered asset (six months)
pub const ASSET_LIFETIME_SECS: f64 = 15_552_000.0;

/// Upper bound on uploaded media size in bytes
pub const MAX_MEDIA_BYTES: usize = 10 * 1024 * 1024;

/// Sender of every coinbase transaction and miner of the genesis block
pub const SYSTEM_SENDER: &str = "GhostProtocol_System";

/// System-owned wallet that accumulates all network fees
pub const TREASURY_WALLET: &str = "GHST_NETWORK_TREASURY_VAULT";

/// Default HTTP port for the peer and operator APIs
pub const DEFAULT_HTTP_PORT: u16 = 5000;

/// UDP port for presence beacons
pub const DISCOVERY_PORT: u16 = 5001;

/// Peers seen within this window count as active
pub const ACTIVE_PEER_WINDOW_SECS: f64 = 300.0;

/// Peers seen within this window count as known
pub const KNOWN_PEER_WINDOW_SECS: f64 = 3_600.0;

/// Mandatory suffix of every registered domain name
pub const DOMAIN_SUFFIX: &str = ".ghost";

/// Maximum number of keywords extracted from a domain page
pub const MAX_DOMAIN_KEYWORDS: usize = 20;
