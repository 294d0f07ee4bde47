use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::store::{self, keys, Store};
use crate::{utils, NodeError, Result, SYSTEM_SENDER, TREASURY_WALLET};

/// A registered operator account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    /// Unique human-readable name
    pub username: String,
    /// Opaque password verifier
    pub password_hash: String,
    /// Derived wallet identifier
    pub wallet_id: String,
    /// Registration time in seconds since the Unix epoch
    pub created_at: f64,
}

/// Coin balance state for one wallet identifier
///
/// Wallet rows exist independently of user rows: the treasury, the system
/// sentinel, and remote wallets first seen through synced transactions all
/// have balances but no account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Wallet {
    pub wallet_id: String,
    /// Never negative after a committed operation
    pub balance: f64,
    /// Time of the wallet's last mined block, 0 if never
    pub last_mined: f64,
}

impl Wallet {
    /// Fresh zero-balance wallet for an identifier
    pub fn new(wallet_id: &str) -> Self {
        Wallet {
            wallet_id: wallet_id.to_string(),
            balance: 0.0,
            last_mined: 0.0,
        }
    }
}

/// Derive the wallet identifier for a username
///
/// # Example
/// ```
/// use ghostmesh::wallet::wallet_id_for;
///
/// let id = wallet_id_for("alice");
/// assert!(id.starts_with("GHST"));
/// assert_eq!(id.len(), 24);
/// ```
pub fn wallet_id_for(username: &str) -> String {
    format!("GHST{}", &utils::calculate_hash(username)[..20])
}

fn password_verifier(username: &str, password: &str) -> String {
    utils::calculate_hash(format!("{}:{}", username, password))
}

/// Account registration and lookup over the store
#[derive(Debug, Clone)]
pub struct WalletManager {
    store: Arc<Store>,
    initial_balance: f64,
}

impl WalletManager {
    pub fn new(store: Arc<Store>, initial_balance: f64) -> Self {
        WalletManager {
            store,
            initial_balance,
        }
    }

    /// Create the treasury and system wallets on first boot
    pub fn ensure_system_wallets(&self) -> Result<()> {
        for wallet_id in [TREASURY_WALLET, SYSTEM_SENDER] {
            if self.store.wallet(wallet_id)?.is_none() {
                self.store.put_wallet(&Wallet::new(wallet_id))?;
                info!("Initialized system wallet {}", wallet_id);
            }
        }
        Ok(())
    }

    /// Register a new user and its wallet atomically
    ///
    /// # Arguments
    /// * `username` - Unique account name
    /// * `password` - Operator password, stored as an opaque verifier
    ///
    /// # Returns
    /// * `Result<User>` - The account, or `DuplicateName` if the name is taken
    pub fn register(&self, username: &str, password: &str) -> Result<User> {
        if username.is_empty() || password.is_empty() {
            return Err(NodeError::InvalidInput(
                "username and password are required".to_string(),
            ));
        }

        let user = User {
            username: username.to_string(),
            password_hash: password_verifier(username, password),
            wallet_id: wallet_id_for(username),
            created_at: utils::now_ts(),
        };
        let wallet = Wallet {
            wallet_id: user.wallet_id.clone(),
            balance: self.initial_balance,
            last_mined: 0.0,
        };

        self.store.transact(|tree| {
            if tree.get(keys::user(username))?.is_some() {
                return store::abort(NodeError::DuplicateName(username.to_string()));
            }
            store::tx_put(tree, &keys::user(username), &user)?;
            store::tx_put(tree, &keys::wallet(&wallet.wallet_id), &wallet)?;
            Ok(())
        })?;

        info!("Registered user {} with wallet {}", username, user.wallet_id);
        Ok(user)
    }

    /// Verify credentials and return the account
    pub fn authenticate(&self, username: &str, password: &str) -> Result<User> {
        let user = self
            .store
            .user(username)?
            .ok_or_else(|| NodeError::Unauthorized("unknown user or bad password".to_string()))?;
        if user.password_hash != password_verifier(username, password) {
            debug!("Rejected login for {}", username);
            return Err(NodeError::Unauthorized(
                "unknown user or bad password".to_string(),
            ));
        }
        Ok(user)
    }

    /// Wallet state for an identifier
    pub fn wallet(&self, wallet_id: &str) -> Result<Wallet> {
        self.store
            .wallet(wallet_id)?
            .ok_or_else(|| NodeError::NotFound(format!("wallet {}", wallet_id)))
    }

    /// Account plus wallet state for a username
    pub fn wallet_of(&self, username: &str) -> Result<(User, Wallet)> {
        let user = self
            .store
            .user(username)?
            .ok_or_else(|| NodeError::NotFound(format!("user {}", username)))?;
        let wallet = self.wallet(&user.wallet_id)?;
        Ok((user, wallet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(initial: f64) -> (tempfile::TempDir, WalletManager) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        (dir, WalletManager::new(store, initial))
    }

    #[test]
    fn test_wallet_id_derivation() {
        let id = wallet_id_for("alice");
        assert_eq!(id.len(), 24);
        assert!(id.starts_with("GHST"));
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic per name, distinct across names
        assert_eq!(id, wallet_id_for("alice"));
        assert_ne!(id, wallet_id_for("bob"));
    }

    #[test]
    fn test_register_and_authenticate() {
        let (_dir, manager) = manager(0.0);
        let user = manager.register("alice", "secret").unwrap();
        assert_eq!(user.wallet_id, wallet_id_for("alice"));
        assert_ne!(user.password_hash, "secret");

        let wallet = manager.wallet(&user.wallet_id).unwrap();
        assert_eq!(wallet.balance, 0.0);
        assert_eq!(wallet.last_mined, 0.0);

        assert!(manager.authenticate("alice", "secret").is_ok());
        assert!(matches!(
            manager.authenticate("alice", "wrong"),
            Err(NodeError::Unauthorized(_))
        ));
        assert!(matches!(
            manager.authenticate("mallory", "secret"),
            Err(NodeError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_duplicate_username_rejected() {
        let (_dir, manager) = manager(0.0);
        manager.register("alice", "one").unwrap();
        assert_eq!(
            manager.register("alice", "two").unwrap_err(),
            NodeError::DuplicateName("alice".to_string())
        );
    }

    #[test]
    fn test_dev_seed_balance() {
        let (_dir, manager) = manager(50.0);
        let user = manager.register("alice", "secret").unwrap();
        assert_eq!(manager.wallet(&user.wallet_id).unwrap().balance, 50.0);
    }

    #[test]
    fn test_system_wallets() {
        let (_dir, manager) = manager(0.0);
        manager.ensure_system_wallets().unwrap();
        assert_eq!(manager.wallet(TREASURY_WALLET).unwrap().balance, 0.0);
        assert_eq!(manager.wallet(SYSTEM_SENDER).unwrap().balance, 0.0);
        // Idempotent across reboots
        manager.ensure_system_wallets().unwrap();
    }
}
