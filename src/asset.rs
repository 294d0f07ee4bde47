use std::sync::Arc;

use log::{debug, info};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{self, keys, Store};
use crate::transaction::Transaction;
use crate::{
    utils, NodeError, Result, ASSET_LIFETIME_SECS, DOMAIN_SUFFIX, MAX_DOMAIN_KEYWORDS,
    MAX_MEDIA_BYTES, TREASURY_WALLET,
};

/// Served when a domain is registered without content
pub const PLACEHOLDER_HTML: &str =
    "<html><body><h1>This .ghost domain is parked.</h1></body></html>";

/// Kind of registered content
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Domain,
    Image,
    Video,
    Audio,
    File,
}

impl AssetType {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "domain" => Ok(AssetType::Domain),
            "image" => Ok(AssetType::Image),
            "video" => Ok(AssetType::Video),
            "audio" => Ok(AssetType::Audio),
            "file" => Ok(AssetType::File),
            other => Err(NodeError::InvalidInput(format!("unknown asset type {}", other))),
        }
    }
}

impl std::fmt::Display for AssetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AssetType::Domain => "domain",
            AssetType::Image => "image",
            AssetType::Video => "video",
            AssetType::Audio => "audio",
            AssetType::File => "file",
        };
        write!(f, "{}", name)
    }
}

/// A registered content asset
///
/// Domains carry HTML and a keyword list for search; media carry raw bytes.
/// Every asset expires six months after creation. Content is base64 text in
/// every JSON form, at rest and on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Asset {
    pub asset_id: String,
    /// Wallet identifier of the owner
    pub owner: String,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    /// Human-readable name; domains always end in `.ghost`
    pub name: String,
    #[serde(with = "utils::b64")]
    pub content: Vec<u8>,
    pub storage_size: u64,
    pub creation_time: f64,
    pub expiry_time: f64,
    /// Search keywords, domains only
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl Asset {
    /// An asset stays active through the exact expiry second
    pub fn is_expired(&self, now: f64) -> bool {
        now > self.expiry_time
    }

    pub fn days_left(&self, now: f64) -> i64 {
        ((self.expiry_time - now) / 86_400.0) as i64
    }

    /// MIME type guessed from the name suffix, for serving media
    pub fn mime_type(&self) -> &'static str {
        if self.asset_type == AssetType::Domain {
            return "text/html";
        }
        let name = self.name.to_lowercase();
        if name.ends_with(".jpg") || name.ends_with(".jpeg") {
            "image/jpeg"
        } else if name.ends_with(".png") {
            "image/png"
        } else if name.ends_with(".gif") {
            "image/gif"
        } else if name.ends_with(".mp4") || name.ends_with(".webm") {
            "video/mp4"
        } else if name.ends_with(".mp3") || name.ends_with(".wav") {
            "audio/mpeg"
        } else {
            "application/octet-stream"
        }
    }
}

/// Extract search keywords from a domain page
///
/// Script and style blocks go first, then the remaining tags; anything
/// non-alphabetic becomes a separator. Keeps the first twenty unique
/// lowercased words longer than two characters.
pub fn extract_keywords(html: &str) -> Vec<String> {
    let scripts = Regex::new(r"(?is)<script\b.*?</script>").expect("static pattern");
    let styles = Regex::new(r"(?is)<style\b.*?</style>").expect("static pattern");
    let tags = Regex::new(r"(?s)<[^>]*>").expect("static pattern");

    let text = scripts.replace_all(html, " ");
    let text = styles.replace_all(&text, " ");
    let text = tags.replace_all(&text, " ");

    let cleaned: String = text
        .chars()
        .map(|c| if c.is_alphabetic() { c.to_ascii_lowercase() } else { ' ' })
        .collect();

    let mut keywords = Vec::new();
    for word in cleaned.split_whitespace() {
        if word.len() > 2 && !keywords.iter().any(|k| k == word) {
            keywords.push(word.to_string());
            if keywords.len() == MAX_DOMAIN_KEYWORDS {
                break;
            }
        }
    }
    keywords
}

/// Content-addressed registration of domains and media with TTL and fees
#[derive(Debug, Clone)]
pub struct AssetRegistry {
    store: Arc<Store>,
}

impl AssetRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        AssetRegistry { store }
    }

    /// Register a `.ghost` domain for six months
    ///
    /// Charges the flat `domain_reg` fee to the treasury. Registration is
    /// rejected while another asset holds the same name un-expired.
    ///
    /// # Returns
    /// * `Result<(Asset, Transaction)>` - The asset and its fee transaction
    pub fn register_domain(
        &self,
        owner: &str,
        name: &str,
        content: &str,
    ) -> Result<(Asset, Transaction)> {
        let mut name = name.trim().to_string();
        if name.is_empty() {
            return Err(NodeError::InvalidInput("domain name is required".to_string()));
        }
        if !name.to_lowercase().ends_with(DOMAIN_SUFFIX) {
            name.push_str(DOMAIN_SUFFIX);
        }
        let content = if content.trim().is_empty() {
            PLACEHOLDER_HTML.to_string()
        } else {
            content.to_string()
        };

        let fee = self.store.fee("domain_reg")?;
        let now = utils::now_ts();
        let asset = Asset {
            asset_id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            asset_type: AssetType::Domain,
            name: name.clone(),
            content: content.clone().into_bytes(),
            storage_size: content.len() as u64,
            creation_time: now,
            expiry_time: now + ASSET_LIFETIME_SECS,
            keywords: extract_keywords(&content),
        };

        let fee_tx = self.commit_registration(&asset, fee, true)?;
        info!("Registered domain {} for {} (fee {})", asset.name, owner, fee);
        Ok((asset, fee_tx))
    }

    /// Register a media asset for six months
    ///
    /// Charges size-in-MB times the `storage_mb` fee.
    pub fn register_media(
        &self,
        owner: &str,
        asset_type: AssetType,
        name: &str,
        content: Vec<u8>,
    ) -> Result<(Asset, Transaction)> {
        if asset_type == AssetType::Domain {
            return Err(NodeError::InvalidInput(
                "domains are registered through the domain path".to_string(),
            ));
        }
        if name.trim().is_empty() {
            return Err(NodeError::InvalidInput("asset name is required".to_string()));
        }
        if content.len() > MAX_MEDIA_BYTES {
            return Err(NodeError::InvalidInput(format!(
                "media exceeds the {} byte limit",
                MAX_MEDIA_BYTES
            )));
        }

        let size_mb = content.len() as f64 / (1024.0 * 1024.0);
        let fee = size_mb * self.store.fee("storage_mb")?;
        let now = utils::now_ts();
        let asset = Asset {
            asset_id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            asset_type,
            name: name.trim().to_string(),
            storage_size: content.len() as u64,
            content,
            creation_time: now,
            expiry_time: now + ASSET_LIFETIME_SECS,
            keywords: Vec::new(),
        };

        let fee_tx = self.commit_registration(&asset, fee, false)?;
        info!("Registered {} {} for {} (fee {:.6})", asset.asset_type, asset.name, owner, fee);
        Ok((asset, fee_tx))
    }

    /// Atomic registration commit: uniqueness, fee movement, asset insert
    fn commit_registration(&self, asset: &Asset, fee: f64, is_domain: bool) -> Result<Transaction> {
        let fee_tx = Transaction::fee(&asset.owner, fee);
        let now = utils::now_ts();

        self.store.transact(|tree| {
            if is_domain {
                if let Some(existing_id) = tree.get(keys::domain(&asset.name))? {
                    let existing: Option<Asset> = store::tx_get(
                        tree,
                        &keys::asset(&String::from_utf8_lossy(&existing_id)),
                    )?;
                    if let Some(existing) = existing {
                        if !existing.is_expired(now) {
                            return store::abort(NodeError::DuplicateName(asset.name.clone()));
                        }
                    }
                }
            }

            store::tx_debit_wallet(tree, &asset.owner, fee)?;
            store::tx_credit_wallet(tree, TREASURY_WALLET, fee)?;
            store::tx_insert_transaction(tree, &fee_tx)?;

            store::tx_put(tree, &keys::asset(&asset.asset_id), asset)?;
            tree.insert(
                keys::asset_owner(&asset.owner, &asset.asset_id),
                asset.asset_id.as_bytes(),
            )?;
            tree.insert(
                keys::asset_expiry(asset.expiry_time as u64, &asset.asset_id),
                asset.asset_id.as_bytes(),
            )?;
            if is_domain {
                tree.insert(keys::domain(&asset.name), asset.asset_id.as_bytes())?;
            }
            Ok(())
        })?;
        Ok(fee_tx)
    }

    /// Replace an asset's content, owner only
    ///
    /// Identifier, type, creation and expiry time are preserved; domains get
    /// their keywords re-extracted.
    pub fn update_content(&self, asset_id: &str, owner: &str, content: Vec<u8>) -> Result<Asset> {
        let asset = self.require(asset_id)?;
        if asset.owner != owner {
            return Err(NodeError::Unauthorized(
                "only the owner may edit an asset".to_string(),
            ));
        }

        let keywords = if asset.asset_type == AssetType::Domain {
            extract_keywords(&String::from_utf8_lossy(&content))
        } else {
            asset.keywords.clone()
        };
        let updated = Asset {
            storage_size: content.len() as u64,
            content,
            keywords,
            ..asset
        };

        self.store.transact(|tree| {
            // Owner re-checked inside the commit so a racing delete cannot resurrect the row
            let current: Option<Asset> = store::tx_get(tree, &keys::asset(asset_id))?;
            match current {
                Some(ref current) if current.owner == owner => {}
                _ => return store::abort(NodeError::NotFound(format!("asset {}", asset_id))),
            }
            store::tx_put(tree, &keys::asset(asset_id), &updated)?;
            Ok(())
        })?;
        debug!("Updated content of asset {}", asset_id);
        Ok(updated)
    }

    /// Hard-delete an asset, owner only
    pub fn delete(&self, asset_id: &str, owner: &str) -> Result<()> {
        let asset = self.require(asset_id)?;
        if asset.owner != owner {
            return Err(NodeError::Unauthorized(
                "only the owner may delete an asset".to_string(),
            ));
        }

        self.store.transact(|tree| {
            tree.remove(keys::asset(asset_id))?;
            tree.remove(keys::asset_owner(&asset.owner, asset_id))?;
            tree.remove(keys::asset_expiry(asset.expiry_time as u64, asset_id))?;
            if asset.asset_type == AssetType::Domain {
                if let Some(pointed) = tree.get(keys::domain(&asset.name))? {
                    if pointed.as_ref() == asset_id.as_bytes() {
                        tree.remove(keys::domain(&asset.name))?;
                    }
                }
            }
            Ok(())
        })?;
        info!("Deleted asset {} ({})", asset_id, asset.name);
        Ok(())
    }

    /// Fetch an asset for viewing
    ///
    /// An expired domain is visible to its owner only.
    pub fn view(&self, asset_id: &str, viewer: Option<&str>) -> Result<Asset> {
        let asset = self.require(asset_id)?;
        if asset.asset_type == AssetType::Domain
            && asset.is_expired(utils::now_ts())
            && viewer != Some(asset.owner.as_str())
        {
            return Err(NodeError::Unauthorized(
                "domain expired and no longer published".to_string(),
            ));
        }
        Ok(asset)
    }

    /// Raw fetch by id, used by the peer API
    pub fn get(&self, asset_id: &str) -> Result<Asset> {
        self.require(asset_id)
    }

    fn require(&self, asset_id: &str) -> Result<Asset> {
        self.store
            .asset(asset_id)?
            .ok_or_else(|| NodeError::NotFound(format!("asset {}", asset_id)))
    }

    /// A wallet's assets, newest first
    pub fn assets_of(&self, owner: &str) -> Result<Vec<Asset>> {
        self.store.assets_of(owner)
    }

    /// All asset identifiers, for catch-up metadata exchange
    pub fn asset_ids(&self) -> Result<Vec<String>> {
        self.store.asset_ids()
    }

    /// Case-insensitive substring search over active domains
    ///
    /// An empty query lists the most recently registered active domains.
    pub fn search_domains(&self, query: &str) -> Result<Vec<Asset>> {
        let now = utils::now_ts();
        let needle = query.trim().to_lowercase();
        let mut hits: Vec<Asset> = self
            .store
            .assets()?
            .into_iter()
            .filter(|a| a.asset_type == AssetType::Domain && !a.is_expired(now))
            .filter(|a| {
                needle.is_empty()
                    || a.name.to_lowercase().contains(&needle)
                    || a.keywords.iter().any(|k| k.contains(&needle))
            })
            .collect();
        hits.sort_by(|a, b| b.creation_time.total_cmp(&a.creation_time));
        Ok(hits)
    }

    /// Insert an asset pulled from a peer, de-duplicated on id
    ///
    /// The registration fee was paid on the origin node; no balances move
    /// here.
    ///
    /// # Returns
    /// * `Result<bool>` - True when the asset was new
    pub fn sync_receive(&self, remote: Asset) -> Result<bool> {
        if self.store.asset(&remote.asset_id)?.is_some() {
            return Ok(false);
        }
        let inserted = self.store.transact(|tree| {
            if tree.get(keys::asset(&remote.asset_id))?.is_some() {
                return Ok(false);
            }
            store::tx_put(tree, &keys::asset(&remote.asset_id), &remote)?;
            tree.insert(
                keys::asset_owner(&remote.owner, &remote.asset_id),
                remote.asset_id.as_bytes(),
            )?;
            tree.insert(
                keys::asset_expiry(remote.expiry_time as u64, &remote.asset_id),
                remote.asset_id.as_bytes(),
            )?;
            if remote.asset_type == AssetType::Domain
                && tree.get(keys::domain(&remote.name))?.is_none()
            {
                tree.insert(keys::domain(&remote.name), remote.asset_id.as_bytes())?;
            }
            Ok(true)
        })?;
        if inserted {
            debug!("Synced asset {} ({})", remote.asset_id, remote.name);
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::{Wallet, WalletManager};
    use crate::ASSET_LIFETIME_SECS;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<Store>, AssetRegistry, String) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let wallets = WalletManager::new(Arc::clone(&store), 0.0);
        wallets.ensure_system_wallets().unwrap();
        store.seed_fee_if_absent("domain_reg", 1.0).unwrap();
        store.seed_fee_if_absent("storage_mb", 0.001).unwrap();
        let alice = wallets.register("alice", "pw").unwrap();
        store
            .put_wallet(&Wallet {
                wallet_id: alice.wallet_id.clone(),
                balance: 50.0,
                last_mined: 0.0,
            })
            .unwrap();
        let registry = AssetRegistry::new(Arc::clone(&store));
        (dir, store, registry, alice.wallet_id)
    }

    #[test]
    fn test_domain_registration_charges_fee() {
        let (_dir, store, registry, alice) = setup();
        let (asset, fee_tx) = registry
            .register_domain(&alice, "acme", "<h1>hi</h1>")
            .unwrap();

        assert_eq!(asset.name, "acme.ghost");
        assert_eq!(store.wallet(&alice).unwrap().unwrap().balance, 49.0);
        assert_eq!(store.wallet(TREASURY_WALLET).unwrap().unwrap().balance, 1.0);
        assert_eq!(fee_tx.sender, alice);
        assert_eq!(fee_tx.recipient, TREASURY_WALLET);
        assert_eq!(fee_tx.amount, 1.0);
        assert!(store.has_transaction(&fee_tx.tx_id).unwrap());
    }

    #[test]
    fn test_domain_uniqueness() {
        let (_dir, store, registry, alice) = setup();
        registry.register_domain(&alice, "acme", "<h1>hi</h1>").unwrap();

        let err = registry
            .register_domain(&alice, "acme.ghost", "<h1>again</h1>")
            .unwrap_err();
        assert_eq!(err, NodeError::DuplicateName("acme.ghost".to_string()));
        // Balances untouched by the rejected attempt
        assert_eq!(store.wallet(&alice).unwrap().unwrap().balance, 49.0);
        assert_eq!(store.wallet(TREASURY_WALLET).unwrap().unwrap().balance, 1.0);
    }

    #[test]
    fn test_expired_domain_name_is_reusable() {
        let (_dir, store, registry, alice) = setup();
        let (asset, _) = registry.register_domain(&alice, "acme", "x").unwrap();

        // Force the first registration past its expiry
        let mut expired = store.asset(&asset.asset_id).unwrap().unwrap();
        expired.expiry_time = utils::now_ts() - 1.0;
        store
            .transact(|tree| store::tx_put(tree, &keys::asset(&asset.asset_id), &expired))
            .unwrap();

        assert!(registry.register_domain(&alice, "acme", "y").is_ok());
    }

    #[test]
    fn test_empty_content_gets_placeholder() {
        let (_dir, _store, registry, alice) = setup();
        let (asset, _) = registry.register_domain(&alice, "park", "   ").unwrap();
        assert_eq!(asset.content, PLACEHOLDER_HTML.as_bytes());
    }

    #[test]
    fn test_insufficient_funds() {
        let (_dir, store, registry, alice) = setup();
        store
            .put_wallet(&Wallet {
                wallet_id: alice.clone(),
                balance: 0.5,
                last_mined: 0.0,
            })
            .unwrap();
        assert!(matches!(
            registry.register_domain(&alice, "acme", "x"),
            Err(NodeError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_media_fee_scales_with_size() {
        let (_dir, store, registry, alice) = setup();
        let content = vec![0u8; 1024 * 1024]; // exactly one megabyte
        let (asset, fee_tx) = registry
            .register_media(&alice, AssetType::Image, "pic.png", content)
            .unwrap();
        assert_eq!(asset.storage_size, 1024 * 1024);
        assert_eq!(fee_tx.amount, 0.001);
        assert_eq!(asset.mime_type(), "image/png");
        assert!(asset.keywords.is_empty());
        assert_eq!(
            store.wallet(TREASURY_WALLET).unwrap().unwrap().balance,
            0.001
        );
    }

    #[test]
    fn test_media_size_cap() {
        let (_dir, _store, registry, alice) = setup();
        let oversized = vec![0u8; MAX_MEDIA_BYTES + 1];
        assert!(matches!(
            registry.register_media(&alice, AssetType::File, "big.bin", oversized),
            Err(NodeError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_update_is_owner_only() {
        let (_dir, _store, registry, alice) = setup();
        let (asset, _) = registry.register_domain(&alice, "acme", "<p>old</p>").unwrap();

        let err = registry
            .update_content(&asset.asset_id, "GHSTmallory", b"<p>new</p>".to_vec())
            .unwrap_err();
        assert!(matches!(err, NodeError::Unauthorized(_)));

        let updated = registry
            .update_content(&asset.asset_id, &alice, b"<p>fresh words</p>".to_vec())
            .unwrap();
        assert_eq!(updated.asset_id, asset.asset_id);
        assert_eq!(updated.creation_time, asset.creation_time);
        assert_eq!(updated.expiry_time, asset.expiry_time);
        assert_eq!(updated.keywords, vec!["fresh".to_string(), "words".to_string()]);
    }

    #[test]
    fn test_delete_is_owner_only() {
        let (_dir, store, registry, alice) = setup();
        let (asset, _) = registry.register_domain(&alice, "acme", "x").unwrap();

        assert!(matches!(
            registry.delete(&asset.asset_id, "GHSTmallory"),
            Err(NodeError::Unauthorized(_))
        ));
        registry.delete(&asset.asset_id, &alice).unwrap();
        assert!(store.asset(&asset.asset_id).unwrap().is_none());
        // The name frees up immediately
        assert!(registry.register_domain(&alice, "acme", "y").is_ok());
    }

    #[test]
    fn test_expired_domain_private_to_owner() {
        let (_dir, store, registry, alice) = setup();
        let (asset, _) = registry.register_domain(&alice, "acme", "x").unwrap();

        let mut row = store.asset(&asset.asset_id).unwrap().unwrap();
        row.expiry_time = utils::now_ts() - 1.0;
        store
            .transact(|tree| store::tx_put(tree, &keys::asset(&asset.asset_id), &row))
            .unwrap();

        assert!(registry.view(&asset.asset_id, Some(&alice)).is_ok());
        assert!(matches!(
            registry.view(&asset.asset_id, Some("GHSTother")),
            Err(NodeError::Unauthorized(_))
        ));
        assert!(matches!(
            registry.view(&asset.asset_id, None),
            Err(NodeError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_expiry_boundary() {
        let now = 1_000_000.0;
        let asset = Asset {
            asset_id: "a".to_string(),
            owner: "GHSTa".to_string(),
            asset_type: AssetType::Domain,
            name: "a.ghost".to_string(),
            content: Vec::new(),
            storage_size: 0,
            creation_time: now,
            expiry_time: now + ASSET_LIFETIME_SECS,
            keywords: Vec::new(),
        };
        // Still active at exactly creation + six months
        assert!(!asset.is_expired(now + ASSET_LIFETIME_SECS));
        assert!(asset.is_expired(now + ASSET_LIFETIME_SECS + 1.0));
    }

    #[test]
    fn test_keyword_extraction() {
        let html = r#"
            <html><head>
            <script>var ignored = "scriptword";</script>
            <style>.ignored { color: red; }</style>
            </head>
            <body><h1>Ghost Network</h1>
            <p>The ghost network serves decentralized pages, pages2go!</p>
            </body></html>
        "#;
        let keywords = extract_keywords(html);
        assert!(keywords.contains(&"ghost".to_string()));
        assert!(keywords.contains(&"network".to_string()));
        assert!(keywords.contains(&"decentralized".to_string()));
        assert!(keywords.contains(&"pages".to_string()));
        // script/style bodies and tag names are stripped
        assert!(!keywords.iter().any(|k| k == "scriptword"));
        assert!(!keywords.iter().any(|k| k == "ignored"));
        assert!(!keywords.iter().any(|k| k == "color"));
        // words of length <= 2 are dropped, duplicates collapse
        assert!(!keywords.iter().any(|k| k == "go"));
        assert_eq!(keywords.iter().filter(|k| *k == "ghost").count(), 1);
    }

    #[test]
    fn test_keyword_cap() {
        let words: Vec<String> = ('a'..='z')
            .flat_map(|c1| ('a'..='z').map(move |c2| format!("kw{}{}", c1, c2)))
            .take(40)
            .collect();
        let keywords = extract_keywords(&words.join(" "));
        assert_eq!(keywords.len(), MAX_DOMAIN_KEYWORDS);
    }

    #[test]
    fn test_search_domains() {
        let (_dir, _store, registry, alice) = setup();
        registry
            .register_domain(&alice, "blog", "<p>travel notes</p>")
            .unwrap();
        registry
            .register_domain(&alice, "shop", "<p>hand made wares</p>")
            .unwrap();

        let by_name = registry.search_domains("blo").unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].name, "blog.ghost");

        let by_keyword = registry.search_domains("travel").unwrap();
        assert_eq!(by_keyword.len(), 1);

        // Empty query lists all active domains, newest first
        let all = registry.search_domains("").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "shop.ghost");
    }

    #[test]
    fn test_sync_receive_is_idempotent_and_free() {
        let (_dir, store, registry, _alice) = setup();
        let remote = Asset {
            asset_id: "remote-1".to_string(),
            owner: "GHSTremote".to_string(),
            asset_type: AssetType::Domain,
            name: "remote.ghost".to_string(),
            content: b"<p>hello</p>".to_vec(),
            storage_size: 12,
            creation_time: 1.0,
            expiry_time: utils::now_ts() + 1000.0,
            keywords: vec!["hello".to_string()],
        };

        assert!(registry.sync_receive(remote.clone()).unwrap());
        assert!(!registry.sync_receive(remote.clone()).unwrap());
        assert_eq!(store.assets().unwrap().len(), 1);
        // No fee moved: treasury untouched
        assert_eq!(store.wallet(TREASURY_WALLET).unwrap().unwrap().balance, 0.0);
        assert!(store.wallet("GHSTremote").unwrap().is_none());
    }
}
