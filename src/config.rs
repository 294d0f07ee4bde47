use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{utils, DEFAULT_HTTP_PORT, DISCOVERY_PORT};

/// Default fee schedule seeded into the store on first boot
///
/// Every entry may later be overwritten by a fee-schedule sync from a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeDefaults {
    /// Flat fee for registering a `.ghost` domain
    pub domain_reg: f64,
    /// Fee per megabyte of uploaded media
    pub storage_mb: f64,
    /// Flat fee for sending a message
    pub msg_fee: f64,
    /// Flat fee for sending a friend invite
    pub invite_fee: f64,
    /// Flat fee for deploying a contract
    pub contract_deploy: f64,
    /// Flat fee for calling a contract method
    pub contract_call: f64,
}

impl Default for FeeDefaults {
    fn default() -> Self {
        FeeDefaults {
            domain_reg: 1.0,
            storage_mb: 0.001,
            msg_fee: 0.01,
            invite_fee: 0.1,
            contract_deploy: 1.0,
            contract_call: 0.05,
        }
    }
}

impl FeeDefaults {
    /// Iterate (fee kind, default amount) pairs for store seeding
    pub fn entries(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("domain_reg", self.domain_reg),
            ("storage_mb", self.storage_mb),
            ("msg_fee", self.msg_fee),
            ("invite_fee", self.invite_fee),
            ("contract_deploy", self.contract_deploy),
            ("contract_call", self.contract_call),
        ]
    }
}

/// Static configuration for a node instance
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Port for the peer and operator HTTP APIs
    pub http_port: u16,
    /// UDP port for presence beacons
    pub udp_port: u16,
    /// Directory holding the node's store
    pub data_dir: PathBuf,
    /// Statically configured backbone peers, e.g. `http://10.0.0.5:5000`
    pub bootstrap_peers: Vec<String>,
    /// Balance granted to newly registered users (0 in production, 50 as a dev seed)
    pub initial_balance: f64,
    /// Whether a failed contract call still pays the execution fee
    pub charge_call_fee_on_failure: bool,
    /// Default fee schedule
    pub fees: FeeDefaults,
    /// Seconds between sync passes
    pub sync_interval_secs: u64,
    /// Seconds before the first sync pass
    pub sync_initial_delay_secs: u64,
    /// Seconds between presence beacons
    pub beacon_interval_secs: u64,
    /// Timeout for a single outbound peer call
    pub peer_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            http_port: DEFAULT_HTTP_PORT,
            udp_port: DISCOVERY_PORT,
            data_dir: PathBuf::from("ghostmesh_data"),
            bootstrap_peers: Vec::new(),
            initial_balance: 0.0,
            charge_call_fee_on_failure: true,
            fees: FeeDefaults::default(),
            sync_interval_secs: 60,
            sync_initial_delay_secs: 10,
            beacon_interval_secs: 30,
            peer_timeout_secs: 3,
        }
    }
}

impl NodeConfig {
    /// Per-node store directory derived from the HTTP bind address, so two
    /// nodes started from the same working directory never share a store
    pub fn default_data_dir(bind_addr: &str) -> PathBuf {
        let node_id = &utils::calculate_hash(bind_addr)[..8];
        PathBuf::from(format!("ghostmesh_{}", node_id))
    }

    /// Address other nodes can reach this node on
    pub fn self_address(&self, local_ip: &str) -> String {
        format!("http://{}:{}", local_ip, self.http_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_fees_cover_every_kind() {
        let fees = FeeDefaults::default();
        let kinds: Vec<&str> = fees.entries().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec!["domain_reg", "storage_mb", "msg_fee", "invite_fee", "contract_deploy", "contract_call"]
        );
        assert_eq!(fees.domain_reg, 1.0);
        assert_eq!(fees.storage_mb, 0.001);
    }

    #[test]
    fn test_data_dir_is_per_node() {
        let a = NodeConfig::default_data_dir("0.0.0.0:5000");
        let b = NodeConfig::default_data_dir("0.0.0.0:5002");
        assert_ne!(a, b);
        assert!(a.to_string_lossy().starts_with("ghostmesh_"));
    }
}
