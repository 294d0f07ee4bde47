use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use crate::store::Store;
use crate::{utils, Result, ACTIVE_PEER_WINDOW_SECS, KNOWN_PEER_WINDOW_SECS};

/// A node seen on the network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Peer {
    /// Address string, either a bare IP or a full `http://host:port` base
    pub ip: String,
    /// Seconds since the Unix epoch of the last contact
    pub last_seen: f64,
}

/// UDP presence packet, UTF-8 JSON on the discovery port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresencePacket {
    #[serde(rename = "type")]
    pub kind: String,
    pub ip: String,
}

impl PresencePacket {
    pub fn new(ip: &str) -> Self {
        PresencePacket {
            kind: "presence".to_string(),
            ip: ip.to_string(),
        }
    }
}

/// Known-peer table with presence-based liveness windows
#[derive(Debug, Clone)]
pub struct PeerSet {
    store: Arc<Store>,
    bootstrap: Vec<String>,
}

impl PeerSet {
    pub fn new(store: Arc<Store>, bootstrap: Vec<String>) -> Self {
        PeerSet { store, bootstrap }
    }

    /// Refresh a peer's last-seen stamp
    pub fn touch(&self, ip: &str) -> Result<()> {
        self.store.upsert_peer(ip, utils::now_ts())
    }

    /// Peers seen within the last five minutes
    pub fn active(&self) -> Result<Vec<Peer>> {
        let cutoff = utils::now_ts() - ACTIVE_PEER_WINDOW_SECS;
        Ok(self
            .store
            .peers()?
            .into_iter()
            .filter(|p| p.last_seen >= cutoff)
            .collect())
    }

    /// Count of active peers, which drives mining difficulty
    pub fn active_count(&self) -> Result<u64> {
        Ok(self.active()?.len() as u64)
    }

    /// Peers seen within the last hour, unioned with the bootstrap list
    pub fn known(&self) -> Result<Vec<String>> {
        let cutoff = utils::now_ts() - KNOWN_PEER_WINDOW_SECS;
        let mut known: Vec<String> = self
            .store
            .peers()?
            .into_iter()
            .filter(|p| p.last_seen >= cutoff)
            .map(|p| p.ip)
            .collect();
        for peer in &self.bootstrap {
            if !known.contains(peer) {
                known.push(peer.clone());
            }
        }
        Ok(known)
    }

    /// Every recorded peer, regardless of age
    pub fn all(&self) -> Result<Vec<Peer>> {
        self.store.peers()
    }
}

/// Build the HTTP base URL for a peer address
pub fn peer_url(address: &str, http_port: u16) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.trim_end_matches('/').to_string()
    } else {
        format!("http://{}:{}", address, http_port)
    }
}

/// Best-effort detection of the LAN-facing local address
///
/// Opens a connected UDP socket (no packets are sent) and reads the chosen
/// source address back.
pub fn local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

/// Broadcast a presence beacon on the discovery port at a fixed interval
pub async fn run_presence_emitter(udp_port: u16, interval_secs: u64, local_ip: String) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Presence emitter disabled, cannot bind UDP socket: {}", e);
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!("Presence emitter disabled, cannot enable broadcast: {}", e);
        return;
    }

    let payload = match serde_json::to_vec(&PresencePacket::new(&local_ip)) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Presence emitter disabled, cannot encode packet: {}", e);
            return;
        }
    };

    info!("Presence emitter started on UDP {} as {}", udp_port, local_ip);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        ticker.tick().await;
        if let Err(e) = socket
            .send_to(&payload, ("255.255.255.255", udp_port))
            .await
        {
            debug!("Presence broadcast failed: {}", e);
        }
    }
}

/// Listen for presence beacons and upsert their senders
pub async fn run_presence_listener(peers: PeerSet, udp_port: u16) {
    let socket = match UdpSocket::bind(("0.0.0.0", udp_port)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Presence listener disabled, cannot bind UDP {}: {}", udp_port, e);
            return;
        }
    };
    info!("Presence listener started on UDP {}", udp_port);

    let mut buf = [0u8; 1024];
    loop {
        let (len, source) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!("Presence receive failed: {}", e);
                continue;
            }
        };
        if is_loopback(&source.ip()) {
            continue;
        }
        let packet: PresencePacket = match serde_json::from_slice(&buf[..len]) {
            Ok(packet) => packet,
            Err(_) => continue,
        };
        if packet.kind != "presence" {
            continue;
        }
        let ip = if packet.ip.is_empty() {
            source.ip().to_string()
        } else {
            packet.ip
        };
        debug!("Presence beacon from {}", ip);
        if let Err(e) = peers.touch(&ip) {
            warn!("Failed to record peer {}: {}", ip, e);
        }
    }
}

fn is_loopback(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<Store>, PeerSet) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let peers = PeerSet::new(
            Arc::clone(&store),
            vec!["http://backbone.example:5000".to_string()],
        );
        (dir, store, peers)
    }

    #[test]
    fn test_liveness_windows() {
        let (_dir, store, peers) = setup();
        let now = utils::now_ts();
        store.upsert_peer("10.0.0.1", now - 10.0).unwrap();
        store.upsert_peer("10.0.0.2", now - 600.0).unwrap();
        store.upsert_peer("10.0.0.3", now - 7200.0).unwrap();

        let active: Vec<String> = peers.active().unwrap().into_iter().map(|p| p.ip).collect();
        assert_eq!(active, vec!["10.0.0.1".to_string()]);

        let known = peers.known().unwrap();
        assert!(known.contains(&"10.0.0.1".to_string()));
        assert!(known.contains(&"10.0.0.2".to_string()));
        // Stale peers drop out of the known set, bootstrap entries never do
        assert!(!known.contains(&"10.0.0.3".to_string()));
        assert!(known.contains(&"http://backbone.example:5000".to_string()));
    }

    #[test]
    fn test_touch_marks_active() {
        let (_dir, _store, peers) = setup();
        assert_eq!(peers.active_count().unwrap(), 0);
        peers.touch("10.0.0.9").unwrap();
        assert_eq!(peers.active_count().unwrap(), 1);
    }

    #[test]
    fn test_peer_url() {
        assert_eq!(peer_url("10.0.0.1", 5000), "http://10.0.0.1:5000");
        assert_eq!(
            peer_url("http://backbone.example:5000/", 5000),
            "http://backbone.example:5000"
        );
    }

    #[test]
    fn test_presence_packet_shape() {
        let packet = PresencePacket::new("192.168.1.7");
        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "presence", "ip": "192.168.1.7"})
        );
    }
}
