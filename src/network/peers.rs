//! Known-peer membership.
//!
//! Best-effort: a peer is added when it talks to us or is announced, and pruned the
//! first time a send to it fails. With a store attached, membership survives restarts
//! under the `peers/` prefix.

use crate::crypto::Address;
use crate::error::ChainError;
use crate::persistence::{keys, Store};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// How much history a node pulls from its peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Download missing blocks as they are announced.
    #[default]
    Default,
    /// Never download blocks; relay transactions only.
    Account,
    /// Like `Default`, and re-verify the whole chain after each download.
    Full,
}

impl SyncMode {
    pub fn downloads_blocks(&self) -> bool {
        !matches!(self, SyncMode::Account)
    }
}

impl FromStr for SyncMode {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(SyncMode::Default),
            "account" => Ok(SyncMode::Account),
            "full" => Ok(SyncMode::Full),
            other => Err(ChainError::ConfigError(format!("unknown sync mode '{}'", other))),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncMode::Default => "default",
            SyncMode::Account => "account",
            SyncMode::Full => "full",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNode {
    /// Address peers use to reach this node, usually `host:port`.
    pub addr: String,
    pub is_root: bool,
    pub sync_mode: SyncMode,
    pub account: Option<Address>,
    pub connected: bool,
}

impl PeerNode {
    pub fn new(addr: impl Into<String>) -> Self {
        PeerNode {
            addr: addr.into(),
            is_root: false,
            sync_mode: SyncMode::Default,
            account: None,
            connected: false,
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ChainError> {
        self.addr
            .parse()
            .map_err(|e| ChainError::NetworkError(format!("bad peer address {}: {}", self.addr, e)))
    }
}

pub struct PeerSet {
    peers: RwLock<BTreeMap<String, PeerNode>>,
    max_peers: usize,
    store: Option<Store>,
}

impl PeerSet {
    pub const DEFAULT_MAX_PEERS: usize = 64;

    pub fn new(max_peers: usize) -> Self {
        PeerSet {
            peers: RwLock::new(BTreeMap::new()),
            max_peers,
            store: None,
        }
    }

    /// Loads peers persisted in `store` and keeps writing membership changes back.
    pub fn with_store(store: Store, max_peers: usize) -> Result<Self, ChainError> {
        let mut peers = BTreeMap::new();
        for (key, value) in store.iterate(keys::PEERS_PREFIX)? {
            match bincode::deserialize::<PeerNode>(&value) {
                Ok(mut peer) => {
                    peer.connected = false;
                    peers.insert(peer.addr.clone(), peer);
                }
                Err(e) => warn!(
                    "Skipping unreadable peer record {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        if !peers.is_empty() {
            info!("Loaded {} known peers", peers.len());
        }
        Ok(PeerSet {
            peers: RwLock::new(peers),
            max_peers,
            store: Some(store),
        })
    }

    /// Adds `addr` if it is new and there is room. Returns whether it was added.
    pub fn add_peer(&self, addr: &str) -> Result<bool, ChainError> {
        self.insert(PeerNode::new(addr))
    }

    pub fn insert(&self, peer: PeerNode) -> Result<bool, ChainError> {
        let mut peers = self.peers.write();
        if peers.contains_key(&peer.addr) {
            return Ok(false);
        }
        if peers.len() >= self.max_peers {
            debug!("Peer limit {} reached; ignoring {}", self.max_peers, peer.addr);
            return Ok(false);
        }
        if let Some(store) = &self.store {
            store.update(|txn| txn.put_encoded(keys::peer(&peer.addr), &peer))?;
        }
        info!("Added peer {}", peer.addr);
        peers.insert(peer.addr.clone(), peer);
        Ok(true)
    }

    /// Drops `addr`. Returns whether it was known.
    pub fn remove_peer(&self, addr: &str) -> Result<bool, ChainError> {
        let mut peers = self.peers.write();
        if peers.remove(addr).is_none() {
            return Ok(false);
        }
        if let Some(store) = &self.store {
            store.update(|txn| {
                txn.delete(keys::peer(addr));
                Ok(())
            })?;
        }
        info!("Removed peer {}", addr);
        Ok(true)
    }

    pub fn mark_connected(&self, addr: &str, connected: bool) {
        if let Some(peer) = self.peers.write().get_mut(addr) {
            peer.connected = connected;
        }
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.peers.read().contains_key(addr)
    }

    pub fn get(&self, addr: &str) -> Option<PeerNode> {
        self.peers.read().get(addr).cloned()
    }

    /// Peer addresses in sorted order.
    pub fn addrs(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_PEERS)
    }
}
