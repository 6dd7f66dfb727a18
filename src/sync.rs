//! Peer synchronization for NetherChain
//!
//! A [`SyncContext`] owns everything one node needs to take part in gossip: the chain,
//! its pending pool, the known-peer set and an outbound transport. Inbound messages are
//! handled one at a time by [`SyncContext::run`], so block downloads and appends are
//! naturally ordered. Mining is the only work pushed off the message loop.

use crate::blockchain::{transfer, AppendOutcome, Block, ChainManager, Receipt};
use crate::crypto::{Address, Sha256Hash};
use crate::error::ChainError;
use crate::mempool::PendingPool;
use crate::miner::CancelToken;
use crate::network::{InvKind, Message, Payload, PeerSet, SyncMode, Transport};
use crate::persistence::keys;
use crate::transaction::SignedTx;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Receiver;
use tracing::{debug, error, info, warn};

/// Knobs for one node's participation in the network.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root nodes relay transactions and blocks instead of mining on gossip.
    pub is_root: bool,
    pub sync_mode: SyncMode,
    pub mining_enabled: bool,
    pub miner_address: Option<Address>,
    /// Pending transactions needed before gossip triggers mining.
    pub min_pending: usize,
    pub max_block_transactions: usize,
    pub mining_threads: usize,
    pub mining_timeout: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            is_root: false,
            sync_mode: SyncMode::Default,
            mining_enabled: false,
            miner_address: None,
            min_pending: 2,
            max_block_transactions: 1_000,
            mining_threads: 1,
            mining_timeout: None,
        }
    }
}

/// Snapshot for status logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub height: u64,
    pub pending: usize,
    pub peers: usize,
    /// Announced blocks still waiting to be fetched.
    pub downloading: usize,
    pub mining: bool,
    pub blocks_received: u64,
}

/// Blocks announced by one peer that we have asked for, oldest first.
#[derive(Debug, Default)]
struct InTransit {
    source: Option<String>,
    queue: VecDeque<Sha256Hash>,
}

pub struct SyncContext<T: Transport> {
    chain: Arc<ChainManager>,
    pool: Arc<PendingPool>,
    peers: Arc<PeerSet>,
    transport: Arc<T>,
    config: SyncConfig,
    in_transit: Mutex<InTransit>,
    mining: AtomicBool,
    cancel: CancelToken,
    blocks_received: AtomicU64,
}

impl<T: Transport> SyncContext<T> {
    pub fn new(
        chain: Arc<ChainManager>,
        pool: Arc<PendingPool>,
        peers: Arc<PeerSet>,
        transport: Arc<T>,
        config: SyncConfig,
    ) -> Self {
        SyncContext {
            chain,
            pool,
            peers,
            transport,
            config,
            in_transit: Mutex::new(InTransit::default()),
            mining: AtomicBool::new(false),
            cancel: CancelToken::new(),
            blocks_received: AtomicU64::new(0),
        }
    }

    pub fn chain(&self) -> &Arc<ChainManager> {
        &self.chain
    }

    pub fn pool(&self) -> &Arc<PendingPool> {
        &self.pool
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn local_addr(&self) -> String {
        self.transport.local_addr()
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            height: self.chain.best_height(),
            pending: self.pool.len(),
            peers: self.peers.len(),
            downloading: self.in_transit.lock().queue.len(),
            mining: self.mining.load(Ordering::SeqCst),
            blocks_received: self.blocks_received.load(Ordering::Relaxed),
        }
    }

    /// Stops any running search and keeps new ones from starting.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Adds `bootstrap` peers and greets every known peer with our height.
    pub async fn start(&self, bootstrap: &[String]) -> Result<(), ChainError> {
        let local = self.local_addr();
        for addr in bootstrap.iter().filter(|a| **a != local) {
            self.peers.add_peer(addr)?;
        }
        let version = Message::version(local, self.chain.best_height());
        self.broadcast(&version, None).await;
        Ok(())
    }

    /// Handles inbound messages until the inbox closes. Failures are logged per message.
    pub async fn run(self: Arc<Self>, mut inbox: Receiver<Message>) {
        while let Some(message) = inbox.recv().await {
            let command = message.command();
            let from = message.addr_from.clone();
            if let Err(e) = self.handle(message).await {
                warn!("Failed to handle {} from {}: {}", command, from, e);
            }
        }
        info!("Inbox closed; sync loop stopped");
    }

    pub async fn handle(self: &Arc<Self>, message: Message) -> Result<(), ChainError> {
        let from = message.addr_from;
        debug!("Handling {} from {}", message.payload.command(), from);
        match message.payload {
            Payload::Version(v) => self.handle_version(&from, v.best_height).await,
            Payload::Addr(a) => self.handle_addr(&from, a.peers).await,
            Payload::GetBlocks => self.handle_get_blocks(&from).await,
            Payload::Inv(inv) => match inv.kind {
                InvKind::Block => self.handle_block_inv(&from, inv.items).await,
                InvKind::Tx => self.handle_tx_inv(&from, inv.items).await,
            },
            Payload::GetData(req) => self.handle_get_data(&from, req.kind, req.id).await,
            Payload::Block(payload) => self.handle_block(&from, payload.decode()?).await,
            Payload::Tx(payload) => self.handle_tx(&from, payload.decode()?).await,
        }
    }

    async fn handle_version(&self, from: &str, remote_height: u64) -> Result<(), ChainError> {
        self.remember_peer(from)?;
        let local_height = self.chain.best_height();
        if local_height < remote_height {
            if self.config.sync_mode.downloads_blocks() {
                info!("Peer {} is at height {}, we are at {}; requesting blocks", from, remote_height, local_height);
                self.send_to(from, &Message::get_blocks(self.local_addr())).await;
            }
        } else if local_height > remote_height {
            self.send_to(from, &Message::version(self.local_addr(), local_height)).await;
        }
        Ok(())
    }

    async fn handle_addr(&self, from: &str, announced: Vec<String>) -> Result<(), ChainError> {
        self.remember_peer(from)?;
        let local = self.local_addr();
        let height = self.chain.best_height();
        for addr in announced.iter().filter(|a| **a != local) {
            if self.peers.add_peer(addr)? {
                self.send_to(addr, &Message::version(local.clone(), height)).await;
            }
        }
        Ok(())
    }

    async fn handle_get_blocks(&self, from: &str) -> Result<(), ChainError> {
        let hashes = self.chain.block_hashes()?;
        self.send_to(from, &Message::inv(self.local_addr(), InvKind::Block, hashes)).await;
        Ok(())
    }

    async fn handle_block_inv(&self, from: &str, items: Vec<Sha256Hash>) -> Result<(), ChainError> {
        if !self.config.sync_mode.downloads_blocks() {
            debug!("Ignoring block inventory from {} in {} mode", from, self.config.sync_mode);
            return Ok(());
        }
        let mut unknown = VecDeque::with_capacity(items.len());
        for hash in items {
            if !self.chain.contains_block(&hash)? {
                unknown.push_back(hash);
            }
        }
        let first = {
            let mut in_transit = self.in_transit.lock();
            let first = unknown.pop_front();
            in_transit.source = Some(from.to_string());
            in_transit.queue = unknown;
            first
        };
        if let Some(hash) = first {
            debug!("Requesting block {} from {}", hex::encode(hash), from);
            self.send_to(from, &Message::get_data(self.local_addr(), InvKind::Block, hash)).await;
        }
        Ok(())
    }

    async fn handle_tx_inv(&self, from: &str, items: Vec<Sha256Hash>) -> Result<(), ChainError> {
        for hash in items {
            if self.knows_transaction(&hash)? {
                continue;
            }
            self.send_to(from, &Message::get_data(self.local_addr(), InvKind::Tx, hash)).await;
        }
        Ok(())
    }

    async fn handle_get_data(&self, from: &str, kind: InvKind, id: Sha256Hash) -> Result<(), ChainError> {
        let reply = match kind {
            InvKind::Block => Message::block(self.local_addr(), &self.chain.get_block(&id)?)?,
            InvKind::Tx => {
                let tx = match self.pool.get(&id) {
                    Some(tx) => tx,
                    None => self.chain.transaction(&id)?,
                };
                Message::tx(self.local_addr(), &tx)?
            }
        };
        self.send_to(from, &reply).await;
        Ok(())
    }

    async fn handle_block(&self, from: &str, block: Block) -> Result<(), ChainError> {
        self.blocks_received.fetch_add(1, Ordering::Relaxed);
        match self.chain.append(&block) {
            Ok(AppendOutcome::Extended { length, .. }) => {
                self.pool.reconcile(&block);
                info!("Synced block #{} from {} (length {})", block.header.number, from, length);
                if self.config.is_root {
                    let inv = Message::inv(self.local_addr(), InvKind::Block, vec![block.header.hash]);
                    self.broadcast(&inv, Some(from)).await;
                }
            }
            Ok(AppendOutcome::AlreadyKnown) => {}
            Err(e @ (ChainError::InvalidParent | ChainError::InvalidNumber { .. }))
                if block.header.number >= self.chain.tip().next_number() =>
            {
                // We are missing ancestors; ask for the full inventory and queue what's new.
                info!("Block #{} from {} does not extend our tip ({}); resyncing", block.header.number, from, e);
                self.send_to(from, &Message::get_blocks(self.local_addr())).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.request_next_block().await
    }

    /// Asks for the next queued block, or finishes the download when the queue is empty.
    async fn request_next_block(&self) -> Result<(), ChainError> {
        let next = {
            let mut in_transit = self.in_transit.lock();
            let hash = in_transit.queue.pop_front();
            hash.zip(in_transit.source.clone())
        };
        match next {
            Some((hash, source)) => {
                self.send_to(&source, &Message::get_data(self.local_addr(), InvKind::Block, hash)).await;
            }
            None => {
                self.in_transit.lock().source = None;
                if self.config.sync_mode == SyncMode::Full {
                    let verified = self.chain.verify_chain()?;
                    info!("Verified {} blocks after download", verified);
                }
            }
        }
        Ok(())
    }

    async fn handle_tx(self: &Arc<Self>, from: &str, tx: SignedTx) -> Result<(), ChainError> {
        let hash = tx.hash();
        if self.pool.contains(&hash) {
            return Ok(());
        }
        self.pool.admit(tx.clone())?;
        debug!("Admitted transaction {} from {}", hex::encode(hash), from);
        if self.config.is_root {
            self.broadcast(&Message::tx(self.local_addr(), &tx)?, Some(from)).await;
        } else {
            self.maybe_mine();
        }
        Ok(())
    }

    /// Admits a locally created transaction, gossips it and possibly starts mining.
    pub async fn submit_transaction(self: &Arc<Self>, tx: SignedTx) -> Result<Receipt, ChainError> {
        let receipt = self.pool.admit(tx.clone())?;
        self.broadcast(&Message::tx(self.local_addr(), &tx)?, None).await;
        if !self.config.is_root {
            self.maybe_mine();
        }
        Ok(receipt)
    }

    /// Spawns a mining run if mining is enabled, enough transactions are pending and no
    /// run is already in flight. Returns whether a run was started.
    pub fn maybe_mine(self: &Arc<Self>) -> bool {
        if !self.config.mining_enabled
            || self.cancel.is_cancelled()
            || self.pool.len() < self.config.min_pending.max(1)
        {
            return false;
        }
        if self.mining.swap(true, Ordering::SeqCst) {
            return false;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.mine().await {
                Ok(block) => debug!("Mining run produced block #{}", block.header.number),
                Err(e) if e.is_mining_interrupted() => info!("Mining stopped: {}", e),
                Err(ChainError::EmptyBlock) => debug!("Nothing minable in the pending pool"),
                Err(e) => error!("Mining failed: {}", e),
            }
            this.mining.store(false, Ordering::SeqCst);
        });
        true
    }

    /// Mines one block from the pending pool, appends it and announces it.
    ///
    /// Transactions that no longer apply in order are skipped, not fatal. Fails with
    /// `EmptyBlock` when nothing minable is pending.
    pub async fn mine(&self) -> Result<Block, ChainError> {
        let coinbase = self
            .config
            .miner_address
            .ok_or_else(|| ChainError::ConfigError("No miner address configured".to_string()))?;

        let candidates = self.pool.drain_for_block(self.config.max_block_transactions);
        let selected = self.chain.store().dry_run(|txn| {
            let mut selected = Vec::with_capacity(candidates.len());
            for tx in candidates {
                match tx.validate().and_then(|_| transfer(txn, &tx.tx)) {
                    Ok(_) => selected.push(tx),
                    Err(e) => warn!("Skipping transaction {}: {}", tx.hash_str(), e),
                }
            }
            Ok(selected)
        })?;
        if selected.is_empty() {
            return Err(ChainError::EmptyBlock);
        }

        info!("Mining block #{} with {} transactions", self.chain.tip().next_number(), selected.len());
        let chain = Arc::clone(&self.chain);
        let cancel = self.cancel.clone();
        let threads = self.config.mining_threads;
        let deadline = self.config.mining_timeout.map(|t| Instant::now() + t);
        let block = tokio::task::spawn_blocking(move || {
            chain.mine_block(selected, coinbase, threads, &cancel, deadline)
        })
        .await
        .map_err(|e| ChainError::IoError(format!("Mining task failed: {}", e)))??;

        self.chain.append(&block)?;
        self.pool.reconcile(&block);
        info!("Mined block #{} {}", block.header.number, block.header.hash_str());
        self.announce_block(&block).await;
        Ok(block)
    }

    /// Announces `block` to every known peer.
    pub async fn announce_block(&self, block: &Block) {
        let inv = Message::inv(self.local_addr(), InvKind::Block, vec![block.header.hash]);
        self.broadcast(&inv, None).await;
    }

    /// Sends our known-peer list to `to`.
    pub async fn share_peers(&self, to: &str) {
        let mut known = self.peers.addrs();
        known.push(self.local_addr());
        self.send_to(to, &Message::addr(self.local_addr(), known)).await;
    }

    /// Sends `message` to every known peer except `except`.
    pub async fn broadcast(&self, message: &Message, except: Option<&str>) {
        for addr in self.peers.addrs() {
            if Some(addr.as_str()) == except {
                continue;
            }
            self.send_to(&addr, message).await;
        }
    }

    /// Sends `message` to `to`, pruning the peer if it cannot be reached.
    pub async fn send_to(&self, to: &str, message: &Message) -> bool {
        match self.transport.send(to, message).await {
            Ok(()) => {
                self.peers.mark_connected(to, true);
                true
            }
            Err(e) => {
                warn!("Failed to send {} to {}: {}", message.command(), to, e);
                if let Err(e) = self.peers.remove_peer(to) {
                    error!("Failed to forget peer {}: {}", to, e);
                }
                false
            }
        }
    }

    fn remember_peer(&self, addr: &str) -> Result<(), ChainError> {
        if addr != self.local_addr() {
            self.peers.add_peer(addr)?;
        }
        Ok(())
    }

    fn knows_transaction(&self, hash: &Sha256Hash) -> Result<bool, ChainError> {
        if self.pool.contains(hash) {
            return Ok(true);
        }
        self.chain.store().contains(&keys::transaction(hash))
    }
}
