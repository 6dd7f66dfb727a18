//! Node orchestration: open the data directory, bootstrap or resume the chain, serve
//! peers and drive the mining trigger.

use crate::blockchain::{is_initialized, ChainManager};
use crate::config::Config;
use crate::error::ChainError;
use crate::genesis::Genesis;
use crate::mempool::PendingPool;
use crate::network::{inbox, PeerSet, TcpTransport};
use crate::persistence::{open_data_dir, DataDirLock, Store};
use crate::sync::SyncContext;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info};

const MINING_TICK: Duration = Duration::from_secs(2);
const STATUS_EVERY_TICKS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Booting,
    Syncing,
    Ready,
    Degraded,
}

pub struct Node {
    pub config: Config,
    pub chain: Arc<ChainManager>,
    pub sync: Arc<SyncContext<TcpTransport>>,
    pub state: Arc<RwLock<NodeState>>,
    _lock: DataDirLock,
}

/// Opens the chain in `store`, initializing it from `genesis_path` on first use.
pub fn open_chain(store: Store, genesis_path: Option<&Path>) -> Result<ChainManager, ChainError> {
    if is_initialized(&store)? {
        return ChainManager::resume(store);
    }
    let path = genesis_path.ok_or_else(|| {
        ChainError::ConfigError("genesis.path is required to initialize a new data directory".to_string())
    })?;
    let genesis = Genesis::load(path)?;
    info!("Initializing chain {} from {}", genesis.chain_id, path.display());
    ChainManager::initialize(store, genesis)
}

impl Node {
    pub fn init(config: Config) -> Result<Self, ChainError> {
        info!("Starting NetherChain node on {}", config.network.listen_addr());

        fs::create_dir_all(&config.database.path)?;
        let (store, lock) = open_data_dir(&config.database.path)?;

        let chain = Arc::new(open_chain(store.clone(), config.genesis.path.as_deref())?);
        info!(
            "Chain {} at height {} (tip {})",
            chain.genesis().chain_id,
            chain.best_height(),
            hex::encode(chain.tip_hash())
        );

        let peers = Arc::new(PeerSet::with_store(store, config.network.max_peers)?);
        let pool = Arc::new(PendingPool::new(chain.clone()));
        let transport = Arc::new(TcpTransport::new(
            config.network.listen_addr(),
            config.network.io_timeout,
        ));
        let sync = Arc::new(SyncContext::new(
            chain.clone(),
            pool,
            peers,
            transport,
            config.sync_config()?,
        ));

        Ok(Self {
            config,
            chain,
            sync,
            state: Arc::new(RwLock::new(NodeState::Booting)),
            _lock: lock,
        })
    }

    /// Serves peers and runs the mining trigger until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<(), ChainError> {
        let listen_addr = self.config.network.listen_addr();
        let listener = TcpTransport::bind(&listen_addr).await?;
        let (sender, receiver) = inbox();
        let io_timeout = self.config.network.io_timeout;

        let state = self.state.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = TcpTransport::serve(listener, sender, io_timeout).await {
                error!("P2P server failed: {}", e);
                *state.write().await = NodeState::Degraded;
            }
        });
        tokio::spawn(self.sync.clone().run(receiver));
        info!("Listening for peers on {}", listen_addr);

        *self.state.write().await = NodeState::Syncing;
        self.sync.start(&self.config.network.bootstrap_peers).await?;
        *self.state.write().await = NodeState::Ready;

        let mut ticker = tokio::time::interval(MINING_TICK);
        let mut ticks = 0u64;
        while !server.is_finished() {
            ticker.tick().await;
            ticks += 1;
            if self.config.miner.enabled && !self.config.network.is_root {
                self.sync.maybe_mine();
            }
            if ticks % STATUS_EVERY_TICKS == 0 {
                let status = self.sync.status();
                info!(
                    "Node {:?}: height {}, {} pending, {} peers, {} downloading{}",
                    *self.state.read().await,
                    status.height,
                    status.pending,
                    status.peers,
                    status.downloading,
                    if status.mining { ", mining" } else { "" }
                );
            }
        }

        self.sync.shutdown();
        Err(ChainError::NetworkError("P2P listener stopped".to_string()))
    }
}
