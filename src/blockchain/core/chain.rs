use crate::cache::BlockCache;
use crate::crypto::{Address, ZERO_HASH};
use crate::encoding::{merkle_root, CanonicalEncode, Encoder};
use crate::error::ChainError;
use crate::genesis::Genesis;
use crate::miner::{self, CancelToken};
use crate::persistence::{keys, Store};
use crate::transaction::{SignedTx, BLOCK_REWARD};
use parking_lot::{Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, info};

use super::state::{Account, AccountState, Receipt, StateEngine};
use super::validation::{validate_body, validate_next};

pub use crate::crypto::Sha256Hash;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockHeader {
    pub parent_hash: Sha256Hash,
    /// Digest of every other header field; see [`BlockHeader::compute_hash`].
    pub hash: Sha256Hash,
    pub number: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub state_root: Sha256Hash,
    pub tx_root: Sha256Hash,
    pub receipt_root: Sha256Hash,
    pub nether_used: u64,
    pub coinbase: Address,
    pub nonce: u64,
}

impl BlockHeader {
    /// Every field except `hash` and `nonce`. Miners hash this once and append nonces.
    fn encode_unsealed(&self, enc: &mut Encoder) {
        enc.put_bytes(b"header")
            .put_fixed(&self.parent_hash)
            .put_u64(self.number)
            .put_i64(self.timestamp)
            .put_fixed(&self.state_root)
            .put_fixed(&self.tx_root)
            .put_fixed(&self.receipt_root)
            .put_u64(self.nether_used)
            .put_fixed(self.coinbase.pubkey_hash());
    }

    pub fn seal_prefix(&self) -> Encoder {
        let mut enc = Encoder::new();
        self.encode_unsealed(&mut enc);
        enc
    }

    pub fn compute_hash(&self) -> Sha256Hash {
        self.canonical_hash()
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.hash)
    }
}

impl CanonicalEncode for BlockHeader {
    // The nonce goes last so `seal_prefix` is a true prefix of the preimage.
    fn encode_canonical(&self, enc: &mut Encoder) {
        self.encode_unsealed(enc);
        enc.put_u64(self.nonce);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<SignedTx>,
}

impl Block {
    pub fn hash(&self) -> Sha256Hash {
        self.header.hash
    }

    pub fn is_genesis(&self) -> bool {
        self.header.number == 0
    }

    pub fn calculate_tx_root(transactions: &[SignedTx]) -> Sha256Hash {
        let hashes: Vec<Sha256Hash> = transactions.iter().map(SignedTx::hash).collect();
        merkle_root(&hashes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ChainError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Hash and length of the canonical chain. Length counts genesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: Sha256Hash,
    pub length: u64,
}

impl ChainTip {
    /// Number the next block must carry.
    pub fn next_number(&self) -> u64 {
        self.length
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    /// Only the genesis block exists.
    Bootstrapped,
    /// At least one block follows genesis.
    Extended { length: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Extended {
        hash: Sha256Hash,
        length: u64,
        receipts: Vec<Receipt>,
    },
    /// The block was already stored; nothing changed.
    AlreadyKnown,
}

/// Owns the canonical chain in a [`Store`].
///
/// A manager only exists for an initialized store: [`ChainManager::initialize`] writes
/// genesis, [`ChainManager::resume`] reopens an existing chain. Appends are serialized
/// by an internal lock and the cached tip is only replaced after the store commit.
pub struct ChainManager {
    store: Store,
    state: StateEngine,
    genesis: Genesis,
    tip: RwLock<ChainTip>,
    append_lock: Mutex<()>,
    cache: BlockCache,
}

impl std::fmt::Debug for ChainManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainManager")
            .field("genesis", &self.genesis)
            .field("tip", &*self.tip.read())
            .finish_non_exhaustive()
    }
}

pub fn is_initialized(store: &Store) -> Result<bool, ChainError> {
    store.contains(keys::TIP)
}

impl ChainManager {
    /// Bootstraps a new chain from `genesis`. Fails with `AlreadyInitialized` if the
    /// store already holds a tip.
    pub fn initialize(store: Store, genesis: Genesis) -> Result<Self, ChainError> {
        if is_initialized(&store)? {
            return Err(ChainError::AlreadyInitialized);
        }

        let block = genesis.to_block()?;
        let accounts = genesis.accounts()?;
        let genesis_json = genesis.to_json()?;
        store.update(|txn| {
            for (address, account) in &accounts {
                txn.store_account(address, *account)?;
            }
            txn.put_encoded(keys::block(&block.header.hash), &block)?;
            txn.set(keys::GENESIS.to_vec(), genesis_json.into_bytes());
            txn.set(keys::TIP.to_vec(), block.header.hash.to_vec());
            txn.put_encoded(keys::CHAIN_LENGTH.to_vec(), &1u64)?;
            Ok(())
        })?;

        info!(
            "Initialized chain {} with genesis {} ({} funded accounts)",
            genesis.chain_id,
            block.header.hash_str(),
            accounts.len()
        );
        Ok(Self::from_parts(
            store,
            genesis,
            ChainTip {
                hash: block.header.hash,
                length: 1,
            },
        ))
    }

    /// Reopens a chain previously bootstrapped in `store`.
    pub fn resume(store: Store) -> Result<Self, ChainError> {
        let tip_bytes = store.get(keys::TIP)?.ok_or(ChainError::NotInitialized)?;
        let hash: Sha256Hash = tip_bytes
            .try_into()
            .map_err(|_| ChainError::DatabaseError("Stored tip is not 32 bytes".to_string()))?;
        let length: u64 = store
            .get_decoded(keys::CHAIN_LENGTH)?
            .ok_or_else(|| ChainError::DatabaseError("Chain length missing".to_string()))?;
        let genesis_bytes = store.get(keys::GENESIS)?.ok_or(ChainError::GenesisNotFound)?;
        let genesis: Genesis = serde_json::from_slice(&genesis_bytes)?;

        info!("Resumed chain {} at length {} (tip {})", genesis.chain_id, length, hex::encode(hash));
        Ok(Self::from_parts(store, genesis, ChainTip { hash, length }))
    }

    /// Resumes if the store is initialized, otherwise bootstraps from `genesis`.
    pub fn open(store: Store, genesis: Genesis) -> Result<Self, ChainError> {
        if is_initialized(&store)? {
            Self::resume(store)
        } else {
            Self::initialize(store, genesis)
        }
    }

    fn from_parts(store: Store, genesis: Genesis, tip: ChainTip) -> Self {
        ChainManager {
            state: StateEngine::new(store.clone()),
            store,
            genesis,
            tip: RwLock::new(tip),
            append_lock: Mutex::new(()),
            cache: BlockCache::default(),
        }
    }

    pub fn tip(&self) -> ChainTip {
        *self.tip.read()
    }

    pub fn tip_hash(&self) -> Sha256Hash {
        self.tip.read().hash
    }

    pub fn length(&self) -> u64 {
        self.tip.read().length
    }

    /// Number of the newest block.
    pub fn best_height(&self) -> u64 {
        self.length().saturating_sub(1)
    }

    pub fn status(&self) -> ChainStatus {
        match self.length() {
            0 | 1 => ChainStatus::Bootstrapped,
            length => ChainStatus::Extended { length },
        }
    }

    pub fn difficulty(&self) -> u32 {
        self.genesis.difficulty
    }

    pub fn genesis(&self) -> &Genesis {
        &self.genesis
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn state(&self) -> &StateEngine {
        &self.state
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn genesis_block(&self) -> Result<Block, ChainError> {
        self.genesis.to_block()
    }

    pub fn contains_block(&self, hash: &Sha256Hash) -> Result<bool, ChainError> {
        if self.cache.peek(hash).is_some() {
            return Ok(true);
        }
        self.store.contains(&keys::block(hash))
    }

    pub fn get_block(&self, hash: &Sha256Hash) -> Result<Block, ChainError> {
        if let Some(block) = self.cache.get(hash) {
            return Ok(block);
        }
        let block: Block = self
            .store
            .get_decoded(&keys::block(hash))?
            .ok_or_else(|| ChainError::BlockNotFound(hex::encode(hash)))?;
        self.cache.insert_block(&block);
        Ok(block)
    }

    pub fn get_block_by_number(&self, number: u64) -> Result<Block, ChainError> {
        let tip = self.tip();
        if number >= tip.length {
            return Err(ChainError::BlockNotFound(format!("#{}", number)));
        }
        for block in self.iterator(tip.hash) {
            let block = block?;
            if block.header.number == number {
                return Ok(block);
            }
        }
        Err(ChainError::BlockNotFound(format!("#{}", number)))
    }

    pub fn account(&self, address: &Address) -> Result<Account, ChainError> {
        self.state.account(address)
    }

    pub fn balance(&self, address: &Address) -> Result<u64, ChainError> {
        self.state.balance(address)
    }

    pub fn receipt(&self, tx_hash: &Sha256Hash) -> Result<Receipt, ChainError> {
        self.state.receipt(tx_hash)
    }

    /// A transaction known to this node: confirmed in a block or held as pending.
    pub fn transaction(&self, tx_hash: &Sha256Hash) -> Result<SignedTx, ChainError> {
        self.store
            .get_decoded(&keys::transaction(tx_hash))?
            .ok_or_else(|| ChainError::TransactionNotFound(hex::encode(tx_hash)))
    }

    /// Lazy walk from `from_hash` back to genesis, one block per step.
    pub fn iterator(&self, from_hash: Sha256Hash) -> ChainIterator<'_> {
        ChainIterator {
            chain: self,
            next: Some(from_hash),
        }
    }

    /// Canonical block hashes ordered genesis first.
    pub fn block_hashes(&self) -> Result<Vec<Sha256Hash>, ChainError> {
        let mut hashes = self
            .iterator(self.tip_hash())
            .map(|block| block.map(|b| b.header.hash))
            .collect::<Result<Vec<_>, _>>()?;
        hashes.reverse();
        Ok(hashes)
    }

    /// Checks that `header` extends the current tip: parent, then hash, then number.
    pub fn validate_next(&self, header: &BlockHeader) -> Result<(), ChainError> {
        validate_next(&self.tip(), header)
    }

    /// Validates `block` and applies it on top of the tip.
    ///
    /// Block, balances, receipts, tip and length are written in one store update. A block
    /// that is already stored is reported as [`AppendOutcome::AlreadyKnown`].
    pub fn append(&self, block: &Block) -> Result<AppendOutcome, ChainError> {
        let _guard = self.append_lock.lock();

        if self.contains_block(&block.header.hash)? {
            debug!("Block {} already stored", block.header.hash_str());
            return Ok(AppendOutcome::AlreadyKnown);
        }

        let tip = self.tip();
        validate_next(&tip, &block.header)?;
        validate_body(block, self.difficulty())?;
        let parent = self.get_block(&tip.hash)?;
        if block.header.timestamp <= parent.header.timestamp {
            return Err(ChainError::InvalidBlock(format!(
                "Block timestamp {} is not after parent timestamp {}",
                block.header.timestamp, parent.header.timestamp
            )));
        }

        let length = tip.length + 1;
        let receipts = self.store.update(|txn| {
            let applied = StateEngine::apply_block_in(txn, block)?;
            if applied.state_root != block.header.state_root {
                return Err(ChainError::InvalidBlock("State root mismatch".to_string()));
            }
            if applied.receipt_root != block.header.receipt_root {
                return Err(ChainError::InvalidBlock("Receipt root mismatch".to_string()));
            }
            if applied.nether_used != block.header.nether_used {
                return Err(ChainError::InvalidBlock(format!(
                    "Nether used mismatch. Expected {}, but got {}.",
                    applied.nether_used, block.header.nether_used
                )));
            }

            txn.put_encoded(keys::block(&block.header.hash), block)?;
            txn.set(keys::TIP.to_vec(), block.header.hash.to_vec());
            txn.put_encoded(keys::CHAIN_LENGTH.to_vec(), &length)?;
            Ok(applied.receipts)
        })?;

        *self.tip.write() = ChainTip {
            hash: block.header.hash,
            length,
        };
        self.cache.insert_block(block);

        info!(
            "Appended block #{} {} with {} transactions",
            block.header.number,
            block.header.hash_str(),
            block.transactions.len()
        );
        Ok(AppendOutcome::Extended {
            hash: block.header.hash,
            length,
            receipts,
        })
    }

    /// Builds an unsealed block on top of the tip.
    ///
    /// Roots and nether usage come from a dry run against current state, so the
    /// transactions must be valid in the given order. The nonce and hash still need mining.
    pub fn prepare_block(&self, transactions: Vec<SignedTx>, coinbase: Address) -> Result<Block, ChainError> {
        self.prepare_block_on(self.tip(), transactions, coinbase)
    }

    fn prepare_block_on(&self, tip: ChainTip, transactions: Vec<SignedTx>, coinbase: Address) -> Result<Block, ChainError> {
        if transactions.is_empty() {
            return Err(ChainError::EmptyBlock);
        }
        let parent = self.get_block(&tip.hash)?;
        let timestamp = chrono::Utc::now()
            .timestamp_millis()
            .max(parent.header.timestamp + 1);

        let mut block = Block {
            header: BlockHeader {
                parent_hash: tip.hash,
                hash: ZERO_HASH,
                number: tip.next_number(),
                timestamp,
                state_root: ZERO_HASH,
                tx_root: Block::calculate_tx_root(&transactions),
                receipt_root: ZERO_HASH,
                nether_used: 0,
                coinbase,
                nonce: 0,
            },
            transactions,
        };

        let applied = self
            .store
            .dry_run(|txn| StateEngine::apply_block_in(txn, &block))?;
        block.header.state_root = applied.state_root;
        block.header.receipt_root = applied.receipt_root;
        block.header.nether_used = applied.nether_used;
        block.header.hash = block.header.compute_hash();
        Ok(block)
    }

    /// Adds the reward for `coinbase` to `transactions`, prepares and mines the block.
    /// The reward pays the base amount plus the fees of the included transactions.
    pub fn mine_block(
        &self,
        transactions: Vec<SignedTx>,
        coinbase: Address,
        threads: usize,
        cancel: &CancelToken,
        deadline: Option<Instant>,
    ) -> Result<Block, ChainError> {
        let tip = self.tip();
        let reward = reward_for(&transactions, coinbase, tip.next_number())?;
        let mut all = transactions;
        all.push(reward);

        let block = self.prepare_block_on(tip, all, coinbase)?;
        miner::mine_block(block, self.difficulty(), threads, cancel, deadline)
    }

    /// Walks the whole chain from tip to genesis and re-checks hashes, linkage,
    /// numbering and proof of work. Returns the number of blocks visited.
    pub fn verify_chain(&self) -> Result<u64, ChainError> {
        let tip = self.tip();
        let mut expected_hash = tip.hash;
        let mut expected_number = tip.length;
        let mut visited = 0u64;

        for block in self.iterator(tip.hash) {
            let block = block?;
            visited += 1;
            if visited > tip.length {
                return Err(ChainError::InvalidBlock("Chain is longer than its recorded length".to_string()));
            }
            if block.header.hash != expected_hash || block.header.compute_hash() != block.header.hash {
                return Err(ChainError::InvalidHash);
            }
            expected_number -= 1;
            if block.header.number != expected_number {
                return Err(ChainError::InvalidNumber {
                    expected: expected_number,
                    got: block.header.number,
                });
            }
            if !block.is_genesis() {
                if !miner::validate(&block.header, self.difficulty()) {
                    return Err(ChainError::InvalidProofOfWork);
                }
                if Block::calculate_tx_root(&block.transactions) != block.header.tx_root {
                    return Err(ChainError::InvalidBlock("Transaction root mismatch".to_string()));
                }
            }
            expected_hash = block.header.parent_hash;
        }

        if visited != tip.length {
            return Err(ChainError::InvalidBlock(format!(
                "Walked {} blocks, expected {}",
                visited, tip.length
            )));
        }
        Ok(visited)
    }
}

/// Tip-to-genesis block iterator. Stops after the block whose parent is the zero hash.
/// A missing block is yielded once as `BlockNotFound` and ends the walk.
pub struct ChainIterator<'a> {
    chain: &'a ChainManager,
    next: Option<Sha256Hash>,
}

impl Iterator for ChainIterator<'_> {
    type Item = Result<Block, ChainError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next.take()?;
        match self.chain.get_block(&hash) {
            Ok(block) => {
                if block.header.parent_hash != ZERO_HASH {
                    self.next = Some(block.header.parent_hash);
                }
                Some(Ok(block))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Reward a producer earns for `transactions`: the base reward plus every standard
/// transaction's `fee * fee_price`.
pub fn block_reward(transactions: &[SignedTx]) -> Result<u64, ChainError> {
    let fees = transactions
        .iter()
        .filter(|tx| !tx.is_reward())
        .try_fold(0u64, |acc, tx| {
            acc.checked_add(tx.tx.nether_used()?)
                .ok_or_else(|| ChainError::InvalidBlock("Fee total overflows".to_string()))
        })?;
    BLOCK_REWARD
        .checked_add(fees)
        .ok_or_else(|| ChainError::InvalidBlock("Reward overflows".to_string()))
}

/// Reward transaction paying `coinbase` for block `number`; see [`block_reward`].
pub fn reward_for(transactions: &[SignedTx], coinbase: Address, number: u64) -> Result<SignedTx, ChainError> {
    let value = block_reward(transactions)?;
    Ok(SignedTx::reward(
        coinbase,
        value,
        number,
        chrono::Utc::now().timestamp_millis(),
    ))
}
