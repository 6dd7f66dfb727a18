/// Transaction types for NetherChain
use crate::crypto::{Address, KeyPair, Sha256Hash};
use crate::encoding::{CanonicalEncode, Encoder};
use crate::error::ChainError;

/// Maximum transaction size in bytes (100KB) to prevent DoS
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

/// Maximum length of the free-form `data` payload.
pub const MAX_DATA_LENGTH: usize = 4_096;

/// Payload that marks a transaction as a block reward.
///
/// Any sender can put these bytes into `data`; only block application routes on it,
/// and the mempool rejects unsigned rewards before they reach a block.
pub const REWARD_DATA: &[u8] = b"REWARD";

/// Base reward credited to the miner of each block, in Nether.
pub const BLOCK_REWARD: u64 = 100;

/// Immutable transfer of Nether from one account to another.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub value: u64,
    pub fee: u64,
    pub fee_price: u64,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Creation time, milliseconds since the Unix epoch.
    pub time: i64,
}

impl Transaction {
    pub fn new(from: Address, to: Address, nonce: u64, value: u64, fee: u64, fee_price: u64) -> Self {
        Transaction {
            from,
            to,
            nonce,
            value,
            fee,
            fee_price,
            data: Vec::new(),
            time: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn with_time(mut self, time: i64) -> Self {
        self.time = time;
        self
    }

    /// Reward paid to `to` for producing block `block_number`.
    pub fn reward(to: Address, value: u64, block_number: u64, time: i64) -> Self {
        Transaction {
            from: Address::ZERO,
            to,
            nonce: block_number,
            value,
            fee: 0,
            fee_price: 0,
            data: REWARD_DATA.to_vec(),
            time,
        }
    }

    pub fn is_reward(&self) -> bool {
        self.data == REWARD_DATA
    }

    /// Nether paid to the network for inclusion: `fee * fee_price`.
    pub fn nether_used(&self) -> Result<u64, ChainError> {
        self.fee.checked_mul(self.fee_price).ok_or_else(|| {
            ChainError::InvalidTransaction("fee * fee_price overflows".to_string())
        })
    }

    /// Total debit of the sender: `value + fee * fee_price`.
    pub fn cost(&self) -> Result<u64, ChainError> {
        self.value
            .checked_add(self.nether_used()?)
            .ok_or_else(|| ChainError::InvalidTransaction("transaction cost overflows".to_string()))
    }

    pub fn hash(&self) -> Sha256Hash {
        self.canonical_hash()
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.hash())
    }
}

impl CanonicalEncode for Transaction {
    fn encode_canonical(&self, enc: &mut Encoder) {
        enc.put_bytes(b"tx")
            .put_fixed(self.from.pubkey_hash())
            .put_fixed(self.to.pubkey_hash())
            .put_u64(self.nonce)
            .put_u64(self.value)
            .put_u64(self.fee)
            .put_u64(self.fee_price)
            .put_bytes(&self.data)
            .put_i64(self.time);
    }
}

/// A transaction plus the recoverable signature over its hash.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SignedTx {
    pub tx: Transaction,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl SignedTx {
    pub fn new(tx: Transaction, signature: Vec<u8>) -> Self {
        SignedTx { tx, signature }
    }

    /// Signs `tx` with `keypair`; the signature covers `tx.hash()`.
    pub fn sign(tx: Transaction, keypair: &KeyPair) -> Self {
        let signature = keypair.sign_digest(&tx.hash()).to_vec();
        SignedTx { tx, signature }
    }

    /// Reward transactions are never signed.
    pub fn reward(to: Address, value: u64, block_number: u64, time: i64) -> Self {
        SignedTx {
            tx: Transaction::reward(to, value, block_number, time),
            signature: Vec::new(),
        }
    }

    /// Identity of the transaction; the signature is not part of it.
    pub fn hash(&self) -> Sha256Hash {
        self.tx.hash()
    }

    pub fn hash_str(&self) -> String {
        self.tx.hash_str()
    }

    pub fn is_reward(&self) -> bool {
        self.tx.is_reward()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ChainError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Validate transaction size to prevent DoS attacks
    pub fn validate_size(&self) -> Result<(), ChainError> {
        let size = bincode::serialized_size(self)? as usize;
        if size > MAX_TRANSACTION_SIZE {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction too large: {} bytes (max: {})",
                size, MAX_TRANSACTION_SIZE
            )));
        }
        if self.tx.data.len() > MAX_DATA_LENGTH {
            return Err(ChainError::InvalidTransaction(format!(
                "Data payload too large: {} bytes (max: {})",
                self.tx.data.len(),
                MAX_DATA_LENGTH
            )));
        }
        Ok(())
    }
}
