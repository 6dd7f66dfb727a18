//! Genesis record: the JSON document a chain is bootstrapped from.

use crate::blockchain::{state_root, Account, Block, BlockHeader};
use crate::crypto::{Address, Sha256Hash, ZERO_HASH};
use crate::error::ChainError;
use crate::miner::MAX_DIFFICULTY;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Initial allocation for one address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub balance: u64,
    #[serde(default)]
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    pub chain_id: u64,
    /// Milliseconds since the Unix epoch; becomes the genesis block timestamp.
    pub genesis_time: i64,
    /// Required leading zero bits of every block hash after genesis.
    pub difficulty: u32,
    #[serde(default)]
    pub gas_limit: u64,
    pub coinbase: String,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    /// Hex; must be the zero hash so iteration stops at genesis.
    #[serde(default = "default_parent_hash")]
    pub parent_hash: String,
    #[serde(default)]
    pub extra_data: String,
    #[serde(default)]
    pub alloc: BTreeMap<String, GenesisAccount>,
}

fn default_symbol() -> String {
    "NTH".to_string()
}

fn default_parent_hash() -> String {
    hex::encode(ZERO_HASH)
}

impl Genesis {
    /// Single-account genesis, handy for development networks and tests.
    pub fn dev(coinbase: Address, difficulty: u32, alloc: &[(Address, u64)]) -> Self {
        Genesis {
            chain_id: 1337,
            genesis_time: 1_700_000_000_000,
            difficulty,
            gas_limit: 0,
            coinbase: coinbase.encode(),
            symbol: default_symbol(),
            parent_hash: default_parent_hash(),
            extra_data: String::new(),
            alloc: alloc
                .iter()
                .map(|(address, balance)| {
                    (
                        address.encode(),
                        GenesisAccount {
                            balance: *balance,
                            nonce: 0,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ChainError> {
        let contents = fs::read_to_string(path).map_err(|e| {
            ChainError::ConfigError(format!("Failed to read genesis {}: {}", path.display(), e))
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, ChainError> {
        let genesis: Genesis = serde_json::from_str(json)?;
        genesis.check_difficulty()?;
        genesis.parent()?;
        genesis.coinbase_address()?;
        genesis.accounts()?;
        Ok(genesis)
    }

    pub fn to_json(&self) -> Result<String, ChainError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn check_difficulty(&self) -> Result<(), ChainError> {
        if self.difficulty > MAX_DIFFICULTY {
            return Err(ChainError::ConfigError(format!(
                "Genesis difficulty {} exceeds {} bits",
                self.difficulty, MAX_DIFFICULTY
            )));
        }
        Ok(())
    }

    pub fn coinbase_address(&self) -> Result<Address, ChainError> {
        Address::decode(&self.coinbase)
    }

    pub fn parent(&self) -> Result<Sha256Hash, ChainError> {
        let bytes = hex::decode(&self.parent_hash)
            .map_err(|e| ChainError::InvalidBlock(format!("Genesis parent hash is not hex: {}", e)))?;
        let parent: Sha256Hash = bytes.try_into().map_err(|_| {
            ChainError::InvalidBlock("Genesis parent hash must be 32 bytes".to_string())
        })?;
        if parent != ZERO_HASH {
            return Err(ChainError::InvalidBlock(
                "Genesis parent hash must be zero".to_string(),
            ));
        }
        Ok(parent)
    }

    pub fn accounts(&self) -> Result<BTreeMap<Address, Account>, ChainError> {
        self.alloc
            .iter()
            .map(|(address, alloc)| {
                Ok((Address::decode(address)?, Account::new(alloc.balance, alloc.nonce)))
            })
            .collect()
    }

    /// Block 0. It carries no transactions and is not mined.
    pub fn to_block(&self) -> Result<Block, ChainError> {
        self.check_difficulty()?;
        let mut header = BlockHeader {
            parent_hash: self.parent()?,
            hash: ZERO_HASH,
            number: 0,
            timestamp: self.genesis_time,
            state_root: state_root(&self.accounts()?),
            tx_root: ZERO_HASH,
            receipt_root: ZERO_HASH,
            nether_used: 0,
            coinbase: self.coinbase_address()?,
            nonce: 0,
        };
        header.hash = header.compute_hash();
        Ok(Block {
            header,
            transactions: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::ChainManager;
    use crate::crypto::KeyPair;
    use crate::persistence::Store;

    #[test]
    fn test_genesis_json_roundtrip() {
        let miner = KeyPair::generate().unwrap().address();
        let alice = KeyPair::generate().unwrap().address();
        let genesis = Genesis::dev(miner, 4, &[(alice, 500)]);

        let parsed = Genesis::from_json(&genesis.to_json().unwrap()).unwrap();
        assert_eq!(parsed, genesis);
        assert_eq!(parsed.accounts().unwrap()[&alice], Account::new(500, 0));
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let miner = KeyPair::generate().unwrap().address();
        let json = format!(
            r#"{{"chain_id": 7, "genesis_time": 0, "difficulty": 2, "coinbase": "{}"}}"#,
            miner
        );
        let genesis = Genesis::from_json(&json).unwrap();
        assert_eq!(genesis.symbol, "NTH");
        assert!(genesis.alloc.is_empty());
        assert_eq!(genesis.parent().unwrap(), ZERO_HASH);
    }

    #[test]
    fn test_nonzero_parent_rejected() {
        let miner = KeyPair::generate().unwrap().address();
        let mut genesis = Genesis::dev(miner, 1, &[]);
        genesis.parent_hash = hex::encode([1u8; 32]);
        assert!(matches!(genesis.to_block(), Err(ChainError::InvalidBlock(_))));
    }

    #[test]
    fn test_unreachable_difficulty_rejected() {
        let miner = KeyPair::generate().unwrap().address();
        let genesis = Genesis::dev(miner, MAX_DIFFICULTY + 1, &[]);
        assert!(matches!(genesis.to_block(), Err(ChainError::ConfigError(_))));
        assert!(matches!(
            Genesis::from_json(&genesis.to_json().unwrap()),
            Err(ChainError::ConfigError(_))
        ));
        assert!(ChainManager::initialize(Store::memory(), genesis).is_err());

        assert!(Genesis::dev(miner, MAX_DIFFICULTY, &[]).to_block().is_ok());
    }

    #[test]
    fn test_bad_alloc_address_rejected() {
        let miner = KeyPair::generate().unwrap().address();
        let mut genesis = Genesis::dev(miner, 1, &[]);
        genesis
            .alloc
            .insert("not-an-address".to_string(), GenesisAccount::default());
        assert!(matches!(
            Genesis::from_json(&genesis.to_json().unwrap()),
            Err(ChainError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_genesis_block_is_deterministic() {
        let miner = KeyPair::generate().unwrap().address();
        let genesis = Genesis::dev(miner, 3, &[(miner, 1)]);
        let a = genesis.to_block().unwrap();
        let b = genesis.to_block().unwrap();

        assert_eq!(a.header.hash, b.header.hash);
        assert_eq!(a.header.hash, a.header.compute_hash());
        assert_eq!(a.header.number, 0);
        assert!(a.transactions.is_empty());
    }
}
