use crate::crypto::{Address, Sha256Hash, ZERO_HASH};
use crate::encoding::{merkle_root, CanonicalEncode, Encoder};
use crate::error::ChainError;
use crate::persistence::{keys, Store, Txn};
use crate::transaction::{SignedTx, Transaction};
use std::collections::{BTreeMap, BTreeSet};

use super::chain::Block;

/// Balance and replay counter of one address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Account {
    pub balance: u64,
    pub nonce: u64,
}

impl Account {
    pub fn new(balance: u64, nonce: u64) -> Self {
        Account { balance, nonce }
    }
}

/// Outcome of one applied transaction.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Receipt {
    /// Account whose post-balance is recorded: the sender, or the miner for rewards.
    pub address: Address,
    pub post_balance: u64,
    pub tx_hash: Sha256Hash,
    pub block_hash: Sha256Hash,
    pub block_number: u64,
    pub tx_index: u32,
    pub nether_used: u64,
}

impl Receipt {
    fn unplaced(address: Address, post_balance: u64, tx: &SignedTx, nether_used: u64) -> Self {
        Receipt {
            address,
            post_balance,
            tx_hash: tx.hash(),
            block_hash: ZERO_HASH,
            block_number: 0,
            tx_index: 0,
            nether_used,
        }
    }

    /// Digest used for the receipt root. Covers the position within the block but not
    /// the block hash or number, since the block hash depends on that root.
    pub fn body_hash(&self) -> Sha256Hash {
        self.canonical_hash()
    }
}

impl CanonicalEncode for Receipt {
    fn encode_canonical(&self, enc: &mut Encoder) {
        enc.put_bytes(b"receipt")
            .put_fixed(self.address.pubkey_hash())
            .put_u64(self.post_balance)
            .put_fixed(&self.tx_hash)
            .put_u32(self.tx_index)
            .put_u64(self.nether_used);
    }
}

/// Where account records are read from and written to while applying transfers.
///
/// Implemented by store transactions for canonical state and by the pending pool's
/// overlay for speculative state, so both run the same transition rules.
pub trait AccountState {
    fn load_account(&mut self, address: &Address) -> Result<Account, ChainError>;
    fn store_account(&mut self, address: &Address, account: Account) -> Result<(), ChainError>;
}

impl AccountState for Txn<'_> {
    fn load_account(&mut self, address: &Address) -> Result<Account, ChainError> {
        Ok(self.get_decoded(&keys::balance(address))?.unwrap_or_default())
    }

    fn store_account(&mut self, address: &Address, account: Account) -> Result<(), ChainError> {
        self.put_encoded(keys::balance(address), &account)
    }
}

/// Moves `value` and charges `fee * fee_price` for a standard transfer.
///
/// Checks run balance first, then nonce; on error nothing has been written.
/// Returns the sender's account after the transfer.
pub fn transfer<S: AccountState>(state: &mut S, tx: &Transaction) -> Result<Account, ChainError> {
    if tx.from == tx.to {
        return Err(ChainError::InvalidTransaction("Cannot send to self".to_string()));
    }
    let cost = tx.cost()?;

    let mut sender = state.load_account(&tx.from)?;
    if sender.balance < cost {
        return Err(ChainError::InsufficientBalance {
            available: sender.balance,
            required: cost,
        });
    }
    let expected = sender.nonce + 1;
    if tx.nonce != expected {
        return Err(ChainError::InvalidNonce {
            expected,
            got: tx.nonce,
        });
    }

    let mut recipient = state.load_account(&tx.to)?;
    let credited = recipient.balance.checked_add(tx.value).ok_or_else(|| {
        ChainError::InvalidTransaction("Recipient balance overflows".to_string())
    })?;

    sender.balance -= cost;
    sender.nonce = tx.nonce;
    recipient.balance = credited;
    recipient.nonce += 1;

    state.store_account(&tx.from, sender)?;
    state.store_account(&tx.to, recipient)?;
    Ok(sender)
}

/// Credits a reward transaction's value to its recipient. No debit, no nonce checks.
pub fn credit_reward<S: AccountState>(state: &mut S, tx: &Transaction) -> Result<Account, ChainError> {
    if !tx.is_reward() {
        return Err(ChainError::InvalidReward);
    }
    let mut miner = state.load_account(&tx.to)?;
    miner.balance = miner.balance.checked_add(tx.value).ok_or_else(|| {
        ChainError::InvalidTransaction("Miner balance overflows".to_string())
    })?;
    state.store_account(&tx.to, miner)?;
    Ok(miner)
}

/// Root over `(address, balance, nonce)` of the given accounts in address order.
pub fn state_root(accounts: &BTreeMap<Address, Account>) -> Sha256Hash {
    let mut enc = Encoder::with_domain(b"state");
    enc.put_u64(accounts.len() as u64);
    for (address, account) in accounts {
        enc.put_fixed(address.pubkey_hash())
            .put_u64(account.balance)
            .put_u64(account.nonce);
    }
    enc.digest()
}

/// Everything block application produced, before it is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockApplication {
    pub receipts: Vec<Receipt>,
    pub nether_used: u64,
    pub state_root: Sha256Hash,
    pub receipt_root: Sha256Hash,
}

/// Applies transactions to the account records kept in the store.
#[derive(Clone)]
pub struct StateEngine {
    store: Store,
}

impl StateEngine {
    pub fn new(store: Store) -> Self {
        StateEngine { store }
    }

    pub fn account(&self, address: &Address) -> Result<Account, ChainError> {
        Ok(self
            .store
            .get_decoded(&keys::balance(address))?
            .unwrap_or_default())
    }

    pub fn balance(&self, address: &Address) -> Result<u64, ChainError> {
        Ok(self.account(address)?.balance)
    }

    pub fn receipt(&self, tx_hash: &Sha256Hash) -> Result<Receipt, ChainError> {
        self.store
            .get_decoded(&keys::receipt(tx_hash))?
            .ok_or_else(|| ChainError::ReceiptNotFound(hex::encode(tx_hash)))
    }

    /// Every account with a stored record, in key order.
    pub fn accounts(&self) -> Result<Vec<(Address, Account)>, ChainError> {
        let mut out = Vec::new();
        for (key, value) in self.store.iterate(keys::BALANCES_PREFIX)? {
            let encoded = String::from_utf8_lossy(&key[keys::BALANCES_PREFIX.len()..]).to_string();
            out.push((Address::decode(&encoded)?, bincode::deserialize(&value)?));
        }
        Ok(out)
    }

    /// Applies one standard transaction; balances and receipt commit together.
    pub fn apply_transaction(&self, tx: &SignedTx) -> Result<Receipt, ChainError> {
        self.store.update(|txn| {
            let receipt = Self::apply_standard(txn, tx)?;
            txn.put_encoded(keys::receipt(&receipt.tx_hash), &receipt)?;
            Ok(receipt)
        })
    }

    /// Applies one reward transaction; fails with `InvalidReward` for anything else.
    pub fn apply_reward(&self, tx: &SignedTx) -> Result<Receipt, ChainError> {
        self.store.update(|txn| {
            let receipt = Self::apply_reward_in(txn, tx)?;
            txn.put_encoded(keys::receipt(&receipt.tx_hash), &receipt)?;
            Ok(receipt)
        })
    }

    /// Applies every transaction of `block` in order, all or nothing.
    pub fn apply_block(&self, block: &Block) -> Result<BlockApplication, ChainError> {
        self.store.update(|txn| Self::apply_block_in(txn, block))
    }

    pub(crate) fn apply_standard(txn: &mut Txn<'_>, tx: &SignedTx) -> Result<Receipt, ChainError> {
        let sender = transfer(txn, &tx.tx)?;
        Ok(Receipt::unplaced(tx.tx.from, sender.balance, tx, tx.tx.nether_used()?))
    }

    pub(crate) fn apply_reward_in(txn: &mut Txn<'_>, tx: &SignedTx) -> Result<Receipt, ChainError> {
        let miner = credit_reward(txn, &tx.tx)?;
        Ok(Receipt::unplaced(tx.tx.to, miner.balance, tx, 0))
    }

    /// Block application inside an open store transaction.
    ///
    /// Standard transactions must be authentic. Receipts are stamped with the block's
    /// hash, number and position and written next to the transaction itself.
    pub(crate) fn apply_block_in(txn: &mut Txn<'_>, block: &Block) -> Result<BlockApplication, ChainError> {
        let mut receipts = Vec::with_capacity(block.transactions.len());
        let mut touched = BTreeSet::new();
        let mut nether_used: u64 = 0;

        for (index, tx) in block.transactions.iter().enumerate() {
            let mut receipt = if tx.is_reward() {
                touched.insert(tx.tx.to);
                Self::apply_reward_in(txn, tx)?
            } else {
                tx.verify_authentic()?;
                touched.insert(tx.tx.from);
                touched.insert(tx.tx.to);
                Self::apply_standard(txn, tx)?
            };

            nether_used = nether_used.checked_add(receipt.nether_used).ok_or_else(|| {
                ChainError::InvalidBlock("Block nether usage overflows".to_string())
            })?;
            receipt.block_hash = block.header.hash;
            receipt.block_number = block.header.number;
            receipt.tx_index = index as u32;

            txn.put_encoded(keys::transaction(&receipt.tx_hash), tx)?;
            txn.put_encoded(keys::receipt(&receipt.tx_hash), &receipt)?;
            receipts.push(receipt);
        }

        let mut post_state = BTreeMap::new();
        for address in touched {
            let account = txn.load_account(&address)?;
            post_state.insert(address, account);
        }
        let body_hashes: Vec<Sha256Hash> = receipts.iter().map(Receipt::body_hash).collect();

        Ok(BlockApplication {
            receipts,
            nether_used,
            state_root: state_root(&post_state),
            receipt_root: merkle_root(&body_hashes),
        })
    }
}
