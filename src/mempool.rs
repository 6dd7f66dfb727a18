//! Pending transaction pool
//!
//! Admitted transactions are previewed against a shadow overlay of account records:
//! the overlay starts from canonical state and absorbs every pending transaction in
//! admission order. Canonical balances are only ever written by block append, so a
//! pending transaction never moves money on its own.

use crate::blockchain::{transfer, Account, AccountState, Block, ChainManager, Receipt};
use crate::crypto::{Address, Sha256Hash, ZERO_HASH};
use crate::error::ChainError;
use crate::persistence::keys;
use crate::transaction::SignedTx;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on pending transactions held at once.
pub const MAX_PENDING: usize = 10_000;

#[derive(Default)]
struct PoolInner {
    order: Vec<Sha256Hash>,
    entries: HashMap<Sha256Hash, PendingEntry>,
    shadows: HashMap<Address, Account>,
}

#[derive(Clone)]
struct PendingEntry {
    tx: SignedTx,
    preview: Receipt,
}

/// Account lookups that prefer the overlay and fall back to the chain.
struct ShadowView<'a> {
    shadows: &'a mut HashMap<Address, Account>,
    chain: &'a ChainManager,
}

impl AccountState for ShadowView<'_> {
    fn load_account(&mut self, address: &Address) -> Result<Account, ChainError> {
        match self.shadows.get(address) {
            Some(account) => Ok(*account),
            None => self.chain.account(address),
        }
    }

    fn store_account(&mut self, address: &Address, account: Account) -> Result<(), ChainError> {
        self.shadows.insert(*address, account);
        Ok(())
    }
}

/// Counts from one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub removed: usize,
    /// Block transactions that were not pending here.
    pub missing: usize,
    /// Pending transactions that no longer apply on top of the new tip.
    pub evicted: usize,
}

pub struct PendingPool {
    chain: Arc<ChainManager>,
    inner: RwLock<PoolInner>,
}

impl PendingPool {
    pub fn new(chain: Arc<ChainManager>) -> Self {
        PendingPool {
            chain,
            inner: RwLock::new(PoolInner::default()),
        }
    }

    pub fn chain(&self) -> &Arc<ChainManager> {
        &self.chain
    }

    /// Validates `tx`, previews it on the overlay and adds it to the pool.
    ///
    /// Admitting a transaction that is already pending returns its earlier preview.
    pub fn admit(&self, tx: SignedTx) -> Result<Receipt, ChainError> {
        tx.validate()?;
        let hash = tx.hash();

        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.get(&hash) {
            return Ok(entry.preview.clone());
        }
        if inner.order.len() >= MAX_PENDING {
            return Err(ChainError::InvalidTransaction(format!(
                "Pending pool is full ({} transactions)",
                MAX_PENDING
            )));
        }

        // `transfer` writes nothing unless every check passes, so it can run on the
        // overlay directly. Only the record write below needs undoing.
        let undo = [
            (tx.tx.from, inner.shadows.get(&tx.tx.from).copied()),
            (tx.tx.to, inner.shadows.get(&tx.tx.to).copied()),
        ];
        let sender = transfer(
            &mut ShadowView {
                shadows: &mut inner.shadows,
                chain: &self.chain,
            },
            &tx.tx,
        )?;

        if let Err(e) = self
            .chain
            .store()
            .update(|txn| txn.put_encoded(keys::transaction(&hash), &tx))
        {
            for (address, previous) in undo.into_iter().rev() {
                match previous {
                    Some(account) => inner.shadows.insert(address, account),
                    None => inner.shadows.remove(&address),
                };
            }
            return Err(e);
        }

        let preview = Receipt {
            address: tx.tx.from,
            post_balance: sender.balance,
            tx_hash: hash,
            block_hash: ZERO_HASH,
            block_number: 0,
            tx_index: inner.order.len() as u32,
            nether_used: tx.tx.nether_used()?,
        };
        inner.order.push(hash);
        inner.entries.insert(
            hash,
            PendingEntry {
                tx,
                preview: preview.clone(),
            },
        );

        debug!("Admitted transaction {} ({} pending)", hex::encode(hash), inner.order.len());
        Ok(preview)
    }

    /// Up to `limit` pending transactions in admission order. Nothing is removed.
    pub fn drain_for_block(&self, limit: usize) -> Vec<SignedTx> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .take(limit)
            .filter_map(|hash| inner.entries.get(hash).map(|e| e.tx.clone()))
            .collect()
    }

    /// Drops every transaction of `block` from the pool and rebuilds the overlay on top
    /// of the new canonical state. Hashes that were not pending are only logged.
    pub fn reconcile(&self, block: &Block) -> ReconcileReport {
        let mut inner = self.inner.write();
        let mut report = ReconcileReport::default();

        let included: HashSet<Sha256Hash> = block.transactions.iter().map(SignedTx::hash).collect();
        for hash in &included {
            if inner.entries.remove(hash).is_some() {
                report.removed += 1;
            } else {
                report.missing += 1;
                debug!("Reconcile: {} was not pending", hex::encode(hash));
            }
        }
        inner.order.retain(|hash| !included.contains(hash));

        let PoolInner {
            order,
            entries,
            shadows,
        } = &mut *inner;
        shadows.clear();
        let mut kept = Vec::with_capacity(order.len());
        let mut evicted = Vec::new();
        for hash in order.drain(..) {
            let Some(entry) = entries.get(&hash) else {
                continue;
            };
            let replay = transfer(
                &mut ShadowView {
                    shadows: &mut *shadows,
                    chain: &self.chain,
                },
                &entry.tx.tx,
            );
            match replay {
                Ok(_) => kept.push(hash),
                Err(e) => {
                    warn!("Evicting pending transaction {}: {}", hex::encode(hash), e);
                    entries.remove(&hash);
                    evicted.push(hash);
                }
            }
        }
        *order = kept;
        report.evicted = evicted.len();
        if let Err(e) = self.forget_unconfirmed(&evicted) {
            warn!("Failed to drop records of evicted transactions: {}", e);
        }

        if report.removed > 0 || report.evicted > 0 {
            info!(
                "Reconciled block #{}: {} removed, {} evicted, {} still pending",
                block.header.number,
                report.removed,
                report.evicted,
                order.len()
            );
        }
        report
    }

    /// Deletes the stored record of each hash that never made it into a block.
    fn forget_unconfirmed(&self, hashes: &[Sha256Hash]) -> Result<(), ChainError> {
        if hashes.is_empty() {
            return Ok(());
        }
        self.chain.store().update(|txn| {
            for hash in hashes {
                if txn.get(&keys::receipt(hash))?.is_none() {
                    txn.delete(keys::transaction(hash));
                }
            }
            Ok(())
        })
    }

    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.inner.read().entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Sha256Hash) -> Option<SignedTx> {
        self.inner.read().entries.get(hash).map(|e| e.tx.clone())
    }

    /// Account as it would look once every pending transaction is included.
    pub fn pending_account(&self, address: &Address) -> Result<Account, ChainError> {
        if let Some(account) = self.inner.read().shadows.get(address) {
            return Ok(*account);
        }
        self.chain.account(address)
    }

    pub fn transactions(&self) -> Vec<SignedTx> {
        self.drain_for_block(usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::genesis::Genesis;
    use crate::miner::CancelToken;
    use crate::persistence::Store;
    use crate::transaction::Transaction;

    struct Fixture {
        chain: Arc<ChainManager>,
        pool: PendingPool,
        alice: KeyPair,
        bob: Address,
    }

    fn fixture() -> Fixture {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap().address();
        let genesis = Genesis::dev(alice.address(), 1, &[(alice.address(), 1_000)]);
        let chain = Arc::new(ChainManager::initialize(Store::memory(), genesis).unwrap());
        let pool = PendingPool::new(chain.clone());
        Fixture {
            chain,
            pool,
            alice,
            bob,
        }
    }

    fn pay(from: &KeyPair, to: Address, nonce: u64, value: u64) -> SignedTx {
        SignedTx::sign(Transaction::new(from.address(), to, nonce, value, 1, 2), from)
    }

    #[test]
    fn test_admit_previews_without_touching_chain() {
        let f = fixture();
        let receipt = f.pool.admit(pay(&f.alice, f.bob, 1, 100)).unwrap();

        assert_eq!(receipt.post_balance, 898);
        assert_eq!(f.pool.len(), 1);
        assert_eq!(f.chain.balance(&f.alice.address()).unwrap(), 1_000);
        assert_eq!(f.pool.pending_account(&f.alice.address()).unwrap(), Account::new(898, 1));
        assert_eq!(f.pool.pending_account(&f.bob).unwrap(), Account::new(100, 1));
    }

    #[test]
    fn test_admit_persists_transaction() {
        let f = fixture();
        let tx = pay(&f.alice, f.bob, 1, 1);
        f.pool.admit(tx.clone()).unwrap();
        assert_eq!(f.chain.transaction(&tx.hash()).unwrap(), tx);
    }

    #[test]
    fn test_forged_transaction_rejected() {
        let f = fixture();
        let thief = KeyPair::generate().unwrap();
        let forged = SignedTx::sign(
            Transaction::new(f.alice.address(), f.bob, 1, 10, 0, 0),
            &thief,
        );

        assert_eq!(f.pool.admit(forged).unwrap_err(), ChainError::ForgedTransaction);
        assert!(f.pool.is_empty());
    }

    #[test]
    fn test_sequential_nonces_build_on_overlay() {
        let f = fixture();
        f.pool.admit(pay(&f.alice, f.bob, 1, 100)).unwrap();
        f.pool.admit(pay(&f.alice, f.bob, 2, 100)).unwrap();

        let err = f.pool.admit(pay(&f.alice, f.bob, 2, 5)).unwrap_err();
        assert_eq!(err, ChainError::InvalidNonce { expected: 3, got: 2 });
        assert_eq!(f.pool.len(), 2);
    }

    #[test]
    fn test_overspend_across_pending_rejected() {
        let f = fixture();
        f.pool.admit(pay(&f.alice, f.bob, 1, 900)).unwrap();
        let err = f.pool.admit(pay(&f.alice, f.bob, 2, 200)).unwrap_err();
        assert!(matches!(err, ChainError::InsufficientBalance { .. }));
        // The rejected transfer leaves the overlay as the first one left it.
        assert_eq!(f.pool.pending_account(&f.alice.address()).unwrap(), Account::new(98, 1));
        assert_eq!(f.pool.pending_account(&f.bob).unwrap(), Account::new(900, 1));
    }

    #[test]
    fn test_duplicate_admit_is_idempotent() {
        let f = fixture();
        let tx = pay(&f.alice, f.bob, 1, 10);
        let first = f.pool.admit(tx.clone()).unwrap();
        let second = f.pool.admit(tx).unwrap();
        assert_eq!(first, second);
        assert_eq!(f.pool.len(), 1);
    }

    #[test]
    fn test_drain_keeps_order_and_entries() {
        let f = fixture();
        let first = pay(&f.alice, f.bob, 1, 1);
        let second = pay(&f.alice, f.bob, 2, 1);
        f.pool.admit(first.clone()).unwrap();
        f.pool.admit(second.clone()).unwrap();

        assert_eq!(f.pool.drain_for_block(1), vec![first.clone()]);
        assert_eq!(f.pool.drain_for_block(10), vec![first, second]);
        assert_eq!(f.pool.len(), 2);
    }

    #[test]
    fn test_reconcile_after_append() {
        let f = fixture();
        let included = pay(&f.alice, f.bob, 1, 100);
        let later = pay(&f.alice, f.bob, 2, 100);
        f.pool.admit(included.clone()).unwrap();
        f.pool.admit(later.clone()).unwrap();

        let block = f
            .chain
            .mine_block(vec![included], f.alice.address(), 1, &CancelToken::new(), None)
            .unwrap();
        f.chain.append(&block).unwrap();

        let report = f.pool.reconcile(&block);
        assert_eq!(report.removed, 1);
        // The reward transaction was never pending.
        assert_eq!(report.missing, 1);
        assert_eq!(report.evicted, 0);
        assert_eq!(f.pool.transactions(), vec![later]);
    }

    #[test]
    fn test_reconcile_evicts_conflicting_pending() {
        let f = fixture();
        let pending = pay(&f.alice, f.bob, 1, 10);
        f.pool.admit(pending.clone()).unwrap();

        // A different transaction with the same nonce lands in a block first.
        let competing = pay(&f.alice, f.bob, 1, 20);
        let block = f
            .chain
            .mine_block(vec![competing], f.alice.address(), 1, &CancelToken::new(), None)
            .unwrap();
        f.chain.append(&block).unwrap();

        let report = f.pool.reconcile(&block);
        assert_eq!(report.evicted, 1);
        assert!(!f.pool.contains(&pending.hash()));
        assert!(f.pool.is_empty());
        // Only the confirmed transaction keeps its stored record.
        assert!(f.chain.transaction(&pending.hash()).unwrap_err().is_not_found());
        assert!(f.chain.transaction(&block.transactions[0].hash()).is_ok());
    }
}
