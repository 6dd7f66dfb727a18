//! End-to-end ledger scenarios: genesis, transfers, mining, append and iteration.

use netherchain::blockchain::{AppendOutcome, Block, ChainManager, ChainTip};
use netherchain::crypto::{Address, KeyPair, ZERO_HASH};
use netherchain::error::ChainError;
use netherchain::genesis::Genesis;
use netherchain::mempool::PendingPool;
use netherchain::miner::{self, CancelToken};
use netherchain::node::open_chain;
use netherchain::persistence::{open_data_dir, Store};
use netherchain::transaction::{SignedTx, Transaction};
use std::sync::Arc;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

struct Ledger {
    chain: ChainManager,
    alice: KeyPair,
    bob: Address,
    miner: Address,
}

/// Chain with `alloc = {alice: 1000}` and a trivial difficulty.
fn ledger() -> Result<Ledger, Box<dyn std::error::Error>> {
    let alice = KeyPair::generate()?;
    let bob = KeyPair::generate()?.address();
    let miner = KeyPair::generate()?.address();
    let genesis = Genesis::dev(alice.address(), 2, &[(alice.address(), 1_000)]);
    Ok(Ledger {
        chain: ChainManager::initialize(Store::memory(), genesis)?,
        alice,
        bob,
        miner,
    })
}

fn pay(from: &KeyPair, to: Address, nonce: u64, value: u64, fee: u64, fee_price: u64) -> SignedTx {
    SignedTx::sign(
        Transaction::new(from.address(), to, nonce, value, fee, fee_price),
        from,
    )
}

fn mine(chain: &ChainManager, txs: Vec<SignedTx>, coinbase: Address) -> Result<Block, ChainError> {
    chain.mine_block(txs, coinbase, 2, &CancelToken::new(), None)
}

#[test]
fn test_genesis_allocation() -> TestResult {
    let l = ledger()?;
    assert_eq!(l.chain.balance(&l.alice.address())?, 1_000);
    assert_eq!(l.chain.length(), 1);
    assert!(l.chain.genesis_block()?.is_genesis());
    Ok(())
}

#[test]
fn test_transfer_mined_into_block() -> TestResult {
    let l = ledger()?;
    let tx = pay(&l.alice, l.bob, 1, 100, 2, 3);

    let block = mine(&l.chain, vec![tx.clone()], l.miner)?;
    assert!(miner::validate(&block.header, l.chain.difficulty()));
    let reward = block.transactions.last().ok_or("mined block has no reward")?;
    assert!(reward.is_reward());
    assert_eq!(reward.tx.nonce, block.header.number);
    assert_eq!(reward.tx.to, block.header.coinbase);
    l.chain.append(&block)?;

    assert_eq!(l.chain.balance(&l.alice.address())?, 900 - 2 * 3);
    assert_eq!(l.chain.balance(&l.bob)?, 100);
    assert_eq!(l.chain.account(&l.alice.address())?.nonce, 1);
    assert_eq!(l.chain.account(&l.bob)?.nonce, 1);

    let receipt = l.chain.receipt(&tx.hash())?;
    assert_eq!(receipt.block_hash, block.hash());
    assert_eq!(receipt.post_balance, 894);
    assert_eq!(l.chain.transaction(&tx.hash())?, tx);
    // The miner collects the base reward plus the fee.
    assert_eq!(l.chain.balance(&l.miner)?, 106);
    Ok(())
}

#[test]
fn test_overdraft_changes_nothing() -> TestResult {
    let l = ledger()?;
    let tx = pay(&l.alice, l.bob, 1, 1_001, 0, 0);

    let err = l.chain.state().apply_transaction(&tx).unwrap_err();
    assert_eq!(
        err,
        ChainError::InsufficientBalance {
            available: 1_000,
            required: 1_001
        }
    );
    assert_eq!(l.chain.account(&l.alice.address())?.balance, 1_000);
    assert_eq!(l.chain.account(&l.alice.address())?.nonce, 0);
    assert_eq!(l.chain.account(&l.bob)?.balance, 0);
    assert!(l.chain.receipt(&tx.hash()).unwrap_err().is_not_found());
    Ok(())
}

#[test]
fn test_wrong_parent_rejected() -> TestResult {
    let l = ledger()?;
    let mut block = mine(&l.chain, vec![pay(&l.alice, l.bob, 1, 10, 0, 0)], l.miner)?;
    block.header.parent_hash = [0xAB; 32];

    let tip_before = l.chain.tip();
    assert_eq!(l.chain.append(&block).unwrap_err(), ChainError::InvalidParent);
    assert_eq!(l.chain.tip(), tip_before);
    assert_eq!(l.chain.balance(&l.bob)?, 0);
    Ok(())
}

#[test]
fn test_self_awarded_reward_rejected() -> TestResult {
    let l = ledger()?;
    let thief = KeyPair::generate()?.address();
    let inflated = SignedTx::reward(thief, 1_000_000_000_000_000, 1, 0);
    let block = l
        .chain
        .prepare_block(vec![pay(&l.alice, l.bob, 1, 10, 0, 0), inflated], thief)?;
    let block = miner::mine_block(block, l.chain.difficulty(), 1, &CancelToken::new(), None)?;

    let tip_before = l.chain.tip();
    assert_eq!(l.chain.append(&block).unwrap_err(), ChainError::InvalidReward);
    assert_eq!(l.chain.tip(), tip_before);
    assert_eq!(l.chain.balance(&thief)?, 0);
    assert_eq!(l.chain.balance(&l.bob)?, 0);
    Ok(())
}

#[test]
fn test_block_must_be_newer_than_parent() -> TestResult {
    let l = ledger()?;
    let genesis_time = l.chain.genesis_block()?.header.timestamp;
    let mut block = mine(&l.chain, vec![pay(&l.alice, l.bob, 1, 10, 0, 0)], l.miner)?;
    block.header.timestamp = genesis_time;
    let block = miner::mine_block(block, l.chain.difficulty(), 1, &CancelToken::new(), None)?;

    assert!(matches!(l.chain.append(&block), Err(ChainError::InvalidBlock(_))));
    assert_eq!(l.chain.length(), 1);
    Ok(())
}

#[test]
fn test_competing_appends_are_serialized() -> TestResult {
    let l = ledger()?;
    let left = mine(&l.chain, vec![pay(&l.alice, l.bob, 1, 10, 0, 0)], l.miner)?;
    let right = mine(&l.chain, vec![pay(&l.alice, l.bob, 1, 20, 0, 0)], l.miner)?;
    assert_eq!(left.header.parent_hash, right.header.parent_hash);

    let chain = &l.chain;
    let results = std::thread::scope(|scope| {
        let handles: Vec<_> = [&left, &right]
            .into_iter()
            .map(|block| scope.spawn(move || chain.append(block)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("append thread panicked"))
            .collect::<Vec<_>>()
    });

    let extended = results
        .iter()
        .filter(|r| matches!(r, Ok(AppendOutcome::Extended { length: 2, .. })))
        .count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(ChainError::InvalidParent)))
        .count();
    assert_eq!((extended, refused), (1, 1));

    // Exactly one of the two transfers took effect.
    let winner = if chain.tip_hash() == left.hash() { 10 } else { 20 };
    assert_eq!(chain.tip(), ChainTip { hash: chain.tip_hash(), length: 2 });
    assert_eq!(chain.balance(&l.bob)?, winner);
    assert_eq!(chain.account(&l.alice.address())?.nonce, 1);
    Ok(())
}

#[test]
fn test_reappend_is_noop() -> TestResult {
    let l = ledger()?;
    let block = mine(&l.chain, vec![pay(&l.alice, l.bob, 1, 10, 0, 0)], l.miner)?;
    assert!(matches!(l.chain.append(&block)?, AppendOutcome::Extended { length: 2, .. }));

    assert_eq!(l.chain.append(&block)?, AppendOutcome::AlreadyKnown);
    assert_eq!(l.chain.length(), 2);
    assert_eq!(l.chain.tip_hash(), block.hash());
    assert_eq!(l.chain.balance(&l.bob)?, 10);
    Ok(())
}

#[test]
fn test_conservation_and_nonce_order() -> TestResult {
    let l = ledger()?;
    let first = pay(&l.alice, l.bob, 1, 100, 1, 5);
    let second = pay(&l.alice, l.bob, 2, 50, 1, 5);

    let before = l.chain.account(&l.alice.address())?;
    let block = mine(&l.chain, vec![first.clone(), second.clone()], l.miner)?;
    l.chain.append(&block)?;

    let after = l.chain.account(&l.alice.address())?;
    assert_eq!(after.balance + first.tx.cost()? + second.tx.cost()?, before.balance);
    assert_eq!(after.nonce, before.nonce + 2);
    assert_eq!(l.chain.receipt(&first.hash())?.post_balance, 895);
    assert_eq!(l.chain.receipt(&second.hash())?.post_balance, 840);
    assert_eq!(l.chain.receipt(&second.hash())?.tx_index, 1);

    // Replaying a spent nonce is refused.
    let replay = mine(&l.chain, vec![first], l.miner).unwrap_err();
    assert!(matches!(replay, ChainError::InvalidNonce { expected: 3, got: 1 }));
    Ok(())
}

#[test]
fn test_iteration_reaches_genesis() -> TestResult {
    let l = ledger()?;
    for nonce in 1..=3 {
        let block = mine(&l.chain, vec![pay(&l.alice, l.bob, nonce, 1, 0, 0)], l.miner)?;
        l.chain.append(&block)?;
    }

    let blocks: Vec<Block> = l.chain.iterator(l.chain.tip_hash()).collect::<Result<_, _>>()?;
    assert_eq!(blocks.len() as u64, l.chain.length());
    assert_eq!(blocks.last().map(|b| b.header.parent_hash), Some(ZERO_HASH));
    let numbers: Vec<u64> = blocks.iter().map(|b| b.header.number).collect();
    assert_eq!(numbers, vec![3, 2, 1, 0]);
    assert_eq!(l.chain.verify_chain()?, 4);
    Ok(())
}

#[test]
fn test_hash_survives_reserialization() -> TestResult {
    let l = ledger()?;
    let tx = pay(&l.alice, l.bob, 1, 10, 1, 1);
    let decoded = SignedTx::from_bytes(&tx.to_bytes()?)?;
    assert_eq!(decoded.hash(), tx.hash());
    assert!(decoded.is_authentic()?);
    Ok(())
}

#[test]
fn test_mempool_then_block_reconciles() -> TestResult {
    let l = ledger()?;
    let chain = Arc::new(l.chain);
    let pool = PendingPool::new(chain.clone());
    pool.admit(pay(&l.alice, l.bob, 1, 100, 0, 0))?;
    pool.admit(pay(&l.alice, l.bob, 2, 100, 0, 0))?;
    // Pending transactions do not move canonical balances.
    assert_eq!(chain.balance(&l.bob)?, 0);

    let block = mine(&chain, pool.drain_for_block(10), l.miner)?;
    chain.append(&block)?;
    let report = pool.reconcile(&block);
    assert_eq!(report.removed, 2);
    assert!(pool.is_empty());
    assert_eq!(chain.balance(&l.bob)?, 200);
    Ok(())
}

#[test]
fn test_sqlite_chain_survives_restart() -> TestResult {
    let dir = TempDir::new()?;
    let alice = KeyPair::generate()?;
    let bob = KeyPair::generate()?.address();
    let genesis = Genesis::dev(alice.address(), 2, &[(alice.address(), 1_000)]);

    let tip = {
        let (store, _lock) = open_data_dir(dir.path())?;
        let chain = ChainManager::initialize(store, genesis.clone())?;
        let block = mine(&chain, vec![pay(&alice, bob, 1, 250, 0, 0)], alice.address())?;
        chain.append(&block)?;
        chain.tip()
    };

    let (store, _lock) = open_data_dir(dir.path())?;
    let chain = open_chain(store, None)?;
    assert_eq!(chain.tip(), tip);
    assert_eq!(chain.balance(&bob)?, 250);
    assert_eq!(chain.genesis(), &genesis);
    assert_eq!(
        ChainManager::initialize(Store::sqlite(&dir.path().join("chain.db"))?, genesis).unwrap_err(),
        ChainError::AlreadyInitialized
    );
    Ok(())
}
