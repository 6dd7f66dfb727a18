use crate::crypto::ZERO_HASH;
use crate::error::ChainError;
use crate::miner;
use std::collections::HashSet;

use super::chain::{block_reward, Block, BlockHeader, ChainTip};

/// Checks that `header` can follow `tip`. Order matters to callers that report the
/// first failure: parent hash, then a non-zero hash, then the block number.
pub fn validate_next(tip: &ChainTip, header: &BlockHeader) -> Result<(), ChainError> {
    if header.parent_hash != tip.hash {
        return Err(ChainError::InvalidParent);
    }
    if header.hash == ZERO_HASH {
        return Err(ChainError::InvalidHash);
    }
    if header.number != tip.next_number() {
        return Err(ChainError::InvalidNumber {
            expected: tip.next_number(),
            got: header.number,
        });
    }
    Ok(())
}

/// Stateless checks on a sealed block: recorded hash, proof of work, non-empty body,
/// transaction root, and the shape of its transactions.
pub fn validate_body(block: &Block, difficulty: u32) -> Result<(), ChainError> {
    if block.header.compute_hash() != block.header.hash {
        return Err(ChainError::InvalidHash);
    }
    if !miner::meets_target(&block.header.hash, difficulty) {
        return Err(ChainError::InvalidProofOfWork);
    }
    if block.transactions.is_empty() {
        return Err(ChainError::EmptyBlock);
    }

    let expected_tx_root = Block::calculate_tx_root(&block.transactions);
    if expected_tx_root != block.header.tx_root {
        return Err(ChainError::InvalidBlock(format!(
            "Transaction root mismatch. Expected {}, but got {}.",
            hex::encode(expected_tx_root),
            hex::encode(block.header.tx_root)
        )));
    }

    validate_no_duplicate_transactions(block)?;
    validate_reward(block)?;
    for tx in &block.transactions {
        tx.validate_size()?;
    }
    Ok(())
}

pub fn validate_no_duplicate_transactions(block: &Block) -> Result<(), ChainError> {
    let mut seen = HashSet::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        let hash = tx.hash();
        if !seen.insert(hash) {
            return Err(ChainError::InvalidBlock(format!(
                "Transaction {} appears twice in block",
                hex::encode(hash)
            )));
        }
    }
    Ok(())
}

/// Exactly one reward: minted from the zero address to the block's coinbase, numbered
/// after the block, worth the base reward plus the block's fees.
pub fn validate_reward(block: &Block) -> Result<(), ChainError> {
    let mut rewards = block.transactions.iter().filter(|tx| tx.is_reward());
    let reward = rewards.next().ok_or(ChainError::InvalidReward)?;
    if rewards.next().is_some() {
        return Err(ChainError::InvalidBlock(
            "Block contains more than one reward".to_string(),
        ));
    }

    let reward = &reward.tx;
    if reward.nonce != block.header.number
        || !reward.from.is_zero()
        || reward.to != block.header.coinbase
        || reward.value != block_reward(&block.transactions)?
    {
        return Err(ChainError::InvalidReward);
    }
    Ok(())
}
