//! Proof-of-work mining
//!
//! A block hash meets difficulty `bits` when it is below `2^(256 - bits)`, i.e. when its
//! first `bits` bits are zero. Mining searches nonces from 0 upward and can be stopped
//! from another thread with a [`CancelToken`] or by a deadline.

use crate::blockchain::{Block, BlockHeader};
use crate::crypto::Sha256Hash;
use crate::error::ChainError;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Deadline is only looked at every this many attempts; `Instant::now` is not free.
const DEADLINE_CHECK_INTERVAL: u64 = 1_024;

/// Thread-safe flag used to stop a running search.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Once triggered the token remains set.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A nonce together with the header hash it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seal {
    pub nonce: u64,
    pub hash: Sha256Hash,
}

/// Hardest target a hash can meet: every bit zero.
pub const MAX_DIFFICULTY: u32 = 256;

pub fn leading_zero_bits(hash: &Sha256Hash) -> u32 {
    let mut count = 0;
    for &b in hash {
        if b == 0 {
            count += 8;
        } else {
            count += b.leading_zeros();
            break;
        }
    }
    count
}

/// True when `hash < 2^(256 - bits)`.
pub fn meets_target(hash: &Sha256Hash, bits: u32) -> bool {
    leading_zero_bits(hash) >= bits
}

/// Big-endian `2^(256 - bits)`. `None` for `bits == 0`, where every hash qualifies.
pub fn target(bits: u32) -> Option<Sha256Hash> {
    if bits == 0 || bits > MAX_DIFFICULTY {
        return None;
    }
    let exponent = 256 - bits;
    let mut out = [0u8; 32];
    out[31 - (exponent / 8) as usize] = 1 << (exponent % 8);
    Some(out)
}

/// Recomputes the header digest from its recorded nonce and checks it against `bits`.
pub fn validate(header: &BlockHeader, bits: u32) -> bool {
    meets_target(&header.compute_hash(), bits)
}

/// Searches nonces 0, 1, 2, ... on the calling thread.
pub fn mine(
    header: &BlockHeader,
    bits: u32,
    cancel: &CancelToken,
    deadline: Option<Instant>,
) -> Result<Seal, ChainError> {
    let stop = AtomicBool::new(false);
    search(&seal_hasher(header), bits, 0, 1, cancel, deadline, &stop)
}

/// Splits the nonce space across `threads` rayon workers; the first hit stops the rest.
pub fn mine_parallel(
    header: &BlockHeader,
    bits: u32,
    threads: usize,
    cancel: &CancelToken,
    deadline: Option<Instant>,
) -> Result<Seal, ChainError> {
    if threads <= 1 {
        return mine(header, bits, cancel, deadline);
    }

    let base = seal_hasher(header);
    let found = AtomicBool::new(false);
    let stride = threads as u64;
    let results: Vec<Result<Seal, ChainError>> = (0..stride)
        .into_par_iter()
        .map(|start| search(&base, bits, start, stride, cancel, deadline, &found))
        .collect();

    let mut timed_out = false;
    for result in results {
        match result {
            Ok(seal) => return Ok(seal),
            Err(ChainError::MiningTimedOut) => timed_out = true,
            Err(ChainError::MiningCancelled) => {}
            Err(e) => return Err(e),
        }
    }
    Err(if timed_out {
        ChainError::MiningTimedOut
    } else {
        ChainError::MiningCancelled
    })
}

/// Mines `block` in place of its header and returns it sealed.
pub fn mine_block(
    mut block: Block,
    bits: u32,
    threads: usize,
    cancel: &CancelToken,
    deadline: Option<Instant>,
) -> Result<Block, ChainError> {
    let started = Instant::now();
    let seal = mine_parallel(&block.header, bits, threads, cancel, deadline)?;
    block.header.nonce = seal.nonce;
    block.header.hash = seal.hash;
    debug!(
        "Mined block {} with nonce {} in {:?}",
        block.header.number,
        seal.nonce,
        started.elapsed()
    );
    Ok(block)
}

fn seal_hasher(header: &BlockHeader) -> Sha256 {
    let mut hasher = Sha256::new();
    hasher.update(header.seal_prefix().as_bytes());
    hasher
}

fn search(
    base: &Sha256,
    bits: u32,
    start: u64,
    stride: u64,
    cancel: &CancelToken,
    deadline: Option<Instant>,
    found: &AtomicBool,
) -> Result<Seal, ChainError> {
    let mut nonce = start;
    let mut attempts: u64 = 0;
    loop {
        if cancel.is_cancelled() || found.load(Ordering::Relaxed) {
            return Err(ChainError::MiningCancelled);
        }
        if attempts % DEADLINE_CHECK_INTERVAL == 0 {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(ChainError::MiningTimedOut);
                }
            }
        }

        let mut hasher = base.clone();
        hasher.update(nonce.to_le_bytes());
        let hash: Sha256Hash = hasher.finalize().into();
        if meets_target(&hash, bits) {
            found.store(true, Ordering::Relaxed);
            return Ok(Seal { nonce, hash });
        }

        attempts += 1;
        nonce = nonce.checked_add(stride).ok_or_else(|| {
            ChainError::InvalidBlock("Nonce space exhausted".to_string())
        })?;
    }
}
