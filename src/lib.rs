//! NetherChain - a proof-of-work account ledger with peer-to-peer synchronization
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`blockchain`] - Chain manager, account state and block validation
//! - [`transaction`] - Transaction types, signing and reward transactions
//! - [`genesis`] - Genesis file and genesis block
//! - [`mempool`] - Pending transaction pool
//!
//! ## Consensus
//! - [`miner`] - Proof-of-work target and cancellable mining
//!
//! ## Cryptography & Encoding
//! - [`crypto`] - Hashing, secp256k1 signatures and base58check addresses
//! - [`encoding`] - Canonical, versioned encoding used for every hash
//!
//! ## State Management
//! - [`persistence`] - Key-value store (SQLite, in-memory) and data directory lock
//! - [`cache`] - Block cache
//!
//! ## Networking
//! - [`network`] - Wire messages, known peers and transports
//! - [`sync`] - Gossip, block download and the mining trigger
//! - [`rpc`] - Tagged RPC calls onto the core operations
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`node`] - Node orchestration
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod genesis;
pub mod mempool;
pub mod transaction;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod miner;

// ============================================================================
// Cryptography & Encoding
// ============================================================================
pub mod crypto;
pub mod encoding;

// ============================================================================
// State Management
// ============================================================================
pub mod cache;
pub mod persistence;

// ============================================================================
// Networking
// ============================================================================
pub mod network;
pub mod rpc;
pub mod sync;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
pub mod node;
