//! Database persistence layer for NetherChain
//!
//! The chain manager and state engine only need an ordered key-value store with prefix
//! scans and all-or-nothing write batches. [`KvBackend`] is that contract; [`Store`]
//! wraps a backend and adds typed helpers plus [`Store::update`], which runs a closure
//! against a read-your-writes [`Txn`] and commits every write together or none of them.

use crate::error::ChainError;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Key layout. Every purpose lives under its own prefix so a prefix scan never mixes them.
pub mod keys {
    use crate::crypto::{Address, Sha256Hash};

    /// Hash of the canonical tip.
    pub const TIP: &[u8] = b"lh";
    /// Number of blocks in the canonical chain, genesis included.
    pub const CHAIN_LENGTH: &[u8] = b"cl";
    /// Genesis record the chain was bootstrapped from.
    pub const GENESIS: &[u8] = b"g";

    pub const BALANCES_PREFIX: &[u8] = b"balances/";
    pub const TX_PREFIX: &[u8] = b"tx/";
    pub const RECEIPT_PREFIX: &[u8] = b"receipt/";
    pub const PEERS_PREFIX: &[u8] = b"peers/";

    /// Blocks are keyed by their raw 32-byte hash.
    pub fn block(hash: &Sha256Hash) -> Vec<u8> {
        hash.to_vec()
    }

    pub fn balance(address: &Address) -> Vec<u8> {
        [BALANCES_PREFIX, address.encode().as_bytes()].concat()
    }

    pub fn transaction(hash: &Sha256Hash) -> Vec<u8> {
        [TX_PREFIX, hash.as_slice()].concat()
    }

    pub fn receipt(hash: &Sha256Hash) -> Vec<u8> {
        [RECEIPT_PREFIX, hash.as_slice()].concat()
    }

    pub fn peer(peer_id: &str) -> Vec<u8> {
        [PEERS_PREFIX, peer_id.as_bytes()].concat()
    }
}

/// Pending writes; `None` marks a delete.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.insert(key, None);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Option<Vec<u8>>)> {
        self.ops.iter()
    }
}

/// Storage engine contract: ordered keys, prefix scans, atomic batches.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError>;

    /// All pairs whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError>;

    /// Applies every write in `batch` or none of them.
    fn commit(&self, batch: WriteBatch) -> Result<(), ChainError>;
}

/// rusqlite-backed engine: a single `kv` table of BLOB keys and values.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, ChainError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, ChainError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create kv table: {}", e)))?;

        Ok(SqliteBackend {
            conn: Mutex::new(conn),
        })
    }
}

impl KvBackend for SqliteBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get::<_, Vec<u8>>(0)
        })
        .optional()
        .map_err(|e| ChainError::DatabaseError(format!("Failed to read key: {}", e)))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key ASC")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let mut rows = stmt
            .query(params![prefix])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to scan prefix: {}", e)))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?
        {
            let key: Vec<u8> = row.get(0)?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, row.get(1)?));
        }
        Ok(out)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), ChainError> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to start transaction: {}", e))
        })?;

        for (key, op) in batch.iter() {
            match op {
                Some(value) => tx.execute(
                    "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                    params![key, value],
                ),
                None => tx.execute("DELETE FROM kv WHERE key = ?1", params![key]),
            }
            .map_err(|e| ChainError::DatabaseError(format!("Failed to write key: {}", e)))?;
        }

        // Dropping `tx` without commit rolls everything back.
        tx.commit().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to commit transaction: {}", e))
        })
    }
}

/// Simple in-memory engine useful for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), ChainError> {
        let mut entries = self.entries.write();
        for (key, op) in batch.ops {
            match op {
                Some(value) => entries.insert(key, value),
                None => entries.remove(&key),
            };
        }
        Ok(())
    }
}

/// Shared handle to a storage engine. Clones share one writer lock, so updates made
/// through any clone never interleave.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn KvBackend>,
    writer: Arc<Mutex<()>>,
}

impl Store {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Store {
            backend,
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn sqlite(path: &Path) -> Result<Self, ChainError> {
        Ok(Self::new(Arc::new(SqliteBackend::open(path)?)))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        self.backend.get(key)
    }

    pub fn get_decoded<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, ChainError> {
        match self.backend.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool, ChainError> {
        Ok(self.backend.get(key)?.is_some())
    }

    pub fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        self.backend.scan_prefix(prefix)
    }

    /// Runs `f` against a transaction and commits its writes atomically.
    /// If `f` fails nothing is written. Updates are serialized from the first read to
    /// the commit; `f` must not start another update on this store.
    pub fn update<T, F>(&self, f: F) -> Result<T, ChainError>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, ChainError>,
    {
        let _writer = self.writer.lock();
        let mut txn = Txn::new(self.backend.as_ref());
        let out = f(&mut txn)?;
        let batch = txn.into_batch();
        if !batch.is_empty() {
            self.backend.commit(batch)?;
        }
        Ok(out)
    }

    /// Runs `f` against a transaction whose writes are always discarded.
    pub fn dry_run<T, F>(&self, f: F) -> Result<T, ChainError>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, ChainError>,
    {
        let mut txn = Txn::new(self.backend.as_ref());
        f(&mut txn)
    }
}

/// Read-your-writes view over a backend; writes stay buffered until commit.
pub struct Txn<'a> {
    backend: &'a dyn KvBackend,
    batch: WriteBatch,
}

impl<'a> Txn<'a> {
    fn new(backend: &'a dyn KvBackend) -> Self {
        Txn {
            backend,
            batch: WriteBatch::new(),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        match self.batch.ops.get(key) {
            Some(op) => Ok(op.clone()),
            None => self.backend.get(key),
        }
    }

    pub fn get_decoded<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, ChainError> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.batch.set(key, value);
    }

    pub fn put_encoded<T: Serialize>(&mut self, key: Vec<u8>, value: &T) -> Result<(), ChainError> {
        let bytes = bincode::serialize(value)?;
        self.batch.set(key, bytes);
        Ok(())
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.batch.delete(key);
    }

    /// Prefix scan that reflects this transaction's own pending writes.
    pub fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.backend.scan_prefix(prefix)?.into_iter().collect();
        for (key, op) in self.batch.ops.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match op {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        Ok(merged.into_iter().collect())
    }

    fn into_batch(self) -> WriteBatch {
        self.batch
    }
}

/// Exclusive ownership marker for a data directory.
///
/// Holds `<dir>/LOCK` for its lifetime. The file records the owner's pid. A lock whose
/// owner is no longer running is cleared once; a live owner, or a second failure, ends
/// the open with `StoreLocked`.
#[derive(Debug)]
pub struct DataDirLock {
    path: PathBuf,
}

impl DataDirLock {
    pub const FILE_NAME: &'static str = "LOCK";

    pub fn acquire(dir: &Path) -> Result<Self, ChainError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);

        match Self::try_create(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if let Some(pid) = Self::live_holder(&path) {
                    return Err(ChainError::StoreLocked(format!(
                        "{} is held by running process {}",
                        path.display(),
                        pid
                    )));
                }
                warn!("Found existing lock at {}; treating it as stale and retrying once", path.display());
                fs::remove_file(&path)?;
                Self::try_create(&path)
                    .map_err(|e| ChainError::StoreLocked(format!("{}: {}", path.display(), e)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_create(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", std::process::id())?;
        info!("Acquired data directory lock {}", path.display());
        Ok(DataDirLock {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid recorded in the lock file if that process still runs. Without `/proc` only
    /// our own pid is recognized.
    fn live_holder(path: &Path) -> Option<u32> {
        let pid: u32 = fs::read_to_string(path).ok()?.trim().parse().ok()?;
        if pid == std::process::id() {
            return Some(pid);
        }
        let proc_root = Path::new("/proc");
        (proc_root.is_dir() && proc_root.join(pid.to_string()).exists()).then_some(pid)
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// Opens the SQLite store inside `dir`, taking the directory lock first.
pub fn open_data_dir(dir: &Path) -> Result<(Store, DataDirLock), ChainError> {
    let lock = DataDirLock::acquire(dir)?;
    let store = Store::sqlite(&dir.join("chain.db"))?;
    Ok((store, lock))
}
