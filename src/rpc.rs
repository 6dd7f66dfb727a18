//! RPC call surface.
//!
//! One tagged call type carrying opaque request bytes, answered with a status code and
//! opaque response bytes. Request and response bodies are bincode. Serving these over a
//! socket or HTTP is left to the embedding process; [`RpcHandler`] only dispatches.

use crate::blockchain::{AppendOutcome, Block, Receipt};
use crate::crypto::Sha256Hash;
use crate::error::ChainError;
use crate::network::{Message, Transport, PROTOCOL_VERSION};
use crate::sync::SyncContext;
use crate::transaction::SignedTx;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    SyncGenesis,
    SyncPeers,
    AddPeer,
    TxAdd,
    BlockAdd,
    BlockGet,
    TxGet,
    Invite,
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    /// The request body could not be decoded.
    BadRequest,
    NotFound,
    /// The request was well-formed but failed validation.
    Rejected,
    Internal,
}

impl StatusCode {
    pub fn for_error(err: &ChainError) -> Self {
        if err.is_validation() {
            StatusCode::Rejected
        } else if err.is_not_found() {
            StatusCode::NotFound
        } else if matches!(err, ChainError::SerializationError(_) | ChainError::ProtocolError(_)) {
            StatusCode::BadRequest
        } else {
            StatusCode::Internal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCall {
    pub kind: CallKind,
    pub payload: Vec<u8>,
}

impl RpcCall {
    pub fn new(kind: CallKind, payload: Vec<u8>) -> Self {
        RpcCall { kind, payload }
    }

    /// A call whose body is `body` in bincode.
    pub fn with_body<B: Serialize>(kind: CallKind, body: &B) -> Result<Self, ChainError> {
        Ok(RpcCall::new(kind, bincode::serialize(body)?))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ChainError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChainError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub status: StatusCode,
    /// Response body on success, the error message otherwise.
    pub payload: Vec<u8>,
}

impl RpcResponse {
    pub fn ok(payload: Vec<u8>) -> Self {
        RpcResponse {
            status: StatusCode::Ok,
            payload,
        }
    }

    pub fn error(err: &ChainError) -> Self {
        RpcResponse {
            status: StatusCode::for_error(err),
            payload: err.to_string().into_bytes(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == StatusCode::Ok
    }

    /// Decodes a successful body.
    pub fn body<B: DeserializeOwned>(&self) -> Result<B, ChainError> {
        if !self.is_ok() {
            return Err(ChainError::NetworkError(format!(
                "{:?}: {}",
                self.status,
                String::from_utf8_lossy(&self.payload)
            )));
        }
        Ok(bincode::deserialize(&self.payload)?)
    }
}

/// Which block a `BlockGet` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockQuery {
    Tip,
    Hash(Sha256Hash),
    Number(u64),
}

/// `TxGet` answer. `receipt` is `None` while the transaction is still pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLookup {
    pub tx: SignedTx,
    pub receipt: Option<Receipt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub node_version: String,
    pub protocol_version: u8,
    pub chain_id: u64,
    pub best_height: u64,
    pub tip: Sha256Hash,
}

pub struct RpcHandler<T: Transport> {
    ctx: Arc<SyncContext<T>>,
}

impl<T: Transport> RpcHandler<T> {
    pub fn new(ctx: Arc<SyncContext<T>>) -> Self {
        RpcHandler { ctx }
    }

    pub async fn handle(&self, call: RpcCall) -> RpcResponse {
        debug!("RPC {:?} ({} bytes)", call.kind, call.payload.len());
        match self.dispatch(call).await {
            Ok(payload) => RpcResponse::ok(payload),
            Err(e) => {
                warn!("RPC failed: {}", e);
                RpcResponse::error(&e)
            }
        }
    }

    async fn dispatch(&self, call: RpcCall) -> Result<Vec<u8>, ChainError> {
        let chain = self.ctx.chain();
        match call.kind {
            CallKind::SyncGenesis => Ok(chain.genesis().to_json()?.into_bytes()),
            CallKind::SyncPeers => encode(&self.ctx.peers().addrs()),
            CallKind::AddPeer => {
                let addr: String = decode(&call.payload)?;
                let added = self.ctx.peers().add_peer(&addr)?;
                if added {
                    let hello = Message::version(self.ctx.local_addr(), chain.best_height());
                    self.ctx.send_to(&addr, &hello).await;
                }
                encode(&added)
            }
            CallKind::TxAdd => {
                let tx = SignedTx::from_bytes(&call.payload)?;
                let receipt = self.ctx.submit_transaction(tx).await?;
                encode(&receipt)
            }
            CallKind::BlockAdd => {
                let block = Block::from_bytes(&call.payload)?;
                let length = match chain.append(&block)? {
                    AppendOutcome::Extended { length, .. } => {
                        self.ctx.pool().reconcile(&block);
                        self.ctx.announce_block(&block).await;
                        length
                    }
                    AppendOutcome::AlreadyKnown => chain.length(),
                };
                encode(&length)
            }
            CallKind::BlockGet => {
                let block = match decode::<BlockQuery>(&call.payload)? {
                    BlockQuery::Tip => chain.get_block(&chain.tip_hash())?,
                    BlockQuery::Hash(hash) => chain.get_block(&hash)?,
                    BlockQuery::Number(number) => chain.get_block_by_number(number)?,
                };
                block.to_bytes()
            }
            CallKind::TxGet => {
                let hash: Sha256Hash = decode(&call.payload)?;
                let tx = match self.ctx.pool().get(&hash) {
                    Some(tx) => tx,
                    None => chain.transaction(&hash)?,
                };
                let receipt = match chain.receipt(&hash) {
                    Ok(receipt) => Some(receipt),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e),
                };
                encode(&TxLookup { tx, receipt })
            }
            CallKind::Invite => {
                let addr: String = decode(&call.payload)?;
                self.ctx.peers().add_peer(&addr)?;
                self.ctx.share_peers(&addr).await;
                encode(&())
            }
            CallKind::Version => encode(&VersionInfo {
                node_version: env!("CARGO_PKG_VERSION").to_string(),
                protocol_version: PROTOCOL_VERSION,
                chain_id: chain.genesis().chain_id,
                best_height: chain.best_height(),
                tip: chain.tip_hash(),
            }),
        }
    }
}

fn encode<B: Serialize>(body: &B) -> Result<Vec<u8>, ChainError> {
    Ok(bincode::serialize(body)?)
}

fn decode<B: DeserializeOwned>(bytes: &[u8]) -> Result<B, ChainError> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::ChainManager;
    use crate::crypto::{Address, KeyPair};
    use crate::genesis::Genesis;
    use crate::mempool::PendingPool;
    use crate::miner::CancelToken;
    use crate::network::{LocalNetwork, LocalTransport, Payload, PeerSet};
    use crate::persistence::Store;
    use crate::sync::SyncConfig;
    use crate::transaction::Transaction;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    struct Fixture {
        rpc: RpcHandler<LocalTransport>,
        ctx: Arc<SyncContext<LocalTransport>>,
        net: LocalNetwork,
        alice: KeyPair,
        bob: Address,
        _inbox: Receiver<Message>,
    }

    fn fixture() -> Fixture {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap().address();
        let genesis = Genesis::dev(alice.address(), 1, &[(alice.address(), 1_000)]);
        let chain = Arc::new(ChainManager::initialize(Store::memory(), genesis).unwrap());
        let pool = Arc::new(PendingPool::new(chain.clone()));
        let net = LocalNetwork::new();
        let (transport, inbox) = net.join("node");
        let ctx = Arc::new(SyncContext::new(
            chain,
            pool,
            Arc::new(PeerSet::default()),
            Arc::new(transport),
            SyncConfig::default(),
        ));
        Fixture {
            rpc: RpcHandler::new(ctx.clone()),
            ctx,
            net,
            alice,
            bob,
            _inbox: inbox,
        }
    }

    fn pay(f: &Fixture, nonce: u64, value: u64) -> SignedTx {
        SignedTx::sign(
            Transaction::new(f.alice.address(), f.bob, nonce, value, 1, 1),
            &f.alice,
        )
    }

    #[tokio::test]
    async fn test_version_and_genesis() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let f = fixture();
            let info: VersionInfo = f
                .rpc
                .handle(RpcCall::new(CallKind::Version, vec![]))
                .await
                .body()
                .unwrap();
            assert_eq!(info.best_height, 0);
            assert_eq!(info.chain_id, 1337);
            assert_eq!(info.protocol_version, PROTOCOL_VERSION);

            let genesis = f.rpc.handle(RpcCall::new(CallKind::SyncGenesis, vec![])).await;
            assert!(genesis.is_ok());
            let parsed = Genesis::from_json(&String::from_utf8(genesis.payload).unwrap()).unwrap();
            assert_eq!(&parsed, f.ctx.chain().genesis());
        })
        .await
        .expect("test_version_and_genesis timed out");
    }

    #[tokio::test]
    async fn test_tx_add_and_get() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let f = fixture();
            let tx = pay(&f, 1, 100);
            let call = RpcCall::new(CallKind::TxAdd, tx.to_bytes().unwrap());
            let receipt: Receipt = f.rpc.handle(call).await.body().unwrap();
            assert_eq!(receipt.post_balance, 899);

            let call = RpcCall::with_body(CallKind::TxGet, &tx.hash()).unwrap();
            let lookup: TxLookup = f.rpc.handle(call).await.body().unwrap();
            assert_eq!(lookup.tx, tx);
            assert!(lookup.receipt.is_none());
        })
        .await
        .expect("test_tx_add_and_get timed out");
    }

    #[tokio::test]
    async fn test_status_codes() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let f = fixture();
            let overdraft = pay(&f, 1, 5_000);
            let response = f
                .rpc
                .handle(RpcCall::new(CallKind::TxAdd, overdraft.to_bytes().unwrap()))
                .await;
            assert_eq!(response.status, StatusCode::Rejected);

            let missing = RpcCall::with_body(CallKind::BlockGet, &BlockQuery::Number(9)).unwrap();
            assert_eq!(f.rpc.handle(missing).await.status, StatusCode::NotFound);

            let garbage = RpcCall::new(CallKind::BlockAdd, vec![1, 2, 3]);
            assert_eq!(f.rpc.handle(garbage).await.status, StatusCode::BadRequest);
        })
        .await
        .expect("test_status_codes timed out");
    }

    #[tokio::test]
    async fn test_block_add_and_get() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let f = fixture();
            let block = f
                .ctx
                .chain()
                .mine_block(vec![pay(&f, 1, 10)], f.bob, 1, &CancelToken::new(), None)
                .unwrap();

            let add = RpcCall::new(CallKind::BlockAdd, block.to_bytes().unwrap());
            let length: u64 = f.rpc.handle(add.clone()).await.body().unwrap();
            assert_eq!(length, 2);
            // Re-adding is a no-op.
            let again: u64 = f.rpc.handle(add).await.body().unwrap();
            assert_eq!(again, 2);

            let get = RpcCall::with_body(CallKind::BlockGet, &BlockQuery::Tip).unwrap();
            let response = f.rpc.handle(get).await;
            assert!(response.is_ok());
            assert_eq!(Block::from_bytes(&response.payload).unwrap(), block);
        })
        .await
        .expect("test_block_add_and_get timed out");
    }

    #[tokio::test]
    async fn test_invite_shares_peer_list() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let f = fixture();
            let (_guest, mut guest_inbox) = f.net.join("guest");
            f.ctx.peers().add_peer("elsewhere").unwrap();

            let call = RpcCall::with_body(CallKind::Invite, &"guest".to_string()).unwrap();
            assert!(f.rpc.handle(call).await.is_ok());

            let message = guest_inbox.recv().await.unwrap();
            match message.payload {
                Payload::Addr(addr) => {
                    assert!(addr.peers.contains(&"elsewhere".to_string()));
                    assert!(addr.peers.contains(&"node".to_string()));
                }
                other => panic!("unexpected payload {:?}", other),
            }

            let peers: Vec<String> = f
                .rpc
                .handle(RpcCall::new(CallKind::SyncPeers, vec![]))
                .await
                .body()
                .unwrap();
            assert!(peers.contains(&"guest".to_string()));
        })
        .await
        .expect("test_invite_shares_peer_list timed out");
    }
}
