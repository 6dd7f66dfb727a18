//! Peer-to-peer wire messages.
//!
//! Frame layout: `[command: 12 bytes ASCII, zero-padded][version: u8][body: bincode]`.
//! The body is `(addr_from, command-specific payload)`. One frame travels per
//! connection, so no length prefix is needed; readers bound the frame at
//! [`MAX_MESSAGE_SIZE`].

use crate::blockchain::Block;
use crate::crypto::Sha256Hash;
use crate::error::ChainError;
use crate::transaction::SignedTx;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const COMMAND_LENGTH: usize = 12;
pub const PROTOCOL_VERSION: u8 = 1;
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    Addr,
    GetBlocks,
    Inv,
    GetData,
    Block,
    Tx,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::Version,
        Command::Addr,
        Command::GetBlocks,
        Command::Inv,
        Command::GetData,
        Command::Block,
        Command::Tx,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Addr => "addr",
            Command::GetBlocks => "getblocks",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::Block => "block",
            Command::Tx => "tx",
        }
    }

    pub fn to_bytes(&self) -> [u8; COMMAND_LENGTH] {
        let mut out = [0u8; COMMAND_LENGTH];
        let tag = self.tag().as_bytes();
        out[..tag.len()].copy_from_slice(tag);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        if bytes.len() != COMMAND_LENGTH {
            return Err(ChainError::ProtocolError(format!(
                "command field must be {} bytes, got {}",
                COMMAND_LENGTH,
                bytes.len()
            )));
        }
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(COMMAND_LENGTH);
        if bytes[end..].iter().any(|b| *b != 0) {
            return Err(ChainError::ProtocolError("command is not zero-padded".to_string()));
        }
        let tag = &bytes[..end];
        Self::ALL
            .into_iter()
            .find(|c| c.tag().as_bytes() == tag)
            .ok_or_else(|| {
                ChainError::ProtocolError(format!(
                    "unknown command {:?}",
                    String::from_utf8_lossy(tag)
                ))
            })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvKind {
    Block,
    Tx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPayload {
    /// Number of the sender's newest block.
    pub best_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrPayload {
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvPayload {
    pub kind: InvKind,
    pub items: Vec<Sha256Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataPayload {
    pub kind: InvKind,
    pub id: Sha256Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPayload {
    #[serde(with = "serde_bytes")]
    pub block: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPayload {
    #[serde(with = "serde_bytes")]
    pub tx: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Version(VersionPayload),
    Addr(AddrPayload),
    GetBlocks,
    Inv(InvPayload),
    GetData(GetDataPayload),
    Block(BlockPayload),
    Tx(TxPayload),
}

impl Payload {
    pub fn command(&self) -> Command {
        match self {
            Payload::Version(_) => Command::Version,
            Payload::Addr(_) => Command::Addr,
            Payload::GetBlocks => Command::GetBlocks,
            Payload::Inv(_) => Command::Inv,
            Payload::GetData(_) => Command::GetData,
            Payload::Block(_) => Command::Block,
            Payload::Tx(_) => Command::Tx,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub addr_from: String,
    pub payload: Payload,
}

impl Message {
    pub fn new(addr_from: impl Into<String>, payload: Payload) -> Self {
        Message {
            addr_from: addr_from.into(),
            payload,
        }
    }

    pub fn version(addr_from: impl Into<String>, best_height: u64) -> Self {
        Self::new(addr_from, Payload::Version(VersionPayload { best_height }))
    }

    pub fn addr(addr_from: impl Into<String>, peers: Vec<String>) -> Self {
        Self::new(addr_from, Payload::Addr(AddrPayload { peers }))
    }

    pub fn get_blocks(addr_from: impl Into<String>) -> Self {
        Self::new(addr_from, Payload::GetBlocks)
    }

    pub fn inv(addr_from: impl Into<String>, kind: InvKind, items: Vec<Sha256Hash>) -> Self {
        Self::new(addr_from, Payload::Inv(InvPayload { kind, items }))
    }

    pub fn get_data(addr_from: impl Into<String>, kind: InvKind, id: Sha256Hash) -> Self {
        Self::new(addr_from, Payload::GetData(GetDataPayload { kind, id }))
    }

    pub fn block(addr_from: impl Into<String>, block: &Block) -> Result<Self, ChainError> {
        Ok(Self::new(
            addr_from,
            Payload::Block(BlockPayload {
                block: block.to_bytes()?,
            }),
        ))
    }

    pub fn tx(addr_from: impl Into<String>, tx: &SignedTx) -> Result<Self, ChainError> {
        Ok(Self::new(addr_from, Payload::Tx(TxPayload { tx: tx.to_bytes()? })))
    }

    pub fn command(&self) -> Command {
        self.payload.command()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ChainError> {
        let mut out = Vec::with_capacity(COMMAND_LENGTH + 64);
        out.extend_from_slice(&self.command().to_bytes());
        out.push(PROTOCOL_VERSION);

        let body = match &self.payload {
            Payload::Version(p) => bincode::serialize(&(&self.addr_from, p)),
            Payload::Addr(p) => bincode::serialize(&(&self.addr_from, p)),
            Payload::GetBlocks => bincode::serialize(&(&self.addr_from, ())),
            Payload::Inv(p) => bincode::serialize(&(&self.addr_from, p)),
            Payload::GetData(p) => bincode::serialize(&(&self.addr_from, p)),
            Payload::Block(p) => bincode::serialize(&(&self.addr_from, p)),
            Payload::Tx(p) => bincode::serialize(&(&self.addr_from, p)),
        }?;
        out.extend_from_slice(&body);

        if out.len() > MAX_MESSAGE_SIZE {
            return Err(ChainError::ProtocolError(format!(
                "message of {} bytes exceeds limit of {}",
                out.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChainError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ChainError::ProtocolError(format!(
                "message of {} bytes exceeds limit of {}",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        if bytes.len() < COMMAND_LENGTH + 1 {
            return Err(ChainError::ProtocolError("truncated message header".to_string()));
        }

        let command = Command::from_bytes(&bytes[..COMMAND_LENGTH])?;
        let version = bytes[COMMAND_LENGTH];
        if version != PROTOCOL_VERSION {
            return Err(ChainError::ProtocolError(format!(
                "unsupported protocol version {}",
                version
            )));
        }
        let body = &bytes[COMMAND_LENGTH + 1..];

        let (addr_from, payload) = match command {
            Command::Version => with_payload(body, Payload::Version)?,
            Command::Addr => with_payload(body, Payload::Addr)?,
            Command::GetBlocks => {
                let (from, ()) = decode_body::<()>(body)?;
                (from, Payload::GetBlocks)
            }
            Command::Inv => with_payload(body, Payload::Inv)?,
            Command::GetData => with_payload(body, Payload::GetData)?,
            Command::Block => with_payload(body, Payload::Block)?,
            Command::Tx => with_payload(body, Payload::Tx)?,
        };
        Ok(Message { addr_from, payload })
    }
}

fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<(String, T), ChainError> {
    bincode::deserialize(body)
        .map_err(|e| ChainError::ProtocolError(format!("malformed payload: {}", e)))
}

fn with_payload<T: DeserializeOwned>(
    body: &[u8],
    wrap: fn(T) -> Payload,
) -> Result<(String, Payload), ChainError> {
    let (from, inner) = decode_body::<T>(body)?;
    Ok((from, wrap(inner)))
}

impl BlockPayload {
    pub fn decode(&self) -> Result<Block, ChainError> {
        Block::from_bytes(&self.block)
            .map_err(|e| ChainError::ProtocolError(format!("malformed block: {}", e)))
    }
}

impl TxPayload {
    pub fn decode(&self) -> Result<SignedTx, ChainError> {
        SignedTx::from_bytes(&self.tx)
            .map_err(|e| ChainError::ProtocolError(format!("malformed transaction: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tags_are_zero_padded() {
        let bytes = Command::GetBlocks.to_bytes();
        assert_eq!(&bytes[..9], b"getblocks");
        assert!(bytes[9..].iter().all(|b| *b == 0));
        for command in Command::ALL {
            assert_eq!(Command::from_bytes(&command.to_bytes()).unwrap(), command);
        }
    }

    #[test]
    fn test_frame_layout() {
        let msg = Message::version("10.0.0.1:3000", 42);
        let bytes = msg.encode().unwrap();

        assert_eq!(&bytes[..7], b"version");
        assert_eq!(bytes[COMMAND_LENGTH], PROTOCOL_VERSION);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_inv_and_getdata_roundtrip() {
        let inv = Message::inv("a", InvKind::Block, vec![[1u8; 32], [2u8; 32]]);
        assert_eq!(Message::decode(&inv.encode().unwrap()).unwrap(), inv);

        let get = Message::get_data("a", InvKind::Tx, [3u8; 32]);
        assert_eq!(Message::decode(&get.encode().unwrap()).unwrap(), get);

        let empty = Message::get_blocks("b");
        assert_eq!(Message::decode(&empty.encode().unwrap()).unwrap(), empty);
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        let mut bytes = Message::get_blocks("a").encode().unwrap();
        bytes[..COMMAND_LENGTH].copy_from_slice(b"launchmissle");
        assert!(matches!(
            Message::decode(&bytes),
            Err(ChainError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_malformed_body_is_protocol_error() {
        let mut bytes = Message::inv("a", InvKind::Block, vec![[1u8; 32]]).encode().unwrap();
        bytes.truncate(bytes.len() - 5);
        assert!(matches!(
            Message::decode(&bytes),
            Err(ChainError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut bytes = Message::get_blocks("a").encode().unwrap();
        bytes[COMMAND_LENGTH] = PROTOCOL_VERSION + 1;
        assert!(matches!(
            Message::decode(&bytes),
            Err(ChainError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(matches!(
            Message::decode(b"tx"),
            Err(ChainError::ProtocolError(_))
        ));
    }
}
