//! Cryptographic primitives for NetherChain

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use ripemd::Ripemd160;
use secp256k1::{
    constants::{PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::{RecoverableSignature, RecoveryId},
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A thread-safe, lazily initialized Secp256k1 context.
/// This prevents repeated, unnecessary context creation.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

pub type Sha256Hash = [u8; 32];

pub const ZERO_HASH: Sha256Hash = [0u8; 32];

/// Recoverable signature layout: `recovery_id || r || s`.
pub const SIGNATURE_SIZE: usize = 65;

pub const ADDRESS_VERSION: u8 = 0x00;
pub const PUBKEY_HASH_SIZE: usize = 20;
pub const ADDRESS_CHECKSUM_SIZE: usize = 4;

pub fn sha256(data: &[u8]) -> Sha256Hash {
    Sha256::digest(data).into()
}

pub fn double_sha256(data: &[u8]) -> Sha256Hash {
    sha256(&sha256(data))
}

/// RIPEMD160(SHA256(data)), the public-key hash behind every address.
pub fn hash160(data: &[u8]) -> [u8; PUBKEY_HASH_SIZE] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

/// Account identifier: the hash of a compressed public key.
///
/// Rendered as base58(`version || pubkey_hash || checksum`) where the checksum is the
/// first four bytes of a double SHA-256 over `version || pubkey_hash`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; PUBKEY_HASH_SIZE]);

impl Address {
    /// Sender of reward transactions.
    pub const ZERO: Address = Address([0u8; PUBKEY_HASH_SIZE]);

    pub fn from_pubkey_hash(hash: [u8; PUBKEY_HASH_SIZE]) -> Self {
        Address(hash)
    }

    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Address(hash160(&public_key.serialize()))
    }

    pub fn pubkey_hash(&self) -> &[u8; PUBKEY_HASH_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; PUBKEY_HASH_SIZE]
    }

    fn checksum(versioned: &[u8]) -> [u8; ADDRESS_CHECKSUM_SIZE] {
        let digest = double_sha256(versioned);
        let mut out = [0u8; ADDRESS_CHECKSUM_SIZE];
        out.copy_from_slice(&digest[..ADDRESS_CHECKSUM_SIZE]);
        out
    }

    pub fn encode(&self) -> String {
        let mut payload = Vec::with_capacity(1 + PUBKEY_HASH_SIZE + ADDRESS_CHECKSUM_SIZE);
        payload.push(ADDRESS_VERSION);
        payload.extend_from_slice(&self.0);
        let checksum = Self::checksum(&payload);
        payload.extend_from_slice(&checksum);
        bs58::encode(payload).into_string()
    }

    /// Parses and checksum-validates a base58 address.
    pub fn decode(s: &str) -> Result<Self, ChainError> {
        let payload = bs58::decode(s)
            .into_vec()
            .map_err(|e| ChainError::InvalidAddress(format!("{}: {}", s, e)))?;

        if payload.len() != 1 + PUBKEY_HASH_SIZE + ADDRESS_CHECKSUM_SIZE {
            return Err(ChainError::InvalidAddress(format!(
                "{}: decoded length {} is not {}",
                s,
                payload.len(),
                1 + PUBKEY_HASH_SIZE + ADDRESS_CHECKSUM_SIZE
            )));
        }
        if payload[0] != ADDRESS_VERSION {
            return Err(ChainError::InvalidAddress(format!(
                "{}: unknown version byte {:#04x}",
                s, payload[0]
            )));
        }

        let (versioned, checksum) = payload.split_at(1 + PUBKEY_HASH_SIZE);
        if Self::checksum(versioned) != checksum {
            return Err(ChainError::InvalidAddress(format!("{}: checksum mismatch", s)));
        }

        let mut hash = [0u8; PUBKEY_HASH_SIZE];
        hash.copy_from_slice(&versioned[1..]);
        Ok(Address(hash))
    }

    pub fn is_valid(s: &str) -> bool {
        Self::decode(s).is_ok()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.encode())
    }
}

impl FromStr for Address {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::decode(s)
    }
}

impl TryFrom<String> for Address {
    type Error = ChainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::decode(&s)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.encode()
    }
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Result<Self, ChainError> {
        let secret_key = SecretKey::new(&mut OsRng);
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);

        Ok(KeyPair {
            secret_key,
            public_key,
        })
    }

    /// Creates a KeyPair from an existing SecretKey.
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    /// Creates a KeyPair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;

        Ok(Self::from_secret_key(secret_key))
    }

    pub fn from_secret_hex(hex_str: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| ChainError::CryptoError(format!("Invalid secret key hex: {}", e)))?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public_key)
    }

    /// Returns the KeyPair's public key as a compressed byte array.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Signs a 32-byte digest, producing a recoverable signature.
    pub fn sign_digest(&self, digest: &Sha256Hash) -> [u8; SIGNATURE_SIZE] {
        let message = Message::from_digest(*digest);
        let signature = SECP256K1_CONTEXT.sign_ecdsa_recoverable(&message, &self.secret_key);
        let (recovery_id, compact) = signature.serialize_compact();

        let mut out = [0u8; SIGNATURE_SIZE];
        out[0] = recovery_id.to_i32() as u8;
        out[1..].copy_from_slice(&compact);
        out
    }
}

/// Recovers the public key that produced `signature` over `digest`.
pub fn recover_public_key(digest: &Sha256Hash, signature: &[u8]) -> Result<PublicKey, ChainError> {
    if signature.len() != SIGNATURE_SIZE {
        return Err(ChainError::InvalidSignature);
    }

    let recovery_id =
        RecoveryId::from_i32(signature[0] as i32).map_err(|_| ChainError::InvalidSignature)?;
    let signature = RecoverableSignature::from_compact(&signature[1..], recovery_id)
        .map_err(|_| ChainError::InvalidSignature)?;

    SECP256K1_CONTEXT
        .recover_ecdsa(&Message::from_digest(*digest), &signature)
        .map_err(|_| ChainError::InvalidSignature)
}

/// Recovers the signer's address; fails with `InvalidSignature` when recovery is impossible.
pub fn recover_address(digest: &Sha256Hash, signature: &[u8]) -> Result<Address, ChainError> {
    recover_public_key(digest, signature).map(|pk| Address::from_public_key(&pk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let keypair = KeyPair::generate().unwrap();
        assert_eq!(keypair.public_key_bytes().len(), PUBLIC_KEY_SIZE);
        assert_eq!(keypair.secret_key.as_ref().len(), SECRET_KEY_SIZE);
    }

    #[test]
    fn test_address_text_form() {
        let keypair = KeyPair::generate().unwrap();
        let address = keypair.address();
        let text = address.to_string();

        let parsed: Address = text.parse().unwrap();
        assert_eq!(parsed, address);
        assert!(Address::is_valid(&text));
    }

    #[test]
    fn test_address_checksum_detects_typos() {
        let address = KeyPair::generate().unwrap().address();
        let mut payload = bs58::decode(address.to_string()).into_vec().unwrap();
        payload[5] ^= 0x01;
        let tampered = bs58::encode(payload).into_string();

        let err = Address::decode(&tampered).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_address_rejects_bad_length() {
        let short = bs58::encode([0u8; 10]).into_string();
        assert!(matches!(
            Address::decode(&short),
            Err(ChainError::InvalidAddress(_))
        ));
        assert!(Address::decode("0OIl").is_err());
    }

    #[test]
    fn test_sign_and_recover() {
        let keypair = KeyPair::generate().unwrap();
        let digest = sha256(b"Hello, NetherChain!");

        let signature = keypair.sign_digest(&digest);
        assert_eq!(signature.len(), SIGNATURE_SIZE);

        let recovered = recover_address(&digest, &signature).unwrap();
        assert_eq!(recovered, keypair.address());
    }

    #[test]
    fn test_recover_from_other_digest_gives_other_address() {
        let keypair = KeyPair::generate().unwrap();
        let signature = keypair.sign_digest(&sha256(b"original"));

        match recover_address(&sha256(b"tampered"), &signature) {
            Ok(address) => assert_ne!(address, keypair.address()),
            Err(e) => assert_eq!(e, ChainError::InvalidSignature),
        }
    }

    #[test]
    fn test_recover_rejects_malformed_signature() {
        let digest = sha256(b"x");
        assert_eq!(
            recover_address(&digest, &[0u8; 10]).unwrap_err(),
            ChainError::InvalidSignature
        );

        let mut bad_recovery_id = [1u8; SIGNATURE_SIZE];
        bad_recovery_id[0] = 9;
        assert_eq!(
            recover_address(&digest, &bad_recovery_id).unwrap_err(),
            ChainError::InvalidSignature
        );
    }

    #[test]
    fn test_from_secret_bytes_invalid_length() {
        let short_bytes = [0u8; SECRET_KEY_SIZE - 1];
        let result = KeyPair::from_secret_bytes(&short_bytes);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Secret key must be"));
    }

    #[test]
    fn test_secret_hex_roundtrip_keeps_address() {
        let keypair = KeyPair::generate().unwrap();
        let restored = KeyPair::from_secret_hex(&keypair.secret_hex()).unwrap();
        assert_eq!(restored.address(), keypair.address());
    }
}
