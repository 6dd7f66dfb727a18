//! Transaction module split into types and validation for better modularity

pub mod types;
pub mod validation;

pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Address, KeyPair};
    use crate::encoding::CanonicalEncode;
    use crate::error::ChainError;

    fn sample_tx(from: Address, to: Address) -> Transaction {
        Transaction::new(from, to, 1, 100, 2, 3).with_time(1_700_000_000_000)
    }

    #[test]
    fn test_hash_is_stable_across_reserialization() {
        let a = KeyPair::generate().unwrap().address();
        let b = KeyPair::generate().unwrap().address();
        let tx = sample_tx(a, b);

        let json = serde_json::to_string(&tx).unwrap();
        let from_json: Transaction = serde_json::from_str(&json).unwrap();
        let from_bincode: Transaction =
            bincode::deserialize(&bincode::serialize(&tx).unwrap()).unwrap();

        assert_eq!(tx.hash(), from_json.hash());
        assert_eq!(tx.hash(), from_bincode.hash());
    }

    #[test]
    fn test_hash_ignores_json_field_order() {
        let a = KeyPair::generate().unwrap().address();
        let b = KeyPair::generate().unwrap().address();
        let tx = sample_tx(a, b);

        let reordered = format!(
            r#"{{"time":{},"data":[],"fee_price":3,"fee":2,"value":100,"nonce":1,"to":"{}","from":"{}"}}"#,
            tx.time, b, a
        );
        let parsed: Transaction = serde_json::from_str(&reordered).unwrap();
        assert_eq!(parsed.hash(), tx.hash());
    }

    #[test]
    fn test_every_field_changes_hash() {
        let a = KeyPair::generate().unwrap().address();
        let b = KeyPair::generate().unwrap().address();
        let base = sample_tx(a, b);

        let variants = [
            Transaction { from: b, ..base.clone() },
            Transaction { to: a, ..base.clone() },
            Transaction { nonce: 2, ..base.clone() },
            Transaction { value: 101, ..base.clone() },
            Transaction { fee: 9, ..base.clone() },
            Transaction { fee_price: 9, ..base.clone() },
            Transaction { data: b"memo".to_vec(), ..base.clone() },
            Transaction { time: base.time + 1, ..base.clone() },
        ];
        for variant in &variants {
            assert_ne!(variant.hash(), base.hash());
        }
    }

    #[test]
    fn test_hash_preimage_is_versioned() {
        let tx = sample_tx(Address::ZERO, Address::ZERO);
        assert_eq!(tx.canonical_bytes()[0], crate::encoding::ENCODING_VERSION);
    }

    #[test]
    fn test_cost() {
        let tx = sample_tx(Address::ZERO, Address::ZERO);
        assert_eq!(tx.nether_used().unwrap(), 6);
        assert_eq!(tx.cost().unwrap(), 106);

        let overflowing = Transaction { fee: u64::MAX, fee_price: 2, ..tx };
        assert!(matches!(
            overflowing.cost(),
            Err(ChainError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_signed_tx_is_authentic() {
        let keypair = KeyPair::generate().unwrap();
        let to = KeyPair::generate().unwrap().address();
        let signed = SignedTx::sign(sample_tx(keypair.address(), to), &keypair);

        assert!(signed.is_authentic().unwrap());
        assert!(signed.validate().is_ok());
    }

    #[test]
    fn test_signature_from_other_key_is_forged() {
        let owner = KeyPair::generate().unwrap();
        let thief = KeyPair::generate().unwrap();
        let tx = sample_tx(owner.address(), thief.address());
        let forged = SignedTx::sign(tx, &thief);

        assert!(!forged.is_authentic().unwrap());
        assert_eq!(forged.validate().unwrap_err(), ChainError::ForgedTransaction);
    }

    #[test]
    fn test_garbage_signature_is_invalid() {
        let owner = KeyPair::generate().unwrap();
        let tx = sample_tx(owner.address(), Address::ZERO);
        let signed = SignedTx::new(tx, vec![0u8; 12]);

        assert_eq!(signed.is_authentic().unwrap_err(), ChainError::InvalidSignature);
    }

    #[test]
    fn test_tampering_after_signing_breaks_authenticity() {
        let keypair = KeyPair::generate().unwrap();
        let to = KeyPair::generate().unwrap().address();
        let mut signed = SignedTx::sign(sample_tx(keypair.address(), to), &keypair);
        signed.tx.value = 1_000_000;

        match signed.is_authentic() {
            Ok(authentic) => assert!(!authentic),
            Err(e) => assert_eq!(e, ChainError::InvalidSignature),
        }
    }

    #[test]
    fn test_reward_transaction_shape() {
        let miner = KeyPair::generate().unwrap().address();
        let reward = SignedTx::reward(miner, BLOCK_REWARD, 7, 0);

        assert!(reward.is_reward());
        assert!(reward.tx.from.is_zero());
        assert_eq!(reward.tx.nonce, 7);
        assert!(reward.signature.is_empty());
        assert!(reward.validate().is_err());
    }

    #[test]
    fn test_oversized_data_rejected() {
        let keypair = KeyPair::generate().unwrap();
        let tx = sample_tx(keypair.address(), Address::ZERO).with_data(vec![7u8; MAX_DATA_LENGTH + 1]);
        let signed = SignedTx::sign(tx, &keypair);

        assert!(matches!(
            signed.validate_size(),
            Err(ChainError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_wire_bytes_roundtrip_preserves_identity() {
        let keypair = KeyPair::generate().unwrap();
        let signed = SignedTx::sign(sample_tx(keypair.address(), Address::ZERO), &keypair);
        let decoded = SignedTx::from_bytes(&signed.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded, signed);
        assert!(decoded.is_authentic().unwrap());
    }
}
