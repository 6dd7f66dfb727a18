/// Validation logic for transactions separated from type definitions
use crate::crypto::recover_address;
use crate::error::ChainError;
use crate::transaction::types::SignedTx;

impl SignedTx {
    /// Recovers the signer from `(hash, signature)` and compares it to `from`.
    ///
    /// Returns `Err(InvalidSignature)` when no key can be recovered and `Ok(false)` when
    /// a key is recovered but belongs to someone else.
    pub fn is_authentic(&self) -> Result<bool, ChainError> {
        let signer = recover_address(&self.hash(), &self.signature)?;
        Ok(signer == self.tx.from)
    }

    /// Like [`SignedTx::is_authentic`], mapping a mismatch to `ForgedTransaction`.
    pub fn verify_authentic(&self) -> Result<(), ChainError> {
        if self.is_authentic()? {
            Ok(())
        } else {
            Err(ChainError::ForgedTransaction)
        }
    }

    /// Stateless checks for a user-submitted (non-reward) transaction.
    /// Does NOT look at balances or nonces; the state engine owns those.
    pub fn validate(&self) -> Result<(), ChainError> {
        self.validate_size()?;

        if self.tx.is_reward() {
            return Err(ChainError::InvalidTransaction(
                "Reward transactions cannot be submitted directly".to_string(),
            ));
        }
        if self.tx.from.is_zero() {
            return Err(ChainError::InvalidTransaction(
                "Sender address cannot be empty".to_string(),
            ));
        }
        if self.tx.to.is_zero() {
            return Err(ChainError::InvalidTransaction(
                "Recipient address cannot be empty".to_string(),
            ));
        }
        if self.tx.from == self.tx.to {
            return Err(ChainError::InvalidTransaction(
                "Cannot send to self".to_string(),
            ));
        }
        if self.tx.nonce == 0 {
            return Err(ChainError::InvalidNonce {
                expected: 1,
                got: 0,
            });
        }
        self.tx.cost()?;

        self.verify_authentic()
    }
}
