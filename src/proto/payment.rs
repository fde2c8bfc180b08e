//! Wire types of the micropayment round: invoices, payment promises and
//! the exchange messages that carry them.
//!
//! Signatures cover a canonical digest of the fields in big-endian
//! layout, so both sides of the channel agree on the signed bytes
//! without a shared serialization framework.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, CryptoError, SigningIdentity};
use crate::proto::primitives::{Address, Hashlock, Signature};

/// A provider's demand for cumulative payment up to `amount`, bound to a
/// hash lock. Amounts only ever grow within one agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    /// The billing epoch this invoice belongs to.
    pub agreement_id: u64,
    /// Cumulative total requested since agreement start.
    pub amount: u64,
    /// The settlement fee the transactor charges on top.
    pub transactor_fee: u64,
    /// SHA-256 of the preimage the provider will later reveal.
    pub hashlock: Hashlock,
    /// The issuing provider.
    pub provider: Address,
}

/// A signed commitment to pay up to `amount` on a channel, honored by the
/// accountant once the matching preimage is revealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promise {
    pub amount: u64,
    pub fee: u64,
    pub hashlock: Hashlock,
    /// The 20-byte payment channel the promise spends from.
    pub channel_id: Address,
    pub signature: Signature,
}

impl Promise {
    /// The digest a promise signature covers.
    pub fn digest(amount: u64, fee: u64, hashlock: &Hashlock, channel_id: &Address) -> [u8; 32] {
        let mut bytes = Vec::with_capacity(16 + Hashlock::LEN + Address::LEN);
        bytes.extend_from_slice(&amount.to_be_bytes());
        bytes.extend_from_slice(&fee.to_be_bytes());
        bytes.extend_from_slice(hashlock.as_bytes());
        bytes.extend_from_slice(channel_id.as_bytes());
        crypto::sha256(&bytes)
    }

    /// Builds and signs a promise in one step.
    pub fn signed(
        amount: u64,
        fee: u64,
        hashlock: Hashlock,
        channel_id: Address,
        signer: &SigningIdentity,
    ) -> Result<Self, CryptoError> {
        let signature = signer.sign(&Self::digest(amount, fee, &hashlock, &channel_id))?;
        Ok(Promise {
            amount,
            fee,
            hashlock,
            channel_id,
            signature,
        })
    }

    pub fn signing_digest(&self) -> [u8; 32] {
        Self::digest(self.amount, self.fee, &self.hashlock, &self.channel_id)
    }

    /// Recovers the address that signed this promise.
    pub fn recover_signer(&self) -> Result<Address, CryptoError> {
        crypto::recover_address(&self.signing_digest(), &self.signature)
    }
}

/// A consumer's signed acceptance of an invoice: the embedded promise plus
/// the cumulative total the consumer acknowledges for the agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeMessage {
    pub promise: Promise,
    pub agreement_id: u64,
    /// Cumulative total acknowledged since agreement start.
    pub agreement_total: u64,
    pub signature: Signature,
}

impl ExchangeMessage {
    /// The digest the outer signature covers. It includes the promise
    /// signature, so the outer signature binds the inner promise as sent.
    pub fn digest(promise: &Promise, agreement_id: u64, agreement_total: u64) -> [u8; 32] {
        let mut bytes = Vec::with_capacity(16 + 32 + Signature::LEN);
        bytes.extend_from_slice(&agreement_id.to_be_bytes());
        bytes.extend_from_slice(&agreement_total.to_be_bytes());
        bytes.extend_from_slice(&promise.signing_digest());
        bytes.extend_from_slice(promise.signature.as_bytes());
        crypto::sha256(&bytes)
    }

    /// Builds and signs an exchange message in one step.
    pub fn signed(
        promise: Promise,
        agreement_id: u64,
        agreement_total: u64,
        signer: &SigningIdentity,
    ) -> Result<Self, CryptoError> {
        let signature = signer.sign(&Self::digest(&promise, agreement_id, agreement_total))?;
        Ok(ExchangeMessage {
            promise,
            agreement_id,
            agreement_total,
            signature,
        })
    }

    pub fn signing_digest(&self) -> [u8; 32] {
        Self::digest(&self.promise, self.agreement_id, self.agreement_total)
    }

    /// Recovers the address that signed the outer message.
    pub fn recover_signer(&self) -> Result<Address, CryptoError> {
        crypto::recover_address(&self.signing_digest(), &self.signature)
    }

    /// True iff the outer signature recovers to `address`.
    pub fn is_message_valid(&self, address: &Address) -> bool {
        self.recover_signer().map_or(false, |signer| signer == *address)
    }
}
