//! Validation of incoming exchange messages.
//!
//! The validator is a pure function of the message and a snapshot of what
//! the tracker currently expects, so the same inputs always produce the
//! same verdict. Checks run in a fixed order and the first failure wins.

use crate::crypto::CryptoError;
use crate::proto::payment::ExchangeMessage;
use crate::proto::primitives::{Address, Hashlock};

/// What the tracker expects the next exchange message to satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeExpectations {
    /// The consumer both signatures must recover to.
    pub consumer: Address,
    /// Lower bound on the promised amount: the amount of the last
    /// accepted promise, or zero on the first round.
    pub min_amount: u64,
    /// The hash lock of the invoice this message answers.
    pub hashlock: Hashlock,
    /// The payment channel the promise must spend from.
    pub channel_address: Address,
}

/// Why an exchange message was rejected.
#[derive(Debug)]
pub enum ValidationError {
    /// The outer message signature does not recover to the consumer.
    ExchangeSignature,
    /// The embedded promise signature could not be recovered at all.
    PromiseSignature(CryptoError),
    /// The embedded promise was signed by somebody else.
    PromiseSignerMismatch { expected: Address, actual: Address },
    /// The promise content does not match what was invoiced.
    Promise(PromiseViolation),
}

/// The promise-level defects a consumer can be caught with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromiseViolation {
    /// Promised amount shrank below the last accepted promise.
    InvalidAmount { min: u64, actual: u64 },
    /// The promise is locked to a different hash than the invoice.
    MismatchingHashlock { expected: Hashlock, actual: Hashlock },
    /// The promise spends from the wrong channel.
    InvalidChannelAddress { expected: Address, actual: Address },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::ExchangeSignature => write!(f, "exchange validation failed"),
            ValidationError::PromiseSignature(e) => {
                write!(f, "could not recover promise signature: {}", e)
            }
            ValidationError::PromiseSignerMismatch { expected, actual } => {
                write!(f, "identity mismatch: expected {}, got {}", expected, actual)
            }
            ValidationError::Promise(v) => {
                write!(f, "consumer failed to issue promise for the correct amount: {}", v)
            }
        }
    }
}

impl std::fmt::Display for PromiseViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PromiseViolation::InvalidAmount { min, actual } => {
                write!(f, "invalid amount: expected at least {}, got {}", min, actual)
            }
            PromiseViolation::MismatchingHashlock { expected, actual } => {
                write!(f, "mismatching hashlock: expected {}, got {}", expected, actual)
            }
            PromiseViolation::InvalidChannelAddress { expected, actual } => {
                write!(f, "invalid channel address: expected {}, got {}", expected, actual)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Accepts or rejects an exchange message against the expectations
/// snapshot.
pub fn validate_exchange_message(
    em: &ExchangeMessage,
    expectations: &ExchangeExpectations,
) -> Result<(), ValidationError> {
    if !em.is_message_valid(&expectations.consumer) {
        return Err(ValidationError::ExchangeSignature);
    }

    let signer = em
        .promise
        .recover_signer()
        .map_err(ValidationError::PromiseSignature)?;
    if signer != expectations.consumer {
        return Err(ValidationError::PromiseSignerMismatch {
            expected: expectations.consumer,
            actual: signer,
        });
    }

    if em.promise.amount < expectations.min_amount {
        return Err(ValidationError::Promise(PromiseViolation::InvalidAmount {
            min: expectations.min_amount,
            actual: em.promise.amount,
        }));
    }

    if em.promise.hashlock != expectations.hashlock {
        return Err(ValidationError::Promise(PromiseViolation::MismatchingHashlock {
            expected: expectations.hashlock,
            actual: em.promise.hashlock,
        }));
    }

    if em.promise.channel_id != expectations.channel_address {
        return Err(ValidationError::Promise(PromiseViolation::InvalidChannelAddress {
            expected: expectations.channel_address,
            actual: em.promise.channel_id,
        }));
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
