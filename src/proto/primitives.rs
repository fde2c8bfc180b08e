use std::str::FromStr;
use std::time::Duration;

use rand::RngCore;
use serde::{
    de::{Error, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};
use sha2::{Digest, Sha256};

const HEX_PREFIX: &str = "0x";
const SECONDS_PER_MINUTE: f64 = 60.0;

/// Errors raised when parsing hex-encoded primitives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The decoded value has the wrong number of bytes.
    InvalidLength { expected: usize, actual: usize },
    /// The string is not valid hexadecimal.
    InvalidHex(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::InvalidLength { expected, actual } => {
                write!(f, "expected {} bytes, got {}", expected, actual)
            }
            ParseError::InvalidHex(e) => write!(f, "invalid hex: {}", e),
        }
    }
}

impl std::error::Error for ParseError {}

fn decode_prefixed_hex(s: &str) -> Result<Vec<u8>, ParseError> {
    let stripped = s
        .strip_prefix(HEX_PREFIX)
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    hex::decode(stripped).map_err(|e| ParseError::InvalidHex(e.to_string()))
}

// ============================================================================
// Address
// ============================================================================

/// A 20-byte account address identifying a provider, consumer, accountant
/// or payment channel.
///
/// The canonical string form is lowercase hex with a `0x` prefix; parsing
/// accepts any casing with or without the prefix. Equality is on the raw
/// bytes, which makes it case-insensitive on the hex form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address([u8; 20]);

impl Address {
    pub const LEN: usize = 20;

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Address(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == Self::LEN {
            let mut arr = [0u8; 20];
            arr.copy_from_slice(bytes);
            Some(Address(arr))
        } else {
            None
        }
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Canonical lowercase hex form with the `0x` prefix.
    pub fn to_hex(&self) -> String {
        format!("{}{}", HEX_PREFIX, hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_prefixed_hex(s)?;
        Address::from_slice(&bytes).ok_or(ParseError::InvalidLength {
            expected: Self::LEN,
            actual: bytes.len(),
        })
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", HEX_PREFIX, hex::encode(self.0))
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

struct AddressVisitor;

impl<'de> Visitor<'de> for AddressVisitor {
    type Value = Address;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a 20-byte hex string with an optional 0x prefix")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: Error,
    {
        value.parse().map_err(Error::custom)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(AddressVisitor)
    }
}

// ============================================================================
// Hashlock and Preimage
// ============================================================================

/// A 32-byte hash lock, the SHA-256 digest of a [`Preimage`].
///
/// Stringified as lowercase hex with a `0x` prefix. Comparison happens on
/// the raw bytes after decoding, so prefix and casing never matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hashlock([u8; 32]);

impl Hashlock {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hashlock(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == Self::LEN {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(bytes);
            Some(Hashlock(arr))
        } else {
            None
        }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("{}{}", HEX_PREFIX, hex::encode(self.0))
    }
}

impl FromStr for Hashlock {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_prefixed_hex(s)?;
        Hashlock::from_slice(&bytes).ok_or(ParseError::InvalidLength {
            expected: Self::LEN,
            actual: bytes.len(),
        })
    }
}

impl std::fmt::Display for Hashlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", HEX_PREFIX, hex::encode(self.0))
    }
}

impl Serialize for Hashlock {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

struct HashlockVisitor;

impl<'de> Visitor<'de> for HashlockVisitor {
    type Value = Hashlock;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a 32-byte hex string with an optional 0x prefix")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: Error,
    {
        value.parse().map_err(Error::custom)
    }
}

impl<'de> Deserialize<'de> for Hashlock {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(HashlockVisitor)
    }
}

/// A 32-byte secret whose SHA-256 digest forms the hash lock of an invoice.
///
/// Revealing the preimage to the accountant finalizes the promise issued
/// against its lock, so a preimage is disclosed at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preimage([u8; 32]);

impl Preimage {
    pub const LEN: usize = 32;

    /// Draws a fresh preimage from the operating system RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Preimage(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Preimage(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The hash lock guarding this preimage.
    pub fn hashlock(&self) -> Hashlock {
        let digest: [u8; 32] = Sha256::digest(self.0).into();
        Hashlock::from_bytes(digest)
    }

    /// Bare lowercase hex, the form persisted by the invoice store.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        let bytes = decode_prefixed_hex(s)?;
        if bytes.len() != Self::LEN {
            return Err(ParseError::InvalidLength {
                expected: Self::LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Preimage(arr))
    }
}

// ============================================================================
// Signature
// ============================================================================

/// A 65-byte recoverable ECDSA signature in `r || s || v` layout, where `v`
/// is the recovery id byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 65]);

impl Signature {
    pub const LEN: usize = 65;

    pub fn from_bytes(bytes: [u8; 65]) -> Self {
        Signature(bytes)
    }

    pub fn from_parts(rs: [u8; 64], v: u8) -> Self {
        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&rs);
        bytes[64] = v;
        Signature(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    /// The 64-byte `r || s` component.
    pub fn rs(&self) -> [u8; 64] {
        let mut rs = [0u8; 64];
        rs.copy_from_slice(&self.0[..64]);
        rs
    }

    /// The recovery id byte.
    pub fn v(&self) -> u8 {
        self.0[64]
    }

    pub fn to_hex(&self) -> String {
        format!("{}{}", HEX_PREFIX, hex::encode(self.0))
    }
}

impl FromStr for Signature {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_prefixed_hex(s)?;
        if bytes.len() != Self::LEN {
            return Err(ParseError::InvalidLength {
                expected: Self::LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 65];
        arr.copy_from_slice(&bytes);
        Ok(Signature(arr))
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", HEX_PREFIX, hex::encode(self.0))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

struct SignatureVisitor;

impl<'de> Visitor<'de> for SignatureVisitor {
    type Value = Signature;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a 65-byte hex string with an optional 0x prefix")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: Error,
    {
        value.parse().map_err(Error::custom)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(SignatureVisitor)
    }
}

// ============================================================================
// PaymentRate
// ============================================================================

/// The agreed price of the service: an amount in the smallest currency
/// unit per minute of elapsed session time. Immutable for the life of a
/// tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRate {
    /// Amount charged per minute.
    pub amount: u64,
}

impl PaymentRate {
    pub fn per_minute(amount: u64) -> Self {
        PaymentRate { amount }
    }

    /// The cumulative amount owed after `elapsed` session time, truncated
    /// towards zero.
    pub fn amount_for(&self, elapsed: Duration) -> u64 {
        (elapsed.as_secs_f64() / SECONDS_PER_MINUTE * self.amount as f64).trunc() as u64
    }
}

// ============================================================================
// Tests
// ============================================================================
