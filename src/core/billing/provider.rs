//! Collaborator contracts the invoice tracker is driven by.
//!
//! Everything the tracker touches beyond its own state sits behind one of
//! these traits: the peer transport, the accountant, the chain, the fee
//! authority, persistence, the clock and the event bus. Production wires
//! in network- and database-backed implementations; tests wire in the
//! in-memory ones from [`persistence`](super::persistence) and the fakes
//! they need.

use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use async_trait::async_trait;

use super::events::TrackerEvent;
use super::persistence::AccountantPromise;
use crate::proto::payment::{ExchangeMessage, Invoice, Promise};
use crate::proto::primitives::Address;

// ============================================================================
// Accountant
// ============================================================================

/// Classification of an accountant call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountantErrorKind {
    /// The accountant rejected the request because its view of the
    /// agreement chain is ahead of the provider's reveals (an HTTP
    /// `400 Bad Request` at the wire level). Triggers R-recovery.
    ProtocolMismatch,
    /// The accountant could not be reached at all.
    Transport,
    /// The accountant answered with some other error.
    Response,
}

impl std::fmt::Display for AccountantErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountantErrorKind::ProtocolMismatch => write!(f, "protocol mismatch"),
            AccountantErrorKind::Transport => write!(f, "transport"),
            AccountantErrorKind::Response => write!(f, "response"),
        }
    }
}

/// A failed accountant call, carrying its classification.
///
/// Callers construct the kind at the HTTP boundary, where the status code
/// is still known; the tracker only ever matches on [`kind`], never on
/// message text.
///
/// [`kind`]: AccountantError::kind
#[derive(Debug, Clone)]
pub struct AccountantError {
    kind: AccountantErrorKind,
    message: String,
}

impl AccountantError {
    pub fn new(kind: AccountantErrorKind, message: impl Into<String>) -> Self {
        AccountantError {
            kind,
            message: message.into(),
        }
    }

    pub fn protocol_mismatch(message: impl Into<String>) -> Self {
        Self::new(AccountantErrorKind::ProtocolMismatch, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(AccountantErrorKind::Transport, message)
    }

    pub fn response(message: impl Into<String>) -> Self {
        Self::new(AccountantErrorKind::Response, message)
    }

    pub fn kind(&self) -> AccountantErrorKind {
        self.kind
    }

    pub fn is_protocol_mismatch(&self) -> bool {
        self.kind == AccountantErrorKind::ProtocolMismatch
    }
}

impl std::fmt::Display for AccountantError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "accountant call failed ({}): {}", self.kind, self.message)
    }
}

impl std::error::Error for AccountantError {}

/// The off-chain settlement authority.
#[async_trait]
pub trait AccountantCaller: Send + Sync {
    /// Exchanges a validated exchange message for a countersigned promise.
    async fn request_promise(&self, em: &ExchangeMessage) -> Result<Promise, AccountantError>;

    /// Discloses the preimage `r` (bare hex) for `agreement_id`, unlocking
    /// finalization of the promise issued against its hash lock.
    async fn reveal_r(
        &self,
        r: &str,
        provider: &Address,
        agreement_id: u64,
    ) -> Result<(), AccountantError>;
}

// ============================================================================
// Transport, chain and fees
// ============================================================================

/// Delivers invoices to the consumer over the peer channel.
#[async_trait]
pub trait PeerInvoiceSender: Send + Sync {
    async fn send(&self, invoice: &Invoice) -> Result<()>;
}

/// Read-only view of the on-chain registry and accountant registration.
#[async_trait]
pub trait BlockchainHelper: Send + Sync {
    async fn is_registered(&self, registry: &Address, address: &Address) -> Result<bool>;

    /// The accountant's fee in hundredths of a percent.
    async fn get_accountant_fee(&self, accountant: &Address) -> Result<u16>;
}

/// The transactor's current settlement fee quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleFees {
    /// Flat settlement fee in the smallest currency unit.
    pub fee: u64,
    /// Until when the quote holds.
    pub valid_until: SystemTime,
}

/// Fetches settlement fee quotes from the transactor.
#[async_trait]
pub trait FeeProvider: Send + Sync {
    async fn fetch_settle_fees(&self) -> Result<SettleFees>;
}

/// Derives the payment channel address of a peer.
pub trait ChannelAddressCalculator: Send + Sync {
    fn channel_address(&self, peer: &Address) -> Result<Address>;
}

// ============================================================================
// Persistence contracts
// ============================================================================

/// Durable store for issued invoices and their preimages.
///
/// Ordering matters for crash recovery: `store` must be durable before
/// the invoice goes out, `store_r` before the matching promise request is
/// dispatched.
#[async_trait]
pub trait ProviderInvoiceStorage: Send + Sync {
    async fn get(&self, provider: &Address, consumer: &Address) -> Result<Option<Invoice>>;

    async fn store(&self, provider: &Address, consumer: &Address, invoice: &Invoice)
        -> Result<()>;

    /// Allocates the next agreement id for `provider`. Ids start at 1 and
    /// only ever grow.
    async fn get_new_agreement_id(&self, provider: &Address) -> Result<u64>;

    /// Stores the preimage (bare hex) under its agreement id.
    async fn store_r(&self, provider: &Address, agreement_id: u64, r: &str) -> Result<()>;

    async fn get_r(&self, provider: &Address, agreement_id: u64) -> Result<Option<String>>;
}

/// Durable store for the last accountant promise per (provider,
/// accountant) pair. Each successful round overwrites the record.
#[async_trait]
pub trait AccountantPromiseStorage: Send + Sync {
    async fn store(
        &self,
        provider: &Address,
        accountant: &Address,
        promise: &AccountantPromise,
    ) -> Result<()>;

    async fn get(&self, provider: &Address, accountant: &Address)
        -> Result<Option<AccountantPromise>>;
}

// ============================================================================
// Time and events
// ============================================================================

/// Tracks elapsed session time; the billable amount is a pure function
/// of it.
pub trait TimeTracker: Send + Sync {
    fn start_tracking(&self);
    fn elapsed(&self) -> Duration;
}

/// Wall-clock [`TimeTracker`].
#[derive(Debug, Default)]
pub struct WallClockTracker {
    started: std::sync::Mutex<Option<Instant>>,
}

impl WallClockTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeTracker for WallClockTracker {
    fn start_tracking(&self) {
        *self.started.lock().expect("time tracker lock poisoned") = Some(Instant::now());
    }

    fn elapsed(&self) -> Duration {
        self.started
            .lock()
            .expect("time tracker lock poisoned")
            .map(|started| started.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}

/// Publishes tracker events to the node's event bus.
///
/// Implementations must be fast and non-blocking; the session loop awaits
/// the call inline.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: TrackerEvent);
}

/// Publisher that discards all events. Useful in tests that only care
/// about state transitions.
#[derive(Debug, Clone, Default)]
pub struct NoOpPublisher;

#[async_trait]
impl EventPublisher for NoOpPublisher {
    async fn publish(&self, _event: TrackerEvent) {}
}
