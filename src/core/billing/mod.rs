//! The provider-side invoice tracker: a per-session state machine that
//! issues hash-locked invoices, validates the consumer's signed exchange
//! messages and turns them into accountant-countersigned promises.

pub mod config;
pub mod events;
pub mod invoice;
pub mod persistence;
pub mod provider;
pub mod tracker;
pub mod validation;

pub use config::{ConfigError, TrackerConfig, DEFAULT_CHARGE_PERIOD_LEEWAY};
pub use events::TrackerEvent;
pub use invoice::{create_invoice, LastInvoice};
pub use persistence::AccountantPromise;
pub use provider::{AccountantError, AccountantErrorKind};
pub use tracker::{InvoiceTracker, InvoiceTrackerDeps, StopHandle, TrackerError};
pub use validation::{validate_exchange_message, ExchangeExpectations, ValidationError};
