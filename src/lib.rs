//! Provider-side invoice tracking for peer-to-peer micropayment channels.
//!
//! A provider sells a metered service to a consumer and bills it in rounds:
//! every charge period the provider issues a hash-locked [`Invoice`], the
//! consumer answers with a signed [`ExchangeMessage`] carrying a payment
//! promise, and an off-chain *accountant* countersigns that promise so it
//! can later be settled on-chain. The [`InvoiceTracker`] drives this
//! protocol for the lifetime of one service session.
//!
//! The crate is split the following way:
//! - [`proto`] holds the wire and persistence data model (addresses,
//!   preimages, invoices, promises, exchange messages),
//! - [`crypto`] holds the recoverable-signature and digest primitives,
//! - [`core::billing`] holds the session state machine together with the
//!   collaborator traits it is driven by.
//!
//! [`Invoice`]: proto::payment::Invoice
//! [`ExchangeMessage`]: proto::payment::ExchangeMessage
//! [`InvoiceTracker`]: core::billing::InvoiceTracker

pub mod core;
pub mod crypto;
pub mod proto;
