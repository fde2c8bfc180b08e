//! Persisted records of the payment round and in-memory reference stores.
//!
//! The tracker itself only talks to the storage traits in
//! [`provider`](super::provider); this module holds what gets stored.
//! The in-memory implementations keep the full storage contract
//! (overwrite semantics, monotone agreement ids) and double as the
//! durable-store stand-in for unit and integration tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::provider::{AccountantPromiseStorage, ProviderInvoiceStorage};
use crate::proto::payment::{Invoice, Promise};
use crate::proto::primitives::Address;

// ============================================================================
// Records
// ============================================================================

/// The one live promise record per (provider, accountant) pair.
///
/// `revealed` is a one-way latch: it flips to `true` once the accountant
/// has been told the preimage and is never cleared again for this record.
/// Each successful round replaces the whole record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountantPromise {
    pub promise: Promise,
    /// The preimage in bare lowercase hex.
    pub r: String,
    pub revealed: bool,
    pub agreement_id: u64,
}

// ============================================================================
// In-memory stores
// ============================================================================

/// In-memory [`ProviderInvoiceStorage`].
#[derive(Debug, Default)]
pub struct MemoryInvoiceStorage {
    invoices: Mutex<HashMap<(Address, Address), Invoice>>,
    preimages: Mutex<HashMap<(Address, u64), String>>,
    agreement_ids: Mutex<HashMap<Address, u64>>,
}

impl MemoryInvoiceStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of invoices currently stored. Test inspection helper.
    pub fn invoice_count(&self) -> usize {
        self.invoices.lock().expect("invoice store lock poisoned").len()
    }
}

#[async_trait]
impl ProviderInvoiceStorage for MemoryInvoiceStorage {
    async fn get(&self, provider: &Address, consumer: &Address) -> Result<Option<Invoice>> {
        let invoices = self.invoices.lock().expect("invoice store lock poisoned");
        Ok(invoices.get(&(*provider, *consumer)).cloned())
    }

    async fn store(
        &self,
        provider: &Address,
        consumer: &Address,
        invoice: &Invoice,
    ) -> Result<()> {
        let mut invoices = self.invoices.lock().expect("invoice store lock poisoned");
        invoices.insert((*provider, *consumer), invoice.clone());
        Ok(())
    }

    async fn get_new_agreement_id(&self, provider: &Address) -> Result<u64> {
        let mut ids = self.agreement_ids.lock().expect("invoice store lock poisoned");
        let id = ids.entry(*provider).or_insert(0);
        *id += 1;
        Ok(*id)
    }

    async fn store_r(&self, provider: &Address, agreement_id: u64, r: &str) -> Result<()> {
        let mut preimages = self.preimages.lock().expect("invoice store lock poisoned");
        preimages.insert((*provider, agreement_id), r.to_string());
        Ok(())
    }

    async fn get_r(&self, provider: &Address, agreement_id: u64) -> Result<Option<String>> {
        let preimages = self.preimages.lock().expect("invoice store lock poisoned");
        Ok(preimages.get(&(*provider, agreement_id)).cloned())
    }
}

/// In-memory [`AccountantPromiseStorage`].
#[derive(Debug, Default)]
pub struct MemoryPromiseStorage {
    promises: Mutex<HashMap<(Address, Address), AccountantPromise>>,
}

impl MemoryPromiseStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountantPromiseStorage for MemoryPromiseStorage {
    async fn store(
        &self,
        provider: &Address,
        accountant: &Address,
        promise: &AccountantPromise,
    ) -> Result<()> {
        let mut promises = self.promises.lock().expect("promise store lock poisoned");
        promises.insert((*provider, *accountant), promise.clone());
        Ok(())
    }

    async fn get(
        &self,
        provider: &Address,
        accountant: &Address,
    ) -> Result<Option<AccountantPromise>> {
        let promises = self.promises.lock().expect("promise store lock poisoned");
        Ok(promises.get(&(*provider, *accountant)).cloned())
    }
}

// ============================================================================
// Tests
// ============================================================================
