//! Invoice construction.

use crate::proto::payment::Invoice;
use crate::proto::primitives::{Address, Preimage};

/// Builds the invoice for one billing round: the cumulative `amount` owed
/// under `agreement_id`, locked to the hash of a fresh preimage.
pub fn create_invoice(
    agreement_id: u64,
    amount: u64,
    transactor_fee: u64,
    r: &Preimage,
    provider: Address,
) -> Invoice {
    Invoice {
        agreement_id,
        amount,
        transactor_fee,
        hashlock: r.hashlock(),
        provider,
    }
}

/// The most recently issued invoice together with the preimage whose hash
/// it carries. Owned exclusively by the session loop.
#[derive(Debug, Clone)]
pub struct LastInvoice {
    pub invoice: Invoice,
    pub r: Preimage,
}
