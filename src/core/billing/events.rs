use crate::proto::payment::Promise;
use crate::proto::primitives::{Address, Preimage};

/// Topic under which promise events are published on the event bus.
pub const ACCOUNTANT_PROMISE_TOPIC: &str = "accountant_promise_received";

/// Events emitted by the invoice tracker for downstream settlement and
/// observability.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    /// A countersigned promise was obtained and persisted. Carries the
    /// preimage so the settlement layer never has to read it back from
    /// storage.
    AccountantPromiseReceived {
        promise: Promise,
        r: Preimage,
        accountant_id: Address,
        provider_id: Address,
    },
}

impl TrackerEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            TrackerEvent::AccountantPromiseReceived { .. } => ACCOUNTANT_PROMISE_TOPIC,
        }
    }
}
