//! The per-session invoice tracker state machine.
//!
//! One tracker drives one service session: it emits a hash-locked invoice
//! every charge period, waits for the consumer's signed exchange message,
//! reveals the previous round's preimage to the accountant and exchanges
//! the message for a countersigned promise. The loop is the sole mutator
//! of round state; everything it touches beyond that sits behind the
//! traits in [`provider`](super::provider).
//!
//! Failure policy: transient consumer silence and accountant outages are
//! absorbed up to configured thresholds, everything else terminates the
//! session with a single terminal error out of [`InvoiceTracker::start`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time;

use super::config::{ConfigError, TrackerConfig};
use super::events::TrackerEvent;
use super::invoice::{create_invoice, LastInvoice};
use super::persistence::AccountantPromise;
use super::provider::{
    AccountantCaller, AccountantError, AccountantPromiseStorage, BlockchainHelper,
    ChannelAddressCalculator, EventPublisher, FeeProvider, PeerInvoiceSender,
    ProviderInvoiceStorage, TimeTracker,
};
use super::validation::{validate_exchange_message, ExchangeExpectations, ValidationError};
use crate::proto::payment::ExchangeMessage;
use crate::proto::primitives::Preimage;

/// Grace the consumer gets to set up its payment flow before the first
/// invoice goes out.
const FIRST_SEND_DELAY: Duration = Duration::from_secs(1);

/// Fraction of the computed amount asked for on the very first invoice.
/// Both parties start their clocks at slightly different moments, so the
/// first bill must undercut what the consumer's own accounting expects.
const FIRST_INVOICE_TOLERANCE: f64 = 0.8;

// ============================================================================
// Errors
// ============================================================================

/// Terminal errors of a tracker session.
#[derive(Debug)]
pub enum TrackerError {
    /// The consumer identity is not registered on chain.
    ConsumerNotRegistered,
    /// The registration status could not be determined.
    RegistrationCheck(anyhow::Error),
    /// Settlement or accountant fees could not be fetched.
    FeeFetch(anyhow::Error),
    /// The accountant charges more than this provider accepts.
    AccountantFeeTooLarge { fee: u16, max: u16 },
    /// The first invoice of the session could not be materialized.
    InitialInvoice(anyhow::Error),
    /// The consumer's exchange message failed validation.
    ExchangeValidation(ValidationError),
    /// No exchange message arrived within the per-round wait window.
    ExchangeWaitTimeout,
    /// The accountant kept failing beyond the configured threshold.
    AccountantUnreachable(AccountantError),
    /// No prior preimage could be re-revealed to the accountant.
    RRecoveryFailed,
    /// The peer transport rejected an invoice.
    InvoiceSend(anyhow::Error),
    /// A storage operation failed; the session cannot continue safely.
    Storage(anyhow::Error),
    /// The peer's channel address could not be derived.
    ChannelAddress(anyhow::Error),
}

impl std::fmt::Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerError::ConsumerNotRegistered => write!(f, "consumer not registered"),
            TrackerError::RegistrationCheck(e) => {
                write!(f, "could not check consumer registration status: {}", e)
            }
            TrackerError::FeeFetch(e) => write!(f, "could not fetch fees: {}", e),
            TrackerError::AccountantFeeTooLarge { fee, max } => {
                write!(f, "accountant fee too large, asking for {} where {} is the limit", fee, max)
            }
            TrackerError::InitialInvoice(e) => {
                write!(f, "could not generate initial invoice: {}", e)
            }
            TrackerError::ExchangeValidation(e) => write!(f, "{}", e),
            TrackerError::ExchangeWaitTimeout => write!(f, "did not get a new exchange message"),
            TrackerError::AccountantUnreachable(e) => write!(f, "could not call accountant: {}", e),
            TrackerError::RRecoveryFailed => write!(f, "r recovery failed"),
            TrackerError::InvoiceSend(e) => write!(f, "could not send invoice: {}", e),
            TrackerError::Storage(e) => write!(f, "storage failure: {}", e),
            TrackerError::ChannelAddress(e) => {
                write!(f, "could not generate channel address: {}", e)
            }
        }
    }
}

impl std::error::Error for TrackerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrackerError::RegistrationCheck(e)
            | TrackerError::FeeFetch(e)
            | TrackerError::InitialInvoice(e)
            | TrackerError::InvoiceSend(e)
            | TrackerError::Storage(e)
            | TrackerError::ChannelAddress(e) => Some(e.as_ref()),
            TrackerError::ExchangeValidation(e) => Some(e),
            TrackerError::AccountantUnreachable(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================================
// Stop handle
// ============================================================================

/// Cloneable handle that terminates a running tracker.
///
/// `stop` is idempotent and non-blocking: the first call flips a one-shot
/// broadcast flag, every later call is a no-op. The session loop returns
/// from its current wait point shortly after.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        StopHandle { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.subscribe().borrow()
    }

    /// Resolves once `stop` has been called; immediately if it already
    /// was.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close under us.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Everything a tracker needs, assembled by the session layer.
pub struct InvoiceTrackerDeps {
    pub config: TrackerConfig,
    pub peer_invoice_sender: Arc<dyn PeerInvoiceSender>,
    /// Incoming exchange messages from the peer transport.
    pub exchange_messages: mpsc::Receiver<ExchangeMessage>,
    pub invoice_storage: Arc<dyn ProviderInvoiceStorage>,
    pub accountant_promise_storage: Arc<dyn AccountantPromiseStorage>,
    pub accountant_caller: Arc<dyn AccountantCaller>,
    pub blockchain_helper: Arc<dyn BlockchainHelper>,
    pub fee_provider: Arc<dyn FeeProvider>,
    pub time_tracker: Arc<dyn TimeTracker>,
    pub publisher: Arc<dyn EventPublisher>,
    pub channel_address_calculator: Arc<dyn ChannelAddressCalculator>,
}

/// The provider-side invoice tracker. One instance per active session;
/// created, `start`ed once and stopped through its [`StopHandle`].
pub struct InvoiceTracker {
    config: TrackerConfig,
    peer_invoice_sender: Arc<dyn PeerInvoiceSender>,
    exchange_messages: mpsc::Receiver<ExchangeMessage>,
    invoice_storage: Arc<dyn ProviderInvoiceStorage>,
    accountant_promise_storage: Arc<dyn AccountantPromiseStorage>,
    accountant_caller: Arc<dyn AccountantCaller>,
    blockchain_helper: Arc<dyn BlockchainHelper>,
    fee_provider: Arc<dyn FeeProvider>,
    time_tracker: Arc<dyn TimeTracker>,
    publisher: Arc<dyn EventPublisher>,
    channel_address_calculator: Arc<dyn ChannelAddressCalculator>,
    max_not_received: u64,
    transactor_fee: u64,
    last_exchange_message: Option<ExchangeMessage>,
    not_received_count: AtomicU64,
    accountant_failure_count: AtomicU64,
    stop: StopHandle,
}

fn max_not_received_count(leeway: Duration, charge_period: Duration) -> u64 {
    (leeway.as_secs_f64() / charge_period.as_secs_f64()).round() as u64
}

impl InvoiceTracker {
    pub fn new(deps: InvoiceTrackerDeps) -> Result<Self, ConfigError> {
        deps.config.validate()?;
        let max_not_received = max_not_received_count(
            deps.config.charge_period_leeway,
            deps.config.charge_period,
        );
        Ok(InvoiceTracker {
            max_not_received,
            transactor_fee: 0,
            last_exchange_message: None,
            not_received_count: AtomicU64::new(0),
            accountant_failure_count: AtomicU64::new(0),
            stop: StopHandle::new(),
            config: deps.config,
            peer_invoice_sender: deps.peer_invoice_sender,
            exchange_messages: deps.exchange_messages,
            invoice_storage: deps.invoice_storage,
            accountant_promise_storage: deps.accountant_promise_storage,
            accountant_caller: deps.accountant_caller,
            blockchain_helper: deps.blockchain_helper,
            fee_provider: deps.fee_provider,
            time_tracker: deps.time_tracker,
            publisher: deps.publisher,
            channel_address_calculator: deps.channel_address_calculator,
        })
    }

    /// Handle for stopping this tracker from any task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Consecutive rounds without an exchange message. Diagnostic view.
    pub fn not_received_exchange_message_count(&self) -> u64 {
        self.not_received_count.load(Ordering::SeqCst)
    }

    /// Consecutive accountant failures. Diagnostic view.
    pub fn accountant_failure_count(&self) -> u64 {
        self.accountant_failure_count.load(Ordering::SeqCst)
    }

    /// Runs the session to completion.
    ///
    /// Blocks until the first terminal error or until the stop handle
    /// fires, whichever comes first. A stopped session returns `Ok(())`.
    pub async fn start(&mut self) -> Result<(), TrackerError> {
        log::debug!("starting invoice tracker for peer {}", self.config.peer);
        self.time_tracker.start_tracking();

        let registered = self
            .blockchain_helper
            .is_registered(&self.config.registry, &self.config.peer)
            .await
            .map_err(TrackerError::RegistrationCheck)?;
        if !registered {
            return Err(TrackerError::ConsumerNotRegistered);
        }

        let fees = self
            .fee_provider
            .fetch_settle_fees()
            .await
            .map_err(TrackerError::FeeFetch)?;
        self.transactor_fee = fees.fee;

        let accountant_fee = self
            .blockchain_helper
            .get_accountant_fee(&self.config.accountant_id)
            .await
            .map_err(TrackerError::FeeFetch)?;
        if accountant_fee > self.config.max_allowed_accountant_fee {
            log::error!(
                "accountant fee too large, asking for {} where {} is the limit",
                accountant_fee,
                self.config.max_allowed_accountant_fee
            );
            return Err(TrackerError::AccountantFeeTooLarge {
                fee: accountant_fee,
                max: self.config.max_allowed_accountant_fee,
            });
        }

        let initial = self.generate_initial_invoice().await?;
        self.run(initial).await
    }

    async fn run(&mut self, mut last_invoice: LastInvoice) -> Result<(), TrackerError> {
        enum Tick {
            Invoice,
            Stopped,
        }

        let stop = self.stop.clone();
        let first_send = time::sleep(FIRST_SEND_DELAY);
        tokio::pin!(first_send);
        let mut first_send_pending = true;

        loop {
            // A fresh timer per iteration: the next charge period starts
            // after the previous round fully completed.
            let charge_tick = time::sleep(self.config.charge_period);
            tokio::pin!(charge_tick);

            let tick = tokio::select! {
                _ = &mut first_send, if first_send_pending => {
                    first_send_pending = false;
                    Tick::Invoice
                }
                _ = &mut charge_tick => Tick::Invoice,
                _ = stop.cancelled() => Tick::Stopped,
            };

            match tick {
                Tick::Invoice => {
                    self.send_invoice_expect_exchange_message(&mut last_invoice)
                        .await?
                }
                Tick::Stopped => return Ok(()),
            }
        }
    }

    /// Materializes the first invoice of the session. It is never sent:
    /// it only pins the freshly allocated agreement id and seeds the
    /// hash-lock chain for the first real invoice.
    async fn generate_initial_invoice(&self) -> Result<LastInvoice, TrackerError> {
        let agreement_id = self
            .invoice_storage
            .get_new_agreement_id(&self.config.provider_id)
            .await
            .map_err(TrackerError::InitialInvoice)?;
        let r = Preimage::generate();
        let invoice = create_invoice(agreement_id, 0, 0, &r, self.config.provider_id);
        Ok(LastInvoice { invoice, r })
    }

    fn billable_amount(&self) -> u64 {
        let should_be = self
            .config
            .payment_rate
            .amount_for(self.time_tracker.elapsed());
        let first_billing = self
            .last_exchange_message
            .as_ref()
            .map_or(0, |em| em.agreement_total)
            == 0;
        if first_billing {
            let lenient = (should_be as f64 * FIRST_INVOICE_TOLERANCE).trunc() as u64;
            log::debug!("being lenient for the first payment, asking for {}", lenient);
            return lenient;
        }
        should_be
    }

    async fn send_invoice_expect_exchange_message(
        &mut self,
        last_invoice: &mut LastInvoice,
    ) -> Result<(), TrackerError> {
        let r = Preimage::generate();
        let invoice = create_invoice(
            last_invoice.invoice.agreement_id,
            self.billable_amount(),
            self.transactor_fee,
            &r,
            self.config.provider_id,
        );

        // Durable before it goes out; a crash must never lose an invoice
        // the consumer may already be answering.
        self.invoice_storage
            .store(&self.config.provider_id, &self.config.peer, &invoice)
            .await
            .map_err(TrackerError::Storage)?;

        self.peer_invoice_sender
            .send(&invoice)
            .await
            .map_err(TrackerError::InvoiceSend)?;

        *last_invoice = LastInvoice { invoice, r };

        match self.receive_exchange_message_or_timeout(last_invoice).await {
            Ok(()) => {
                self.not_received_count.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(TrackerError::ExchangeWaitTimeout) => {
                let missed = self.not_received_count.fetch_add(1, Ordering::SeqCst) + 1;
                if missed >= self.max_not_received {
                    return Err(TrackerError::ExchangeWaitTimeout);
                }
                log::warn!(
                    "failed to receive exchange message ({} of {} tolerated)",
                    missed,
                    self.max_not_received
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Waits for exactly one of: an exchange message, the per-round
    /// timeout, or the stop signal.
    async fn receive_exchange_message_or_timeout(
        &mut self,
        last_invoice: &LastInvoice,
    ) -> Result<(), TrackerError> {
        enum Intake {
            Message(ExchangeMessage),
            Closed,
            Timeout,
            Stopped,
        }

        let stop = self.stop.clone();
        let wait = time::sleep(self.config.exchange_message_wait_timeout);
        tokio::pin!(wait);

        let intake = tokio::select! {
            received = self.exchange_messages.recv() => match received {
                Some(em) => Intake::Message(em),
                None => Intake::Closed,
            },
            _ = &mut wait => Intake::Timeout,
            _ = stop.cancelled() => Intake::Stopped,
        };

        match intake {
            Intake::Message(em) => self.handle_exchange_message(em, last_invoice).await,
            Intake::Closed => {
                // The transport dropped its sender; the session is over.
                log::warn!("exchange message channel closed, stopping tracker");
                self.stop.stop();
                Ok(())
            }
            Intake::Timeout => Err(TrackerError::ExchangeWaitTimeout),
            Intake::Stopped => Ok(()),
        }
    }

    async fn handle_exchange_message(
        &mut self,
        em: ExchangeMessage,
        last_invoice: &LastInvoice,
    ) -> Result<(), TrackerError> {
        let channel_address = self
            .channel_address_calculator
            .channel_address(&self.config.peer)
            .map_err(TrackerError::ChannelAddress)?;
        let expectations = ExchangeExpectations {
            consumer: self.config.peer,
            min_amount: self
                .last_exchange_message
                .as_ref()
                .map_or(0, |last| last.promise.amount),
            hashlock: last_invoice.invoice.hashlock,
            channel_address,
        };
        if let Err(err) = validate_exchange_message(&em, &expectations) {
            log::warn!("consumer sent an invalid exchange message: {}", err);
            return Err(TrackerError::ExchangeValidation(err));
        }

        self.last_exchange_message = Some(em.clone());
        self.settle_with_accountant(&em, last_invoice).await
    }

    /// Runs the accountant protocol for one accepted exchange message:
    /// reveal the previous preimage, persist the current one, exchange
    /// the message for a countersigned promise, persist and publish it.
    async fn settle_with_accountant(
        &self,
        em: &ExchangeMessage,
        last_invoice: &LastInvoice,
    ) -> Result<(), TrackerError> {
        let provider = self.config.provider_id;
        let accountant = self.config.accountant_id;

        // The accountant only honors the next promise in full once the
        // previous round's lock has been opened for it.
        let previous = self
            .accountant_promise_storage
            .get(&provider, &accountant)
            .await
            .map_err(TrackerError::Storage)?;
        if let Some(mut record) = previous {
            if !record.revealed {
                match self
                    .accountant_caller
                    .reveal_r(&record.r, &provider, record.agreement_id)
                    .await
                {
                    Err(err) => {
                        log::error!("could not reveal r: {}", err);
                        return self.absorb_accountant_failure(err);
                    }
                    Ok(()) => {
                        self.accountant_failure_count.store(0, Ordering::SeqCst);
                        record.revealed = true;
                        self.accountant_promise_storage
                            .store(&provider, &accountant, &record)
                            .await
                            .map_err(TrackerError::Storage)?;
                        log::debug!("revealed r for agreement {}", record.agreement_id);
                    }
                }
            }
        }

        // The preimage must be durable before the promise request goes
        // out, or a crash would leave the accountant ahead of our reveal
        // chain with no way to recover.
        self.invoice_storage
            .store_r(
                &provider,
                last_invoice.invoice.agreement_id,
                &last_invoice.r.to_hex(),
            )
            .await
            .map_err(TrackerError::Storage)?;

        let promise = match self.accountant_caller.request_promise(em).await {
            Ok(promise) => promise,
            Err(err) => {
                log::warn!("could not request promise from accountant: {}", err);
                if err.is_protocol_mismatch() {
                    self.initiate_r_recovery(last_invoice).await?;
                }
                return self.absorb_accountant_failure(err);
            }
        };
        self.accountant_failure_count.store(0, Ordering::SeqCst);

        let record = AccountantPromise {
            promise: promise.clone(),
            r: last_invoice.r.to_hex(),
            revealed: false,
            agreement_id: last_invoice.invoice.agreement_id,
        };
        self.accountant_promise_storage
            .store(&provider, &accountant, &record)
            .await
            .map_err(TrackerError::Storage)?;
        log::debug!("accountant promise stored");

        self.publisher
            .publish(TrackerEvent::AccountantPromiseReceived {
                promise,
                r: last_invoice.r,
                accountant_id: accountant,
                provider_id: provider,
            })
            .await;
        Ok(())
    }

    fn absorb_accountant_failure(&self, err: AccountantError) -> Result<(), TrackerError> {
        let failures = self.accountant_failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if failures > self.config.max_accountant_failure_count {
            return Err(TrackerError::AccountantUnreachable(err));
        }
        log::warn!("ignoring accountant error, failure threshold not reached yet");
        Ok(())
    }

    /// Re-reveals prior preimages when the accountant's view of the
    /// agreement chain is ahead of ours. Walks agreement ids backwards
    /// until one reveal is accepted or the walk limit is exhausted.
    async fn initiate_r_recovery(&self, last_invoice: &LastInvoice) -> Result<(), TrackerError> {
        let provider = self.config.provider_id;
        let current = last_invoice.invoice.agreement_id;
        let min_bound = if current > self.config.max_r_recovery_length {
            current - self.config.max_r_recovery_length
        } else {
            1
        };

        let mut agreement_id = current;
        while agreement_id >= min_bound {
            let r = self
                .invoice_storage
                .get_r(&provider, agreement_id)
                .await
                .map_err(TrackerError::Storage)?
                .ok_or_else(|| {
                    TrackerError::Storage(anyhow::anyhow!(
                        "no stored preimage for agreement {}",
                        agreement_id
                    ))
                })?;
            match self.accountant_caller.reveal_r(&r, &provider, current).await {
                Ok(()) => {
                    log::info!("r recovered for agreement {}", current);
                    return Ok(());
                }
                Err(err) => {
                    log::warn!("revealing r for agreement {} failed: {}", current, err)
                }
            }
            if agreement_id == min_bound {
                break;
            }
            agreement_id -= 1;
        }

        Err(TrackerError::RRecoveryFailed)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::SystemTime;

    use anyhow::Result;
    use async_trait::async_trait;

    use crate::core::billing::config::DEFAULT_CHARGE_PERIOD_LEEWAY;
    use crate::core::billing::persistence::{MemoryInvoiceStorage, MemoryPromiseStorage};
    use crate::core::billing::provider::SettleFees;
    use crate::crypto::SigningIdentity;
    use crate::proto::payment::{Invoice, Promise};
    use crate::proto::primitives::{Address, PaymentRate};

    fn provider_id() -> Address {
        Address::from_bytes([0x01u8; 20])
    }

    fn accountant_id() -> Address {
        Address::from_bytes([0x02u8; 20])
    }

    fn channel_address() -> Address {
        Address::from_bytes([0xccu8; 20])
    }

    fn consumer() -> SigningIdentity {
        SigningIdentity::from_secret_bytes(&[0x21u8; 32]).unwrap()
    }

    // ------------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct RecordingSender {
        sent: StdMutex<Vec<Invoice>>,
    }

    #[async_trait]
    impl PeerInvoiceSender for RecordingSender {
        async fn send(&self, invoice: &Invoice) -> Result<()> {
            self.sent.lock().unwrap().push(invoice.clone());
            Ok(())
        }
    }

    /// Accountant whose per-call outcomes are scripted up front. Calls
    /// beyond the script succeed; reveals are recorded for inspection.
    struct ScriptedAccountant {
        signer: SigningIdentity,
        promise_results: StdMutex<VecDeque<AccountantError>>,
        reveal_results: StdMutex<VecDeque<AccountantError>>,
        reveal_fails_always: bool,
        promise_calls: AtomicU64,
        reveals: StdMutex<Vec<(String, u64)>>,
    }

    impl ScriptedAccountant {
        fn new() -> Self {
            ScriptedAccountant {
                signer: SigningIdentity::from_secret_bytes(&[0x33u8; 32]).unwrap(),
                promise_results: StdMutex::new(VecDeque::new()),
                reveal_results: StdMutex::new(VecDeque::new()),
                reveal_fails_always: false,
                promise_calls: AtomicU64::new(0),
                reveals: StdMutex::new(Vec::new()),
            }
        }

        fn fail_next_promise(&self, err: AccountantError) {
            self.promise_results.lock().unwrap().push_back(err);
        }

        fn fail_next_reveal(&self, err: AccountantError) {
            self.reveal_results.lock().unwrap().push_back(err);
        }

        fn promise_calls(&self) -> u64 {
            self.promise_calls.load(Ordering::SeqCst)
        }

        fn reveals(&self) -> Vec<(String, u64)> {
            self.reveals.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AccountantCaller for ScriptedAccountant {
        async fn request_promise(
            &self,
            em: &ExchangeMessage,
        ) -> Result<Promise, AccountantError> {
            self.promise_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.promise_results.lock().unwrap().pop_front() {
                return Err(err);
            }
            Promise::signed(
                em.promise.amount,
                em.promise.fee,
                em.promise.hashlock,
                em.promise.channel_id,
                &self.signer,
            )
            .map_err(|e| AccountantError::response(e.to_string()))
        }

        async fn reveal_r(
            &self,
            r: &str,
            _provider: &Address,
            agreement_id: u64,
        ) -> Result<(), AccountantError> {
            self.reveals.lock().unwrap().push((r.to_string(), agreement_id));
            if self.reveal_fails_always {
                return Err(AccountantError::transport("accountant down"));
            }
            if let Some(err) = self.reveal_results.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(())
        }
    }

    struct StaticChain {
        registered: bool,
        fee: u16,
    }

    #[async_trait]
    impl BlockchainHelper for StaticChain {
        async fn is_registered(&self, _registry: &Address, _address: &Address) -> Result<bool> {
            Ok(self.registered)
        }

        async fn get_accountant_fee(&self, _accountant: &Address) -> Result<u16> {
            Ok(self.fee)
        }
    }

    struct StaticFees;

    #[async_trait]
    impl FeeProvider for StaticFees {
        async fn fetch_settle_fees(&self) -> Result<SettleFees> {
            Ok(SettleFees {
                fee: 1,
                valid_until: SystemTime::now() + Duration::from_secs(600),
            })
        }
    }

    struct FixedChannelCalculator;

    impl ChannelAddressCalculator for FixedChannelCalculator {
        fn channel_address(&self, _peer: &Address) -> Result<Address> {
            Ok(channel_address())
        }
    }

    struct ManualTime {
        elapsed: StdMutex<Duration>,
    }

    impl ManualTime {
        fn new(elapsed: Duration) -> Self {
            ManualTime {
                elapsed: StdMutex::new(elapsed),
            }
        }
    }

    impl TimeTracker for ManualTime {
        fn start_tracking(&self) {}

        fn elapsed(&self) -> Duration {
            *self.elapsed.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct CapturingPublisher {
        events: StdMutex<Vec<TrackerEvent>>,
    }

    impl CapturingPublisher {
        fn events(&self) -> Vec<TrackerEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher for CapturingPublisher {
        async fn publish(&self, event: TrackerEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    // ------------------------------------------------------------------------
    // Harness
    // ------------------------------------------------------------------------

    struct Harness {
        tracker: InvoiceTracker,
        accountant: Arc<ScriptedAccountant>,
        invoice_storage: Arc<MemoryInvoiceStorage>,
        promise_storage: Arc<MemoryPromiseStorage>,
        publisher: Arc<CapturingPublisher>,
    }

    fn harness_with(accountant: ScriptedAccountant, max_accountant_failures: u64) -> Harness {
        let accountant = Arc::new(accountant);
        let invoice_storage = Arc::new(MemoryInvoiceStorage::new());
        let promise_storage = Arc::new(MemoryPromiseStorage::new());
        let publisher = Arc::new(CapturingPublisher::default());
        let (_tx, rx) = mpsc::channel(1);

        let tracker = InvoiceTracker::new(InvoiceTrackerDeps {
            config: TrackerConfig {
                provider_id: provider_id(),
                accountant_id: accountant_id(),
                peer: consumer().address(),
                registry: Address::from_bytes([0x04u8; 20]),
                payment_rate: PaymentRate::per_minute(100),
                charge_period: Duration::from_millis(10),
                charge_period_leeway: DEFAULT_CHARGE_PERIOD_LEEWAY,
                exchange_message_wait_timeout: Duration::from_millis(50),
                max_accountant_failure_count: max_accountant_failures,
                max_allowed_accountant_fee: 1500,
                max_r_recovery_length: 10,
            },
            peer_invoice_sender: Arc::new(RecordingSender::default()),
            exchange_messages: rx,
            invoice_storage: invoice_storage.clone(),
            accountant_promise_storage: promise_storage.clone(),
            accountant_caller: accountant.clone(),
            blockchain_helper: Arc::new(StaticChain {
                registered: true,
                fee: 100,
            }),
            fee_provider: Arc::new(StaticFees),
            time_tracker: Arc::new(ManualTime::new(Duration::from_secs(60))),
            publisher: publisher.clone(),
            channel_address_calculator: Arc::new(FixedChannelCalculator),
        })
        .unwrap();

        Harness {
            tracker,
            accountant,
            invoice_storage,
            promise_storage,
            publisher,
        }
    }

    fn harness(max_accountant_failures: u64) -> Harness {
        harness_with(ScriptedAccountant::new(), max_accountant_failures)
    }

    fn last_invoice(agreement_id: u64, amount: u64) -> LastInvoice {
        let r = Preimage::generate();
        LastInvoice {
            invoice: create_invoice(agreement_id, amount, 1, &r, provider_id()),
            r,
        }
    }

    fn exchange_message_for(last: &LastInvoice, amount: u64) -> ExchangeMessage {
        let signer = consumer();
        let promise =
            Promise::signed(amount, 1, last.invoice.hashlock, channel_address(), &signer).unwrap();
        ExchangeMessage::signed(promise, last.invoice.agreement_id, amount, &signer).unwrap()
    }

    // ------------------------------------------------------------------------
    // Helpers under test
    // ------------------------------------------------------------------------

    #[test]
    fn test_max_not_received_count_rounding() {
        assert_eq!(
            max_not_received_count(Duration::from_secs(2 * 60 * 60), Duration::from_millis(10)),
            720_000
        );
        // 1.5 periods round up.
        assert_eq!(
            max_not_received_count(Duration::from_millis(90), Duration::from_millis(60)),
            2
        );
        assert_eq!(
            max_not_received_count(Duration::from_secs(60), Duration::from_secs(60)),
            1
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let handle = StopHandle::new();
        assert!(!handle.is_stopped());

        for _ in 0..3 {
            handle.stop();
        }
        assert!(handle.is_stopped());
        // Resolves immediately no matter how often stop was called.
        handle.cancelled().await;
    }

    #[test]
    fn test_billable_amount_is_lenient_on_first_billing() {
        let mut h = harness(3);
        // 60 s at 100 per minute is 100, reduced to 80 on the first bill.
        assert_eq!(h.tracker.billable_amount(), 80);

        let last = last_invoice(1, 100);
        h.tracker.last_exchange_message = Some(exchange_message_for(&last, 100));
        assert_eq!(h.tracker.billable_amount(), 100);
    }

    #[test]
    fn test_billable_amount_zero_total_is_still_first_billing() {
        let mut h = harness(3);
        let last = last_invoice(1, 0);
        // An exchange message acknowledging a zero total does not end the
        // leniency window.
        h.tracker.last_exchange_message = Some(exchange_message_for(&last, 0));
        assert_eq!(h.tracker.billable_amount(), 80);
    }

    // ------------------------------------------------------------------------
    // Accountant orchestration
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_first_round_requests_promise_without_reveal() {
        let h = harness(3);
        let last = last_invoice(1, 80);
        let em = exchange_message_for(&last, 80);

        h.tracker.settle_with_accountant(&em, &last).await.unwrap();

        assert!(h.accountant.reveals().is_empty());
        assert_eq!(h.accountant.promise_calls(), 1);

        // The preimage went durable under its agreement id.
        let stored_r = h
            .invoice_storage
            .get_r(&provider_id(), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_r, last.r.to_hex());

        // The promise record is live, unrevealed, and the event is out.
        let record = h
            .promise_storage
            .get(&provider_id(), &accountant_id())
            .await
            .unwrap()
            .unwrap();
        assert!(!record.revealed);
        assert_eq!(record.agreement_id, 1);
        assert_eq!(record.r, last.r.to_hex());

        let events = h.publisher.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            TrackerEvent::AccountantPromiseReceived { .. }
        ));
        assert_eq!(h.tracker.accountant_failure_count(), 0);
    }

    #[tokio::test]
    async fn test_second_round_reveals_previous_promise() {
        let h = harness(3);

        let first = last_invoice(1, 80);
        let em1 = exchange_message_for(&first, 80);
        h.tracker.settle_with_accountant(&em1, &first).await.unwrap();

        let second = last_invoice(1, 160);
        let em2 = exchange_message_for(&second, 160);
        h.tracker.settle_with_accountant(&em2, &second).await.unwrap();

        // Exactly one reveal: the first round's preimage, under the first
        // round's agreement id.
        assert_eq!(h.accountant.reveals(), vec![(first.r.to_hex(), 1)]);

        // The live record now belongs to the second round.
        let record = h
            .promise_storage
            .get(&provider_id(), &accountant_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.r, second.r.to_hex());
        assert!(!record.revealed);
        assert_eq!(h.publisher.events().len(), 2);
    }

    #[tokio::test]
    async fn test_reveal_failure_below_threshold_ends_round_early() {
        let h = harness(2);
        let first = last_invoice(1, 80);
        h.tracker
            .settle_with_accountant(&exchange_message_for(&first, 80), &first)
            .await
            .unwrap();
        assert_eq!(h.accountant.promise_calls(), 1);

        h.accountant
            .fail_next_reveal(AccountantError::transport("connection refused"));
        let second = last_invoice(1, 160);
        let outcome = h
            .tracker
            .settle_with_accountant(&exchange_message_for(&second, 160), &second)
            .await;

        // Absorbed, but no promise was requested this round.
        assert!(outcome.is_ok());
        assert_eq!(h.accountant.promise_calls(), 1);
        assert_eq!(h.tracker.accountant_failure_count(), 1);

        // The stored record is still unrevealed.
        let record = h
            .promise_storage
            .get(&provider_id(), &accountant_id())
            .await
            .unwrap()
            .unwrap();
        assert!(!record.revealed);
    }

    #[tokio::test]
    async fn test_reveal_failure_above_threshold_is_fatal() {
        let h = harness(0);
        let first = last_invoice(1, 80);
        h.tracker
            .settle_with_accountant(&exchange_message_for(&first, 80), &first)
            .await
            .unwrap();

        h.accountant
            .fail_next_reveal(AccountantError::transport("connection refused"));
        let second = last_invoice(1, 160);
        let outcome = h
            .tracker
            .settle_with_accountant(&exchange_message_for(&second, 160), &second)
            .await;

        assert!(matches!(outcome, Err(TrackerError::AccountantUnreachable(_))));
    }

    #[tokio::test]
    async fn test_successful_reveal_resets_counter_accumulated_earlier() {
        let h = harness(5);
        let first = last_invoice(1, 80);
        h.tracker
            .settle_with_accountant(&exchange_message_for(&first, 80), &first)
            .await
            .unwrap();

        // Two failed reveals, then one clean round.
        for amount in [160, 240] {
            h.accountant
                .fail_next_reveal(AccountantError::transport("down"));
            let li = last_invoice(1, amount);
            h.tracker
                .settle_with_accountant(&exchange_message_for(&li, amount), &li)
                .await
                .unwrap();
        }
        assert_eq!(h.tracker.accountant_failure_count(), 2);

        let li = last_invoice(1, 320);
        h.tracker
            .settle_with_accountant(&exchange_message_for(&li, 320), &li)
            .await
            .unwrap();
        assert_eq!(h.tracker.accountant_failure_count(), 0);
    }

    #[tokio::test]
    async fn test_promise_request_failure_is_absorbed_and_counted() {
        let h = harness(3);
        h.accountant
            .fail_next_promise(AccountantError::response("500 Internal Server Error"));

        let last = last_invoice(1, 80);
        let outcome = h
            .tracker
            .settle_with_accountant(&exchange_message_for(&last, 80), &last)
            .await;

        assert!(outcome.is_ok());
        assert_eq!(h.tracker.accountant_failure_count(), 1);
        assert!(h.publisher.events().is_empty());
        // No record was stored for the failed round.
        assert!(h
            .promise_storage
            .get(&provider_id(), &accountant_id())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_promise_request_failure_above_threshold_is_fatal() {
        let h = harness(1);
        h.accountant
            .fail_next_promise(AccountantError::response("500"));
        h.accountant
            .fail_next_promise(AccountantError::response("500"));

        let first = last_invoice(1, 80);
        assert!(h
            .tracker
            .settle_with_accountant(&exchange_message_for(&first, 80), &first)
            .await
            .is_ok());

        let second = last_invoice(1, 160);
        let outcome = h
            .tracker
            .settle_with_accountant(&exchange_message_for(&second, 160), &second)
            .await;
        assert!(matches!(outcome, Err(TrackerError::AccountantUnreachable(_))));
    }

    // ------------------------------------------------------------------------
    // R-recovery
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_protocol_mismatch_triggers_recovery_and_absorbs() {
        let h = harness(3);
        h.accountant
            .fail_next_promise(AccountantError::protocol_mismatch("400 Bad Request"));

        let last = last_invoice(1, 80);
        let outcome = h
            .tracker
            .settle_with_accountant(&exchange_message_for(&last, 80), &last)
            .await;

        assert!(outcome.is_ok());
        // Recovery revealed the current agreement's preimage, which the
        // round had just made durable, tagged with the current id.
        assert_eq!(h.accountant.reveals(), vec![(last.r.to_hex(), 1)]);
        // The failed request still counts against the threshold.
        assert_eq!(h.tracker.accountant_failure_count(), 1);
    }

    #[tokio::test]
    async fn test_recovery_walks_agreement_ids_backwards() {
        let h = harness(3);
        // Preimages of two earlier agreements are already durable.
        let r1 = Preimage::generate();
        let r2 = Preimage::generate();
        h.invoice_storage.store_r(&provider_id(), 1, &r1.to_hex()).await.unwrap();
        h.invoice_storage.store_r(&provider_id(), 2, &r2.to_hex()).await.unwrap();

        h.accountant
            .fail_next_promise(AccountantError::protocol_mismatch("400 Bad Request"));
        // First recovery reveal (current agreement) is rejected, the next
        // one (agreement 2) is accepted.
        h.accountant
            .fail_next_reveal(AccountantError::response("unknown agreement"));

        let last = last_invoice(3, 240);
        let outcome = h
            .tracker
            .settle_with_accountant(&exchange_message_for(&last, 240), &last)
            .await;

        assert!(outcome.is_ok());
        // Both reveals carry the *current* agreement id.
        assert_eq!(
            h.accountant.reveals(),
            vec![(last.r.to_hex(), 3), (r2.to_hex(), 3)]
        );
    }

    #[tokio::test]
    async fn test_recovery_is_idempotent_for_a_cooperating_accountant() {
        let h = harness(3);
        let last = last_invoice(2, 160);
        h.invoice_storage
            .store_r(&provider_id(), 2, &last.r.to_hex())
            .await
            .unwrap();

        h.tracker.initiate_r_recovery(&last).await.unwrap();
        h.tracker.initiate_r_recovery(&last).await.unwrap();

        // Same call, same arguments, both times; no state diverged.
        assert_eq!(
            h.accountant.reveals(),
            vec![(last.r.to_hex(), 2), (last.r.to_hex(), 2)]
        );
    }

    #[tokio::test]
    async fn test_exhausted_recovery_is_fatal() {
        let mut accountant = ScriptedAccountant::new();
        accountant.reveal_fails_always = true;
        let h = harness_with(accountant, 3);
        h.accountant
            .fail_next_promise(AccountantError::protocol_mismatch("400 Bad Request"));

        let last = last_invoice(1, 80);
        let outcome = h
            .tracker
            .settle_with_accountant(&exchange_message_for(&last, 80), &last)
            .await;

        assert!(matches!(outcome, Err(TrackerError::RRecoveryFailed)));
    }

    #[tokio::test]
    async fn test_recovery_with_missing_preimage_is_fatal() {
        let mut accountant = ScriptedAccountant::new();
        accountant.reveal_fails_always = true;
        let h = harness_with(accountant, 3);
        h.accountant
            .fail_next_promise(AccountantError::protocol_mismatch("400 Bad Request"));

        // Agreement 2's preimage goes durable during the round, agreement
        // 1's was never stored; the walkback cannot proceed past it.
        let last = last_invoice(2, 160);
        let outcome = h
            .tracker
            .settle_with_accountant(&exchange_message_for(&last, 160), &last)
            .await;

        assert!(matches!(outcome, Err(TrackerError::Storage(_))));
    }

    // ------------------------------------------------------------------------
    // Exchange message handling
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_cheating_amount_is_fatal_validation_failure() {
        let mut h = harness(3);
        let first = last_invoice(1, 80);
        h.tracker.last_exchange_message = Some(exchange_message_for(&first, 10));

        // Next promise shrinks from 10 to 5.
        let second = last_invoice(1, 160);
        let cheat = exchange_message_for(&second, 5);
        let outcome = h.tracker.handle_exchange_message(cheat, &second).await;

        assert!(matches!(
            outcome,
            Err(TrackerError::ExchangeValidation(
                ValidationError::Promise(_)
            ))
        ));
        // Nothing reached the accountant.
        assert_eq!(h.accountant.promise_calls(), 0);
    }

    #[tokio::test]
    async fn test_accepted_message_becomes_monotone_lower_bound() {
        let mut h = harness(3);
        let first = last_invoice(1, 80);
        let em = exchange_message_for(&first, 80);
        h.tracker.handle_exchange_message(em.clone(), &first).await.unwrap();

        assert_eq!(h.tracker.last_exchange_message, Some(em));
    }
}
