use std::time::Duration;

use crate::proto::primitives::{Address, PaymentRate};

/// How long the loop tolerates a silent consumer in total. Divided by the
/// charge period it yields the number of consecutive unanswered invoices
/// allowed before the session is terminated.
pub const DEFAULT_CHARGE_PERIOD_LEEWAY: Duration = Duration::from_secs(2 * 60 * 60);

/// Immutable configuration of one tracker instance.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// The provider identity invoices are issued as.
    pub provider_id: Address,
    /// The accountant countersigning this session's promises.
    pub accountant_id: Address,
    /// The paying consumer.
    pub peer: Address,
    /// Address of the on-chain identity registry.
    pub registry: Address,
    /// Price of the service.
    pub payment_rate: PaymentRate,
    /// Interval between consecutive invoices.
    pub charge_period: Duration,
    /// Total tolerated consumer silence; see
    /// [`DEFAULT_CHARGE_PERIOD_LEEWAY`].
    pub charge_period_leeway: Duration,
    /// How long to wait for an exchange message after each invoice.
    pub exchange_message_wait_timeout: Duration,
    /// Accountant failures absorbed before the session is terminated.
    pub max_accountant_failure_count: u64,
    /// Upper bound on the accountant's fee, in hundredths of a percent.
    pub max_allowed_accountant_fee: u16,
    /// How many agreement ids R-recovery walks back at most.
    pub max_r_recovery_length: u64,
}

/// Configuration rejected at construction time.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("charge period must be greater than zero")]
    ZeroChargePeriod,
    #[error("exchange message wait timeout must be greater than zero")]
    ZeroExchangeMessageWaitTimeout,
    #[error("charge period leeway {leeway:?} is shorter than the charge period {period:?}")]
    LeewayShorterThanPeriod { leeway: Duration, period: Duration },
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.charge_period.is_zero() {
            return Err(ConfigError::ZeroChargePeriod);
        }
        if self.exchange_message_wait_timeout.is_zero() {
            return Err(ConfigError::ZeroExchangeMessageWaitTimeout);
        }
        if self.charge_period_leeway < self.charge_period {
            return Err(ConfigError::LeewayShorterThanPeriod {
                leeway: self.charge_period_leeway,
                period: self.charge_period,
            });
        }
        Ok(())
    }
}
