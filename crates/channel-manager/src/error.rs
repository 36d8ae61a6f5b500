use alloy::primitives::U256;
use channel_cache::CacheError;
use message_exchange::ExchangeError;
use thiserror::Error;
use wallet_api::{AllocationId, ChannelId, ObjectiveId, WalletError};

#[derive(Error, Debug)]
pub enum ManagerError {
    /// Nonsensical capacity request. Surfaced, never retried.
    #[error("invalid capacity request: {0}")]
    Validation(String),

    /// The backoff schedule ran out before every objective succeeded. The
    /// affected channels stay in the cache and may be healed by a later sync
    /// pass.
    #[error("objectives not completed after retries: {0:?}")]
    ObjectivesNotCompleted(Vec<ObjectiveId>),

    #[error("channel {0} did not reach its running state")]
    ChannelNotOpen(ChannelId),

    /// The wallet returned something a correct system never produces.
    #[error("wallet protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

#[derive(Error, Debug)]
pub enum PaymentError {
    /// Fast-path back-pressure signal: every channel of the allocation is
    /// leased or in flight. The HTTP layer maps this to 406.
    #[error("no free channels for allocation {0}")]
    NoFreeChannels(AllocationId),

    #[error("payment amount {amount} exceeds payer balance {balance}")]
    InsufficientFunds { amount: U256, balance: U256 },

    #[error("wallet protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("app data codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Cache(CacheError),

    #[error(transparent)]
    Wallet(#[from] WalletError),
}

impl From<CacheError> for PaymentError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::NoFreeChannels(context) => PaymentError::NoFreeChannels(context),
            other => PaymentError::Cache(other),
        }
    }
}
