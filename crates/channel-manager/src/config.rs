use alloy::primitives::{Address, U256};
use std::time::Duration;
use wallet_api::FundingStrategy;

pub const DEFAULT_CREATE_CHUNK_SIZE: usize = 50;
pub const DEFAULT_CLOSE_CHUNK_SIZE: usize = 50;
pub const DEFAULT_SYNC_GROUP_CONCURRENCY: usize = 10;
pub const DEFAULT_SYNC_PER_PEER_CONCURRENCY: usize = 4;
pub const DEFAULT_CLOSE_ALLOCATION_CONCURRENCY: usize = 6;
pub const DEFAULT_CLOSE_CHUNK_CONCURRENCY: usize = 6;
pub const DEFAULT_LEDGER_CHALLENGE: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_PAYMENT_CHALLENGE: Duration = Duration::from_secs(10 * 60);

/// Exponential backoff schedule for objective-success polling: delays are
/// `initial_delay * 2^attempt` for `num_attempts` attempts.
#[derive(Debug, Clone)]
pub struct BackoffStrategy {
    pub initial_delay: Duration,
    pub num_attempts: u32,
}

impl BackoffStrategy {
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.num_attempts).map(|attempt| self.initial_delay * 2u32.saturating_pow(attempt))
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            num_attempts: 5,
        }
    }
}

/// On-chain challenge timeouts per channel kind.
#[derive(Debug, Clone)]
pub struct ChallengeDurations {
    pub ledger_channel: Duration,
    pub payment_channel: Duration,
}

impl Default for ChallengeDurations {
    fn default() -> Self {
        Self {
            ledger_channel: DEFAULT_LEDGER_CHALLENGE,
            payment_channel: DEFAULT_PAYMENT_CHALLENGE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub chain_id: u64,
    pub asset_holder: Address,
    pub attestation_app: Address,
    /// Bytecode registered with the wallet once at construction so a fresh
    /// wallet can evaluate the attestation app.
    pub attestation_app_bytecode: Vec<u8>,

    /// Max total a ledger may lock for one allocation.
    pub funds_per_allocation: U256,
    /// Per-channel stake. Payer + receiver balances sum to this for the
    /// channel's whole life.
    pub payment_channel_funding_amount: U256,
    pub funding_strategy: FundingStrategy,
    /// Whether payment channels draw funding from a ledger channel or stand
    /// alone.
    pub use_ledger: bool,

    /// Parallelism cap for per-allocation provisioning. Unbounded if unset,
    /// which can overload the peer.
    pub ensure_allocations_concurrency: Option<usize>,
    pub sync_opening_channels_poll_interval: Duration,
    pub sync_opening_channels_max_attempts: u32,
    pub challenge_duration: ChallengeDurations,
    pub backoff: BackoffStrategy,

    pub create_chunk_size: usize,
    pub close_chunk_size: usize,
    pub sync_group_concurrency: usize,
    pub sync_per_peer_concurrency: usize,
    pub close_allocation_concurrency: usize,
    pub close_chunk_concurrency: usize,
}

impl ManagerConfig {
    pub fn new(
        chain_id: u64,
        asset_holder: Address,
        attestation_app: Address,
        attestation_app_bytecode: Vec<u8>,
        funds_per_allocation: U256,
        payment_channel_funding_amount: U256,
    ) -> Self {
        Self {
            chain_id,
            asset_holder,
            attestation_app,
            attestation_app_bytecode,
            funds_per_allocation,
            payment_channel_funding_amount,
            funding_strategy: FundingStrategy::Direct,
            use_ledger: true,
            ensure_allocations_concurrency: Some(10),
            sync_opening_channels_poll_interval: Duration::from_millis(500),
            sync_opening_channels_max_attempts: 20,
            challenge_duration: ChallengeDurations::default(),
            backoff: BackoffStrategy::default(),
            create_chunk_size: DEFAULT_CREATE_CHUNK_SIZE,
            close_chunk_size: DEFAULT_CLOSE_CHUNK_SIZE,
            sync_group_concurrency: DEFAULT_SYNC_GROUP_CONCURRENCY,
            sync_per_peer_concurrency: DEFAULT_SYNC_PER_PEER_CONCURRENCY,
            close_allocation_concurrency: DEFAULT_CLOSE_ALLOCATION_CONCURRENCY,
            close_chunk_concurrency: DEFAULT_CLOSE_CHUNK_CONCURRENCY,
        }
    }

    /// Hard ceiling on channels per allocation:
    /// `funds_per_allocation / payment_channel_funding_amount`.
    pub fn max_capacity(&self) -> usize {
        if self.payment_channel_funding_amount.is_zero() {
            return 0;
        }
        let quotient = self.funds_per_allocation / self.payment_channel_funding_amount;
        usize::try_from(quotient).unwrap_or(usize::MAX)
    }
}
