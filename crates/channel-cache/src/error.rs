use thiserror::Error;
use wallet_api::{AllocationId, ChannelId, WalletError};

#[derive(Error, Debug)]
pub enum CacheError {
    /// Fast-path signal, not a fault: the acquire found no eligible row.
    /// Callers rely on it for back-pressure (the payment path maps it to
    /// HTTP 406).
    #[error("no free channels for allocation {0}")]
    NoFreeChannels(AllocationId),

    #[error("storage failure: {0}")]
    Storage(#[from] sea_orm::DbErr),

    #[error("channel not found: {0}")]
    NotFound(ChannelId),

    /// The stored row is on our turn: the channel is free or mid-lease, and
    /// writing a receipt over it would clobber that state.
    #[error("channel {channel_id} is at our turn {turn_number}; refusing receipt")]
    OurTurn {
        channel_id: ChannelId,
        turn_number: u64,
    },

    /// The submitted result does not advance the cached snapshot.
    #[error("stale result for channel {channel_id}: cached turn {cached}, submitted {submitted}")]
    StaleReceipt {
        channel_id: ChannelId,
        cached: u64,
        submitted: u64,
    },

    #[error("corrupt row for channel {channel_id}: {reason}")]
    Corrupt {
        channel_id: ChannelId,
        reason: String,
    },

    #[error("wallet read failed during reconciliation: {0}")]
    Reconcile(#[from] WalletError),
}
