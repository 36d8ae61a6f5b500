use alloy::primitives::Address;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::{
    AllocationItem, ChannelId, ChannelResult, FundingStrategy, LedgerParams, Message, Objective,
    ObjectiveId, OutboxMessage, Participant, StartState,
};

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("channel not found: {0}")]
    ChannelNotFound(ChannelId),

    #[error("signing failure: {0}")]
    Signing(String),

    #[error("wallet store failure: {0}")]
    Store(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct CreateChannelsResult {
    pub channel_results: Vec<ChannelResult>,
    /// One item expected per batch.
    pub outbox: Vec<OutboxMessage>,
    pub new_objectives: Vec<Objective>,
}

#[derive(Debug, Clone)]
pub struct CreateLedgerResult {
    pub channel_result: ChannelResult,
    pub outbox: Vec<OutboxMessage>,
}

#[derive(Debug, Clone)]
pub struct UpdateChannelRequest {
    pub channel_id: ChannelId,
    pub allocation_items: Vec<AllocationItem>,
    pub app_data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct UpdateChannelResult {
    pub channel_result: ChannelResult,
    pub outbox: Vec<OutboxMessage>,
}

#[derive(Debug, Clone)]
pub struct PushMessageResult {
    pub channel_results: Vec<ChannelResult>,
    pub outbox: Vec<OutboxMessage>,
}

#[derive(Debug, Clone)]
pub struct SyncChannelResult {
    pub channel_result: ChannelResult,
    pub outbox: Vec<OutboxMessage>,
}

#[derive(Debug, Clone)]
pub struct CloseChannelsResult {
    pub outbox: Vec<OutboxMessage>,
}

/// The cryptographic state-channel wallet. Process-wide service shared by all
/// managers; owns the signed states, while the cache owns the channel rows.
///
/// `push_message` is idempotent: re-entry on the same payload yields the same
/// result.
#[async_trait]
pub trait Wallet: Send + Sync {
    async fn create_channels(
        &self,
        start_state: StartState,
        count: usize,
    ) -> Result<CreateChannelsResult, WalletError>;

    async fn create_ledger_channel(
        &self,
        params: LedgerParams,
        strategy: FundingStrategy,
    ) -> Result<CreateLedgerResult, WalletError>;

    async fn update_channel(
        &self,
        request: UpdateChannelRequest,
    ) -> Result<UpdateChannelResult, WalletError>;

    async fn push_message(&self, message: Message) -> Result<PushMessageResult, WalletError>;

    async fn sync_channel(&self, channel_id: &ChannelId) -> Result<SyncChannelResult, WalletError>;

    async fn close_channels(
        &self,
        channel_ids: &[ChannelId],
    ) -> Result<CloseChannelsResult, WalletError>;

    /// Read view of every channel the wallet holds state for; used to
    /// reconcile the cache on startup.
    async fn get_channels(&self) -> Result<Vec<ChannelResult>, WalletError>;

    async fn get_ledger_channels(
        &self,
        asset_holder: Address,
        participants: &[Participant],
    ) -> Result<Vec<ChannelResult>, WalletError>;

    /// One-time registration, idempotent by address.
    async fn register_app_bytecode(
        &self,
        app_definition: Address,
        bytecode: Vec<u8>,
    ) -> Result<(), WalletError>;

    /// Our participant signing address.
    fn signing_address(&self) -> Address;

    /// Subscription to objective-success events. Fires exactly once per
    /// objective reaching terminal success.
    fn objective_events(&self) -> broadcast::Receiver<ObjectiveId>;
}
