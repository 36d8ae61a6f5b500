use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use wallet_api::{AllocationId, ChannelId, ChannelResult, Outcome};

use crate::entity::payment_channels;
use crate::error::CacheError;

/// Decoded view of one cached channel row, handed to critical sections and
/// written back on release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub channel_id: ChannelId,
    pub context_id: AllocationId,
    pub turn_num: u64,
    pub payer_balance: U256,
    pub receiver_balance: U256,
    pub outcome: Outcome,
    pub app_data: Vec<u8>,
    pub retired: bool,
    pub updated_at: DateTime<Utc>,
}

impl ChannelSnapshot {
    pub fn from_model(model: &payment_channels::Model) -> Result<Self, CacheError> {
        let channel_id = ChannelId(model.channel_id.clone());
        let payer_balance = parse_balance(&channel_id, "payer_balance", &model.payer_balance)?;
        let receiver_balance =
            parse_balance(&channel_id, "receiver_balance", &model.receiver_balance)?;
        let outcome: Outcome =
            serde_json::from_value(model.outcome.clone()).map_err(|e| CacheError::Corrupt {
                channel_id: channel_id.clone(),
                reason: format!("outcome: {e}"),
            })?;

        Ok(Self {
            channel_id,
            context_id: AllocationId(model.context_id.clone()),
            turn_num: model.turn_number.max(0) as u64,
            payer_balance,
            receiver_balance,
            outcome,
            app_data: model.app_data.clone(),
            retired: model.retired,
            updated_at: model.updated_at,
        })
    }

    /// Snapshot of a wallet-reported result, as it would be persisted.
    pub fn from_result(result: &ChannelResult) -> Self {
        Self {
            channel_id: result.channel_id.clone(),
            context_id: result.context_id.clone(),
            turn_num: result.turn_num,
            payer_balance: result.payer_balance(),
            receiver_balance: result.receiver_balance(),
            outcome: result.outcome.clone(),
            app_data: result.app_data.clone(),
            retired: false,
            updated_at: Utc::now(),
        }
    }

    pub fn outcome_json(&self) -> Result<serde_json::Value, CacheError> {
        serde_json::to_value(&self.outcome).map_err(|e| CacheError::Corrupt {
            channel_id: self.channel_id.clone(),
            reason: format!("outcome encoding: {e}"),
        })
    }

    pub fn is_our_turn(&self) -> bool {
        self.turn_num % 2 == 1
    }
}

fn parse_balance(channel_id: &ChannelId, column: &str, raw: &str) -> Result<U256, CacheError> {
    raw.parse::<U256>().map_err(|e| CacheError::Corrupt {
        channel_id: channel_id.clone(),
        reason: format!("{column} {raw:?}: {e}"),
    })
}

/// Upsert law for `insert_channels`: a conflicting insert may only promote a
/// newly-created row (turn 0) to its first running state (turn 3), the
/// hand-off from "proposed" to "ready". Every other conflict is a no-op.
pub(crate) fn promotes(existing_turn: i64, incoming_turn: u64) -> bool {
    existing_turn == 0 && incoming_turn == 3
}
