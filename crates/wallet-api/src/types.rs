use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque channel identifier assigned by the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// External collaboration context a payment belongs to: one indexer, one
/// deployment. Channels are keyed by it in the cache (`context_id`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(pub String);

impl AllocationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AllocationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a wallet-tracked goal (e.g. "open channel X") that completes
/// asynchronously with an `objective_events` notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectiveId(pub String);

impl fmt::Display for ObjectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectiveId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Objective {
    pub id: ObjectiveId,
    pub channel_id: ChannelId,
}

/// The remote peer paid through an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indexer {
    pub url: String,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub indexer: Indexer,
    pub subgraph_deployment_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub signing_address: Address,
    pub destination: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Proposed,
    Opening,
    Funding,
    Running,
    Closing,
    Closed,
}

/// One payout bucket inside an asset outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationItem {
    pub destination: Address,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetOutcome {
    pub asset_holder: Address,
    pub allocation_items: Vec<AllocationItem>,
}

/// Serialised distribution of channel funds. The pool treats it as opaque
/// except for reading the payer/receiver buckets of the first asset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Outcome(pub Vec<AssetOutcome>);

impl Outcome {
    pub fn single(asset_holder: Address, allocation_items: Vec<AllocationItem>) -> Self {
        Self(vec![AssetOutcome {
            asset_holder,
            allocation_items,
        }])
    }

    pub fn first(&self) -> Option<&AssetOutcome> {
        self.0.first()
    }

    /// Balance of the first allocation item of the first asset (the payer).
    pub fn payer_balance(&self) -> U256 {
        self.bucket(0)
    }

    /// Balance of the second allocation item of the first asset (the receiver).
    pub fn receiver_balance(&self) -> U256 {
        self.bucket(1)
    }

    fn bucket(&self, index: usize) -> U256 {
        self.first()
            .and_then(|asset| asset.allocation_items.get(index))
            .map(|item| item.amount)
            .unwrap_or(U256::ZERO)
    }
}

/// Snapshot of one channel as reported by a wallet operation. Every result
/// produced by an operation is written through to the cache before the
/// operation is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelResult {
    pub channel_id: ChannelId,
    pub context_id: AllocationId,
    pub status: ChannelStatus,
    pub turn_num: u64,
    pub outcome: Outcome,
    pub app_data: Vec<u8>,
}

impl ChannelResult {
    pub fn payer_balance(&self) -> U256 {
        self.outcome.payer_balance()
    }

    pub fn receiver_balance(&self) -> U256 {
        self.outcome.receiver_balance()
    }

    /// Odd turn numbers are our move: the channel can fund a payment.
    pub fn is_our_turn(&self) -> bool {
        self.turn_num % 2 == 1
    }
}

/// Peer-addressed payload. A sum type with a single concrete variant; the
/// body stays opaque bytes except where the wallet reaches inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Signed {
        recipient: String,
        sender: String,
        data: Vec<u8>,
    },
}

impl Message {
    pub fn recipient(&self) -> &str {
        match self {
            Message::Signed { recipient, .. } => recipient,
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            Message::Signed { data, .. } => data,
        }
    }
}

/// One entry of a wallet outbox, ready to hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub recipient: String,
    pub message: Message,
}

/// How ledger channels acquire capital. `Direct` waits for on-chain
/// confirmations; `Fake` bypasses them (tests and local setups).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingStrategy {
    Direct,
    Fake,
}

/// Parameters for a batch of new payment channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartState {
    pub context_id: AllocationId,
    /// Gateway first, indexer second.
    pub participants: Vec<Participant>,
    pub asset_holder: Address,
    pub app_definition: Address,
    pub chain_id: u64,
    pub funding_amount: U256,
    pub challenge_duration_secs: u64,
    /// Set when the channels draw funding from a ledger channel.
    pub fund_from_ledger: Option<ChannelId>,
}

/// Parameters for a new ledger channel. Ledgers run null app data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerParams {
    pub context_id: AllocationId,
    pub participants: Vec<Participant>,
    pub asset_holder: Address,
    pub chain_id: u64,
    pub challenge_duration_secs: u64,
    pub outcome: Outcome,
}

/// Result of retiring the channels of one allocation: the total indexer
/// balance taken out of rotation, and which channels carried it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetirementReport {
    pub context_id: AllocationId,
    pub amount: U256,
    pub channel_ids: Vec<ChannelId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(payer: u64, receiver: u64) -> Outcome {
        Outcome::single(
            Address::ZERO,
            vec![
                AllocationItem {
                    destination: Address::ZERO,
                    amount: U256::from(payer),
                },
                AllocationItem {
                    destination: Address::repeat_byte(2),
                    amount: U256::from(receiver),
                },
            ],
        )
    }

    #[test]
    fn outcome_buckets() {
        let o = outcome(70, 30);
        assert_eq!(o.payer_balance(), U256::from(70));
        assert_eq!(o.receiver_balance(), U256::from(30));
        assert_eq!(Outcome::default().payer_balance(), U256::ZERO);
    }

    #[test]
    fn turn_parity() {
        let result = ChannelResult {
            channel_id: ChannelId::from("0xabc"),
            context_id: AllocationId::from("alloc-1"),
            status: ChannelStatus::Running,
            turn_num: 3,
            outcome: outcome(100, 0),
            app_data: vec![1],
        };
        assert!(result.is_our_turn());
        assert!(!ChannelResult {
            turn_num: 4,
            ..result
        }
        .is_our_turn());
    }

    #[test]
    fn message_roundtrip() {
        let message = Message::Signed {
            recipient: "peer".to_string(),
            sender: "us".to_string(),
            data: b"payload".to_vec(),
        };
        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.recipient(), "peer");
        assert_eq!(back, message);
    }
}
