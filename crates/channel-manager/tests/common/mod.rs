//! Test doubles for the wallet and the transport.
//!
//! `MockWallet` keeps an in-memory channel table and speaks a tiny JSON
//! protocol over the opaque payload bytes; `FakePeer` answers each payload
//! kind with its acknowledgement, so a full propose/join, payment/receipt,
//! sync, and close handshake runs without any cryptography.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use channel_manager::attestation::AttestationAppData;
use channel_manager::{BackoffStrategy, ManagerConfig};
use message_exchange::MessageSender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use wallet_api::{
    Allocation, AllocationId, AllocationItem, ChannelId, ChannelResult, ChannelStatus,
    CloseChannelsResult, CreateChannelsResult, CreateLedgerResult, FundingStrategy, Indexer,
    LedgerParams, Message, Objective, ObjectiveId, Outcome, OutboxMessage, Participant,
    PushMessageResult, StartState, SyncChannelResult, UpdateChannelRequest, UpdateChannelResult,
    Wallet, WalletError,
};

pub const GATEWAY_ADDRESS: Address = Address::repeat_byte(0xAA);
pub const INDEXER_ADDRESS: Address = Address::repeat_byte(0xBB);

/// Body of every payload exchanged with the fake peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerMsg {
    pub kind: String,
    pub channels: Vec<String>,
}

impl PeerMsg {
    pub fn new(kind: &str, channels: Vec<String>) -> Self {
        Self {
            kind: kind.to_string(),
            channels,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("peer message encodes")
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

fn receipt_app_data() -> Vec<u8> {
    AttestationAppData::AttestationProvided {
        response_cid: "Qm-response".to_string(),
        signature: vec![0x51, 0x67],
    }
    .to_bytes()
    .expect("app data encodes")
}

struct MockChannel {
    result: ChannelResult,
    recipient: String,
    objective_id: Option<ObjectiveId>,
    is_ledger: bool,
}

struct Inner {
    channels: HashMap<String, MockChannel>,
    registered_apps: HashMap<Address, Vec<u8>>,
    next_id: u64,
}

pub struct MockWallet {
    inner: Mutex<Inner>,
    events: broadcast::Sender<ObjectiveId>,
    fail_pushes: AtomicBool,
}

impl MockWallet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                channels: HashMap::new(),
                registered_apps: HashMap::new(),
                next_id: 0,
            }),
            events: broadcast::channel(64).0,
            fail_pushes: AtomicBool::new(false),
        }
    }

    /// Make every `push_message` fail, as if the peer's messages no longer
    /// verify.
    pub fn fail_pushes(&self, on: bool) {
        self.fail_pushes.store(on, Ordering::SeqCst);
    }

    pub fn channel_turn(&self, channel_id: &ChannelId) -> Option<u64> {
        self.inner
            .lock()
            .channels
            .get(channel_id.as_str())
            .map(|c| c.result.turn_num)
    }

    pub fn registered_app_count(&self) -> usize {
        self.inner.lock().registered_apps.len()
    }

    fn outbox_message(recipient: &str, msg: &PeerMsg) -> OutboxMessage {
        OutboxMessage {
            recipient: recipient.to_string(),
            message: Message::Signed {
                recipient: recipient.to_string(),
                sender: "gateway".to_string(),
                data: msg.encode(),
            },
        }
    }
}

#[async_trait]
impl Wallet for MockWallet {
    async fn create_channels(
        &self,
        start_state: StartState,
        count: usize,
    ) -> Result<CreateChannelsResult, WalletError> {
        let mut inner = self.inner.lock();
        let recipient = start_state.participants[1].signing_address.to_string();
        let outcome = Outcome::single(
            start_state.asset_holder,
            vec![
                AllocationItem {
                    destination: start_state.participants[0].destination,
                    amount: start_state.funding_amount,
                },
                AllocationItem {
                    destination: start_state.participants[1].destination,
                    amount: U256::ZERO,
                },
            ],
        );

        let mut channel_results = Vec::with_capacity(count);
        let mut new_objectives = Vec::with_capacity(count);
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = format!("0xchan-{:04}", inner.next_id);
            inner.next_id += 1;
            let objective_id = ObjectiveId(format!("open-{id}"));
            let result = ChannelResult {
                channel_id: ChannelId(id.clone()),
                context_id: start_state.context_id.clone(),
                status: ChannelStatus::Proposed,
                turn_num: 0,
                outcome: outcome.clone(),
                app_data: AttestationAppData::QueryDeclined { status: 0 }
                    .to_bytes()
                    .expect("app data encodes"),
            };
            channel_results.push(result.clone());
            new_objectives.push(Objective {
                id: objective_id.clone(),
                channel_id: ChannelId(id.clone()),
            });
            inner.channels.insert(
                id.clone(),
                MockChannel {
                    result,
                    recipient: recipient.clone(),
                    objective_id: Some(objective_id),
                    is_ledger: false,
                },
            );
            ids.push(id);
        }

        let outbox = vec![Self::outbox_message(&recipient, &PeerMsg::new("propose", ids))];
        Ok(CreateChannelsResult {
            channel_results,
            outbox,
            new_objectives,
        })
    }

    async fn create_ledger_channel(
        &self,
        params: LedgerParams,
        strategy: FundingStrategy,
    ) -> Result<CreateLedgerResult, WalletError> {
        let mut inner = self.inner.lock();
        let id = format!("0xledger-{:04}", inner.next_id);
        inner.next_id += 1;
        let recipient = params.participants[1].signing_address.to_string();
        let result = ChannelResult {
            channel_id: ChannelId(id.clone()),
            context_id: params.context_id.clone(),
            status: match strategy {
                FundingStrategy::Fake => ChannelStatus::Running,
                FundingStrategy::Direct => ChannelStatus::Funding,
            },
            turn_num: 3,
            outcome: params.outcome.clone(),
            // Ledgers run null app data.
            app_data: Vec::new(),
        };
        inner.channels.insert(
            id.clone(),
            MockChannel {
                result: result.clone(),
                recipient: recipient.clone(),
                objective_id: None,
                is_ledger: true,
            },
        );
        let outbox = vec![Self::outbox_message(
            &recipient,
            &PeerMsg::new("ledger", vec![id]),
        )];
        Ok(CreateLedgerResult {
            channel_result: result,
            outbox,
        })
    }

    async fn update_channel(
        &self,
        request: UpdateChannelRequest,
    ) -> Result<UpdateChannelResult, WalletError> {
        let mut inner = self.inner.lock();
        let channel = inner
            .channels
            .get_mut(request.channel_id.as_str())
            .ok_or_else(|| WalletError::ChannelNotFound(request.channel_id.clone()))?;

        channel.result.turn_num += 1;
        channel.result.outcome = Outcome::single(
            channel
                .result
                .outcome
                .first()
                .map(|a| a.asset_holder)
                .unwrap_or(Address::ZERO),
            request.allocation_items,
        );
        channel.result.app_data = request.app_data;

        let recipient = channel.recipient.clone();
        let result = channel.result.clone();
        let outbox = vec![Self::outbox_message(
            &recipient,
            &PeerMsg::new("payment", vec![request.channel_id.0.clone()]),
        )];
        Ok(UpdateChannelResult {
            channel_result: result,
            outbox,
        })
    }

    async fn push_message(&self, message: Message) -> Result<PushMessageResult, WalletError> {
        if self.fail_pushes.load(Ordering::SeqCst) {
            return Err(WalletError::Signing(
                "peer state does not verify".to_string(),
            ));
        }
        let Some(msg) = PeerMsg::decode(message.data()) else {
            return Ok(PushMessageResult {
                channel_results: vec![],
                outbox: vec![],
            });
        };

        let mut inner = self.inner.lock();
        let mut channel_results = Vec::new();
        for id in &msg.channels {
            let Some(channel) = inner.channels.get_mut(id) else {
                continue;
            };
            match msg.kind.as_str() {
                "join" => {
                    if channel.result.turn_num == 0 {
                        channel.result.turn_num = 3;
                        channel.result.status = ChannelStatus::Running;
                        if let Some(objective) = channel.objective_id.take() {
                            let _ = self.events.send(objective);
                        }
                    }
                }
                "sync_ack" => {
                    if channel.result.turn_num == 0 {
                        channel.result.turn_num = 3;
                        channel.result.status = ChannelStatus::Running;
                        if let Some(objective) = channel.objective_id.take() {
                            let _ = self.events.send(objective);
                        }
                    } else if channel.result.turn_num % 2 == 0 {
                        channel.result.turn_num += 1;
                        channel.result.app_data = receipt_app_data();
                    }
                }
                "receipt" => {
                    if channel.result.turn_num % 2 == 0 && channel.result.turn_num >= 4 {
                        channel.result.turn_num += 1;
                        channel.result.app_data = receipt_app_data();
                    }
                }
                "ledger_ack" => {
                    channel.result.status = ChannelStatus::Running;
                }
                "close_ack" => {
                    channel.result.status = ChannelStatus::Closed;
                }
                _ => {}
            }
            channel_results.push(channel.result.clone());
        }

        Ok(PushMessageResult {
            channel_results,
            outbox: vec![],
        })
    }

    async fn sync_channel(&self, channel_id: &ChannelId) -> Result<SyncChannelResult, WalletError> {
        let inner = self.inner.lock();
        let channel = inner
            .channels
            .get(channel_id.as_str())
            .ok_or_else(|| WalletError::ChannelNotFound(channel_id.clone()))?;

        let needs_ledger_confirmation =
            channel.is_ledger && !matches!(channel.result.status, ChannelStatus::Running);
        let outbox = if needs_ledger_confirmation {
            vec![Self::outbox_message(
                &channel.recipient,
                &PeerMsg::new("ledger", vec![channel_id.0.clone()]),
            )]
        } else if channel.result.turn_num % 2 == 0 {
            vec![Self::outbox_message(
                &channel.recipient,
                &PeerMsg::new("sync", vec![channel_id.0.clone()]),
            )]
        } else {
            vec![]
        };

        Ok(SyncChannelResult {
            channel_result: channel.result.clone(),
            outbox,
        })
    }

    async fn close_channels(
        &self,
        channel_ids: &[ChannelId],
    ) -> Result<CloseChannelsResult, WalletError> {
        let mut inner = self.inner.lock();
        let mut recipient = None;
        for id in channel_ids {
            if let Some(channel) = inner.channels.get_mut(id.as_str()) {
                channel.result.status = ChannelStatus::Closing;
                recipient.get_or_insert_with(|| channel.recipient.clone());
            }
        }
        let outbox = match recipient {
            Some(recipient) => vec![Self::outbox_message(
                &recipient,
                &PeerMsg::new(
                    "close",
                    channel_ids.iter().map(|id| id.0.clone()).collect(),
                ),
            )],
            None => vec![],
        };
        Ok(CloseChannelsResult { outbox })
    }

    async fn get_channels(&self) -> Result<Vec<ChannelResult>, WalletError> {
        Ok(self
            .inner
            .lock()
            .channels
            .values()
            .map(|c| c.result.clone())
            .collect())
    }

    async fn get_ledger_channels(
        &self,
        _asset_holder: Address,
        _participants: &[Participant],
    ) -> Result<Vec<ChannelResult>, WalletError> {
        Ok(self
            .inner
            .lock()
            .channels
            .values()
            .filter(|c| c.is_ledger)
            .map(|c| c.result.clone())
            .collect())
    }

    async fn register_app_bytecode(
        &self,
        app_definition: Address,
        bytecode: Vec<u8>,
    ) -> Result<(), WalletError> {
        self.inner
            .lock()
            .registered_apps
            .entry(app_definition)
            .or_insert(bytecode);
        Ok(())
    }

    fn signing_address(&self) -> Address {
        GATEWAY_ADDRESS
    }

    fn objective_events(&self) -> broadcast::Receiver<ObjectiveId> {
        self.events.subscribe()
    }
}

/// Transport double answering each payload kind with its acknowledgement.
pub struct FakePeer {
    drop_next: AtomicUsize,
    fail_all: AtomicBool,
    sent: AtomicUsize,
}

impl FakePeer {
    pub fn new() -> Self {
        Self {
            drop_next: AtomicUsize::new(0),
            fail_all: AtomicBool::new(false),
            sent: AtomicUsize::new(0),
        }
    }

    /// Swallow the next `n` deliveries (no response, no error).
    pub fn drop_next(&self, n: usize) {
        self.drop_next.store(n, Ordering::SeqCst);
    }

    /// Fail every delivery with a transport error.
    pub fn fail_all(&self, on: bool) {
        self.fail_all.store(on, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSender for FakePeer {
    async fn send(&self, recipient: &str, message: &Message) -> anyhow::Result<Option<Message>> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        if self.fail_all.load(Ordering::SeqCst) {
            anyhow::bail!("peer {recipient} unreachable");
        }
        if self
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(None);
        }

        let Some(msg) = PeerMsg::decode(message.data()) else {
            return Ok(None);
        };
        let kind = match msg.kind.as_str() {
            "propose" => "join",
            "payment" => "receipt",
            "sync" => "sync_ack",
            "ledger" => "ledger_ack",
            "close" => "close_ack",
            _ => return Ok(None),
        };
        Ok(Some(Message::Signed {
            recipient: "gateway".to_string(),
            sender: recipient.to_string(),
            data: PeerMsg::new(kind, msg.channels).encode(),
        }))
    }
}

/// The receipt the peer would send back for a payment payload.
pub fn receipt_for(payload: &OutboxMessage) -> Message {
    let msg = PeerMsg::decode(payload.message.data()).expect("payment payload decodes");
    Message::Signed {
        recipient: "gateway".to_string(),
        sender: payload.recipient.clone(),
        data: PeerMsg::new("receipt", msg.channels).encode(),
    }
}

pub fn test_allocation(id: &str) -> Allocation {
    Allocation {
        id: AllocationId::from(id),
        indexer: Indexer {
            url: "http://indexer.local:7600".to_string(),
            address: INDEXER_ADDRESS,
        },
        subgraph_deployment_id: "0xdeployment".to_string(),
    }
}

/// Manager configuration sized for fast tests: ten 100-unit channels per
/// allocation at most, tight polling, and a short backoff schedule.
pub fn test_config(use_ledger: bool) -> ManagerConfig {
    let mut config = ManagerConfig::new(
        1337,
        Address::repeat_byte(0x01),
        Address::repeat_byte(0x02),
        vec![0xFE, 0xED],
        U256::from(1000),
        U256::from(100),
    );
    config.funding_strategy = FundingStrategy::Fake;
    config.use_ledger = use_ledger;
    config.ensure_allocations_concurrency = Some(4);
    config.sync_opening_channels_poll_interval = Duration::from_millis(20);
    config.sync_opening_channels_max_attempts = 10;
    config.backoff = BackoffStrategy {
        initial_delay: Duration::from_millis(50),
        num_attempts: 3,
    };
    config
}
