//! Typed pub/sub stream of channel lifecycle events.
//!
//! Producers post without blocking: each subscriber has its own bounded
//! queue, and a subscriber that falls behind loses the oldest events rather
//! than stalling the pool. Delivery is in-order per subscriber.

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use wallet_api::{AllocationId, AssetOutcome, ChannelId, ChannelResult, RetirementReport};

pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Condensed channel state carried by lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSummary {
    pub channel_id: ChannelId,
    pub context_id: AllocationId,
    pub turn_num: u64,
    /// First asset outcome, if the channel carries one.
    pub outcome: Option<AssetOutcome>,
}

impl From<&ChannelResult> for ChannelSummary {
    fn from(result: &ChannelResult) -> Self {
        Self {
            channel_id: result.channel_id.clone(),
            context_id: result.context_id.clone(),
            turn_num: result.turn_num,
            outcome: result.outcome.first().cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChannelInsight {
    /// Channels proposed to the peer.
    Created(Vec<ChannelSummary>),
    /// Channels that reached their first running state and joined the pool.
    Ready(Vec<ChannelSummary>),
    /// Stalled channels recovered by a sync pass.
    Synced(Vec<ChannelSummary>),
    /// An allocation's channels taken out of rotation.
    Retired(RetirementReport),
    /// Channels finalised and removed.
    Closed(Vec<ChannelSummary>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsightKind {
    Created,
    Ready,
    Synced,
    Retired,
    Closed,
}

impl ChannelInsight {
    pub fn kind(&self) -> InsightKind {
        match self {
            ChannelInsight::Created(_) => InsightKind::Created,
            ChannelInsight::Ready(_) => InsightKind::Ready,
            ChannelInsight::Synced(_) => InsightKind::Synced,
            ChannelInsight::Retired(_) => InsightKind::Retired,
            ChannelInsight::Closed(_) => InsightKind::Closed,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InsightRecvError {
    #[error("insight bus closed")]
    Closed,
}

/// Multi-consumer broadcast of channel lifecycle events.
#[derive(Clone)]
pub struct InsightsBus {
    tx: broadcast::Sender<ChannelInsight>,
}

impl InsightsBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Post an event. Never blocks; posting with no subscribers is fine.
    pub fn post(&self, insight: ChannelInsight) {
        debug!("Insight: {:?}", insight.kind());
        let _ = self.tx.send(insight);
    }

    /// Subscribe to every insight kind.
    pub fn channel_insights(&self) -> InsightSubscription {
        InsightSubscription {
            rx: self.tx.subscribe(),
            filter: None,
        }
    }

    pub fn channels_created(&self) -> InsightSubscription {
        self.filtered(InsightKind::Created)
    }

    pub fn channels_ready(&self) -> InsightSubscription {
        self.filtered(InsightKind::Ready)
    }

    pub fn channels_synced(&self) -> InsightSubscription {
        self.filtered(InsightKind::Synced)
    }

    pub fn channels_retired(&self) -> InsightSubscription {
        self.filtered(InsightKind::Retired)
    }

    pub fn channels_closed(&self) -> InsightSubscription {
        self.filtered(InsightKind::Closed)
    }

    fn filtered(&self, kind: InsightKind) -> InsightSubscription {
        InsightSubscription {
            rx: self.tx.subscribe(),
            filter: Some(kind),
        }
    }
}

impl Default for InsightsBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// One subscriber's view of the bus, optionally restricted to a single kind.
pub struct InsightSubscription {
    rx: broadcast::Receiver<ChannelInsight>,
    filter: Option<InsightKind>,
}

impl InsightSubscription {
    /// Next matching insight. A lagged subscriber skips the lost events and
    /// keeps receiving.
    pub async fn recv(&mut self) -> Result<ChannelInsight, InsightRecvError> {
        loop {
            match self.rx.recv().await {
                Ok(insight) => {
                    if self.filter.is_none() || self.filter == Some(insight.kind()) {
                        return Ok(insight);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Insight subscriber lagged; {} events lost", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(InsightRecvError::Closed),
            }
        }
    }

    /// Non-blocking variant; `None` when nothing matching is queued.
    pub fn try_recv(&mut self) -> Option<ChannelInsight> {
        loop {
            match self.rx.try_recv() {
                Ok(insight) => {
                    if self.filter.is_none() || self.filter == Some(insight.kind()) {
                        return Some(insight);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!("Insight subscriber lagged; {} events lost", missed);
                }
                Err(_) => return None,
            }
        }
    }
}
