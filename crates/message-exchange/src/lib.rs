//! Drives a peer-to-peer handshake to quiescence.
//!
//! A wallet operation leaves an outbox payload addressed to the remote peer;
//! the exchange sends it, feeds the response back into the wallet, and
//! repeats until both sides converge on an empty outbox. Transport failures
//! are absorbed (logged, loop ends): channels stuck that way surface later as
//! stalled and are healed by a sync pass.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};
use wallet_api::{ChannelId, ChannelResult, Message, OutboxMessage, Wallet, WalletError};

/// Transport to the remote peer. No retry semantics are assumed: an error or
/// an empty response both mean "no response".
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, recipient: &str, message: &Message) -> anyhow::Result<Option<Message>>;
}

#[derive(Error, Debug)]
pub enum ExchangeError {
    /// The wallet produced more than one outbox item for a single-peer
    /// exchange. This never happens in a correct system; the current task
    /// aborts.
    #[error("wallet produced {0} outbox items for a single-peer exchange")]
    ProtocolViolation(usize),

    #[error(transparent)]
    Wallet(#[from] WalletError),
}

pub struct MessageExchange {
    wallet: Arc<dyn Wallet>,
    sender: Arc<dyn MessageSender>,
}

impl MessageExchange {
    pub fn new(wallet: Arc<dyn Wallet>, sender: Arc<dyn MessageSender>) -> Self {
        Self { wallet, sender }
    }

    /// Exchange messages with one peer until the outbox drains, returning the
    /// latest channel result observed per channel. On transport failure the
    /// results accumulated so far are returned (possibly none).
    pub async fn exchange_messages_until_outbox_is_empty(
        &self,
        initial: OutboxMessage,
    ) -> Result<HashMap<ChannelId, ChannelResult>, ExchangeError> {
        let mut accumulated: HashMap<ChannelId, ChannelResult> = HashMap::new();
        let mut outgoing = initial;
        let mut hops = 0u32;

        loop {
            hops += 1;
            let response = match self.sender.send(&outgoing.recipient, &outgoing.message).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        "Message delivery to {} failed after {} hops: {:#}",
                        outgoing.recipient, hops, e
                    );
                    return Ok(accumulated);
                }
            };

            let Some(response) = response else {
                debug!(
                    "Peer {} went quiet after {} hops; exchange over",
                    outgoing.recipient, hops
                );
                return Ok(accumulated);
            };

            let pushed = self.wallet.push_message(response).await?;
            for result in pushed.channel_results {
                accumulated.insert(result.channel_id.clone(), result);
            }

            let mut outbox = pushed.outbox.into_iter();
            match (outbox.next(), outbox.next()) {
                (None, _) => {
                    debug!(
                        "Exchange with {} converged after {} hops ({} channels)",
                        outgoing.recipient,
                        hops,
                        accumulated.len()
                    );
                    return Ok(accumulated);
                }
                (Some(next), None) => outgoing = next,
                (Some(_), Some(_)) => {
                    return Err(ExchangeError::ProtocolViolation(2 + outbox.count()));
                }
            }
        }
    }
}
