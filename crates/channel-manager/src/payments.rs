//! One-shot payment construction and receipt handling.

use std::sync::Arc;

use alloy::primitives::U256;
use channel_cache::{ChannelCache, ChannelSnapshot, CriticalOutcome};
use tracing::debug;
use wallet_api::{AllocationId, Message, OutboxMessage, UpdateChannelRequest, Wallet};

use crate::attestation::{self, AttestationAppData};
use crate::error::PaymentError;

pub use crate::attestation::QueryOutcome;

/// One conditional micropayment for one query.
#[derive(Debug, Clone)]
pub struct Payment {
    pub allocation_id: AllocationId,
    pub amount: U256,
    pub request_cid: String,
    pub subgraph_deployment_id: String,
}

pub struct PaymentManager {
    wallet: Arc<dyn Wallet>,
    cache: Arc<ChannelCache>,
}

impl PaymentManager {
    pub fn new(wallet: Arc<dyn Wallet>, cache: Arc<ChannelCache>) -> Self {
        Self { wallet, cache }
    }

    /// Lease a free channel, advance it by one payment, and return the
    /// outgoing payload for the transport to deliver. The channel stays in
    /// flight (even turn) until the peer's receipt comes back through
    /// [`PaymentManager::submit_receipt`].
    ///
    /// [`PaymentError::NoFreeChannels`] is the back-pressure signal: nothing
    /// was mutated and the caller decides whether to shed or retry.
    pub async fn create_payment(&self, payment: &Payment) -> Result<OutboxMessage, PaymentError> {
        let wallet = Arc::clone(&self.wallet);
        let payment = payment.clone();
        let allocation_id = payment.allocation_id.clone();

        self.cache
            .acquire_channel(&allocation_id, move |snapshot: ChannelSnapshot| async move {
                let allocations =
                    attestation::next_payment_allocations(&snapshot.outcome, payment.amount)?;
                let app_data = AttestationAppData::QueryRequested {
                    request_cid: payment.request_cid.clone(),
                    subgraph_deployment_id: payment.subgraph_deployment_id.clone(),
                    amount: payment.amount,
                }
                .to_bytes()?;

                let update = wallet
                    .update_channel(UpdateChannelRequest {
                        channel_id: snapshot.channel_id.clone(),
                        allocation_items: allocations,
                        app_data,
                    })
                    .await?;

                let mut outbox = update.outbox.into_iter();
                let payload = match (outbox.next(), outbox.next()) {
                    (Some(payload), None) => payload,
                    (None, _) => {
                        return Err(PaymentError::ProtocolViolation(
                            "update_channel produced no outbox item".to_string(),
                        ))
                    }
                    (Some(_), Some(_)) => {
                        return Err(PaymentError::ProtocolViolation(format!(
                            "update_channel produced {} outbox items, expected one",
                            2 + outbox.count()
                        )))
                    }
                };

                debug!(
                    "Payment of {} built on channel {} (turn {})",
                    payment.amount, snapshot.channel_id, update.channel_result.turn_num
                );

                let mut updated = ChannelSnapshot::from_result(&update.channel_result);
                updated.retired = snapshot.retired;
                Ok(CriticalOutcome {
                    snapshot: updated,
                    result: payload,
                })
            })
            .await
    }

    /// Feed the peer's signed receipt back through the wallet and the cache,
    /// returning the parsed query response.
    pub async fn submit_receipt(&self, payload: Message) -> Result<QueryOutcome, PaymentError> {
        let pushed = self.wallet.push_message(payload).await?;

        if !pushed.outbox.is_empty() {
            return Err(PaymentError::ProtocolViolation(format!(
                "receipt produced {} outbox items, expected none",
                pushed.outbox.len()
            )));
        }
        let mut results = pushed.channel_results.into_iter();
        let result = match (results.next(), results.next()) {
            (Some(result), None) => result,
            (first, _) => {
                return Err(PaymentError::ProtocolViolation(format!(
                    "receipt produced {} channel results, expected one",
                    if first.is_none() { 0 } else { 2 + results.count() }
                )))
            }
        };

        let snapshot = self.cache.submit_receipt(&result).await?;
        attestation::parse_query_outcome(&snapshot.app_data)
    }
}
