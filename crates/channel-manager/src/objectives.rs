//! Objective completion with retry.
//!
//! The wallet tracks one objective per opening channel and reports terminal
//! success through an event stream. Driving a batch to completion means
//! exchanging the initial outbox payload, then re-syncing whatever is still
//! pending on an exponential backoff schedule until the stream has confirmed
//! every objective or the schedule runs out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use message_exchange::MessageExchange;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use wallet_api::{ChannelId, ChannelResult, Objective, ObjectiveId, OutboxMessage, Wallet};

use crate::config::BackoffStrategy;
use crate::error::ManagerError;

pub(crate) async fn ensure_objectives(
    wallet: &Arc<dyn Wallet>,
    exchange: &MessageExchange,
    backoff: &BackoffStrategy,
    objectives: Vec<Objective>,
    initial: OutboxMessage,
) -> Result<Vec<ChannelResult>, ManagerError> {
    // Subscribe before driving progress so no success event can slip past.
    let mut events = wallet.objective_events();
    let mut pending: HashSet<ObjectiveId> = objectives.iter().map(|o| o.id.clone()).collect();

    let mut collected: HashMap<ChannelId, ChannelResult> = exchange
        .exchange_messages_until_outbox_is_empty(initial)
        .await?;
    drain_successes(&mut events, &mut pending);

    for delay in backoff.delays() {
        if pending.is_empty() {
            break;
        }
        debug!("{} objectives pending; retrying in {:?}", pending.len(), delay);
        tokio::time::sleep(delay).await;
        drain_successes(&mut events, &mut pending);
        if pending.is_empty() {
            break;
        }

        let to_sync: Vec<Objective> = objectives
            .iter()
            .filter(|o| pending.contains(&o.id))
            .cloned()
            .collect();
        for objective in &to_sync {
            let sync = wallet.sync_channel(&objective.channel_id).await?;
            collected.insert(
                sync.channel_result.channel_id.clone(),
                sync.channel_result.clone(),
            );

            let mut outbox = sync.outbox.into_iter();
            match (outbox.next(), outbox.next()) {
                (None, _) => {}
                (Some(payload), None) => {
                    let results = exchange
                        .exchange_messages_until_outbox_is_empty(payload)
                        .await?;
                    collected.extend(results);
                }
                (Some(_), Some(_)) => {
                    return Err(ManagerError::ProtocolViolation(format!(
                        "sync_channel produced {} outbox items, expected at most one",
                        2 + outbox.count()
                    )));
                }
            }
            drain_successes(&mut events, &mut pending);
        }
    }
    drain_successes(&mut events, &mut pending);

    if !pending.is_empty() {
        let mut ids: Vec<ObjectiveId> = pending.into_iter().collect();
        ids.sort();
        warn!("Objectives not completed after retries: {:?}", ids);
        return Err(ManagerError::ObjectivesNotCompleted(ids));
    }

    Ok(collected.into_values().collect())
}

fn drain_successes(
    events: &mut broadcast::Receiver<ObjectiveId>,
    pending: &mut HashSet<ObjectiveId>,
) {
    loop {
        match events.try_recv() {
            Ok(id) => {
                if pending.remove(&id) {
                    debug!("Objective {} succeeded", id);
                }
            }
            Err(broadcast::error::TryRecvError::Empty) => break,
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                warn!("Objective event stream lagged; {} events lost", missed);
            }
            Err(broadcast::error::TryRecvError::Closed) => break,
        }
    }
}
