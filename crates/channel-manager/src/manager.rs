//! The capacity controller.
//!
//! Maintains `active_channels(allocation) == requested_capacity` for every
//! known allocation, issuing wallet operations and message exchanges to
//! open, heal, retire, and close channels. Never proactively tears down
//! excess capacity: plans only grow an allocation, removal retires it whole.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;
use channel_cache::{CacheError, ChannelCache};
use futures::{StreamExt, TryStreamExt};
use insights::{ChannelInsight, ChannelSummary, InsightsBus};
use message_exchange::{MessageExchange, MessageSender};
use tracing::{debug, info, warn};
use wallet_api::{
    Allocation, AllocationId, AllocationItem, ChannelId, ChannelResult, ChannelStatus,
    LedgerParams, Outcome, OutboxMessage, Participant, StartState, Wallet,
};

use crate::capacity::{self, AllocationPlan};
use crate::config::ManagerConfig;
use crate::error::ManagerError;
use crate::named_lock::NamedLocks;
use crate::objectives;

/// Name of the lock serialising concurrent capacity plans.
const SYNC_ALLOCATIONS_LOCK: &str = "syncAllocations";

pub struct ChannelManager {
    wallet: Arc<dyn Wallet>,
    cache: Arc<ChannelCache>,
    exchange: MessageExchange,
    insights: InsightsBus,
    locks: NamedLocks,
    config: ManagerConfig,
}

impl ChannelManager {
    /// Construct the manager and register the attestation app bytecode with
    /// the wallet (idempotent by address).
    pub async fn new(
        wallet: Arc<dyn Wallet>,
        sender: Arc<dyn MessageSender>,
        cache: Arc<ChannelCache>,
        insights: InsightsBus,
        config: ManagerConfig,
    ) -> Result<Self, ManagerError> {
        wallet
            .register_app_bytecode(
                config.attestation_app,
                config.attestation_app_bytecode.clone(),
            )
            .await?;
        let exchange = MessageExchange::new(wallet.clone(), sender);
        Ok(Self {
            wallet,
            cache,
            exchange,
            insights,
            locks: NamedLocks::new(),
            config,
        })
    }

    pub fn insights(&self) -> &InsightsBus {
        &self.insights
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Non-retired channel counts per allocation.
    pub async fn channel_count(
        &self,
        allocation_ids: Option<&[AllocationId]>,
    ) -> Result<HashMap<AllocationId, usize>, ManagerError> {
        Ok(self.cache.active_allocations(allocation_ids).await?)
    }

    /// Grow allocations towards their requested capacities. Validation
    /// failures abort the whole batch before any wallet work starts.
    pub async fn ensure_allocations(
        &self,
        plans: Vec<AllocationPlan>,
    ) -> Result<(), ManagerError> {
        if plans.is_empty() {
            return Ok(());
        }
        let current = self.cache.active_allocations(None).await?;
        let max_capacity = self.config.max_capacity();

        let mut targets = Vec::with_capacity(plans.len());
        for plan in plans {
            let current_count = current.get(&plan.allocation.id).copied().unwrap_or(0);
            let desired = capacity::target_capacity(plan.adjustment, current_count)?;
            let capacity = if desired > max_capacity {
                warn!(
                    "Requested capacity {} for allocation {} exceeds the funding ceiling {}; clamping",
                    desired, plan.allocation.id, max_capacity
                );
                max_capacity
            } else {
                desired
            };
            targets.push((plan.allocation, capacity));
        }

        let concurrency = self
            .config
            .ensure_allocations_concurrency
            .unwrap_or_else(|| targets.len())
            .max(1);
        futures::stream::iter(
            targets
                .into_iter()
                .map(|(allocation, capacity)| self.ensure_allocation(allocation, capacity)),
        )
        .buffer_unordered(concurrency)
        .try_collect::<Vec<_>>()
        .await?;
        Ok(())
    }

    /// Converge on exactly the requested set of allocations: grow the
    /// requested ones, retire everything else, finalise what was retired,
    /// then close the orphaned ledgers. Serialised by a named lock so two
    /// concurrent plans cannot interleave their read-diff-dispatch windows.
    pub async fn sync_allocations(&self, plans: Vec<AllocationPlan>) -> Result<(), ManagerError> {
        let _guard = self.locks.acquire(SYNC_ALLOCATIONS_LOCK).await;

        let current = self.cache.active_allocations(None).await?;
        let requested: HashSet<&AllocationId> = plans.iter().map(|p| &p.allocation.id).collect();
        let to_remove: Vec<AllocationId> = current
            .keys()
            .filter(|id| !requested.contains(id))
            .cloned()
            .collect();
        let ensured = plans.len();

        self.ensure_allocations(plans).await?;
        self.retire_allocations(&to_remove).await?;
        self.close_retired().await?;
        if self.config.use_ledger {
            self.close_ledgers(&to_remove).await?;
        }

        info!(
            "Allocation plan applied: {} ensured, {} removed",
            ensured,
            to_remove.len()
        );
        Ok(())
    }

    /// Retire and finalise a set of allocations.
    pub async fn remove_allocations(&self, ids: &[AllocationId]) -> Result<(), ManagerError> {
        self.retire_allocations(ids).await?;
        self.close_retired().await?;
        if self.config.use_ledger {
            self.close_ledgers(ids).await?;
        }
        Ok(())
    }

    async fn retire_allocations(&self, ids: &[AllocationId]) -> Result<(), ManagerError> {
        for id in ids {
            let report = self.cache.retire_channels(id).await?;
            if !report.channel_ids.is_empty() {
                self.insights.post(ChannelInsight::Retired(report));
            }
        }
        Ok(())
    }

    /// Drive one allocation to its capacity.
    async fn ensure_allocation(
        &self,
        allocation: Allocation,
        capacity: usize,
    ) -> Result<(), ManagerError> {
        // An existing ledger may be behind after a restart; sync it first.
        let existing_ledger = self
            .cache
            .get_ledger_channels(&allocation.id)
            .await?
            .into_iter()
            .next();
        if let Some(ledger) = &existing_ledger {
            self.synchronize_channel(&ledger.channel_id).await?;
        }

        let active = self.cache.active_channels(&allocation.id).await?;

        // Channels stuck at turn 0 may be re-activatable; heal them before
        // deciding how many more to open.
        let readying = self.cache.readying_channels(&allocation.id).await?;
        if !readying.is_empty() {
            debug!(
                "Allocation {} has {} channels stuck at turn 0; syncing them first",
                allocation.id,
                readying.len()
            );
            let contexts = [allocation.id.clone()];
            self.sync_channels(Duration::ZERO, None, Some(&contexts))
                .await?;
        }

        let required = capacity.saturating_sub(active.len());
        if required == 0 {
            debug!(
                "Allocation {} already holds {} of {} channels",
                allocation.id,
                active.len(),
                capacity
            );
            return Ok(());
        }
        info!(
            "Opening {} channels for allocation {} towards capacity {}",
            required, allocation.id, capacity
        );

        let mut start_state = self.start_state(&allocation);
        if self.config.use_ledger {
            let ledger_id = match existing_ledger {
                Some(ledger) => ledger.channel_id,
                None => self.create_ledger(&allocation).await?,
            };
            self.ensure_channel_open(&ledger_id).await?;
            start_state.fund_from_ledger = Some(ledger_id);
        }

        let mut remaining = required;
        while remaining > 0 {
            let chunk = remaining.min(self.config.create_chunk_size.max(1));
            remaining -= chunk;
            self.open_chunk(&allocation.id, start_state.clone(), chunk)
                .await?;
        }
        Ok(())
    }

    async fn open_chunk(
        &self,
        context: &AllocationId,
        start_state: StartState,
        count: usize,
    ) -> Result<(), ManagerError> {
        let created = self.wallet.create_channels(start_state, count).await?;

        let mut outbox = created.outbox.into_iter();
        let payload = match (outbox.next(), outbox.next()) {
            (Some(payload), None) => payload,
            (None, _) => {
                return Err(ManagerError::ProtocolViolation(
                    "create_channels produced no outbox item".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(ManagerError::ProtocolViolation(format!(
                    "create_channels produced {} outbox items, expected one",
                    2 + outbox.count()
                )))
            }
        };

        self.insights.post(ChannelInsight::Created(
            created
                .channel_results
                .iter()
                .map(ChannelSummary::from)
                .collect(),
        ));

        let results = objectives::ensure_objectives(
            &self.wallet,
            &self.exchange,
            &self.config.backoff,
            created.new_objectives,
            payload,
        )
        .await?;

        let running: Vec<ChannelResult> = results
            .into_iter()
            .filter(|result| matches!(result.status, ChannelStatus::Running))
            .collect();
        let inserted = self.cache.insert_channels(context, &running).await?;
        let ready: Vec<ChannelSummary> = running
            .iter()
            .filter(|result| inserted.contains(&result.channel_id))
            .map(ChannelSummary::from)
            .collect();
        if !ready.is_empty() {
            self.insights.post(ChannelInsight::Ready(ready));
        }
        Ok(())
    }

    /// Heal channels stuck on the peer's move for at least `stalled_for`.
    /// Returns the ids that came back to our turn (an odd turn number of at
    /// least 3). An allocation whose peer fails an exchange is retired
    /// whole: the peer is presumed uncooperative.
    pub async fn sync_channels(
        &self,
        stalled_for: Duration,
        limit: Option<u64>,
        allocation_ids: Option<&[AllocationId]>,
    ) -> Result<Vec<ChannelId>, ManagerError> {
        let stalled = self
            .cache
            .stalled_channels(stalled_for, limit, allocation_ids)
            .await?;
        if stalled.is_empty() {
            return Ok(Vec::new());
        }
        info!("Syncing {} stalled channels", stalled.len());

        struct SyncItem {
            context_id: AllocationId,
            payload: OutboxMessage,
        }

        // One re-send payload per channel; one exchange group per peer.
        let mut groups: HashMap<String, Vec<SyncItem>> = HashMap::new();
        for channel_id in &stalled {
            let sync = self.wallet.sync_channel(channel_id).await?;
            let context_id = sync.channel_result.context_id.clone();
            let mut outbox = sync.outbox.into_iter();
            match (outbox.next(), outbox.next()) {
                (None, _) => {}
                (Some(payload), None) => groups
                    .entry(payload.recipient.clone())
                    .or_default()
                    .push(SyncItem {
                        context_id,
                        payload,
                    }),
                (Some(_), Some(_)) => {
                    return Err(ManagerError::ProtocolViolation(format!(
                        "sync_channel produced {} outbox items, expected at most one",
                        2 + outbox.count()
                    )))
                }
            }
        }

        let per_peer = self.config.sync_per_peer_concurrency.max(1);
        let group_outcomes: Vec<Vec<(AllocationId, Result<_, _>)>> = futures::stream::iter(
            groups.into_iter().map(|(recipient, items)| {
                let exchange = &self.exchange;
                async move {
                    debug!("Syncing {} channels with peer {}", items.len(), recipient);
                    futures::stream::iter(items.into_iter().map(move |item| async move {
                        let outcome = exchange
                            .exchange_messages_until_outbox_is_empty(item.payload)
                            .await;
                        (item.context_id, outcome)
                    }))
                    .buffer_unordered(per_peer)
                    .collect::<Vec<_>>()
                    .await
                }
            }),
        )
        .buffer_unordered(self.config.sync_group_concurrency.max(1))
        .collect()
        .await;

        let mut merged: HashMap<ChannelId, ChannelResult> = HashMap::new();
        let mut failed_contexts: BTreeSet<AllocationId> = BTreeSet::new();
        for group in group_outcomes {
            for (context_id, outcome) in group {
                match outcome {
                    Ok(results) => merged.extend(results),
                    Err(e) => {
                        warn!(
                            "Sync exchange failed for allocation {}: {}; retiring it",
                            context_id, e
                        );
                        failed_contexts.insert(context_id);
                    }
                }
            }
        }

        for context_id in failed_contexts {
            let report = self.cache.retire_channels(&context_id).await?;
            if !report.channel_ids.is_empty() {
                self.insights.post(ChannelInsight::Retired(report));
            }
        }

        let mut recovered_ids = Vec::new();
        let mut recovered = Vec::new();
        for (channel_id, result) in merged {
            if result.turn_num % 2 != 1 || result.turn_num < 3 {
                continue;
            }
            match self.cache.submit_receipt(&result).await {
                Ok(_) => {
                    recovered.push(ChannelSummary::from(&result));
                    recovered_ids.push(channel_id);
                }
                Err(CacheError::StaleReceipt { .. }) | Err(CacheError::OurTurn { .. }) => {
                    // Already current in the cache; the channel is free.
                    debug!("Channel {} was already caught up", channel_id);
                    recovered.push(ChannelSummary::from(&result));
                    recovered_ids.push(channel_id);
                }
                Err(CacheError::NotFound(_)) => {
                    debug!("Channel {} vanished from the cache mid-sync", channel_id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !recovered.is_empty() {
            self.insights.post(ChannelInsight::Synced(recovered));
        }
        Ok(recovered_ids)
    }

    /// Finalise every retired channel: close through the wallet, report,
    /// drop from the cache, and drain the closing handshakes.
    pub async fn close_retired(&self) -> Result<(), ManagerError> {
        let closable = self.cache.closable_channels().await?;
        if closable.is_empty() {
            return Ok(());
        }

        let chunk_size = self.config.close_chunk_size.max(1);
        let per_allocation: Vec<(AllocationId, Vec<Vec<ChannelId>>)> = closable
            .into_iter()
            .map(|(context, ids)| {
                let chunks = ids.chunks(chunk_size).map(<[ChannelId]>::to_vec).collect();
                (context, chunks)
            })
            .collect();

        futures::stream::iter(per_allocation.into_iter().map(|(context, chunks)| {
            let chunk_concurrency = self.config.close_chunk_concurrency.max(1);
            async move {
                futures::stream::iter(
                    chunks
                        .into_iter()
                        .map(|chunk| self.close_chunk(context.clone(), chunk)),
                )
                .buffer_unordered(chunk_concurrency)
                .try_collect::<Vec<_>>()
                .await
            }
        }))
        .buffer_unordered(self.config.close_allocation_concurrency.max(1))
        .try_collect::<Vec<_>>()
        .await?;
        Ok(())
    }

    async fn close_chunk(
        &self,
        context: AllocationId,
        chunk: Vec<ChannelId>,
    ) -> Result<(), ManagerError> {
        let snapshots = self.cache.channel_snapshots(&chunk).await?;
        let closed = self.wallet.close_channels(&chunk).await?;

        let summaries: Vec<ChannelSummary> = snapshots
            .iter()
            .map(|snapshot| ChannelSummary {
                channel_id: snapshot.channel_id.clone(),
                context_id: snapshot.context_id.clone(),
                turn_num: snapshot.turn_num,
                outcome: snapshot.outcome.first().cloned(),
            })
            .collect();
        self.insights.post(ChannelInsight::Closed(summaries));

        self.cache.remove_channels(&chunk).await?;
        for payload in closed.outbox {
            self.exchange
                .exchange_messages_until_outbox_is_empty(payload)
                .await?;
        }
        info!("Closed {} channels for allocation {}", chunk.len(), context);
        Ok(())
    }

    async fn close_ledgers(&self, ids: &[AllocationId]) -> Result<(), ManagerError> {
        for id in ids {
            let ledgers = self.cache.get_ledger_channels(id).await?;
            if ledgers.is_empty() {
                continue;
            }
            let ledger_ids: Vec<ChannelId> =
                ledgers.iter().map(|l| l.channel_id.clone()).collect();
            let closed = self.wallet.close_channels(&ledger_ids).await?;
            for payload in closed.outbox {
                self.exchange
                    .exchange_messages_until_outbox_is_empty(payload)
                    .await?;
            }
            self.cache.remove_ledger_channels(&ledger_ids).await?;
            info!(
                "Closed {} ledger channels for allocation {}",
                ledger_ids.len(),
                id
            );
        }
        Ok(())
    }

    async fn create_ledger(&self, allocation: &Allocation) -> Result<ChannelId, ManagerError> {
        let outcome = Outcome::single(
            self.config.asset_holder,
            vec![
                AllocationItem {
                    destination: self.wallet.signing_address(),
                    amount: self.config.funds_per_allocation,
                },
                AllocationItem {
                    destination: allocation.indexer.address,
                    amount: U256::ZERO,
                },
            ],
        );
        let params = LedgerParams {
            context_id: allocation.id.clone(),
            participants: self.participants(allocation),
            asset_holder: self.config.asset_holder,
            chain_id: self.config.chain_id,
            challenge_duration_secs: self.config.challenge_duration.ledger_channel.as_secs(),
            outcome: outcome.clone(),
        };

        let created = self
            .wallet
            .create_ledger_channel(params, self.config.funding_strategy)
            .await?;
        let ledger_id = created.channel_result.channel_id.clone();
        self.cache
            .insert_ledger_channel(&allocation.id, &ledger_id, &outcome)
            .await?;

        let mut outbox = created.outbox.into_iter();
        match (outbox.next(), outbox.next()) {
            (Some(payload), None) => {
                self.exchange
                    .exchange_messages_until_outbox_is_empty(payload)
                    .await?;
            }
            (None, _) => {
                return Err(ManagerError::ProtocolViolation(
                    "create_ledger_channel produced no outbox item".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(ManagerError::ProtocolViolation(format!(
                    "create_ledger_channel produced {} outbox items, expected one",
                    2 + outbox.count()
                )))
            }
        }

        info!(
            "Created ledger channel {} for allocation {}",
            ledger_id, allocation.id
        );
        Ok(ledger_id)
    }

    /// Poll a channel until the wallet reports it running.
    async fn ensure_channel_open(&self, channel_id: &ChannelId) -> Result<(), ManagerError> {
        let attempts = self.config.sync_opening_channels_max_attempts.max(1);
        for attempt in 0..attempts {
            let result = self.synchronize_channel(channel_id).await?;
            if matches!(result.status, ChannelStatus::Running) {
                return Ok(());
            }
            debug!(
                "Channel {} not running yet (attempt {}/{}, status {:?})",
                channel_id,
                attempt + 1,
                attempts,
                result.status
            );
            tokio::time::sleep(self.config.sync_opening_channels_poll_interval)
                .await;
        }
        Err(ManagerError::ChannelNotOpen(channel_id.clone()))
    }

    /// Re-sync one channel with its peer and return the freshest result.
    async fn synchronize_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<ChannelResult, ManagerError> {
        let sync = self.wallet.sync_channel(channel_id).await?;
        let mut outbox = sync.outbox.into_iter();
        match (outbox.next(), outbox.next()) {
            (None, _) => Ok(sync.channel_result),
            (Some(payload), None) => {
                let results = self
                    .exchange
                    .exchange_messages_until_outbox_is_empty(payload)
                    .await?;
                Ok(results
                    .get(channel_id)
                    .cloned()
                    .unwrap_or(sync.channel_result))
            }
            (Some(_), Some(_)) => Err(ManagerError::ProtocolViolation(format!(
                "sync_channel produced {} outbox items, expected at most one",
                2 + outbox.count()
            ))),
        }
    }

    fn participants(&self, allocation: &Allocation) -> Vec<Participant> {
        let ours = self.wallet.signing_address();
        vec![
            Participant {
                signing_address: ours,
                destination: ours,
            },
            Participant {
                signing_address: allocation.indexer.address,
                destination: allocation.indexer.address,
            },
        ]
    }

    fn start_state(&self, allocation: &Allocation) -> StartState {
        StartState {
            context_id: allocation.id.clone(),
            participants: self.participants(allocation),
            asset_holder: self.config.asset_holder,
            app_definition: self.config.attestation_app,
            chain_id: self.config.chain_id,
            funding_amount: self.config.payment_channel_funding_amount,
            challenge_duration_secs: self.config.challenge_duration.payment_channel.as_secs(),
            fund_from_ledger: None,
        }
    }
}
