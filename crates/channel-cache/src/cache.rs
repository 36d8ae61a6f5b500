use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use alloy::primitives::U256;
use chrono::Utc;
use sea_orm::sea_query::{Expr, LockBehavior, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, Order, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use tracing::{debug, info, warn};
use wallet_api::{
    AllocationId, ChannelId, ChannelResult, ChannelStatus, Outcome, RetirementReport, Wallet,
};

use crate::database::Database;
use crate::entity::{ledger_channels, payment_channels};
use crate::error::CacheError;
use crate::snapshot::{promotes, ChannelSnapshot};

/// What a critical section hands back on success: the snapshot to persist
/// into the leased row, and the value returned to the caller.
#[derive(Debug)]
pub struct CriticalOutcome<T> {
    pub snapshot: ChannelSnapshot,
    pub result: T,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    pub channel_id: ChannelId,
    pub context_id: AllocationId,
    pub initial_outcome: Outcome,
}

/// Durable map of channels keyed by channel id, indexed by allocation, with
/// the row lock of the backing store as its lease primitive.
pub struct ChannelCache {
    db: Database,
}

impl ChannelCache {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Apply migrations. Idempotent.
    pub async fn initialize(&self) -> Result<(), CacheError> {
        self.db.migrate_up().await
    }

    /// Tear down the connection pool. The only teardown; meant for process
    /// exit.
    pub async fn destroy(self) -> Result<(), CacheError> {
        self.db.close().await
    }

    pub async fn health_check(&self) -> Result<(), CacheError> {
        self.db.health_check().await
    }

    /// Remove every row from both tables.
    pub async fn clear_cache(&self) -> Result<(), CacheError> {
        let conn = self.db.connection();
        payment_channels::Entity::delete_many().exec(conn).await?;
        ledger_channels::Entity::delete_many().exec(conn).await?;
        info!("Channel cache cleared");
        Ok(())
    }

    /// Reconcile the cache against the wallet: a row exists iff the wallet
    /// holds persistent state for it. Ledger results (null app data) and
    /// closing channels are skipped; ledger rows are re-discovered by the
    /// capacity controller's probe. Returns the number of payment channel
    /// rows present afterwards.
    pub async fn populate(&self, wallet: &dyn Wallet) -> Result<usize, CacheError> {
        let channels = wallet.get_channels().await?;
        let txn = self.db.connection().begin().await?;

        let mut keep: HashSet<String> = HashSet::new();
        for result in &channels {
            if result.app_data.is_empty() {
                continue;
            }
            if matches!(result.status, ChannelStatus::Closing | ChannelStatus::Closed) {
                continue;
            }
            keep.insert(result.channel_id.0.clone());
            self.reconcile_row(&txn, result).await?;
        }

        let cached: Vec<String> = payment_channels::Entity::find()
            .select_only()
            .column(payment_channels::Column::ChannelId)
            .into_tuple()
            .all(&txn)
            .await?;
        let orphans: Vec<String> = cached
            .into_iter()
            .filter(|id| !keep.contains(id))
            .collect();
        if !orphans.is_empty() {
            warn!(
                "Dropping {} cached channels the wallet no longer knows",
                orphans.len()
            );
            payment_channels::Entity::delete_many()
                .filter(payment_channels::Column::ChannelId.is_in(orphans))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;
        info!("Populated channel cache with {} channels", keep.len());
        Ok(keep.len())
    }

    async fn reconcile_row(
        &self,
        txn: &DatabaseTransaction,
        result: &ChannelResult,
    ) -> Result<(), CacheError> {
        let existing = payment_channels::Entity::find_by_id(result.channel_id.0.clone())
            .one(txn)
            .await?;
        match existing {
            None => {
                self.insert_row(txn, &result.context_id, result).await?;
            }
            Some(row) if result.turn_num > row.turn_number.max(0) as u64 => {
                let retired = row.retired;
                self.write_row(txn, row, result, retired).await?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Insert freshly created channels, or promote rows the peer created at
    /// turn 0 to their first running state. Any other primary-key conflict
    /// is a no-op. Returns the ids actually inserted or promoted.
    pub async fn insert_channels(
        &self,
        context: &AllocationId,
        results: &[ChannelResult],
    ) -> Result<Vec<ChannelId>, CacheError> {
        let txn = self.db.connection().begin().await?;
        let mut changed = Vec::new();

        for result in results {
            let existing = payment_channels::Entity::find_by_id(result.channel_id.0.clone())
                .one(&txn)
                .await?;
            match existing {
                None => {
                    self.insert_row(&txn, context, result).await?;
                    changed.push(result.channel_id.clone());
                }
                Some(row) if promotes(row.turn_number, result.turn_num) => {
                    let retired = row.retired;
                    self.write_row(&txn, row, result, retired).await?;
                    changed.push(result.channel_id.clone());
                }
                Some(row) => {
                    debug!(
                        "Ignoring conflicting insert for channel {} (cached turn {}, incoming {})",
                        result.channel_id, row.turn_number, result.turn_num
                    );
                }
            }
        }

        txn.commit().await?;
        Ok(changed)
    }

    async fn insert_row(
        &self,
        txn: &DatabaseTransaction,
        context: &AllocationId,
        result: &ChannelResult,
    ) -> Result<(), CacheError> {
        let snapshot = ChannelSnapshot::from_result(result);
        payment_channels::ActiveModel {
            channel_id: Set(snapshot.channel_id.0.clone()),
            context_id: Set(context.0.clone()),
            turn_number: Set(snapshot.turn_num as i64),
            payer_balance: Set(snapshot.payer_balance.to_string()),
            receiver_balance: Set(snapshot.receiver_balance.to_string()),
            outcome: Set(snapshot.outcome_json()?),
            app_data: Set(snapshot.app_data.clone()),
            retired: Set(false),
            updated_at: Set(Utc::now()),
        }
        .insert(txn)
        .await?;
        Ok(())
    }

    async fn write_row(
        &self,
        txn: &DatabaseTransaction,
        row: payment_channels::Model,
        result: &ChannelResult,
        retired: bool,
    ) -> Result<(), CacheError> {
        let snapshot = ChannelSnapshot::from_result(result);
        let mut active: payment_channels::ActiveModel = row.into();
        active.turn_number = Set(snapshot.turn_num as i64);
        active.payer_balance = Set(snapshot.payer_balance.to_string());
        active.receiver_balance = Set(snapshot.receiver_balance.to_string());
        active.outcome = Set(snapshot.outcome_json()?);
        active.app_data = Set(snapshot.app_data.clone());
        active.retired = Set(retired);
        active.updated_at = Set(Utc::now());
        active.update(txn).await?;
        Ok(())
    }

    pub async fn remove_channels(&self, channel_ids: &[ChannelId]) -> Result<(), CacheError> {
        if channel_ids.is_empty() {
            return Ok(());
        }
        payment_channels::Entity::delete_many()
            .filter(
                payment_channels::Column::ChannelId
                    .is_in(channel_ids.iter().map(|id| id.0.clone())),
            )
            .exec(self.db.connection())
            .await?;
        Ok(())
    }

    /// Flip `retired` on every non-retired row of the allocation and report
    /// the total receiver balance taken out of rotation.
    pub async fn retire_channels(
        &self,
        context: &AllocationId,
    ) -> Result<RetirementReport, CacheError> {
        let txn = self.db.connection().begin().await?;

        let rows = payment_channels::Entity::find()
            .filter(payment_channels::Column::ContextId.eq(context.as_str()))
            .filter(payment_channels::Column::Retired.eq(false))
            .lock_exclusive()
            .all(&txn)
            .await?;

        let mut amount = U256::ZERO;
        let mut channel_ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let snapshot = ChannelSnapshot::from_model(row)?;
            amount += snapshot.receiver_balance;
            channel_ids.push(snapshot.channel_id);
        }

        if !channel_ids.is_empty() {
            payment_channels::Entity::update_many()
                .col_expr(payment_channels::Column::Retired, Expr::value(true))
                .col_expr(payment_channels::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(payment_channels::Column::ContextId.eq(context.as_str()))
                .filter(payment_channels::Column::Retired.eq(false))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;
        info!(
            "Retired {} channels for allocation {} ({} owed to the indexer)",
            channel_ids.len(),
            context,
            amount
        );
        Ok(RetirementReport {
            context_id: context.clone(),
            amount,
            channel_ids,
        })
    }

    /// Count of non-retired channels per allocation, optionally restricted to
    /// a set of allocations.
    pub async fn active_allocations(
        &self,
        filter: Option<&[AllocationId]>,
    ) -> Result<HashMap<AllocationId, usize>, CacheError> {
        let mut query = payment_channels::Entity::find()
            .filter(payment_channels::Column::Retired.eq(false));
        if let Some(ids) = filter {
            query = query.filter(
                payment_channels::Column::ContextId.is_in(ids.iter().map(|id| id.0.clone())),
            );
        }
        let contexts: Vec<String> = query
            .select_only()
            .column(payment_channels::Column::ContextId)
            .into_tuple()
            .all(self.db.connection())
            .await?;

        let mut counts: HashMap<AllocationId, usize> = HashMap::new();
        for context in contexts {
            *counts.entry(AllocationId(context)).or_default() += 1;
        }
        Ok(counts)
    }

    /// Non-retired channel ids of one allocation, any turn number.
    pub async fn active_channels(
        &self,
        context: &AllocationId,
    ) -> Result<Vec<ChannelId>, CacheError> {
        let ids: Vec<String> = payment_channels::Entity::find()
            .filter(payment_channels::Column::ContextId.eq(context.as_str()))
            .filter(payment_channels::Column::Retired.eq(false))
            .select_only()
            .column(payment_channels::Column::ChannelId)
            .into_tuple()
            .all(self.db.connection())
            .await?;
        Ok(ids.into_iter().map(ChannelId).collect())
    }

    /// Retired rows, grouped by allocation, ready for graceful close.
    pub async fn closable_channels(
        &self,
    ) -> Result<HashMap<AllocationId, Vec<ChannelId>>, CacheError> {
        let rows: Vec<(String, String)> = payment_channels::Entity::find()
            .filter(payment_channels::Column::Retired.eq(true))
            .select_only()
            .column(payment_channels::Column::ContextId)
            .column(payment_channels::Column::ChannelId)
            .into_tuple()
            .all(self.db.connection())
            .await?;

        let mut grouped: HashMap<AllocationId, Vec<ChannelId>> = HashMap::new();
        for (context, channel) in rows {
            grouped
                .entry(AllocationId(context))
                .or_default()
                .push(ChannelId(channel));
        }
        Ok(grouped)
    }

    /// Channels created but never handshook (turn 0). Candidates for a
    /// targeted sync before provisioning more capacity.
    pub async fn readying_channels(
        &self,
        context: &AllocationId,
    ) -> Result<Vec<ChannelId>, CacheError> {
        let ids: Vec<String> = payment_channels::Entity::find()
            .filter(payment_channels::Column::ContextId.eq(context.as_str()))
            .filter(payment_channels::Column::Retired.eq(false))
            .filter(payment_channels::Column::TurnNumber.eq(0))
            .select_only()
            .column(payment_channels::Column::ChannelId)
            .into_tuple()
            .all(self.db.connection())
            .await?;
        Ok(ids.into_iter().map(ChannelId).collect())
    }

    /// Channels stuck on the peer's move for at least `min_age`. When a
    /// limit is given the selection is randomised so no channel starves
    /// behind a permanently broken one.
    pub async fn stalled_channels(
        &self,
        min_age: Duration,
        limit: Option<u64>,
        contexts: Option<&[AllocationId]>,
    ) -> Result<Vec<ChannelId>, CacheError> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(min_age.as_millis() as i64);
        let mut query = payment_channels::Entity::find()
            .filter(payment_channels::Column::Retired.eq(false))
            .filter(Expr::cust("turn_number % 2 = 0"))
            .filter(payment_channels::Column::UpdatedAt.lte(cutoff));
        if let Some(ids) = contexts {
            query = query.filter(
                payment_channels::Column::ContextId.is_in(ids.iter().map(|id| id.0.clone())),
            );
        }
        if let Some(limit) = limit {
            query = query.order_by(Expr::cust("RANDOM()"), Order::Asc).limit(limit);
        }
        let ids: Vec<String> = query
            .select_only()
            .column(payment_channels::Column::ChannelId)
            .into_tuple()
            .all(self.db.connection())
            .await?;
        Ok(ids.into_iter().map(ChannelId).collect())
    }

    /// Decoded snapshots for a set of channel ids (retired included).
    pub async fn channel_snapshots(
        &self,
        channel_ids: &[ChannelId],
    ) -> Result<Vec<ChannelSnapshot>, CacheError> {
        if channel_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = payment_channels::Entity::find()
            .filter(
                payment_channels::Column::ChannelId
                    .is_in(channel_ids.iter().map(|id| id.0.clone())),
            )
            .all(self.db.connection())
            .await?;
        rows.iter().map(ChannelSnapshot::from_model).collect()
    }

    pub async fn insert_ledger_channel(
        &self,
        context: &AllocationId,
        channel_id: &ChannelId,
        initial_outcome: &Outcome,
    ) -> Result<(), CacheError> {
        let outcome = serde_json::to_value(initial_outcome).map_err(|e| CacheError::Corrupt {
            channel_id: channel_id.clone(),
            reason: format!("ledger outcome encoding: {e}"),
        })?;
        ledger_channels::ActiveModel {
            channel_id: Set(channel_id.0.clone()),
            context_id: Set(context.0.clone()),
            initial_outcome: Set(outcome),
            created_at: Set(Utc::now()),
        }
        .insert(self.db.connection())
        .await?;
        Ok(())
    }

    pub async fn get_ledger_channels(
        &self,
        context: &AllocationId,
    ) -> Result<Vec<LedgerRecord>, CacheError> {
        let rows = ledger_channels::Entity::find()
            .filter(ledger_channels::Column::ContextId.eq(context.as_str()))
            .all(self.db.connection())
            .await?;
        rows.into_iter()
            .map(|row| {
                let channel_id = ChannelId(row.channel_id);
                let initial_outcome = serde_json::from_value(row.initial_outcome)
                    .map_err(|e| CacheError::Corrupt {
                        channel_id: channel_id.clone(),
                        reason: format!("ledger outcome: {e}"),
                    })?;
                Ok(LedgerRecord {
                    channel_id,
                    context_id: AllocationId(row.context_id),
                    initial_outcome,
                })
            })
            .collect()
    }

    pub async fn remove_ledger_channels(
        &self,
        channel_ids: &[ChannelId],
    ) -> Result<(), CacheError> {
        if channel_ids.is_empty() {
            return Ok(());
        }
        ledger_channels::Entity::delete_many()
            .filter(
                ledger_channels::Column::ChannelId.is_in(channel_ids.iter().map(|id| id.0.clone())),
            )
            .exec(self.db.connection())
            .await?;
        Ok(())
    }

    /// Lease one free channel of the allocation and run `critical` on it.
    ///
    /// The selection takes an exclusive row lock with skip-locked semantics:
    /// rows leased by any process sharing the store are invisible, and a
    /// caller that finds nothing fails fast with
    /// [`CacheError::NoFreeChannels`] instead of queueing. On normal return
    /// the critical section's snapshot is written back (unless the row was
    /// retired) and the transaction commits; on error everything rolls back
    /// and the row is released untouched.
    pub async fn acquire_channel<F, Fut, T, E>(
        &self,
        context: &AllocationId,
        critical: F,
    ) -> Result<T, E>
    where
        F: FnOnce(ChannelSnapshot) -> Fut,
        Fut: Future<Output = Result<CriticalOutcome<T>, E>>,
        E: From<CacheError>,
    {
        let txn = self
            .db
            .connection()
            .begin()
            .await
            .map_err(|e| E::from(CacheError::Storage(e)))?;

        let row = payment_channels::Entity::find()
            .filter(payment_channels::Column::ContextId.eq(context.as_str()))
            .filter(payment_channels::Column::Retired.eq(false))
            .filter(Expr::cust("turn_number % 2 = 1"))
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .one(&txn)
            .await
            .map_err(|e| E::from(CacheError::Storage(e)))?;

        let Some(row) = row else {
            let _ = txn.rollback().await;
            return Err(E::from(CacheError::NoFreeChannels(context.clone())));
        };

        let snapshot = ChannelSnapshot::from_model(&row).map_err(E::from)?;
        let channel_id = snapshot.channel_id.clone();
        debug!("Leased channel {} for allocation {}", channel_id, context);

        match critical(snapshot).await {
            Ok(CriticalOutcome { snapshot: updated, result }) => {
                let outcome_json = updated.outcome_json().map_err(E::from)?;
                payment_channels::Entity::update_many()
                    .col_expr(
                        payment_channels::Column::TurnNumber,
                        Expr::value(updated.turn_num as i64),
                    )
                    .col_expr(
                        payment_channels::Column::PayerBalance,
                        Expr::value(updated.payer_balance.to_string()),
                    )
                    .col_expr(
                        payment_channels::Column::ReceiverBalance,
                        Expr::value(updated.receiver_balance.to_string()),
                    )
                    .col_expr(payment_channels::Column::Outcome, Expr::value(outcome_json))
                    .col_expr(
                        payment_channels::Column::AppData,
                        Expr::value(updated.app_data.clone()),
                    )
                    .col_expr(payment_channels::Column::UpdatedAt, Expr::value(Utc::now()))
                    .filter(payment_channels::Column::ChannelId.eq(channel_id.as_str()))
                    .filter(payment_channels::Column::Retired.eq(false))
                    .exec(&txn)
                    .await
                    .map_err(|e| E::from(CacheError::Storage(e)))?;
                txn.commit()
                    .await
                    .map_err(|e| E::from(CacheError::Storage(e)))?;
                debug!("Released channel {} at turn {}", channel_id, updated.turn_num);
                Ok(result)
            }
            Err(e) => {
                let _ = txn.rollback().await;
                debug!("Released channel {} without mutation", channel_id);
                Err(e)
            }
        }
    }

    /// Write a peer receipt through to the cache.
    ///
    /// Accepts only rows that are awaiting the peer (even turn, including a
    /// never-handshook 0) and only results that strictly advance the cached
    /// snapshot. A row on our turn is free or mid-lease; a receipt for it is
    /// a replay or a protocol fault and is refused.
    pub async fn submit_receipt(
        &self,
        result: &ChannelResult,
    ) -> Result<ChannelSnapshot, CacheError> {
        let txn = self.db.connection().begin().await?;

        let row = payment_channels::Entity::find_by_id(result.channel_id.0.clone())
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| CacheError::NotFound(result.channel_id.clone()))?;

        if row.turn_number % 2 == 1 {
            txn.rollback().await?;
            return Err(CacheError::OurTurn {
                channel_id: result.channel_id.clone(),
                turn_number: row.turn_number.max(0) as u64,
            });
        }
        let cached_turn = row.turn_number.max(0) as u64;
        if result.turn_num <= cached_turn {
            txn.rollback().await?;
            return Err(CacheError::StaleReceipt {
                channel_id: result.channel_id.clone(),
                cached: cached_turn,
                submitted: result.turn_num,
            });
        }

        let retired = row.retired;
        self.write_row(&txn, row, result, retired).await?;
        txn.commit().await?;

        let mut snapshot = ChannelSnapshot::from_result(result);
        snapshot.retired = retired;
        debug!(
            "Receipt advanced channel {} to turn {}",
            result.channel_id, result.turn_num
        );
        Ok(snapshot)
    }
}
