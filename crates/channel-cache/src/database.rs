//! Database connection and schema management for the channel pool.

use sea_orm::{ConnectionTrait, Database as SeaOrmDatabase, DatabaseConnection};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::CacheError;

const MAX_CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Idempotent DDL applied on `initialize()`. Safe to re-run on every start.
const MIGRATIONS: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS payments",
    "CREATE TABLE IF NOT EXISTS payments.payment_channels (
        channel_id TEXT PRIMARY KEY,
        context_id TEXT NOT NULL,
        turn_number BIGINT NOT NULL,
        payer_balance TEXT NOT NULL,
        receiver_balance TEXT NOT NULL,
        outcome JSONB NOT NULL,
        app_data BYTEA NOT NULL,
        retired BOOLEAN NOT NULL DEFAULT FALSE,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_payment_channels_context_turn
        ON payments.payment_channels (context_id, turn_number)",
    "CREATE INDEX IF NOT EXISTS idx_payment_channels_retired_updated
        ON payments.payment_channels (retired, updated_at)",
    "CREATE TABLE IF NOT EXISTS payments.ledger_channels (
        channel_id TEXT PRIMARY KEY,
        context_id TEXT NOT NULL,
        initial_outcome JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_ledger_channels_context
        ON payments.ledger_channels (context_id)",
];

/// Connection wrapper with pool settings tuned for many short leasing
/// transactions.
pub struct Database {
    connection: DatabaseConnection,
}

impl Database {
    /// Connect with a bounded retry; transient startup races against the
    /// database container are common in deployments.
    pub async fn connect(database_url: &str) -> Result<Self, CacheError> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let mut opt = sea_orm::ConnectOptions::new(database_url.to_string());
            opt.max_connections(50)
                .min_connections(5)
                .connect_timeout(Duration::from_secs(10))
                .acquire_timeout(Duration::from_secs(30))
                .idle_timeout(Duration::from_secs(300))
                .max_lifetime(Duration::from_secs(3600))
                .sqlx_logging(true)
                .sqlx_slow_statements_logging_settings(
                    tracing::log::LevelFilter::Warn,
                    Duration::from_millis(500),
                );

            match SeaOrmDatabase::connect(opt).await {
                Ok(connection) => {
                    info!("Connected to channel store");
                    return Ok(Self { connection });
                }
                Err(e) if attempts < MAX_CONNECT_ATTEMPTS => {
                    warn!(
                        "Failed to connect to channel store (attempt {}/{}): {}",
                        attempts, MAX_CONNECT_ATTEMPTS, e
                    );
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(
                        "Failed to connect to channel store after {} attempts",
                        MAX_CONNECT_ATTEMPTS
                    );
                    return Err(CacheError::Storage(e));
                }
            }
        }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    /// Apply the schema. Every statement is idempotent, so this runs on each
    /// `initialize()` without version bookkeeping.
    pub async fn migrate_up(&self) -> Result<(), CacheError> {
        for statement in MIGRATIONS {
            self.connection.execute_unprepared(statement).await?;
        }
        info!("Channel store schema is up to date");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), CacheError> {
        self.connection.execute_unprepared("SELECT 1").await?;
        Ok(())
    }

    pub async fn close(self) -> Result<(), CacheError> {
        self.connection.close().await?;
        Ok(())
    }
}
