//! Durable pool of payment channels.
//!
//! The cache is the single source of truth for which channels exist, which
//! are free, and which are retired, and it is the lease broker that prevents
//! two holders from mutating a channel at once. The lease is not a stored
//! column: it is the row lock taken by `SELECT ... FOR UPDATE SKIP LOCKED`
//! inside [`ChannelCache::acquire_channel`], so it holds across every process
//! sharing the same backing store and dies with the transaction of a crashed
//! holder.

mod cache;
mod database;
pub mod entity;
mod error;
mod snapshot;

pub use cache::{ChannelCache, CriticalOutcome, LedgerRecord};
pub use database::Database;
pub use error::CacheError;
pub use snapshot::ChannelSnapshot;
