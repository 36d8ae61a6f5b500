//! Capacity controller and payment path of the channel pool.
//!
//! [`ChannelManager`] keeps `active_channels(allocation) == requested
//! capacity` for every known allocation, driving the wallet and the message
//! exchange to open, heal, retire, and close channels. [`PaymentManager`]
//! leases one channel per payment from the cache, builds the next state
//! through the attestation app rules, and returns the outgoing payload.

pub mod attestation;
mod capacity;
mod config;
mod error;
mod manager;
mod named_lock;
mod objectives;
mod payments;

pub use capacity::{AllocationPlan, CapacityAdjustment};
pub use config::{BackoffStrategy, ChallengeDurations, ManagerConfig};
pub use error::{ManagerError, PaymentError};
pub use manager::ChannelManager;
pub use payments::{Payment, PaymentManager, QueryOutcome};
