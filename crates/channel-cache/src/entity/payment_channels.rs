//! payment_channels entity
//!
//! One row per two-party payment channel. `turn_number` parity encodes whose
//! move it is: odd means ours (leasable for a payment), even means we are
//! awaiting the peer. The lease itself is the row lock, never a column.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(schema_name = "payments", table_name = "payment_channels")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub channel_id: String,

    /// Allocation the channel belongs to.
    pub context_id: String,

    /// Monotonic state index. 0 marks a created but not-yet-handshook
    /// channel; 3 is the first running state.
    pub turn_number: i64,

    /// Decimal strings of 256-bit balances; their sum is the channel's
    /// funding amount for its whole life.
    #[sea_orm(column_type = "Text")]
    pub payer_balance: String,
    #[sea_orm(column_type = "Text")]
    pub receiver_balance: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub outcome: Json,

    #[sea_orm(column_type = "Blob")]
    pub app_data: Vec<u8>,

    /// Retired channels are never leased but may still receive messages and
    /// be closed.
    pub retired: bool,

    #[sea_orm(column_type = "TimestampWithTimeZone")]
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
