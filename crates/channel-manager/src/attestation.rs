//! State-transition rules of the attestation application.
//!
//! This is the only place the pool reaches inside channel payloads, and it
//! does so through the wallet: the functions here build the allocation items
//! and app data handed to `update_channel`, and parse the app data a receipt
//! carries back.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};
use wallet_api::{AllocationItem, Outcome};

use crate::error::PaymentError;

/// Attestation app state carried in `app_data`, JSON-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttestationAppData {
    /// Our move: a conditional payment for one query.
    QueryRequested {
        request_cid: String,
        subgraph_deployment_id: String,
        amount: U256,
    },
    /// Peer accepted and attested to the response.
    AttestationProvided {
        response_cid: String,
        signature: Vec<u8>,
    },
    /// Peer declined the query; funds return on the next update.
    QueryDeclined { status: u32 },
}

impl AttestationAppData {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Parsed response extracted from a receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Accepted {
        response_cid: String,
        signature: Vec<u8>,
    },
    Declined {
        status: u32,
    },
}

/// Move `amount` from the payer bucket to the receiver bucket of the first
/// asset outcome. Fails when the payer cannot cover the amount or the
/// outcome does not carry the two expected buckets.
pub fn next_payment_allocations(
    outcome: &Outcome,
    amount: U256,
) -> Result<Vec<AllocationItem>, PaymentError> {
    let asset = outcome.first().ok_or_else(|| {
        PaymentError::ProtocolViolation("channel outcome has no asset".to_string())
    })?;
    let [payer, receiver, rest @ ..] = asset.allocation_items.as_slice() else {
        return Err(PaymentError::ProtocolViolation(format!(
            "channel outcome has {} allocation items, expected at least 2",
            asset.allocation_items.len()
        )));
    };

    if amount > payer.amount {
        return Err(PaymentError::InsufficientFunds {
            amount,
            balance: payer.amount,
        });
    }

    let mut items = Vec::with_capacity(asset.allocation_items.len());
    items.push(AllocationItem {
        destination: payer.destination,
        amount: payer.amount - amount,
    });
    items.push(AllocationItem {
        destination: receiver.destination,
        amount: receiver.amount + amount,
    });
    items.extend(rest.iter().cloned());
    Ok(items)
}

/// Interpret the app data of a receipt as the query response.
pub fn parse_query_outcome(app_data: &[u8]) -> Result<QueryOutcome, PaymentError> {
    match AttestationAppData::from_bytes(app_data)? {
        AttestationAppData::AttestationProvided {
            response_cid,
            signature,
        } => Ok(QueryOutcome::Accepted {
            response_cid,
            signature,
        }),
        AttestationAppData::QueryDeclined { status } => Ok(QueryOutcome::Declined { status }),
        AttestationAppData::QueryRequested { .. } => Err(PaymentError::ProtocolViolation(
            "receipt app data still carries the query request".to_string(),
        )),
    }
}
