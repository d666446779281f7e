use std::fmt::{Debug, Formatter};
use std::ops::Deref;

use chrono::{DateTime, Utc};
use ethers_core::types::{Address, Bytes, TransactionReceipt, H256, U256, U64};
use uuid::Uuid;

use crate::error::TellerError;

pub use history::{HistoryEntry, HistoryOp, HistoryOpKind};

pub(crate) mod history;

/// Unique record identifier, assigned at creation and never reused.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, PartialEq, Eq, Hash, Default)]
pub struct TransactionUuid(Uuid);

impl TransactionUuid {
    pub fn new(uuid: Uuid) -> Self {
        TransactionUuid(uuid)
    }

    pub fn random() -> Self {
        TransactionUuid(Uuid::new_v4())
    }
}

impl Deref for TransactionUuid {
    type Target = Uuid;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for TransactionUuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    #[default]
    Unapproved,
    Approved,
    Signed,
    Submitted,
    Confirmed,
    Dropped,
    Failed,
    Rejected,
}

impl TransactionStatus {
    /// Terminal states are sinks; no further transitions occur.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Confirmed
                | TransactionStatus::Dropped
                | TransactionStatus::Failed
                | TransactionStatus::Rejected
        )
    }

    /// Broadcast (or about to be) and not yet finalized.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Approved | TransactionStatus::Signed | TransactionStatus::Submitted
        )
    }

    /// Once signed, `tx_params` are frozen.
    pub fn locks_params(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Signed
                | TransactionStatus::Submitted
                | TransactionStatus::Confirmed
                | TransactionStatus::Dropped
                | TransactionStatus::Failed
        )
    }
}

/// Classification of what a transaction does. `Retry` and `Cancel` records
/// replace an earlier record at the same nonce.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    SimpleSend,
    ContractCall,
    Deployment,
    TokenTransfer,
    TokenApprove,
    Retry { original: TransactionUuid },
    Cancel { original: TransactionUuid },
}

const SELECTOR_TRANSFER: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
const SELECTOR_TRANSFER_FROM: [u8; 4] = [0x23, 0xb8, 0x72, 0xdd];
const SELECTOR_APPROVE: [u8; 4] = [0x09, 0x5e, 0xa7, 0xb3];

impl TransactionKind {
    /// Classify from the shape of the parameters: empty calldata is a plain
    /// send, a missing recipient is a deployment, ERC-20 selectors are
    /// token operations, anything else is a contract call.
    pub fn classify(params: &TxParams) -> Self {
        if params.data.is_empty() {
            TransactionKind::SimpleSend
        } else if params.to.is_none() {
            TransactionKind::Deployment
        } else if params.data.starts_with(&SELECTOR_TRANSFER)
            || params.data.starts_with(&SELECTOR_TRANSFER_FROM)
        {
            TransactionKind::TokenTransfer
        } else if params.data.starts_with(&SELECTOR_APPROVE) {
            TransactionKind::TokenApprove
        } else {
            TransactionKind::ContractCall
        }
    }
}

/// Structured transaction parameters. Every field is independently
/// validated; the numeric fields are non-negative by construction.
/// Unknown keys are rejected at the serialization boundary.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct TxParams {
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub nonce: Option<U256>,
    pub gas: Option<U256>,
    pub gas_price: Option<U256>,
}

impl TxParams {
    pub fn validate(&self) -> Result<(), TellerError> {
        if self.from == Address::zero() {
            return Err(TellerError::InvalidTxParams(
                "`from` must not be the zero address".to_string(),
            ));
        }
        match self.to {
            Some(to) if to == Address::zero() => {
                return Err(TellerError::InvalidTxParams(
                    "`to` must not be the zero address".to_string(),
                ));
            }
            None if self.data.is_empty() => {
                return Err(TellerError::InvalidTxParams(
                    "transaction without a recipient must carry contract creation data"
                        .to_string(),
                ));
            }
            _ => {}
        }
        if let Some(gas) = self.gas {
            if gas.is_zero() {
                return Err(TellerError::InvalidTxParams(
                    "`gas` must not be zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Caller-facing request shape. Absent fields are defaulted during
/// normalization: value to zero, calldata to empty, gas filled in during
/// approval.
#[derive(Debug, Clone, Default)]
pub struct TransactionRequest {
    pub from: Address,
    pub to: Option<Address>,
    pub value: Option<U256>,
    pub data: Option<Bytes>,
    pub gas: Option<U256>,
    pub gas_price: Option<U256>,
}

impl TransactionRequest {
    pub fn into_params(self) -> TxParams {
        TxParams {
            from: self.from,
            to: self.to,
            value: self.value.unwrap_or_default(),
            data: self.data.unwrap_or_default(),
            nonce: None,
            gas: self.gas,
            gas_price: self.gas_price,
        }
    }
}

/// Audit of the inputs that went into a nonce reservation.
#[derive(Debug, Clone, derive_new::new, serde::Deserialize, serde::Serialize, PartialEq, Eq)]
pub struct NonceDetails {
    /// Next nonce according to the network's confirmed count.
    pub network_next: U256,
    /// One past the highest locally confirmed nonce.
    pub local_confirmed_next: U256,
    /// One past the contiguous run of locally pending nonces.
    pub local_pending_next: U256,
}

/// The central entity: one tracked transaction, with its full mutation
/// history.
#[derive(Clone, serde::Deserialize, serde::Serialize, PartialEq)]
pub struct TransactionRecord {
    pub id: TransactionUuid,
    pub status: TransactionStatus,
    pub network_id: u64,
    pub chain_id: u64,
    pub kind: TransactionKind,
    pub time: DateTime<Utc>,
    pub tx_params: TxParams,
    /// Network transaction hash, present once published. Absence after
    /// submission is a structural failure.
    pub hash: Option<H256>,
    /// Raw signed bytes kept for resubmission.
    pub raw_tx: Option<Bytes>,
    /// Append-only mutation log; `history[0]` is a full snapshot, every
    /// later entry a diff. Replaying it reproduces the live record.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub retry_count: u32,
    pub first_retry_block_number: Option<U64>,
    /// Gas price of the record this one replaces. Its presence marks a
    /// fixed-nonce retry/cancel: approval must not reallocate the nonce.
    pub last_gas_price: Option<U256>,
    pub nonce_details: Option<NonceDetails>,
    pub receipt: Option<TransactionReceipt>,
    /// Hash of the transaction that consumed this record's nonce slot.
    pub replaced_by: Option<H256>,
    /// Failure message for `Failed`/`Rejected` records.
    pub err: Option<String>,
}

impl Debug for TransactionRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // leaves out history and raw bytes, which only add noise in logs
        f.debug_struct("TransactionRecord")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("kind", &self.kind)
            .field("network_id", &self.network_id)
            .field("from", &self.tx_params.from)
            .field("nonce", &self.tx_params.nonce)
            .field("hash", &self.hash)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

impl TransactionRecord {
    pub fn new(params: TxParams, kind: TransactionKind, network_id: u64, chain_id: u64) -> Self {
        Self {
            id: TransactionUuid::random(),
            status: TransactionStatus::Unapproved,
            network_id,
            chain_id,
            kind,
            time: Utc::now(),
            tx_params: params,
            hash: None,
            raw_tx: None,
            history: Vec::new(),
            retry_count: 0,
            first_retry_block_number: None,
            last_gas_price: None,
            nonce_details: None,
            receipt: None,
            replaced_by: None,
            err: None,
        }
    }

    pub fn nonce(&self) -> Option<U256> {
        self.tx_params.nonce
    }

    /// Replay the history and return the reconstructed record. The result
    /// carries an empty history; compare against the live record with
    /// history excluded.
    pub fn replay_history(&self) -> Result<TransactionRecord, TellerError> {
        history::replay(&self.history)
    }

    #[cfg(test)]
    pub fn dummy(from: Address, status: TransactionStatus, nonce: Option<u64>) -> Self {
        let mut record = Self::new(
            TxParams {
                from,
                to: Some(Address::repeat_byte(0x11)),
                value: U256::from(1_000u64),
                ..Default::default()
            },
            TransactionKind::SimpleSend,
            1,
            1,
        );
        record.status = status;
        record.tx_params.nonce = nonce.map(U256::from);
        record
    }
}
