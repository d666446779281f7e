#![deny(clippy::unwrap_used, clippy::panic)]

//! Wallet transaction lifecycle coordinator.
//!
//! `teller` tracks a sender's transactions from creation through network
//! confirmation: it reserves nonces under a per-address lock, drives the
//! sign/publish flow, watches every in-flight transaction once per block,
//! detects drops and replacements, and resubmits stuck transactions with
//! exponential backoff. Every mutation of a record is captured in an
//! append-only history that can be replayed to reproduce the live record.
//!
//! Key management, transaction transport and gas heuristics are consumed
//! as opaque capabilities ([`TransactionSigner`] and [`ChainClient`]);
//! this crate owns only the coordination logic between them.

pub use chain::{ChainClient, SignerError, TransactionSigner};
pub use config::TellerConfig;
pub use controller::TransactionController;
pub use error::{IsRetryable, TellerError};
pub use events::TellerEvent;
pub use metrics::TellerMetrics;
pub use monitor::{PendingTracker, ResubmitAction};
pub use nonce::{GlobalNonceGuard, NonceLease, NonceManager};
pub use store::{TransactionStore, TxQuery};
pub use transaction::{
    HistoryEntry, HistoryOp, HistoryOpKind, NonceDetails, TransactionKind, TransactionRecord,
    TransactionRequest, TransactionStatus, TransactionUuid, TxParams,
};

mod chain;
mod config;
mod controller;
mod error;
mod events;
mod metrics;
mod monitor;
mod nonce;
mod store;
mod transaction;
