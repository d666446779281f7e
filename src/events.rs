use tokio::sync::broadcast;

use crate::transaction::{TransactionRecord, TransactionStatus, TransactionUuid};

/// Lifecycle events re-emitted to external listeners (UI, telemetry).
///
/// Each controller instance owns its own channel; subscribers attach via
/// [`crate::TransactionController::subscribe`]. There is no process-global
/// listener registry.
#[derive(Debug, Clone)]
pub enum TellerEvent {
    /// A new record entered the store as unapproved.
    Added(TransactionRecord),
    /// A record transitioned status. The `(id, status)` pair is the
    /// per-record event key.
    StatusChanged {
        id: TransactionUuid,
        status: TransactionStatus,
    },
    /// A non-fatal per-record problem: receipt fetch failure, unexpected
    /// publish error during resubmission. The record is left as-is.
    Warning {
        id: TransactionUuid,
        message: String,
    },
    /// Aggregate counts, emitted after every store mutation so listeners
    /// can render pending-transaction badges without polling.
    BadgeUpdate { unapproved: usize, pending: usize },
}

pub type EventSender = broadcast::Sender<TellerEvent>;

/// Send that tolerates the absence of subscribers.
pub(crate) fn emit(sender: &EventSender, event: TellerEvent) {
    let _ = sender.send(event);
}
