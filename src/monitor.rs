use std::collections::HashMap;
use std::sync::Arc;

use ethers_core::types::{TransactionReceipt, H256, U256, U64};
use futures_util::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::chain::ChainClient;
use crate::config::TellerConfig;
use crate::error::TellerError;
use crate::events::{emit, EventSender, TellerEvent};
use crate::metrics::TellerMetrics;
use crate::nonce::NonceManager;
use crate::store::{TransactionStore, TxQuery};
use crate::transaction::{TransactionRecord, TransactionStatus, TransactionUuid};

/// Publish failures that clear on their own; swallowed without a warning
/// and left for the next cycle. Matched case-insensitively as substrings.
const KNOWN_TRANSIENT_ERRORS: &[&str] = &[
    "replacement transaction underpriced",
    "known transaction",
    "gas price too low to replace",
    "transaction with the same hash was already imported",
    "gateway timeout",
    "nonce too low",
];

fn is_known_transient(err: &TellerError) -> bool {
    let message = err.to_string().to_lowercase();
    KNOWN_TRANSIENT_ERRORS
        .iter()
        .any(|known| message.contains(known))
}

/// Outcome of a resubmission attempt for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResubmitAction {
    /// The raw transaction was rebroadcast.
    Republished(TransactionUuid),
    /// The record was never signed/published; it must go back through the
    /// controller's approval path.
    NeedsApproval(TransactionUuid),
    /// The exponential backoff gate suppressed the attempt this cycle.
    NotReady(TransactionUuid),
    /// The sender cannot cover value + fee; suppressed without error.
    InsufficientBalance(TransactionUuid),
}

/// Background reconciliation of in-flight records against the network.
///
/// Invoked once per new block: classifies each submitted record's fate
/// (confirmed, dropped, failed) and republishes stalled transactions. A
/// failure while checking one record never aborts the pass for others.
pub struct PendingTracker {
    chain: Arc<dyn ChainClient>,
    store: Arc<TransactionStore>,
    nonces: Arc<NonceManager>,
    dropped_buffer_blocks: u32,
    network_label: String,
    events: EventSender,
    metrics: TellerMetrics,
    /// Consecutive cycles each record has been seen with its nonce slot
    /// consumed and no receipt.
    observations: parking_lot::Mutex<HashMap<TransactionUuid, u32>>,
}

impl PendingTracker {
    pub fn new(
        config: &TellerConfig,
        chain: Arc<dyn ChainClient>,
        store: Arc<TransactionStore>,
        nonces: Arc<NonceManager>,
        events: EventSender,
        metrics: TellerMetrics,
    ) -> Self {
        Self {
            chain,
            store,
            nonces,
            dropped_buffer_blocks: config.dropped_buffer_blocks,
            network_label: config.network_id.to_string(),
            events,
            metrics,
            observations: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Check every submitted record against the network. Checks run
    /// concurrently; each record's status write is serialized through the
    /// store's update path.
    pub async fn update_pending(&self) {
        let records = self.store.submitted();
        if records.is_empty() {
            return;
        }
        info!(count = records.len(), "Checking in-flight transactions");
        join_all(records.into_iter().map(|record| self.check_record(record))).await;
    }

    #[instrument(skip_all, fields(id = %record.id, nonce = ?record.nonce()))]
    async fn check_record(&self, record: TransactionRecord) {
        let Some(hash) = record.hash else {
            // reached submitted without ever acquiring a hash; it cannot
            // be tracked further
            let result = self.store.set_status_failed(
                &record.id,
                "transaction submitted without a hash",
                "pending-tracker#check: no hash",
            );
            if let Err(err) = result {
                warn!(?err, "Failed to mark hashless transaction as failed");
            }
            return;
        };

        match self.chain.transaction_receipt(hash).await {
            Err(err) => self.warn_record(&record.id, &err),
            Ok(Some(receipt)) => self.confirm(&record.id, receipt),
            Ok(None) => self.check_dropped(record, hash).await,
        }
    }

    fn confirm(&self, id: &TransactionUuid, receipt: TransactionReceipt) {
        // re-fetch: the record may have been finalized by a concurrent
        // check while the receipt query was in flight
        let Some(mut fresh) = self.store.get(id) else {
            return;
        };
        if fresh.status != TransactionStatus::Submitted {
            return;
        }
        fresh.receipt = Some(receipt);
        if let Err(err) = self
            .store
            .update(fresh.clone(), "pending-tracker#confirm: attach receipt")
        {
            warn!(?err, %id, "Failed to attach receipt");
        }
        if let Err(err) =
            self.store
                .set_status(id, TransactionStatus::Confirmed, "pending-tracker#confirm")
        {
            warn!(?err, %id, "Failed to mark transaction confirmed");
            return;
        }
        self.observations.lock().remove(id);
        info!(%id, "Transaction confirmed");
        self.mark_nonce_duplicates_dropped(&fresh);
    }

    /// Once one record at `(from, nonce)` confirms, every sibling sharing
    /// the tuple has permanently lost its slot.
    fn mark_nonce_duplicates_dropped(&self, confirmed: &TransactionRecord) {
        let Some(nonce) = confirmed.nonce() else {
            return;
        };
        let siblings = self
            .store
            .get_filtered(TxQuery::new().from(confirmed.tx_params.from).nonce(nonce));
        for sibling in siblings {
            if sibling.id == confirmed.id || sibling.status == TransactionStatus::Confirmed {
                continue;
            }
            self.drop_record(&sibling.id, confirmed.hash, "nonce consumed by sibling");
        }
    }

    async fn check_dropped(&self, record: TransactionRecord, hash: H256) {
        let from = record.tx_params.from;
        let Some(nonce) = record.nonce() else {
            return;
        };

        // a locally confirmed sibling at the same nonce settles it
        let taken_by = self
            .store
            .confirmed(from)
            .into_iter()
            .find(|sibling| sibling.nonce() == Some(nonce) && sibling.id != record.id);
        if let Some(sibling) = taken_by {
            self.drop_record(&record.id, sibling.hash, "nonce taken by confirmed sibling");
            return;
        }

        let network_next = match self.chain.transaction_count(from).await {
            Ok(count) => count,
            Err(err) => {
                self.warn_record(&record.id, &err);
                return;
            }
        };

        if network_next > nonce {
            // the slot was consumed by something we cannot see yet; nodes
            // report this eventually-consistently, so require several
            // consecutive observations before declaring the drop
            let seen = {
                let mut observations = self.observations.lock();
                let seen = observations.entry(record.id.clone()).or_insert(0);
                *seen += 1;
                *seen
            };
            debug!(id = %record.id, %hash, seen, "Nonce slot consumed without a receipt");
            if seen >= self.dropped_buffer_blocks {
                self.drop_record(&record.id, None, "nonce slot consumed on network");
            }
        } else {
            self.observations.lock().remove(&record.id);
        }
    }

    fn drop_record(&self, id: &TransactionUuid, replaced_by: Option<H256>, reason: &str) {
        // re-fetch: never write a drop over a base mutated by a
        // concurrent check
        let Some(mut fresh) = self.store.get(id) else {
            return;
        };
        if fresh.status.is_final() {
            return;
        }
        if let Some(hash) = replaced_by {
            fresh.replaced_by = Some(hash);
            if let Err(err) = self
                .store
                .update(fresh, "pending-tracker#drop: record replacement hash")
            {
                warn!(?err, %id, "Failed to record replacement hash");
            }
        }
        if let Err(err) = self.store.set_status(
            id,
            TransactionStatus::Dropped,
            format!("pending-tracker#drop: {reason}"),
        ) {
            warn!(?err, %id, "Failed to mark transaction dropped");
            return;
        }
        self.observations.lock().remove(id);
        info!(%id, reason, "Transaction dropped");
    }

    /// Republish stalled transactions. Holds the global nonce guard for
    /// the whole pass so no allocation races a rebroadcast. Returns one
    /// action per record; the controller re-runs approval for records
    /// that were never published.
    #[instrument(skip(self), fields(%latest_block))]
    pub async fn resubmit_pending(&self, latest_block: U64) -> Vec<ResubmitAction> {
        let _global = self.nonces.lock_all().await;
        let records = self.store.in_flight();
        let mut actions = Vec::with_capacity(records.len());
        for record in records {
            match self.resubmit_record(&record, latest_block).await {
                Ok(action) => actions.push(action),
                Err(err) if is_known_transient(&err) => {
                    debug!(id = %record.id, %err, "Known transient publish error; will retry next cycle");
                }
                Err(err) => self.warn_record(&record.id, &err),
            }
        }
        actions
    }

    async fn resubmit_record(
        &self,
        record: &TransactionRecord,
        latest_block: U64,
    ) -> Result<ResubmitAction, TellerError> {
        let id = record.id.clone();
        let Some(raw_tx) = record.raw_tx.clone() else {
            // never signed/published; route back through approval
            return Ok(ResubmitAction::NeedsApproval(id));
        };

        if let Some(first_retry) = record.first_retry_block_number {
            let elapsed = latest_block.as_u64().saturating_sub(first_retry.as_u64());
            let threshold = 1u64
                .checked_shl(record.retry_count)
                .unwrap_or(u64::MAX);
            if elapsed < threshold {
                return Ok(ResubmitAction::NotReady(id));
            }
        }

        let params = &record.tx_params;
        let balance = self.chain.balance(params.from).await?;
        let fee = params
            .gas
            .unwrap_or_default()
            .checked_mul(params.gas_price.unwrap_or_default())
            .unwrap_or(U256::MAX);
        let cost = params.value.checked_add(fee).unwrap_or(U256::MAX);
        if balance < cost {
            debug!(%id, %balance, %cost, "Insufficient balance; suppressing resubmission this cycle");
            return Ok(ResubmitAction::InsufficientBalance(id));
        }

        self.chain.send_raw_transaction(raw_tx).await?;

        let mut fresh = self
            .store
            .get(&id)
            .ok_or_else(|| TellerError::TxNotFound(id.clone()))?;
        fresh.retry_count += 1;
        if fresh.first_retry_block_number.is_none() {
            fresh.first_retry_block_number = Some(latest_block);
        }
        self.store.update(fresh, "pending-tracker#resubmit")?;
        self.metrics.update_resubmission_metric(&self.network_label);
        info!(%id, retry_count = record.retry_count + 1, "Republished transaction");
        Ok(ResubmitAction::Republished(id))
    }

    fn warn_record(&self, id: &TransactionUuid, err: &TellerError) {
        warn!(%id, %err, "Non-fatal error while tracking transaction");
        self.metrics
            .update_warning_metric(err.to_metrics_label(), &self.network_label);
        emit(
            &self.events,
            TellerEvent::Warning {
                id: id.clone(),
                message: err.to_string(),
            },
        );
    }
}
