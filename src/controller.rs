use std::sync::Arc;

use ethers_core::types::{Address, H256, U256, U64};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, instrument, warn};

use crate::chain::{ChainClient, SignerError, TransactionSigner};
use crate::config::TellerConfig;
use crate::error::TellerError;
use crate::events::{EventSender, TellerEvent};
use crate::metrics::TellerMetrics;
use crate::monitor::{PendingTracker, ResubmitAction};
use crate::nonce::{NonceLease, NonceManager};
use crate::store::{TransactionStore, TxQuery};
use crate::transaction::{
    TransactionKind, TransactionRecord, TransactionRequest, TransactionStatus, TransactionUuid,
    TxParams,
};

const CANCEL_GAS: u64 = 21_000;

/// Public entry point of the coordinator.
///
/// Wires the store, nonce manager and pending tracker together and drives
/// the pre-submission half of the lifecycle:
/// `unapproved -> approved -> signed -> submitted`, after which the
/// tracker walks records to a terminal state. Each instance owns its own
/// event channel; listeners attach through [`Self::subscribe`].
pub struct TransactionController {
    config: TellerConfig,
    chain: Arc<dyn ChainClient>,
    signer: Arc<dyn TransactionSigner>,
    store: Arc<TransactionStore>,
    nonces: Arc<NonceManager>,
    tracker: PendingTracker,
    events: EventSender,
    metrics: TellerMetrics,
    network_label: String,
}

impl TransactionController {
    pub fn new(
        config: TellerConfig,
        chain: Arc<dyn ChainClient>,
        signer: Arc<dyn TransactionSigner>,
        metrics: TellerMetrics,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer);
        let store = Arc::new(TransactionStore::new(
            &config,
            events.clone(),
            metrics.clone(),
        ));
        let nonces = Arc::new(NonceManager::new(chain.clone(), store.clone()));
        let tracker = PendingTracker::new(
            &config,
            chain.clone(),
            store.clone(),
            nonces.clone(),
            events.clone(),
            metrics.clone(),
        );
        let network_label = config.network_id.to_string();
        Self {
            config,
            chain,
            signer,
            store,
            nonces,
            tracker,
            events,
            metrics,
            network_label,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TellerEvent> {
        self.events.subscribe()
    }

    /// Validate a request, stamp defaults and network scope, and persist
    /// it as unapproved.
    #[instrument(skip_all, fields(from = %request.from))]
    pub fn create(&self, request: TransactionRequest) -> Result<TransactionRecord, TellerError> {
        let params = request.into_params();
        params.validate()?;
        let kind = TransactionKind::classify(&params);
        let record = TransactionRecord::new(
            params,
            kind,
            self.config.network_id,
            self.config.chain_id,
        );
        let id = record.id.clone();
        self.store.add(record)?;
        info!(%id, "Created unapproved transaction");
        self.store.get(&id).ok_or(TellerError::TxNotFound(id))
    }

    /// Drive a record through nonce reservation, signing and publication.
    ///
    /// The per-address nonce lock is held from reservation until the
    /// record is durably submitted, and released on every failure path.
    /// Signer denial finalizes the record as rejected; any other failure
    /// finalizes it as failed. Either way the error propagates to the
    /// caller, who decides whether to retry.
    #[instrument(skip(self), fields(%id))]
    pub async fn approve(&self, id: &TransactionUuid) -> Result<H256, TellerError> {
        let record = self
            .store
            .get(id)
            .ok_or_else(|| TellerError::TxNotFound(id.clone()))?;
        if !matches!(
            record.status,
            TransactionStatus::Unapproved | TransactionStatus::Approved
        ) {
            return Err(TellerError::InvalidStatusTransition {
                from: record.status,
                to: TransactionStatus::Approved,
            });
        }
        self.store
            .set_status(id, TransactionStatus::Approved, "controller#approve")?;

        // retry/cancel records already own their nonce slot
        let fixed_nonce = record.last_gas_price.is_some() && record.tx_params.nonce.is_some();
        let lease = if fixed_nonce {
            None
        } else {
            match self.nonces.next_nonce(record.tx_params.from).await {
                Ok(lease) => Some(lease),
                Err(err) => {
                    self.finalize_failed_approval(id, &err);
                    return Err(err);
                }
            }
        };

        let result = self.sign_and_publish(id, lease.as_ref()).await;
        // the record must reach submitted/failed before the lease drops,
        // or a racing allocation could observe a half-written record
        if let Err(err) = &result {
            self.finalize_failed_approval(id, err);
        }
        drop(lease);
        result
    }

    fn finalize_failed_approval(&self, id: &TransactionUuid, err: &TellerError) {
        let finalize = match err {
            TellerError::SignerDenied => self.store.set_status(
                id,
                TransactionStatus::Rejected,
                "controller#approve: user denied signature",
            ),
            _ => self
                .store
                .set_status_failed(id, err.to_string(), "controller#approve"),
        };
        if let Err(finalize_err) = finalize {
            warn!(%id, %finalize_err, "Failed to finalize record after approval error");
        }
    }

    async fn sign_and_publish(
        &self,
        id: &TransactionUuid,
        lease: Option<&NonceLease>,
    ) -> Result<H256, TellerError> {
        let mut record = self
            .store
            .get(id)
            .ok_or_else(|| TellerError::TxNotFound(id.clone()))?;
        if let Some(lease) = lease {
            record.tx_params.nonce = Some(lease.nonce);
            record.nonce_details = Some(lease.details.clone());
            self.metrics
                .update_nonce_allocation_metric(&self.network_label);
        }

        if record.tx_params.gas_price.is_none() {
            record.tx_params.gas_price = Some(self.chain.gas_price().await?);
        }
        if record.tx_params.gas.is_none() {
            record.tx_params.gas = Some(self.chain.estimate_gas(&record.tx_params).await?);
        }
        self.store
            .update(record.clone(), "controller#approve: nonce and gas defaults")?;

        let raw_tx = self
            .signer
            .sign_transaction(&record.tx_params, self.config.chain_id)
            .await
            .map_err(|err| match err {
                SignerError::Denied => TellerError::SignerDenied,
                SignerError::Unavailable(message) => TellerError::SigningFailed(message),
            })?;
        record.raw_tx = Some(raw_tx.clone());
        self.store
            .update(record.clone(), "controller#sign: attach raw transaction")?;
        self.store
            .set_status(id, TransactionStatus::Signed, "controller#sign")?;
        record.status = TransactionStatus::Signed;

        let hash = self.chain.send_raw_transaction(raw_tx).await?;
        record.hash = Some(hash);
        self.store
            .update(record, "controller#publish: attach hash")?;
        self.store
            .set_status(id, TransactionStatus::Submitted, "controller#publish")?;
        info!(%id, %hash, "Transaction submitted");
        Ok(hash)
    }

    /// Terminal escape hatch for records still awaiting publication.
    pub fn reject(&self, id: &TransactionUuid) -> Result<(), TellerError> {
        let record = self
            .store
            .get(id)
            .ok_or_else(|| TellerError::TxNotFound(id.clone()))?;
        if !matches!(
            record.status,
            TransactionStatus::Unapproved | TransactionStatus::Approved
        ) {
            return Err(TellerError::InvalidStatusTransition {
                from: record.status,
                to: TransactionStatus::Rejected,
            });
        }
        self.store.set_status(
            id,
            TransactionStatus::Rejected,
            "controller#reject: user denied",
        )
    }

    /// Attempt to cancel a submitted transaction by publishing a zero-value
    /// self-send at the same nonce with a bumped fee. The original record
    /// is left alone; it is marked dropped once the replacement confirms.
    pub async fn cancel(
        &self,
        id: &TransactionUuid,
        custom_gas_price: Option<U256>,
    ) -> Result<TransactionRecord, TellerError> {
        let original = self
            .store
            .get(id)
            .ok_or_else(|| TellerError::TxNotFound(id.clone()))?;
        let nonce = original
            .nonce()
            .ok_or_else(|| TellerError::MissingNonce(id.clone()))?;
        let last_gas_price = original.tx_params.gas_price.unwrap_or_default();
        let from = original.tx_params.from;

        let params = TxParams {
            from,
            to: Some(from),
            value: U256::zero(),
            data: Default::default(),
            nonce: Some(nonce),
            gas: Some(U256::from(CANCEL_GAS)),
            gas_price: Some(self.bumped_gas_price(last_gas_price, custom_gas_price)),
        };
        self.replace_at_same_nonce(
            params,
            TransactionKind::Cancel {
                original: id.clone(),
            },
            last_gas_price,
        )
        .await
    }

    /// Re-publish a stuck transaction at the same nonce with a bumped fee.
    pub async fn speed_up(
        &self,
        id: &TransactionUuid,
        custom_gas_price: Option<U256>,
    ) -> Result<TransactionRecord, TellerError> {
        let original = self
            .store
            .get(id)
            .ok_or_else(|| TellerError::TxNotFound(id.clone()))?;
        if original.nonce().is_none() {
            return Err(TellerError::MissingNonce(id.clone()));
        }
        let last_gas_price = original.tx_params.gas_price.unwrap_or_default();

        let mut params = original.tx_params.clone();
        params.gas_price = Some(self.bumped_gas_price(last_gas_price, custom_gas_price));
        self.replace_at_same_nonce(
            params,
            TransactionKind::Retry {
                original: id.clone(),
            },
            last_gas_price,
        )
        .await
    }

    async fn replace_at_same_nonce(
        &self,
        params: TxParams,
        kind: TransactionKind,
        last_gas_price: U256,
    ) -> Result<TransactionRecord, TellerError> {
        let mut record = TransactionRecord::new(
            params,
            kind,
            self.config.network_id,
            self.config.chain_id,
        );
        // marks the nonce as fixed; approval must not reallocate it
        record.last_gas_price = Some(last_gas_price);
        record.status = TransactionStatus::Approved;
        let id = record.id.clone();
        self.store.add(record)?;
        self.approve(&id).await?;
        self.store.get(&id).ok_or(TellerError::TxNotFound(id))
    }

    fn bumped_gas_price(&self, last: U256, custom: Option<U256>) -> U256 {
        let bumped = last
            .checked_mul(U256::from(100 + self.config.gas_bump_percent))
            .map(|scaled| scaled / U256::from(100))
            .unwrap_or(last);
        custom.unwrap_or(bumped)
    }

    /// One reconciliation cycle: classify every in-flight record, then
    /// resubmit the stalled ones. Per-record failures are isolated; this
    /// never propagates an error to the block driver.
    #[instrument(skip(self), fields(%block_number))]
    pub async fn on_new_block(&self, block_number: U64) {
        self.tracker.update_pending().await;
        let actions = self.tracker.resubmit_pending(block_number).await;
        for action in actions {
            if let ResubmitAction::NeedsApproval(id) = action {
                if let Err(err) = self.approve(&id).await {
                    warn!(%id, %err, "Re-approval of unsigned pending transaction failed");
                }
            }
        }
    }

    /// Long-running entry point: consume a stream of new block numbers
    /// (the clock source) and run one cycle per block.
    pub async fn run(&self, mut blocks: mpsc::Receiver<U64>) {
        while let Some(block_number) = blocks.recv().await {
            self.on_new_block(block_number).await;
        }
        warn!("Block stream closed; transaction controller loop exiting");
    }

    /// Boot cleanup: a record found approved at startup was stuck mid-sign
    /// when the process died and cannot be resumed safely.
    pub fn resume(&self) {
        for record in self.store.approved() {
            let result = self.store.set_status_failed(
                &record.id,
                "transaction found as approved during startup - possibly stuck during signing",
                "controller#resume",
            );
            if let Err(err) = result {
                warn!(id = %record.id, %err, "Failed to fail stuck approved transaction");
            }
        }
    }

    pub fn get(&self, id: &TransactionUuid) -> Option<TransactionRecord> {
        self.store.get(id)
    }

    pub fn get_filtered(&self, query: TxQuery) -> Vec<TransactionRecord> {
        self.store.get_filtered(query)
    }

    pub fn get_list(&self, max_unique_nonces: Option<usize>) -> Vec<TransactionRecord> {
        self.store.get_list(max_unique_nonces)
    }

    pub fn unapproved_count(&self) -> usize {
        self.store.unapproved_count()
    }

    pub fn pending_count(&self, address: Option<Address>) -> usize {
        self.store.pending_count(address)
    }

    pub fn confirmed_transactions(&self, address: Address) -> Vec<TransactionRecord> {
        self.store.confirmed(address)
    }

    pub fn wipe(&self, address: Address) {
        self.store.wipe(address);
    }
}

#[cfg(test)]
mod tests;
