use std::collections::HashSet;

use ethers_core::types::{Address, U256};
use itertools::Itertools;
use parking_lot::RwLock;
use tracing::warn;

use crate::config::TellerConfig;
use crate::error::TellerError;
use crate::events::{emit, EventSender, TellerEvent};
use crate::metrics::TellerMetrics;
use crate::transaction::history;
use crate::transaction::{TransactionRecord, TransactionStatus, TransactionUuid};

type Matcher = Box<dyn Fn(&TransactionRecord) -> bool + Send + Sync>;

/// Record filter for [`TransactionStore::get_filtered`]. Matches by exact
/// field equality and/or custom per-record matcher closures. Scope
/// defaults to the store's current network; call [`TxQuery::any_network`]
/// to opt out.
#[derive(Default)]
pub struct TxQuery {
    from: Option<Address>,
    to: Option<Address>,
    status: Option<TransactionStatus>,
    nonce: Option<U256>,
    all_networks: bool,
    matchers: Vec<Matcher>,
}

impl TxQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }

    pub fn to(mut self, to: Address) -> Self {
        self.to = Some(to);
        self
    }

    pub fn status(mut self, status: TransactionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn nonce(mut self, nonce: U256) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn any_network(mut self) -> Self {
        self.all_networks = true;
        self
    }

    pub fn matching(
        mut self,
        matcher: impl Fn(&TransactionRecord) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.matchers.push(Box::new(matcher));
        self
    }

    fn matches(&self, record: &TransactionRecord) -> bool {
        if let Some(from) = self.from {
            if record.tx_params.from != from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if record.tx_params.to != Some(to) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(nonce) = self.nonce {
            if record.tx_params.nonce != Some(nonce) {
                return false;
            }
        }
        self.matchers.iter().all(|matcher| matcher(record))
    }
}

struct Inner {
    /// Insertion-ordered; oldest first. Order is what retention evicts by.
    records: Vec<TransactionRecord>,
}

/// Authoritative, queryable collection of transaction records, scoped by
/// network. All mutations are synchronous, atomic steps: a validation
/// failure never partially applies, and history diffs are computed under
/// the write lock so they are never computed against a stale base.
pub struct TransactionStore {
    network_id: u64,
    network_label: String,
    tx_history_limit: usize,
    inner: RwLock<Inner>,
    events: EventSender,
    metrics: TellerMetrics,
}

impl TransactionStore {
    pub fn new(config: &TellerConfig, events: EventSender, metrics: TellerMetrics) -> Self {
        Self {
            network_id: config.network_id,
            network_label: config.network_id.to_string(),
            tx_history_limit: config.tx_history_limit,
            inner: RwLock::new(Inner {
                records: Vec::new(),
            }),
            events,
            metrics,
        }
    }

    /// Validate and insert a new record. The record's history is seeded
    /// with a full snapshot. Finalized records beyond the retention limit
    /// are evicted, oldest first; unapproved records are never evicted.
    pub fn add(&self, mut record: TransactionRecord) -> Result<(), TellerError> {
        record.tx_params.validate()?;
        let added = {
            let mut inner = self.inner.write();
            if inner.records.iter().any(|existing| existing.id == record.id) {
                return Err(TellerError::DuplicateTransaction(record.id.clone()));
            }
            record.history = vec![history::snapshot_entry(&record)];
            inner.records.push(record.clone());
            self.enforce_retention(&mut inner);
            record
        };
        emit(&self.events, TellerEvent::Added(added));
        self.emit_badge();
        Ok(())
    }

    /// Validate and replace the record with the same id, appending a diff
    /// of the change to its history. A no-op update appends nothing.
    pub fn update(
        &self,
        record: TransactionRecord,
        note: impl Into<String>,
    ) -> Result<(), TellerError> {
        record.tx_params.validate()?;
        {
            let mut inner = self.inner.write();
            let stored = inner
                .records
                .iter_mut()
                .find(|stored| stored.id == record.id)
                .ok_or_else(|| TellerError::TxNotFound(record.id.clone()))?;
            if stored.status.locks_params() && stored.tx_params != record.tx_params {
                return Err(TellerError::TxParamsImmutable);
            }
            let base = history::snapshot_value(stored)?;
            let next = history::snapshot_value(&record)?;
            let mut updated = record;
            updated.history = std::mem::take(&mut stored.history);
            if let Some(entry) = history::diff_entry(&base, &next, Some(note.into())) {
                updated.history.push(entry);
            }
            *stored = updated;
        }
        self.emit_badge();
        Ok(())
    }

    /// Transition a record to `status`. Terminal states are sinks: a
    /// transition away from one is ignored with a warning. Emits the
    /// per-record status event.
    pub fn set_status(
        &self,
        id: &TransactionUuid,
        status: TransactionStatus,
        note: impl Into<String>,
    ) -> Result<(), TellerError> {
        self.transition(id, status, note.into(), None)
    }

    /// Transition to `Failed`, recording the error message on the record.
    pub fn set_status_failed(
        &self,
        id: &TransactionUuid,
        message: impl Into<String>,
        note: impl Into<String>,
    ) -> Result<(), TellerError> {
        self.transition(id, TransactionStatus::Failed, note.into(), Some(message.into()))
    }

    fn transition(
        &self,
        id: &TransactionUuid,
        status: TransactionStatus,
        note: String,
        err: Option<String>,
    ) -> Result<(), TellerError> {
        {
            let mut inner = self.inner.write();
            let stored = inner
                .records
                .iter_mut()
                .find(|stored| &stored.id == id)
                .ok_or_else(|| TellerError::TxNotFound(id.clone()))?;
            if stored.status == status {
                return Ok(());
            }
            if stored.status.is_final() {
                warn!(
                    ?id,
                    current = ?stored.status,
                    requested = ?status,
                    "Ignoring status transition out of a terminal state"
                );
                return Ok(());
            }
            let base = history::snapshot_value(stored)?;
            stored.status = status;
            if let Some(message) = err {
                stored.err = Some(message);
            }
            let next = history::snapshot_value(stored)?;
            if let Some(entry) = history::diff_entry(&base, &next, Some(note)) {
                stored.history.push(entry);
            }
        }
        self.metrics.update_status_metric(&status, &self.network_label);
        emit(
            &self.events,
            TellerEvent::StatusChanged {
                id: id.clone(),
                status,
            },
        );
        self.emit_badge();
        Ok(())
    }

    pub fn get(&self, id: &TransactionUuid) -> Option<TransactionRecord> {
        self.inner
            .read()
            .records
            .iter()
            .find(|record| &record.id == id)
            .cloned()
    }

    pub fn get_filtered(&self, query: TxQuery) -> Vec<TransactionRecord> {
        self.inner
            .read()
            .records
            .iter()
            .filter(|record| query.all_networks || record.network_id == self.network_id)
            .filter(|record| query.matches(record))
            .cloned()
            .collect()
    }

    /// All records on the current network, optionally capped to the
    /// `max_unique_nonces` most recent distinct `(from, nonce)` tuples.
    /// Every record of an included tuple is preserved, so competing
    /// submissions at a displayed nonce all remain visible. Records that
    /// do not carry a nonce yet are always included.
    pub fn get_list(&self, max_unique_nonces: Option<usize>) -> Vec<TransactionRecord> {
        let inner = self.inner.read();
        let scoped = inner
            .records
            .iter()
            .filter(|record| record.network_id == self.network_id);
        let Some(limit) = max_unique_nonces else {
            return scoped.cloned().collect();
        };
        let keys: Vec<(Address, U256)> = inner
            .records
            .iter()
            .filter(|record| record.network_id == self.network_id)
            .filter_map(nonce_key)
            .unique()
            .collect();
        let kept: HashSet<(Address, U256)> = keys
            .iter()
            .skip(keys.len().saturating_sub(limit))
            .copied()
            .collect();
        scoped
            .filter(|record| match nonce_key(record) {
                Some(key) => kept.contains(&key),
                None => true,
            })
            .cloned()
            .collect()
    }

    pub fn remove(&self, id: &TransactionUuid) {
        self.inner.write().records.retain(|record| &record.id != id);
        self.emit_badge();
    }

    /// Remove every record sent from `address`, scoped to the current
    /// network only.
    pub fn wipe(&self, address: Address) {
        self.inner.write().records.retain(|record| {
            record.network_id != self.network_id || record.tx_params.from != address
        });
        self.emit_badge();
    }

    pub fn clear_unapproved(&self) {
        self.inner
            .write()
            .records
            .retain(|record| record.status != TransactionStatus::Unapproved);
        self.emit_badge();
    }

    pub fn unapproved_count(&self) -> usize {
        self.count_scoped(|record| record.status == TransactionStatus::Unapproved)
    }

    /// Submitted + approved, the spec's notion of "pending count".
    pub fn pending_count(&self, address: Option<Address>) -> usize {
        self.count_scoped(|record| {
            matches!(
                record.status,
                TransactionStatus::Submitted | TransactionStatus::Approved
            ) && address.map_or(true, |from| record.tx_params.from == from)
        })
    }

    /// Records currently broadcast and awaiting a receipt.
    pub fn submitted(&self) -> Vec<TransactionRecord> {
        self.filter_scoped(|record| record.status == TransactionStatus::Submitted)
    }

    /// Submitted and approved records: everything the monitor owns.
    pub fn in_flight(&self) -> Vec<TransactionRecord> {
        self.filter_scoped(|record| {
            matches!(
                record.status,
                TransactionStatus::Submitted | TransactionStatus::Approved
            )
        })
    }

    pub fn approved(&self) -> Vec<TransactionRecord> {
        self.filter_scoped(|record| record.status == TransactionStatus::Approved)
    }

    pub fn confirmed(&self, address: Address) -> Vec<TransactionRecord> {
        self.filter_scoped(|record| {
            record.status == TransactionStatus::Confirmed && record.tx_params.from == address
        })
    }

    /// Nonces held by in-flight records for `address`; the allocator's
    /// view of locally pending slots.
    pub fn in_flight_nonces(&self, address: Address) -> HashSet<U256> {
        self.inner
            .read()
            .records
            .iter()
            .filter(|record| record.network_id == self.network_id)
            .filter(|record| {
                matches!(
                    record.status,
                    TransactionStatus::Submitted | TransactionStatus::Approved
                ) && record.tx_params.from == address
            })
            .filter_map(|record| record.tx_params.nonce)
            .collect()
    }

    fn filter_scoped(
        &self,
        predicate: impl Fn(&TransactionRecord) -> bool,
    ) -> Vec<TransactionRecord> {
        self.inner
            .read()
            .records
            .iter()
            .filter(|record| record.network_id == self.network_id)
            .filter(|record| predicate(record))
            .cloned()
            .collect()
    }

    fn count_scoped(&self, predicate: impl Fn(&TransactionRecord) -> bool) -> usize {
        self.inner
            .read()
            .records
            .iter()
            .filter(|record| record.network_id == self.network_id)
            .filter(|record| predicate(record))
            .count()
    }

    fn enforce_retention(&self, inner: &mut Inner) {
        loop {
            let finalized: Vec<TransactionUuid> = inner
                .records
                .iter()
                .filter(|record| {
                    record.network_id == self.network_id && record.status.is_final()
                })
                .map(|record| record.id.clone())
                .collect();
            if finalized.len() <= self.tx_history_limit {
                break;
            }
            // oldest finalized record goes first
            let victim = finalized[0].clone();
            inner.records.retain(|record| record.id != victim);
        }
    }

    fn emit_badge(&self) {
        let (unapproved, pending) = {
            let inner = self.inner.read();
            let unapproved = inner
                .records
                .iter()
                .filter(|record| {
                    record.network_id == self.network_id
                        && record.status == TransactionStatus::Unapproved
                })
                .count();
            let pending = inner
                .records
                .iter()
                .filter(|record| {
                    record.network_id == self.network_id
                        && matches!(
                            record.status,
                            TransactionStatus::Submitted | TransactionStatus::Approved
                        )
                })
                .count();
            (unapproved, pending)
        };
        self.metrics
            .update_badge_metrics(unapproved, pending, &self.network_label);
        emit(
            &self.events,
            TellerEvent::BadgeUpdate {
                unapproved,
                pending,
            },
        );
    }
}

fn nonce_key(record: &TransactionRecord) -> Option<(Address, U256)> {
    record
        .tx_params
        .nonce
        .map(|nonce| (record.tx_params.from, nonce))
}
