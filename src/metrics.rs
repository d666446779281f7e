use prometheus::{
    opts, register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry,
    Encoder, IntCounterVec, IntGaugeVec, Registry,
};

const METRICS_NAMESPACE: &str = "teller";

fn namespaced(name: &str) -> String {
    format!("{}_{}", METRICS_NAMESPACE, name)
}

/// Metric bundle for a controller instance. All vecs are labeled by
/// network so several controllers can share one registry.
#[derive(Clone)]
pub struct TellerMetrics {
    registry: Registry,

    pub pending_transactions: IntGaugeVec,
    pub unapproved_transactions: IntGaugeVec,

    pub confirmed_transactions: IntCounterVec,
    pub dropped_transactions: IntCounterVec,
    pub failed_transactions: IntCounterVec,
    pub rejected_transactions: IntCounterVec,

    pub transaction_resubmissions: IntCounterVec,
    pub nonce_allocations: IntCounterVec,
    pub tracker_warnings: IntCounterVec,
}

impl TellerMetrics {
    pub fn new(registry: Registry) -> eyre::Result<Self> {
        let pending_transactions = register_int_gauge_vec_with_registry!(
            opts!(
                namespaced("pending_transactions"),
                "The number of transactions currently submitted or approved",
            ),
            &["network"],
            registry.clone()
        )?;
        let unapproved_transactions = register_int_gauge_vec_with_registry!(
            opts!(
                namespaced("unapproved_transactions"),
                "The number of transactions awaiting approval",
            ),
            &["network"],
            registry.clone()
        )?;
        let confirmed_transactions = register_int_counter_vec_with_registry!(
            opts!(
                namespaced("confirmed_transactions"),
                "The number of transactions confirmed on chain",
            ),
            &["network"],
            registry.clone()
        )?;
        let dropped_transactions = register_int_counter_vec_with_registry!(
            opts!(
                namespaced("dropped_transactions"),
                "The number of transactions whose nonce slot was consumed by another transaction",
            ),
            &["network", "reason"],
            registry.clone()
        )?;
        let failed_transactions = register_int_counter_vec_with_registry!(
            opts!(
                namespaced("failed_transactions"),
                "The number of transactions that failed before or during publication",
            ),
            &["network"],
            registry.clone()
        )?;
        let rejected_transactions = register_int_counter_vec_with_registry!(
            opts!(
                namespaced("rejected_transactions"),
                "The number of transactions rejected by the user",
            ),
            &["network"],
            registry.clone()
        )?;
        let transaction_resubmissions = register_int_counter_vec_with_registry!(
            opts!(
                namespaced("transaction_resubmissions"),
                "The number of times stuck transactions were republished",
            ),
            &["network"],
            registry.clone()
        )?;
        let nonce_allocations = register_int_counter_vec_with_registry!(
            opts!(
                namespaced("nonce_allocations"),
                "The number of nonce reservations handed out",
            ),
            &["network"],
            registry.clone()
        )?;
        let tracker_warnings = register_int_counter_vec_with_registry!(
            opts!(
                namespaced("tracker_warnings"),
                "The number of non-fatal per-record warnings emitted by the pending tracker",
            ),
            &["network", "error"],
            registry.clone()
        )?;

        Ok(Self {
            registry,
            pending_transactions,
            unapproved_transactions,
            confirmed_transactions,
            dropped_transactions,
            failed_transactions,
            rejected_transactions,
            transaction_resubmissions,
            nonce_allocations,
            tracker_warnings,
        })
    }

    pub fn update_badge_metrics(&self, unapproved: usize, pending: usize, network: &str) {
        self.unapproved_transactions
            .with_label_values(&[network])
            .set(unapproved as i64);
        self.pending_transactions
            .with_label_values(&[network])
            .set(pending as i64);
    }

    pub fn update_status_metric(
        &self,
        status: &crate::transaction::TransactionStatus,
        network: &str,
    ) {
        use crate::transaction::TransactionStatus::*;
        match status {
            Confirmed => self
                .confirmed_transactions
                .with_label_values(&[network])
                .inc(),
            Dropped => self
                .dropped_transactions
                .with_label_values(&[network, "nonce_consumed"])
                .inc(),
            Failed => self.failed_transactions.with_label_values(&[network]).inc(),
            Rejected => self
                .rejected_transactions
                .with_label_values(&[network])
                .inc(),
            _ => {}
        }
    }

    pub fn update_resubmission_metric(&self, network: &str) {
        self.transaction_resubmissions
            .with_label_values(&[network])
            .inc();
    }

    pub fn update_nonce_allocation_metric(&self, network: &str) {
        self.nonce_allocations.with_label_values(&[network]).inc();
    }

    pub fn update_warning_metric(&self, error: &str, network: &str) {
        self.tracker_warnings
            .with_label_values(&[network, error])
            .inc();
    }

    pub fn gather(&self) -> prometheus::Result<Vec<u8>> {
        let collected = self.registry.gather();
        let mut out = Vec::with_capacity(1024 * 16);
        let encoder = prometheus::TextEncoder::new();
        encoder.encode(&collected, &mut out)?;
        Ok(out)
    }

    #[cfg(test)]
    pub fn dummy_instance() -> Self {
        let registry = Registry::new();
        Self::new(registry).expect("Failed to register metrics on a fresh registry")
    }
}
