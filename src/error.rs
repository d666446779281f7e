use crate::transaction::{TransactionStatus, TransactionUuid};

#[derive(Debug, thiserror::Error)]
pub enum TellerError {
    #[error("Invalid transaction parameters: {0}")]
    InvalidTxParams(String),
    #[error("Transaction not found: {0}")]
    TxNotFound(TransactionUuid),
    #[error("Transaction already exists: {0}")]
    DuplicateTransaction(TransactionUuid),
    #[error("Transaction parameters are immutable once signed")]
    TxParamsImmutable,
    #[error("Transaction {0} has no nonce assigned")]
    MissingNonce(TransactionUuid),
    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidStatusTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Transaction error: {0}")]
    TxSubmissionError(String),
    #[error("Signature request was denied")]
    SignerDenied,
    #[error("Signing failed: {0}")]
    SigningFailed(String),
    #[error("History replay failed: {0}")]
    HistoryReplay(String),
    #[error("{0}")]
    EyreError(#[from] eyre::Report),
}

/// Whether an error is expected to clear on its own and the operation can
/// simply be retried on the next poll cycle.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for TellerError {
    fn is_retryable(&self) -> bool {
        matches!(self, TellerError::NetworkError(_))
    }
}

impl TellerError {
    /// Label used when counting errors in metrics.
    pub fn to_metrics_label(&self) -> &'static str {
        match self {
            TellerError::InvalidTxParams(_) => "invalid_tx_params",
            TellerError::TxNotFound(_) => "tx_not_found",
            TellerError::DuplicateTransaction(_) => "duplicate_transaction",
            TellerError::TxParamsImmutable => "tx_params_immutable",
            TellerError::MissingNonce(_) => "missing_nonce",
            TellerError::InvalidStatusTransition { .. } => "invalid_status_transition",
            TellerError::NetworkError(_) => "network_error",
            TellerError::TxSubmissionError(_) => "tx_submission_error",
            TellerError::SignerDenied => "signer_denied",
            TellerError::SigningFailed(_) => "signing_failed",
            TellerError::HistoryReplay(_) => "history_replay",
            TellerError::EyreError(_) => "unhandled",
        }
    }
}
