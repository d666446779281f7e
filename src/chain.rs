use async_trait::async_trait;
use ethers_core::types::{Address, Bytes, TransactionReceipt, H256, U256, U64};

use crate::error::TellerError;
use crate::transaction::TxParams;

/// Read/publish access to the network, consumed as an opaque capability.
///
/// Implementations wrap whatever JSON-RPC transport the host application
/// uses; this crate never owns the connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Count of confirmed transactions for `address`, i.e. the next nonce
    /// the network expects.
    async fn transaction_count(&self, address: Address) -> Result<U256, TellerError>;

    /// Receipt for `hash`, or `None` while the transaction is not included
    /// in a block.
    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, TellerError>;

    async fn balance(&self, address: Address) -> Result<U256, TellerError>;

    async fn gas_price(&self) -> Result<U256, TellerError>;

    async fn estimate_gas(&self, params: &TxParams) -> Result<U256, TellerError>;

    /// Broadcast a signed transaction. Error messages from the node are
    /// surfaced verbatim so the caller can classify them.
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, TellerError>;

    async fn latest_block_number(&self) -> Result<U64, TellerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("user denied transaction signature")]
    Denied,
    #[error("signer unavailable: {0}")]
    Unavailable(String),
}

/// Signing capability. Key material lives entirely behind this trait.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Sign `params` for `chain_id` and return the raw signed transaction
    /// bytes, ready for broadcast.
    async fn sign_transaction(
        &self,
        params: &TxParams,
        chain_id: u64,
    ) -> Result<Bytes, SignerError>;
}
