use std::collections::HashMap;
use std::sync::Arc;

use ethers_core::types::{Address, U256};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, instrument};

use crate::chain::ChainClient;
use crate::error::TellerError;
use crate::store::TransactionStore;
use crate::transaction::NonceDetails;

/// Produces the next unused nonce for an address and guarantees at most
/// one caller holds a given address's slot at a time.
///
/// Three sources of truth are reconciled: the network's confirmed count,
/// locally confirmed records, and the contiguous run of locally pending
/// records. Taking the maximum prevents nonce reuse while the network
/// lags behind just-broadcast transactions.
pub struct NonceManager {
    chain: Arc<dyn ChainClient>,
    store: Arc<TransactionStore>,
    address_locks: parking_lot::Mutex<HashMap<Address, Arc<Mutex<()>>>>,
    global: Arc<RwLock<()>>,
}

/// Reservation handle. The address lock is held until this drops, so a
/// second allocation for the same address blocks until the holder has
/// persisted (or abandoned) its transaction. Every exit path releases.
pub struct NonceLease {
    pub nonce: U256,
    pub details: NonceDetails,
    _address_guard: OwnedMutexGuard<()>,
    _global_guard: OwnedRwLockReadGuard<()>,
}

impl std::fmt::Debug for NonceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceLease")
            .field("nonce", &self.nonce)
            .field("details", &self.details)
            .finish()
    }
}

/// Serializes against every address's allocator simultaneously. Held by
/// the pending tracker while resubmitting, so a resubmission pass never
/// races a fresh allocation.
pub struct GlobalNonceGuard {
    _guard: OwnedRwLockWriteGuard<()>,
}

impl NonceManager {
    pub fn new(chain: Arc<dyn ChainClient>, store: Arc<TransactionStore>) -> Self {
        Self {
            chain,
            store,
            address_locks: parking_lot::Mutex::new(HashMap::new()),
            global: Arc::new(RwLock::new(())),
        }
    }

    /// Reserve the next nonce for `address`.
    ///
    /// If the network query fails, the error is returned and no lock
    /// remains held; callers retry explicitly.
    #[instrument(skip(self), fields(%address))]
    pub async fn next_nonce(&self, address: Address) -> Result<NonceLease, TellerError> {
        let global_guard = self.global.clone().read_owned().await;
        let address_lock = {
            let mut locks = self.address_locks.lock();
            locks.entry(address).or_default().clone()
        };
        let address_guard = address_lock.lock_owned().await;

        // guards drop on the error path, leaving nothing held
        let network_next = self.chain.transaction_count(address).await?;

        let local_confirmed_next = self
            .store
            .confirmed(address)
            .iter()
            .filter_map(|record| record.tx_params.nonce)
            .max()
            .map(|highest| highest + U256::one())
            .unwrap_or_default();

        let base = network_next.max(local_confirmed_next);

        // walk the contiguous run of pending nonces starting at the
        // confirmed boundary; pending nonces below it are already
        // consumed, and ones past a gap cannot be assumed valid yet
        let pending = self.store.in_flight_nonces(address);
        let mut local_pending_next = base;
        while pending.contains(&local_pending_next) {
            local_pending_next = local_pending_next + U256::one();
        }

        let details = NonceDetails::new(network_next, local_confirmed_next, local_pending_next);
        let nonce = local_pending_next;
        debug!(%nonce, ?details, "Reserved nonce");

        Ok(NonceLease {
            nonce,
            details,
            _address_guard: address_guard,
            _global_guard: global_guard,
        })
    }

    /// Block until every outstanding lease is released and hold exclusive
    /// access to the allocator.
    pub async fn lock_all(&self) -> GlobalNonceGuard {
        GlobalNonceGuard {
            _guard: self.global.clone().write_owned().await,
        }
    }
}

#[cfg(test)]
mod tests;
