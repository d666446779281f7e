use std::sync::Arc;
use std::time::Duration;

use ethers_core::types::{Address, U256};
use tokio::time::timeout;

use super::NonceManager;
use crate::chain::{ChainClient, MockChainClient};
use crate::error::TellerError;
use crate::store::TransactionStore;
use crate::tests::test_utils::{new_store, test_config};
use crate::transaction::{TransactionRecord, TransactionStatus};

fn sender() -> Address {
    Address::repeat_byte(0x01)
}

fn manager_with(
    mock: MockChainClient,
    store: Arc<TransactionStore>,
) -> Arc<NonceManager> {
    let chain: Arc<dyn ChainClient> = Arc::new(mock);
    Arc::new(NonceManager::new(chain, store))
}

fn seed(store: &TransactionStore, status: TransactionStatus, nonces: &[u64]) {
    for &nonce in nonces {
        store
            .add(TransactionRecord::dummy(sender(), status, Some(nonce)))
            .expect("Failed to seed record");
    }
}

#[tokio::test]
async fn no_local_records_returns_the_network_nonce() {
    let (store, _rx) = new_store(&test_config());
    let mut mock = MockChainClient::new();
    mock.expect_transaction_count()
        .returning(|_| Ok(U256::zero()));
    let manager = manager_with(mock, store);

    let lease = manager
        .next_nonce(sender())
        .await
        .expect("Failed to reserve nonce");
    assert_eq!(lease.nonce, U256::zero());
    assert_eq!(lease.details.network_next, U256::zero());
    assert_eq!(lease.details.local_confirmed_next, U256::zero());
}

#[tokio::test]
async fn local_pending_ahead_of_network_extends_the_run() {
    let (store, _rx) = new_store(&test_config());
    seed(&store, TransactionStatus::Confirmed, &[0, 1, 2]);
    seed(&store, TransactionStatus::Submitted, &[3]);

    let mut mock = MockChainClient::new();
    mock.expect_transaction_count()
        .returning(|_| Ok(U256::one()));
    let manager = manager_with(mock, store);

    let lease = manager
        .next_nonce(sender())
        .await
        .expect("Failed to reserve nonce");
    assert_eq!(lease.nonce, U256::from(4u64));
    assert_eq!(lease.details.local_confirmed_next, U256::from(3u64));
}

#[tokio::test]
async fn pending_duplicate_below_the_confirmed_boundary_is_ignored() {
    let (store, _rx) = new_store(&test_config());
    seed(&store, TransactionStatus::Confirmed, &[0, 1, 2]);
    seed(&store, TransactionStatus::Submitted, &[1]);

    let mut mock = MockChainClient::new();
    mock.expect_transaction_count()
        .returning(|_| Ok(U256::one()));
    let manager = manager_with(mock, store);

    let lease = manager
        .next_nonce(sender())
        .await
        .expect("Failed to reserve nonce");
    assert_eq!(lease.nonce, U256::from(3u64));
}

#[tokio::test]
async fn pending_nonces_past_a_gap_are_ignored() {
    let (store, _rx) = new_store(&test_config());
    seed(&store, TransactionStatus::Submitted, &[0, 1, 3]);

    let mut mock = MockChainClient::new();
    mock.expect_transaction_count()
        .returning(|_| Ok(U256::zero()));
    let manager = manager_with(mock, store);

    let lease = manager
        .next_nonce(sender())
        .await
        .expect("Failed to reserve nonce");
    assert_eq!(lease.nonce, U256::from(2u64), "the gap at 2 is next");
}

#[tokio::test]
async fn approved_records_count_as_pending() {
    let (store, _rx) = new_store(&test_config());
    seed(&store, TransactionStatus::Approved, &[0]);

    let mut mock = MockChainClient::new();
    mock.expect_transaction_count()
        .returning(|_| Ok(U256::zero()));
    let manager = manager_with(mock, store);

    let lease = manager
        .next_nonce(sender())
        .await
        .expect("Failed to reserve nonce");
    assert_eq!(lease.nonce, U256::one());
}

#[tokio::test]
async fn a_second_request_blocks_until_the_lease_is_released() {
    let (store, _rx) = new_store(&test_config());
    let mut mock = MockChainClient::new();
    mock.expect_transaction_count()
        .returning(|_| Ok(U256::zero()));
    let manager = manager_with(mock, store);

    let lease = manager
        .next_nonce(sender())
        .await
        .expect("Failed to reserve nonce");

    let contender = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.next_nonce(sender()).await })
    };
    // the second reservation must park on the address lock
    tokio::task::yield_now().await;
    assert!(!contender.is_finished());

    drop(lease);
    let second = timeout(Duration::from_secs(1), contender)
        .await
        .expect("Second reservation did not unblock")
        .expect("Contender task panicked")
        .expect("Failed to reserve nonce");
    assert_eq!(second.nonce, U256::zero());
}

#[tokio::test]
async fn different_addresses_do_not_block_each_other() {
    let (store, _rx) = new_store(&test_config());
    let mut mock = MockChainClient::new();
    mock.expect_transaction_count()
        .returning(|_| Ok(U256::zero()));
    let manager = manager_with(mock, store);

    let _lease = manager
        .next_nonce(sender())
        .await
        .expect("Failed to reserve nonce");
    let other = timeout(
        Duration::from_secs(1),
        manager.next_nonce(Address::repeat_byte(0x02)),
    )
    .await
    .expect("Reservation for a different address must not block")
    .expect("Failed to reserve nonce");
    assert_eq!(other.nonce, U256::zero());
}

#[tokio::test]
async fn network_failure_surfaces_and_releases_the_lock() {
    let (store, _rx) = new_store(&test_config());
    let mut mock = MockChainClient::new();
    mock.expect_transaction_count()
        .times(1)
        .returning(|_| Err(TellerError::NetworkError("connection refused".to_string())));
    mock.expect_transaction_count()
        .returning(|_| Ok(U256::one()));
    let manager = manager_with(mock, store);

    let err = manager
        .next_nonce(sender())
        .await
        .expect_err("network failure must surface");
    assert!(matches!(err, TellerError::NetworkError(_)));

    // nothing is left held: the retry succeeds immediately
    let lease = timeout(Duration::from_secs(1), manager.next_nonce(sender()))
        .await
        .expect("Lock was not released after the failed call")
        .expect("Failed to reserve nonce");
    assert_eq!(lease.nonce, U256::one());
}

#[tokio::test]
async fn lock_all_serializes_against_every_allocation() {
    let (store, _rx) = new_store(&test_config());
    let mut mock = MockChainClient::new();
    mock.expect_transaction_count()
        .returning(|_| Ok(U256::zero()));
    let manager = manager_with(mock, store);

    let global = manager.lock_all().await;
    let contender = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.next_nonce(sender()).await })
    };
    tokio::task::yield_now().await;
    assert!(!contender.is_finished());

    drop(global);
    timeout(Duration::from_secs(1), contender)
        .await
        .expect("Allocation did not unblock after the global guard dropped")
        .expect("Contender task panicked")
        .expect("Failed to reserve nonce");
}
