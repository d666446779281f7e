use std::sync::Arc;

use ethers_core::types::{Address, Bytes, H256, U256, U64};

use super::TransactionController;
use crate::chain::{
    ChainClient, MockChainClient, MockTransactionSigner, SignerError, TransactionSigner,
};
use crate::config::TellerConfig;
use crate::error::TellerError;
use crate::metrics::TellerMetrics;
use crate::tests::test_utils::warning_count;
use crate::transaction::{
    TransactionKind, TransactionRecord, TransactionRequest, TransactionStatus,
};
use crate::TellerEvent;

fn sender() -> Address {
    Address::repeat_byte(0x01)
}

fn recipient() -> Address {
    Address::repeat_byte(0x02)
}

fn controller_with(
    chain: MockChainClient,
    signer: MockTransactionSigner,
) -> TransactionController {
    let chain: Arc<dyn ChainClient> = Arc::new(chain);
    let signer: Arc<dyn TransactionSigner> = Arc::new(signer);
    TransactionController::new(
        TellerConfig::default(),
        chain,
        signer,
        TellerMetrics::dummy_instance(),
    )
}

fn happy_chain(hash: H256) -> MockChainClient {
    let mut mock = MockChainClient::new();
    mock.expect_transaction_count()
        .returning(|_| Ok(U256::zero()));
    mock.expect_gas_price().returning(|| Ok(U256::from(5u64)));
    mock.expect_estimate_gas()
        .returning(|_| Ok(U256::from(21_000u64)));
    mock.expect_send_raw_transaction()
        .returning(move |_| Ok(hash));
    mock
}

fn happy_signer() -> MockTransactionSigner {
    let mut mock = MockTransactionSigner::new();
    mock.expect_sign_transaction()
        .returning(|_, _| Ok(Bytes::from(vec![0xf8, 0x6c])));
    mock
}

fn send_request() -> TransactionRequest {
    TransactionRequest {
        from: sender(),
        to: Some(recipient()),
        value: Some(U256::from(1_000u64)),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_persists_an_unapproved_record_with_defaults() {
    let controller = controller_with(MockChainClient::new(), MockTransactionSigner::new());

    let record = controller
        .create(TransactionRequest {
            from: sender(),
            to: Some(recipient()),
            ..Default::default()
        })
        .expect("Failed to create transaction");

    assert_eq!(record.status, TransactionStatus::Unapproved);
    assert_eq!(record.tx_params.value, U256::zero(), "value defaults to zero");
    assert_eq!(record.kind, TransactionKind::SimpleSend);
    assert_eq!(record.network_id, 1);
    assert_eq!(controller.unapproved_count(), 1);
}

#[tokio::test]
async fn create_rejects_invalid_requests() {
    let controller = controller_with(MockChainClient::new(), MockTransactionSigner::new());
    let result = controller.create(TransactionRequest {
        from: Address::zero(),
        to: Some(recipient()),
        ..Default::default()
    });
    assert!(matches!(result, Err(TellerError::InvalidTxParams(_))));
    assert_eq!(controller.unapproved_count(), 0);
}

#[tokio::test]
async fn approve_walks_the_record_to_submitted() {
    let hash = H256::repeat_byte(0xaa);
    let controller = controller_with(happy_chain(hash), happy_signer());
    let mut rx = controller.subscribe();

    let record = controller
        .create(send_request())
        .expect("Failed to create transaction");
    let submitted_hash = controller
        .approve(&record.id)
        .await
        .expect("Failed to approve transaction");
    assert_eq!(submitted_hash, hash);

    let stored = controller.get(&record.id).expect("Record missing");
    assert_eq!(stored.status, TransactionStatus::Submitted);
    assert_eq!(stored.nonce(), Some(U256::zero()));
    assert_eq!(stored.tx_params.gas_price, Some(U256::from(5u64)));
    assert_eq!(stored.tx_params.gas, Some(U256::from(21_000u64)));
    assert_eq!(stored.hash, Some(hash));
    assert!(stored.raw_tx.is_some());
    assert!(stored.nonce_details.is_some());

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let TellerEvent::StatusChanged { status, .. } = event {
            seen.push(status);
        }
    }
    assert_eq!(
        seen,
        vec![
            TransactionStatus::Approved,
            TransactionStatus::Signed,
            TransactionStatus::Submitted,
        ]
    );
}

#[tokio::test]
async fn sequential_sends_from_one_address_get_increasing_nonces() {
    let hash = H256::repeat_byte(0xaa);
    let controller = controller_with(happy_chain(hash), happy_signer());

    let first = controller
        .create(send_request())
        .expect("Failed to create transaction");
    controller
        .approve(&first.id)
        .await
        .expect("Failed to approve transaction");

    let second = controller
        .create(send_request())
        .expect("Failed to create transaction");
    controller
        .approve(&second.id)
        .await
        .expect("Failed to approve transaction");

    assert_eq!(
        controller.get(&first.id).expect("Record missing").nonce(),
        Some(U256::zero())
    );
    assert_eq!(
        controller.get(&second.id).expect("Record missing").nonce(),
        Some(U256::one()),
        "the submitted first send occupies nonce 0"
    );
}

#[tokio::test]
async fn signer_denial_rejects_the_record_and_releases_the_lock() {
    let hash = H256::repeat_byte(0xaa);
    let mut signer = MockTransactionSigner::new();
    signer
        .expect_sign_transaction()
        .times(1)
        .returning(|_, _| Err(SignerError::Denied));
    signer
        .expect_sign_transaction()
        .returning(|_, _| Ok(Bytes::from(vec![0xf8, 0x6c])));
    let controller = controller_with(happy_chain(hash), signer);

    let denied = controller
        .create(send_request())
        .expect("Failed to create transaction");
    let err = controller
        .approve(&denied.id)
        .await
        .expect_err("denial must propagate");
    assert!(matches!(err, TellerError::SignerDenied));
    assert_eq!(
        controller.get(&denied.id).expect("Record missing").status,
        TransactionStatus::Rejected
    );

    // the nonce lock was released on the failure path
    let retry = controller
        .create(send_request())
        .expect("Failed to create transaction");
    controller
        .approve(&retry.id)
        .await
        .expect("Approval after a denial must not deadlock");
}

#[tokio::test]
async fn publish_failure_fails_the_record_and_propagates() {
    let mut chain = MockChainClient::new();
    chain
        .expect_transaction_count()
        .returning(|_| Ok(U256::zero()));
    chain.expect_gas_price().returning(|| Ok(U256::from(5u64)));
    chain
        .expect_estimate_gas()
        .returning(|_| Ok(U256::from(21_000u64)));
    chain
        .expect_send_raw_transaction()
        .returning(|_| Err(TellerError::NetworkError("no peers".to_string())));
    let controller = controller_with(chain, happy_signer());

    let record = controller
        .create(send_request())
        .expect("Failed to create transaction");
    let err = controller
        .approve(&record.id)
        .await
        .expect_err("publish failure must propagate");
    assert!(matches!(err, TellerError::NetworkError(_)));

    let stored = controller.get(&record.id).expect("Record missing");
    assert_eq!(stored.status, TransactionStatus::Failed);
    assert!(stored.err.is_some());
    assert_eq!(stored.hash, None);
}

#[tokio::test]
async fn reject_finalizes_an_unapproved_record() {
    let controller = controller_with(MockChainClient::new(), MockTransactionSigner::new());
    let record = controller
        .create(send_request())
        .expect("Failed to create transaction");

    controller.reject(&record.id).expect("Failed to reject");
    assert_eq!(
        controller.get(&record.id).expect("Record missing").status,
        TransactionStatus::Rejected
    );
    assert_eq!(controller.unapproved_count(), 0);
}

#[tokio::test]
async fn reject_refuses_submitted_records() {
    let hash = H256::repeat_byte(0xaa);
    let controller = controller_with(happy_chain(hash), happy_signer());
    let record = controller
        .create(send_request())
        .expect("Failed to create transaction");
    controller
        .approve(&record.id)
        .await
        .expect("Failed to approve transaction");

    assert!(matches!(
        controller.reject(&record.id),
        Err(TellerError::InvalidStatusTransition { .. })
    ));
}

#[tokio::test]
async fn cancel_publishes_a_replacement_at_the_same_nonce() {
    let hash = H256::repeat_byte(0xaa);
    let mut chain = MockChainClient::new();
    // exactly one allocation: the cancel keeps the original's nonce
    chain
        .expect_transaction_count()
        .times(1)
        .returning(|_| Ok(U256::zero()));
    chain
        .expect_send_raw_transaction()
        .returning(move |_| Ok(hash));
    let controller = controller_with(chain, happy_signer());

    let original = controller
        .create(TransactionRequest {
            gas: Some(U256::from(21_000u64)),
            gas_price: Some(U256::from(100u64)),
            ..send_request()
        })
        .expect("Failed to create transaction");
    controller
        .approve(&original.id)
        .await
        .expect("Failed to approve transaction");

    let cancel = controller
        .cancel(&original.id, None)
        .await
        .expect("Failed to cancel transaction");

    assert_eq!(
        cancel.kind,
        TransactionKind::Cancel {
            original: original.id.clone()
        }
    );
    assert_eq!(cancel.status, TransactionStatus::Submitted);
    assert_eq!(cancel.nonce(), Some(U256::zero()), "same nonce as the original");
    assert_eq!(cancel.tx_params.to, Some(sender()), "self-send");
    assert_eq!(cancel.tx_params.value, U256::zero());
    assert_eq!(
        cancel.tx_params.gas_price,
        Some(U256::from(110u64)),
        "10% fee bump"
    );
    assert_eq!(cancel.last_gas_price, Some(U256::from(100u64)));
    // the original is left alone until the replacement confirms
    assert_eq!(
        controller.get(&original.id).expect("Record missing").status,
        TransactionStatus::Submitted
    );
}

#[tokio::test]
async fn speed_up_reprices_the_original_params() {
    let hash = H256::repeat_byte(0xaa);
    let mut chain = MockChainClient::new();
    chain
        .expect_transaction_count()
        .times(1)
        .returning(|_| Ok(U256::zero()));
    chain
        .expect_send_raw_transaction()
        .returning(move |_| Ok(hash));
    let controller = controller_with(chain, happy_signer());

    let original = controller
        .create(TransactionRequest {
            gas: Some(U256::from(21_000u64)),
            gas_price: Some(U256::from(100u64)),
            ..send_request()
        })
        .expect("Failed to create transaction");
    controller
        .approve(&original.id)
        .await
        .expect("Failed to approve transaction");

    let speedup = controller
        .speed_up(&original.id, Some(U256::from(250u64)))
        .await
        .expect("Failed to speed up transaction");

    assert_eq!(
        speedup.kind,
        TransactionKind::Retry {
            original: original.id.clone()
        }
    );
    assert_eq!(speedup.nonce(), Some(U256::zero()));
    assert_eq!(speedup.tx_params.to, Some(recipient()), "original recipient kept");
    assert_eq!(speedup.tx_params.value, U256::from(1_000u64));
    assert_eq!(
        speedup.tx_params.gas_price,
        Some(U256::from(250u64)),
        "custom gas price wins"
    );
}

#[tokio::test]
async fn cancel_requires_an_allocated_nonce() {
    let controller = controller_with(MockChainClient::new(), MockTransactionSigner::new());
    let record = controller
        .create(send_request())
        .expect("Failed to create transaction");
    assert!(matches!(
        controller.cancel(&record.id, None).await,
        Err(TellerError::MissingNonce(_))
    ));
}

#[tokio::test]
async fn resume_fails_records_stuck_in_approved() {
    let controller = controller_with(MockChainClient::new(), MockTransactionSigner::new());
    let stuck = TransactionRecord::dummy(sender(), TransactionStatus::Approved, None);
    let id = stuck.id.clone();
    controller.store.add(stuck).expect("Failed to seed record");

    controller.resume();

    let stored = controller.get(&id).expect("Record missing");
    assert_eq!(stored.status, TransactionStatus::Failed);
    assert!(stored
        .err
        .as_deref()
        .is_some_and(|message| message.contains("stuck during signing")));
}

#[tokio::test]
async fn on_new_block_reapproves_unsigned_pending_records() {
    let hash = H256::repeat_byte(0xaa);
    let controller = controller_with(happy_chain(hash), happy_signer());
    let stuck = TransactionRecord::dummy(sender(), TransactionStatus::Approved, None);
    let id = stuck.id.clone();
    controller.store.add(stuck).expect("Failed to seed record");

    controller.on_new_block(U64::from(10u64)).await;

    let stored = controller.get(&id).expect("Record missing");
    assert_eq!(stored.status, TransactionStatus::Submitted);
    assert_eq!(stored.hash, Some(hash));
}

#[tokio::test]
async fn on_new_block_confirms_submitted_records() {
    let hash = H256::repeat_byte(0xaa);
    let mut chain = happy_chain(hash);
    chain.expect_transaction_receipt().returning(|queried| {
        Ok(Some(ethers_core::types::TransactionReceipt {
            transaction_hash: queried,
            block_number: Some(U64::from(100u64)),
            status: Some(U64::from(1u64)),
            ..Default::default()
        }))
    });
    chain.expect_balance().returning(|_| Ok(U256::from(u64::MAX)));
    let controller = controller_with(chain, happy_signer());
    let mut rx = controller.subscribe();

    let record = controller
        .create(send_request())
        .expect("Failed to create transaction");
    controller
        .approve(&record.id)
        .await
        .expect("Failed to approve transaction");

    controller.on_new_block(U64::from(10u64)).await;

    assert_eq!(
        controller.get(&record.id).expect("Record missing").status,
        TransactionStatus::Confirmed
    );
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(warning_count(&events), 0);
    assert_eq!(controller.pending_count(None), 0);
    assert_eq!(controller.confirmed_transactions(sender()).len(), 1);
}
