use std::sync::Arc;

use futures::TryStreamExt;
use points_ledger::config::EngineConfig;
use points_ledger::core_types::{Points, UserId};
use points_ledger::ledger::EventType;
use points_ledger::store::MemoryStore;
use points_ledger::transfer::{
    Adjustment, ErrorKind, FailReason, TransferEngine, TransferError, TransferRequest,
    TransferStatus,
};

/// Engine over a fresh in-memory store with funded accounts
async fn setup(balances: &[(UserId, Points)]) -> (Arc<TransferEngine>, MemoryStore) {
    let store = MemoryStore::new();
    let engine = Arc::new(TransferEngine::new(
        Arc::new(store.clone()),
        EngineConfig::default(),
    ));
    for (user_id, balance) in balances {
        store.insert_user(*user_id);
        if *balance > 0 {
            engine
                .adjust(Adjustment::earn(*user_id, *balance).with_reference("seed"))
                .await
                .unwrap();
        }
    }
    (engine, store)
}

async fn ledger_sum(engine: &TransferEngine, user_id: UserId) -> Points {
    engine
        .history(user_id)
        .collect_remaining()
        .await
        .unwrap()
        .iter()
        .map(|e| e.change)
        .sum()
}

#[tokio::test]
async fn scenario_submit_replay_and_insufficient_funds() {
    const A: UserId = 1;
    const B: UserId = 2;
    let (engine, _store) = setup(&[(A, 500), (B, 0)]).await;

    let first = engine
        .submit(TransferRequest::new(A, B, 200, "key1"))
        .await
        .unwrap();
    assert_eq!(first.status, TransferStatus::Completed);
    assert_eq!(engine.get_balance(A).await.unwrap(), 300);
    assert_eq!(engine.get_balance(B).await.unwrap(), 200);

    let legs = engine.ledger().entries_for_transfer(first.id).await.unwrap();
    assert_eq!(legs.len(), 2);
    let a_leg = legs.iter().find(|e| e.user_id == A).unwrap();
    let b_leg = legs.iter().find(|e| e.user_id == B).unwrap();
    assert_eq!((a_leg.change, a_leg.balance_after), (-200, 300));
    assert_eq!((b_leg.change, b_leg.balance_after), (200, 200));

    // Same key: same row, no balance change
    let replay = engine
        .submit(TransferRequest::new(A, B, 200, "key1"))
        .await
        .unwrap();
    assert_eq!(replay, first);
    assert_eq!(engine.get_balance(A).await.unwrap(), 300);
    assert_eq!(engine.get_balance(B).await.unwrap(), 200);

    let failed = engine
        .submit(TransferRequest::new(A, B, 400, "key2"))
        .await
        .unwrap();
    assert_eq!(failed.status, TransferStatus::Failed);
    assert_eq!(failed.fail_reason, Some(FailReason::InsufficientFunds));
    assert!(failed.completed_at.is_none());
    assert!(
        engine
            .ledger()
            .entries_for_transfer(failed.id)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(engine.get_balance(A).await.unwrap(), 300);
    assert_eq!(engine.get_balance(B).await.unwrap(), 200);

    // A failed key stays failed; the caller needs a fresh key
    let again = engine
        .submit(TransferRequest::new(A, B, 100, "key2"))
        .await
        .unwrap();
    assert_eq!(again, failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_concurrent_duplicate_keys_create_one_row() {
    let (engine, store) = setup(&[(1, 1_000), (2, 0)]).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .submit(TransferRequest::new(1, 2, 10, "same-key"))
                .await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(store.transfer_count(), 1);
    assert!(results.iter().all(|t| *t == results[0]));
    assert_eq!(results[0].status, TransferStatus::Completed);
    assert_eq!(engine.get_balance(1).await.unwrap(), 990);
    assert_eq!(engine.get_balance(2).await.unwrap(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_crossing_transfers_conserve_points() {
    let users: [UserId; 3] = [1, 2, 3];
    let (engine, _store) = setup(&[(1, 300), (2, 300), (3, 300)]).await;

    let mut handles = Vec::new();
    for i in 0..60u64 {
        let engine = engine.clone();
        let from = users[(i % 3) as usize];
        let to = users[((i + 1) % 3) as usize];
        handles.push(tokio::spawn(async move {
            engine
                .submit(TransferRequest::new(from, to, 7, format!("cross-{}", i)))
                .await
        }));
    }
    for handle in handles {
        let transfer = handle.await.unwrap().unwrap();
        assert!(matches!(
            transfer.status,
            TransferStatus::Completed | TransferStatus::Failed
        ));
    }

    let mut total = 0;
    for user_id in users {
        let balance = engine.get_balance(user_id).await.unwrap();
        assert!(balance >= 0);
        assert_eq!(ledger_sum(&engine, user_id).await, balance);
        let report = engine.reconcile(user_id).await.unwrap();
        assert_eq!(report.balance, balance);
        total += balance;
    }
    assert_eq!(total, 900);
}

#[tokio::test]
async fn scenario_validation_creates_no_rows() {
    let (engine, store) = setup(&[(1, 100), (2, 0)]).await;

    for request in [
        TransferRequest::new(1, 2, 0, "zero"),
        TransferRequest::new(1, 2, -1, "negative"),
        TransferRequest::new(2, 2, 5, "self"),
        TransferRequest::new(1, 2, 5, "   "),
    ] {
        let err = engine.submit(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.http_status(), 400);
        assert!(!err.is_retryable());
    }

    let err = engine
        .submit(TransferRequest::new(1, 42, 5, "ghost"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(store.transfer_count(), 0);
}

#[tokio::test]
async fn scenario_reversal_of_completed_transfer() {
    const A: UserId = 10;
    const B: UserId = 20;
    let (engine, store) = setup(&[(A, 250), (B, 0)]).await;

    let original = engine
        .submit(TransferRequest::new(A, B, 100, "order-77"))
        .await
        .unwrap();
    let entries_before = store.entry_count();

    let reversed = engine.reverse(original.id, "customer refund").await.unwrap();
    assert_eq!(reversed.id, original.id);
    assert_eq!(reversed.status, TransferStatus::Reversed);
    assert_eq!(engine.get_balance(A).await.unwrap(), 250);
    assert_eq!(engine.get_balance(B).await.unwrap(), 0);
    assert_eq!(store.entry_count(), entries_before + 2);

    let history: Vec<_> = engine.history(B).into_stream().try_collect().await.unwrap();
    assert_eq!(
        history.iter().map(|e| e.event_type).collect::<Vec<_>>(),
        vec![EventType::TransferIn, EventType::ReversalOut]
    );
    assert_eq!(
        history[1].reference.as_deref(),
        Some(format!("reversal:{}", original.id).as_str())
    );

    // Reserved prefix cannot be used to forge a reversal
    let err = engine
        .submit(TransferRequest::new(A, B, 5, format!("reversal:{}", original.id)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = engine.cancel(original.id).await.unwrap_err();
    assert!(matches!(err, TransferError::AlreadyCommitted { .. }));
}

#[tokio::test]
async fn scenario_commit_failure_rolls_back_everything() {
    let (engine, store) = setup(&[(1, 100), (2, 0)]).await;
    let entries_before = store.entry_count();
    store.fail_next_commits(1);

    let err = engine
        .submit(TransferRequest::new(1, 2, 60, "unlucky"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    assert_eq!(err.http_status(), 503);
    assert!(err.is_retryable());
    assert!(!err.key_reusable());

    assert_eq!(engine.get_balance(1).await.unwrap(), 100);
    assert_eq!(engine.get_balance(2).await.unwrap(), 0);
    assert_eq!(store.entry_count(), entries_before);

    // The key is spent: a retry gets the same error, backed by the failed row
    let again = engine
        .submit(TransferRequest::new(1, 2, 60, "unlucky"))
        .await
        .unwrap_err();
    assert_eq!(again.kind(), err.kind());
    assert!(again.transfer_id().is_some());
    assert_eq!(again.transfer_id(), err.transfer_id());
    let row = engine.get_transfer_by_idempotency_key("unlucky").await.unwrap();
    assert_eq!(row.status, TransferStatus::Failed);
    assert_eq!(row.fail_reason, Some(FailReason::StoreUnavailable));
    assert_eq!(store.transfer_count(), 1);

    let fresh = engine
        .submit(TransferRequest::new(1, 2, 60, "unlucky-retry"))
        .await
        .unwrap();
    assert_eq!(fresh.status, TransferStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_cancel_races_settlement() {
    for round in 0..50 {
        let (engine, _store) = setup(&[(1, 100), (2, 0)]).await;

        let submitter = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .submit(TransferRequest::new(1, 2, 30, format!("race-{}", round)))
                    .await
            })
        };

        // First transfer in a fresh store; retry until the row exists
        let cancelled = loop {
            match engine.cancel(1).await {
                Err(e) if e.kind() == ErrorKind::NotFound => tokio::task::yield_now().await,
                other => break other,
            }
        };
        let submitted = submitter.await.unwrap().unwrap();
        let legs = engine.ledger().entries_for_transfer(1).await.unwrap();

        match cancelled {
            Ok(row) => {
                assert_eq!(row.status, TransferStatus::Cancelled);
                assert_eq!(submitted.status, TransferStatus::Cancelled);
                assert!(legs.is_empty());
                assert_eq!(engine.get_balance(1).await.unwrap(), 100);
                assert_eq!(engine.get_balance(2).await.unwrap(), 0);
            }
            Err(TransferError::AlreadyCommitted { transfer_id, status }) => {
                assert_eq!((transfer_id, status), (1, TransferStatus::Completed));
                assert_eq!(submitted.status, TransferStatus::Completed);
                assert_eq!(legs.len(), 2);
                assert_eq!(engine.get_balance(1).await.unwrap(), 70);
                assert_eq!(engine.get_balance(2).await.unwrap(), 30);
            }
            Err(other) => panic!("round {}: unexpected cancel result {:?}", round, other),
        }
        assert_eq!(engine.get_transfer(1).await.unwrap().status, submitted.status);
    }
}

#[tokio::test]
async fn scenario_history_is_bounded_and_restartable() {
    let (engine, _store) = setup(&[(1, 0)]).await;
    for i in 1..=5 {
        engine.adjust(Adjustment::earn(1, i)).await.unwrap();
    }

    let mut history = engine.history(1);
    let first = history.next().await.unwrap().unwrap();
    assert_eq!(first.change, 1);

    // Written mid-iteration: outside this history's snapshot
    engine.adjust(Adjustment::earn(1, 100)).await.unwrap();

    let rest = history.collect_remaining().await.unwrap();
    assert_eq!(rest.iter().map(|e| e.change).collect::<Vec<_>>(), vec![2, 3, 4, 5]);

    history.restart();
    assert_eq!(history.collect_remaining().await.unwrap().len(), 5);
    assert_eq!(ledger_sum(&engine, 1).await, 115);
    assert_eq!(engine.get_balance(1).await.unwrap(), 115);
}

#[tokio::test]
async fn scenario_unknown_lookups() {
    let (engine, _store) = setup(&[(1, 0)]).await;
    let err = engine.get_transfer(404).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = engine
        .get_transfer_by_idempotency_key("missing")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TRANSFER_NOT_FOUND");
    assert!(engine.history(999).next().await.unwrap().is_none());
}
