//! End-to-end snapshot-isolation scenarios against an in-process cluster.

mod common;

use common::*;

use kestrel_common::api::{EndAction, QueryRequest};
use kestrel_common::error::KestrelError;
use kestrel_common::types::{Key, Priority, RecordStatus, TxnState};

#[tokio::test]
async fn test_stale_write_rejected_below_committed_version() {
    let cluster = build_cluster(&["m", ""]).await;
    let k = key("a");
    cluster.put_committed(&k, "x", 10).await.unwrap();

    let (_, m) = txn(&k, 5, Priority::MEDIUM);
    let err = cluster.write(&k, row("a", "y"), m, &k, true).await.unwrap_err();
    assert!(matches!(err, KestrelError::AbortRequestTooOld(_)), "{err}");
}

#[tokio::test]
async fn test_read_before_write_barrier() {
    let cluster = build_cluster(&["m", ""]).await;
    let k = key("b");

    let (_, reader) = txn(&k, 20, Priority::MEDIUM);
    let err = cluster.read(&k, reader).await.unwrap_err();
    assert!(matches!(err, KestrelError::KeyNotFound));

    let (_, writer) = txn(&k, 15, Priority::MEDIUM);
    let err = cluster
        .write(&k, row("b", "late"), writer, &k, true)
        .await
        .unwrap_err();
    assert!(matches!(err, KestrelError::AbortRequestTooOld(_)), "{err}");
}

#[tokio::test]
async fn test_push_challenger_wins_on_priority() {
    let cluster = build_cluster(&["m", ""]).await;
    let k = key("c");

    // Low-priority incumbent leaves a write intent.
    let (t1, m1) = txn(&k, 100, Priority::LOW);
    cluster.write(&k, row("c", "v1"), m1, &k, true).await.unwrap();

    // High-priority challenger reads through it: the incumbent is
    // force-aborted and the read proceeds to "not found".
    let (_, m2) = txn(&k, 200, Priority::HIGH);
    let err = cluster.read(&k, m2).await.unwrap_err();
    assert!(matches!(err, KestrelError::KeyNotFound), "{err}");

    // The triggering intent was cleaned up.
    let (owner, _) = cluster.owner(&k);
    assert!(owner.inspect_versions(&k).is_empty());

    // The incumbent's record is force-aborted at its TRH; its eventual
    // commit is rewritten to abort and rejected.
    let (trh, _) = cluster.owner(&t1.trh_key);
    assert_eq!(trh.inspect_txn(&t1).unwrap().0, TxnState::ForceAborted);
    let err = cluster
        .end(&t1, EndAction::Commit, vec![k.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, KestrelError::OperationNotAllowed(_)), "{err}");
    assert_eq!(trh.txn_stats().aborted, 1);
}

#[tokio::test]
async fn test_push_incumbent_wins_on_priority() {
    let cluster = build_cluster(&["m", ""]).await;
    let k = key("c2");

    let (t1, m1) = txn(&k, 100, Priority::HIGH);
    cluster.write(&k, row("c2", "v1"), m1, &k, true).await.unwrap();

    // Low-priority challenger loses and must abort.
    let (_, m2) = txn(&k, 200, Priority::LOW);
    let err = cluster.read(&k, m2).await.unwrap_err();
    assert!(matches!(err, KestrelError::AbortConflict(_)), "{err}");

    // The incumbent's intent is untouched and its commit succeeds.
    let (owner, _) = cluster.owner(&k);
    let versions = owner.inspect_versions(&k);
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].status, RecordStatus::WriteIntent);

    cluster.end(&t1, EndAction::Commit, vec![k.clone()]).await.unwrap();
    let (_, m3) = txn(&k, 300, Priority::MEDIUM);
    let read = cluster.read(&k, m3).await.unwrap();
    assert_eq!(val_of(&read), Some("v1"));
}

#[tokio::test]
async fn test_range_scan_records_phantom_barrier() {
    let cluster = build_cluster(&["zz", ""]).await;

    // Empty scan over ["p", "t") at ts 50.
    let (_, scanner) = txn(&key("p"), 50, Priority::MEDIUM);
    let resp = cluster
        .query(QueryRequest {
            collection: COLLECTION.into(),
            pvid: Default::default(),
            start: key("p"),
            end: key("t"),
            mtr: scanner,
            reverse: false,
            exclusive_start: false,
            filter: vec![],
            projection: vec![],
            limit: None,
        })
        .await
        .unwrap();
    assert!(resp.rows.is_empty());
    assert!(resp.next_to_scan.is_none());

    // A later write into the scanned range below the scan timestamp is a
    // phantom and must be rejected.
    let k = key("r");
    let (_, m) = txn(&k, 40, Priority::MEDIUM);
    let err = cluster.write(&k, row("r", "v"), m, &k, true).await.unwrap_err();
    assert!(matches!(err, KestrelError::AbortRequestTooOld(_)), "{err}");
}

#[tokio::test]
async fn test_finalize_after_commit_across_partitions() {
    let cluster = build_cluster(&["m", ""]).await;
    let trh_key = key("a-trh");
    let data_key = key("z-data");

    // Sanity: the two keys live on different partitions.
    assert_ne!(
        cluster.owner(&trh_key).0.descriptor().endpoint,
        cluster.owner(&data_key).0.descriptor().endpoint
    );

    let (t1, m1) = txn(&trh_key, 100, Priority::MEDIUM);
    cluster
        .write(&trh_key, row("a-trh", "anchor"), m1, &trh_key, true)
        .await
        .unwrap();
    cluster
        .write(&data_key, row("z-data", "payload"), m1, &trh_key, false)
        .await
        .unwrap();

    cluster
        .end(
            &t1,
            EndAction::Commit,
            vec![trh_key.clone(), data_key.clone()],
        )
        .await
        .unwrap();

    // The remote intent was finalized to committed.
    let (holder, _) = cluster.owner(&data_key);
    let versions = holder.inspect_versions(&data_key);
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].status, RecordStatus::Committed);

    let (_, m2) = txn(&data_key, 150, Priority::MEDIUM);
    let read = cluster.read(&data_key, m2).await.unwrap();
    assert_eq!(val_of(&read), Some("payload"));

    // All intents finalized: the record is deleted at the TRH.
    let (trh, _) = cluster.owner(&trh_key);
    assert!(trh.inspect_txn(&t1).is_none());
}

#[tokio::test]
async fn test_write_commit_read_round_trip() {
    let cluster = build_cluster(&[""]).await;
    let k = key("rt");
    cluster.put_committed(&k, "value", 100).await.unwrap();

    let (_, m) = txn(&k, 200, Priority::MEDIUM);
    let read = cluster.read(&k, m).await.unwrap();
    assert_eq!(val_of(&read), Some("value"));

    // A reader below the commit timestamp does not see it.
    let (_, early) = txn(&k, 50, Priority::MEDIUM);
    let err = cluster.read(&k, early).await.unwrap_err();
    assert!(matches!(err, KestrelError::KeyNotFound));
}

#[tokio::test]
async fn test_txn_end_is_idempotent() {
    let cluster = build_cluster(&[""]).await;
    let k = key("idem");
    let (t1, m1) = txn(&k, 100, Priority::MEDIUM);
    cluster.write(&k, row("idem", "v"), m1, &k, true).await.unwrap();

    cluster.end(&t1, EndAction::Commit, vec![k.clone()]).await.unwrap();
    // The record was finalized and deleted; a late commit can no longer be
    // validated against it and is refused rather than blindly acked.
    cluster.end(&t1, EndAction::Commit, vec![k.clone()]).await.unwrap_err();

    // Abort retries are safe no-ops at any point, even for a transaction
    // that never reached this partition.
    let (t2, _) = txn(&key("ghost"), 300, Priority::MEDIUM);
    cluster.end(&t2, EndAction::Abort, vec![]).await.unwrap();
    cluster.end(&t2, EndAction::Abort, vec![]).await.unwrap();
}

#[tokio::test]
async fn test_abort_removes_intent() {
    let cluster = build_cluster(&[""]).await;
    let k = key("ab");
    let (t1, m1) = txn(&k, 100, Priority::MEDIUM);
    cluster.write(&k, row("ab", "v"), m1, &k, true).await.unwrap();
    cluster.end(&t1, EndAction::Abort, vec![k.clone()]).await.unwrap();

    let (owner, _) = cluster.owner(&k);
    assert!(owner.inspect_versions(&k).is_empty());
    let (_, m2) = txn(&k, 200, Priority::MEDIUM);
    assert!(matches!(
        cluster.read(&k, m2).await.unwrap_err(),
        KestrelError::KeyNotFound
    ));
}

#[tokio::test]
async fn test_read_own_write_intent() {
    let cluster = build_cluster(&[""]).await;
    let k = key("own");
    let (_, m1) = txn(&k, 100, Priority::MEDIUM);
    cluster.write(&k, row("own", "mine"), m1, &k, true).await.unwrap();

    // The writer reads through its own intent without a push.
    let read = cluster.read(&k, m1).await.unwrap();
    assert_eq!(val_of(&read), Some("mine"));
}

#[tokio::test]
async fn test_heartbeat_reports_terminal_state() {
    let cluster = build_cluster(&[""]).await;
    let k = key("hb");
    let (t1, m1) = txn(&k, 100, Priority::MEDIUM);
    cluster.write(&k, row("hb", "v"), m1, &k, true).await.unwrap();

    assert_eq!(cluster.heartbeat(&t1).await.unwrap(), None);

    cluster.end(&t1, EndAction::Commit, vec![k.clone()]).await.unwrap();
    // Record finalized and deleted; the client is told to stop beating.
    assert_eq!(
        cluster.heartbeat(&t1).await.unwrap(),
        Some(TxnState::Deleted)
    );
}

#[tokio::test]
async fn test_commit_with_expired_heartbeat_is_rejected() {
    let cluster = build_cluster(&[""]).await;
    let k = key("exp");
    let (t1, m1) = txn(&k, 100, Priority::MEDIUM);
    cluster.write(&k, row("exp", "v"), m1, &k, true).await.unwrap();

    // The collection's heartbeat deadline is 200ms; outlive it.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let err = cluster
        .end(&t1, EndAction::Commit, vec![k.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, KestrelError::OperationNotAllowed(_)), "{err}");

    // The intent is gone after the rewritten abort.
    let (owner, _) = cluster.owner(&k);
    assert!(owner.inspect_versions(&k).is_empty());
}

#[tokio::test]
async fn test_heartbeat_sweeper_force_aborts_stale_txn() {
    let cluster = build_cluster(&[""]).await;
    for module in &cluster.modules {
        module.start();
    }

    let k = key("sweep");
    let (t1, m1) = txn(&k, 100, Priority::MEDIUM);
    cluster.write(&k, row("sweep", "v"), m1, &k, true).await.unwrap();

    // No heartbeats: the sweeper must force-abort within a few intervals.
    tokio::time::sleep(std::time::Duration::from_millis(600)).await;
    let (trh, _) = cluster.owner(&t1.trh_key);
    assert_eq!(trh.inspect_txn(&t1).unwrap().0, TxnState::ForceAborted);

    for module in &cluster.modules {
        module.graceful_stop().await;
    }
}

#[tokio::test]
async fn test_lifecycle_is_persisted_in_order() {
    let cluster = build_cluster(&[""]).await;
    let k = key("durable");
    cluster.put_committed(&k, "v", 100).await.unwrap();

    use kestrel_storage::PlogEntry;
    let entries = cluster.plogs[0].entries();
    let position = |pred: &dyn Fn(&PlogEntry) -> bool| entries.iter().position(pred);

    let created = position(&|e| {
        matches!(e, PlogEntry::TxnStateChange { state: TxnState::InProgress, .. })
    })
    .expect("TR creation logged");
    let intent = position(&|e| matches!(e, PlogEntry::WriteIntent { .. }))
        .expect("write intent logged");
    let committed = position(&|e| {
        matches!(e, PlogEntry::TxnStateChange { state: TxnState::Committed, .. })
    })
    .expect("commit logged");
    let finalized = position(&|e| matches!(e, PlogEntry::Finalize { .. }))
        .expect("finalize logged");
    let deleted = position(&|e| matches!(e, PlogEntry::TxnRecordDelete { .. }))
        .expect("durable TR delete logged");

    assert!(created < intent);
    assert!(intent < committed);
    assert!(committed < finalized);
    assert!(finalized < deleted);
}

#[tokio::test]
async fn test_stale_pvid_gets_refresh_collection() {
    let cluster = build_cluster(&[""]).await;
    let k = key("pv");
    let (module, mut pvid) = cluster.owner(&k);
    pvid.range_version += 1;

    let err = module
        .handle_read(
            kestrel_common::api::ReadRequest {
                collection: COLLECTION.into(),
                pvid,
                key: k.clone(),
                mtr: txn(&k, 10, Priority::MEDIUM).1,
            },
            deadline(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KestrelError::RefreshCollection(_)), "{err}");
}

#[tokio::test]
async fn test_retention_window_rejects_old_requests() {
    let cluster = build_cluster(&[""]).await;
    let k = key("ret");
    let (module, _) = cluster.owner(&k);
    module.set_retention_timestamp(kestrel_common::types::Timestamp::new(1000, 0, 1));

    let (_, m) = txn(&k, 500, Priority::MEDIUM);
    let err = cluster.read(&k, m).await.unwrap_err();
    assert!(matches!(err, KestrelError::AbortRequestTooOld(_)), "{err}");
}

#[tokio::test]
async fn test_push_is_idempotent_at_the_trh() {
    let cluster = build_cluster(&[""]).await;
    let k = key("pp");
    let (t1, m1) = txn(&k, 100, Priority::LOW);
    cluster.write(&k, row("pp", "v"), m1, &k, true).await.unwrap();

    let (module, pvid) = cluster.owner(&k);
    let req = kestrel_common::api::TxnPushRequest {
        collection: COLLECTION.into(),
        pvid,
        key: k.clone(),
        incumbent_txn_id: t1.clone(),
        challenger_mtr: txn(&Key::new(SCHEMA, "q", ""), 200, Priority::HIGH).1,
    };
    let first = module.handle_txn_push(req.clone(), deadline()).await.unwrap();
    let second = module.handle_txn_push(req, deadline()).await.unwrap();
    assert!(first.challenger_proceeds);
    assert!(second.challenger_proceeds);
    assert_eq!(first.incumbent_state, TxnState::ForceAborted);
    assert_eq!(second.incumbent_state, TxnState::ForceAborted);
}
