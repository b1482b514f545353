//! Tape staging flow: one recall per batch, token idempotence, per-file
//! recall errors, and the staging → staged → transferred progression.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::TestHarness;
use fod_core::store::{OpType, TaskStatus};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_recall_issued_once_then_polled_through() {
    let mut harness = TestHarness::new();
    harness.seed_transfer_batch(5, "T0_TAPE", "T2_DST", true);
    harness.seed_transfer_task(1, 5, "srm://tape/store/a", "srm://dst/store/a");
    harness.seed_transfer_task(2, 5, "srm://tape/store/b", "srm://dst/store/b");

    // First pass: one bulk recall, token stored, both tasks staging.
    harness.scheduler.pass().await.unwrap();
    assert_eq!(harness.gateway.bring_online_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        harness.store().stage_token(5).unwrap(),
        Some(Some("stage-token-1".to_string()))
    );
    assert_eq!(harness.row(OpType::Transfer, 1).status, TaskStatus::Staging);
    assert_eq!(harness.row(OpType::Transfer, 2).status, TaskStatus::Staging);

    // Only the first file comes online.
    harness
        .gateway
        .online
        .lock()
        .unwrap()
        .insert("srm://tape/store/a".to_string());

    harness.scheduler.pass().await.unwrap();
    harness
        .wait_for_status(OpType::Transfer, 1, TaskStatus::Staged, WAIT)
        .await;
    assert_eq!(harness.row(OpType::Transfer, 2).status, TaskStatus::Staging);

    // The recall was never re-issued.
    assert_eq!(harness.gateway.bring_online_calls.load(Ordering::SeqCst), 1);

    // Later passes carry the staged file through the transfer pool while
    // the other keeps waiting.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        harness.scheduler.pass().await.unwrap();
        if harness.row(OpType::Transfer, 1).status == TaskStatus::Done {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "staged task never transferred"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(harness.row(OpType::Transfer, 2).status, TaskStatus::Staging);
    assert_eq!(harness.gateway.bring_online_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_per_file_recall_errors_fail_individually() {
    let mut harness = TestHarness::new();
    harness.seed_transfer_batch(5, "T0_TAPE", "T2_DST", true);
    harness.seed_transfer_task(1, 5, "srm://tape/store/a", "srm://dst/store/a");
    harness.seed_transfer_task(2, 5, "srm://tape/store/b", "srm://dst/store/b");
    harness.gateway.stage_errors.lock().unwrap().insert(
        "srm://tape/store/b".to_string(),
        "no such file on tape".to_string(),
    );

    harness.scheduler.pass().await.unwrap();

    assert_eq!(harness.row(OpType::Transfer, 1).status, TaskStatus::Staging);
    let failed = harness.row(OpType::Transfer, 2);
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.message.as_deref(), Some("no such file on tape"));

    // The token is still written; the batch is done being issued.
    assert!(harness.store().stage_token(5).unwrap().unwrap().is_some());
    harness.scheduler.pass().await.unwrap();
    assert_eq!(harness.gateway.bring_online_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disk_batches_never_stage() {
    let mut harness = TestHarness::new();
    harness.seed_transfer_batch(1, "T1_SRC", "T2_DST", false);
    harness.seed_transfer_task(1, 1, "srm://src/store/a", "srm://dst/store/a");

    harness.scheduler.pass().await.unwrap();
    harness
        .wait_for_status(OpType::Transfer, 1, TaskStatus::Done, WAIT)
        .await;
    assert_eq!(harness.gateway.bring_online_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.store().stage_token(1).unwrap(), Some(None));
}
