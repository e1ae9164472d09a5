mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{observed, succeeded_after, video_pricing, video_task, FixedScale, MemoryStore};
use serde_json::json;
use task_settlement::adaptor::KlingAdaptor;
use task_settlement::ledger::LedgerEntryKind;
use task_settlement::{SettlementError, SettlementOutcome, TaskPlatform, TaskSettlementReconciler, TaskStatus};

const NOW: i64 = 1_700_000_600;

fn store_with(task_id: &str, quota: i64) -> MemoryStore {
    MemoryStore::new()
        .with_user(7, "default", 10_000)
        .with_task(video_task(task_id, 1, 7, quota))
}

// key: settlement-tests -> shortfall charged and counted as usage
#[tokio::test]
async fn success_with_longer_video_tops_up_shortfall() {
    let store = store_with("t-up", 1000);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let mut task = store.stored_task("t-up");

    let outcome = reconciler
        .reconcile(&mut task, &succeeded_after(5.0), None, NOW)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        SettlementOutcome::ToppedUp {
            delta: 200,
            actual: 1200
        }
    );
    assert_eq!(task.quota, 1200);
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.finish_time, NOW);
    assert_eq!(task.fail_reason, "https://cdn.example/out.mp4");
    assert_eq!(store.stored_task("t-up"), task);

    let user = store.user(7);
    assert_eq!(user.quota, 9_800);
    assert_eq!(user.used_quota, 200);
    assert_eq!(store.channel_used(1), 200);

    let logs = store.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].kind, LedgerEntryKind::TopUp);
    assert_eq!(logs[0].quota, 200);
    assert!(logs[0].content.contains("pre-deducted 1000, actual 1200"));
}

#[tokio::test]
async fn success_with_shorter_video_credits_difference() {
    let store = store_with("t-credit", 1000);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let mut task = store.stored_task("t-credit");

    let outcome = reconciler
        .reconcile(&mut task, &succeeded_after(4.0), None, NOW)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        SettlementOutcome::Credited {
            amount: 40,
            actual: 960
        }
    );
    assert_eq!(store.stored_task("t-credit").quota, 960);
    let user = store.user(7);
    assert_eq!(user.quota, 10_040);
    assert_eq!(user.used_quota, 0);
    assert_eq!(store.channel_used(1), 0);
    assert_eq!(store.logs()[0].kind, LedgerEntryKind::Credit);
}

#[tokio::test]
async fn exact_settlement_leaves_balance_alone() {
    let store = store_with("t-exact", 1200);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let mut task = store.stored_task("t-exact");

    let outcome = reconciler
        .reconcile(&mut task, &succeeded_after(5.0), None, NOW)
        .await
        .unwrap();

    assert_eq!(outcome, SettlementOutcome::Exact { actual: 1200 });
    assert_eq!(store.stored_task("t-exact").status, TaskStatus::Success);
    assert_eq!(store.user(7).quota, 10_000);
    assert!(store.logs().is_empty());
}

// key: settlement-tests -> refund exactly once
#[tokio::test]
async fn failure_refunds_pre_deduction_once() {
    let store = store_with("t-fail", 1000);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let mut task = store.stored_task("t-fail");

    let mut failure = observed("failed");
    failure.reason = Some("content moderation".into());
    let outcome = reconciler
        .reconcile(&mut task, &failure, None, NOW)
        .await
        .unwrap();
    assert_eq!(outcome, SettlementOutcome::Refunded { quota: 1000 });
    assert_eq!(task.status, TaskStatus::Failure);
    assert_eq!(task.fail_reason, "content moderation");
    assert_eq!(task.progress, "100%");
    assert_eq!(store.user(7).quota, 11_000);

    let again = reconciler
        .reconcile(&mut task, &failure, None, NOW + 30)
        .await
        .unwrap();
    assert_eq!(again, SettlementOutcome::RefundSkipped);
    assert_eq!(store.user(7).quota, 11_000);

    let logs = store.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].kind, LedgerEntryKind::Refund);
    assert_eq!(
        logs[0].content,
        "async task t-fail failed: content moderation, refunded 1000 quota"
    );
}

#[tokio::test]
async fn failure_after_success_refunds_settled_quota() {
    let mut settled = video_task("t-reversed", 1, 7, 1000);
    settled.status = TaskStatus::Success;
    settled.finish_time = NOW - 60;
    let store = MemoryStore::new()
        .with_user(7, "default", 10_000)
        .with_task(settled);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let mut task = store.stored_task("t-reversed");

    let outcome = reconciler
        .reconcile(&mut task, &observed("FAILURE"), None, NOW)
        .await
        .unwrap();

    assert_eq!(outcome, SettlementOutcome::Refunded { quota: 1000 });
    assert_eq!(store.stored_task("t-reversed").status, TaskStatus::Failure);
    assert_eq!(store.stored_task("t-reversed").finish_time, NOW - 60);
    assert_eq!(store.user(7).quota, 11_000);
    assert_eq!(store.logs().len(), 1);
}

#[tokio::test]
async fn failure_without_pre_deduction_refunds_nothing() {
    let store = store_with("t-free", 0);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let mut task = store.stored_task("t-free");

    let outcome = reconciler
        .reconcile(&mut task, &observed("FAILURE"), None, NOW)
        .await
        .unwrap();
    assert_eq!(outcome, SettlementOutcome::RefundSkipped);
    assert_eq!(store.stored_task("t-free").status, TaskStatus::Failure);
    assert!(store.logs().is_empty());
}

#[tokio::test]
async fn success_observed_twice_settles_once() {
    let store = store_with("t-twice", 1000);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let mut task = store.stored_task("t-twice");

    reconciler
        .reconcile(&mut task, &succeeded_after(5.0), None, NOW)
        .await
        .unwrap();
    let again = reconciler
        .reconcile(&mut task, &succeeded_after(5.0), None, NOW + 15)
        .await
        .unwrap();

    assert_eq!(again, SettlementOutcome::AlreadySettled);
    assert_eq!(store.user(7).quota, 9_800);
    assert_eq!(store.logs().len(), 1);
    assert_eq!(task.finish_time, NOW);
}

#[tokio::test]
async fn success_without_usage_keeps_pre_deduction() {
    let store = store_with("t-unmetered", 1000);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let mut task = store.stored_task("t-unmetered");

    let outcome = reconciler
        .reconcile(&mut task, &observed("SUCCESS"), None, NOW)
        .await
        .unwrap();

    assert_eq!(outcome, SettlementOutcome::Unmetered);
    assert_eq!(store.stored_task("t-unmetered").quota, 1000);
    assert_eq!(store.user(7).quota, 10_000);
}

#[tokio::test]
async fn in_progress_records_start_without_ledger_change() {
    let store = store_with("t-running", 1000);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let mut task = store.stored_task("t-running");

    let outcome = reconciler
        .reconcile(&mut task, &observed("processing"), None, NOW)
        .await
        .unwrap();

    assert_eq!(outcome, SettlementOutcome::Pending);
    let stored = store.stored_task("t-running");
    assert_eq!(stored.status, TaskStatus::InProgress);
    assert_eq!(stored.start_time, NOW);
    assert_eq!(stored.progress, "30%");
    assert_eq!(store.user(7).quota, 10_000);
}

#[tokio::test]
async fn unrecognized_status_fails_and_refunds() {
    let store = store_with("t-odd", 500);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let mut task = store.stored_task("t-odd");

    let outcome = reconciler
        .reconcile(&mut task, &observed("paused"), None, NOW)
        .await
        .unwrap();

    assert_eq!(outcome, SettlementOutcome::Refunded { quota: 500 });
    assert!(task.fail_reason.contains("paused"));
    assert_eq!(store.user(7).quota, 10_500);
}

// key: settlement-tests -> persist before ledger
#[tokio::test]
async fn persistence_failure_leaves_balance_untouched() {
    let store = store_with("t-persist", 1000);
    store.fail_updates.store(true, Ordering::SeqCst);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let mut task = store.stored_task("t-persist");

    let err = reconciler
        .reconcile(&mut task, &observed("FAILURE"), None, NOW)
        .await
        .unwrap_err();

    assert!(matches!(err, SettlementError::Persist { .. }));
    assert_eq!(task.status, TaskStatus::Submitted);
    assert_eq!(store.stored_task("t-persist").status, TaskStatus::Submitted);
    assert_eq!(store.user(7).quota, 10_000);
    assert!(store.logs().is_empty());

    store.fail_updates.store(false, Ordering::SeqCst);
    let retried = reconciler
        .reconcile(&mut task, &observed("FAILURE"), None, NOW)
        .await
        .unwrap();
    assert_eq!(retried, SettlementOutcome::Refunded { quota: 1000 });
    assert_eq!(store.user(7).quota, 11_000);
}

#[tokio::test]
async fn missing_model_ratio_leaves_task_unresolved() {
    let mut task = video_task("t-unpriced", 1, 7, 1000);
    task.model = "unpriced-model".into();
    let store = MemoryStore::new().with_user(7, "default", 10_000).with_task(task);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let mut task = store.stored_task("t-unpriced");

    let err = reconciler
        .reconcile(&mut task, &succeeded_after(5.0), None, NOW)
        .await
        .unwrap_err();

    assert!(matches!(err, SettlementError::Pricing(_)));
    assert_eq!(store.stored_task("t-unpriced").status, TaskStatus::Submitted);
    assert_eq!(store.state().updates, 0);
    assert_eq!(store.user(7).quota, 10_000);
}

#[tokio::test]
async fn ledger_failure_restores_recorded_quota() {
    let store = store_with("t-ledger", 1000);
    store.fail_ledger.store(true, Ordering::SeqCst);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let mut task = store.stored_task("t-ledger");

    let err = reconciler
        .reconcile(&mut task, &succeeded_after(5.0), None, NOW)
        .await
        .unwrap_err();

    assert!(matches!(err, SettlementError::Ledger { .. }));
    let stored = store.stored_task("t-ledger");
    assert_eq!(stored.status, TaskStatus::Success);
    assert_eq!(stored.quota, 1000);
    assert_eq!(store.user(7).quota, 10_000);
}

#[tokio::test]
async fn empty_task_group_falls_back_to_user_group() {
    let mut task = video_task("t-vip", 1, 9, 1000);
    task.group = String::new();
    let store = MemoryStore::new().with_user(9, "vip", 10_000).with_task(task);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let mut task = store.stored_task("t-vip");

    let outcome = reconciler
        .reconcile(&mut task, &succeeded_after(5.0), None, NOW)
        .await
        .unwrap();

    // 5 * 240 * 0.5
    assert_eq!(
        outcome,
        SettlementOutcome::Credited {
            amount: 400,
            actual: 600
        }
    );
}

#[tokio::test]
async fn unresolvable_group_is_a_pricing_error() {
    let mut task = video_task("t-nogroup", 1, 11, 1000);
    task.group = String::new();
    let store = MemoryStore::new().with_user(11, "", 10_000).with_task(task);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let mut task = store.stored_task("t-nogroup");

    let err = reconciler
        .reconcile(&mut task, &succeeded_after(5.0), None, NOW)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::Pricing(_)));
}

#[tokio::test]
async fn feature_scale_multiplies_unit_price() {
    let store = store_with("t-scaled", 1000);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let mut task = store.stored_task("t-scaled");

    let outcome = reconciler
        .reconcile(&mut task, &succeeded_after(5.0), Some(&FixedScale(1.5)), NOW)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        SettlementOutcome::ToppedUp {
            delta: 800,
            actual: 1800
        }
    );
}

#[tokio::test]
async fn kling_pro_mode_is_priced_through_feature_scales() {
    let mut task = video_task("t-kling", 1, 7, 100);
    task.platform = TaskPlatform::Kling;
    task.model = "kling-v1".into();
    task.action = "generate".into();
    task.properties = json!({"mode": "pro", "duration": "5"});
    let store = MemoryStore::new().with_user(7, "default", 10_000).with_task(task);
    let reconciler = TaskSettlementReconciler::new(&store, &store, Arc::new(video_pricing()));
    let adaptor = KlingAdaptor::new(reqwest::Client::new());
    let mut task = store.stored_task("t-kling");

    let outcome = reconciler
        .reconcile(&mut task, &succeeded_after(5.0), Some(&adaptor), NOW)
        .await
        .unwrap();

    // 5s * pro scale 3.5 * ratio 10
    assert_eq!(
        outcome,
        SettlementOutcome::ToppedUp {
            delta: 75,
            actual: 175
        }
    );
}
