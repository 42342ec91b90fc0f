use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use session_runtime::orchestrator::lock_manager::{spawn_eviction_task, SessionLockManager};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn same_session_waits_instead_of_failing() {
    let locks = Arc::new(SessionLockManager::new(false));
    let guard = locks.acquire("s1").await;

    let waiter = {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move {
            let guard = locks.acquire("s1").await;
            guard.session_id().to_owned()
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "second acquire must wait");

    drop(guard);
    let acquired = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter finishes")
        .expect("join");
    assert_eq!(acquired, "s1");
}

#[tokio::test]
async fn different_sessions_run_in_parallel_without_global_lock() {
    let locks = SessionLockManager::new(false);
    let a = locks.acquire("a").await;
    let b = tokio::time::timeout(Duration::from_millis(200), locks.acquire("b"))
        .await
        .expect("no contention across sessions");
    assert!(!a.holds_global());
    assert!(!b.holds_global());
}

#[tokio::test]
async fn global_lock_serializes_across_sessions() {
    let locks = SessionLockManager::new(true);
    let a = locks.acquire("a").await;
    assert!(a.holds_global());

    let blocked = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b")).await;
    assert!(blocked.is_err(), "global lock must block other sessions");

    drop(a);
    let b = tokio::time::timeout(Duration::from_secs(1), locks.acquire("b"))
        .await
        .expect("acquired after release");
    assert!(b.holds_global());
}

#[tokio::test]
async fn global_lock_bounds_concurrency_to_one() {
    let locks = Arc::new(SessionLockManager::new(true));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..6)
        .map(|index| {
            let locks = Arc::clone(&locks);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let _guard = locks.acquire(&format!("s{index}")).await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("join");
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn release_and_forget_drops_uncontended_entry() {
    let locks = SessionLockManager::new(false);
    let guard = locks.acquire("s1").await;
    assert!(locks.contains("s1"));

    locks.release_and_forget(guard);
    assert!(!locks.contains("s1"));
    assert!(locks.is_empty());
}

#[tokio::test]
async fn release_and_forget_keeps_entry_with_waiter() {
    let locks = Arc::new(SessionLockManager::new(false));
    let guard = locks.acquire("s1").await;

    let waiter = {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move {
            let _guard = locks.acquire("s1").await;
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    locks.release_and_forget(guard);
    assert!(locks.contains("s1"), "queued waiter keeps the entry alive");
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter proceeds")
        .expect("join");
}

#[tokio::test]
async fn evict_idle_skips_held_entries() {
    let locks = SessionLockManager::new(false);
    let held = locks.acquire("held").await;
    drop(locks.acquire("idle").await);
    assert_eq!(locks.len(), 2);

    let removed = locks.evict_idle(Duration::ZERO);
    assert_eq!(removed, 1);
    assert!(locks.contains("held"));
    assert!(!locks.contains("idle"));
    drop(held);
}

#[tokio::test]
async fn evict_idle_respects_ttl() {
    let locks = SessionLockManager::new(false);
    drop(locks.acquire("recent").await);
    assert_eq!(locks.evict_idle(Duration::from_secs(3600)), 0);
    assert!(locks.contains("recent"));
}

#[tokio::test]
async fn eviction_task_stops_on_cancel() {
    let locks = Arc::new(SessionLockManager::new(false));
    drop(locks.acquire("idle").await);

    let cancel = CancellationToken::new();
    let handle = spawn_eviction_task(Arc::clone(&locks), Duration::ZERO, cancel.clone());

    // The first interval tick fires immediately.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(locks.is_empty());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("task exits")
        .expect("join");
}
