// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[tokio::test]
async fn first_caller_runs_body_once() {
    let registry = OnceRegistry::new();
    let ctx = Context::background();
    let runs = AtomicU32::new(0);

    let first = registry
        .call(&ctx, "k", || async {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<_, LockError>("ran")
        })
        .await
        .unwrap();
    assert_eq!(first, Some("ran"));
    assert_eq!(registry.state("k"), WaveState::Settled);

    let second = registry
        .call(&ctx, "k", || async {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<_, LockError>("ran")
        })
        .await
        .unwrap();
    assert_eq!(second, None);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_body_reopens_wave() {
    let registry = OnceRegistry::new();
    let ctx = Context::background();

    let err = registry
        .call(&ctx, "k", || async { Err::<(), _>(LockError::Cancelled) })
        .await
        .unwrap_err();
    assert_eq!(err, LockError::Cancelled);
    assert_eq!(registry.state("k"), WaveState::Idle);

    let retry = registry
        .call(&ctx, "k", || async { Ok::<_, LockError>(2) })
        .await
        .unwrap();
    assert_eq!(retry, Some(2));
}

#[tokio::test]
async fn refresh_and_clear_reopen_settled_waves() {
    let registry = OnceRegistry::new();
    let ctx = Context::background();
    for key in ["a", "b"] {
        registry
            .call(&ctx, key, || async { Ok::<_, LockError>(()) })
            .await
            .unwrap();
    }

    registry.refresh("a");
    assert_eq!(registry.state("a"), WaveState::Idle);
    assert_eq!(registry.state("b"), WaveState::Settled);

    registry.clear();
    assert_eq!(registry.state("b"), WaveState::Idle);
    // unknown keys are idle and refreshing them is harmless
    registry.refresh("missing");
    assert_eq!(registry.state("missing"), WaveState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_elect_one_runner() {
    let registry = Arc::new(OnceRegistry::new());
    let runs = Arc::new(AtomicU32::new(0));

    let tasks: Vec<_> = (0..12)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let runs = Arc::clone(&runs);
            tokio::spawn(async move {
                registry
                    .call(&Context::background(), "img", || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, LockError>(())
                    })
                    .await
                    .unwrap()
                    .is_some()
            })
        })
        .collect();

    let mut ran = 0;
    for task in tasks {
        if task.await.unwrap() {
            ran += 1;
        }
    }
    assert_eq!(ran, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn waiter_takes_over_after_runner_fails() {
    let registry = Arc::new(OnceRegistry::new());
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let runner = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            registry
                .call(&Context::background(), "k", || async move {
                    let _ = release_rx.await;
                    Err::<(), _>(LockError::Init("unhealthy".to_string()))
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(registry.state("k"), WaveState::Running);

    let waiter = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            registry
                .call(&Context::background(), "k", || async { Ok::<_, LockError>(()) })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    let _ = release_tx.send(());
    assert!(runner.await.unwrap().is_err());
    assert_eq!(waiter.await.unwrap().unwrap(), Some(()));
    assert_eq!(registry.state("k"), WaveState::Settled);
}

#[tokio::test]
async fn waiting_on_running_wave_is_cancelable() {
    let registry = Arc::new(OnceRegistry::new());
    let runner = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            registry
                .call(&Context::background(), "k", || {
                    std::future::pending::<Result<(), LockError>>()
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let ctx = Context::with_timeout(Duration::from_millis(20));
    let err = registry
        .call(&ctx, "k", || async { Ok::<_, LockError>(()) })
        .await
        .unwrap_err();
    assert_eq!(err, LockError::DeadlineExceeded);

    // aborting the runner drops its body and reopens the wave
    runner.abort();
    let _ = runner.await;
    assert_eq!(registry.state("k"), WaveState::Idle);
}

fn tracked(registry: &OnceRegistry) -> usize {
    registry.waves.lock().unwrap().len()
}

#[tokio::test]
async fn idle_waves_are_forgotten() {
    let registry = OnceRegistry::new();
    let ctx = Context::background();

    registry
        .call(&ctx, "failed", || async { Err::<(), _>(LockError::Cancelled) })
        .await
        .unwrap_err();
    assert_eq!(tracked(&registry), 0);

    for key in ["a", "b"] {
        registry
            .call(&ctx, key, || async { Ok::<_, LockError>(()) })
            .await
            .unwrap();
    }
    assert_eq!(tracked(&registry), 2, "settled waves are kept");

    registry.refresh("a");
    assert_eq!(tracked(&registry), 1);
    registry.clear();
    assert_eq!(tracked(&registry), 0);
    assert_eq!(registry.state("b"), WaveState::Idle);
}
