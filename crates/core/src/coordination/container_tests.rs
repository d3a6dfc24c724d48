// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::time::Duration;

fn locks() -> Arc<ContainerLocks> {
    Arc::new(ContainerLocks::new())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn initializer_downgrades_to_shared_on_success() {
    let locks = locks();
    let ctx = Context::background();

    let handle = locks.acquire(&ctx, "db", false, true).await.unwrap();
    assert!(handle.init_acquired());
    assert!(!handle.is_shared());
    assert_eq!(locks.state("db"), KeyState::Exclusive);

    handle.set_init_result(true).unwrap();
    assert!(handle.is_shared());
    assert_eq!(locks.state("db"), KeyState::Shared(1));
    assert_eq!(locks.wave("db"), WaveState::Settled);

    handle.release().unwrap();
    assert_eq!(locks.state("db"), KeyState::Unlocked);
}

#[tokio::test]
async fn users_wait_for_init_then_share() {
    let locks = locks();
    let ctx = Context::background();
    let init = locks.acquire(&ctx, "db", false, true).await.unwrap();

    let users: Vec<_> = (0..3)
        .map(|_| {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire(&Context::background(), "db", false, true).await })
        })
        .collect();
    settle().await;
    assert!(users.iter().all(|u| !u.is_finished()));

    init.set_init_result(true).unwrap();
    let mut handles = Vec::new();
    for user in users {
        let handle = user.await.unwrap().unwrap();
        assert!(!handle.init_acquired());
        assert!(handle.is_shared());
        handles.push(handle);
    }
    assert_eq!(locks.state("db"), KeyState::Shared(4));

    init.release().unwrap();
    for handle in handles {
        handle.release().unwrap();
    }
    assert_eq!(locks.state("db"), KeyState::Unlocked);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_initializer_per_wave() {
    let locks = locks();
    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let handle = locks
                    .acquire(&Context::background(), "svc", false, true)
                    .await
                    .unwrap();
                if handle.init_acquired() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    handle.set_init_result(true).unwrap();
                }
                let initializer = handle.init_acquired();
                handle.release().unwrap();
                initializer
            })
        })
        .collect();

    let mut initializers = 0;
    for task in tasks {
        if task.await.unwrap() {
            initializers += 1;
        }
    }
    assert_eq!(initializers, 1);
    assert_eq!(locks.wave("svc"), WaveState::Settled);
}

#[tokio::test]
async fn failed_init_elects_a_new_initializer() {
    let locks = locks();
    let ctx = Context::background();

    let first = locks.acquire(&ctx, "svc", false, true).await.unwrap();
    assert!(first.init_acquired());
    first.set_init_result(false).unwrap();
    assert_eq!(locks.wave("svc"), WaveState::Idle);

    let retry = {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move { locks.acquire(&Context::background(), "svc", false, true).await })
    };
    settle().await;
    assert!(!retry.is_finished(), "retry waits for the failed holder");

    first.release().unwrap();
    let second = retry.await.unwrap().unwrap();
    assert!(second.init_acquired());
    second.set_init_result(true).unwrap();

    let third = locks.acquire(&ctx, "svc", false, true).await.unwrap();
    assert!(!third.init_acquired());
    third.release().unwrap();
    second.release().unwrap();
}

#[tokio::test]
async fn exclusive_initializer_stays_exclusive() {
    let locks = locks();
    let ctx = Context::background();
    let handle = locks.acquire(&ctx, "vol", true, true).await.unwrap();
    assert!(handle.init_acquired());
    handle.set_init_result(true).unwrap();
    assert!(!handle.is_shared());
    assert_eq!(locks.state("vol"), KeyState::Exclusive);
    handle.release().unwrap();
    assert_eq!(locks.state("vol"), KeyState::Unlocked);
}

#[tokio::test]
async fn plain_acquisition_without_init() {
    let locks = locks();
    let ctx = Context::background();

    let exclusive = locks.acquire(&ctx, "c", true, false).await.unwrap();
    assert!(!exclusive.init_acquired());
    assert_eq!(locks.state("c"), KeyState::Exclusive);
    exclusive.release().unwrap();

    let shared = locks.acquire(&ctx, "c", false, false).await.unwrap();
    assert!(shared.is_shared());
    assert_eq!(locks.state("c"), KeyState::Shared(1));
    shared.release().unwrap();
    assert_eq!(locks.wave("c"), WaveState::Idle);
}

#[tokio::test]
async fn init_result_misuse_is_rejected() {
    let locks = locks();
    let ctx = Context::background();

    let plain = locks.acquire(&ctx, "c", false, false).await.unwrap();
    assert!(plain.set_init_result(true).unwrap_err().is_misuse());
    plain.release().unwrap();

    let init = locks.acquire(&ctx, "c", false, true).await.unwrap();
    init.set_init_result(true).unwrap();
    assert!(init.set_init_result(false).unwrap_err().is_misuse());
    assert_eq!(locks.wave("c"), WaveState::Settled);
    init.release().unwrap();
}

#[tokio::test]
async fn releasing_unreported_initializer_reopens_wave() {
    let locks = locks();
    let ctx = Context::background();
    let init = locks.acquire(&ctx, "c", false, true).await.unwrap();
    init.release().unwrap();
    assert_eq!(locks.wave("c"), WaveState::Idle);
    assert_eq!(locks.state("c"), KeyState::Unlocked);
}

#[tokio::test]
async fn dropped_handle_releases() {
    let locks = locks();
    let ctx = Context::background();
    {
        let _handle = locks.acquire(&ctx, "c", false, false).await.unwrap();
        assert_eq!(locks.state("c"), KeyState::Shared(1));
    }
    assert_eq!(locks.state("c"), KeyState::Unlocked);
}

#[tokio::test]
async fn canceled_initializer_wait_reopens_wave() {
    let locks = locks();
    let ctx = Context::background();
    let holder = locks.acquire(&ctx, "c", true, false).await.unwrap();

    let short = Context::with_timeout(Duration::from_millis(20));
    let err = locks.acquire(&short, "c", false, true).await.unwrap_err();
    assert!(err.is_cancellation());
    assert_eq!(locks.wave("c"), WaveState::Idle);

    holder.release().unwrap();
    let init = locks.acquire(&ctx, "c", false, true).await.unwrap();
    assert!(init.init_acquired());
    init.release().unwrap();
}

#[tokio::test]
async fn reset_forgets_settled_waves() {
    let locks = locks();
    let ctx = Context::background();
    let init = locks.acquire(&ctx, "c", false, true).await.unwrap();
    init.set_init_result(true).unwrap();
    init.release().unwrap();

    locks.reset();
    let again = locks.acquire(&ctx, "c", false, true).await.unwrap();
    assert!(again.init_acquired());
    again.release().unwrap();
}

#[tokio::test]
async fn empty_key_is_misuse() {
    let locks = locks();
    let err = locks
        .acquire(&Context::background(), "", false, false)
        .await
        .unwrap_err();
    assert!(err.is_misuse());
}
