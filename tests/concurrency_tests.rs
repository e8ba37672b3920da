// Declare the common module *within this test crate*
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::{FakeReplicatedTransaction, resource_hash, setup_store};
use tlock::prelude::*;

struct CountingHook(AtomicUsize);

impl ClearLocksHook<String, i64> for CountingHook {
    fn on_clear_locks(&self, _txn: &StoreTransaction<String, i64>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_concurrent_close_runs_release_once() {
    // N threads race Close/Unlock on one transaction holding a prime lock and
    // a re-entered key lock. The release body must run exactly once.
    const THREADS: usize = 8;

    let store = setup_store(true);
    let lm = Arc::clone(store.lock_manager());
    let fake = FakeReplicatedTransaction::new(42);
    let replicated: Arc<dyn ReplicatedTransaction> = fake.clone();
    let (_, txn) = store.create_or_find_transaction(&replicated);
    let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
    txn.set_clear_locks_hook(hook.clone());

    let hash = resource_hash("hot");
    let block = futures::executor::block_on(async {
        store.lock_key_for_write(&txn, hash, None).await.unwrap();
        store.lock_key_for_write(&txn, hash, None).await.unwrap()
    });
    assert_eq!(block.count(), 2);

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let txn = Arc::clone(&txn);
            let fake = Arc::clone(&fake);
            thread::spawn(move || {
                barrier.wait();
                match i % 3 {
                    0 => txn.close(),
                    1 => txn.unlock(),
                    _ => fake.complete(),
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(hook.0.load(Ordering::SeqCst), 1);
    assert!(txn.is_closed());
    assert_eq!(block.count(), 0);
    assert!(block.is_closed());
    assert_eq!(lm.resource_count(), 0);
    assert_eq!(lm.prime_lock_state(), (0, false, 0));
    assert!(store.registry().is_empty());
    assert!(!txn.has_replicated_transaction());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_exclusive_prime_lock_blocks_shared() {
    let store = setup_store(true);
    let lm = Arc::clone(store.lock_manager());

    let t1 = store.create_transaction(1, false);
    t1.acquire_prime_lock(&lm, LockMode::Exclusive, Duration::from_secs(1), false)
        .await
        .unwrap();

    let t2 = store.create_transaction(2, false);
    let waiter = {
        let lm = Arc::clone(&lm);
        let t2 = Arc::clone(&t2);
        tokio::spawn(async move {
            t2.acquire_prime_lock(&lm, LockMode::Shared, INFINITE_TIMEOUT, false)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());
    assert_eq!(lm.prime_lock_state(), (0, true, 1));

    t1.close();
    let remaining = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("shared prime lock should be granted once the writer closes")
        .unwrap()
        .unwrap();
    assert_eq!(remaining, INFINITE_TIMEOUT);
    assert!(t2.is_prime_lock_acquired());
    assert_eq!(lm.prime_lock_state(), (1, false, 0));

    t2.close();
    assert_eq!(lm.prime_lock_state(), (0, false, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_close_during_key_wait_releases_grant() {
    let store = setup_store(true);
    let lm = Arc::clone(store.lock_manager());
    let r1 = resource_hash("R1");

    let t0 = store.create_transaction(100, false);
    t0.acquire_key_lock(&lm, r1, LockMode::Exclusive, Duration::ZERO)
        .await
        .unwrap();

    let t1 = store.create_transaction(1, false);
    let acquisition = {
        let lm = Arc::clone(&lm);
        let t1 = Arc::clone(&t1);
        tokio::spawn(async move {
            t1.acquire_key_lock(&lm, r1, LockMode::Exclusive, INFINITE_TIMEOUT)
                .await
        })
    };
    while lm.waiter_count(r1) == 0 {
        tokio::task::yield_now().await;
    }

    // Close T1 from another thread while it is parked in the lock manager.
    let closer = Arc::clone(&t1);
    thread::spawn(move || closer.close()).join().unwrap();
    assert!(!acquisition.is_finished());

    // The holder leaves; the manager grants T1, which must hand it back.
    t0.close();
    let err = acquisition.await.unwrap().unwrap_err();
    assert_eq!(err, TxnLockError::Aborted { txn_id: 1 });
    assert!(!lm.contains_resource(r1));
    assert_eq!(t1.key_lock_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_racing_prime_lock_wait_does_not_leak() {
    let store = setup_store(true);
    let lm = Arc::clone(store.lock_manager());

    let admin = store.create_transaction(1, false);
    admin
        .acquire_prime_lock(&lm, LockMode::Exclusive, Duration::ZERO, false)
        .await
        .unwrap();

    let worker = store.create_transaction(2, false);
    let pending = {
        let lm = Arc::clone(&lm);
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            worker
                .acquire_prime_lock(&lm, LockMode::Shared, INFINITE_TIMEOUT, false)
                .await
        })
    };
    while lm.prime_lock_state().2 == 0 {
        tokio::task::yield_now().await;
    }

    worker.close();
    admin.close();

    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_aborted());
    assert_eq!(worker.prime_lock_requests_len(), 0);
    assert_eq!(lm.prime_lock_state(), (0, false, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exclusive_key_lock_serializes_writers() {
    let store = setup_store(true);
    let hash = resource_hash("counter");
    let inside = Arc::new(AtomicUsize::new(0));

    let tasks = (0..16i64).map(|id| {
        let store = Arc::clone(&store);
        let inside = Arc::clone(&inside);
        tokio::spawn(async move {
            let txn = store.create_transaction(id, false);
            store
                .lock_key_for_write(&txn, hash, Some(INFINITE_TIMEOUT))
                .await
                .unwrap();
            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
            tokio::time::sleep(Duration::from_millis(2)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
            txn.close();
        })
    });
    for result in join_all(tasks).await {
        result.unwrap();
    }

    assert_eq!(store.lock_manager().resource_count(), 0);
    assert!(store.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_randomized_acquire_and_abort_leaves_clean_tables() {
    let store = setup_store(true);
    let keys: Vec<u64> = (0..8).map(|k| resource_hash(&format!("key{}", k))).collect();

    let tasks = (0..64i64).map(|id| {
        let store = Arc::clone(&store);
        let keys = keys.clone();
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(id as u64);
            let txn = store.create_transaction(id, false);
            txn.set_read_isolation_level(ReadIsolationLevel::ReadRepeatable);
            let mut chosen: Vec<u64> = (0..rng.random_range(1..4))
                .map(|_| keys[rng.random_range(0..keys.len())])
                .collect();
            // Consistent key order keeps concurrent writers deadlock free.
            chosen.sort_unstable();
            let budget = Duration::from_millis(rng.random_range(1..50));
            for hash in chosen {
                let outcome = if rng.random_bool(0.5) {
                    store.lock_key_for_write(&txn, hash, Some(budget)).await.map(Some)
                } else {
                    store.lock_key_for_read(&txn, hash, Some(budget)).await
                };
                if let Err(err) = outcome {
                    assert!(err.is_timeout() || err.is_aborted(), "{err}");
                    break;
                }
            }
            txn.close();
        })
    });
    let aborter = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            store.abort_all_transactions()
        })
    };

    for result in join_all(tasks).await {
        result.unwrap();
    }
    aborter.await.unwrap();

    let lm = store.lock_manager();
    assert_eq!(lm.resource_count(), 0);
    assert_eq!(lm.prime_lock_state(), (0, false, 0));
    assert!(store.registry().is_empty());
}
