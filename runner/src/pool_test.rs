use crate::{
    ledger::InitLedger,
    membership::{Membership, WorkerId, CONTROLLER},
    pool::{PoolConfig, WorkerPool},
    task::Task,
    test_util::{eventually, join_workers, membership, registry},
};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

fn pool(config: PoolConfig) -> (Arc<Membership>, SocketAddr, Arc<InitLedger>, Arc<WorkerPool>) {
    let (membership, address) = membership(registry());
    let ledger = InitLedger::new(membership.clone());
    let pool = WorkerPool::new(config, membership.clone(), ledger.clone());
    pool.attach();

    (membership, address, ledger, pool)
}

fn config(max_occupancy: usize, controller_fallback: bool) -> PoolConfig {
    PoolConfig {
        max_occupancy,
        controller_fallback,
        initialize: true,
    }
}

fn wait_for_pool(pool: &WorkerPool, count: usize) {
    assert!(eventually(Duration::from_secs(5), || pool.len() == count));
}

#[test]
pub fn empty_pool_falls_back_to_the_controller() {
    let (_membership, _, _, pool) = pool(config(1, true));

    assert!(pool.offers_controller());
    assert_eq!(pool.take(), CONTROLLER);
    assert_eq!(pool.occupancy(CONTROLLER), 1);
    assert_eq!(pool.try_take(), None);

    pool.put(CONTROLLER);
    assert_eq!(pool.occupancy(CONTROLLER), 0);
    assert_eq!(pool.try_take(), Some(CONTROLLER));
}

#[test]
pub fn empty_pool_without_fallback_blocks() {
    let (_membership, _, _, pool) = pool(config(1, false));

    assert!(!pool.offers_controller());
    assert_eq!(pool.try_take(), None);
    assert_eq!(pool.take_timeout(Duration::from_millis(100)), None);
}

#[test]
pub fn worker_is_shared_up_to_max_occupancy() {
    let (membership, address, _, pool) = pool(config(2, true));
    let handles = join_workers(&membership, address, 1);
    wait_for_pool(&pool, 1);

    let worker = membership.workers()[0];

    assert_eq!(pool.take(), worker);
    assert_eq!(pool.take(), worker);
    assert_eq!(pool.occupancy(worker), 2);

    // neither a third lease nor the controller
    assert_eq!(pool.try_take(), None);
    assert_eq!(pool.take_timeout(Duration::from_millis(100)), None);

    pool.put(worker);
    assert_eq!(pool.occupancy(worker), 1);
    assert_eq!(pool.take(), worker);

    membership.terminate_all();

    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }
}

#[test]
pub fn blocked_take_wakes_up_on_put() {
    let (membership, address, _, pool) = pool(config(1, false));
    let handles = join_workers(&membership, address, 1);
    wait_for_pool(&pool, 1);

    let worker = pool.take();
    let waiting = {
        let pool = pool.clone();
        thread::spawn(move || pool.take())
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!waiting.is_finished());

    pool.put(worker);
    assert_eq!(waiting.join().unwrap(), worker);

    membership.terminate_all();

    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }
}

#[test]
pub fn occupancy_never_exceeds_the_limit() {
    let (membership, address, _, pool) = pool(config(2, false));
    let handles = join_workers(&membership, address, 2);
    wait_for_pool(&pool, 2);

    let leases: Mutex<BTreeMap<WorkerId, usize>> = Mutex::default();
    let peak: Mutex<usize> = Mutex::new(0);

    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..50 {
                    let worker = pool.take();

                    {
                        let mut leases = leases.lock();
                        let count = leases.entry(worker).or_default();
                        *count += 1;

                        let mut peak = peak.lock();
                        *peak = (*peak).max(*count);
                    }

                    thread::yield_now();

                    *leases.lock().entry(worker).or_default() -= 1;
                    pool.put(worker);
                }
            });
        }
    });

    assert!(*peak.lock() <= 2);
    assert!(*peak.lock() >= 1);
    assert!(membership
        .workers()
        .iter()
        .all(|worker| pool.occupancy(*worker) == 0));

    membership.terminate_all();

    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }
}

#[test]
pub fn controller_is_withdrawn_while_workers_exist() {
    let (membership, address, _, pool) = pool(config(1, true));

    assert_eq!(pool.take(), CONTROLLER);
    pool.put(CONTROLLER);

    let handles = join_workers(&membership, address, 1);
    wait_for_pool(&pool, 1);
    let worker = membership.workers()[0];

    assert!(!pool.offers_controller());
    assert_eq!(pool.take(), worker);
    assert_eq!(pool.try_take(), None);
    pool.put(worker);

    membership.terminate(worker);
    wait_for_pool(&pool, 0);

    assert!(pool.offers_controller());
    assert_eq!(pool.take(), CONTROLLER);

    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }
}

#[test]
pub fn removed_worker_leaves_no_leases_behind() {
    let (membership, address, _, pool) = pool(config(3, false));
    let handles = join_workers(&membership, address, 1);
    wait_for_pool(&pool, 1);
    let worker = membership.workers()[0];

    assert_eq!(pool.take(), worker);
    pool.remove(worker);

    assert!(!pool.contains(worker));
    assert_eq!(pool.occupancy(worker), 0);

    // returning a lease of a removed worker doesn't bring it back
    pool.put(worker);
    assert!(!pool.contains(worker));
    assert_eq!(pool.try_take(), None);

    membership.terminate_all();

    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }
}

#[test]
pub fn take_initializes_the_worker() {
    let (membership, address, ledger, pool) = pool(config(1, false));
    ledger.add_init_step(Task::new("append", 1)).unwrap();

    let handles = join_workers(&membership, address, 1);
    wait_for_pool(&pool, 1);
    let worker = membership.workers()[0];

    assert_eq!(ledger.worker_level(worker), 0);
    assert_eq!(pool.take(), worker);
    assert_eq!(ledger.worker_level(worker), 1);

    membership.terminate_all();

    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }
}

#[test]
pub fn worker_failing_to_initialize_is_evicted() {
    let (membership, address, ledger, pool) = pool(config(1, true));
    ledger.add_init_step(Task::call("controller_only")).unwrap();

    let handles = join_workers(&membership, address, 1);
    wait_for_pool(&pool, 1);
    let worker = membership.workers()[0];

    // the broken worker is skipped, the empty pool falls back to the controller
    assert_eq!(pool.take_timeout(Duration::from_secs(5)), Some(CONTROLLER));
    assert!(!pool.contains(worker));
    assert!(membership.is_terminated(worker));

    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }
}

#[test]
pub fn try_take_initializes_in_the_background() {
    let (membership, address, ledger, pool) = pool(config(1, false));
    ledger.add_init_step(Task::new("stall", 300)).unwrap();

    let handles = join_workers(&membership, address, 1);
    wait_for_pool(&pool, 1);
    let worker = membership.workers()[0];

    // returns right away, the lease is held until the worker caught up
    let started = Instant::now();
    assert_eq!(pool.try_take(), None);
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(pool.occupancy(worker), 1);

    assert!(eventually(Duration::from_secs(5), || ledger.worker_level(worker) == 1));
    assert!(eventually(Duration::from_secs(5), || pool.occupancy(worker) == 0));
    assert_eq!(pool.try_take(), Some(worker));

    membership.terminate_all();

    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }
}

#[test]
pub fn inactive_workers_are_not_added() {
    let (membership, address, _, pool) = pool(config(1, true));

    pool.add(WorkerId(7));
    assert!(!pool.contains(WorkerId(7)));
    assert!(pool.offers_controller());

    let handles = join_workers(&membership, address, 1);
    wait_for_pool(&pool, 1);
    let worker = membership.workers()[0];

    membership.terminate(worker);
    wait_for_pool(&pool, 0);

    // a late add for a departed worker is ignored
    pool.add(worker);
    assert!(!pool.contains(worker));

    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }
}
