//! Cross-module scenario tests exercising the public API as a whole rather
//! than one module at a time.

use std::sync::Arc;

use ariesdb::collab::testing::{InMemoryBufferManager, InMemoryDiskSpaceManager, ThreadParkContext};
use ariesdb::{LockManager, LockMode, RecoveryConfig, RecoveryManager, ResourceName, TransactionContext};
use tempfile::tempdir;

fn ctx(id: u64) -> Arc<dyn TransactionContext> {
    ThreadParkContext::new(id)
}

#[test]
fn queue_fifo_grants_in_request_order() {
    let lm = Arc::new(LockManager::new());
    let db = ResourceName::root("db");

    let t1 = ctx(1);
    lm.acquire(t1.clone(), &db, LockMode::X).unwrap();

    let lm2 = lm.clone();
    let db2 = db.clone();
    let t2 = ctx(2);
    let t2_thread = t2.clone();
    let h2 = std::thread::spawn(move || lm2.acquire(t2_thread, &db2, LockMode::S).unwrap());
    std::thread::sleep(std::time::Duration::from_millis(20));

    let lm3 = lm.clone();
    let db3 = db.clone();
    let t3 = ctx(3);
    let t3_thread = t3.clone();
    let h3 = std::thread::spawn(move || lm3.acquire(t3_thread, &db3, LockMode::S).unwrap());
    std::thread::sleep(std::time::Duration::from_millis(20));

    assert_eq!(lm.queue_len(&db), 2);

    lm.release(&t1, &db).unwrap();
    h2.join().unwrap();
    h3.join().unwrap();

    let holders = lm.holders(&db);
    assert_eq!(holders.len(), 2);
    assert!(holders.contains(&(2, LockMode::S)));
    assert!(holders.contains(&(3, LockMode::S)));
}

#[test]
fn head_insertion_lets_acquire_and_release_jump_the_queue() {
    let lm = Arc::new(LockManager::new());
    let a = ResourceName::root("a");

    let t1 = ctx(1);
    let t2 = ctx(2);
    lm.acquire(t1.clone(), &a, LockMode::S).unwrap();
    lm.acquire(t2.clone(), &a, LockMode::S).unwrap();

    let lm_t1 = lm.clone();
    let a_t1 = a.clone();
    let t1_thread = t1.clone();
    let a_for_release = a.clone();
    let h1 = std::thread::spawn(move || {
        lm_t1.acquire_and_release(t1_thread, &a_t1, LockMode::X, vec![a_for_release]).unwrap();
    });
    std::thread::sleep(std::time::Duration::from_millis(20));

    let lm_t3 = lm.clone();
    let a_t3 = a.clone();
    let t3 = ctx(3);
    let t3_thread = t3.clone();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let order_t3 = order.clone();
    let h3 = std::thread::spawn(move || {
        lm_t3.acquire(t3_thread, &a_t3, LockMode::S).unwrap();
        order_t3.lock().unwrap().push(3u64);
    });
    std::thread::sleep(std::time::Duration::from_millis(20));

    assert_eq!(lm.queue_len(&a), 2);

    lm.release(&t2, &a).unwrap();
    h1.join().unwrap();
    order.lock().unwrap().push(1);
    // T1's swap granted it X; release it so T3's queued S request can drain.
    lm.release(&t1, &a).unwrap();
    h3.join().unwrap();

    let recorded = order.lock().unwrap().clone();
    assert_eq!(recorded[0], 1, "T1's acquire_and_release must be granted before T3's queued request");
}

#[test]
fn rollback_to_savepoint_restores_only_the_tail_updates() {
    let dir = tempdir().unwrap();
    let log = Arc::new(ariesdb::LogManager::open(dir.path().join("log"), 4096).unwrap());
    let lock_manager = Arc::new(LockManager::new());
    let rm = RecoveryManager::new(log, lock_manager, RecoveryConfig::default());
    let disk = InMemoryDiskSpaceManager::new();
    let buf = InMemoryBufferManager::new();
    buf.mark_dirty(1);
    buf.mark_dirty(2);

    let t: Arc<dyn TransactionContext> = ctx(1);
    rm.start_transaction(t.clone());

    rm.log_page_write(&t, 1, 0, vec![0], vec![1]).unwrap();
    buf.fetch_page(1).unwrap().write(0, &[1]);

    rm.savepoint(&t, "s").unwrap();

    rm.log_page_write(&t, 2, 0, vec![0], vec![9]).unwrap();
    buf.fetch_page(2).unwrap().write(0, &[9]);

    rm.log_page_write(&t, 1, 0, vec![1], vec![2]).unwrap();
    buf.fetch_page(1).unwrap().write(0, &[2]);

    rm.rollback_to_savepoint(&t, "s", disk.as_ref(), buf.as_ref()).unwrap();

    assert_eq!(buf.fetch_page(1).unwrap().read(0, 1), vec![1], "p1 restored to its post-first-update state");
    assert_eq!(buf.fetch_page(2).unwrap().read(0, 1), vec![0], "p2's only update is undone entirely");
}

#[test]
fn restart_ends_committed_txn_and_undoes_uncommitted_txn() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_path_buf();

    {
        let log = Arc::new(ariesdb::LogManager::open(&path.join("log"), 4096).unwrap());
        let lock_manager = Arc::new(LockManager::new());
        let rm = RecoveryManager::new(log, lock_manager, RecoveryConfig::default());
        let disk = InMemoryDiskSpaceManager::new();
        let buf = InMemoryBufferManager::new();
        buf.mark_dirty(5);
        buf.mark_dirty(7);

        let t1: Arc<dyn TransactionContext> = ctx(1);
        rm.start_transaction(t1.clone());
        rm.log_page_write(&t1, 5, 0, vec![0], vec![11]).unwrap();
        rm.commit(&t1).unwrap();
        rm.end(&t1, disk.as_ref(), buf.as_ref()).unwrap();

        let t2: Arc<dyn TransactionContext> = ctx(2);
        rm.start_transaction(t2.clone());
        rm.log_page_write(&t2, 7, 0, vec![0], vec![22]).unwrap();
        // crash before commit
    }

    let log2 = Arc::new(ariesdb::LogManager::open(&path.join("log"), 4096).unwrap());
    let lock_manager2 = Arc::new(LockManager::new());
    let rm2 = RecoveryManager::new(log2, lock_manager2, RecoveryConfig::default());
    let disk = InMemoryDiskSpaceManager::new();
    let buf = InMemoryBufferManager::new();
    buf.mark_dirty(5);
    buf.mark_dirty(7);

    rm2.restart(disk.as_ref(), buf.as_ref(), &|txn_id| ThreadParkContext::new(txn_id)).unwrap();

    assert_eq!(buf.fetch_page(5).unwrap().read(0, 1), vec![11], "T1's committed update survives restart");
    assert_eq!(buf.fetch_page(7).unwrap().read(0, 1), vec![0], "T2's uncommitted update is undone during restart");

    rm2.checkpoint(buf.as_ref()).unwrap();
}
