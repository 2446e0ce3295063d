//! Contracts for the external collaborators the recovery manager is handed
//! rather than owning: the buffer manager, the disk space manager, and the
//! per-transaction context used for blocking and status tracking. This
//! crate implements none of these in production form -- only the minimal
//! trait surface named by the design, plus small in-memory doubles under
//! [`testing`] used by this crate's own tests.

use std::sync::Arc;

use crate::common::{Lsn, TransactionId, TransactionStatus};
use crate::error::RecoveryError;

/// A transaction's blocking and status-tracking handle, as consumed by the
/// lock manager and the lock context tree.
///
/// `prepare_block`/`block`/`unblock` implement an arm-then-park one-shot
/// latch: the caller arms it (`prepare_block`) while still holding the lock
/// manager's monitor, releases the monitor, then parks (`block`). Some
/// other thread, itself holding the monitor during a queue drain, calls
/// `unblock` to release the park. `unblock` never blocks.
pub trait TransactionContext: Send + Sync {
    fn trans_num(&self) -> TransactionId;
    fn status(&self) -> TransactionStatus;
    fn set_status(&self, status: TransactionStatus);
    fn prepare_block(&self);
    fn block(&self);
    fn unblock(&self);
    fn cleanup(&self);
}

/// A buffer-pool-resident page, as consumed by the recovery manager during
/// redo and by forward-processing hooks.
pub trait Page: Send + Sync {
    fn page_num(&self) -> u64;
    fn page_lsn(&self) -> Lsn;
    fn set_page_lsn(&self, lsn: Lsn);
    fn unpin(&self);
    fn read(&self, offset: usize, len: usize) -> Vec<u8>;
    fn write(&self, offset: usize, data: &[u8]);
}

/// The buffer manager contract: fetching pages by number and iterating the
/// pages it currently holds (used by checkpointing to snapshot the dirty
/// page table).
pub trait BufferManager: Send + Sync {
    /// The usable byte size of a page, after header/footer overhead.
    fn effective_page_size(&self) -> usize;

    fn fetch_page(&self, page_num: u64) -> Result<Arc<dyn Page>, RecoveryError>;

    /// Invokes `f(page_num, is_dirty)` for every page currently resident.
    fn iter_page_nums(&self, f: &mut dyn FnMut(u64, bool));
}

/// The disk space manager contract: partition/page allocation primitives.
pub trait DiskSpaceManager: Send + Sync {
    fn part_num(&self, page_num: u64) -> u64;
    fn alloc_part(&self, part_num: u64) -> Result<(), RecoveryError>;
    fn free_part(&self, part_num: u64) -> Result<(), RecoveryError>;
    fn alloc_page(&self, page_num: u64) -> Result<(), RecoveryError>;
    fn free_page(&self, page_num: u64) -> Result<(), RecoveryError>;
}

/// Minimal in-memory doubles for the collaborator traits above, used by
/// this crate's own unit and scenario tests. Not a production
/// implementation of any of them.
pub mod testing {
    use super::*;
    use parking_lot::{Condvar, Mutex};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// A [`TransactionContext`] backed by a one-shot condvar latch.
    pub struct ThreadParkContext {
        trans_num: TransactionId,
        status: Mutex<TransactionStatus>,
        latch: Mutex<bool>,
        condvar: Condvar,
    }

    impl ThreadParkContext {
        pub fn new(trans_num: TransactionId) -> Arc<Self> {
            Arc::new(Self {
                trans_num,
                status: Mutex::new(TransactionStatus::Running),
                latch: Mutex::new(false),
                condvar: Condvar::new(),
            })
        }
    }

    impl TransactionContext for ThreadParkContext {
        fn trans_num(&self) -> TransactionId {
            self.trans_num
        }

        fn status(&self) -> TransactionStatus {
            *self.status.lock()
        }

        fn set_status(&self, status: TransactionStatus) {
            *self.status.lock() = status;
        }

        fn prepare_block(&self) {
            *self.latch.lock() = false;
        }

        fn block(&self) {
            let mut armed = self.latch.lock();
            while !*armed {
                self.condvar.wait(&mut armed);
            }
        }

        fn unblock(&self) {
            *self.latch.lock() = true;
            self.condvar.notify_all();
        }

        fn cleanup(&self) {}
    }

    struct InMemoryPage {
        page_num: u64,
        lsn: AtomicU64,
        data: Mutex<Vec<u8>>,
    }

    impl Page for InMemoryPage {
        fn page_num(&self) -> u64 {
            self.page_num
        }
        fn page_lsn(&self) -> Lsn {
            self.lsn.load(Ordering::SeqCst)
        }
        fn set_page_lsn(&self, lsn: Lsn) {
            self.lsn.store(lsn, Ordering::SeqCst);
        }
        fn unpin(&self) {}
        fn read(&self, offset: usize, len: usize) -> Vec<u8> {
            let data = self.data.lock();
            data[offset..offset + len].to_vec()
        }
        fn write(&self, offset: usize, bytes: &[u8]) {
            let mut data = self.data.lock();
            if data.len() < offset + bytes.len() {
                data.resize(offset + bytes.len(), 0);
            }
            data[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
    }

    /// A buffer manager that keeps every page in memory forever; used only
    /// to exercise the recovery manager's redo/checkpoint paths in tests.
    #[derive(Default)]
    pub struct InMemoryBufferManager {
        pages: Mutex<HashMap<u64, Arc<InMemoryPage>>>,
    }

    impl InMemoryBufferManager {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn mark_dirty(&self, page_num: u64) {
            self.pages.lock().entry(page_num).or_insert_with(|| {
                Arc::new(InMemoryPage { page_num, lsn: AtomicU64::new(0), data: Mutex::new(vec![0u8; 256]) })
            });
        }
    }

    impl BufferManager for InMemoryBufferManager {
        fn effective_page_size(&self) -> usize {
            256
        }

        fn fetch_page(&self, page_num: u64) -> Result<Arc<dyn Page>, RecoveryError> {
            let mut pages = self.pages.lock();
            let page = pages
                .entry(page_num)
                .or_insert_with(|| {
                    Arc::new(InMemoryPage { page_num, lsn: AtomicU64::new(0), data: Mutex::new(vec![0u8; 256]) })
                })
                .clone();
            Ok(page as Arc<dyn Page>)
        }

        fn iter_page_nums(&self, f: &mut dyn FnMut(u64, bool)) {
            for page_num in self.pages.lock().keys() {
                f(*page_num, true);
            }
        }
    }

    /// A disk space manager that just tracks which partitions/pages are
    /// allocated, with no actual disk I/O.
    #[derive(Default)]
    pub struct InMemoryDiskSpaceManager {
        parts: Mutex<std::collections::HashSet<u64>>,
        pages: Mutex<std::collections::HashSet<u64>>,
    }

    impl InMemoryDiskSpaceManager {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    impl DiskSpaceManager for InMemoryDiskSpaceManager {
        fn part_num(&self, page_num: u64) -> u64 {
            page_num >> 32
        }

        fn alloc_part(&self, part_num: u64) -> Result<(), RecoveryError> {
            self.parts.lock().insert(part_num);
            Ok(())
        }

        fn free_part(&self, part_num: u64) -> Result<(), RecoveryError> {
            self.parts.lock().remove(&part_num);
            Ok(())
        }

        fn alloc_page(&self, page_num: u64) -> Result<(), RecoveryError> {
            self.pages.lock().insert(page_num);
            Ok(())
        }

        fn free_page(&self, page_num: u64) -> Result<(), RecoveryError> {
            self.pages.lock().remove(&page_num);
            Ok(())
        }
    }
}
