//! The flat (non-hierarchical) lock manager: per-resource grant lists and
//! FIFO wait queues, with the five atomic operations (`acquire`, `release`,
//! `acquire_and_release`, `promote`, and the queue-drain protocol shared by
//! all of them) serialized behind a single monitor.
//!
//! All error checks for an operation complete before any state mutation.
//! Plain `acquire` enqueues at the back of the wait queue; `acquire_and_release`
//! and `promote` enqueue at the front, since they represent a transaction
//! that already holds some stake in the resource and is asking to change it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::collab::TransactionContext;
use crate::common::TransactionId;
use crate::error::{LockError, LockResult};
use crate::lock::mode::LockMode;
use crate::lock::resource::ResourceName;

struct QueuedRequest {
    ctx: Arc<dyn TransactionContext>,
    mode: LockMode,
    /// Other resources to release, atomically, once this request is
    /// granted. Never contains the resource this request targets -- that
    /// exclusion is applied when the request is built.
    release_set: Vec<ResourceName>,
}

#[derive(Default)]
struct ResourceEntry {
    /// Lock holders, in acquisition order. In-place mode upgrades
    /// (`acquire_and_release`/`promote`) keep a transaction's existing slot
    /// rather than moving it to the back.
    granted: Vec<(TransactionId, LockMode)>,
    waiters: VecDeque<QueuedRequest>,
}

#[derive(Default)]
struct ManagerState {
    resources: HashMap<ResourceName, ResourceEntry>,
    /// Per-transaction list of (resource, mode) held, in acquisition order.
    txn_locks: HashMap<TransactionId, Vec<(ResourceName, LockMode)>>,
}

/// The flat lock manager. All public operations lock an internal monitor
/// for their whole duration except while a caller is parked waiting for a
/// grant.
#[derive(Default)]
pub struct LockManager {
    state: parking_lot::Mutex<ManagerState>,
}

fn is_compatible_with_granted(granted: &[(TransactionId, LockMode)], requester: TransactionId, mode: LockMode) -> bool {
    granted.iter().all(|(t, m)| *t == requester || LockMode::compatible(mode, *m))
}

fn grant_on_resource(state: &mut ManagerState, resource: &ResourceName, txn: TransactionId, mode: LockMode) {
    let entry = state.resources.entry(resource.clone()).or_default();
    if let Some(slot) = entry.granted.iter_mut().find(|(t, _)| *t == txn) {
        slot.1 = mode;
    } else {
        entry.granted.push((txn, mode));
    }
    let locks = state.txn_locks.entry(txn).or_default();
    if let Some(slot) = locks.iter_mut().find(|(n, _)| n == resource) {
        slot.1 = mode;
    } else {
        locks.push((resource.clone(), mode));
    }
    trace!(txn, %resource, %mode, "lock granted");
}

fn do_release(state: &mut ManagerState, resource: &ResourceName, txn: TransactionId) {
    if let Some(entry) = state.resources.get_mut(resource) {
        entry.granted.retain(|(t, _)| *t != txn);
    }
    if let Some(locks) = state.txn_locks.get_mut(&txn) {
        locks.retain(|(n, _)| n != resource);
    }
    trace!(txn, %resource, "lock released");
    drain_queue(state, resource);
}

fn drain_queue(state: &mut ManagerState, resource: &ResourceName) {
    loop {
        let grantable = match state.resources.get(resource) {
            Some(entry) => match entry.waiters.front() {
                Some(req) => is_compatible_with_granted(&entry.granted, req.ctx.trans_num(), req.mode),
                None => false,
            },
            None => false,
        };
        if !grantable {
            break;
        }
        let req = state.resources.get_mut(resource).unwrap().waiters.pop_front().unwrap();
        let txn = req.ctx.trans_num();
        grant_on_resource(state, resource, txn, req.mode);
        for other in &req.release_set {
            do_release(state, other, txn);
        }
        debug!(txn, %resource, mode = %req.mode, "queued lock request drained");
        req.ctx.unblock();
    }
    cleanup_if_empty(state, resource);
}

fn cleanup_if_empty(state: &mut ManagerState, resource: &ResourceName) {
    let empty = state
        .resources
        .get(resource)
        .map(|e| e.granted.is_empty() && e.waiters.is_empty())
        .unwrap_or(false);
    if empty {
        state.resources.remove(resource);
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `mode` on `resource` for the transaction behind `ctx`.
    /// Blocks (parking the caller's thread) if the lock cannot be granted
    /// immediately.
    pub fn acquire(&self, ctx: Arc<dyn TransactionContext>, resource: &ResourceName, mode: LockMode) -> LockResult<()> {
        let txn = ctx.trans_num();
        let mut state = self.state.lock();

        if let Some(entry) = state.resources.get(resource) {
            if entry.granted.iter().any(|(t, _)| *t == txn) {
                return Err(LockError::duplicate(txn, resource.clone(), mode));
            }
        }

        let entry = state.resources.entry(resource.clone()).or_default();
        let can_grant = entry.waiters.is_empty() && is_compatible_with_granted(&entry.granted, txn, mode);
        if can_grant {
            grant_on_resource(&mut state, resource, txn, mode);
            return Ok(());
        }

        state
            .resources
            .get_mut(resource)
            .unwrap()
            .waiters
            .push_back(QueuedRequest { ctx: ctx.clone(), mode, release_set: Vec::new() });
        ctx.prepare_block();
        drop(state);
        ctx.block();
        Ok(())
    }

    /// Releases the lock the transaction behind `ctx` holds on `resource`.
    pub fn release(&self, ctx: &Arc<dyn TransactionContext>, resource: &ResourceName) -> LockResult<()> {
        let txn = ctx.trans_num();
        let mut state = self.state.lock();
        let held = state.resources.get(resource).map(|e| e.granted.iter().any(|(t, _)| *t == txn)).unwrap_or(false);
        if !held {
            return Err(LockError::no_lock_held(txn, resource.clone()));
        }
        do_release(&mut state, resource, txn);
        Ok(())
    }

    /// Atomically acquires `mode` on `resource` and releases every resource
    /// in `release_set` (which may include `resource` itself, in which case
    /// that entry is a no-op superseded by the new acquisition). Enqueues
    /// at the *front* of `resource`'s wait queue if it cannot be granted
    /// immediately, and the immediate-grant check ignores whether the
    /// queue is already non-empty -- this operation is privileged relative
    /// to plain `acquire`.
    pub fn acquire_and_release(
        &self,
        ctx: Arc<dyn TransactionContext>,
        resource: &ResourceName,
        mode: LockMode,
        release_set: Vec<ResourceName>,
    ) -> LockResult<()> {
        let txn = ctx.trans_num();
        let mut state = self.state.lock();

        if let Some(entry) = state.resources.get(resource) {
            if entry.granted.iter().any(|(t, m)| *t == txn && *m == mode) {
                return Err(LockError::duplicate(txn, resource.clone(), mode));
            }
        }
        for name in &release_set {
            let held = state.txn_locks.get(&txn).map(|v| v.iter().any(|(n, _)| n == name)).unwrap_or(false);
            if !held {
                return Err(LockError::no_lock_held(txn, name.clone()));
            }
        }

        let filtered_release: Vec<ResourceName> = release_set.into_iter().filter(|n| n != resource).collect();

        let entry = state.resources.entry(resource.clone()).or_default();
        let can_grant = is_compatible_with_granted(&entry.granted, txn, mode);
        if can_grant {
            grant_on_resource(&mut state, resource, txn, mode);
            for other in &filtered_release {
                do_release(&mut state, other, txn);
            }
            cleanup_if_empty(&mut state, resource);
            return Ok(());
        }

        state.resources.get_mut(resource).unwrap().waiters.push_front(QueuedRequest {
            ctx: ctx.clone(),
            mode,
            release_set: filtered_release,
        });
        ctx.prepare_block();
        drop(state);
        ctx.block();
        Ok(())
    }

    /// Upgrades the transaction's existing lock on `resource` to `new_mode`.
    /// `new_mode` must be a genuine upgrade: not equal to, and not already
    /// implied by, the currently held mode.
    pub fn promote(&self, ctx: Arc<dyn TransactionContext>, resource: &ResourceName, new_mode: LockMode) -> LockResult<()> {
        let txn = ctx.trans_num();
        let mut state = self.state.lock();

        let held = state
            .resources
            .get(resource)
            .and_then(|e| e.granted.iter().find(|(t, _)| *t == txn).map(|(_, m)| *m));
        let held = match held {
            None => return Err(LockError::no_lock_held(txn, resource.clone())),
            Some(m) => m,
        };
        if held == new_mode {
            return Err(LockError::duplicate(txn, resource.clone(), new_mode));
        }
        if !LockMode::substitutable(held, new_mode) {
            return Err(LockError::invalid(txn, resource.clone(), "requested mode is not a promotion of the held mode"));
        }

        let entry = state.resources.get(resource).unwrap();
        let can_grant = is_compatible_with_granted(&entry.granted, txn, new_mode);
        if can_grant {
            grant_on_resource(&mut state, resource, txn, new_mode);
            return Ok(());
        }

        state
            .resources
            .get_mut(resource)
            .unwrap()
            .waiters
            .push_front(QueuedRequest { ctx: ctx.clone(), mode: new_mode, release_set: Vec::new() });
        ctx.prepare_block();
        drop(state);
        ctx.block();
        Ok(())
    }

    /// The mode the given transaction explicitly holds on `resource`, if any.
    pub fn mode_held_by(&self, txn: TransactionId, resource: &ResourceName) -> Option<LockMode> {
        let state = self.state.lock();
        state.resources.get(resource).and_then(|e| e.granted.iter().find(|(t, _)| *t == txn).map(|(_, m)| *m))
    }

    /// All current holders of `resource`, in acquisition order.
    pub fn holders(&self, resource: &ResourceName) -> Vec<(TransactionId, LockMode)> {
        let state = self.state.lock();
        state.resources.get(resource).map(|e| e.granted.clone()).unwrap_or_default()
    }

    /// The number of requests currently queued on `resource`.
    pub fn queue_len(&self, resource: &ResourceName) -> usize {
        let state = self.state.lock();
        state.resources.get(resource).map(|e| e.waiters.len()).unwrap_or(0)
    }

    /// Every (resource, mode) pair currently held by `txn`, in acquisition
    /// order.
    pub fn locks_held_by(&self, txn: TransactionId) -> Vec<(ResourceName, LockMode)> {
        let state = self.state.lock();
        state.txn_locks.get(&txn).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::testing::ThreadParkContext;

    fn ctx(id: TransactionId) -> Arc<dyn TransactionContext> {
        ThreadParkContext::new(id)
    }

    #[test]
    fn duplicate_request_errors() {
        let lm = LockManager::new();
        let r = ResourceName::root("db");
        lm.acquire(ctx(1), &r, LockMode::S).unwrap();
        let err = lm.acquire(ctx(1), &r, LockMode::S).unwrap_err();
        assert!(matches!(err, LockError::DuplicateLockRequest { .. }));
    }

    #[test]
    fn release_without_holding_errors() {
        let lm = LockManager::new();
        let r = ResourceName::root("db");
        let c = ctx(1);
        let err = lm.release(&c, &r).unwrap_err();
        assert!(matches!(err, LockError::NoLockHeld { .. }));
    }

    #[test]
    fn fifo_queue_drains_in_order() {
        let lm = Arc::new(LockManager::new());
        let r = ResourceName::root("db");
        lm.acquire(ctx(1), &r, LockMode::X).unwrap();

        let lm2 = lm.clone();
        let r2 = r.clone();
        let waiter2_ctx = ctx(2);
        let waiter2_ctx_clone = waiter2_ctx.clone();
        let h2 = std::thread::spawn(move || lm2.acquire(waiter2_ctx_clone, &r2, LockMode::S).unwrap());

        // Give the second thread time to enqueue before releasing.
        std::thread::sleep(std::time::Duration::from_millis(20));

        let release_ctx = ctx(1);
        lm.release(&release_ctx, &r).unwrap();
        h2.join().unwrap();
        assert_eq!(lm.holders(&r), vec![(2, LockMode::S)]);
    }

    #[test]
    fn promote_rejects_non_upgrade() {
        let lm = LockManager::new();
        let r = ResourceName::root("db");
        lm.acquire(ctx(1), &r, LockMode::X).unwrap();
        let err = lm.promote(ctx(1), &r, LockMode::S).unwrap_err();
        assert!(matches!(err, LockError::InvalidLock { .. }));
    }

    #[test]
    fn promote_in_place_preserves_granted_slot() {
        let lm = LockManager::new();
        let r = ResourceName::root("db");
        lm.acquire(ctx(1), &r, LockMode::IS).unwrap();
        lm.promote(ctx(1), &r, LockMode::IX).unwrap();
        assert_eq!(lm.holders(&r), vec![(1, LockMode::IX)]);
    }

    #[test]
    fn acquire_and_release_swaps_modes() {
        let lm = LockManager::new();
        let a = ResourceName::root("a");
        lm.acquire(ctx(1), &a, LockMode::S).unwrap();
        lm.acquire_and_release(ctx(1), &a, LockMode::X, vec![a.clone()]).unwrap();
        assert_eq!(lm.holders(&a), vec![(1, LockMode::X)]);
    }
}
