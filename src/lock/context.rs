//! The hierarchical lock context tree built on top of the flat
//! [`LockManager`]. A `LockContext` wraps one resource name, knows its
//! parent, lazily fabricates child contexts, and maintains a per-transaction
//! count of descendant locks used to forbid releasing a node out from under
//! locks still held beneath it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::collab::TransactionContext;
use crate::common::TransactionId;
use crate::error::{LockError, LockResult};
use crate::lock::manager::LockManager;
use crate::lock::mode::LockMode;
use crate::lock::resource::ResourceName;

/// One node of the hierarchical lock context tree.
pub struct LockContext {
    manager: Arc<LockManager>,
    parent: Option<Arc<LockContext>>,
    name: ResourceName,
    readonly: AtomicBool,
    child_locks_disabled: AtomicBool,
    children: Mutex<HashMap<String, Arc<LockContext>>>,
    /// Number of locks each transaction holds on strict descendants of
    /// this node. Guards `release`: a node cannot be released while this
    /// is nonzero for the releasing transaction.
    child_lock_count: DashMap<TransactionId, i64>,
}

impl LockContext {
    /// Creates a fresh root context (no parent) over `name`, backed by
    /// `manager`. Callers own the returned `Arc` and share it across
    /// threads/transactions that touch this resource tree.
    pub fn root(manager: Arc<LockManager>, name: impl Into<String>) -> Arc<LockContext> {
        Arc::new(LockContext {
            manager,
            parent: None,
            name: ResourceName::root(name),
            readonly: AtomicBool::new(false),
            child_locks_disabled: AtomicBool::new(false),
            children: Mutex::new(HashMap::new()),
            child_lock_count: DashMap::new(),
        })
    }

    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    pub fn parent(self: &Arc<Self>) -> Option<Arc<LockContext>> {
        self.parent.clone()
    }

    /// The child context for `segment`, fabricating and caching it on first
    /// access. A new child inherits `readonly` from whether *this* node has
    /// disabled further child locking, not from this node's own `readonly`.
    pub fn child(self: &Arc<Self>, segment: &str) -> Arc<LockContext> {
        let mut children = self.children.lock();
        if let Some(existing) = children.get(segment) {
            return existing.clone();
        }
        let node = Arc::new(LockContext {
            manager: self.manager.clone(),
            parent: Some(self.clone()),
            name: self.name.child(segment),
            readonly: AtomicBool::new(self.child_locks_disabled.load(Ordering::SeqCst)),
            child_locks_disabled: AtomicBool::new(false),
            children: Mutex::new(HashMap::new()),
            child_lock_count: DashMap::new(),
        });
        children.insert(segment.to_string(), node.clone());
        node
    }

    /// Forbids any further lock acquisition directly on *future* children
    /// fabricated from this node (existing children are unaffected).
    pub fn disable_child_locks(&self) {
        self.child_locks_disabled.store(true, Ordering::SeqCst);
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::SeqCst)
    }

    /// The effective lock mode `txn` holds at this node: its explicit lock
    /// if any, else derived from the nearest ancestor holding S/X (implies
    /// the same here) or SIX (implies S here); an ancestor holding only an
    /// intent mode implies nothing here.
    pub fn effective_lock_type(self: &Arc<Self>, txn: TransactionId) -> LockMode {
        if let Some(m) = self.manager.mode_held_by(txn, &self.name) {
            return m;
        }
        match &self.parent {
            None => LockMode::NL,
            Some(parent) => match parent.effective_lock_type(txn) {
                pm @ (LockMode::S | LockMode::X) => pm,
                LockMode::SIX => LockMode::S,
                LockMode::IS | LockMode::IX | LockMode::NL => LockMode::NL,
            },
        }
    }

    fn ancestor_holds_six(self: &Arc<Self>, txn: TransactionId) -> bool {
        let mut cur = self.parent.clone();
        while let Some(node) = cur {
            if node.manager.mode_held_by(txn, &node.name) == Some(LockMode::SIX) {
                return true;
            }
            cur = node.parent.clone();
        }
        false
    }

    fn increment_ancestors(self: &Arc<Self>, txn: TransactionId) {
        let mut cur = self.parent.clone();
        while let Some(node) = cur {
            *node.child_lock_count.entry(txn).or_insert(0) += 1;
            cur = node.parent.clone();
        }
    }

    fn decrement_ancestors(self: &Arc<Self>, txn: TransactionId) {
        let mut cur = self.parent.clone();
        while let Some(node) = cur {
            if let Some(mut count) = node.child_lock_count.get_mut(&txn) {
                *count -= 1;
            }
            cur = node.parent.clone();
        }
    }

    /// All descendants (at any depth) on which `txn` holds an explicit
    /// lock, paired with that mode. Only nodes already fabricated in the
    /// tree are visited, which is exactly the set that can hold a lock --
    /// every acquisition on a descendant goes through `child()` first.
    fn descendants_with_locks(self: &Arc<Self>, txn: TransactionId) -> Vec<(Arc<LockContext>, LockMode)> {
        let mut out = Vec::new();
        let children: Vec<Arc<LockContext>> = self.children.lock().values().cloned().collect();
        for child in children {
            if let Some(m) = self.manager.mode_held_by(txn, &child.name) {
                out.push((child.clone(), m));
            }
            out.extend(child.descendants_with_locks(txn));
        }
        out
    }

    /// Acquires `mode` on this node for `txn`. The parent must already hold
    /// a mode compatible with granting `mode` here (`canBeParentLock`).
    pub fn acquire(self: &Arc<Self>, ctx: Arc<dyn TransactionContext>, mode: LockMode) -> LockResult<()> {
        if self.is_readonly() {
            return Err(LockError::unsupported(self.name.clone()));
        }
        let txn = ctx.trans_num();
        if let Some(parent) = &self.parent {
            let parent_mode = parent.effective_lock_type(txn);
            if !LockMode::can_be_parent_lock(parent_mode, mode) {
                return Err(LockError::invalid(txn, self.name.clone(), "parent lock does not permit this request"));
            }
        }
        self.manager.acquire(ctx, &self.name, mode)?;
        self.increment_ancestors(txn);
        debug!(txn, resource = %self.name, %mode, "context acquire");
        Ok(())
    }

    /// Releases the explicit lock `txn` holds at this node. Fails if `txn`
    /// still holds locks on any descendant of this node.
    pub fn release(self: &Arc<Self>, ctx: Arc<dyn TransactionContext>) -> LockResult<()> {
        if self.is_readonly() {
            return Err(LockError::unsupported(self.name.clone()));
        }
        let txn = ctx.trans_num();
        let dangling = self.child_lock_count.get(&txn).map(|c| *c > 0).unwrap_or(false);
        if dangling {
            return Err(LockError::invalid(txn, self.name.clone(), "transaction still holds locks on descendants"));
        }
        self.manager.release(&ctx, &self.name)?;
        self.decrement_ancestors(txn);
        debug!(txn, resource = %self.name, "context release");
        Ok(())
    }

    /// Upgrades `txn`'s explicit lock at this node to `new_mode`. An
    /// implicit `S -> IX` request is rewritten to `S -> SIX`, matching the
    /// usual multigranularity shortcut. Promoting to `SIX` releases every
    /// descendant `S`/`IS` lock `txn` holds in one atomic step.
    pub fn promote(self: &Arc<Self>, ctx: Arc<dyn TransactionContext>, new_mode: LockMode) -> LockResult<()> {
        if self.is_readonly() {
            return Err(LockError::unsupported(self.name.clone()));
        }
        let txn = ctx.trans_num();
        let held = self.manager.mode_held_by(txn, &self.name).ok_or_else(|| LockError::no_lock_held(txn, self.name.clone()))?;

        let new_mode = if held == LockMode::S && new_mode == LockMode::IX { LockMode::SIX } else { new_mode };

        if held == new_mode {
            return Err(LockError::duplicate(txn, self.name.clone(), new_mode));
        }
        if matches!(new_mode, LockMode::S | LockMode::IS | LockMode::SIX) && self.ancestor_holds_six(txn) {
            return Err(LockError::invalid(txn, self.name.clone(), "redundant under an ancestor already holding SIX"));
        }
        if !LockMode::substitutable(held, new_mode) {
            return Err(LockError::invalid(txn, self.name.clone(), "requested mode is not a promotion of the held mode"));
        }
        if new_mode == LockMode::SIX && !matches!(held, LockMode::IS | LockMode::IX | LockMode::S) {
            return Err(LockError::invalid(txn, self.name.clone(), "SIX is only reachable from IS, IX, or S"));
        }
        if let Some(parent) = &self.parent {
            let parent_mode = parent.effective_lock_type(txn);
            if !LockMode::can_be_parent_lock(parent_mode, new_mode) {
                return Err(LockError::invalid(txn, self.name.clone(), "parent lock does not permit this promotion"));
            }
        }

        if new_mode == LockMode::SIX {
            let sis = self.descendants_with_locks(txn);
            let sis: Vec<_> = sis.into_iter().filter(|(_, m)| matches!(m, LockMode::S | LockMode::IS)).collect();
            let release_set: Vec<ResourceName> = sis.iter().map(|(n, _)| n.name.clone()).collect();
            self.manager.acquire_and_release(ctx, &self.name, LockMode::SIX, release_set)?;
            for (node, _) in &sis {
                node.decrement_ancestors(txn);
            }
            debug!(txn, resource = %self.name, "promoted to SIX, released descendant S/IS locks");
            return Ok(());
        }

        self.manager.promote(ctx, &self.name, new_mode)?;
        debug!(txn, resource = %self.name, %new_mode, "context promote");
        Ok(())
    }

    /// Escalates `txn`'s locks at and beneath this node to a single lock
    /// held here: `X` if this node or any descendant is held in `IX`,
    /// `SIX`, or `X`; `S` otherwise. A no-op if the node is already held in
    /// the target mode.
    pub fn escalate(self: &Arc<Self>, ctx: Arc<dyn TransactionContext>) -> LockResult<()> {
        if self.is_readonly() {
            return Err(LockError::unsupported(self.name.clone()));
        }
        let txn = ctx.trans_num();
        let held_self = self.manager.mode_held_by(txn, &self.name);
        let held_self_mode = held_self.unwrap_or(LockMode::NL);
        let descendants = self.descendants_with_locks(txn);

        let needs_x = matches!(held_self_mode, LockMode::IX | LockMode::SIX | LockMode::X)
            || descendants.iter().any(|(_, m)| matches!(m, LockMode::IX | LockMode::SIX | LockMode::X));
        let new_mode = if needs_x { LockMode::X } else { LockMode::S };

        if held_self_mode == new_mode {
            return Ok(());
        }

        let mut release_set: Vec<ResourceName> = Vec::with_capacity(descendants.len() + 1);
        if held_self.is_some() {
            release_set.push(self.name.clone());
        }
        release_set.extend(descendants.iter().map(|(n, _)| n.name.clone()));

        self.manager.acquire_and_release(ctx, &self.name, new_mode, release_set)?;

        for (node, _) in &descendants {
            node.decrement_ancestors(txn);
        }
        if held_self.is_none() {
            self.increment_ancestors(txn);
        }
        self.child_lock_count.insert(txn, 0);
        debug!(txn, resource = %self.name, %new_mode, "escalated");
        Ok(())
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
    fn six_promotion_releases_descendants_and_updates_counters() {
        let manager = Arc::new(LockManager::new());
        let db = LockContext::root(manager, "db");
        let table = db.child("table");
        let page1 = table.child("page1");
        let page2 = table.child("page2");

        let c = ctx(1);
        db.acquire(c.clone(), LockMode::IS).unwrap();
        table.acquire(c.clone(), LockMode::IS).unwrap();
        page1.acquire(c.clone(), LockMode::S).unwrap();
        page2.acquire(c.clone(), LockMode::S).unwrap();

        assert_eq!(*db.child_lock_count.get(&1).unwrap(), 3);
        assert_eq!(*table.child_lock_count.get(&1).unwrap(), 2);

        table.promote(c.clone(), LockMode::SIX).unwrap();

        assert_eq!(table.manager.mode_held_by(1, table.name()), Some(LockMode::SIX));
        assert!(table.manager.mode_held_by(1, page1.name()).is_none());
        assert!(table.manager.mode_held_by(1, page2.name()).is_none());
        assert_eq!(*db.child_lock_count.get(&1).unwrap(), 1);
        assert_eq!(*table.child_lock_count.get(&1).unwrap(), 0);
    }

    #[test]
    fn escalate_to_x_when_descendant_holds_x() {
        let manager = Arc::new(LockManager::new());
        let db = LockContext::root(manager, "db");
        let table = db.child("table");
        let page1 = table.child("page1");
        let page2 = table.child("page2");

        let c = ctx(1);
        table.acquire(c.clone(), LockMode::IX).unwrap();
        page1.acquire(c.clone(), LockMode::S).unwrap();
        page2.acquire(c.clone(), LockMode::X).unwrap();

        table.escalate(c.clone()).unwrap();

        assert_eq!(table.manager.mode_held_by(1, table.name()), Some(LockMode::X));
        assert!(table.manager.mode_held_by(1, page1.name()).is_none());
        assert!(table.manager.mode_held_by(1, page2.name()).is_none());
        assert_eq!(*table.child_lock_count.get(&1).unwrap(), 0);
    }

    #[test]
    fn release_with_dangling_child_lock_fails() {
        let manager = Arc::new(LockManager::new());
        let db = LockContext::root(manager, "db");
        let table = db.child("table");
        let page1 = table.child("page1");

        let c = ctx(1);
        table.acquire(c.clone(), LockMode::IS).unwrap();
        page1.acquire(c.clone(), LockMode::S).unwrap();

        let err = table.release(c.clone()).unwrap_err();
        assert!(matches!(err, LockError::InvalidLock { .. }));
    }

    #[test]
    fn child_inherits_readonly_from_disabled_parent() {
        let manager = Arc::new(LockManager::new());
        let db = LockContext::root(manager, "db");
        db.disable_child_locks();
        let table = db.child("table");
        assert!(table.is_readonly());
    }
}
