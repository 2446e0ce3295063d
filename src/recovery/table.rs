//! In-memory recovery bookkeeping: the dirty page table (page -> recLSN)
//! and the transaction table (active transaction handles, their lastLSN,
//! and their savepoints).

use std::collections::HashMap;
use std::sync::Arc;

use crate::collab::TransactionContext;
use crate::common::{Lsn, TransactionId};

pub struct TransactionTableEntry {
    pub ctx: Arc<dyn TransactionContext>,
    pub last_lsn: Lsn,
    pub savepoints: HashMap<String, Lsn>,
}

#[derive(Default)]
pub struct TransactionTable {
    entries: HashMap<TransactionId, TransactionTableEntry>,
}

impl TransactionTable {
    pub fn get(&self, txn: TransactionId) -> Option<&TransactionTableEntry> {
        self.entries.get(&txn)
    }

    pub fn get_mut(&mut self, txn: TransactionId) -> Option<&mut TransactionTableEntry> {
        self.entries.get_mut(&txn)
    }

    pub fn insert(&mut self, txn: TransactionId, entry: TransactionTableEntry) {
        self.entries.insert(txn, entry);
    }

    pub fn remove(&mut self, txn: TransactionId) -> Option<TransactionTableEntry> {
        self.entries.remove(&txn)
    }

    pub fn contains(&self, txn: TransactionId) -> bool {
        self.entries.contains_key(&txn)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TransactionId, &TransactionTableEntry)> {
        self.entries.iter()
    }

    pub fn snapshot(&self) -> Vec<(TransactionId, crate::common::TransactionStatus, Lsn)> {
        self.entries.iter().map(|(id, e)| (*id, e.ctx.status(), e.last_lsn)).collect()
    }
}

/// Tracks, per dirty page, the LSN of the earliest log record that could
/// have dirtied it (`recLSN`) -- the point redo must start scanning from
/// for that page.
#[derive(Default)]
pub struct DirtyPageTable {
    entries: HashMap<u64, Lsn>,
}

impl DirtyPageTable {
    /// Records that `page_num` was dirtied by the record at `lsn`, if it
    /// is not already tracked (the first dirtying LSN is the one that
    /// matters).
    pub fn touch(&mut self, page_num: u64, lsn: Lsn) {
        self.entries.entry(page_num).or_insert(lsn);
    }

    pub fn remove(&mut self, page_num: u64) {
        self.entries.remove(&page_num);
    }

    pub fn get(&self, page_num: u64) -> Option<&Lsn> {
        self.entries.get(&page_num)
    }

    pub fn contains(&self, page_num: u64) -> bool {
        self.entries.contains_key(&page_num)
    }

    pub fn snapshot(&self) -> Vec<(u64, Lsn)> {
        self.entries.iter().map(|(p, l)| (*p, *l)).collect()
    }

    /// The earliest recLSN across all dirty pages -- where redo must begin.
    pub fn min_rec_lsn(&self) -> Option<Lsn> {
        self.entries.values().min().copied()
    }

    /// Drops every entry whose page `is_dirty` reports false, per the
    /// post-redo DPT pruning step.
    pub fn retain_dirty(&mut self, is_dirty: impl Fn(u64) -> bool) {
        self.entries.retain(|page_num, _| is_dirty(*page_num));
    }
}
