//! Log record shapes, their undo/redo semantics, and the fixed-format byte
//! image used to persist them: a `u8` type tag followed by a `bincode`
//! encoding of the record body. The type tag lets a page scan sanity-check
//! a decoded record without trusting its own self-reported shape.

use serde::{Deserialize, Serialize};

use crate::common::{Lsn, TransactionId, TransactionStatus};
use crate::error::{LogError, LogResult, RecoveryError};
use crate::collab::{BufferManager, DiskSpaceManager};

/// A single write-ahead log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    /// The fixed LSN-0 record pointing at the most recent checkpoint.
    Master { flushed_lsn: Lsn },
    BeginCheckpoint,
    EndCheckpoint {
        dirty_page_table: Vec<(u64, Lsn)>,
        transaction_table: Vec<(TransactionId, TransactionStatus, Lsn)>,
    },
    Commit { txn_id: TransactionId, prev_lsn: Lsn },
    Abort { txn_id: TransactionId, prev_lsn: Lsn },
    End { txn_id: TransactionId, prev_lsn: Lsn },

    AllocPart { txn_id: TransactionId, prev_lsn: Lsn, part_num: u64 },
    UndoAllocPart { txn_id: TransactionId, prev_lsn: Lsn, part_num: u64, undo_next_lsn: Lsn },
    FreePart { txn_id: TransactionId, prev_lsn: Lsn, part_num: u64 },
    UndoFreePart { txn_id: TransactionId, prev_lsn: Lsn, part_num: u64, undo_next_lsn: Lsn },

    AllocPage { txn_id: TransactionId, prev_lsn: Lsn, page_num: u64 },
    UndoAllocPage { txn_id: TransactionId, prev_lsn: Lsn, page_num: u64, undo_next_lsn: Lsn },
    FreePage { txn_id: TransactionId, prev_lsn: Lsn, page_num: u64 },
    UndoFreePage { txn_id: TransactionId, prev_lsn: Lsn, page_num: u64, undo_next_lsn: Lsn },

    UpdatePage {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        page_num: u64,
        offset: u16,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    /// A compensation log record: the physical undo of an `UpdatePage`.
    /// Redoable (idempotent re-application of the before-image) but never
    /// itself undone.
    UndoUpdatePage {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        page_num: u64,
        offset: u16,
        before: Vec<u8>,
        undo_next_lsn: Lsn,
    },
}

impl LogRecord {
    fn tag(&self) -> u8 {
        use LogRecord::*;
        match self {
            Master { .. } => 0,
            BeginCheckpoint => 1,
            EndCheckpoint { .. } => 2,
            Commit { .. } => 3,
            Abort { .. } => 4,
            End { .. } => 5,
            AllocPart { .. } => 6,
            UndoAllocPart { .. } => 7,
            FreePart { .. } => 8,
            UndoFreePart { .. } => 9,
            AllocPage { .. } => 10,
            UndoAllocPage { .. } => 11,
            FreePage { .. } => 12,
            UndoFreePage { .. } => 13,
            UpdatePage { .. } => 14,
            UndoUpdatePage { .. } => 15,
        }
    }

    pub fn txn_id(&self) -> Option<TransactionId> {
        use LogRecord::*;
        match self {
            Master { .. } | BeginCheckpoint | EndCheckpoint { .. } => None,
            Commit { txn_id, .. }
            | Abort { txn_id, .. }
            | End { txn_id, .. }
            | AllocPart { txn_id, .. }
            | UndoAllocPart { txn_id, .. }
            | FreePart { txn_id, .. }
            | UndoFreePart { txn_id, .. }
            | AllocPage { txn_id, .. }
            | UndoAllocPage { txn_id, .. }
            | FreePage { txn_id, .. }
            | UndoFreePage { txn_id, .. }
            | UpdatePage { txn_id, .. }
            | UndoUpdatePage { txn_id, .. } => Some(*txn_id),
        }
    }

    pub fn prev_lsn(&self) -> Option<Lsn> {
        use LogRecord::*;
        match self {
            Master { .. } | BeginCheckpoint | EndCheckpoint { .. } => None,
            Commit { prev_lsn, .. }
            | Abort { prev_lsn, .. }
            | End { prev_lsn, .. }
            | AllocPart { prev_lsn, .. }
            | UndoAllocPart { prev_lsn, .. }
            | FreePart { prev_lsn, .. }
            | UndoFreePart { prev_lsn, .. }
            | AllocPage { prev_lsn, .. }
            | UndoAllocPage { prev_lsn, .. }
            | FreePage { prev_lsn, .. }
            | UndoFreePage { prev_lsn, .. }
            | UpdatePage { prev_lsn, .. }
            | UndoUpdatePage { prev_lsn, .. } => Some(*prev_lsn),
        }
    }

    /// The LSN the undo pass should continue from after processing this
    /// record, for records that carry one (the CLRs).
    pub fn undo_next_lsn(&self) -> Option<Lsn> {
        use LogRecord::*;
        match self {
            UndoAllocPart { undo_next_lsn, .. }
            | UndoFreePart { undo_next_lsn, .. }
            | UndoAllocPage { undo_next_lsn, .. }
            | UndoFreePage { undo_next_lsn, .. }
            | UndoUpdatePage { undo_next_lsn, .. } => Some(*undo_next_lsn),
            _ => None,
        }
    }

    pub fn is_redoable(&self) -> bool {
        use LogRecord::*;
        matches!(
            self,
            AllocPart { .. }
                | UndoAllocPart { .. }
                | FreePart { .. }
                | UndoFreePart { .. }
                | AllocPage { .. }
                | UndoAllocPage { .. }
                | FreePage { .. }
                | UndoFreePage { .. }
                | UpdatePage { .. }
                | UndoUpdatePage { .. }
        )
    }

    pub fn is_undoable(&self) -> bool {
        use LogRecord::*;
        matches!(self, AllocPart { .. } | FreePart { .. } | AllocPage { .. } | FreePage { .. } | UpdatePage { .. })
    }

    /// Builds the compensation log record for this record, chained from
    /// `new_prev_lsn` (the undoing transaction's current `lastLSN`).
    /// Returns `None` for records that are not undoable.
    pub fn undo(&self, new_prev_lsn: Lsn) -> Option<LogRecord> {
        use LogRecord::*;
        match self {
            AllocPart { txn_id, prev_lsn, part_num } => Some(UndoAllocPart {
                txn_id: *txn_id,
                prev_lsn: new_prev_lsn,
                part_num: *part_num,
                undo_next_lsn: *prev_lsn,
            }),
            FreePart { txn_id, prev_lsn, part_num } => Some(UndoFreePart {
                txn_id: *txn_id,
                prev_lsn: new_prev_lsn,
                part_num: *part_num,
                undo_next_lsn: *prev_lsn,
            }),
            AllocPage { txn_id, prev_lsn, page_num } => Some(UndoAllocPage {
                txn_id: *txn_id,
                prev_lsn: new_prev_lsn,
                page_num: *page_num,
                undo_next_lsn: *prev_lsn,
            }),
            FreePage { txn_id, prev_lsn, page_num } => Some(UndoFreePage {
                txn_id: *txn_id,
                prev_lsn: new_prev_lsn,
                page_num: *page_num,
                undo_next_lsn: *prev_lsn,
            }),
            UpdatePage { txn_id, prev_lsn, page_num, offset, before, .. } => Some(UndoUpdatePage {
                txn_id: *txn_id,
                prev_lsn: new_prev_lsn,
                page_num: *page_num,
                offset: *offset,
                before: before.clone(),
                undo_next_lsn: *prev_lsn,
            }),
            _ => None,
        }
    }

    /// Physically reapplies this record's effect, using `self_lsn` (this
    /// record's own LSN) to decide idempotency for page writes: a page
    /// already at or past `self_lsn` is left untouched.
    pub fn redo(
        &self,
        self_lsn: Lsn,
        disk: &dyn DiskSpaceManager,
        buf: &dyn BufferManager,
    ) -> Result<(), RecoveryError> {
        use LogRecord::*;
        match self {
            AllocPart { part_num, .. } => disk.alloc_part(*part_num),
            UndoAllocPart { part_num, .. } => disk.free_part(*part_num),
            FreePart { part_num, .. } => disk.free_part(*part_num),
            UndoFreePart { part_num, .. } => disk.alloc_part(*part_num),
            AllocPage { page_num, .. } => disk.alloc_page(*page_num),
            UndoFreePage { page_num, .. } => disk.alloc_page(*page_num),
            UndoAllocPage { page_num, .. } => {
                let page = buf.fetch_page(*page_num)?;
                if page.page_lsn() < self_lsn {
                    disk.free_page(*page_num)?;
                    page.set_page_lsn(self_lsn);
                }
                page.unpin();
                Ok(())
            }
            FreePage { page_num, .. } => {
                let page = buf.fetch_page(*page_num)?;
                if page.page_lsn() < self_lsn {
                    disk.free_page(*page_num)?;
                    page.set_page_lsn(self_lsn);
                }
                page.unpin();
                Ok(())
            }
            UpdatePage { page_num, offset, after, .. } => {
                let page = buf.fetch_page(*page_num)?;
                if page.page_lsn() < self_lsn {
                    page.write(*offset as usize, after);
                    page.set_page_lsn(self_lsn);
                }
                page.unpin();
                Ok(())
            }
            UndoUpdatePage { page_num, offset, before, .. } => {
                let page = buf.fetch_page(*page_num)?;
                if page.page_lsn() < self_lsn {
                    page.write(*offset as usize, before);
                    page.set_page_lsn(self_lsn);
                }
                page.unpin();
                Ok(())
            }
            Master { .. } | BeginCheckpoint | EndCheckpoint { .. } | Commit { .. } | Abort { .. } | End { .. } => Ok(()),
        }
    }

    /// Rough per-entry byte estimate used to decide whether a checkpoint's
    /// dirty page table and transaction table both fit in one `EndCheckpoint`
    /// record, or must be split across several consecutive ones.
    pub fn fits_in_one_record(dpt_len: usize, txn_table_len: usize, effective_page_size: usize) -> bool {
        const DPT_ENTRY_SIZE: usize = 16;
        const TXN_ENTRY_SIZE: usize = 24;
        const HEADER: usize = 16;
        HEADER + dpt_len * DPT_ENTRY_SIZE + txn_table_len * TXN_ENTRY_SIZE <= effective_page_size
    }

    /// Serializes this record to its fixed-format byte image: a type tag
    /// followed by the `bincode` encoding of the body.
    pub fn encode(&self) -> LogResult<Vec<u8>> {
        let mut buf = vec![self.tag()];
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| LogError::Serialize(e.to_string()))?;
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Parses a record previously produced by [`LogRecord::encode`].
    pub fn decode(bytes: &[u8]) -> LogResult<LogRecord> {
        if bytes.is_empty() {
            return Err(LogError::CorruptRecord { lsn: 0, reason: "empty record body".into() });
        }
        let tag = bytes[0];
        let (record, _): (LogRecord, usize) =
            bincode::serde::decode_from_slice(&bytes[1..], bincode::config::standard())
                .map_err(|e| LogError::Serialize(e.to_string()))?;
        if record.tag() != tag {
            return Err(LogError::CorruptRecord { lsn: 0, reason: "type tag does not match decoded record".into() });
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let rec = LogRecord::UpdatePage {
            txn_id: 1,
            prev_lsn: 10,
            page_num: 7,
            offset: 4,
            before: vec![1, 2, 3],
            after: vec![4, 5, 6],
        };
        let bytes = rec.encode().unwrap();
        let decoded = LogRecord::decode(&bytes).unwrap();
        assert_eq!(rec, decoded);
    }

    #[test]
    fn undo_produces_clr_with_before_image() {
        let rec = LogRecord::UpdatePage {
            txn_id: 1,
            prev_lsn: 10,
            page_num: 7,
            offset: 4,
            before: vec![1, 2, 3],
            after: vec![4, 5, 6],
        };
        let clr = rec.undo(99).unwrap();
        match clr {
            LogRecord::UndoUpdatePage { prev_lsn, before, undo_next_lsn, .. } => {
                assert_eq!(prev_lsn, 99);
                assert_eq!(before, vec![1, 2, 3]);
                assert_eq!(undo_next_lsn, 10);
            }
            _ => panic!("expected UndoUpdatePage"),
        }
    }

    #[test]
    fn clrs_are_redoable_not_undoable() {
        let clr = LogRecord::UndoUpdatePage {
            txn_id: 1,
            prev_lsn: 0,
            page_num: 1,
            offset: 0,
            before: vec![],
            undo_next_lsn: 0,
        };
        assert!(clr.is_redoable());
        assert!(!clr.is_undoable());
    }

    #[test]
    fn checkpoint_splitting_estimate() {
        assert!(LogRecord::fits_in_one_record(1, 1, 4096));
        assert!(!LogRecord::fits_in_one_record(10_000, 10_000, 4096));
    }
}
