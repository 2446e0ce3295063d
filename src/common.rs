//! Shared identifiers and small cross-cutting types used by both the lock
//! manager and the recovery manager.

use serde::{Deserialize, Serialize};

/// Unique identifier for a transaction.
pub type TransactionId = u64;

/// Monotonic log sequence number. LSN 0 is reserved for the master record.
pub type Lsn = u64;

/// The reserved LSN slot for the master record.
pub const MASTER_LSN: Lsn = 0;

/// Sentinel `lastLSN` value meaning "this transaction has not yet written
/// a log record".
pub const NO_LSN: Lsn = 0;

/// Lifecycle status of a transaction, as tracked by the recovery manager's
/// transaction table.
///
/// The variants are declared in their total-order rank (see [`TransactionStatus::rank`]);
/// status may only advance to an equal-or-higher rank. This is specified
/// explicitly via [`TransactionStatus::rank`] rather than relying on
/// `#[derive(PartialOrd)]` picking up declaration order by coincidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Running,
    Committing,
    Aborting,
    RecoveryAborting,
    Complete,
}

impl TransactionStatus {
    /// Explicit total order: `Running < Committing < Aborting < RecoveryAborting < Complete`.
    pub fn rank(self) -> u8 {
        match self {
            TransactionStatus::Running => 0,
            TransactionStatus::Committing => 1,
            TransactionStatus::Aborting => 2,
            TransactionStatus::RecoveryAborting => 3,
            TransactionStatus::Complete => 4,
        }
    }

    /// True iff moving from `self` to `next` does not go backwards in the
    /// status order. Equal statuses are allowed (a no-op transition).
    pub fn can_advance_to(self, next: TransactionStatus) -> bool {
        next.rank() >= self.rank()
    }
}

impl PartialOrd for TransactionStatus {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.rank().cmp(&other.rank()))
    }
}

impl Ord for TransactionStatus {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_order_is_explicit() {
        assert!(TransactionStatus::Running < TransactionStatus::Committing);
        assert!(TransactionStatus::Committing < TransactionStatus::Aborting);
        assert!(TransactionStatus::Aborting < TransactionStatus::RecoveryAborting);
        assert!(TransactionStatus::RecoveryAborting < TransactionStatus::Complete);
    }

    #[test]
    fn can_advance_to_rejects_regression() {
        assert!(TransactionStatus::Running.can_advance_to(TransactionStatus::Aborting));
        assert!(!TransactionStatus::Complete.can_advance_to(TransactionStatus::Running));
        assert!(TransactionStatus::Aborting.can_advance_to(TransactionStatus::Aborting));
    }
}
