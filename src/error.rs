//! Error taxonomy for both subsystems: the four flat-lock-manager error
//! kinds from the lock manager, and the log/recovery error kinds for the
//! ARIES manager. Structured fields + `#[error("...")]` messages, in the
//! style of a `thiserror`-derived domain error enum.

use thiserror::Error;

use crate::common::{Lsn, TransactionId};
use crate::lock::{LockMode, ResourceName};

pub type LockResult<T> = std::result::Result<T, LockError>;
pub type LogResult<T> = std::result::Result<T, LogError>;
pub type RecoveryResult<T> = std::result::Result<T, RecoveryError>;

/// Errors raised by the flat lock manager and the hierarchical lock context
/// built on top of it. Every precondition is checked before any mutation,
/// so these always describe a no-op attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("transaction {txn} already holds a {mode} lock on '{resource}'")]
    DuplicateLockRequest {
        txn: TransactionId,
        resource: ResourceName,
        mode: LockMode,
    },

    #[error("transaction {txn} holds no lock on '{resource}'")]
    NoLockHeld {
        txn: TransactionId,
        resource: ResourceName,
    },

    #[error("invalid lock request by transaction {txn} on '{resource}': {reason}")]
    InvalidLock {
        txn: TransactionId,
        resource: ResourceName,
        reason: String,
    },

    #[error("unsupported operation on read-only lock context '{resource}'")]
    UnsupportedOperation { resource: ResourceName },
}

impl LockError {
    pub fn duplicate(txn: TransactionId, resource: ResourceName, mode: LockMode) -> Self {
        LockError::DuplicateLockRequest { txn, resource, mode }
    }

    pub fn no_lock_held(txn: TransactionId, resource: ResourceName) -> Self {
        LockError::NoLockHeld { txn, resource }
    }

    pub fn invalid(txn: TransactionId, resource: ResourceName, reason: impl Into<String>) -> Self {
        LockError::InvalidLock { txn, resource, reason: reason.into() }
    }

    pub fn unsupported(resource: ResourceName) -> Self {
        LockError::UnsupportedOperation { resource }
    }

    pub fn resource(&self) -> &ResourceName {
        match self {
            LockError::DuplicateLockRequest { resource, .. }
            | LockError::NoLockHeld { resource, .. }
            | LockError::InvalidLock { resource, .. }
            | LockError::UnsupportedOperation { resource } => resource,
        }
    }
}

/// Errors from the on-disk log manager.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch on log page {page}")]
    ChecksumMismatch { page: u64 },

    #[error("corrupt log record at lsn {lsn}: {reason}")]
    CorruptRecord { lsn: Lsn, reason: String },

    #[error("log record serialization error: {0}")]
    Serialize(String),

    #[error("no log record at lsn {lsn}")]
    NotFound { lsn: Lsn },
}

/// Errors from the ARIES recovery manager, including its forward-processing
/// entry points and restart. Restart-time invariant violations are
/// program-fatal, not recoverable -- callers should treat `Fatal` as a
/// signal to abort the process.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("transaction {0} is not active")]
    UnknownTransaction(TransactionId),

    #[error("fatal recovery invariant violated: {0}")]
    Fatal(String),
}
