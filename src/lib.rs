// ariesdb - transactional concurrency control and crash recovery core
// Lock manager module + ARIES recovery module

//! Multigranularity locking and ARIES-style crash recovery, the two pieces
//! a page-structured storage engine layers transaction isolation and
//! durability on top of.
//!
//! | Module | Responsibility |
//! |---|---|
//! | [`lock`] | Hierarchical multigranularity lock manager |
//! | [`log`] | Write-ahead log records and the paged on-disk log |
//! | [`recovery`] | Dirty page / transaction tables and the ARIES recovery manager |
//! | [`collab`] | Contracts for the buffer manager, disk space manager, and transaction context this crate is handed rather than owning |
//! | [`common`] | Shared identifiers: transaction IDs, LSNs, transaction status |
//! | [`error`] | Error taxonomy for both subsystems |

pub mod collab;
pub mod common;
pub mod error;
pub mod lock;
pub mod log;
pub mod recovery;

pub use collab::{BufferManager, DiskSpaceManager, Page, TransactionContext};
pub use common::{Lsn, TransactionId, TransactionStatus, MASTER_LSN, NO_LSN};
pub use error::{LockError, LockResult, LogError, LogResult, RecoveryError, RecoveryResult};
pub use lock::{LockContext, LockManager, LockMode, ResourceName};
pub use log::{LogManager, LogRecord};
pub use recovery::{RecoveryConfig, RecoveryManager};
