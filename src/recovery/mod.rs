//! ARIES-style crash recovery: in-memory bookkeeping tables and the manager
//! that drives forward logging, checkpointing, and three-pass restart.
//!
//! | Module | Responsibility |
//! |---|---|
//! | [`table`] | Transaction table and dirty page table |
//! | [`manager`] | Forward processing, checkpointing, analysis/redo/undo |

pub mod manager;
pub mod table;

pub use manager::{RecoveryConfig, RecoveryManager};
pub use table::{DirtyPageTable, TransactionTable, TransactionTableEntry};
