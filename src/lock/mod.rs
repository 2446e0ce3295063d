//! Hierarchical multigranularity locking.
//!
//! | Module | Responsibility |
//! |---|---|
//! | [`mode`] | Lock modes and their compatibility/substitutability/parent-child relations |
//! | [`resource`] | Resource names (ordered segment paths) |
//! | [`manager`] | The flat lock manager: per-resource grant lists, FIFO wait queues |
//! | [`context`] | The hierarchical lock context tree built on top of the flat manager |

pub mod context;
pub mod manager;
pub mod mode;
pub mod resource;

pub use context::LockContext;
pub use manager::LockManager;
pub use mode::LockMode;
pub use resource::ResourceName;
