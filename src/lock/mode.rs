//! Lock modes and the two static relations (compatibility, substitutability)
//! plus the parent/child multigranularity rule. None of these are a total
//! order -- `IS` and `IX` are incomparable -- so they are implemented as
//! literal table lookups, not a derived numeric "strength".

use serde::{Deserialize, Serialize};
use std::fmt;

/// A hierarchical multigranularity lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// No lock.
    NL,
    /// Intention shared.
    IS,
    /// Intention exclusive.
    IX,
    /// Shared.
    S,
    /// Shared + intention exclusive.
    SIX,
    /// Exclusive.
    X,
}

impl LockMode {
    /// Whether `a` and `b` may be held simultaneously by two different
    /// transactions on the same resource. Symmetric.
    pub fn compatible(a: LockMode, b: LockMode) -> bool {
        use LockMode::*;
        match (a, b) {
            (NL, _) | (_, NL) => true,
            (IS, IS) | (IS, IX) | (IX, IS) => true,
            (IS, S) | (S, IS) => true,
            (IS, SIX) | (SIX, IS) => true,
            (IX, IX) => true,
            (S, S) => true,
            _ => false,
        }
    }

    /// Whether a transaction already holding `held` effectively also holds
    /// `required` -- i.e. `held` is at least as strong as `required`.
    pub fn substitutable(required: LockMode, held: LockMode) -> bool {
        use LockMode::*;
        match held {
            X => true,
            SIX => matches!(required, NL | IS | IX | S | SIX),
            S => matches!(required, NL | IS | S),
            IX => matches!(required, NL | IS | IX),
            IS => matches!(required, NL | IS),
            NL => required == NL,
        }
    }

    /// Whether a parent resource held in `parent` mode permits a child lock
    /// request of `child` mode.
    pub fn can_be_parent_lock(parent: LockMode, child: LockMode) -> bool {
        use LockMode::*;
        match child {
            NL => true,
            IS => matches!(parent, IS | IX),
            S => matches!(parent, IS | IX | S | SIX | X),
            IX | SIX | X => matches!(parent, IX | SIX | X),
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::NL => "NL",
            LockMode::IS => "IS",
            LockMode::IX => "IX",
            LockMode::S => "S",
            LockMode::SIX => "SIX",
            LockMode::X => "X",
        };
        f.write_str(s)
    }
}
