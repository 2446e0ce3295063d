//! Resource names: the ordered-segment path a lock is taken out against
//! (e.g. `database.table.page`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// An ordered path of segments identifying a lockable resource at some
/// granularity. Segments run from coarsest (root) to finest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceName(Vec<String>);

impl ResourceName {
    /// A root (single-segment) resource name, e.g. a database name.
    pub fn root(segment: impl Into<String>) -> Self {
        Self(vec![segment.into()])
    }

    /// Builds a resource name from an explicit, already-ordered segment list.
    /// Panics on an empty list -- every resource has at least one segment.
    pub fn from_segments(segments: Vec<String>) -> Self {
        assert!(!segments.is_empty(), "resource name must have at least one segment");
        Self(segments)
    }

    /// The name of the immediate child obtained by appending `segment`.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// The name of the immediate parent, or `None` if this is a root name.
    pub fn parent(&self) -> Option<Self> {
        if self.0.len() <= 1 {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// True iff `self` names a strict descendant of `other` in the resource
    /// hierarchy (longer path sharing `other`'s full prefix).
    pub fn is_descendant_of(&self, other: &Self) -> bool {
        self.0.len() > other.0.len() && self.0[..other.0.len()] == other.0[..]
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_and_parent_round_trip() {
        let db = ResourceName::root("db");
        let table = db.child("accounts");
        assert_eq!(table.parent().unwrap(), db);
        assert_eq!(table.to_string(), "db.accounts");
    }

    #[test]
    fn root_has_no_parent() {
        assert!(ResourceName::root("db").parent().is_none());
    }

    #[test]
    fn descendant_detection() {
        let db = ResourceName::root("db");
        let table = db.child("accounts");
        let page = table.child("page1");
        assert!(table.is_descendant_of(&db));
        assert!(page.is_descendant_of(&db));
        assert!(page.is_descendant_of(&table));
        assert!(!db.is_descendant_of(&table));
        assert!(!db.is_descendant_of(&db));
    }
}
