//! Authorization seam.
//!
//! The orchestrator never decides who may do what; it asks an injected
//! [`AccessPolicy`] for a yes/no answer before touching a table.

use serde::{Deserialize, Serialize};

use crate::error::Access;
use crate::TableId;

/// Identity a request is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
    /// May force-release row locks held by others.
    #[serde(default)]
    pub elevated: bool,
}

impl Actor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            elevated: false,
        }
    }

    pub fn elevated(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            elevated: true,
        }
    }
}

/// Yes/no authorization decision supplied by the embedding application.
pub trait AccessPolicy: Send + Sync {
    fn allows(&self, actor: &Actor, table_id: TableId, access: Access) -> bool;
}

/// Policy that permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allows(&self, _actor: &Actor, _table_id: TableId, _access: Access) -> bool {
        true
    }
}

impl<F> AccessPolicy for F
where
    F: Fn(&Actor, TableId, Access) -> bool + Send + Sync,
{
    fn allows(&self, actor: &Actor, table_id: TableId, access: Access) -> bool {
        self(actor, table_id, access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_policy() {
        let read_only = |_: &Actor, _: TableId, access: Access| access == Access::Read;
        let bob = Actor::new("bob");
        assert!(read_only.allows(&bob, 1, Access::Read));
        assert!(!read_only.allows(&bob, 1, Access::Write));
        assert!(AllowAll.allows(&bob, 1, Access::Delete));
    }
}
