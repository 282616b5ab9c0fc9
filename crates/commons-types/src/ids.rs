//! Type-safe identifier wrappers.
//!
//! Agents are numbered densely from zero when a run starts, so [`AgentId`]
//! wraps a `u32` and its ordering doubles as the deterministic tie-break
//! order used by the engine. Runs and ledger entries use UUID v7
//! (time-ordered) so records from many parallel runs can be merged.

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
        #[ts(export, export_to = "bindings/")]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Unique identifier for one simulation run.
    RunId
}

define_id! {
    /// Unique identifier for a ledger entry.
    LedgerEntryId
}

/// Identifier of an agent, stable and unique within a run.
///
/// Serialized as a bare number so output records stay compact and
/// provider replies can reference peers by the same value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[serde(transparent)]
#[ts(export, export_to = "bindings/")]
pub struct AgentId(pub u32);

impl AgentId {
    /// Return the numeric index of this agent.
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for AgentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for AgentId {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique() {
        let a = RunId::new();
        let b = RunId::new();
        assert_ne!(a, b);
        assert_ne!(a.into_inner(), Uuid::nil());
    }

    #[test]
    fn agent_id_serializes_as_number() {
        let json = serde_json::to_string(&AgentId(7)).ok();
        assert_eq!(json.as_deref(), Some("7"));
        let restored: Result<AgentId, _> = serde_json::from_str("7");
        assert_eq!(restored.ok(), Some(AgentId(7)));
    }

    #[test]
    fn agent_ids_order_by_index() {
        assert!(AgentId(1) < AgentId(2));
        assert_eq!(AgentId::from(3).index(), 3);
        assert_eq!(AgentId(3).to_string(), "3");
    }
}
