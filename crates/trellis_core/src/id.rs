//! Unique identifiers for TRELLIS entities.
//!
//! All IDs are UUIDs. Identity comparison is what the runtime relies on:
//! flow membership, team avoidance and lock ownership all key on these.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Create a new random ", stringify!($name))]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from UUID bytes
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Get as UUID
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Process identifier - one top-level unit of work
    ProcessId,
    "proc"
);

define_id!(
    /// Thread state identifier - one logical thread within a process
    ThreadStateId,
    "thread"
);

define_id!(
    /// Flow identifier - one invocation chain within a thread state
    FlowId,
    "flow"
);

define_id!(
    /// Team identifier - identity of a worker pool
    TeamId,
    "team"
);

define_id!(
    /// Worker identifier - one physical worker executing functions
    WorkerId,
    "worker"
);

impl TeamId {
    /// Create from name, so the same team name always yields the same ID
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_creation() {
        assert_ne!(ProcessId::new(), ProcessId::new());
        assert_ne!(ThreadStateId::new(), ThreadStateId::new());
        assert_ne!(FlowId::new(), FlowId::new());
    }

    #[test]
    fn test_id_from_bytes() {
        let bytes = [7u8; 16];
        let id = FlowId::from_bytes(bytes);
        assert_eq!(id.as_uuid().as_bytes(), &bytes);
    }

    #[test]
    fn test_id_display() {
        assert!(ProcessId::new().to_string().starts_with("proc_"));
        assert!(ThreadStateId::new().to_string().starts_with("thread_"));
        assert!(FlowId::new().to_string().starts_with("flow_"));
        assert!(WorkerId::new().to_string().starts_with("worker_"));
    }

    #[test]
    fn test_team_id_from_name() {
        let a = TeamId::from_name("io");
        assert_eq!(a, TeamId::from_name("io"));
        assert_ne!(a, TeamId::from_name("cpu"));
        assert!(a.to_string().starts_with("team_"));
    }
}
