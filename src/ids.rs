//! Strongly-typed identifiers shared across every component.
//!
//! Grounded on the teacher crate's `Message::id: u64` correlation field,
//! generalized to the 128-bit UUIDs the spec requires for
//! `correlation-id` and `execution-id`.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn nil() -> Self {
                Self(Uuid::nil())
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_newtype!(CorrelationId);
uuid_newtype!(ExecutionId);
uuid_newtype!(IpcId);
uuid_newtype!(DomainId);

/// Identifies one running process: its OS pid plus the ipc-id of the
/// local FIFO endpoint it published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub ipc_id: IpcId,
}

impl ProcessHandle {
    pub fn new(pid: u32, ipc_id: IpcId) -> Self {
        Self { pid, ipc_id }
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ipc_id, self.pid)
    }
}

/// Global transaction id plus a per-branch suffix.
///
/// `trid.is_null()` means "not in a transaction". Two trids are equal iff
/// their `global` parts match; branching keeps `global` fixed and replaces
/// `branch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Trid {
    global: Uuid,
    branch: Uuid,
}

impl Trid {
    /// The distinguished "no transaction" value.
    pub const NULL: Trid = Trid {
        global: Uuid::nil(),
        branch: Uuid::nil(),
    };

    pub fn new() -> Self {
        let global = Uuid::new_v4();
        Self {
            global,
            branch: global,
        }
    }

    /// Reconstruct a `Trid` from its `global`/`branch` parts, e.g. when
    /// parsing the textual form `Display` prints. Does not validate that
    /// `branch` was ever actually issued as a branch of `global`.
    pub fn from_parts(global: Uuid, branch: Uuid) -> Self {
        Self { global, branch }
    }

    pub fn is_null(&self) -> bool {
        self.global.is_nil()
    }

    /// Produce a new, distinct branch of the same global transaction.
    /// The branch compares unequal to `self` under `PartialEq` on the
    /// branch component but `same_transaction` still holds.
    pub fn branch(&self) -> Self {
        Self {
            global: self.global,
            branch: Uuid::new_v4(),
        }
    }

    /// Two trids belong to the same ownership tree iff their global parts
    /// match, regardless of branch.
    pub fn same_transaction(&self, other: &Trid) -> bool {
        self.global == other.global
    }
}

impl Default for Trid {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for Trid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "<null-trid>")
        } else {
            write!(f, "{}:{}", self.global, self.branch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_trid_is_null() {
        assert!(Trid::NULL.is_null());
        assert!(Trid::default().is_null());
    }

    #[test]
    fn branch_keeps_global_but_differs() {
        let root = Trid::new();
        let branch = root.branch();
        assert!(root.same_transaction(&branch));
        assert_ne!(root, branch);
    }

    #[test]
    fn correlation_ids_are_unique() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_ne!(a, b);
    }
}
