//! Catalog Type Definitions
//!
//! Rust bindings for the catalog's PostgreSQL enums and rows. The state
//! enums map one-to-one onto the `shard_state` and `signature_state`
//! database types via `sqlx::Type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a shard.
///
/// Transitions are one-directional along the lifecycle graph, with two
/// exceptions: a writer may release an idle `writing` shard back to
/// `standby`, and a failed packer/cleaner unlocks back to the previous
/// steady state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "shard_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ShardState {
    Standby,
    Writing,
    Full,
    Packing,
    Packed,
    Cleaning,
    Readonly,
}

impl ShardState {
    /// States in which exactly one worker owns the shard row.
    pub fn is_locked(self) -> bool {
        matches!(self, Self::Writing | Self::Packing | Self::Cleaning)
    }

    /// States in which the RO-shard file is the authoritative source for
    /// reads. The RW table may still exist (`packed`, `cleaning`) but the
    /// file is complete and must be preferred: the table can be dropped at
    /// any moment.
    pub fn uses_shard_file(self) -> bool {
        matches!(self, Self::Packed | Self::Cleaning | Self::Readonly)
    }

    /// Whether `self → next` is a legal lifecycle transition.
    pub fn can_transition_to(self, next: ShardState) -> bool {
        use ShardState::*;
        matches!(
            (self, next),
            (Standby, Writing)      // writer acquires
                | (Writing, Standby)    // idle release
                | (Writing, Full)       // size threshold or voluntary
                | (Full, Packing)       // packer locks
                | (Packing, Full)       // pack failed, unlock
                | (Packing, Packed)     // pack complete
                | (Packed, Cleaning)    // cleaner locks
                | (Cleaning, Packed)    // clean failed, unlock
                | (Cleaning, Readonly)  // table dropped
        )
    }
}

/// State of a signature index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "signature_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SignatureState {
    /// A writer intends to store the bytes; readers treat this as absent.
    Inflight,
    /// The bytes are durable in the recorded shard.
    Present,
    /// Soft-deleted; readers treat this as absent.
    Deleted,
}

/// One row of the `shards` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Shard {
    pub id: i64,
    pub name: String,
    pub state: ShardState,
    pub locker: Option<Uuid>,
    pub locker_ts: Option<DateTime<Utc>>,
    pub mapped_on_hosts_when_packed: Vec<String>,
}

/// Outcome of [`Catalog::insert_inflight`](crate::Catalog::insert_inflight).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new inflight entry was created for the caller's shard.
    Created,
    /// An entry already exists; the caller decides what that means.
    Exists {
        state: SignatureState,
        shard_id: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use ShardState::*;

    const ALL: [ShardState; 7] = [Standby, Writing, Full, Packing, Packed, Cleaning, Readonly];

    #[test]
    fn test_locked_states() {
        for state in ALL {
            assert_eq!(
                state.is_locked(),
                matches!(state, Writing | Packing | Cleaning),
                "{:?}",
                state
            );
        }
    }

    #[test]
    fn test_shard_file_states() {
        for state in ALL {
            assert_eq!(
                state.uses_shard_file(),
                matches!(state, Packed | Cleaning | Readonly),
                "{:?}",
                state
            );
        }
    }

    #[test]
    fn test_forward_path_is_legal() {
        let path = [Standby, Writing, Full, Packing, Packed, Cleaning, Readonly];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{:?} -> {:?} must be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_unlock_transitions_are_legal() {
        assert!(Writing.can_transition_to(Standby));
        assert!(Packing.can_transition_to(Full));
        assert!(Cleaning.can_transition_to(Packed));
    }

    #[test]
    fn test_no_backwards_or_skipping_transitions() {
        assert!(!Readonly.can_transition_to(Standby));
        assert!(!Readonly.can_transition_to(Writing));
        assert!(!Standby.can_transition_to(Full));
        assert!(!Writing.can_transition_to(Packing));
        assert!(!Full.can_transition_to(Packed));
        assert!(!Packed.can_transition_to(Readonly));
        assert!(!Packed.can_transition_to(Full));
        for state in ALL {
            assert!(!state.can_transition_to(state), "{:?} self-loop", state);
        }
    }
}
