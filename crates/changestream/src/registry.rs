//! Per-partition read state shared by every running partition task.
//!
//! The registry is the only synchronization point between partition tasks. It
//! exposes claim, finish and parent-readiness checks, all taken under a single
//! lock, so a finishing parent and a concurrent readiness check never observe
//! each other half-way.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Lifecycle of a partition within one read.
///
/// Transitions only move forward: `Unknown -> Reading -> Finished`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionState {
    /// Never claimed by any task
    #[default]
    Unknown,
    /// Claimed; its stream is being consumed
    Reading,
    /// Stream fully consumed without error
    Finished,
}

/// Counts of partitions per state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub reading: usize,
    pub finished: usize,
}

#[derive(Debug, Default)]
pub struct PartitionRegistry {
    states: Mutex<HashMap<String, PartitionState>>,
}

impl PartitionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `token` for reading.
    ///
    /// Returns true for exactly one caller per token; every later caller,
    /// concurrent or not, gets false.
    pub fn try_claim(&self, token: &str) -> bool {
        let mut states = self.states.lock();

        if states.contains_key(token) {
            // Already started by another parent.
            return false;
        }

        let _previous = states.insert(token.to_owned(), PartitionState::Reading);
        true
    }

    /// Marks a previously claimed partition as fully consumed.
    pub fn mark_finished(&self, token: &str) {
        let _previous = self
            .states
            .lock()
            .insert(token.to_owned(), PartitionState::Finished);
    }

    /// True iff every parent is `Finished`. Unseen parents count as unfinished.
    pub fn all_parents_finished(&self, parents: &[String]) -> bool {
        let states = self.states.lock();

        parents
            .iter()
            .all(|parent| states.get(parent) == Some(&PartitionState::Finished))
    }

    #[must_use]
    pub fn state(&self, token: &str) -> PartitionState {
        self.states.lock().get(token).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let states = self.states.lock();

        let finished = states
            .values()
            .filter(|state| **state == PartitionState::Finished)
            .count();

        RegistryStats {
            reading: states.len().saturating_sub(finished),
            finished,
        }
    }
}
