//! Identifier generation.
//!
//! Block ids come from an injected [`IdGenerator`]; the [`ActorId`] tags every
//! local transaction so observers and the undo manager can tell local writes
//! from remote ones.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use yrs::Origin;

/// Source of fresh block ids.
pub trait IdGenerator: Send + Sync {
    /// Produce an id that has not been handed out before by this generator.
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs. Safe across replicas.
#[derive(Debug, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Sequential ids `"0"`, `"1"`, ... for tests and single-replica tooling.
#[derive(Debug, Default)]
pub struct AutoIncrement {
    next: AtomicU64,
}

impl AutoIncrement {
    /// Create a generator starting at zero.
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for AutoIncrement {
    fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

/// Which generator a workspace should use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdGeneratorKind {
    /// Random v4 UUIDs
    #[default]
    Uuid,
    /// `"0"`, `"1"`, ... (deterministic, for tests)
    AutoIncrement,
}

impl IdGeneratorKind {
    /// Instantiate the generator.
    pub fn build(self) -> Arc<dyn IdGenerator> {
        match self {
            IdGeneratorKind::Uuid => Arc::new(UuidGenerator),
            IdGeneratorKind::AutoIncrement => Arc::new(AutoIncrement::new()),
        }
    }
}

/// Stable identifier of this process as a writer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId(String);

impl ActorId {
    /// Wrap an explicit actor id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random actor id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Transaction origin carrying this actor id.
    pub fn origin(&self) -> Origin {
        Origin::from(self.0.as_str())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_auto_increment_is_sequential() {
        let ids = AutoIncrement::new();
        assert_eq!(ids.next_id(), "0");
        assert_eq!(ids.next_id(), "1");
        assert_eq!(ids.next_id(), "2");
    }

    #[test]
    fn test_uuid_ids_are_unique() {
        let ids = UuidGenerator;
        let set: HashSet<String> = (0..100).map(|_| ids.next_id()).collect();
        assert_eq!(set.len(), 100);
    }

    #[test]
    fn test_actor_origin_is_stable() {
        let actor = ActorId::new("alice");
        assert_eq!(actor.origin(), actor.clone().origin());
        assert_ne!(actor.origin(), ActorId::new("bob").origin());
    }
}
