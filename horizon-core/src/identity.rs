//! Identity types for Horizon entities and facts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Signed magnitude carried by a fact, in minor currency units.
pub type Amount = i64;

/// Fact identifier using UUIDv7 for timestamp-sortable IDs.
pub type FactId = Uuid;

/// Generate a new UUIDv7 FactId.
pub fn new_fact_id() -> FactId {
    Uuid::now_v7()
}

/// Unique name of an entity (an account).
///
/// Every cache row is keyed by the name of the entity it projects, never
/// by position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EntityKey {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl AsRef<str> for EntityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_display_and_conversions() {
        let key = EntityKey::from("checking");
        assert_eq!(key.to_string(), "checking");
        assert_eq!(key.as_str(), "checking");
        assert_eq!(EntityKey::from("checking".to_string()), key);
        assert_eq!(key.into_inner(), "checking");
    }

    #[test]
    fn test_entity_key_serializes_as_plain_string() {
        let key = EntityKey::new("savings");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"savings\"");
        let back: EntityKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_fact_ids_are_unique_v7() {
        let a = new_fact_id();
        let b = new_fact_id();
        assert_ne!(a, b);
        assert_eq!(a.get_version_num(), 7);
    }
}
