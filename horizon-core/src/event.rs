//! Mutation events emitted by the fact store.
//!
//! Every durable write to accounts or transactions produces one of these.
//! The invalidation tracker consumes them in place of database triggers.
//! Delivery is at-least-once and unordered across entities, so every
//! handler must tolerate duplicates.

use crate::{EntityKey, FactId, Timestamp};
use serde::{Deserialize, Serialize};

/// A change to the base dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MutationEvent {
    // ========================================================================
    // ENTITY EVENTS
    // ========================================================================
    /// A new account was created.
    EntityCreated { key: EntityKey },

    /// An account was deleted, together with its transactions.
    EntityDeleted { key: EntityKey },

    // ========================================================================
    // FACT EVENTS
    // ========================================================================
    /// A transaction was inserted.
    FactCreated {
        fact_id: FactId,
        owner: EntityKey,
        effective_time: Timestamp,
    },

    /// A transaction was deleted.
    FactDeleted {
        fact_id: FactId,
        owner: EntityKey,
        effective_time: Timestamp,
    },

    /// A transaction was updated in place.
    FactUpdated {
        fact_id: FactId,
        old_owner: EntityKey,
        new_owner: EntityKey,
        /// Whether amount or post time changed. When false and the owner is
        /// unchanged, the balance projection cannot have moved.
        relevant_change: bool,
    },
}

impl MutationEvent {
    /// Short name of the event kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            MutationEvent::EntityCreated { .. } => "entity_created",
            MutationEvent::EntityDeleted { .. } => "entity_deleted",
            MutationEvent::FactCreated { .. } => "fact_created",
            MutationEvent::FactDeleted { .. } => "fact_deleted",
            MutationEvent::FactUpdated { .. } => "fact_updated",
        }
    }

    /// Entities whose cache rows this event may touch.
    pub fn affected_keys(&self) -> Vec<&EntityKey> {
        match self {
            MutationEvent::EntityCreated { key } | MutationEvent::EntityDeleted { key } => {
                vec![key]
            }
            MutationEvent::FactCreated { owner, .. } | MutationEvent::FactDeleted { owner, .. } => {
                vec![owner]
            }
            MutationEvent::FactUpdated {
                old_owner,
                new_owner,
                ..
            } => {
                if old_owner == new_owner {
                    vec![old_owner]
                } else {
                    vec![old_owner, new_owner]
                }
            }
        }
    }
}
