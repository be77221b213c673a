// Typed error envelope for the store

use std::fmt;
use thiserror::Error;

use crate::reference::Reference;
use crate::types::EntityId;

/// Entity state observed by an operation that required a live head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// No fact has ever been committed for the entity
    Empty,
    /// The entity's head is a delete
    Tombstoned,
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityState::Empty => write!(f, "empty"),
            EntityState::Tombstoned => write!(f, "tombstoned"),
        }
    }
}

/// Errors surfaced by the store. A commit error aborts the whole commit;
/// the fact log is unchanged and no notifications fire.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A confirmed read no longer matches the entity's head.
    /// `actual` is `None` when the entity currently has no head at all.
    #[error("read conflict on {id}: expected {expected}")]
    Conflict {
        id: EntityId,
        expected: Reference,
        actual: Option<Reference>,
    },

    /// A patch operation failed to apply; `index` is the failing operation
    #[error("invalid patch at op {index}: {detail}")]
    InvalidPatch { index: usize, detail: String },

    /// A referenced blob or fact is absent
    #[error("not found: {0}")]
    NotFound(Reference),

    /// Malformed reference encoding
    #[error("invalid reference: {detail}")]
    InvalidReference { detail: String },

    /// Patch or delete against an entity with no live value
    #[error("entity {id} is {state}")]
    TombstoneMisuse { id: EntityId, state: EntityState },

    /// Internal self-check failure: the assembled commit disagrees with
    /// the log's causal chain
    #[error("chain violation: {detail}")]
    ChainViolation { detail: String },

    /// Serialized fact payload exceeds the configured limit
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Storage backend failure
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
