// Core data model: facts, commits, blobs, snapshots, and the wire types

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::patch::PatchOperation;
use crate::reference::Reference;

/// Entity identifier (opaque, URI-shaped)
pub type EntityId = String;

/// Named linear history within a space
pub type BranchId = String;

/// Per-space monotonically increasing commit version
pub type Version = u64;

/// One immutable state transition for an entity. `parent` is the hash of
/// the preceding fact for the same entity, or the `EMPTY(id)` sentinel
/// for the first fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Fact {
    /// Replace the entity's value
    Set {
        id: EntityId,
        value: Value,
        parent: Reference,
    },
    /// Mutate the entity's value by applying `ops` in order
    Patch {
        id: EntityId,
        ops: Vec<PatchOperation>,
        parent: Reference,
    },
    /// Tombstone the entity
    Delete { id: EntityId, parent: Reference },
}

impl Fact {
    pub fn id(&self) -> &EntityId {
        match self {
            Fact::Set { id, .. } | Fact::Patch { id, .. } | Fact::Delete { id, .. } => id,
        }
    }

    pub fn parent(&self) -> &Reference {
        match self {
            Fact::Set { parent, .. }
            | Fact::Patch { parent, .. }
            | Fact::Delete { parent, .. } => parent,
        }
    }

    /// Sets and patches are writes; a delete is not
    pub fn is_write(&self) -> bool {
        !matches!(self, Fact::Delete { .. })
    }
}

/// A fact as recorded in the log, with its commit-time assignments.
/// `payload_ref` is the blob reference under which the set value or patch
/// ops are stored (`None` for deletes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFact {
    #[serde(flatten)]
    pub fact: Fact,
    pub hash: Reference,
    pub version: Version,
    pub commit_hash: Reference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_ref: Option<Reference>,
}

/// One atomic batch of facts. All facts in a commit share its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: Reference,
    pub version: Version,
    pub facts: Vec<StoredFact>,
    /// Unix milliseconds
    pub timestamp: i64,
}

/// Immutable content-addressed bytes, keyed by `SHA-256(data)`.
/// Entity values link to blobs by convention via `{"$blob": "<ref>"}`;
/// the core never dereferences those links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub hash: Reference,
    pub data: Vec<u8>,
    pub content_type: String,
    pub size: u64,
}

/// Materialized value pointer: `value_ref` resolves through the blob
/// store to the full replay result for `id` at `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub branch: BranchId,
    pub id: EntityId,
    pub version: Version,
    pub value_ref: Reference,
}

/// A client-submitted transaction. Operations carry no parent; the
/// engine resolves parents from its own heads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCommit {
    #[serde(default = "default_branch")]
    pub branch: BranchId,
    #[serde(default)]
    pub reads: ReadSet,
    pub operations: Vec<UserOperation>,
}

fn default_branch() -> BranchId {
    "main".to_string()
}

/// Read dependencies the commit was computed against
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadSet {
    #[serde(default)]
    pub confirmed: Vec<ReadClaim>,
    #[serde(default)]
    pub pending: Vec<PendingClaim>,
}

/// Claim that `id`'s head was `hash` at `version` when the commit was
/// prepared; the engine rejects the commit if the head has moved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadClaim {
    pub id: EntityId,
    pub hash: Reference,
    pub version: Version,
}

/// Reserved for a remote provider: a read against a commit that is still
/// in flight. The local engine carries but does not interpret these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingClaim {
    pub id: EntityId,
    pub depends_on_commit: Reference,
}

/// One client operation; `op` discriminates on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum UserOperation {
    Set { id: EntityId, value: Value },
    Patch { id: EntityId, ops: Vec<PatchOperation> },
    Delete { id: EntityId },
}

impl UserOperation {
    pub fn id(&self) -> &EntityId {
        match self {
            UserOperation::Set { id, .. }
            | UserOperation::Patch { id, .. }
            | UserOperation::Delete { id } => id,
        }
    }
}
