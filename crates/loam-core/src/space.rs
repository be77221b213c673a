// Space engine: transaction validation, version assignment, snapshot
// policy, and read assembly

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::error::{EntityState, StoreError};
use crate::patch;
use crate::reference::{self, Reference};
use crate::storage::Storage;
use crate::types::*;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Engine configuration
#[derive(Debug, Clone)]
pub struct SpaceConfig {
    /// Branch used when a submission does not name one
    pub default_branch: BranchId,
    /// Patches per entity before a snapshot is materialized
    pub snapshot_interval: u64,
    /// Upper bound on ops per patch fact
    pub max_patch_ops: usize,
    /// Upper bound on a serialized fact payload
    pub max_value_bytes: usize,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            default_branch: "main".to_string(),
            snapshot_interval: 10,
            max_patch_ops: 1024,
            max_value_bytes: 1024 * 1024,
        }
    }
}

/// Single-writer engine over one space.
/// All mutations serialize through the commit lock; reads go straight to
/// storage and may proceed in parallel with a commit.
pub struct Space {
    storage: Arc<dyn Storage>,
    config: SpaceConfig,
    commit_lock: Mutex<()>,
}

/// Per-entity cursor tracked while a commit's facts are assembled.
/// Starts at the stored head and advances through the commit's own facts
/// so that several operations on one entity chain correctly.
struct EntityCursor {
    parent: Reference,
    live: bool,
    exists: bool,
    value: Option<Value>,
}

impl Space {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_config(storage, SpaceConfig::default())
    }

    pub fn with_config(storage: Arc<dyn Storage>, config: SpaceConfig) -> Self {
        Self {
            storage,
            config,
            commit_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    /// Validate and apply a client commit in a single step.
    ///
    /// Any error aborts the whole commit: the fact log is unchanged and
    /// nothing is observable to readers.
    pub fn commit(&self, submission: ClientCommit) -> Result<Commit, StoreError> {
        let _guard = self.commit_lock.lock().unwrap();

        let branch = if submission.branch.is_empty() {
            self.config.default_branch.clone()
        } else {
            submission.branch
        };
        debug!(
            branch = %branch,
            operations = submission.operations.len(),
            reads = submission.reads.confirmed.len(),
            "commit submitted"
        );

        if submission.operations.is_empty() {
            return Err(StoreError::ChainViolation {
                detail: "commit contains no operations".to_string(),
            });
        }

        // 1. every confirmed read must still name the current head
        for claim in &submission.reads.confirmed {
            let head = self.storage.head_of(&branch, &claim.id)?;
            match head {
                Some(h) if h.hash == claim.hash => {}
                other => {
                    return Err(StoreError::Conflict {
                        id: claim.id.clone(),
                        expected: claim.hash,
                        actual: other.map(|h| h.hash),
                    })
                }
            }
        }

        // 2. build facts, resolving each parent from the head or from an
        //    earlier fact of this commit
        let version = self.storage.last_version(&branch)? + 1;
        let mut cursors: HashMap<EntityId, EntityCursor> = HashMap::new();
        let mut pending: Vec<(Fact, Reference, Option<Vec<u8>>)> = Vec::new();

        for operation in submission.operations {
            let id = operation.id().clone();
            let cursor = match cursors.entry(id) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    let cursor = self.cursor_for(&branch, entry.key())?;
                    entry.insert(cursor)
                }
            };

            let (fact, payload) = match operation {
                UserOperation::Set { id, value } => {
                    let payload = self.encode_payload(&value)?;
                    let fact = Fact::Set {
                        id,
                        value: value.clone(),
                        parent: cursor.parent,
                    };
                    cursor.live = true;
                    cursor.exists = true;
                    cursor.value = Some(value);
                    (fact, Some(payload))
                }
                UserOperation::Patch { id, ops } => {
                    if ops.len() > self.config.max_patch_ops {
                        return Err(StoreError::InvalidPatch {
                            index: self.config.max_patch_ops,
                            detail: format!(
                                "patch has {} operations, limit is {}",
                                ops.len(),
                                self.config.max_patch_ops
                            ),
                        });
                    }
                    if !cursor.live {
                        return Err(StoreError::TombstoneMisuse {
                            id,
                            state: cursor.state(),
                        });
                    }
                    let payload = self.encode_payload(&ops)?;
                    let current = match cursor.value.take() {
                        Some(value) => value,
                        None => self.read(&branch, &id)?.ok_or_else(|| {
                            StoreError::ChainViolation {
                                detail: format!("live head of {id} has no value"),
                            }
                        })?,
                    };
                    let next = patch::apply_patch(&current, &ops)?;
                    let fact = Fact::Patch {
                        id,
                        ops,
                        parent: cursor.parent,
                    };
                    cursor.value = Some(next);
                    (fact, Some(payload))
                }
                UserOperation::Delete { id } => {
                    // a delete's parent must be a write
                    if !cursor.live {
                        return Err(StoreError::TombstoneMisuse {
                            id,
                            state: cursor.state(),
                        });
                    }
                    let fact = Fact::Delete {
                        id,
                        parent: cursor.parent,
                    };
                    cursor.live = false;
                    cursor.value = None;
                    (fact, None)
                }
            };

            let hash = reference::hash_fact(&fact);
            cursor.parent = hash;
            pending.push((fact, hash, payload));
        }

        // 3–5. version is shared by every fact; the commit hash covers the
        //      version and the ordered fact hashes
        let fact_hashes: Vec<String> = pending.iter().map(|(_, h, _)| h.to_string()).collect();
        let commit_hash = reference::hash_value(&json!({
            "facts": fact_hashes,
            "version": version,
        }));
        let timestamp = unix_millis();

        let mut facts = Vec::with_capacity(pending.len());
        for (fact, hash, payload) in pending {
            let payload_ref = match payload {
                Some(bytes) => Some(self.put_blob(bytes, JSON_CONTENT_TYPE)?),
                None => None,
            };
            facts.push(StoredFact {
                fact,
                hash,
                version,
                commit_hash,
                payload_ref,
            });
        }
        let commit = Commit {
            hash: commit_hash,
            version,
            facts,
            timestamp,
        };

        // 6. self-check, then the atomic append
        self.validate_chain(&branch, &commit)?;
        self.storage.append_commit(&branch, &commit)?;

        info!(
            branch = %branch,
            version = commit.version,
            commit = %commit.hash,
            facts = commit.facts.len(),
            "commit applied"
        );

        self.maintain_snapshots(&branch, &commit)?;

        Ok(commit)
    }

    /// Current value of `id`, or `None` when the entity is empty or
    /// tombstoned
    pub fn read(&self, branch: &str, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.materialize(branch, id, None)?.map(|(value, _)| value))
    }

    /// Value of `id` as of `version`
    pub fn read_at(
        &self,
        branch: &str,
        id: &str,
        version: Version,
    ) -> Result<Option<Value>, StoreError> {
        Ok(self
            .materialize(branch, id, Some(version))?
            .map(|(value, _)| value))
    }

    pub fn head_of(&self, branch: &str, id: &str) -> Result<Option<StoredFact>, StoreError> {
        Ok(self.storage.head_of(branch, id)?)
    }

    pub fn fact_by_hash(&self, hash: &Reference) -> Result<Option<StoredFact>, StoreError> {
        Ok(self.storage.fact_by_hash(hash)?)
    }

    pub fn commits_since(
        &self,
        branch: &str,
        version_exclusive: Version,
    ) -> Result<Vec<Commit>, StoreError> {
        Ok(self.storage.commits_since(branch, version_exclusive)?)
    }

    pub fn last_version(&self, branch: &str) -> Result<Version, StoreError> {
        Ok(self.storage.last_version(branch)?)
    }

    /// Store bytes by content hash. Idempotent: identical bytes yield the
    /// same reference with no duplicate storage.
    pub fn put_blob(&self, data: Vec<u8>, content_type: &str) -> Result<Reference, StoreError> {
        let hash = reference::hash_bytes(&data);
        if !self.storage.has_blob(&hash)? {
            let size = data.len() as u64;
            self.storage.put_blob(Blob {
                hash,
                data,
                content_type: content_type.to_string(),
                size,
            })?;
        }
        Ok(hash)
    }

    pub fn get_blob(&self, hash: &Reference) -> Result<Blob, StoreError> {
        self.storage
            .get_blob(hash)?
            .ok_or(StoreError::NotFound(*hash))
    }

    pub fn has_blob(&self, hash: &Reference) -> Result<bool, StoreError> {
        Ok(self.storage.has_blob(hash)?)
    }

    fn cursor_for(&self, branch: &str, id: &str) -> Result<EntityCursor, StoreError> {
        Ok(match self.storage.head_of(branch, id)? {
            Some(head) => EntityCursor {
                parent: head.hash,
                live: head.fact.is_write(),
                exists: true,
                value: None,
            },
            None => EntityCursor {
                parent: reference::empty_ref(id),
                live: false,
                exists: false,
                value: None,
            },
        })
    }

    fn encode_payload<T: serde::Serialize>(&self, payload: &T) -> Result<Vec<u8>, StoreError> {
        let bytes = serde_json::to_vec(payload).map_err(|e| StoreError::Storage(e.into()))?;
        if bytes.len() > self.config.max_value_bytes {
            return Err(StoreError::PayloadTooLarge {
                size: bytes.len(),
                limit: self.config.max_value_bytes,
            });
        }
        Ok(bytes)
    }

    /// Internal self-check on the assembled commit: recomputed hashes,
    /// parent linkage against the stored heads, and version continuity.
    fn validate_chain(&self, branch: &str, commit: &Commit) -> Result<(), StoreError> {
        let expected_version = self.storage.last_version(branch)? + 1;
        if commit.version != expected_version {
            return Err(StoreError::ChainViolation {
                detail: format!(
                    "commit version {} does not follow {}",
                    commit.version, expected_version - 1
                ),
            });
        }
        let mut seen: HashMap<&EntityId, Reference> = HashMap::new();
        for stored in &commit.facts {
            if reference::hash_fact(&stored.fact) != stored.hash {
                return Err(StoreError::ChainViolation {
                    detail: format!("fact {} does not hash to its content", stored.hash),
                });
            }
            let expected_parent = match seen.get(stored.fact.id()) {
                Some(hash) => *hash,
                None => match self.storage.head_of(branch, stored.fact.id())? {
                    Some(head) => head.hash,
                    None => reference::empty_ref(stored.fact.id()),
                },
            };
            if *stored.fact.parent() != expected_parent {
                return Err(StoreError::ChainViolation {
                    detail: format!(
                        "fact {} parent disagrees with head of {}",
                        stored.hash,
                        stored.fact.id()
                    ),
                });
            }
            seen.insert(stored.fact.id(), stored.hash);
        }
        Ok(())
    }

    /// Snapshot policy: rematerialize each written entity and snapshot it
    /// once enough patches have accumulated since the last full value.
    fn maintain_snapshots(&self, branch: &str, commit: &Commit) -> Result<(), StoreError> {
        let mut written: Vec<&EntityId> = Vec::new();
        for stored in &commit.facts {
            if !written.contains(&stored.fact.id()) {
                written.push(stored.fact.id());
            }
        }
        for id in written {
            let Some((value, patches)) = self.materialize(branch, id, None)? else {
                continue;
            };
            if patches >= self.config.snapshot_interval {
                let bytes =
                    serde_json::to_vec(&value).map_err(|e| StoreError::Storage(e.into()))?;
                let value_ref = self.put_blob(bytes, JSON_CONTENT_TYPE)?;
                self.storage.put_snapshot(Snapshot {
                    branch: branch.to_string(),
                    id: id.clone(),
                    version: commit.version,
                    value_ref,
                })?;
                debug!(
                    branch = %branch,
                    id = %id,
                    version = commit.version,
                    "snapshot materialized"
                );
            }
        }
        Ok(())
    }

    /// The read path: seed from the latest snapshot at or below the head,
    /// then replay facts in ascending version order. Returns the value and
    /// the number of patches replayed since the last full value.
    fn materialize(
        &self,
        branch: &str,
        id: &str,
        at: Option<Version>,
    ) -> Result<Option<(Value, u64)>, StoreError> {
        let head = match at {
            None => self.storage.head_of(branch, id)?,
            Some(version) => self.storage.fact_at_or_before(branch, id, version)?,
        };
        let Some(head) = head else {
            return Ok(None);
        };
        if !head.fact.is_write() {
            return Ok(None);
        }

        let snapshot = self
            .storage
            .latest_snapshot_at_or_before(branch, id, head.version)?;
        let (mut value, seed_version) = match snapshot {
            Some(snapshot) => {
                let blob = self
                    .storage
                    .get_blob(&snapshot.value_ref)?
                    .ok_or(StoreError::NotFound(snapshot.value_ref))?;
                let seeded: Value = serde_json::from_slice(&blob.data)
                    .map_err(|e| StoreError::Storage(e.into()))?;
                (Some(seeded), snapshot.version)
            }
            None => (None, 0),
        };

        let mut patches = 0u64;
        for stored in self.storage.facts_since(branch, id, seed_version)? {
            if stored.version > head.version {
                break;
            }
            match &stored.fact {
                Fact::Set { value: v, .. } => {
                    value = Some(v.clone());
                    patches = 0;
                }
                Fact::Patch { ops, .. } => {
                    let current = value.ok_or_else(|| StoreError::ChainViolation {
                        detail: format!("patch {} has no base value", stored.hash),
                    })?;
                    value = Some(patch::apply_patch(&current, ops)?);
                    patches += 1;
                }
                Fact::Delete { .. } => {
                    value = None;
                    patches = 0;
                }
            }
        }

        Ok(value.map(|value| (value, patches)))
    }
}

impl EntityCursor {
    fn state(&self) -> EntityState {
        if self.exists {
            EntityState::Tombstoned
        } else {
            EntityState::Empty
        }
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
