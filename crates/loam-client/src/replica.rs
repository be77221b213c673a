// Client-side replica: a confirmed-state cache over one space

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::debug;

use loam_core::{
    apply_patch, BranchId, ClientCommit, Commit, EntityId, Fact, ReadClaim, ReadSet, Reference,
    Space, StoreError, UserOperation, Version,
};

use crate::notify::{Change, EventKind, Notification, NotificationBus, SubscriptionId};

/// Last-observed confirmed head for one entity
#[derive(Debug, Clone, PartialEq)]
pub struct EntityHead {
    pub hash: Reference,
    pub version: Version,
    pub value: Value,
}

/// Mirror of confirmed state for one branch of a space.
///
/// Commits are synchronous end-to-end: the operations are validated and
/// applied in a single step against the engine, then reflected here. There
/// is no optimistic tier; on a conflict the local map is untouched and no
/// notification fires.
pub struct Replica {
    space: Arc<Space>,
    branch: BranchId,
    local: RwLock<HashMap<EntityId, EntityHead>>,
    bus: NotificationBus,
    last_seen: RwLock<Version>,
}

impl Replica {
    pub fn new(space: Arc<Space>) -> Self {
        let branch = space.config().default_branch.clone();
        Self::on_branch(space, branch)
    }

    pub fn on_branch(space: Arc<Space>, branch: impl Into<BranchId>) -> Self {
        Self {
            space,
            branch: branch.into(),
            local: RwLock::new(HashMap::new()),
            bus: NotificationBus::new(),
            last_seen: RwLock::new(0),
        }
    }

    pub fn branch(&self) -> &BranchId {
        &self.branch
    }

    /// Last-observed head for `id`, if this replica has seen one
    pub fn get(&self, id: &str) -> Option<EntityHead> {
        self.local.read().unwrap().get(id).cloned()
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.bus.unsubscribe(id);
    }

    /// Commit `operations` against the entities this replica has
    /// observed. The mutated entities are the read dependencies.
    pub fn commit(&self, operations: Vec<UserOperation>) -> Result<Commit, StoreError> {
        self.commit_with_reads(operations, &[])
    }

    /// Commit with extra read dependencies: entities the caller's logic
    /// read while preparing `operations` but does not mutate.
    pub fn commit_with_reads(
        &self,
        operations: Vec<UserOperation>,
        read_deps: &[EntityId],
    ) -> Result<Commit, StoreError> {
        let confirmed = {
            let local = self.local.read().unwrap();
            let mut seen = HashSet::new();
            operations
                .iter()
                .map(|op| op.id())
                .chain(read_deps.iter())
                .filter(|id| seen.insert((*id).clone()))
                .filter_map(|id| {
                    local.get(id).map(|head| ReadClaim {
                        id: id.clone(),
                        hash: head.hash,
                        version: head.version,
                    })
                })
                .collect()
        };

        let submission = ClientCommit {
            branch: self.branch.clone(),
            reads: ReadSet {
                confirmed,
                pending: Vec::new(),
            },
            operations,
        };

        // on error the engine applied nothing; neither do we
        let commit = self.space.commit(submission)?;
        let changes = self.apply_commit(&commit)?;
        self.bus.publish(&Notification {
            kind: EventKind::Commit,
            branch: self.branch.clone(),
            commit_hash: commit.hash,
            version: commit.version,
            changes,
        });
        Ok(commit)
    }

    /// Apply a commit authored elsewhere and announce it as `integrate`
    pub fn integrate(&self, commit: &Commit) -> Result<(), StoreError> {
        let changes = self.apply_commit(commit)?;
        if changes.is_empty() {
            return Ok(());
        }
        self.bus.publish(&Notification {
            kind: EventKind::Integrate,
            branch: self.branch.clone(),
            commit_hash: commit.hash,
            version: commit.version,
            changes,
        });
        Ok(())
    }

    /// Pull and integrate every commit this replica has not yet observed.
    /// Returns the number of commits fetched.
    pub fn sync(&self) -> Result<usize, StoreError> {
        let since = *self.last_seen.read().unwrap();
        let commits = self.space.commits_since(&self.branch, since)?;
        let count = commits.len();
        for commit in &commits {
            self.integrate(commit)?;
        }
        Ok(count)
    }

    /// Fold a commit's facts into the local map, newest-wins per entity.
    /// Facts at or below an entity's known version are already reflected
    /// and are skipped, which makes integration idempotent.
    fn apply_commit(&self, commit: &Commit) -> Result<Vec<Change>, StoreError> {
        let mut local = self.local.write().unwrap();
        let mut changes: Vec<Change> = Vec::new();
        // entities this invocation has already advanced; facts of one
        // commit chain at a single version, so the version guard must only
        // apply to the first fact per entity
        let mut touched: HashSet<EntityId> = HashSet::new();

        for stored in &commit.facts {
            let id = stored.fact.id().clone();
            if !touched.contains(&id) {
                if let Some(known) = local.get(&id) {
                    if known.version >= stored.version {
                        continue;
                    }
                }
                touched.insert(id.clone());
            }
            let new_hash = match &stored.fact {
                Fact::Set { value, .. } => {
                    local.insert(
                        id.clone(),
                        EntityHead {
                            hash: stored.hash,
                            version: stored.version,
                            value: value.clone(),
                        },
                    );
                    Some(stored.hash)
                }
                Fact::Patch { ops, .. } => {
                    let base = match local.get(&id) {
                        Some(head) => head.value.clone(),
                        // first sight of this entity: its pre-commit value
                        // comes from the engine's read path
                        None => self
                            .space
                            .read_at(&self.branch, &id, stored.version.saturating_sub(1))?
                            .ok_or_else(|| StoreError::ChainViolation {
                                detail: format!("patch {} targets an unreadable entity", stored.hash),
                            })?,
                    };
                    let value = apply_patch(&base, ops)?;
                    local.insert(
                        id.clone(),
                        EntityHead {
                            hash: stored.hash,
                            version: stored.version,
                            value,
                        },
                    );
                    Some(stored.hash)
                }
                Fact::Delete { .. } => {
                    local.remove(&id);
                    None
                }
            };
            changes.retain(|change| change.id != id);
            changes.push(Change { id, new_hash });
        }
        drop(local);

        let mut last_seen = self.last_seen.write().unwrap();
        if commit.version > *last_seen {
            *last_seen = commit.version;
        }
        drop(last_seen);

        debug!(
            version = commit.version,
            entities = changes.len(),
            "commit folded into replica"
        );
        Ok(changes)
    }
}
