// Storage trait and implementations

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::reference::Reference;
use crate::types::*;

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory for persistent storage
    pub data_dir: PathBuf,
    /// Enable fsync on commit (slower but safer)
    pub fsync_on_commit: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_on_commit: true,
        }
    }
}

/// Storage abstraction over the store's logical tables: `fact`, `commit`,
/// `blob`, `snapshot`, and `space_meta` (`last_version`).
///
/// `append_commit` is the only multi-row writer and must be atomic with
/// respect to readers: a reader observes either all of a commit's rows or
/// none of them. Invariant validation is the engine's job; the backend
/// only refuses commits whose version does not follow `last_version`.
pub trait Storage: Send + Sync {
    /// Health check
    fn health_check(&self) -> Result<()>;

    // fact table

    /// Most recent fact for `id`; a delete counts as head (tombstone)
    fn head_of(&self, branch: &str, id: &str) -> Result<Option<StoredFact>>;

    /// Most recent fact for `id` with `version <= version`
    fn fact_at_or_before(&self, branch: &str, id: &str, version: Version)
        -> Result<Option<StoredFact>>;

    /// Primary lookup by fact hash
    fn fact_by_hash(&self, hash: &Reference) -> Result<Option<StoredFact>>;

    /// Facts for `id` with `version > version_exclusive`, ascending
    fn facts_since(&self, branch: &str, id: &str, version_exclusive: Version)
        -> Result<Vec<StoredFact>>;

    // commit table + space_meta

    /// Atomically record a commit's facts, the commit row, and the new
    /// `last_version`
    fn append_commit(&self, branch: &str, commit: &Commit) -> Result<()>;

    fn commit_by_hash(&self, hash: &Reference) -> Result<Option<Commit>>;

    /// Commits with `version > version_exclusive`, ascending (replication
    /// index)
    fn commits_since(&self, branch: &str, version_exclusive: Version) -> Result<Vec<Commit>>;

    fn last_version(&self, branch: &str) -> Result<Version>;

    // blob table

    /// Idempotent: re-putting identical bytes stores nothing new
    fn put_blob(&self, blob: Blob) -> Result<()>;

    fn get_blob(&self, hash: &Reference) -> Result<Option<Blob>>;

    fn has_blob(&self, hash: &Reference) -> Result<bool>;

    // snapshot table

    fn put_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    fn latest_snapshot_at_or_before(
        &self,
        branch: &str,
        id: &str,
        version: Version,
    ) -> Result<Option<Snapshot>>;

    fn delete_snapshot(&self, branch: &str, id: &str, version: Version) -> Result<()>;

    /// Flush writes to disk
    fn flush(&self) -> Result<()>;
}

// ============================================================================
// In-Memory Storage (for tests and ephemeral spaces)
// ============================================================================

#[derive(Default)]
struct MemoryTables {
    facts_by_entity: HashMap<(BranchId, EntityId), Vec<StoredFact>>,
    facts_by_hash: HashMap<Reference, StoredFact>,
    commits: HashMap<BranchId, Vec<Commit>>,
    commits_by_hash: HashMap<Reference, Commit>,
    blobs: HashMap<Reference, Blob>,
    snapshots: HashMap<(BranchId, EntityId), Vec<Snapshot>>,
    last_versions: HashMap<BranchId, Version>,
}

/// All tables behind one lock so readers see whole commits or nothing
pub struct InMemoryStorage {
    tables: Arc<RwLock<MemoryTables>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(MemoryTables::default())),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for InMemoryStorage {
    fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn head_of(&self, branch: &str, id: &str) -> Result<Option<StoredFact>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .facts_by_entity
            .get(&(branch.to_string(), id.to_string()))
            .and_then(|facts| facts.last().cloned()))
    }

    fn fact_at_or_before(
        &self,
        branch: &str,
        id: &str,
        version: Version,
    ) -> Result<Option<StoredFact>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .facts_by_entity
            .get(&(branch.to_string(), id.to_string()))
            .and_then(|facts| facts.iter().rev().find(|f| f.version <= version).cloned()))
    }

    fn fact_by_hash(&self, hash: &Reference) -> Result<Option<StoredFact>> {
        let tables = self.tables.read().unwrap();
        Ok(tables.facts_by_hash.get(hash).cloned())
    }

    fn facts_since(
        &self,
        branch: &str,
        id: &str,
        version_exclusive: Version,
    ) -> Result<Vec<StoredFact>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .facts_by_entity
            .get(&(branch.to_string(), id.to_string()))
            .map(|facts| {
                facts
                    .iter()
                    .filter(|f| f.version > version_exclusive)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn append_commit(&self, branch: &str, commit: &Commit) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let last = tables.last_versions.get(branch).copied().unwrap_or(0);
        if commit.version != last + 1 {
            bail!(
                "commit version {} does not follow last version {}",
                commit.version,
                last
            );
        }
        for stored in &commit.facts {
            tables
                .facts_by_entity
                .entry((branch.to_string(), stored.fact.id().clone()))
                .or_default()
                .push(stored.clone());
            tables.facts_by_hash.insert(stored.hash, stored.clone());
        }
        tables
            .commits
            .entry(branch.to_string())
            .or_default()
            .push(commit.clone());
        tables.commits_by_hash.insert(commit.hash, commit.clone());
        tables.last_versions.insert(branch.to_string(), commit.version);
        Ok(())
    }

    fn commit_by_hash(&self, hash: &Reference) -> Result<Option<Commit>> {
        let tables = self.tables.read().unwrap();
        Ok(tables.commits_by_hash.get(hash).cloned())
    }

    fn commits_since(&self, branch: &str, version_exclusive: Version) -> Result<Vec<Commit>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .commits
            .get(branch)
            .map(|commits| {
                commits
                    .iter()
                    .filter(|c| c.version > version_exclusive)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn last_version(&self, branch: &str) -> Result<Version> {
        let tables = self.tables.read().unwrap();
        Ok(tables.last_versions.get(branch).copied().unwrap_or(0))
    }

    fn put_blob(&self, blob: Blob) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        tables.blobs.entry(blob.hash).or_insert(blob);
        Ok(())
    }

    fn get_blob(&self, hash: &Reference) -> Result<Option<Blob>> {
        let tables = self.tables.read().unwrap();
        Ok(tables.blobs.get(hash).cloned())
    }

    fn has_blob(&self, hash: &Reference) -> Result<bool> {
        let tables = self.tables.read().unwrap();
        Ok(tables.blobs.contains_key(hash))
    }

    fn put_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let entries = tables
            .snapshots
            .entry((snapshot.branch.clone(), snapshot.id.clone()))
            .or_default();
        entries.retain(|s| s.version != snapshot.version);
        entries.push(snapshot);
        entries.sort_by_key(|s| s.version);
        Ok(())
    }

    fn latest_snapshot_at_or_before(
        &self,
        branch: &str,
        id: &str,
        version: Version,
    ) -> Result<Option<Snapshot>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .snapshots
            .get(&(branch.to_string(), id.to_string()))
            .and_then(|entries| entries.iter().rev().find(|s| s.version <= version).cloned()))
    }

    fn delete_snapshot(&self, branch: &str, id: &str, version: Version) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        if let Some(entries) = tables
            .snapshots
            .get_mut(&(branch.to_string(), id.to_string()))
        {
            entries.retain(|s| s.version != version);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// RocksDB Storage
// ============================================================================

use rocksdb::{Options, WriteBatch, DB};

pub struct RocksStorage {
    db: Arc<DB>,
    config: StorageConfig,
}

impl RocksStorage {
    pub fn new(config: StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db_path = config.data_dir.join("rocksdb");
        let db = DB::open(&opts, db_path)?;

        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    fn fact_key(hash: &Reference) -> Vec<u8> {
        format!("fct:{hash}").into_bytes()
    }

    /// Per-entity version index. `seq` keeps facts of one commit ordered;
    /// zero-padding keeps key order equal to version order.
    fn entity_key(branch: &str, id: &str, version: Version, seq: usize) -> Vec<u8> {
        format!("ent:{branch}:{id}:{version:020}:{seq:06}").into_bytes()
    }

    fn entity_prefix(branch: &str, id: &str) -> String {
        format!("ent:{branch}:{id}:")
    }

    fn head_key(branch: &str, id: &str) -> Vec<u8> {
        format!("head:{branch}:{id}").into_bytes()
    }

    fn commit_key(hash: &Reference) -> Vec<u8> {
        format!("cmt:{hash}").into_bytes()
    }

    fn commit_version_key(branch: &str, version: Version) -> Vec<u8> {
        format!("cmtv:{branch}:{version:020}").into_bytes()
    }

    fn blob_key(hash: &Reference) -> Vec<u8> {
        format!("blob:{hash}").into_bytes()
    }

    fn snapshot_key(branch: &str, id: &str, version: Version) -> Vec<u8> {
        format!("snap:{branch}:{id}:{version:020}").into_bytes()
    }

    fn meta_last_version_key(branch: &str) -> Vec<u8> {
        format!("meta:last_version:{branch}").into_bytes()
    }

    /// Scan an entity's version index in ascending order. Entity ids may
    /// contain the key separator, so every row is checked against `id`.
    fn scan_entity_facts(&self, branch: &str, id: &str) -> Result<Vec<StoredFact>> {
        let prefix = Self::entity_prefix(branch, id);
        let mut facts = Vec::new();

        let iter = self.db.prefix_iterator(prefix.as_bytes());
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let stored: StoredFact = serde_json::from_slice(&value)?;
            if stored.fact.id() == id {
                facts.push(stored);
            }
        }

        Ok(facts)
    }
}

impl Storage for RocksStorage {
    fn health_check(&self) -> Result<()> {
        // Try a simple read
        self.db.get(b"__health__")?;
        Ok(())
    }

    fn head_of(&self, branch: &str, id: &str) -> Result<Option<StoredFact>> {
        let key = Self::head_key(branch, id);
        if let Some(value) = self.db.get(&key)? {
            let stored: StoredFact = serde_json::from_slice(&value)?;
            if stored.fact.id() == id {
                return Ok(Some(stored));
            }
        }
        Ok(None)
    }

    fn fact_at_or_before(
        &self,
        branch: &str,
        id: &str,
        version: Version,
    ) -> Result<Option<StoredFact>> {
        let facts = self.scan_entity_facts(branch, id)?;
        Ok(facts.into_iter().rev().find(|f| f.version <= version))
    }

    fn fact_by_hash(&self, hash: &Reference) -> Result<Option<StoredFact>> {
        let key = Self::fact_key(hash);
        if let Some(value) = self.db.get(&key)? {
            let stored: StoredFact = serde_json::from_slice(&value)?;
            Ok(Some(stored))
        } else {
            Ok(None)
        }
    }

    fn facts_since(
        &self,
        branch: &str,
        id: &str,
        version_exclusive: Version,
    ) -> Result<Vec<StoredFact>> {
        let facts = self.scan_entity_facts(branch, id)?;
        Ok(facts
            .into_iter()
            .filter(|f| f.version > version_exclusive)
            .collect())
    }

    fn append_commit(&self, branch: &str, commit: &Commit) -> Result<()> {
        let last = self.last_version(branch)?;
        if commit.version != last + 1 {
            bail!(
                "commit version {} does not follow last version {}",
                commit.version,
                last
            );
        }

        let mut batch = WriteBatch::default();
        for (seq, stored) in commit.facts.iter().enumerate() {
            let row = serde_json::to_vec(stored)?;
            batch.put(Self::fact_key(&stored.hash), &row);
            batch.put(
                Self::entity_key(branch, stored.fact.id(), stored.version, seq),
                &row,
            );
            // later facts for the same entity overwrite the head row
            batch.put(Self::head_key(branch, stored.fact.id()), &row);
        }
        let commit_row = serde_json::to_vec(commit)?;
        batch.put(Self::commit_key(&commit.hash), &commit_row);
        batch.put(
            Self::commit_version_key(branch, commit.version),
            commit.hash.to_string().as_bytes(),
        );
        batch.put(
            Self::meta_last_version_key(branch),
            commit.version.to_be_bytes(),
        );
        self.db.write(batch)?;

        if self.config.fsync_on_commit {
            self.db.flush()?;
        }

        Ok(())
    }

    fn commit_by_hash(&self, hash: &Reference) -> Result<Option<Commit>> {
        let key = Self::commit_key(hash);
        if let Some(value) = self.db.get(&key)? {
            let commit: Commit = serde_json::from_slice(&value)?;
            Ok(Some(commit))
        } else {
            Ok(None)
        }
    }

    fn commits_since(&self, branch: &str, version_exclusive: Version) -> Result<Vec<Commit>> {
        let prefix = format!("cmtv:{branch}:");
        let mut commits = Vec::new();

        let iter = self.db.prefix_iterator(prefix.as_bytes());
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let hash: Reference = String::from_utf8_lossy(&value).parse()?;
            let Some(commit) = self.commit_by_hash(&hash)? else {
                bail!("commit index references missing commit {hash}");
            };
            if commit.version > version_exclusive {
                commits.push(commit);
            }
        }

        Ok(commits)
    }

    fn last_version(&self, branch: &str) -> Result<Version> {
        let key = Self::meta_last_version_key(branch);
        if let Some(value) = self.db.get(&key)? {
            Ok(u64::from_be_bytes(value.as_slice().try_into().unwrap_or([0; 8])))
        } else {
            Ok(0)
        }
    }

    fn put_blob(&self, blob: Blob) -> Result<()> {
        let key = Self::blob_key(&blob.hash);
        if self.db.get_pinned(&key)?.is_some() {
            return Ok(());
        }
        self.db.put(&key, serde_json::to_vec(&blob)?)?;
        Ok(())
    }

    fn get_blob(&self, hash: &Reference) -> Result<Option<Blob>> {
        let key = Self::blob_key(hash);
        if let Some(value) = self.db.get(&key)? {
            let blob: Blob = serde_json::from_slice(&value)?;
            Ok(Some(blob))
        } else {
            Ok(None)
        }
    }

    fn has_blob(&self, hash: &Reference) -> Result<bool> {
        let key = Self::blob_key(hash);
        Ok(self.db.get_pinned(&key)?.is_some())
    }

    fn put_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let key = Self::snapshot_key(&snapshot.branch, &snapshot.id, snapshot.version);
        self.db.put(&key, serde_json::to_vec(&snapshot)?)?;
        Ok(())
    }

    fn latest_snapshot_at_or_before(
        &self,
        branch: &str,
        id: &str,
        version: Version,
    ) -> Result<Option<Snapshot>> {
        let prefix = format!("snap:{branch}:{id}:");
        let mut latest = None;

        let iter = self.db.prefix_iterator(prefix.as_bytes());
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let snapshot: Snapshot = serde_json::from_slice(&value)?;
            if snapshot.id == id && snapshot.version <= version {
                latest = Some(snapshot);
            }
        }

        Ok(latest)
    }

    fn delete_snapshot(&self, branch: &str, id: &str, version: Version) -> Result<()> {
        self.db.delete(Self::snapshot_key(branch, id, version))?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
