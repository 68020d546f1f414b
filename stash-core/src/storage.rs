//! Server-side repository storage
//!
//! ```text
//! {storage_root}/
//!   {repository_id}/
//!     HEAD                    "ref: refs/head/main"
//!     lock                    advisory lock for ref and packfile work
//!     objects/{hash[0..2]}/{hash[2..]}
//!     refs/head/{branch}
//!     pending/{uuid}.json     ref updates proposed by non-owners
//! ```
//!
//! Repository names map to ids through a JSON registry kept beside the
//! storage root. Names are unique across the server.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StashError};
use crate::lock::{DEFAULT_LOCK_TIMEOUT, RepoLock};
use crate::object::{ObjectId, TreeEntry, optional_hex};
use crate::packfile::{PackStats, execute_packfile};
use crate::refs::{self, DEFAULT_BRANCH, HEADS_DIR};
use crate::store::ObjectStore;

const PENDING_DIR: &str = "pending";

/// A repository known to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub id: String,
    pub name: String,
    pub owner: String,
}

/// Name -> repository mapping stored as JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryRegistry {
    repositories: Vec<RepositoryRecord>,
}

impl RepositoryRegistry {
    /// Load the registry; a missing file is an empty registry
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> Option<&RepositoryRecord> {
        self.repositories.iter().find(|r| r.name == name)
    }

    pub fn repositories(&self) -> &[RepositoryRecord] {
        &self.repositories
    }

    /// Register a new repository under a fresh id
    pub fn register(&mut self, name: &str, owner: &str) -> Result<RepositoryRecord> {
        validate_repository_name(name)?;
        crate::auth::validate_username(owner)?;
        if self.find_by_name(name).is_some() {
            return Err(StashError::InvalidArgument(format!("repository '{}' already exists", name)));
        }
        let record = RepositoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            owner: owner.to_string(),
        };
        self.repositories.push(record.clone());
        Ok(record)
    }
}

fn validate_repository_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid || name.ends_with(crate::config::REPOSITORY_SUFFIX) {
        return Err(StashError::InvalidArgument(format!("invalid repository name {:?}", name)));
    }
    Ok(())
}

/// A ref update waiting for the owner's approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: String,
    pub branch: String,
    pub author: String,
    pub tip: ObjectId,
    pub previous: Option<ObjectId>,
    /// Unix seconds
    pub created_at: i64,
}

/// Head commit and root listing of one branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadListing {
    pub head: Option<ObjectId>,
    pub files: Vec<TreeEntry>,
}

/// Repository directories under a storage root
#[derive(Debug, Clone)]
pub struct FileSystem {
    root: PathBuf,
    lock_timeout: Duration,
}

impl FileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a repository; ids are generated names, never paths
    pub fn repo_dir(&self, repo_id: &str) -> Result<PathBuf> {
        let safe = !repo_id.is_empty() && repo_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !safe {
            return Err(StashError::DirectoryTraversal(format!("invalid repository id {:?}", repo_id)));
        }
        Ok(self.root.join(repo_id))
    }

    fn existing_repo_dir(&self, repo_id: &str) -> Result<PathBuf> {
        let dir = self.repo_dir(repo_id)?;
        if !dir.join("HEAD").is_file() {
            return Err(StashError::NotARepository(dir));
        }
        Ok(dir)
    }

    /// Create the directory skeleton of an empty repository
    pub fn allocate_repository(&self, repo_id: &str) -> Result<PathBuf> {
        let dir = self.repo_dir(repo_id)?;
        if dir.exists() {
            return Err(StashError::InvalidArgument(format!("repository {} already allocated", repo_id)));
        }
        fs::create_dir_all(dir.join("objects"))?;
        fs::create_dir_all(dir.join(HEADS_DIR))?;
        fs::create_dir_all(dir.join(PENDING_DIR))?;
        refs::write_ref(&dir.join(HEADS_DIR).join(DEFAULT_BRANCH), None)?;
        fs::write(dir.join("HEAD"), refs::head_contents(DEFAULT_BRANCH))?;
        tracing::info!("allocated repository {} at {:?}", repo_id, dir);
        Ok(dir)
    }

    pub fn store(&self, repo_id: &str) -> Result<ObjectStore> {
        Ok(ObjectStore::new(self.existing_repo_dir(repo_id)?.join("objects")))
    }

    fn lock(&self, dir: &Path) -> Result<RepoLock> {
        RepoLock::acquire(dir, self.lock_timeout)
    }

    fn branch_ref(&self, dir: &Path, branch: &str) -> Result<PathBuf> {
        refs::resolve_branch_ref(&dir.join(HEADS_DIR), branch)
    }

    /// Create an empty ref for `branch` if it does not exist yet. Returns
    /// whether it was created.
    pub fn ensure_branch(&self, repo_id: &str, branch: &str) -> Result<bool> {
        let dir = self.existing_repo_dir(repo_id)?;
        let path = self.branch_ref(&dir, branch)?;
        let _guard = self.lock(&dir)?;
        if path.is_file() {
            return Ok(false);
        }
        refs::write_ref(&path, None)?;
        tracing::debug!("created branch {} in repository {}", branch, repo_id);
        Ok(true)
    }

    pub fn head(&self, repo_id: &str, branch: &str) -> Result<Option<ObjectId>> {
        let dir = self.existing_repo_dir(repo_id)?;
        let path = self.branch_ref(&dir, branch)?;
        let _guard = self.lock(&dir)?;
        if !path.is_file() {
            return Err(StashError::BranchNotFound(branch.to_string()));
        }
        refs::read_ref(&path)
    }

    /// Point `branch` at `tip` if it still points at `expected`. The read,
    /// the comparison and the write happen under one repository lock, so of
    /// two updates from the same starting point only the first lands.
    pub fn compare_and_set_head(
        &self,
        repo_id: &str,
        branch: &str,
        expected: Option<ObjectId>,
        tip: ObjectId,
    ) -> Result<()> {
        let dir = self.existing_repo_dir(repo_id)?;
        let path = self.branch_ref(&dir, branch)?;
        let store = ObjectStore::new(dir.join("objects"));
        if !store.contains(&tip) {
            return Err(StashError::ObjectNotFound(tip));
        }
        let _guard = self.lock(&dir)?;
        let current = if path.is_file() { refs::read_ref(&path)? } else { None };
        if current != expected {
            return Err(StashError::NonFastForward(format!(
                "{} moved to {} since it was read at {}",
                branch,
                optional_hex(current),
                optional_hex(expected)
            )));
        }
        refs::write_ref(&path, Some(tip))?;
        Ok(())
    }

    pub fn branches(&self, repo_id: &str) -> Result<Vec<String>> {
        let dir = self.existing_repo_dir(repo_id)?;
        refs::list_branches(&dir.join(HEADS_DIR))
    }

    /// Store a packfile's objects while holding the repository lock
    pub fn execute_packfile(&self, repo_id: &str, data: &[u8]) -> Result<PackStats> {
        let dir = self.existing_repo_dir(repo_id)?;
        let _guard = self.lock(&dir)?;
        execute_packfile(&ObjectStore::new(dir.join("objects")), data)
    }

    pub fn read_object(&self, repo_id: &str, id: &ObjectId) -> Result<Option<Vec<u8>>> {
        self.store(repo_id)?.try_get(id)
    }

    /// Record a proposed ref update instead of applying it
    pub fn record_pending_change(&self, repo_id: &str, branch: &str, author: &str, tip: ObjectId) -> Result<PendingChange> {
        let dir = self.existing_repo_dir(repo_id)?;
        self.branch_ref(&dir, branch)?;
        let previous = match self.head(repo_id, branch) {
            Ok(tip) => tip,
            Err(StashError::BranchNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let change = PendingChange {
            id: uuid::Uuid::new_v4().to_string(),
            branch: branch.to_string(),
            author: author.to_string(),
            tip,
            previous,
            created_at: chrono::Utc::now().timestamp(),
        };
        let pending = dir.join(PENDING_DIR);
        fs::create_dir_all(&pending)?;
        let path = pending.join(format!("{}.json", change.id));
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(&change)?)?;
        fs::rename(&tmp_path, &path)?;
        tracing::info!("recorded pending change {} on {}/{} by {}", change.id, repo_id, branch, author);
        Ok(change)
    }

    /// Pending changes, oldest first
    pub fn pending_changes(&self, repo_id: &str) -> Result<Vec<PendingChange>> {
        let dir = self.existing_repo_dir(repo_id)?.join(PENDING_DIR);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut changes = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                let change: PendingChange = serde_json::from_str(&fs::read_to_string(&path)?)?;
                changes.push(change);
            }
        }
        changes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(changes)
    }

    /// Head commit of `branch` plus the entries of its root tree
    pub fn head_listing(&self, repo_id: &str, branch: &str) -> Result<HeadListing> {
        let head = self.head(repo_id, branch)?;
        let files = match head {
            Some(tip) => {
                let store = self.store(repo_id)?;
                let tree = store.read_commit(&tip)?.tree;
                store.read_tree(&tree)?.entries
            }
            None => Vec::new(),
        };
        Ok(HeadListing { head, files })
    }
}
