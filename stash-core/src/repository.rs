//! Working-directory repository
//!
//! Layout on disk:
//! ```text
//! {work_dir}/
//!   .stash/
//!     HEAD                      "ref: refs/head/<branch>"
//!     config                    remotes (INI)
//!     index/d                   staging set (JSON)
//!     refs/head/<branch>        tip commit id or empty
//!     objects/{hash[0..2]}/{hash[2..]}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::diff::{tree_diff, DiffLines};
use crate::error::{Result, StashError};
use crate::object::{Commit, ObjectId, ObjectKind, Tree, TreeEntry};
use crate::refs::{self, DEFAULT_BRANCH, HEADS_DIR};
use crate::store::ObjectStore;

/// Control metadata directory, never tracked or touched by checkouts
pub const CONTROL_DIR: &str = ".stash";

/// Per-directory ignore list consulted by `add`
pub const IGNORE_FILE: &str = ".stashignore";

/// Persisted staging set
#[derive(Debug, Default, Serialize, Deserialize)]
struct StagingIndex {
    paths: BTreeSet<PathBuf>,
}

/// A stash repository rooted at a working directory
#[derive(Debug, Clone)]
pub struct Repository {
    work_dir: PathBuf,
    meta_dir: PathBuf,
    store: ObjectStore,
}

impl Repository {
    /// Create an empty repository in `work_dir` with a `main` branch
    pub fn init(work_dir: &Path) -> Result<Self> {
        fs::create_dir_all(work_dir)?;
        let work_dir = fs::canonicalize(work_dir)?;
        let meta_dir = work_dir.join(CONTROL_DIR);
        if meta_dir.exists() {
            return Err(StashError::InvalidArgument(format!(
                "repository already initialized at {:?}",
                work_dir
            )));
        }

        for dir in ["objects", "index", HEADS_DIR] {
            fs::create_dir_all(meta_dir.join(dir))?;
        }
        let repo = Self::from_parts(work_dir, meta_dir);
        repo.save_index(&StagingIndex::default())?;
        fs::write(repo.config_path(), "")?;
        refs::write_ref(&repo.heads_dir().join(DEFAULT_BRANCH), None)?;
        fs::write(repo.meta_dir.join("HEAD"), refs::head_contents(DEFAULT_BRANCH))?;

        tracing::info!("initialized empty repository at {:?}", repo.work_dir);
        Ok(repo)
    }

    /// Open an existing repository
    pub fn open(work_dir: &Path) -> Result<Self> {
        let work_dir = fs::canonicalize(work_dir)
            .map_err(|_| StashError::NotARepository(work_dir.to_path_buf()))?;
        let meta_dir = work_dir.join(CONTROL_DIR);
        if !meta_dir.join("HEAD").is_file() {
            return Err(StashError::NotARepository(work_dir));
        }
        Ok(Self::from_parts(work_dir, meta_dir))
    }

    fn from_parts(work_dir: PathBuf, meta_dir: PathBuf) -> Self {
        let store = ObjectStore::new(meta_dir.join("objects"));
        Self {
            work_dir,
            meta_dir,
            store,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn meta_dir(&self) -> &Path {
        &self.meta_dir
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn config_path(&self) -> PathBuf {
        self.meta_dir.join("config")
    }

    fn heads_dir(&self) -> PathBuf {
        self.meta_dir.join(HEADS_DIR)
    }

    fn index_path(&self) -> PathBuf {
        self.meta_dir.join("index").join("d")
    }

    // ==================== Refs ====================

    /// Branch named by HEAD
    pub fn current_branch(&self) -> Result<String> {
        refs::parse_head(&fs::read_to_string(self.meta_dir.join("HEAD"))?)
    }

    fn set_current_branch(&self, branch: &str) -> Result<()> {
        fs::write(self.meta_dir.join("HEAD"), refs::head_contents(branch))?;
        Ok(())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(refs::resolve_branch_ref(&self.heads_dir(), branch)?.is_file())
    }

    /// Tip commit of `branch`; `None` if the branch has no commits yet
    pub fn head_commit(&self, branch: &str) -> Result<Option<ObjectId>> {
        let path = refs::resolve_branch_ref(&self.heads_dir(), branch)?;
        if !path.is_file() {
            return Err(StashError::BranchNotFound(branch.to_string()));
        }
        refs::read_ref(&path)
    }

    /// Point `branch` at `tip`, creating the ref if needed
    pub fn set_head_commit(&self, branch: &str, tip: Option<ObjectId>) -> Result<()> {
        let path = refs::resolve_branch_ref(&self.heads_dir(), branch)?;
        refs::write_ref(&path, tip)
    }

    pub fn branches(&self) -> Result<Vec<String>> {
        refs::list_branches(&self.heads_dir())
    }

    pub fn create_branch(&self, name: &str, tip: Option<ObjectId>) -> Result<()> {
        let path = refs::resolve_branch_ref(&self.heads_dir(), name)?;
        if path.exists() {
            return Err(StashError::InvalidArgument(format!("branch '{}' already exists", name)));
        }
        refs::write_ref(&path, tip)?;
        tracing::debug!("created branch {} at {:?}", name, tip);
        Ok(())
    }

    pub fn delete_branch(&self, name: &str) -> Result<()> {
        if self.current_branch()? == name {
            return Err(StashError::InvalidArgument(format!(
                "cannot delete the current branch '{}'",
                name
            )));
        }
        let path = refs::resolve_branch_ref(&self.heads_dir(), name)?;
        if !path.is_file() {
            return Err(StashError::BranchNotFound(name.to_string()));
        }
        fs::remove_file(path)?;
        Ok(())
    }

    // ==================== Staging ====================

    fn load_index(&self) -> Result<StagingIndex> {
        let data = fs::read(self.index_path())?;
        if data.is_empty() {
            return Ok(StagingIndex::default());
        }
        Ok(serde_json::from_slice(&data)?)
    }

    fn save_index(&self, index: &StagingIndex) -> Result<()> {
        let path = self.index_path();
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_vec(index)?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Absolute paths marked for the next commit
    pub fn staged(&self) -> Result<BTreeSet<PathBuf>> {
        Ok(self.load_index()?.paths)
    }

    /// Stage a file, or every non-ignored file below a directory.
    /// Returns how many files were staged.
    pub fn add(&self, path: &Path) -> Result<usize> {
        let target = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        };
        let target = fs::canonicalize(&target)?;
        if !target.starts_with(&self.work_dir) {
            return Err(StashError::DirectoryTraversal(format!(
                "{:?} is outside the repository",
                path
            )));
        }
        if target.starts_with(&self.meta_dir) {
            return Err(StashError::InvalidArgument("cannot stage repository metadata".into()));
        }

        let mut index = self.load_index()?;
        let mut added = 0;
        if target.is_dir() {
            let mut ignores = HashSet::new();
            for ancestor in target.ancestors() {
                ignores.extend(load_ignore_file(ancestor)?);
                if ancestor == self.work_dir {
                    break;
                }
            }
            let mut stack = vec![(target, ignores)];
            while let Some((dir, inherited)) = stack.pop() {
                let mut ignores = inherited;
                ignores.extend(load_ignore_file(&dir)?);
                for entry in fs::read_dir(&dir)? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name == CONTROL_DIR || ignores.contains(&name) {
                        continue;
                    }
                    let file_type = entry.file_type()?;
                    if file_type.is_dir() {
                        stack.push((entry.path(), ignores.clone()));
                    } else if file_type.is_file() {
                        index.paths.insert(entry.path());
                        added += 1;
                    }
                }
            }
        } else {
            index.paths.insert(target);
            added = 1;
        }

        self.save_index(&index)?;
        Ok(added)
    }

    // ==================== Commits ====================

    /// Snapshot staged files into a tree and commit it on the current branch
    pub fn commit(&self, message: &str) -> Result<ObjectId> {
        let branch = self.current_branch()?;
        let staged = self.staged()?;
        let (tree, _) = self.build_tree(&staged, &self.work_dir)?;
        let parent = self.head_commit(&branch)?;
        let id = self.make_commit(message, tree, parent)?;
        self.set_head_commit(&branch, Some(id))?;
        tracing::info!("committed {} on {}", id, branch);
        Ok(id)
    }

    /// Walk `root_dir` and store every staged file as a blob. Directories
    /// yield a tree entry only when something below them was staged.
    pub fn build_tree(&self, staged: &BTreeSet<PathBuf>, root_dir: &Path) -> Result<(ObjectId, Vec<TreeEntry>)> {
        let entries = self.collect_entries(staged, root_dir, root_dir)?;
        let id = self.store.write_tree(&Tree::from_entries(entries.clone()))?;
        Ok((id, entries))
    }

    fn collect_entries(&self, staged: &BTreeSet<PathBuf>, root: &Path, dir: &Path) -> Result<Vec<TreeEntry>> {
        let mut children = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            match entry.file_name().into_string() {
                Ok(name) if name == CONTROL_DIR => {}
                Ok(name) if name.contains('\n') => {
                    tracing::warn!("skipping {:?}: newline in file name", entry.path());
                }
                Ok(name) => children.push((name, entry)),
                Err(raw) => tracing::warn!("skipping non UTF-8 path {:?}", raw),
            }
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));

        let mut entries = Vec::new();
        for (_, entry) in children {
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_file() {
                if staged.contains(&path) {
                    let id = self.store.put(ObjectKind::Blob, &fs::read(&path)?)?;
                    entries.push(TreeEntry::new(ObjectKind::Blob, id, relative_path(root, &path)?));
                }
            } else if file_type.is_dir() {
                let nested = self.collect_entries(staged, root, &path)?;
                if !nested.is_empty() {
                    let id = self.store.write_tree(&Tree::from_entries(nested))?;
                    entries.push(TreeEntry::new(ObjectKind::Tree, id, relative_path(root, &path)?));
                }
            }
        }
        Ok(entries)
    }

    /// Store a commit object
    pub fn make_commit(&self, message: &str, tree: ObjectId, parent: Option<ObjectId>) -> Result<ObjectId> {
        self.store.write_commit(&Commit::new(parent, tree, message))
    }

    pub fn read_commit(&self, id: &ObjectId) -> Result<Commit> {
        self.store.read_commit(id)
    }

    /// Commits reachable from the tip of `branch`, newest first
    pub fn log(&self, branch: &str) -> Result<Vec<(ObjectId, Commit)>> {
        let mut history = Vec::new();
        let mut cursor = self.head_commit(branch)?;
        while let Some(id) = cursor {
            let commit = self.store.read_commit(&id)?;
            cursor = commit.parent;
            history.push((id, commit));
        }
        Ok(history)
    }

    /// Decompressed payload of any object
    pub fn cat_file(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.store.get(id)
    }

    pub fn ls_tree(&self, id: &ObjectId) -> Result<Tree> {
        self.store.read_tree(id)
    }

    /// Changes between the trees of two commits
    pub fn diff_commits(&self, from: &ObjectId, to: &ObjectId) -> Result<DiffLines> {
        let from_tree = self.store.read_commit(from)?.tree;
        let to_tree = self.store.read_commit(to)?.tree;
        tree_diff(&self.store, &from_tree, &to_tree)
    }

    // ==================== Working tree ====================

    /// Switch HEAD to `branch`, optionally creating it from the current tip,
    /// and materialize its snapshot
    pub fn checkout(&self, branch: &str, create: bool) -> Result<()> {
        let exists = self.branch_exists(branch)?;
        if !exists && !create {
            return Err(StashError::BranchNotFound(branch.to_string()));
        }
        if !exists {
            let tip = self.head_commit(&self.current_branch()?)?;
            self.create_branch(branch, tip)?;
        }
        self.set_current_branch(branch)?;

        if exists {
            if let Some(tip) = self.head_commit(branch)? {
                let tree = self.store.read_commit(&tip)?.tree;
                self.apply_tree_to_directory(&tree, &self.work_dir)?;
            }
        }
        Ok(())
    }

    /// Make `target_dir` mirror `tree`. See [`apply_tree_to_directory`].
    pub fn apply_tree_to_directory(&self, tree: &ObjectId, target_dir: &Path) -> Result<()> {
        apply_tree_to_directory(&self.store, tree, target_dir)
    }
}

/// Materialize `tree` onto `target_dir`: files and directories absent from
/// the tree are deleted (the control directory excepted), missing
/// directories are created and every blob is written out.
///
/// Not atomic: a failure midway leaves a partially updated directory.
pub fn apply_tree_to_directory(store: &ObjectStore, tree: &ObjectId, target_dir: &Path) -> Result<()> {
    let mut stack = vec![(*tree, target_dir.to_path_buf(), String::new())];

    while let Some((tree_id, dir, rel)) = stack.pop() {
        fs::create_dir_all(&dir)?;
        let tree = store.read_tree(&tree_id)?;

        let mut wanted: HashMap<&str, &TreeEntry> = HashMap::new();
        for entry in tree.iter() {
            let name = entry.name();
            let expected = if rel.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", rel, name)
            };
            if !is_safe_name(name) || entry.path != expected {
                return Err(StashError::MalformedObject(format!(
                    "tree {} holds unsafe path {:?}",
                    tree_id, entry.path
                )));
            }
            wanted.insert(name, entry);
        }

        for existing in fs::read_dir(&dir)? {
            let existing = existing?;
            let name = existing.file_name();
            if name == CONTROL_DIR {
                continue;
            }
            // DirEntry::file_type does not follow links; a link is never
            // kept, so blobs are not written through it
            let file_type = existing.file_type()?;
            let keep = !file_type.is_symlink()
                && name
                    .to_str()
                    .and_then(|n| wanted.get(n))
                    .map(|e| (e.kind == ObjectKind::Tree) == file_type.is_dir())
                    .unwrap_or(false);
            if !keep {
                if file_type.is_dir() {
                    fs::remove_dir_all(existing.path())?;
                } else {
                    fs::remove_file(existing.path())?;
                }
            }
        }

        for entry in tree.iter() {
            let path = dir.join(entry.name());
            match entry.kind {
                ObjectKind::Tree => stack.push((entry.id, path, entry.path.clone())),
                _ => fs::write(&path, store.get(&entry.id)?)?,
            }
        }
    }
    Ok(())
}

/// Join a tree-relative `/` path onto `base`, refusing anything that could
/// leave `base` or reach the control directory
pub fn safe_join(base: &Path, rel: &str) -> Result<PathBuf> {
    let mut out = base.to_path_buf();
    for part in rel.split('/') {
        if !is_safe_name(part) {
            return Err(StashError::MalformedObject(format!("unsafe tree path {:?}", rel)));
        }
        out.push(part);
    }
    Ok(out)
}

fn is_safe_name(name: &str) -> bool {
    if name.is_empty() || name == CONTROL_DIR || name.contains('\\') || name.contains('\0') {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!((components.next(), components.next()), (Some(Component::Normal(_)), None))
}

fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| StashError::InvalidArgument(format!("{:?} is not below {:?}", path, root)))?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()
        .ok_or_else(|| StashError::InvalidArgument(format!("non UTF-8 path {:?}", rel)))?;
    Ok(parts.join("/"))
}

fn load_ignore_file(dir: &Path) -> Result<HashSet<String>> {
    let path = dir.join(IGNORE_FILE);
    if !path.is_file() {
        return Ok(HashSet::new());
    }
    Ok(fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}
