//! Branch merging
//!
//! Histories are single-parent chains, so ancestry questions reduce to
//! walking parent pointers. Three-way merges work on flattened blob maps and
//! rebuild the nested trees afterwards.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::diff::{blob_changes, flatten_tree, tree_diff};
use crate::error::{Result, StashError};
use crate::object::{Commit, ObjectId, ObjectKind, Tree, TreeEntry};
use crate::repository::{apply_tree_to_directory, safe_join, Repository};
use crate::store::ObjectStore;

/// What a merge did to the current branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Nothing to do: the other branch is already contained
    UpToDate,
    /// Current branch moved to the other branch's tip
    FastForward { tip: ObjectId },
    /// A merge commit was created
    ThreeWay { commit: ObjectId, ancestor: ObjectId },
}

/// Whether a ref at `from_tip` can move to `to_tip` without losing commits,
/// i.e. `from_tip` appears in the history of `to_tip`. An empty branch can
/// fast-forward to anything.
pub fn can_fast_forward(store: &ObjectStore, from_tip: Option<ObjectId>, to_tip: Option<ObjectId>) -> Result<bool> {
    let Some(from) = from_tip else {
        return Ok(true);
    };
    let mut cursor = to_tip;
    while let Some(id) = cursor {
        if id == from {
            return Ok(true);
        }
        cursor = store.read_commit(&id)?.parent;
    }
    Ok(false)
}

/// Most recent commit shared by the histories of `a` and `b`.
///
/// Two cursors walk their chains and restart on the opposite tip once they
/// run out, so both have covered the same number of steps when they meet on
/// the first shared commit. Disjoint histories leave both cursors exhausted.
pub fn find_common_ancestor(store: &ObjectStore, a: ObjectId, b: ObjectId) -> Result<ObjectId> {
    let mut p = Some(a);
    let mut q = Some(b);
    while p != q {
        p = match p {
            Some(id) => store.read_commit(&id)?.parent,
            None => Some(b),
        };
        q = match q {
            Some(id) => store.read_commit(&id)?.parent,
            None => Some(a),
        };
    }
    p.ok_or_else(|| StashError::NoCommonAncestor(a.to_hex(), b.to_hex()))
}

/// Common ancestor of `tip` and `other` when `tip`'s snapshot already holds
/// every change `other` made since that ancestor, as it does after merging
/// `other` in. `None` if some of `other`'s changes are missing or the
/// histories are unrelated.
pub fn merged_base(store: &ObjectStore, tip: ObjectId, other: ObjectId) -> Result<Option<ObjectId>> {
    let ancestor = match find_common_ancestor(store, tip, other) {
        Ok(ancestor) => ancestor,
        Err(StashError::NoCommonAncestor(..)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let base_tree = store.read_commit(&ancestor)?.tree;
    let other_tree = store.read_commit(&other)?.tree;
    let files = flatten_tree(store, &store.read_commit(&tip)?.tree)?;

    let theirs = blob_changes(store, &tree_diff(store, &base_tree, &other_tree)?)?;
    let merged = theirs.iter().all(|(path, change)| files.get(path).copied() == *change);
    Ok(merged.then_some(ancestor))
}

/// Move `from_branch` to the tip of `to_branch` and materialize its snapshot
pub fn fast_forward_merge(repo: &Repository, from_branch: &str, to_branch: &str) -> Result<Option<ObjectId>> {
    let tip = repo.head_commit(to_branch)?;
    repo.set_head_commit(from_branch, tip)?;
    if let Some(tip) = tip {
        let tree = repo.store().read_commit(&tip)?.tree;
        apply_tree_to_directory(repo.store(), &tree, repo.work_dir())?;
    }
    tracing::info!("fast-forwarded {} to {}", from_branch, to_branch);
    Ok(tip)
}

/// Merge `branch_b` into `branch_a` against their common ancestor.
///
/// A path changed on both sides to different contents is a conflict; the
/// working directory and refs are left untouched in that case. Otherwise
/// `branch_b`'s changes are written into the working directory and a merge
/// commit on `branch_a` records the combined snapshot.
pub fn three_way_merge(repo: &Repository, branch_a: &str, branch_b: &str) -> Result<MergeOutcome> {
    let store = repo.store();
    let a_tip = repo
        .head_commit(branch_a)?
        .ok_or_else(|| StashError::NoChangesToSync(format!("branch '{}' has no commits", branch_a)))?;
    let b_tip = repo
        .head_commit(branch_b)?
        .ok_or_else(|| StashError::NoChangesToSync(format!("branch '{}' has no commits", branch_b)))?;

    let ancestor = find_common_ancestor(store, a_tip, b_tip)?;
    let base_tree = store.read_commit(&ancestor)?.tree;
    let a_tree = store.read_commit(&a_tip)?.tree;
    let b_tree = store.read_commit(&b_tip)?.tree;

    let ours = blob_changes(store, &tree_diff(store, &base_tree, &a_tree)?)?;
    let theirs = blob_changes(store, &tree_diff(store, &base_tree, &b_tree)?)?;
    for (path, change) in &theirs {
        if let Some(local) = ours.get(path) {
            if local != change {
                return Err(StashError::MergeConflict(path.clone()));
            }
        }
    }

    let mut merged = flatten_tree(store, &a_tree)?;
    for (path, change) in &theirs {
        match change {
            Some(id) => merged.insert(path.clone(), *id),
            None => merged.remove(path),
        };
    }
    let merged_tree = write_flat_tree(store, &merged)?;

    for (path, change) in &theirs {
        let target = safe_join(repo.work_dir(), path)?;
        match change {
            Some(id) => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, store.get(id)?)?;
            }
            None => remove_with_empty_parents(repo.work_dir(), &target)?,
        }
    }

    let message = format!("Merge branch '{}' into '{}'", branch_b, branch_a);
    let commit = store.write_commit(&Commit::new(Some(a_tip), merged_tree, message))?;
    repo.set_head_commit(branch_a, Some(commit))?;
    tracing::info!("merged {} into {} as {}", branch_b, branch_a, commit);
    Ok(MergeOutcome::ThreeWay { commit, ancestor })
}

/// Rebuild nested tree objects from a path -> blob map and return the root
fn write_flat_tree(store: &ObjectStore, files: &BTreeMap<String, ObjectId>) -> Result<ObjectId> {
    let mut dirs: BTreeMap<String, Vec<TreeEntry>> = BTreeMap::new();
    dirs.insert(String::new(), Vec::new());

    for (path, id) in files {
        let parent = parent_of(path);
        dirs.entry(parent.to_string())
            .or_default()
            .push(TreeEntry::new(ObjectKind::Blob, *id, path.clone()));
        let mut dir = parent;
        while !dir.is_empty() {
            dir = parent_of(dir);
            dirs.entry(dir.to_string()).or_default();
        }
    }
    if let Some(clash) = dirs.keys().find(|d| files.contains_key(*d)) {
        return Err(StashError::MergeConflict(clash.clone()));
    }

    let mut order: Vec<String> = dirs.keys().filter(|d| !d.is_empty()).cloned().collect();
    order.sort_by_key(|d| Reverse(d.matches('/').count()));
    for dir in order {
        let mut entries = dirs.remove(&dir).unwrap_or_default();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let id = store.write_tree(&Tree::from_entries(entries))?;
        dirs.entry(parent_of(&dir).to_string())
            .or_default()
            .push(TreeEntry::new(ObjectKind::Tree, id, dir));
    }

    let mut root = dirs.remove("").unwrap_or_default();
    root.sort_by(|a, b| a.path.cmp(&b.path));
    store.write_tree(&Tree::from_entries(root))
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn remove_with_empty_parents(root: &Path, target: &Path) -> Result<()> {
    match fs::remove_file(target) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    let mut dir = target.parent();
    while let Some(d) = dir {
        if d == root || fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
    Ok(())
}

impl Repository {
    /// Merge `branch` into the current branch
    pub fn merge(&self, branch: &str) -> Result<MergeOutcome> {
        let current = self.current_branch()?;
        if current == branch {
            return Err(StashError::InvalidArgument("cannot merge a branch into itself".into()));
        }
        let ours = self.head_commit(&current)?;
        let theirs = self
            .head_commit(branch)?
            .ok_or_else(|| StashError::NoChangesToSync(format!("branch '{}' has no commits", branch)))?;

        if ours == Some(theirs) || can_fast_forward(self.store(), Some(theirs), ours)? {
            return Ok(MergeOutcome::UpToDate);
        }
        if can_fast_forward(self.store(), ours, Some(theirs))? {
            fast_forward_merge(self, &current, branch)?;
            return Ok(MergeOutcome::FastForward { tip: theirs });
        }
        three_way_merge(self, &current, branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(repo: &Repository, rel: &str, data: &str) {
        let path = repo.work_dir().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    fn read(repo: &Repository, rel: &str) -> String {
        fs::read_to_string(repo.work_dir().join(rel)).unwrap()
    }

    fn commit_all(repo: &Repository, msg: &str) -> ObjectId {
        repo.add(Path::new(".")).unwrap();
        repo.commit(msg).unwrap()
    }

    fn setup() -> (TempDir, Repository) {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::init(tmp.path()).unwrap();
        (tmp, repo)
    }

    fn chain(store: &ObjectStore, parent: Option<ObjectId>, msg: &str) -> ObjectId {
        let tree = store.write_tree(&Tree::new()).unwrap();
        store.write_commit(&Commit::new(parent, tree, msg)).unwrap()
    }

    #[test]
    fn test_can_fast_forward() {
        let (_tmp, repo) = setup();
        let store = repo.store();
        let c1 = chain(store, None, "c1");
        let c2 = chain(store, Some(c1), "c2");
        let other = chain(store, None, "other");

        assert!(can_fast_forward(store, Some(c1), Some(c2)).unwrap());
        assert!(!can_fast_forward(store, Some(c2), Some(c1)).unwrap());
        assert!(can_fast_forward(store, None, Some(c1)).unwrap());
        assert!(!can_fast_forward(store, Some(other), Some(c2)).unwrap());
    }

    #[test]
    fn test_common_ancestor_uneven_chains() {
        let (_tmp, repo) = setup();
        let store = repo.store();
        let base = chain(store, None, "base");
        let a1 = chain(store, Some(base), "a1");
        let a2 = chain(store, Some(a1), "a2");
        let a3 = chain(store, Some(a2), "a3");
        let b1 = chain(store, Some(base), "b1");

        assert_eq!(find_common_ancestor(store, a3, b1).unwrap(), base);
        assert_eq!(find_common_ancestor(store, b1, a3).unwrap(), base);
        assert_eq!(find_common_ancestor(store, a3, a1).unwrap(), a1);
    }

    #[test]
    fn test_disjoint_histories() {
        let (_tmp, repo) = setup();
        let store = repo.store();
        let x = chain(store, None, "x");
        let y = chain(store, Some(chain(store, None, "y0")), "y1");
        assert!(matches!(
            find_common_ancestor(store, x, y),
            Err(StashError::NoCommonAncestor(_, _))
        ));
    }

    #[test]
    fn test_merge_fast_forward() {
        let (_tmp, repo) = setup();
        write(&repo, "a.txt", "1");
        commit_all(&repo, "c1");
        repo.checkout("feature", true).unwrap();
        write(&repo, "b.txt", "2");
        let c2 = commit_all(&repo, "c2");
        repo.checkout("main", false).unwrap();
        assert!(!repo.work_dir().join("b.txt").exists());

        assert_eq!(repo.merge("feature").unwrap(), MergeOutcome::FastForward { tip: c2 });
        assert_eq!(repo.head_commit("main").unwrap(), Some(c2));
        assert_eq!(read(&repo, "b.txt"), "2");
        assert_eq!(repo.merge("feature").unwrap(), MergeOutcome::UpToDate);
    }

    #[test]
    fn test_three_way_merge_combines_changes() {
        let (_tmp, repo) = setup();
        write(&repo, "shared.txt", "base");
        write(&repo, "dir/gone.txt", "bye");
        let base = commit_all(&repo, "base");

        repo.checkout("other", true).unwrap();
        write(&repo, "theirs/new.txt", "theirs");
        fs::remove_file(repo.work_dir().join("dir/gone.txt")).unwrap();
        commit_all(&repo, "theirs");

        repo.checkout("main", false).unwrap();
        write(&repo, "ours.txt", "ours");
        let ours = commit_all(&repo, "ours");

        let outcome = repo.merge("other").unwrap();
        let MergeOutcome::ThreeWay { commit, ancestor } = outcome else {
            panic!("expected a three-way merge, got {:?}", outcome);
        };
        assert_eq!(ancestor, base);

        let merge_commit = repo.read_commit(&commit).unwrap();
        assert_eq!(merge_commit.parent, Some(ours));
        assert_eq!(merge_commit.message, "Merge branch 'other' into 'main'");

        let files = flatten_tree(repo.store(), &merge_commit.tree).unwrap();
        let paths: Vec<_> = files.keys().map(String::as_str).collect();
        assert_eq!(paths, vec!["ours.txt", "shared.txt", "theirs/new.txt"]);

        assert_eq!(read(&repo, "theirs/new.txt"), "theirs");
        assert_eq!(read(&repo, "ours.txt"), "ours");
        assert!(!repo.work_dir().join("dir").exists());
    }

    #[test]
    fn test_conflicting_edits_leave_everything_untouched() {
        let (_tmp, repo) = setup();
        write(&repo, "f.txt", "base");
        commit_all(&repo, "base");

        repo.checkout("other", true).unwrap();
        write(&repo, "f.txt", "theirs");
        commit_all(&repo, "theirs");

        repo.checkout("main", false).unwrap();
        write(&repo, "f.txt", "ours");
        let ours = commit_all(&repo, "ours");

        let err = repo.merge("other").unwrap_err();
        assert!(matches!(err, StashError::MergeConflict(ref p) if p == "f.txt"));
        assert_eq!(read(&repo, "f.txt"), "ours");
        assert_eq!(repo.head_commit("main").unwrap(), Some(ours));
    }

    #[test]
    fn test_identical_edits_are_not_conflicts() {
        let (_tmp, repo) = setup();
        write(&repo, "f.txt", "base");
        commit_all(&repo, "base");
        repo.checkout("other", true).unwrap();
        write(&repo, "f.txt", "same");
        write(&repo, "g.txt", "g");
        commit_all(&repo, "theirs");
        repo.checkout("main", false).unwrap();
        write(&repo, "f.txt", "same");
        commit_all(&repo, "ours");

        assert!(matches!(repo.merge("other").unwrap(), MergeOutcome::ThreeWay { .. }));
        assert_eq!(read(&repo, "g.txt"), "g");
    }

    #[test]
    fn test_branch_edit_fast_forwards_into_main() {
        let (_tmp, repo) = setup();
        write(&repo, "a.txt", "hello");
        let c1 = commit_all(&repo, "c1");
        repo.create_branch("dev", Some(c1)).unwrap();
        repo.checkout("dev", false).unwrap();
        write(&repo, "a.txt", "hello world");
        let c2 = commit_all(&repo, "c2");

        repo.checkout("main", false).unwrap();
        assert_eq!(read(&repo, "a.txt"), "hello");

        assert!(can_fast_forward(repo.store(), Some(c1), Some(c2)).unwrap());
        assert_eq!(repo.merge("dev").unwrap(), MergeOutcome::FastForward { tip: c2 });
        assert_eq!(read(&repo, "a.txt"), "hello world");
        assert_eq!(repo.head_commit("main").unwrap(), Some(c2));
        assert_eq!(repo.head_commit("main").unwrap(), repo.head_commit("dev").unwrap());
    }

    #[test]
    fn test_fast_forward_removes_files_dropped_by_target() {
        let (_tmp, repo) = setup();
        write(&repo, "keep.txt", "keep");
        write(&repo, "old/stale.txt", "stale");
        let c1 = commit_all(&repo, "c1");
        repo.checkout("feature", true).unwrap();
        fs::remove_dir_all(repo.work_dir().join("old")).unwrap();
        write(&repo, "new.txt", "new");
        let c2 = commit_all(&repo, "c2");
        repo.checkout("main", false).unwrap();
        assert_eq!(repo.head_commit("main").unwrap(), Some(c1));
        assert_eq!(read(&repo, "old/stale.txt"), "stale");

        assert_eq!(repo.merge("feature").unwrap(), MergeOutcome::FastForward { tip: c2 });
        assert!(!repo.work_dir().join("old/stale.txt").exists());
        assert_eq!(read(&repo, "keep.txt"), "keep");
        assert_eq!(read(&repo, "new.txt"), "new");

        let tree = repo.read_commit(&c2).unwrap().tree;
        let expected: Vec<_> = flatten_tree(repo.store(), &tree).unwrap().into_keys().collect();
        assert_eq!(expected, vec!["keep.txt".to_string(), "new.txt".to_string()]);
    }

    #[test]
    fn test_merged_base_after_three_way_merge() {
        let (_tmp, repo) = setup();
        write(&repo, "a.txt", "a");
        let base = commit_all(&repo, "base");
        repo.checkout("other", true).unwrap();
        write(&repo, "b.txt", "b");
        let theirs = commit_all(&repo, "theirs");
        repo.checkout("main", false).unwrap();
        write(&repo, "c.txt", "c");
        let ours = commit_all(&repo, "ours");
        let store = repo.store();

        assert_eq!(merged_base(store, ours, theirs).unwrap(), None);
        let MergeOutcome::ThreeWay { commit, .. } = repo.merge("other").unwrap() else {
            panic!("expected a merge commit");
        };
        assert!(!can_fast_forward(store, Some(theirs), Some(commit)).unwrap());
        assert_eq!(merged_base(store, commit, theirs).unwrap(), Some(base));

        let unrelated = chain(store, None, "unrelated");
        assert_eq!(merged_base(store, commit, unrelated).unwrap(), None);
    }

    #[test]
    fn test_write_flat_tree_matches_build_tree() {
        let (_tmp, repo) = setup();
        write(&repo, "a/b/c.txt", "c");
        write(&repo, "a/d.txt", "d");
        write(&repo, "e.txt", "e");
        let commit = commit_all(&repo, "snapshot");
        let tree = repo.read_commit(&commit).unwrap().tree;

        let flat = flatten_tree(repo.store(), &tree).unwrap();
        assert_eq!(write_flat_tree(repo.store(), &flat).unwrap(), tree);
    }
}
