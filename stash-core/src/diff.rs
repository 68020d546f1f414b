//! Structural tree comparison
//!
//! `tree_diff` walks two trees with an explicit work stack. Identical hashes
//! short-circuit without touching the store, which is what keeps comparisons
//! of mostly-unchanged snapshots cheap.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;
use crate::object::{ObjectId, ObjectKind};
use crate::store::ObjectStore;

/// Classification of a changed path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    fn marker(&self) -> char {
        match self {
            ChangeKind::Added => '+',
            ChangeKind::Modified => '~',
            ChangeKind::Deleted => '-',
        }
    }
}

/// One changed path between two trees
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub change: ChangeKind,
    pub kind: ObjectKind,
    pub path: String,
    pub old: Option<ObjectId>,
    pub new: Option<ObjectId>,
}

impl fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.change.marker(), self.path)
    }
}

/// Ordered list of changes
pub type DiffLines = Vec<DiffEntry>;

/// Compare two trees. Added and deleted subtrees are reported as a single
/// tree-kind entry; modified subtrees are expanded into their own changes.
pub fn tree_diff(store: &ObjectStore, old_tree: &ObjectId, new_tree: &ObjectId) -> Result<DiffLines> {
    let mut lines = Vec::new();
    let mut stack = vec![(*old_tree, *new_tree)];

    while let Some((old_id, new_id)) = stack.pop() {
        if old_id == new_id {
            continue;
        }
        let old = store.read_tree(&old_id)?.to_map();
        let new = store.read_tree(&new_id)?;
        let mut nested = Vec::new();

        for entry in new.iter() {
            match old.get(&entry.path) {
                None => lines.push(DiffEntry {
                    change: ChangeKind::Added,
                    kind: entry.kind,
                    path: entry.path.clone(),
                    old: None,
                    new: Some(entry.id),
                }),
                Some((old_entry_id, _)) if *old_entry_id == entry.id => {}
                Some((old_entry_id, old_kind)) if *old_kind != entry.kind => {
                    lines.push(DiffEntry {
                        change: ChangeKind::Deleted,
                        kind: *old_kind,
                        path: entry.path.clone(),
                        old: Some(*old_entry_id),
                        new: None,
                    });
                    lines.push(DiffEntry {
                        change: ChangeKind::Added,
                        kind: entry.kind,
                        path: entry.path.clone(),
                        old: None,
                        new: Some(entry.id),
                    });
                }
                Some((old_entry_id, _)) => match entry.kind {
                    ObjectKind::Tree => nested.push((*old_entry_id, entry.id)),
                    _ => lines.push(DiffEntry {
                        change: ChangeKind::Modified,
                        kind: entry.kind,
                        path: entry.path.clone(),
                        old: Some(*old_entry_id),
                        new: Some(entry.id),
                    }),
                },
            }
        }

        let new_paths = new.to_map();
        for (path, (id, kind)) in &old {
            if !new_paths.contains_key(path) {
                lines.push(DiffEntry {
                    change: ChangeKind::Deleted,
                    kind: *kind,
                    path: path.clone(),
                    old: Some(*id),
                    new: None,
                });
            }
        }

        // Reverse so subtrees are visited in entry order.
        stack.extend(nested.into_iter().rev());
    }

    Ok(lines)
}

/// Render diff lines in the `+ path` / `~ path` / `- path` text form
pub fn render(lines: &[DiffEntry]) -> String {
    lines.iter().map(|l| format!("{}\n", l)).collect()
}

/// Every blob reachable from `tree`, keyed by its full relative path
pub fn flatten_tree(store: &ObjectStore, tree: &ObjectId) -> Result<BTreeMap<String, ObjectId>> {
    let mut blobs = BTreeMap::new();
    let mut stack = vec![*tree];
    while let Some(id) = stack.pop() {
        for entry in store.read_tree(&id)?.entries {
            match entry.kind {
                ObjectKind::Tree => stack.push(entry.id),
                _ => {
                    blobs.insert(entry.path, entry.id);
                }
            }
        }
    }
    Ok(blobs)
}

/// Blob-level view of a diff: every changed file path mapped to its new
/// content id, or `None` when the file was removed. Added and deleted
/// subtrees are expanded to the files they contain.
pub fn blob_changes(store: &ObjectStore, lines: &[DiffEntry]) -> Result<BTreeMap<String, Option<ObjectId>>> {
    let mut changes = BTreeMap::new();
    for line in lines {
        match (line.kind, line.change) {
            (ObjectKind::Tree, ChangeKind::Added) => {
                if let Some(new) = line.new {
                    for (path, id) in flatten_tree(store, &new)? {
                        changes.insert(path, Some(id));
                    }
                }
            }
            (ObjectKind::Tree, ChangeKind::Deleted) => {
                if let Some(old) = line.old {
                    for path in flatten_tree(store, &old)?.into_keys() {
                        changes.entry(path).or_insert(None);
                    }
                }
            }
            (_, ChangeKind::Deleted) => {
                changes.entry(line.path.clone()).or_insert(None);
            }
            _ => {
                changes.insert(line.path.clone(), line.new);
            }
        }
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Tree, TreeEntry};
    use tempfile::TempDir;

    fn blob(store: &ObjectStore, data: &str) -> ObjectId {
        store.put(ObjectKind::Blob, data.as_bytes()).unwrap()
    }

    fn tree(store: &ObjectStore, entries: Vec<TreeEntry>) -> ObjectId {
        store.write_tree(&Tree::from_entries(entries)).unwrap()
    }

    #[test]
    fn test_identical_hashes_short_circuit_without_store() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::new(tmp.path().join("does-not-exist"));
        let id = ObjectId::new([3; 20]);
        assert!(tree_diff(&store, &id, &id).unwrap().is_empty());
    }

    #[test]
    fn test_added_modified_deleted() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::new(tmp.path());
        let a1 = blob(&store, "a1");
        let a2 = blob(&store, "a2");
        let b = blob(&store, "b");
        let c = blob(&store, "c");

        let old = tree(&store, vec![
            TreeEntry::new(ObjectKind::Blob, a1, "a.txt"),
            TreeEntry::new(ObjectKind::Blob, b, "b.txt"),
        ]);
        let new = tree(&store, vec![
            TreeEntry::new(ObjectKind::Blob, a2, "a.txt"),
            TreeEntry::new(ObjectKind::Blob, c, "c.txt"),
        ]);

        let diff = tree_diff(&store, &old, &new).unwrap();
        assert_eq!(render(&diff), "~ a.txt\n+ c.txt\n- b.txt\n");
    }

    #[test]
    fn test_nested_change_recurses() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::new(tmp.path());
        let v1 = blob(&store, "v1");
        let v2 = blob(&store, "v2");
        let same = blob(&store, "same");

        let sub1 = tree(&store, vec![TreeEntry::new(ObjectKind::Blob, v1, "src/lib.rs")]);
        let sub2 = tree(&store, vec![TreeEntry::new(ObjectKind::Blob, v2, "src/lib.rs")]);
        let old = tree(&store, vec![
            TreeEntry::new(ObjectKind::Blob, same, "README"),
            TreeEntry::new(ObjectKind::Tree, sub1, "src"),
        ]);
        let new = tree(&store, vec![
            TreeEntry::new(ObjectKind::Blob, same, "README"),
            TreeEntry::new(ObjectKind::Tree, sub2, "src"),
        ]);

        let diff = tree_diff(&store, &old, &new).unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].path, "src/lib.rs");
        assert_eq!(diff[0].change, ChangeKind::Modified);
        assert_eq!(diff[0].new, Some(v2));
    }

    #[test]
    fn test_blob_changes_expand_subtrees() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::new(tmp.path());
        let x = blob(&store, "x");
        let sub = tree(&store, vec![TreeEntry::new(ObjectKind::Blob, x, "docs/x.md")]);
        let empty = tree(&store, vec![]);
        let with_docs = tree(&store, vec![TreeEntry::new(ObjectKind::Tree, sub, "docs")]);

        let added = tree_diff(&store, &empty, &with_docs).unwrap();
        assert_eq!(render(&added), "+ docs\n");
        let changes = blob_changes(&store, &added).unwrap();
        assert_eq!(changes.get("docs/x.md"), Some(&Some(x)));

        let removed = tree_diff(&store, &with_docs, &empty).unwrap();
        let changes = blob_changes(&store, &removed).unwrap();
        assert_eq!(changes.get("docs/x.md"), Some(&None));
    }

    #[test]
    fn test_flatten_tree() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::new(tmp.path());
        let x = blob(&store, "x");
        let y = blob(&store, "y");
        let sub = tree(&store, vec![TreeEntry::new(ObjectKind::Blob, y, "d/y")]);
        let root = tree(&store, vec![
            TreeEntry::new(ObjectKind::Blob, x, "x"),
            TreeEntry::new(ObjectKind::Tree, sub, "d"),
        ]);
        let flat = flatten_tree(&store, &root).unwrap();
        assert_eq!(flat.len(), 2);
        assert_eq!(flat["d/y"], y);
    }
}
