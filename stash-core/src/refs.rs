//! Branch refs and HEAD handling
//!
//! A branch ref is a plain-text file under `refs/head/<branch>` holding the
//! tip commit's hex id or the empty string. Branch names come from users and
//! remote peers, so every ref path is resolved through
//! [`resolve_branch_ref`], which refuses anything that does not land directly
//! inside the ref directory once symlinks and `..` are resolved.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, StashError};
use crate::object::{ObjectId, optional_hex};

/// Branch created by `init`
pub const DEFAULT_BRANCH: &str = "main";

/// Ref directory relative to a repository's metadata root
pub const HEADS_DIR: &str = "refs/head";

/// Resolve `branch` to its ref file inside `heads_dir`.
///
/// The branch must be a single normal path component and the resolved path
/// (after canonicalizing the ref directory and any existing ref file) must be
/// an immediate child of the canonical ref directory.
pub fn resolve_branch_ref(heads_dir: &Path, branch: &str) -> Result<PathBuf> {
    let reject = |why: &str| StashError::DirectoryTraversal(format!("branch {:?} {}", branch, why));

    if branch.is_empty() || branch.trim() != branch {
        return Err(reject("is empty or padded with whitespace"));
    }
    if branch.contains('\0') || branch.contains('/') || branch.contains('\\') {
        return Err(reject("contains a path separator"));
    }
    let mut components = Path::new(branch).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => return Err(reject("is not a plain name")),
    }

    let base = fs::canonicalize(heads_dir)?;
    let candidate = base.join(branch);
    let resolved = match fs::symlink_metadata(&candidate) {
        Ok(_) => fs::canonicalize(&candidate)
            .map_err(|_| reject("points at a dangling link"))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => candidate,
        Err(e) => return Err(e.into()),
    };

    if resolved.parent() != Some(base.as_path()) {
        return Err(reject("escapes the ref directory"));
    }
    Ok(resolved)
}

/// Read a ref file; an empty file means the branch has no commits yet
pub fn read_ref(path: &Path) -> Result<Option<ObjectId>> {
    let content = fs::read_to_string(path)?;
    ObjectId::parse_optional(&content)
}

/// Overwrite a ref file
pub fn write_ref(path: &Path, tip: Option<ObjectId>) -> Result<()> {
    fs::write(path, optional_hex(tip))?;
    Ok(())
}

/// Render the HEAD file contents for `branch`
pub fn head_contents(branch: &str) -> String {
    format!("ref: {}/{}", HEADS_DIR, branch)
}

/// Parse HEAD contents back into a branch name
pub fn parse_head(contents: &str) -> Result<String> {
    contents
        .trim()
        .strip_prefix("ref: ")
        .and_then(|r| r.strip_prefix(HEADS_DIR))
        .and_then(|r| r.strip_prefix('/'))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| StashError::MalformedObject(format!("invalid HEAD contents {:?}", contents)))
}

/// List branch names in a ref directory, sorted
pub fn list_branches(heads_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(heads_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_head_roundtrip() {
        assert_eq!(head_contents("dev"), "ref: refs/head/dev");
        assert_eq!(parse_head("ref: refs/head/dev\n").unwrap(), "dev");
        assert!(parse_head("ref: refs/head/").is_err());
        assert!(parse_head("garbage").is_err());
    }

    #[test]
    fn test_ref_read_write() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("main");
        write_ref(&path, None).unwrap();
        assert_eq!(read_ref(&path).unwrap(), None);
        let id = ObjectId::new([5; 20]);
        write_ref(&path, Some(id)).unwrap();
        assert_eq!(read_ref(&path).unwrap(), Some(id));
    }

    #[test]
    fn test_resolve_plain_branch() {
        let tmp = TempDir::new().unwrap();
        let resolved = resolve_branch_ref(tmp.path(), "feature-1").unwrap();
        assert_eq!(resolved, fs::canonicalize(tmp.path()).unwrap().join("feature-1"));
    }

    #[test]
    fn test_list_branches_sorted() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("main"), "").unwrap();
        fs::write(tmp.path().join("dev"), "").unwrap();
        assert_eq!(list_branches(tmp.path()).unwrap(), vec!["dev", "main"]);
    }
}
