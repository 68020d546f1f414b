//! Loose object store
//!
//! Objects live at `objects/{hash[0..2]}/{hash[2..]}` as zlib-compressed
//! payloads. Writes are idempotent and published atomically (temp file +
//! rename), so a crash can leave at most an unreferenced temp file behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::compression::{deflate, inflate};
use crate::error::{Result, StashError};
use crate::object::{Commit, ObjectId, ObjectKind, Tree};

/// Content-addressed store rooted at an `objects/` directory
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Open a store rooted at `objects_dir` (created lazily on first write)
    pub fn new(objects_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: objects_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path where `id` is (or would be) stored
    pub fn locate(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    /// Cheap existence check; never decompresses
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.locate(id).is_file()
    }

    /// Store `payload` as an object of `kind` and return its identity.
    /// Storing an object that already exists is a no-op.
    pub fn put(&self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::compute(kind, payload);
        self.write_if_absent(&id, payload)?;
        Ok(id)
    }

    /// Store a payload received under a claimed identity. The claim is checked
    /// against every object kind before anything is written. Returns whether a
    /// new file was written.
    pub fn insert(&self, id: &ObjectId, payload: &[u8]) -> Result<bool> {
        if self.contains(id) {
            return Ok(false);
        }
        if !ObjectKind::ALL
            .iter()
            .any(|kind| ObjectId::compute(*kind, payload) == *id)
        {
            return Err(StashError::MalformedObject(format!(
                "payload does not hash to claimed id {}",
                id
            )));
        }
        self.write_if_absent(id, payload)
    }

    /// Fetch and decompress an object's payload
    pub fn get(&self, id: &ObjectId) -> Result<Vec<u8>> {
        let path = self.locate(id);
        let compressed = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StashError::ObjectNotFound(*id));
            }
            Err(e) => return Err(e.into()),
        };
        inflate(&compressed)
    }

    /// Fetch an object if it is present
    pub fn try_get(&self, id: &ObjectId) -> Result<Option<Vec<u8>>> {
        match self.get(id) {
            Ok(data) => Ok(Some(data)),
            Err(StashError::ObjectNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch and parse a tree object
    pub fn read_tree(&self, id: &ObjectId) -> Result<Tree> {
        Tree::parse(&self.get(id)?)
    }

    /// Fetch and parse a commit object
    pub fn read_commit(&self, id: &ObjectId) -> Result<Commit> {
        Commit::parse(&self.get(id)?)
    }

    /// Serialize and store a commit
    pub fn write_commit(&self, commit: &Commit) -> Result<ObjectId> {
        self.put(ObjectKind::Commit, &commit.serialize())
    }

    /// Serialize and store a tree
    pub fn write_tree(&self, tree: &Tree) -> Result<ObjectId> {
        self.put(ObjectKind::Tree, &tree.serialize())
    }

    fn write_if_absent(&self, id: &ObjectId, payload: &[u8]) -> Result<bool> {
        let path = self.locate(id);
        if path.exists() {
            return Ok(false); // Already stored (content-addressed = idempotent)
        }
        let dir = path
            .parent()
            .ok_or_else(|| StashError::InvalidArgument(format!("object path {:?} has no parent", path)))?;
        fs::create_dir_all(dir)?;

        let compressed = deflate(payload)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&compressed)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| StashError::Io(e.error))?;
        tracing::trace!("stored object {} ({} bytes)", id, payload.len());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::new(tmp.path().join("objects"));

        let id = store.put(ObjectKind::Blob, b"hello").unwrap();
        assert!(store.contains(&id));
        assert_eq!(store.get(&id).unwrap(), b"hello");

        let hex = id.to_hex();
        assert_eq!(
            store.locate(&id),
            tmp.path().join("objects").join(&hex[..2]).join(&hex[2..])
        );
    }

    #[test]
    fn test_put_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::new(tmp.path().join("objects"));

        let first = store.put(ObjectKind::Blob, b"same bytes").unwrap();
        let written = fs::read(store.locate(&first)).unwrap();
        let second = store.put(ObjectKind::Blob, b"same bytes").unwrap();

        assert_eq!(first, second);
        assert_eq!(fs::read(store.locate(&second)).unwrap(), written);
        let dir = store.locate(&first).parent().unwrap().to_path_buf();
        assert_eq!(fs::read_dir(dir).unwrap().count(), 1);
    }

    #[test]
    fn test_get_missing_object() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::new(tmp.path().join("objects"));
        let id = ObjectId::compute(ObjectKind::Blob, b"never stored");
        assert!(matches!(store.get(&id), Err(StashError::ObjectNotFound(missing)) if missing == id));
        assert!(store.try_get(&id).unwrap().is_none());
    }

    #[test]
    fn test_insert_verifies_claimed_id() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::new(tmp.path().join("objects"));

        let id = ObjectId::compute(ObjectKind::Tree, b"");
        assert!(store.insert(&id, b"").unwrap());
        assert!(!store.insert(&id, b"").unwrap());

        let bogus = ObjectId::new([9; 20]);
        assert!(store.insert(&bogus, b"payload").is_err());
        assert!(!store.contains(&bogus));
    }

    #[test]
    fn test_commit_helpers() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::new(tmp.path().join("objects"));
        let tree = store.write_tree(&Tree::new()).unwrap();
        let commit = Commit::new(None, tree, "c1");
        let id = store.write_commit(&commit).unwrap();
        assert_eq!(store.read_commit(&id).unwrap(), commit);
        assert!(store.read_tree(&tree).unwrap().is_empty());
    }
}
