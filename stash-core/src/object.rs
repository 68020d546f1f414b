//! Core object model for stash
//!
//! Implements content-addressable objects (blob, tree, commit). An object's
//! identity is the SHA-1 of `"<kind><length>\0" + payload`, rendered as 40
//! lowercase hex characters. Trees and commits use a line-oriented text
//! serialization so that peers can parse them without a shared schema.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StashError};

/// Length of a rendered object id
pub const OBJECT_ID_HEX_LEN: usize = 40;

/// Unique identifier for any stored object
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Compute the identity of `payload` stored as `kind`
    pub fn compute(kind: ObjectKind, payload: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(payload.len().to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(payload);
        Self(hasher.finalize().into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 40-character hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.len() != OBJECT_ID_HEX_LEN {
            return Err(StashError::MalformedObject(format!(
                "object id must be {} hex characters, got {:?}",
                OBJECT_ID_HEX_LEN, hex_str
            )));
        }
        let bytes = hex::decode(hex_str)
            .map_err(|e| StashError::MalformedObject(format!("invalid object id {:?}: {}", hex_str, e)))?;
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Parse a ref-style value where the empty string means "no commit"
    pub fn parse_optional(value: &str) -> Result<Option<Self>> {
        let value = value.trim();
        if value.is_empty() {
            Ok(None)
        } else {
            Self::from_hex(value).map(Some)
        }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = StashError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Render an optional commit id the way refs and commit headers store it
pub fn optional_hex(id: Option<ObjectId>) -> String {
    id.map(|id| id.to_hex()).unwrap_or_default()
}

/// Object type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 3] = [ObjectKind::Blob, ObjectKind::Tree, ObjectKind::Commit];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = StashError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blob" => Ok(ObjectKind::Blob),
            "tree" => Ok(ObjectKind::Tree),
            "commit" => Ok(ObjectKind::Commit),
            other => Err(StashError::MalformedObject(format!("unknown object kind {:?}", other))),
        }
    }
}

/// Directory tree entry
///
/// `path` is relative to the repository root and uses `/` separators, so a
/// nested tree's entries carry their full relative path (`src/lib.rs`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Entry type (blob or tree)
    pub kind: ObjectKind,
    /// Object ID (points to Blob or Tree)
    pub id: ObjectId,
    /// Path relative to the repository root
    pub path: String,
}

impl TreeEntry {
    /// Create a new tree entry
    pub fn new(kind: ObjectKind, id: ObjectId, path: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            path: path.into(),
        }
    }

    /// Final path component, the name inside the parent directory
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Directory object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    /// Entries in serialization order
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<TreeEntry>) -> Self {
        Self { entries }
    }

    /// Serialize to `"<kind> <hash> <path>\n"` lines
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(entry.kind.as_str());
            out.push(' ');
            out.push_str(&entry.id.to_hex());
            out.push(' ');
            out.push_str(&entry.path);
            out.push('\n');
        }
        out.into_bytes()
    }

    /// Parse a serialized tree
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| StashError::MalformedObject(format!("tree is not UTF-8: {}", e)))?;
        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        for line in text.split_terminator('\n') {
            let mut parts = line.splitn(3, ' ');
            let (kind, hash, path) = match (parts.next(), parts.next(), parts.next()) {
                (Some(k), Some(h), Some(p)) if !p.is_empty() => (k, h, p),
                _ => {
                    return Err(StashError::MalformedObject(format!("invalid tree line {:?}", line)));
                }
            };
            let kind: ObjectKind = kind.parse()?;
            if kind == ObjectKind::Commit {
                return Err(StashError::MalformedObject(format!(
                    "tree entry {:?} cannot reference a commit",
                    path
                )));
            }
            if !seen.insert(path.to_string()) {
                return Err(StashError::MalformedObject(format!("duplicate tree path {:?}", path)));
            }
            entries.push(TreeEntry::new(kind, ObjectId::from_hex(hash)?, path));
        }
        Ok(Self { entries })
    }

    /// Compute the object ID
    pub fn id(&self) -> ObjectId {
        ObjectId::compute(ObjectKind::Tree, &self.serialize())
    }

    /// Path-keyed view of the entries
    pub fn to_map(&self) -> BTreeMap<String, (ObjectId, ObjectKind)> {
        self.entries
            .iter()
            .map(|e| (e.path.clone(), (e.id, e.kind)))
            .collect()
    }

    /// Iterate over entries
    pub fn iter(&self) -> impl Iterator<Item = &TreeEntry> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Commit object
///
/// A commit has exactly one parent reference; `None` marks the root commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Parent commit (None for the initial commit)
    pub parent: Option<ObjectId>,
    /// Tree object ID for this snapshot
    pub tree: ObjectId,
    /// Commit message
    pub message: String,
}

impl Commit {
    /// Create a new commit
    pub fn new(parent: Option<ObjectId>, tree: ObjectId, message: impl Into<String>) -> Self {
        Self {
            parent,
            tree,
            message: message.into(),
        }
    }

    /// Serialize as `"parent <p>\ntree <t>\n\n<message>"`
    pub fn serialize(&self) -> Vec<u8> {
        format!(
            "parent {}\ntree {}\n\n{}",
            optional_hex(self.parent),
            self.tree.to_hex(),
            self.message
        )
        .into_bytes()
    }

    /// Parse a serialized commit, rejecting anything that does not follow the
    /// `parent` / `tree` / blank line / message shape
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| StashError::MalformedObject(format!("commit is not UTF-8: {}", e)))?;
        let mut parts = text.splitn(4, '\n');
        let parent_line = parts.next().unwrap_or_default();
        let tree_line = parts
            .next()
            .ok_or_else(|| StashError::MalformedObject("commit is missing the tree line".into()))?;
        let separator = parts
            .next()
            .ok_or_else(|| StashError::MalformedObject("commit is missing the header separator".into()))?;
        let message = parts
            .next()
            .ok_or_else(|| StashError::MalformedObject("commit is missing the header separator".into()))?;

        let parent = parent_line
            .strip_prefix("parent ")
            .ok_or_else(|| StashError::MalformedObject(format!("expected parent line, got {:?}", parent_line)))?;
        let tree = tree_line
            .strip_prefix("tree ")
            .ok_or_else(|| StashError::MalformedObject(format!("expected tree line, got {:?}", tree_line)))?;
        if !separator.is_empty() {
            return Err(StashError::MalformedObject(format!(
                "expected blank line after commit header, got {:?}",
                separator
            )));
        }

        Ok(Self {
            parent: ObjectId::parse_optional(parent)?,
            tree: ObjectId::from_hex(tree)?,
            message: message.to_string(),
        })
    }

    /// Compute the object ID
    pub fn id(&self) -> ObjectId {
        ObjectId::compute(ObjectKind::Commit, &self.serialize())
    }

    /// Check if this is an initial commit (no parent)
    pub fn is_initial(&self) -> bool {
        self.parent.is_none()
    }
}
