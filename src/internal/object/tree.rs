//! The Tree object: an ordered list of `(mode, name, hash)` entries giving
//! one level of the directory hierarchy. Binary payload format per entry is
//! `"<octal-mode> <name>\0" || 20 raw hash bytes`.

use std::fmt::Display;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::{
    errors::GitError,
    hash::{HASH_SIZE, ObjectHash},
    internal::object::{ObjectTrait, types::ObjectType},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeEntryMode {
    Blob,
    Executable,
    Symlink,
    Tree,
    Commit,
}

impl TreeEntryMode {
    /// Octal mode string as serialized in the tree payload. Git writes tree
    /// entries as `40000`, not zero-padded.
    pub const fn as_mode_str(&self) -> &'static str {
        match self {
            TreeEntryMode::Blob => "100644",
            TreeEntryMode::Executable => "100755",
            TreeEntryMode::Symlink => "120000",
            TreeEntryMode::Tree => "40000",
            TreeEntryMode::Commit => "160000",
        }
    }

    pub fn from_mode_bytes(mode: &[u8]) -> Result<Self, GitError> {
        match mode {
            b"100644" | b"100664" => Ok(TreeEntryMode::Blob),
            b"100755" => Ok(TreeEntryMode::Executable),
            b"120000" => Ok(TreeEntryMode::Symlink),
            b"40000" | b"040000" => Ok(TreeEntryMode::Tree),
            b"160000" => Ok(TreeEntryMode::Commit),
            other => Err(GitError::InvalidObject {
                kind: "tree",
                msg: format!("unknown entry mode `{}`", other.to_str_lossy()),
            }),
        }
    }

    /// True when the entry hash points at another tree.
    pub fn is_tree(&self) -> bool {
        matches!(self, TreeEntryMode::Tree)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub mode: TreeEntryMode,
    pub hash: ObjectHash,
    pub name: String,
}

impl TreeEntry {
    pub fn new(mode: TreeEntryMode, hash: ObjectHash, name: String) -> Self {
        Self { mode, hash, name }
    }
}

#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub id: ObjectHash,
    pub entries: Vec<TreeEntry>,
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            writeln!(
                f,
                "{} {} {}",
                entry.mode.as_mode_str(),
                entry.hash,
                entry.name
            )?;
        }
        Ok(())
    }
}

impl Tree {
    /// Build a tree from entries, computing the id. Entries are sorted the
    /// way git sorts them: by name, with directories compared as `name/`.
    pub fn from_entries(mut entries: Vec<TreeEntry>) -> Result<Tree, GitError> {
        if entries.is_empty() {
            return Err(GitError::InvalidObject {
                kind: "tree",
                msg: "tree contains no entries".to_string(),
            });
        }
        entries.sort_by(|a, b| {
            let ka = sort_key(a);
            let kb = sort_key(b);
            ka.cmp(&kb)
        });
        let mut tree = Tree {
            id: ObjectHash::default(),
            entries,
        };
        tree.id = ObjectHash::from_type_and_data(ObjectType::Tree, &tree.to_data()?);
        Ok(tree)
    }
}

fn sort_key(e: &TreeEntry) -> Vec<u8> {
    let mut k = e.name.as_bytes().to_vec();
    if e.mode.is_tree() {
        k.push(b'/');
    }
    k
}

impl ObjectTrait for Tree {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        let mut entries = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let sp = rest.find_byte(b' ').ok_or(GitError::InvalidObject {
                kind: "tree",
                msg: "entry missing mode terminator".to_string(),
            })?;
            let mode = TreeEntryMode::from_mode_bytes(&rest[..sp])?;
            let nul = rest.find_byte(b'\0').ok_or(GitError::InvalidObject {
                kind: "tree",
                msg: "entry missing name terminator".to_string(),
            })?;
            let name = rest[sp + 1..nul].to_str_lossy().to_string();
            if rest.len() < nul + 1 + HASH_SIZE {
                return Err(GitError::InvalidObject {
                    kind: "tree",
                    msg: "entry truncated before hash".to_string(),
                });
            }
            let hash = ObjectHash::from_bytes(&rest[nul + 1..nul + 1 + HASH_SIZE])?;
            entries.push(TreeEntry { mode, hash, name });
            rest = &rest[nul + 1 + HASH_SIZE..];
        }
        Ok(Tree { id: hash, entries })
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Tree
    }

    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        let mut data = Vec::new();
        for entry in &self.entries {
            data.extend(entry.mode.as_mode_str().as_bytes());
            data.push(b' ');
            data.extend(entry.name.as_bytes());
            data.push(b'\0');
            data.extend(entry.hash.as_ref());
        }
        Ok(data)
    }
}
