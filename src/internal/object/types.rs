//! The four Git object kinds and their pack type codes.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::errors::GitError;

/// Kind tag of a stored object. Delta kinds are a pack-stream concept and
/// live in the pack module; an object at rest is always one of these four.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectType {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ObjectType {
    /// Lowercase kind name as it appears in the object envelope.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Commit => "commit",
            ObjectType::Tree => "tree",
            ObjectType::Blob => "blob",
            ObjectType::Tag => "tag",
        }
    }

    /// Envelope bytes for hashing (`"commit"`, `"tree"`, ...).
    pub const fn to_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    pub fn from_str_kind(kind: &str) -> Result<ObjectType, GitError> {
        match kind {
            "commit" => Ok(ObjectType::Commit),
            "tree" => Ok(ObjectType::Tree),
            "blob" => Ok(ObjectType::Blob),
            "tag" => Ok(ObjectType::Tag),
            other => Err(GitError::InvalidObjectType(other.to_string())),
        }
    }

    /// Three-bit type code used in pack entry headers.
    pub const fn type_number(&self) -> u8 {
        match self {
            ObjectType::Commit => 1,
            ObjectType::Tree => 2,
            ObjectType::Blob => 3,
            ObjectType::Tag => 4,
        }
    }

    pub fn from_type_number(n: u8) -> Result<ObjectType, GitError> {
        match n {
            1 => Ok(ObjectType::Commit),
            2 => Ok(ObjectType::Tree),
            3 => Ok(ObjectType::Blob),
            4 => Ok(ObjectType::Tag),
            other => Err(GitError::InvalidObjectType(other.to_string())),
        }
    }
}
