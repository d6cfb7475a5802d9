//! Object model definitions for Git blobs, trees, commits, and tags, and the
//! trait that lets the pack and tablet layers create strongly typed values
//! from raw bytes.

pub mod blob;
pub mod commit;
pub mod signature;
pub mod tag;
pub mod tree;
pub mod types;

use std::fmt::Display;

use crate::{errors::GitError, hash::ObjectHash, internal::object::types::ObjectType};

/// **The Object Trait**
/// Common interface for all Git object types.
pub trait ObjectTrait: Send + Sync + Display {
    /// Creates a new object from the raw payload (envelope already removed).
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError>
    where
        Self: Sized;

    /// Returns the kind of the object.
    fn object_type(&self) -> ObjectType;

    /// Serialize the payload (without envelope).
    fn to_data(&self) -> Result<Vec<u8>, GitError>;

    /// Computes the object hash from serialized data.
    fn object_hash(&self) -> Result<ObjectHash, GitError> {
        let data = self.to_data()?;
        Ok(ObjectHash::from_type_and_data(self.object_type(), &data))
    }
}
