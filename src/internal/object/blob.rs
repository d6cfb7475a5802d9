//! The Blob object: an opaque byte payload addressed by its envelope hash.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::object::{ObjectTrait, types::ObjectType},
};

#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Blob {
    pub id: ObjectHash,
    pub data: Vec<u8>,
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "blob {} ({} bytes)", self.id, self.data.len())
    }
}

impl Blob {
    pub fn from_content(content: &str) -> Self {
        Self::from_content_bytes(content.as_bytes().to_vec())
    }

    pub fn from_content_bytes(data: Vec<u8>) -> Self {
        let id = ObjectHash::from_type_and_data(ObjectType::Blob, &data);
        Blob { id, data }
    }
}

impl ObjectTrait for Blob {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        Ok(Blob {
            id: hash,
            data: data.to_vec(),
        })
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Blob
    }

    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        Ok(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The empty blob has the canonical git hash.
    #[test]
    fn empty_blob_hash() {
        let blob = Blob::from_content("");
        assert_eq!(
            blob.id.to_string(),
            "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"
        );
    }

    /// "hello\n" has the canonical git hash and round-trips.
    #[test]
    fn hello_blob_round_trip() {
        let blob = Blob::from_content("hello\n");
        assert_eq!(
            blob.id.to_string(),
            "ce013625030ba8dba906f756967f9e9ca394464a"
        );
        let back = Blob::from_bytes(&blob.to_data().unwrap(), blob.id).unwrap();
        assert_eq!(back, blob);
        assert_eq!(back.data, b"hello\n");
    }
}
