//! The Tag object: an annotated pointer at another object, usually a commit.

use std::fmt::Display;
use std::str::FromStr;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::object::{ObjectTrait, signature::Signature, types::ObjectType},
};

#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: ObjectHash,
    /// The tagged object.
    pub object_id: ObjectHash,
    /// Kind of the tagged object.
    pub object_type: ObjectType,
    pub tag_name: String,
    pub tagger: Signature,
    pub message: String,
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "object {}", self.object_id)?;
        writeln!(f, "type {}", self.object_type)?;
        writeln!(f, "tag {}", self.tag_name)?;
        writeln!(f, "tagger {}", self.tagger)?;
        writeln!(f, "{}", self.message)
    }
}

impl Tag {
    pub fn new(
        object_id: ObjectHash,
        object_type: ObjectType,
        tag_name: String,
        tagger: Signature,
        message: String,
    ) -> Tag {
        let mut tag = Tag {
            id: ObjectHash::default(),
            object_id,
            object_type,
            tag_name,
            tagger,
            message,
        };
        tag.id = ObjectHash::from_type_and_data(ObjectType::Tag, &tag.to_data().unwrap());
        tag
    }
}

impl ObjectTrait for Tag {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        let malformed = |msg: &str| GitError::InvalidObject {
            kind: "tag",
            msg: msg.to_string(),
        };

        let mut object_id = None;
        let mut object_type = None;
        let mut tag_name = None;
        let mut tagger = None;
        let mut rest = data;

        loop {
            let end = rest.find_byte(0x0a).ok_or_else(|| malformed("truncated header"))?;
            let line = &rest[..end];
            rest = &rest[end + 1..];
            if line.is_empty() {
                break; // blank line separates headers from message
            }
            if let Some(v) = line.strip_prefix(b"object ") {
                object_id = Some(ObjectHash::from_str(
                    std::str::from_utf8(v).map_err(|e| GitError::Conversion(e.to_string()))?,
                )?);
            } else if let Some(v) = line.strip_prefix(b"type ") {
                object_type = Some(ObjectType::from_str_kind(
                    std::str::from_utf8(v).map_err(|e| GitError::Conversion(e.to_string()))?,
                )?);
            } else if let Some(v) = line.strip_prefix(b"tag ") {
                tag_name = Some(v.to_str_lossy().to_string());
            } else if line.starts_with(b"tagger ") {
                tagger = Some(Signature::from_data(line)?);
            }
            // unrecognised headers (e.g. gpgsig continuation) are skipped
        }

        Ok(Tag {
            id: hash,
            object_id: object_id.ok_or_else(|| malformed("no object header"))?,
            object_type: object_type.ok_or_else(|| malformed("no type header"))?,
            tag_name: tag_name.ok_or_else(|| malformed("no tag header"))?,
            tagger: tagger.ok_or_else(|| malformed("no tagger header"))?,
            message: rest.to_str_lossy().to_string(),
        })
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Tag
    }

    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        let mut data = Vec::new();
        data.extend(b"object ");
        data.extend(self.object_id.to_string().as_bytes());
        data.push(0x0a);
        data.extend(b"type ");
        data.extend(self.object_type.as_str().as_bytes());
        data.push(0x0a);
        data.extend(b"tag ");
        data.extend(self.tag_name.as_bytes());
        data.push(0x0a);
        data.extend(self.tagger.to_data()?);
        data.push(0x0a);
        data.push(0x0a);
        data.extend(self.message.as_bytes());
        Ok(data)
    }
}
