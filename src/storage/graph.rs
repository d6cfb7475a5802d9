//! Object graph walks shared by fetch negotiation, push validation, and the
//! garbage collector: explicit worklist, visited set, no recursion.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::object::{ObjectTrait, commit::Commit, tag::Tag, tree::Tree, types::ObjectType},
    storage::ObjectStore,
};

/// Compute the closure of objects reachable from `seeds`, skipping anything
/// in `stop` (and anything reachable only through it).
///
/// Missing objects are logged and skipped, not fatal: refs can race ahead
/// of deletion, and fetch negotiation feeds us client-claimed hashes.
pub async fn reachable_closure(
    store: &ObjectStore,
    seeds: &[ObjectHash],
    stop: &HashSet<ObjectHash>,
) -> Result<HashMap<ObjectHash, (ObjectType, Bytes)>, GitError> {
    let mut closure: HashMap<ObjectHash, (ObjectType, Bytes)> = HashMap::new();
    let mut visited: HashSet<ObjectHash> = HashSet::new();
    let mut worklist: Vec<ObjectHash> = seeds.to_vec();

    while let Some(hash) = worklist.pop() {
        if hash.is_zero() || !visited.insert(hash) || stop.contains(&hash) {
            continue;
        }
        let Some((kind, data)) = store.get(&hash).await? else {
            tracing::debug!(hash = %hash, "skipping unreachable object during graph walk");
            continue;
        };
        match kind {
            ObjectType::Commit => {
                let commit = Commit::from_bytes(&data, hash)?;
                worklist.push(commit.tree_id);
                worklist.extend(commit.parent_ids.iter().copied());
            }
            ObjectType::Tree => {
                let tree = Tree::from_bytes(&data, hash)?;
                worklist.extend(tree.entries.iter().map(|e| e.hash));
            }
            ObjectType::Tag => {
                let tag = Tag::from_bytes(&data, hash)?;
                worklist.push(tag.object_id);
            }
            ObjectType::Blob => {}
        }
        closure.insert(hash, (kind, data));
    }
    Ok(closure)
}

/// True when `ancestor` is reachable from `descendant` along commit
/// parents. Used for the non-fast-forward check; bounded by `limit`
/// commits so a pathological history cannot stall a push session.
pub async fn is_ancestor(
    store: &ObjectStore,
    ancestor: &ObjectHash,
    descendant: &ObjectHash,
    limit: usize,
) -> Result<bool, GitError> {
    if ancestor == descendant {
        return Ok(true);
    }
    let mut visited: HashSet<ObjectHash> = HashSet::new();
    let mut worklist = vec![*descendant];
    let mut walked = 0usize;
    while let Some(hash) = worklist.pop() {
        if !visited.insert(hash) {
            continue;
        }
        walked += 1;
        if walked > limit {
            return Ok(false);
        }
        let Ok(commit) = store.read_commit(&hash).await else {
            continue;
        };
        for parent in &commit.parent_ids {
            if parent == ancestor {
                return Ok(true);
            }
            worklist.push(*parent);
        }
    }
    Ok(false)
}

#[cfg(test)]
pub(crate) mod test_repo {
    use super::*;
    use crate::internal::object::{
        blob::Blob,
        signature::{Signature, SignatureRole},
        tree::{Tree, TreeEntry, TreeEntryMode},
    };

    fn sig(role: SignatureRole) -> Signature {
        Signature {
            role,
            name: "tester".to_string(),
            email: "tester@example.com".to_string(),
            timestamp: 1_700_000_000,
            timezone: "+0000".to_string(),
        }
    }

    /// Store a commit with one file and the given parents; returns
    /// (commit, tree, blob) hashes.
    pub(crate) async fn commit_with_file(
        store: &ObjectStore,
        file: &str,
        content: &str,
        parents: Vec<ObjectHash>,
        message: &str,
    ) -> (ObjectHash, ObjectHash, ObjectHash) {
        let blob = Blob::from_content(content);
        store
            .put(ObjectType::Blob, Bytes::from(blob.data.clone()))
            .await
            .unwrap();
        let tree = Tree::from_entries(vec![TreeEntry::new(
            TreeEntryMode::Blob,
            blob.id,
            file.to_string(),
        )])
        .unwrap();
        store
            .put(ObjectType::Tree, Bytes::from(tree.to_data().unwrap()))
            .await
            .unwrap();
        let commit = Commit::new(
            sig(SignatureRole::Author),
            sig(SignatureRole::Committer),
            tree.id,
            parents,
            message,
        );
        store
            .put(ObjectType::Commit, Bytes::from(commit.to_data().unwrap()))
            .await
            .unwrap();
        (commit.id, tree.id, blob.id)
    }
}
