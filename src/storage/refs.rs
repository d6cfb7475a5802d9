//! The ref store: name → hash mappings, symbolic refs, packed-refs
//! snapshots, and compare-and-swap updates. Every write is a CAS; a write
//! expecting `None` creates, a write to the all-zero hash deletes.

use std::str::FromStr;

use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    sea_query::{Expr, OnConflict},
};
use serde::{Deserialize, Serialize};

use crate::{errors::GitError, hash::ObjectHash, storage::schema::{packed_refs, refs}};

const SYMBOLIC_PREFIX: &str = "ref: ";
/// Bound on symbolic chains so a cycle cannot loop a resolver forever.
const MAX_SYMREF_DEPTH: usize = 5;

/// A ref's stored target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefTarget {
    Hash(ObjectHash),
    Symbolic(String),
}

/// Packed-refs snapshot entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackedRef {
    pub name: String,
    pub target: String,
}

pub struct RefStore {
    db: DatabaseConnection,
}

impl RefStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Read a ref as stored (symbolic refs are not followed).
    pub async fn read(&self, name: &str) -> Result<Option<RefTarget>, GitError> {
        let row = refs::Entity::find_by_id(name.to_string()).one(&self.db).await?;
        row.map(|m| decode_target(&m)).transpose()
    }

    /// Read and follow symbolic chains to a hash. `None` when the chain
    /// ends at a missing ref (e.g. HEAD of an empty repo).
    pub async fn read_resolved(&self, name: &str) -> Result<Option<ObjectHash>, GitError> {
        let mut current = name.to_string();
        for _ in 0..MAX_SYMREF_DEPTH {
            match self.read(&current).await? {
                None => return Ok(None),
                Some(RefTarget::Hash(h)) => return Ok(Some(h)),
                Some(RefTarget::Symbolic(next)) => current = next,
            }
        }
        Err(GitError::Corruption(format!(
            "symbolic ref chain from {name} exceeds {MAX_SYMREF_DEPTH} links"
        )))
    }

    /// Compare-and-swap update. `expected = None` asserts creation; a
    /// `new` of all zeros deletes. Exactly one concurrent CAS per value
    /// transition succeeds; the conditional UPDATE/DELETE is pushed into
    /// the serialized SQL layer.
    pub async fn compare_and_swap(
        &self,
        name: &str,
        expected: Option<&ObjectHash>,
        new: &ObjectHash,
    ) -> Result<(), GitError> {
        match expected {
            None => {
                if new.is_zero() {
                    return Err(GitError::CasConflict {
                        name: name.to_string(),
                        expected: "(create)".to_string(),
                        actual: "(delete)".to_string(),
                    });
                }
                let model = refs::ActiveModel {
                    name: Set(name.to_string()),
                    target: Set(new.to_hex()),
                    symbolic: Set(false),
                };
                let res = refs::Entity::insert(model)
                    .on_conflict(OnConflict::column(refs::Column::Name).do_nothing().to_owned())
                    .do_nothing()
                    .exec(&self.db)
                    .await?;
                if matches!(res, sea_orm::TryInsertResult::Conflicted) {
                    let actual = self.describe_current(name).await?;
                    return Err(GitError::CasConflict {
                        name: name.to_string(),
                        expected: "(absent)".to_string(),
                        actual,
                    });
                }
                Ok(())
            }
            Some(old) => {
                let affected = if new.is_zero() {
                    refs::Entity::delete_many()
                        .filter(refs::Column::Name.eq(name))
                        .filter(refs::Column::Target.eq(old.to_hex()))
                        .filter(refs::Column::Symbolic.eq(false))
                        .exec(&self.db)
                        .await?
                        .rows_affected
                } else {
                    refs::Entity::update_many()
                        .col_expr(refs::Column::Target, Expr::value(new.to_hex()))
                        .filter(refs::Column::Name.eq(name))
                        .filter(refs::Column::Target.eq(old.to_hex()))
                        .filter(refs::Column::Symbolic.eq(false))
                        .exec(&self.db)
                        .await?
                        .rows_affected
                };
                if affected == 0 {
                    let actual = self.describe_current(name).await?;
                    return Err(GitError::CasConflict {
                        name: name.to_string(),
                        expected: old.to_hex(),
                        actual,
                    });
                }
                Ok(())
            }
        }
    }

    async fn describe_current(&self, name: &str) -> Result<String, GitError> {
        Ok(match self.read(name).await? {
            None => "(absent)".to_string(),
            Some(RefTarget::Hash(h)) => h.to_hex(),
            Some(RefTarget::Symbolic(s)) => format!("ref: {s}"),
        })
    }

    /// Unconditional write used by mirror orchestration after its own
    /// conflict policy has decided.
    pub async fn force_write(&self, name: &str, new: &ObjectHash) -> Result<(), GitError> {
        if new.is_zero() {
            refs::Entity::delete_many()
                .filter(refs::Column::Name.eq(name))
                .exec(&self.db)
                .await?;
            return Ok(());
        }
        let model = refs::ActiveModel {
            name: Set(name.to_string()),
            target: Set(new.to_hex()),
            symbolic: Set(false),
        };
        refs::Entity::insert(model)
            .on_conflict(
                OnConflict::column(refs::Column::Name)
                    .update_columns([refs::Column::Target, refs::Column::Symbolic])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Write a symbolic ref (`HEAD` → `refs/heads/main`).
    pub async fn write_symbolic(&self, name: &str, target_name: &str) -> Result<(), GitError> {
        let model = refs::ActiveModel {
            name: Set(name.to_string()),
            target: Set(format!("{SYMBOLIC_PREFIX}{target_name}")),
            symbolic: Set(true),
        };
        refs::Entity::insert(model)
            .on_conflict(
                OnConflict::column(refs::Column::Name)
                    .update_columns([refs::Column::Target, refs::Column::Symbolic])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Direct (non-symbolic) refs under a prefix, name-sorted.
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<(String, ObjectHash)>, GitError> {
        let mut query = refs::Entity::find().filter(refs::Column::Symbolic.eq(false));
        if let Some(prefix) = prefix {
            query = query.filter(refs::Column::Name.starts_with(prefix));
        }
        let mut out = Vec::new();
        for row in query.all(&self.db).await? {
            out.push((row.name.clone(), ObjectHash::from_str(&row.target)?));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Every ref row, symbolic included (advertisement and mirror need the
    /// full picture).
    pub async fn list_all(&self) -> Result<Vec<(String, RefTarget)>, GitError> {
        let mut out = Vec::new();
        for row in refs::Entity::find().all(&self.db).await? {
            out.push((row.name.clone(), decode_target(&row)?));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Rebuild the packed-refs snapshot from the loose rows. Writes go to
    /// the loose layer first; this runs asynchronously afterwards.
    pub async fn pack_refs(&self) -> Result<usize, GitError> {
        let packed: Vec<PackedRef> = self
            .list(None)
            .await?
            .into_iter()
            .map(|(name, hash)| PackedRef {
                name,
                target: hash.to_hex(),
            })
            .collect();
        let count = packed.len();
        let payload = serde_json::to_string(&packed)
            .map_err(|e| GitError::Conversion(e.to_string()))?;
        let model = packed_refs::ActiveModel {
            id: Set(1),
            payload: Set(payload),
            packed_at: Set(chrono::Utc::now().timestamp_millis()),
        };
        packed_refs::Entity::insert(model)
            .on_conflict(
                OnConflict::column(packed_refs::Column::Id)
                    .update_columns([packed_refs::Column::Payload, packed_refs::Column::PackedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(count)
    }

    /// Read the consolidated snapshot (possibly stale relative to loose).
    pub async fn read_packed_refs(&self) -> Result<Vec<PackedRef>, GitError> {
        match packed_refs::Entity::find_by_id(1).one(&self.db).await? {
            None => Ok(Vec::new()),
            Some(row) => {
                serde_json::from_str(&row.payload).map_err(|e| GitError::Conversion(e.to_string()))
            }
        }
    }
}

fn decode_target(row: &refs::Model) -> Result<RefTarget, GitError> {
    if row.symbolic {
        let target = row
            .target
            .strip_prefix(SYMBOLIC_PREFIX)
            .ok_or_else(|| GitError::Corruption(format!("symbolic ref {} malformed", row.name)))?;
        Ok(RefTarget::Symbolic(target.to_string()))
    } else {
        Ok(RefTarget::Hash(ObjectHash::from_str(&row.target)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema;

    async fn ref_store() -> RefStore {
        let db = schema::connect("sqlite::memory:").await.unwrap();
        schema::init_schema(&db).await.unwrap();
        RefStore::new(db)
    }

    fn h(n: u8) -> ObjectHash {
        ObjectHash([n; 20])
    }

    /// Create, update, delete through CAS; each transition checked.
    #[tokio::test]
    async fn cas_lifecycle() {
        let refs = ref_store().await;
        let name = "refs/heads/main";

        refs.compare_and_swap(name, None, &h(1)).await.unwrap();
        assert_eq!(refs.read(name).await.unwrap(), Some(RefTarget::Hash(h(1))));

        refs.compare_and_swap(name, Some(&h(1)), &h(2)).await.unwrap();
        assert_eq!(refs.read(name).await.unwrap(), Some(RefTarget::Hash(h(2))));

        refs.compare_and_swap(name, Some(&h(2)), &ObjectHash::zero())
            .await
            .unwrap();
        assert_eq!(refs.read(name).await.unwrap(), None);
    }

    /// A CAS that observes the wrong prior value fails with a conflict.
    #[tokio::test]
    async fn cas_conflicts() {
        let refs = ref_store().await;
        let name = "refs/heads/main";
        refs.compare_and_swap(name, None, &h(1)).await.unwrap();

        // stale expected
        let err = refs.compare_and_swap(name, Some(&h(9)), &h(2)).await.unwrap_err();
        assert!(matches!(err, GitError::CasConflict { .. }));
        // duplicate create
        let err = refs.compare_and_swap(name, None, &h(2)).await.unwrap_err();
        assert!(matches!(err, GitError::CasConflict { .. }));
        // value unchanged by failed attempts
        assert_eq!(refs.read(name).await.unwrap(), Some(RefTarget::Hash(h(1))));
    }

    /// Concurrent CAS on the same transition: exactly one winner.
    #[tokio::test]
    async fn cas_single_winner() {
        let refs = std::sync::Arc::new(ref_store().await);
        let name = "refs/heads/race";
        refs.compare_and_swap(name, None, &h(1)).await.unwrap();

        let mut tasks = Vec::new();
        for i in 2..8u8 {
            let refs = refs.clone();
            tasks.push(tokio::spawn(async move {
                refs.compare_and_swap(name, Some(&h(1)), &h(i)).await.is_ok()
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    /// Symbolic refs resolve through to the branch hash.
    #[tokio::test]
    async fn symbolic_resolution() {
        let refs = ref_store().await;
        refs.write_symbolic("HEAD", "refs/heads/main").await.unwrap();
        assert_eq!(refs.read_resolved("HEAD").await.unwrap(), None);

        refs.compare_and_swap("refs/heads/main", None, &h(3)).await.unwrap();
        assert_eq!(
            refs.read("HEAD").await.unwrap(),
            Some(RefTarget::Symbolic("refs/heads/main".to_string()))
        );
        assert_eq!(refs.read_resolved("HEAD").await.unwrap(), Some(h(3)));
    }

    /// list() filters by prefix and skips symbolic rows.
    #[tokio::test]
    async fn list_by_prefix() {
        let refs = ref_store().await;
        refs.write_symbolic("HEAD", "refs/heads/main").await.unwrap();
        refs.compare_and_swap("refs/heads/main", None, &h(1)).await.unwrap();
        refs.compare_and_swap("refs/heads/dev", None, &h(2)).await.unwrap();
        refs.compare_and_swap("refs/tags/v1", None, &h(3)).await.unwrap();

        let heads = refs.list(Some("refs/heads/")).await.unwrap();
        assert_eq!(
            heads,
            vec![
                ("refs/heads/dev".to_string(), h(2)),
                ("refs/heads/main".to_string(), h(1)),
            ]
        );
        assert_eq!(refs.list(None).await.unwrap().len(), 3);
    }

    /// pack_refs snapshots the loose layer for bulk reads.
    #[tokio::test]
    async fn packed_refs_snapshot() {
        let refs = ref_store().await;
        refs.compare_and_swap("refs/heads/main", None, &h(1)).await.unwrap();
        refs.compare_and_swap("refs/tags/v1", None, &h(2)).await.unwrap();
        assert!(refs.read_packed_refs().await.unwrap().is_empty());

        assert_eq!(refs.pack_refs().await.unwrap(), 2);
        let packed = refs.read_packed_refs().await.unwrap();
        assert_eq!(packed.len(), 2);
        assert_eq!(packed[0].name, "refs/heads/main");
        assert_eq!(packed[0].target, h(1).to_hex());
    }
}
