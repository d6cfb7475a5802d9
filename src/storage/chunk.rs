//! Chunk compactor: groups many small inline objects into super-chunks so
//! point reads cost one indexed range instead of a tablet scan, and
//! row-priced metadata storage holds one index row per object.

use std::collections::HashSet;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::object::types::ObjectType,
    storage::{
        ObjectStore, lfs,
        schema::{chunk_index, super_chunk},
        tablet::{StorageMode, TabletRow},
    },
};

/// Outcome of a chunk-compaction pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub chunks_written: usize,
    pub objects_indexed: usize,
    pub chunks_deleted: usize,
}

/// Index-first read path: `get` consults this before any tablet scan.
pub(crate) async fn lookup(
    store: &ObjectStore,
    hash: &ObjectHash,
) -> Result<Option<TabletRow>, GitError> {
    let Some(row) = chunk_index::Entity::find_by_id(hash.to_hex())
        .one(&store.db)
        .await?
    else {
        return Ok(None);
    };
    let key = lfs::chunk_bucket_key(&store.cfg.repo_prefix, &row.chunk_id);
    let Some(chunk) = store.bucket.get(&key).await? else {
        return Err(GitError::Corruption(format!(
            "chunk {} referenced by index is missing",
            row.chunk_id
        )));
    };
    let start = row.offset as usize;
    let end = start + row.length as usize;
    if end > chunk.len() {
        return Err(GitError::Corruption(format!(
            "index range {start}..{end} overruns chunk {} of {} bytes",
            row.chunk_id,
            chunk.len()
        )));
    }
    Ok(Some(TabletRow {
        hash: *hash,
        kind: ObjectType::from_str_kind(&row.kind)?,
        size: row.length as u64,
        mode: StorageMode::Inline,
        payload: chunk.slice(start..end),
        path: None,
        created_at: 0,
    }))
}

struct ChunkBuilder {
    id: String,
    buf: BytesMut,
    rows: Vec<(ObjectHash, usize, usize, ObjectType)>,
}

impl ChunkBuilder {
    fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            buf: BytesMut::new(),
            rows: Vec::new(),
        }
    }

    fn push(&mut self, hash: ObjectHash, kind: ObjectType, payload: &[u8]) {
        self.rows.push((hash, self.buf.len(), payload.len(), kind));
        self.buf.extend_from_slice(payload);
    }

    async fn write(self, store: &ObjectStore) -> Result<usize, GitError> {
        if self.rows.is_empty() {
            return Ok(0);
        }
        let key = lfs::chunk_bucket_key(&store.cfg.repo_prefix, &self.id);
        let byte_len = self.buf.len();
        store.bucket.put(&key, self.buf.freeze()).await?;
        super_chunk::ActiveModel {
            id: Set(self.id.clone()),
            bytes: Set(byte_len as i64),
            row_count: Set(self.rows.len() as i64),
            created_at: Set(chrono::Utc::now().timestamp_millis()),
        }
        .insert(&store.db)
        .await?;
        let indexed = self.rows.len();
        for (hash, offset, length, kind) in self.rows {
            chunk_index::Entity::insert(chunk_index::ActiveModel {
                hash: Set(hash.to_hex()),
                chunk_id: Set(self.id.clone()),
                offset: Set(offset as i64),
                length: Set(length as i64),
                kind: Set(kind.as_str().to_string()),
            })
            .on_conflict(
                sea_orm::sea_query::OnConflict::column(chunk_index::Column::Hash)
                    .update_columns([
                        chunk_index::Column::ChunkId,
                        chunk_index::Column::Offset,
                        chunk_index::Column::Length,
                    ])
                    .to_owned(),
            )
            .exec(&store.db)
            .await?;
        }
        Ok(indexed)
    }
}

/// Pack small inline tablet rows that are not yet indexed into fresh
/// super-chunks. Single-writer: runs under the store's write lock.
pub async fn compact_small_objects(store: &ObjectStore) -> Result<ChunkStats, GitError> {
    let st = store.state.write().await;
    let tablets = st.live_tablets_snapshot();
    let tombstones = st.tombstones_snapshot();

    let already: HashSet<String> = chunk_index::Entity::find()
        .all(&store.db)
        .await?
        .into_iter()
        .map(|m| m.hash)
        .collect();

    let mut stats = ChunkStats::default();
    let mut builder = ChunkBuilder::new();
    for key in tablets {
        let bytes = store.read_tablet(&key).await?;
        for row in crate::storage::tablet::scan_rows(&bytes)? {
            if row.mode != StorageMode::Inline
                || row.payload.len() > store.cfg.chunk.small_object_threshold
                || already.contains(&row.hash.to_hex())
                || tombstones.contains(&row.hash)
            {
                continue;
            }
            builder.push(row.hash, row.kind, &row.payload);
            if builder.buf.len() >= store.cfg.chunk.target_chunk_bytes {
                stats.objects_indexed += builder.write(store).await?;
                stats.chunks_written += 1;
                builder = ChunkBuilder::new();
            }
        }
    }
    if !builder.rows.is_empty() {
        stats.objects_indexed += builder.write(store).await?;
        stats.chunks_written += 1;
    }
    tracing::debug!(
        chunks = stats.chunks_written,
        objects = stats.objects_indexed,
        "chunk compaction pass"
    );
    Ok(stats)
}

/// Full compaction: live index rows (minus tombstoned hashes) re-packed
/// into freshly sized super-chunks; the old chunks are deleted.
pub async fn full_compact(store: &ObjectStore) -> Result<ChunkStats, GitError> {
    let st = store.state.write().await;
    let tombstones = st.tombstones_snapshot();

    let index_rows = chunk_index::Entity::find().all(&store.db).await?;
    let old_chunks: HashSet<String> = index_rows.iter().map(|r| r.chunk_id.clone()).collect();

    let mut stats = ChunkStats::default();
    let mut builder = ChunkBuilder::new();
    for row in index_rows {
        let hash = ObjectHash::from_str(&row.hash)?;
        if tombstones.contains(&hash) {
            chunk_index::Entity::delete_many()
                .filter(chunk_index::Column::Hash.eq(row.hash.clone()))
                .exec(&store.db)
                .await?;
            continue;
        }
        let key = lfs::chunk_bucket_key(&store.cfg.repo_prefix, &row.chunk_id);
        let Some(chunk) = store.bucket.get(&key).await? else {
            continue;
        };
        let start = row.offset as usize;
        let end = (row.offset + row.length) as usize;
        if end > chunk.len() {
            return Err(GitError::Corruption(format!(
                "index range overruns chunk {}",
                row.chunk_id
            )));
        }
        builder.push(hash, ObjectType::from_str_kind(&row.kind)?, &chunk[start..end]);
        if builder.buf.len() >= store.cfg.chunk.target_chunk_bytes {
            stats.objects_indexed += builder.write(store).await?;
            stats.chunks_written += 1;
            builder = ChunkBuilder::new();
        }
    }
    if !builder.rows.is_empty() {
        stats.objects_indexed += builder.write(store).await?;
        stats.chunks_written += 1;
    }

    for chunk_id in old_chunks {
        store
            .bucket
            .delete(&lfs::chunk_bucket_key(&store.cfg.repo_prefix, &chunk_id))
            .await?;
        super_chunk::Entity::delete_many()
            .filter(super_chunk::Column::Id.eq(chunk_id))
            .exec(&store.db)
            .await?;
        stats.chunks_deleted += 1;
    }
    Ok(stats)
}
