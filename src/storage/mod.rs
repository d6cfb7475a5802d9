//! The object store: typed reads and writes over a WAL-backed write buffer,
//! immutable columnar tablets on a blob bucket, a raw blob overflow for
//! large objects, a segmented Bloom + exact existence cache, journaled
//! compaction, a chunk compactor, mark-and-sweep GC, and the ref store.

pub mod bloom;
pub mod bucket;
pub mod chunk;
pub mod compaction;
pub mod gc;
pub mod graph;
pub mod lfs;
pub mod refs;
pub mod schema;
pub mod tablet;

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use tokio::sync::{Mutex, RwLock};

use crate::{
    config::StoreConfig,
    errors::GitError,
    hash::ObjectHash,
    internal::object::{
        ObjectTrait, commit::Commit, tag::Tag, tree::Tree, types::ObjectType,
    },
    storage::{
        bloom::{ExistenceCache, Presence},
        bucket::BucketStore,
        lfs::LfsPointer,
        tablet::{StorageMode, TabletRow},
    },
};

/// Result of a `put`.
#[derive(Clone, Copy, Debug)]
pub struct PutOutcome {
    pub hash: ObjectHash,
    /// Back-pressure signal: the caller should schedule a flush.
    pub needs_flush: bool,
}

/// Event passed to the post-flush callback (analytics overlay hook). The
/// record carries everything the overlay needs, including the bucket key
/// the tablet landed under, so no back-reference into the store is needed.
#[derive(Clone, Debug)]
pub struct FlushEvent {
    pub tablet_key: String,
    pub bytes: u64,
    pub record_count: usize,
    /// Full bucket key of the written tablet.
    pub storage_handle: String,
    pub prefix: String,
}

pub type FlushObserver = Arc<dyn Fn(&FlushEvent) + Send + Sync>;

/// In-memory pending objects plus a hash index, bounded by the configured
/// object and byte thresholds.
#[derive(Default)]
pub(crate) struct WriteBuffer {
    rows: Vec<TabletRow>,
    index: HashMap<ObjectHash, usize>,
    bytes: usize,
}

impl WriteBuffer {
    fn insert(&mut self, row: TabletRow) -> bool {
        if self.index.contains_key(&row.hash) {
            return false;
        }
        self.bytes += row.payload.len();
        self.index.insert(row.hash, self.rows.len());
        self.rows.push(row);
        true
    }

    fn get(&self, hash: &ObjectHash) -> Option<&TabletRow> {
        self.index.get(hash).map(|&i| &self.rows[i])
    }

    fn contains(&self, hash: &ObjectHash) -> bool {
        self.index.contains_key(hash)
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn byte_size(&self) -> usize {
        self.bytes
    }

    fn rows_clone(&self) -> Vec<TabletRow> {
        self.rows.clone()
    }

    fn remove_hashes(&mut self, hashes: &HashSet<ObjectHash>) {
        self.rows.retain(|r| !hashes.contains(&r.hash));
        self.index.clear();
        self.bytes = 0;
        for (i, row) in self.rows.iter().enumerate() {
            self.index.insert(row.hash, i);
            self.bytes += row.payload.len();
        }
    }
}

/// Buffer, live-tablet set, and tombstones behind the per-repository
/// read/write lock. Each piece carries its own short-lived mutex so that
/// `put`/`get`/`has`/`flush` mutate it while holding only the **read**
/// lock; the **write** lock is reserved for compaction and chunk
/// compaction, which must freeze all three at once. The inner guards are
/// never held across a suspension point.
pub(crate) struct StoreState {
    pub(crate) buffer: std::sync::Mutex<WriteBuffer>,
    /// Live tablet keys, newest first.
    pub(crate) live_tablets: std::sync::Mutex<Vec<String>>,
    pub(crate) tombstones: std::sync::Mutex<HashSet<ObjectHash>>,
}

impl StoreState {
    pub(crate) fn live_tablets_snapshot(&self) -> Vec<String> {
        self.live_tablets.lock().unwrap().clone()
    }

    pub(crate) fn tombstones_snapshot(&self) -> HashSet<ObjectHash> {
        self.tombstones.lock().unwrap().clone()
    }
}

/// Per-repository object store.
pub struct ObjectStore {
    pub(crate) cfg: StoreConfig,
    pub(crate) db: DatabaseConnection,
    pub(crate) bucket: Arc<dyn BucketStore>,
    pub(crate) state: RwLock<StoreState>,
    /// Serializes flushes (and compaction, which drains the buffer too).
    pub(crate) flush_lock: Mutex<()>,
    pub(crate) cache: Mutex<ExistenceCache>,
    refs: refs::RefStore,
    observer: std::sync::Mutex<Option<FlushObserver>>,
}

impl ObjectStore {
    /// Open a store: create the schema, rebuild the cache and buffer from
    /// the persisted tables, and finish any interrupted compaction.
    pub async fn open(
        cfg: StoreConfig,
        bucket: Arc<dyn BucketStore>,
        db: DatabaseConnection,
    ) -> Result<Arc<ObjectStore>, GitError> {
        schema::init_schema(&db).await?;
        let cache = ExistenceCache::load(cfg.bloom.clone(), &db).await?;

        // Replay WAL rows into the buffer, deduplicating by hash.
        let mut buffer = WriteBuffer::default();
        for row in schema::wal::Entity::find()
            .order_by_asc(schema::wal::Column::CreatedAt)
            .all(&db)
            .await?
        {
            buffer.insert(wal_row_to_tablet_row(row)?);
        }

        let live_tablets: Vec<String> = schema::tablet::Entity::find()
            .order_by_desc(schema::tablet::Column::CreatedAt)
            .all(&db)
            .await?
            .into_iter()
            .map(|m| m.key)
            .collect();

        let mut tombstones = HashSet::new();
        for row in schema::tombstone::Entity::find().all(&db).await? {
            tombstones.insert(ObjectHash::from_str(&row.hash)?);
        }

        let recovered = buffer.len();
        let store = ObjectStore {
            refs: refs::RefStore::new(db.clone()),
            cfg,
            db,
            bucket,
            state: RwLock::new(StoreState {
                buffer: std::sync::Mutex::new(buffer),
                live_tablets: std::sync::Mutex::new(live_tablets),
                tombstones: std::sync::Mutex::new(tombstones),
            }),
            flush_lock: Mutex::new(()),
            cache: Mutex::new(cache),
            observer: std::sync::Mutex::new(None),
        };

        compaction::recover(&store).await?;
        if recovered > 0 {
            tracing::info!(objects = recovered, "replayed WAL into write buffer, flushing");
            store.flush().await?;
        }
        Ok(Arc::new(store))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    pub fn refs(&self) -> &refs::RefStore {
        &self.refs
    }

    /// Shared handle to the backing bucket (LFS endpoints, GC of external
    /// payloads).
    pub fn bucket_handle(&self) -> Arc<dyn BucketStore> {
        self.bucket.clone()
    }

    /// Register the post-flush callback. The event record carries the
    /// tablet key and counts; no back-reference into the store.
    pub fn set_flush_observer(&self, observer: FlushObserver) {
        *self.observer.lock().unwrap() = Some(observer);
    }

    /// Store an object. Idempotent: the same `(kind, bytes)` yields the
    /// same hash and leaves the store unchanged. External bytes land in the
    /// bucket before the WAL row is written, so no tablet row can dangle.
    pub async fn put(&self, kind: ObjectType, data: Bytes) -> Result<PutOutcome, GitError> {
        let hash = ObjectHash::from_type_and_data(kind, &data);
        let hex = hash.to_hex();
        let tombstoned = {
            let st = self.state.read().await;
            let buffer = st.buffer.lock().unwrap();
            if buffer.contains(&hash) {
                return Ok(PutOutcome {
                    hash,
                    needs_flush: self.over_threshold(&buffer),
                });
            }
            drop(buffer);
            st.tombstones.lock().unwrap().contains(&hash)
        };
        if !tombstoned && self.lookup_row(&hash).await?.is_some() {
            return Ok(PutOutcome {
                hash,
                needs_flush: false,
            });
        }

        let created_at = chrono::Utc::now().timestamp_millis();
        let size = data.len() as u64;
        let (mode, payload, path) = if let Some(pointer) = LfsPointer::parse(&data) {
            let key = pointer.content_key(&self.cfg.repo_prefix);
            (StorageMode::Lfs, data, Some(key))
        } else if data.len() > self.cfg.inline_threshold {
            let key = lfs::raw_key(&self.cfg.repo_prefix, &hash);
            bucket::put_if_absent(&*self.bucket, &key, data).await?;
            (StorageMode::External, Bytes::new(), Some(key))
        } else {
            (StorageMode::Inline, data, None)
        };

        // WAL row first: if this insert fails the put fails with the
        // in-memory buffer untouched.
        let model = schema::wal::ActiveModel {
            hash: Set(hex.clone()),
            kind: Set(kind.as_str().to_string()),
            size: Set(size as i64),
            mode: Set(mode.as_str().to_string()),
            data: Set(payload.to_vec()),
            path: Set(path.clone()),
            created_at: Set(created_at),
        };
        schema::wal::Entity::insert(model)
            .on_conflict(
                sea_orm::sea_query::OnConflict::column(schema::wal::Column::Hash)
                    .do_nothing()
                    .to_owned(),
            )
            .do_nothing()
            .exec(&self.db)
            .await?;

        if tombstoned {
            schema::tombstone::Entity::delete_many()
                .filter(schema::tombstone::Column::Hash.eq(hex.clone()))
                .exec(&self.db)
                .await?;
        }

        let needs_flush = {
            let st = self.state.read().await;
            st.tombstones.lock().unwrap().remove(&hash);
            let mut buffer = st.buffer.lock().unwrap();
            buffer.insert(TabletRow {
                hash,
                kind,
                size,
                mode,
                payload,
                path,
                created_at,
            });
            self.over_threshold(&buffer)
        };

        self.cache
            .lock()
            .await
            .note_present(&self.db, &hex, kind, size, created_at)
            .await?;

        Ok(PutOutcome { hash, needs_flush })
    }

    fn over_threshold(&self, buffer: &WriteBuffer) -> bool {
        buffer.len() >= self.cfg.max_buffer_objects
            || buffer.byte_size() >= self.cfg.max_buffer_bytes
    }

    /// Read an object by hash.
    pub async fn get(&self, hash: &ObjectHash) -> Result<Option<(ObjectType, Bytes)>, GitError> {
        match self.lookup_row(hash).await? {
            Some(row) => Ok(Some((row.kind, self.materialize(&row).await?))),
            None => Ok(None),
        }
    }

    /// Existence probe: buffer, then exact cache, then Bloom, then a tablet
    /// scan on `probable`.
    pub async fn has(&self, hash: &ObjectHash) -> Result<bool, GitError> {
        Ok(self.lookup_row(hash).await?.is_some())
    }

    /// Tombstone an object. The bytes stay in their tablet until the next
    /// compaction drops the row.
    pub async fn delete(&self, hash: &ObjectHash) -> Result<(), GitError> {
        let hex = hash.to_hex();
        let model = schema::tombstone::ActiveModel {
            hash: Set(hex.clone()),
            created_at: Set(chrono::Utc::now().timestamp_millis()),
        };
        schema::tombstone::Entity::insert(model)
            .on_conflict(
                sea_orm::sea_query::OnConflict::column(schema::tombstone::Column::Hash)
                    .do_nothing()
                    .to_owned(),
            )
            .do_nothing()
            .exec(&self.db)
            .await?;
        schema::wal::Entity::delete_many()
            .filter(schema::wal::Column::Hash.eq(hex.clone()))
            .exec(&self.db)
            .await?;

        {
            let st = self.state.read().await;
            st.tombstones.lock().unwrap().insert(*hash);
            let mut gone = HashSet::new();
            gone.insert(*hash);
            st.buffer.lock().unwrap().remove_hashes(&gone);
        }
        self.cache.lock().await.forget(&self.db, &hex).await?;
        Ok(())
    }

    /// Resolve an abbreviated lowercase hex prefix (at least 4 chars) to a
    /// full hash. Ambiguity is an error distinct from not-found.
    pub async fn resolve_prefix(&self, prefix: &str) -> Result<ObjectHash, GitError> {
        if prefix.len() < 4
            || prefix.len() > 40
            || !prefix
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(GitError::InvalidHashValue(prefix.to_string()));
        }
        let mut matches: HashSet<ObjectHash> = HashSet::new();
        for row in self.enumerate().await? {
            if row.hash.to_hex().starts_with(prefix) {
                matches.insert(row.hash);
            }
        }
        match matches.len() {
            0 => Err(GitError::ObjectNotFound(prefix.to_string())),
            1 => Ok(matches.into_iter().next().unwrap()),
            _ => Err(GitError::AmbiguousPrefix(prefix.to_string())),
        }
    }

    /// Every non-tombstoned row currently owned by the store: buffer first,
    /// then live tablets newest-first, deduplicated by hash.
    pub(crate) async fn enumerate(&self) -> Result<Vec<TabletRow>, GitError> {
        let (mut rows, tablets, tombstones) = {
            let st = self.state.read().await;
            (
                st.buffer.lock().unwrap().rows_clone(),
                st.live_tablets_snapshot(),
                st.tombstones_snapshot(),
            )
        };
        let mut seen: HashSet<ObjectHash> = rows.iter().map(|r| r.hash).collect();
        for key in tablets {
            let bytes = self.read_tablet(&key).await?;
            for row in tablet::scan_rows(&bytes)? {
                if seen.insert(row.hash) {
                    rows.push(row);
                }
            }
        }
        rows.retain(|r| !tombstones.contains(&r.hash));
        Ok(rows)
    }

    pub(crate) async fn read_tablet(&self, key: &str) -> Result<Bytes, GitError> {
        let bucket_key = lfs::tablet_bucket_key(&self.cfg.repo_prefix, key);
        self.bucket
            .get(&bucket_key)
            .await?
            .ok_or_else(|| GitError::Corruption(format!("live tablet {key} missing from bucket")))
    }

    /// Locate the row for a hash without materializing external payloads.
    pub(crate) async fn lookup_row(
        &self,
        hash: &ObjectHash,
    ) -> Result<Option<TabletRow>, GitError> {
        let hex = hash.to_hex();
        {
            let st = self.state.read().await;
            if st.tombstones.lock().unwrap().contains(hash) {
                return Ok(None);
            }
            if let Some(row) = st.buffer.lock().unwrap().get(hash) {
                return Ok(Some(row.clone()));
            }
        }

        let presence = self.cache.lock().await.check(&hex);
        if presence == Presence::Absent && !self.cfg.bloom.verify {
            return Ok(None);
        }

        // Chunk index before tablet scan: one configured order, no
        // divergent read paths.
        if let Some(row) = chunk::lookup(self, hash).await? {
            self.promote(&row).await?;
            return Ok(Some(row));
        }

        let tablets = { self.state.read().await.live_tablets_snapshot() };
        for key in tablets {
            let bytes = self.read_tablet(&key).await?;
            if let Some(row) = tablet::find_row(&bytes, hash)? {
                if presence == Presence::Absent {
                    tracing::warn!(hash = %hex, "bloom self-heal: object present but filter said absent");
                }
                self.promote(&row).await?;
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    async fn promote(&self, row: &TabletRow) -> Result<(), GitError> {
        self.cache
            .lock()
            .await
            .promote(&self.db, &row.hash.to_hex(), row.kind, row.size, row.created_at)
            .await
    }

    /// Fetch the actual payload bytes for a row.
    pub(crate) async fn materialize(&self, row: &TabletRow) -> Result<Bytes, GitError> {
        match row.mode {
            StorageMode::Inline | StorageMode::Lfs => Ok(row.payload.clone()),
            StorageMode::External => {
                let path = row.path.as_deref().ok_or_else(|| {
                    GitError::Corruption(format!("external row {} without a path", row.hash))
                })?;
                self.bucket
                    .get(path)
                    .await?
                    .ok_or_else(|| GitError::DanglingExternal(row.hash.to_hex()))
            }
        }
    }

    /// Drain the buffer into a new immutable tablet, then delete exactly
    /// the WAL rows for the drained objects. The tablet key is a
    /// deterministic function of the batch, so a crash-replay re-put is
    /// idempotent.
    pub async fn flush(&self) -> Result<Option<FlushEvent>, GitError> {
        let _flush_guard = self.flush_lock.lock().await;

        let snapshot = {
            self.state.read().await.buffer.lock().unwrap().rows_clone()
        };
        if snapshot.is_empty() {
            return Ok(None);
        }
        let drained: HashSet<ObjectHash> = snapshot.iter().map(|r| r.hash).collect();
        let hexes: Vec<String> = drained.iter().map(|h| h.to_hex()).collect();
        let record_count = snapshot.len();
        let (key, bytes) = tablet::build_tablet(snapshot);

        // A key retired by the most recent compaction means this exact
        // batch was already merged; re-putting it would resurrect a tablet
        // the live set no longer tracks.
        if schema::retired_tablet::Entity::find_by_id(key.clone())
            .one(&self.db)
            .await?
            .is_some()
        {
            tracing::debug!(tablet = %key, "flush suppressed: key retired by compaction");
            schema::wal::Entity::delete_many()
                .filter(schema::wal::Column::Hash.is_in(hexes))
                .exec(&self.db)
                .await?;
            self.state
                .read()
                .await
                .buffer
                .lock()
                .unwrap()
                .remove_hashes(&drained);
            return Ok(None);
        }

        let byte_len = bytes.len() as u64;
        let bucket_key = lfs::tablet_bucket_key(&self.cfg.repo_prefix, &key);
        self.bucket.put(&bucket_key, Bytes::from(bytes)).await?;

        // Tablet row and WAL drain commit together; a crash in between
        // leaves the WAL intact and the re-flush idempotent.
        let txn = self.db.begin().await?;
        let model = schema::tablet::ActiveModel {
            key: Set(key.clone()),
            row_count: Set(record_count as i64),
            bytes: Set(byte_len as i64),
            created_at: Set(chrono::Utc::now().timestamp_millis()),
        };
        schema::tablet::Entity::insert(model)
            .on_conflict(
                sea_orm::sea_query::OnConflict::column(schema::tablet::Column::Key)
                    .do_nothing()
                    .to_owned(),
            )
            .do_nothing()
            .exec(&txn)
            .await?;
        schema::wal::Entity::delete_many()
            .filter(schema::wal::Column::Hash.is_in(hexes))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        {
            let st = self.state.read().await;
            st.buffer.lock().unwrap().remove_hashes(&drained);
            let mut live = st.live_tablets.lock().unwrap();
            if !live.contains(&key) {
                live.insert(0, key.clone());
            }
        }

        let event = FlushEvent {
            tablet_key: key,
            bytes: byte_len,
            record_count,
            storage_handle: bucket_key,
            prefix: self.cfg.repo_prefix.clone(),
        };
        tracing::debug!(tablet = %event.tablet_key, records = record_count, "flushed write buffer");
        let observer = self.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer(&event);
        }
        Ok(Some(event))
    }

    /// Typed read helpers. Kind mismatches are corruption, not not-found.
    pub async fn read_commit(&self, hash: &ObjectHash) -> Result<Commit, GitError> {
        let (kind, data) = self
            .get(hash)
            .await?
            .ok_or_else(|| GitError::ObjectNotFound(hash.to_hex()))?;
        if kind != ObjectType::Commit {
            return Err(GitError::Corruption(format!("{hash} is a {kind}, not a commit")));
        }
        Commit::from_bytes(&data, *hash)
    }

    pub async fn read_tree(&self, hash: &ObjectHash) -> Result<Tree, GitError> {
        let (kind, data) = self
            .get(hash)
            .await?
            .ok_or_else(|| GitError::ObjectNotFound(hash.to_hex()))?;
        if kind != ObjectType::Tree {
            return Err(GitError::Corruption(format!("{hash} is a {kind}, not a tree")));
        }
        Tree::from_bytes(&data, *hash)
    }

    pub async fn read_tag(&self, hash: &ObjectHash) -> Result<Tag, GitError> {
        let (kind, data) = self
            .get(hash)
            .await?
            .ok_or_else(|| GitError::ObjectNotFound(hash.to_hex()))?;
        if kind != ObjectType::Tag {
            return Err(GitError::Corruption(format!("{hash} is a {kind}, not a tag")));
        }
        Tag::from_bytes(&data, *hash)
    }

    /// Number of live tablets (exposed for the compaction trigger and
    /// tests).
    pub async fn live_tablet_count(&self) -> usize {
        self.state.read().await.live_tablets.lock().unwrap().len()
    }
}

fn wal_row_to_tablet_row(row: schema::wal::Model) -> Result<TabletRow, GitError> {
    Ok(TabletRow {
        hash: ObjectHash::from_str(&row.hash)?,
        kind: ObjectType::from_str_kind(&row.kind)?,
        size: row.size as u64,
        mode: StorageMode::from_str_mode(&row.mode)?,
        payload: Bytes::from(row.data),
        path: row.path,
        created_at: row.created_at,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::storage::bucket::MemoryBucket;

    /// Fresh in-memory store for unit tests.
    pub(crate) async fn memory_store() -> Arc<ObjectStore> {
        memory_store_with(StoreConfig::default()).await
    }

    pub(crate) async fn memory_store_with(cfg: StoreConfig) -> Arc<ObjectStore> {
        let db = schema::connect("sqlite::memory:").await.unwrap();
        ObjectStore::open(cfg, MemoryBucket::new(), db).await.unwrap()
    }
}
