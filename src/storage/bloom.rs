//! Segmented Bloom filter plus exact cache for existence checks.
//!
//! Each segment is a fixed bit vector with an item count; `k = 7` bit
//! positions come from double-hashing two independent 32-bit hashes of the
//! hex hash. A fresh segment is started when the active one crosses the
//! item threshold; once there are too many segments, all but the newest are
//! OR-compacted into one. The filter answers `absent`/`probable`; the exact
//! cache upgrades confirmed hashes to `definite`.

use std::hash::BuildHasher;

use lru_mem::LruCache;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};

use crate::{
    config::BloomConfig,
    errors::GitError,
    internal::object::types::ObjectType,
    storage::schema::{bloom_segment, exact},
};

const BLOOM_K: u32 = 7;

// Fixed seeds so the bit positions survive restarts.
const SEED_A: (u64, u64, u64, u64) = (0x9e37_79b9, 0x7f4a_7c15, 0xf39c_0d1f, 0x85eb_ca6b);
const SEED_B: (u64, u64, u64, u64) = (0xc2b2_ae35, 0x27d4_eb2f, 0x1656_67b1, 0x9e37_79b1);

fn hash_pair(key: &str) -> (u32, u32) {
    let h1 = ahash::RandomState::with_seeds(SEED_A.0, SEED_A.1, SEED_A.2, SEED_A.3).hash_one(key);
    let h2 = ahash::RandomState::with_seeds(SEED_B.0, SEED_B.1, SEED_B.2, SEED_B.3).hash_one(key);
    (h1 as u32, h2 as u32)
}

/// Answer of an existence probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    /// Confirmed by the exact cache.
    Definite,
    /// Some Bloom segment matched; a scan must confirm.
    Probable,
    /// No segment matched: the object is not in the store.
    Absent,
}

/// One Bloom segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomSegment {
    pub seq: i32,
    pub bits: Vec<u8>,
    pub items: i64,
}

impl BloomSegment {
    fn new(seq: i32, bit_count: usize) -> Self {
        Self {
            seq,
            bits: vec![0u8; bit_count.div_ceil(8)],
            items: 0,
        }
    }

    fn bit_count(&self) -> usize {
        self.bits.len() * 8
    }

    fn set(&mut self, idx: usize) {
        self.bits[idx / 8] |= 1 << (idx % 8);
    }

    fn test(&self, idx: usize) -> bool {
        self.bits[idx / 8] & (1 << (idx % 8)) != 0
    }

    fn insert(&mut self, key: &str) {
        let (h1, h2) = hash_pair(key);
        let m = self.bit_count() as u32;
        for i in 0..BLOOM_K {
            self.set((h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize);
        }
        self.items += 1;
    }

    fn contains(&self, key: &str) -> bool {
        let (h1, h2) = hash_pair(key);
        let m = self.bit_count() as u32;
        (0..BLOOM_K).all(|i| self.test((h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize))
    }
}

/// Persistence operations produced by a mutation, applied to the
/// bloom_segments table by the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum SegmentOp {
    Upsert(BloomSegment),
    Delete(i32),
}

/// The in-memory segmented filter, mirrored by the bloom_segments table.
pub struct SegmentedBloom {
    /// Oldest first; the last segment is the active one.
    segments: Vec<BloomSegment>,
    cfg: BloomConfig,
    next_seq: i32,
}

impl SegmentedBloom {
    pub fn new(cfg: BloomConfig) -> Self {
        Self {
            segments: Vec::new(),
            cfg,
            next_seq: 0,
        }
    }

    pub fn from_segments(cfg: BloomConfig, mut segments: Vec<BloomSegment>) -> Self {
        segments.sort_by_key(|s| s.seq);
        let next_seq = segments.last().map(|s| s.seq + 1).unwrap_or(0);
        Self {
            segments,
            cfg,
            next_seq,
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Insert a key, rolling and compacting segments per policy. Returns
    /// the table operations needed to persist the change.
    pub fn insert(&mut self, key: &str) -> Vec<SegmentOp> {
        let mut ops = Vec::new();

        let need_new = match self.segments.last() {
            None => true,
            Some(active) => active.items as usize >= self.cfg.segment_item_threshold,
        };
        if need_new {
            self.segments
                .push(BloomSegment::new(self.next_seq, self.cfg.segment_bits));
            self.next_seq += 1;
        }

        let active = self.segments.last_mut().expect("active segment exists");
        active.insert(key);
        ops.push(SegmentOp::Upsert(active.clone()));

        if self.segments.len() > self.cfg.max_segments {
            ops.extend(self.compact_older());
        }
        ops
    }

    /// OR-compact all but the newest segment into one; item count of the
    /// result is the sum.
    fn compact_older(&mut self) -> Vec<SegmentOp> {
        let newest = self.segments.pop().expect("at least one segment");
        let mut merged = self.segments[0].clone();
        let mut ops = Vec::new();
        for seg in &self.segments[1..] {
            for (dst, src) in merged.bits.iter_mut().zip(&seg.bits) {
                *dst |= src;
            }
            merged.items += seg.items;
            ops.push(SegmentOp::Delete(seg.seq));
        }
        ops.push(SegmentOp::Upsert(merged.clone()));
        self.segments = vec![merged, newest];
        ops
    }

    pub fn contains(&self, key: &str) -> bool {
        self.segments.iter().any(|s| s.contains(key))
    }
}

/// Exact cache entry value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExactEntry {
    pub kind: ObjectType,
    pub size: u64,
    pub created_at: i64,
}

impl lru_mem::HeapSize for ExactEntry {
    fn heap_size(&self) -> usize {
        0
    }
}

/// Segmented Bloom + exact LRU, with SQL mirrors of both.
pub struct ExistenceCache {
    bloom: SegmentedBloom,
    exact: LruCache<String, ExactEntry>,
}

impl ExistenceCache {
    pub fn new(cfg: BloomConfig) -> Self {
        let exact = LruCache::new(cfg.exact_cache_bytes);
        Self {
            bloom: SegmentedBloom::new(cfg),
            exact,
        }
    }

    /// Rebuild from the persisted segments and the exact table.
    pub async fn load(cfg: BloomConfig, db: &DatabaseConnection) -> Result<Self, GitError> {
        let segments = bloom_segment::Entity::find()
            .order_by_asc(bloom_segment::Column::Seq)
            .all(db)
            .await?
            .into_iter()
            .map(|m| BloomSegment {
                seq: m.seq,
                bits: m.bits,
                items: m.items,
            })
            .collect();
        let bloom = SegmentedBloom::from_segments(cfg.clone(), segments);

        let mut exact = LruCache::new(cfg.exact_cache_bytes);
        let rows = exact::Entity::find()
            .order_by_desc(exact::Column::TouchedAt)
            .limit(10_000)
            .all(db)
            .await?;
        // Insert oldest first so the most recently touched end up most
        // recently used.
        for row in rows.into_iter().rev() {
            let kind = ObjectType::from_str_kind(&row.kind)
                .map_err(|_| GitError::Corruption(format!("exact cache kind `{}`", row.kind)))?;
            let _ = exact.insert(
                row.hash,
                ExactEntry {
                    kind,
                    size: row.size as u64,
                    created_at: row.created_at,
                },
            );
        }
        Ok(Self { bloom, exact })
    }

    /// Probe without touching storage.
    pub fn check(&mut self, hex: &str) -> Presence {
        if self.exact.get(hex).is_some() {
            return Presence::Definite;
        }
        if self.bloom.contains(hex) {
            Presence::Probable
        } else {
            Presence::Absent
        }
    }

    /// Record a newly stored object: Bloom bits plus exact entry, both
    /// persisted.
    pub async fn note_present(
        &mut self,
        db: &DatabaseConnection,
        hex: &str,
        kind: ObjectType,
        size: u64,
        created_at: i64,
    ) -> Result<(), GitError> {
        let ops = self.bloom.insert(hex);
        persist_segment_ops(db, ops).await?;
        self.promote(db, hex, kind, size, created_at).await
    }

    /// Upgrade a confirmed `probable` to `definite`.
    pub async fn promote(
        &mut self,
        db: &DatabaseConnection,
        hex: &str,
        kind: ObjectType,
        size: u64,
        created_at: i64,
    ) -> Result<(), GitError> {
        let touched = chrono::Utc::now().timestamp_millis();
        let _ = self.exact.insert(
            hex.to_string(),
            ExactEntry {
                kind,
                size,
                created_at,
            },
        );
        let model = exact::ActiveModel {
            hash: Set(hex.to_string()),
            kind: Set(kind.as_str().to_string()),
            size: Set(size as i64),
            touched_at: Set(touched),
            created_at: Set(created_at),
        };
        exact::Entity::insert(model)
            .on_conflict(
                sea_orm::sea_query::OnConflict::column(exact::Column::Hash)
                    .update_columns([exact::Column::TouchedAt, exact::Column::Kind, exact::Column::Size])
                    .to_owned(),
            )
            .exec(db)
            .await?;
        Ok(())
    }

    /// Drop an exact entry (GC deletion). Bloom bits cannot be unset; the
    /// filter only promises no false negatives for present objects.
    pub async fn forget(&mut self, db: &DatabaseConnection, hex: &str) -> Result<(), GitError> {
        self.exact.remove(hex);
        exact::Entity::delete_many()
            .filter(exact::Column::Hash.eq(hex))
            .exec(db)
            .await?;
        Ok(())
    }
}

async fn persist_segment_ops(db: &DatabaseConnection, ops: Vec<SegmentOp>) -> Result<(), GitError> {
    for op in ops {
        match op {
            SegmentOp::Upsert(seg) => {
                let model = bloom_segment::ActiveModel {
                    seq: Set(seg.seq),
                    bits: Set(seg.bits),
                    items: Set(seg.items),
                };
                bloom_segment::Entity::insert(model)
                    .on_conflict(
                        sea_orm::sea_query::OnConflict::column(bloom_segment::Column::Seq)
                            .update_columns([bloom_segment::Column::Bits, bloom_segment::Column::Items])
                            .to_owned(),
                    )
                    .exec(db)
                    .await?;
            }
            SegmentOp::Delete(seq) => {
                bloom_segment::Entity::delete_many()
                    .filter(bloom_segment::Column::Seq.eq(seq))
                    .exec(db)
                    .await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema;

    fn small_cfg() -> BloomConfig {
        BloomConfig {
            segment_bits: 1 << 12,
            segment_item_threshold: 8,
            max_segments: 3,
            exact_cache_bytes: 64 * 1024,
            verify: false,
        }
    }

    /// No false negatives: every inserted key probes present.
    #[test]
    fn no_false_negatives() {
        let mut bloom = SegmentedBloom::new(small_cfg());
        let keys: Vec<String> = (0..100).map(|i| format!("{i:040x}")).collect();
        for key in &keys {
            bloom.insert(key);
        }
        for key in &keys {
            assert!(bloom.contains(key), "false negative for {key}");
        }
    }

    /// Segment rollover at the item threshold, compaction at the cap.
    #[test]
    fn rollover_and_compaction() {
        let mut bloom = SegmentedBloom::new(small_cfg());
        // 8 per segment, cap 3: after 25 inserts we exceed the cap once.
        for i in 0..25 {
            bloom.insert(&format!("{i:040x}"));
        }
        assert!(bloom.segment_count() <= 3);
        // compaction keeps everything probe-able
        for i in 0..25 {
            assert!(bloom.contains(&format!("{i:040x}")));
        }
        let total: i64 = bloom.segments.iter().map(|s| s.items).sum();
        assert_eq!(total, 25);
    }

    /// Exact cache answers definite; bloom-only answers probable.
    #[tokio::test]
    async fn presence_ladder() {
        let db = schema::connect("sqlite::memory:").await.unwrap();
        schema::init_schema(&db).await.unwrap();
        let mut cache = ExistenceCache::new(small_cfg());

        let hex = "ce013625030ba8dba906f756967f9e9ca394464a";
        assert_eq!(cache.check(hex), Presence::Absent);

        cache
            .note_present(&db, hex, ObjectType::Blob, 6, 1000)
            .await
            .unwrap();
        assert_eq!(cache.check(hex), Presence::Definite);

        // a cold cache rebuilt from SQL still knows the object
        let mut rebuilt = ExistenceCache::load(small_cfg(), &db).await.unwrap();
        assert_eq!(rebuilt.check(hex), Presence::Definite);
    }

    /// After forgetting, the exact cache no longer confirms, but the Bloom
    /// filter may still say probable (never absent for live objects).
    #[tokio::test]
    async fn forget_downgrades() {
        let db = schema::connect("sqlite::memory:").await.unwrap();
        schema::init_schema(&db).await.unwrap();
        let mut cache = ExistenceCache::new(small_cfg());
        let hex = "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391";
        cache
            .note_present(&db, hex, ObjectType::Blob, 0, 0)
            .await
            .unwrap();
        cache.forget(&db, hex).await.unwrap();
        assert_ne!(cache.check(hex), Presence::Definite);
    }
}
