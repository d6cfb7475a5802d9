//! Cross-component storage scenarios: durability across restart, the
//! compaction life cycle, and garbage collection with the grace period,
//! all through the public API.

use std::sync::Arc;

use bytes::Bytes;

use git_tablet::{
    config::StoreConfig,
    hash::ObjectHash,
    internal::object::{
        ObjectTrait,
        blob::Blob,
        commit::Commit,
        signature::{Signature, SignatureRole},
        tree::{Tree, TreeEntry, TreeEntryMode},
        types::ObjectType,
    },
    storage::{ObjectStore, bucket::MemoryBucket, compaction, gc, schema},
};

async fn memory_store() -> Arc<ObjectStore> {
    let db = schema::connect("sqlite::memory:").await.unwrap();
    ObjectStore::open(StoreConfig::default(), MemoryBucket::new(), db)
        .await
        .unwrap()
}

async fn put_and_flush(store: &ObjectStore, content: &[u8]) -> ObjectHash {
    let out = store
        .put(ObjectType::Blob, Bytes::copy_from_slice(content))
        .await
        .unwrap();
    store.flush().await.unwrap();
    out.hash
}

/// The two canonical blob vectors: the empty blob and "hello\n".
#[tokio::test]
async fn known_hash_vectors() {
    let store = memory_store().await;

    let empty = store.put(ObjectType::Blob, Bytes::new()).await.unwrap();
    assert_eq!(
        empty.hash.to_string(),
        "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"
    );
    let (kind, data) = store.get(&empty.hash).await.unwrap().unwrap();
    assert_eq!(kind, ObjectType::Blob);
    assert!(data.is_empty());

    let hello = store
        .put(ObjectType::Blob, Bytes::from_static(b"hello\n"))
        .await
        .unwrap();
    assert_eq!(
        hello.hash.to_string(),
        "ce013625030ba8dba906f756967f9e9ca394464a"
    );
    assert!(store.has(&hello.hash).await.unwrap());
    assert!(!store.has(&ObjectHash::zero()).await.unwrap());
}

/// Compaction squashes three tablets into one, preserves every object, and
/// a re-run returns early; everything still reads back after a reopen.
#[tokio::test]
async fn compaction_lifecycle_and_reopen() {
    let db = schema::connect("sqlite::memory:").await.unwrap();
    let bucket = MemoryBucket::new();
    let store = ObjectStore::open(StoreConfig::default(), bucket.clone(), db.clone())
        .await
        .unwrap();

    let mut hashes = Vec::new();
    for content in [&b"tablet one"[..], b"tablet two", b"tablet three"] {
        hashes.push(put_and_flush(&store, content).await);
    }
    assert_eq!(store.live_tablet_count().await, 3);

    let stats = compaction::compact(&store).await.unwrap();
    assert_eq!(stats.merged, 3);
    assert_eq!(store.live_tablet_count().await, 1);
    for h in &hashes {
        assert!(store.get(h).await.unwrap().is_some());
    }
    assert!(compaction::compact(&store).await.unwrap().skipped);

    drop(store);
    let reopened = ObjectStore::open(StoreConfig::default(), bucket, db)
        .await
        .unwrap();
    assert_eq!(reopened.live_tablet_count().await, 1);
    for h in &hashes {
        assert!(reopened.get(h).await.unwrap().is_some());
    }
}

/// GC with grace: a young orphan survives, an aged one is swept exactly
/// once, and ref-reachable history is never touched.
#[tokio::test]
async fn gc_grace_lifecycle() {
    let store = memory_store().await;

    // Reachable history under a ref.
    let blob = Blob::from_content("kept\n");
    store
        .put(ObjectType::Blob, Bytes::from(blob.data.clone()))
        .await
        .unwrap();
    let tree = Tree::from_entries(vec![TreeEntry::new(
        TreeEntryMode::Blob,
        blob.id,
        "kept.txt".to_string(),
    )])
    .unwrap();
    store
        .put(ObjectType::Tree, Bytes::from(tree.to_data().unwrap()))
        .await
        .unwrap();
    let commit = Commit::new(
        Signature::new(SignatureRole::Author, "t".into(), "t@e".into()),
        Signature::new(SignatureRole::Committer, "t".into(), "t@e".into()),
        tree.id,
        vec![],
        "\nkeep\n",
    );
    store
        .put(ObjectType::Commit, Bytes::from(commit.to_data().unwrap()))
        .await
        .unwrap();
    store
        .refs()
        .compare_and_swap("refs/heads/main", None, &commit.id)
        .await
        .unwrap();

    let orphan = store
        .put(ObjectType::Blob, Bytes::from_static(b"orphan\n"))
        .await
        .unwrap();

    // Within grace: skipped.
    let early = gc::run(
        &store,
        gc::GcOptions {
            dry_run: false,
            grace_period_ms: Some(60_000),
        },
    )
    .await
    .unwrap();
    assert_eq!(early.deleted, 0);
    assert_eq!(early.skipped_grace, 1);
    assert!(store.has(&orphan.hash).await.unwrap());

    // Past grace: swept.
    let swept = gc::run(
        &store,
        gc::GcOptions {
            dry_run: false,
            grace_period_ms: Some(-1),
        },
    )
    .await
    .unwrap();
    assert_eq!(swept.deleted, 1);
    assert!(!store.has(&orphan.hash).await.unwrap());
    assert!(store.has(&commit.id).await.unwrap());
    assert!(store.has(&blob.id).await.unwrap());

    // Idempotent: nothing more to sweep.
    let again = gc::run(
        &store,
        gc::GcOptions {
            dry_run: false,
            grace_period_ms: Some(-1),
        },
    )
    .await
    .unwrap();
    assert_eq!(again.deleted, 0);
}

/// A flush-compact-flush cycle keeps reads consistent while layout
/// changes underneath.
#[tokio::test]
async fn layout_changes_do_not_change_reads() {
    let store = memory_store().await;
    let a = put_and_flush(&store, b"alpha").await;
    let b = put_and_flush(&store, b"beta").await;
    compaction::compact(&store).await.unwrap();
    let c = put_and_flush(&store, b"gamma").await;

    for (h, expected) in [(a, &b"alpha"[..]), (b, b"beta"), (c, b"gamma")] {
        let (_, data) = store.get(&h).await.unwrap().unwrap();
        assert_eq!(&data[..], expected);
    }
    assert_eq!(store.live_tablet_count().await, 2);
}
