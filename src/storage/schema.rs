//! Per-repository SQL tables: write-ahead log, compaction journal, Bloom
//! segments, exact hash cache, tombstones, live tablet set, refs, and the
//! chunk-compactor index. All mutations are serialized by the single
//! SQLite connection that backs each repository.

use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Schema,
    sea_query::TableCreateStatement,
};

use crate::errors::GitError;

/// WAL rows: one per buffered object, inserted transactionally on every
/// `put` and deleted only after the containing tablet is durably written.
pub mod wal {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "wal_objects")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub hash: String,
        pub kind: String,
        pub size: i64,
        pub mode: String,
        pub data: Vec<u8>,
        pub path: Option<String>,
        pub created_at: i64,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}
    impl ActiveModelBehavior for ActiveModel {}
}

/// Compaction journal: one row per compaction, surviving crashes.
pub mod journal {
    use sea_orm::entity::prelude::*;

    pub const STATUS_IN_PROGRESS: &str = "in_progress";
    pub const STATUS_WRITTEN: &str = "written";

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "compaction_journal")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        /// JSON array of source tablet keys.
        pub sources: String,
        pub target: String,
        pub status: String,
        pub created_at: i64,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}
    impl ActiveModelBehavior for ActiveModel {}
}

/// Persisted Bloom filter segments, reconstructed into memory on restart.
pub mod bloom_segment {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "bloom_segments")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub seq: i32,
        pub bits: Vec<u8>,
        pub items: i64,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}
    impl ActiveModelBehavior for ActiveModel {}
}

/// Exact existence cache rows: hash → kind/size plus timestamps.
pub mod exact {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "exact_cache")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub hash: String,
        pub kind: String,
        pub size: i64,
        pub touched_at: i64,
        pub created_at: i64,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}
    impl ActiveModelBehavior for ActiveModel {}
}

/// Tombstones honored at the next compaction.
pub mod tombstone {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "tombstones")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub hash: String,
        pub created_at: i64,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}
    impl ActiveModelBehavior for ActiveModel {}
}

/// The live tablet set. A key present here exists on object storage.
pub mod tablet {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "live_tablets")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub key: String,
        pub row_count: i64,
        pub bytes: i64,
        pub created_at: i64,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}
    impl ActiveModelBehavior for ActiveModel {}
}

/// Tablet keys retired by the most recent compaction; a flush that would
/// re-create one of these keys is suppressed until a distinct batch runs.
pub mod retired_tablet {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "retired_tablets")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub key: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}
    impl ActiveModelBehavior for ActiveModel {}
}

/// Refs: direct rows hold a hex hash, symbolic rows hold `ref: <name>`.
pub mod refs {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "refs")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub name: String,
        pub target: String,
        pub symbolic: bool,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}
    impl ActiveModelBehavior for ActiveModel {}
}

/// Packed-refs snapshot: one JSON blob for cheap bulk reads.
pub mod packed_refs {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "packed_refs")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: i32,
        pub payload: String,
        pub packed_at: i64,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}
    impl ActiveModelBehavior for ActiveModel {}
}

/// Chunk-compactor index: original object → super-chunk byte range.
pub mod chunk_index {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "chunk_index")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub hash: String,
        pub chunk_id: String,
        pub offset: i64,
        pub length: i64,
        pub kind: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}
    impl ActiveModelBehavior for ActiveModel {}
}

/// Super-chunk metadata.
pub mod super_chunk {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "super_chunks")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        pub bytes: i64,
        pub row_count: i64,
        pub created_at: i64,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}
    impl ActiveModelBehavior for ActiveModel {}
}

/// Connect to the per-repository database. One connection: SQLite
/// serializes all mutations, which is the concurrency model the WAL and
/// cache tables rely on.
pub async fn connect(url: &str) -> Result<DatabaseConnection, GitError> {
    let mut opts = ConnectOptions::new(url.to_string());
    opts.max_connections(1).sqlx_logging(false);
    Ok(Database::connect(opts).await?)
}

/// Create every table if missing.
pub async fn init_schema(db: &DatabaseConnection) -> Result<(), GitError> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    let mut stmts: Vec<TableCreateStatement> = vec![
        schema.create_table_from_entity(wal::Entity),
        schema.create_table_from_entity(journal::Entity),
        schema.create_table_from_entity(bloom_segment::Entity),
        schema.create_table_from_entity(exact::Entity),
        schema.create_table_from_entity(tombstone::Entity),
        schema.create_table_from_entity(tablet::Entity),
        schema.create_table_from_entity(retired_tablet::Entity),
        schema.create_table_from_entity(refs::Entity),
        schema.create_table_from_entity(packed_refs::Entity),
        schema.create_table_from_entity(chunk_index::Entity),
        schema.create_table_from_entity(super_chunk::Entity),
    ];
    for stmt in &mut stmts {
        stmt.if_not_exists();
        db.execute(backend.build(&*stmt)).await?;
    }
    Ok(())
}
