//! git-tablet is the core of a Git-compatible repository host: a
//! content-addressable object store with pack/delta codecs, a Smart-HTTP
//! transfer engine, and a durable append-only tablet storage engine with
//! write-ahead logging, Bloom-filtered reads, journaled compaction, and
//! mark-and-sweep garbage collection.

pub mod config;
pub mod delta;
pub mod errors;
pub mod hash;
pub mod internal;
pub mod protocol;
pub mod storage;
pub mod transport;
