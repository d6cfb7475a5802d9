//! Client side of the wire protocol: Smart-HTTP clone, incremental fetch,
//! send-pack push, and bidirectional mirror orchestration.

pub mod client;
pub mod mirror;

pub use client::{Advertisement, FetchStats, HttpRemote, PushReport, RemoteRef};
pub use mirror::{ConflictPolicy, MirrorMode, MirrorReport, mirror};
