//! The Smart-HTTP transfer engine: pkt-line framing, the protocol v1 state
//! machine, the axum surface with token auth, and the LFS batch API.

pub mod http;
pub mod lfs;
pub mod pkt;
pub mod smart;
pub mod types;
