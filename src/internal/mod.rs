//! Internal object model, pack codec, and zlib framing.

pub mod object;
pub mod pack;
pub mod zlib;
