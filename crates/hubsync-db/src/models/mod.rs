//! Database models for persistent storage.

mod compliance;

pub use compliance::*;
