//! Thin facade over the engine crates: re-exports the public surface of
//! `durlog-wal` so callers depend on one crate name.

pub use durlog_common::*;
pub use durlog_wal::*;
