//! # KVSSD Core
//!
//! Shared types for the KVSSD flash simulator: the error type, the value
//! types used to address pages and describe key ranges, and the format
//! versions stamped on persisted records.
//!
//! This crate is an internal implementation detail; depend on `kvssd`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod format_version;
pub mod types;

pub use error::{Error, Result};
pub use types::{entry_footprint, BlockId, KeyRange, KvPair, PageAddress, TableId, Zone};
