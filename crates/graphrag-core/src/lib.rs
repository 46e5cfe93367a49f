//! graphrag core library: incremental, git-aware indexing of Swift entities.
//!
//! A master store mirrors the primary branch; a feature store replays the
//! commits of the checked-out branch on top of its merge-base and overlays
//! uncommitted work as a synthetic snapshot.  The library is used by the
//! `graphrag-index` binary and, with the `python` feature, compiled as a
//! Python extension module (`_graphrag_core`) via PyO3.

pub mod config;
pub mod errors;
pub mod indexer;
pub mod models;
pub mod query;
pub mod repo;
pub mod store;

#[cfg(feature = "python")]
mod python;
